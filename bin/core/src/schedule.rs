use std::{process::Stdio, sync::Arc};

use keywarden_client::entities::{
  I64,
  config::{CoreConfig, TimeoutUtil},
  keywarden_timestamp,
  server::{Server, SyncStatus},
  sync_request::SyncRequest,
};
use tokio::{io::AsyncReadExt, process::Command};

use crate::interfaces::{ServerDirectory, SyncRequestStore};

/// Hard wall clock bound on one sync subprocess, enforced by the
/// process-level timeout utility.
const SYNC_TIMEOUT_SECS: u64 = 60;

/// Delay before a failed sync is attempted again.
const RETRY_DELAY_MS: I64 = 30 * 60 * 1000;

/// Executes due synchronization requests as bounded subprocesses
/// and reschedules failed ones.
pub struct Scheduler {
  directory: Arc<dyn ServerDirectory>,
  requests: Arc<dyn SyncRequestStore>,
  config: CoreConfig,
}

impl Scheduler {
  pub fn new(
    directory: Arc<dyn ServerDirectory>,
    requests: Arc<dyn SyncRequestStore>,
    config: CoreConfig,
  ) -> Scheduler {
    Scheduler {
      directory,
      requests,
      config,
    }
  }

  /// Execute all requests due right now, sequentially. Every
  /// request is consumed exactly once, whatever its outcome.
  pub async fn run(&self) -> anyhow::Result<()> {
    let due =
      self.requests.list_due(keywarden_timestamp()).await?;
    info!("{} sync requests due", due.len());
    for request in due {
      self.execute(&request).await?;
      self.requests.delete(&request).await?;
    }
    Ok(())
  }

  async fn execute(
    &self,
    request: &SyncRequest,
  ) -> anyhow::Result<()> {
    let Some(server) = self
      .directory
      .get_server_by_id(&request.server_id)
      .await?
    else {
      // server was deleted after the request was queued
      warn!(
        "dropping sync request for unknown server {}",
        request.server_id
      );
      return Ok(());
    };

    let argv = sync_argv(
      &self.config,
      &server.hostname,
      request.account_name.as_deref(),
    );
    debug!("spawning sync subprocess: {argv:?}");
    let succeeded = run_subprocess(&argv).await;

    if !succeeded {
      warn!("sync of {} failed, rescheduling", server.hostname);
      self.report_failure(&server).await?;
    }
    Ok(())
  }

  /// Record the failure on the server and replace all of its
  /// pending requests with a single deferred retry.
  async fn report_failure(
    &self,
    server: &Server,
  ) -> anyhow::Result<()> {
    let mut updated = server.clone();
    updated.sync_status = SyncStatus::Failure;
    updated.sync_status_message =
      Some(String::from("Internal error during sync"));
    self.directory.update_server(&updated).await?;

    self
      .requests
      .delete_all_for_server(&server.id)
      .await?;
    self
      .requests
      .add(SyncRequest {
        server_id: server.id.clone(),
        execution_time: Some(
          keywarden_timestamp() + RETRY_DELAY_MS,
        ),
        ..Default::default()
      })
      .await
  }
}

/// Spawn the command and drain stdout / stderr concurrently until
/// both hit eof. Draining both at once avoids the deadlock where
/// the child blocks on a full pipe we are not reading.
async fn run_subprocess(argv: &[String]) -> bool {
  let mut child = match Command::new(&argv[0])
    .args(&argv[1..])
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
  {
    Ok(child) => child,
    Err(e) => {
      error!("failed to spawn {:?}: {e:#}", argv[0]);
      return false;
    }
  };

  let mut stdout = Vec::new();
  let mut stderr = Vec::new();
  if let (Some(mut out), Some(mut err)) =
    (child.stdout.take(), child.stderr.take())
  {
    let _ = tokio::join!(
      out.read_to_end(&mut stdout),
      err.read_to_end(&mut stderr)
    );
  }
  if !stderr.is_empty() {
    debug!(
      "sync subprocess stderr: {}",
      String::from_utf8_lossy(&stderr)
    );
  }

  match child.wait().await {
    Ok(status) => status.success(),
    Err(e) => {
      error!("failed to await sync subprocess: {e:#}");
      false
    }
  }
}

/// Argv of one sync subprocess, wrapped in the host's `timeout`
/// utility. The account name is only passed for account scoped
/// requests, a bare hostname means a whole-server resync.
fn sync_argv(
  config: &CoreConfig,
  hostname: &str,
  account_name: Option<&str>,
) -> Vec<String> {
  let mut argv = match config.timeout_util {
    TimeoutUtil::Gnu => vec![
      String::from("/usr/bin/timeout"),
      format!("{SYNC_TIMEOUT_SECS}s"),
    ],
    TimeoutUtil::BusyBox => vec![
      String::from("/usr/bin/timeout"),
      String::from("-t"),
      SYNC_TIMEOUT_SECS.to_string(),
    ],
  };
  argv.push(config.sync_command.clone());
  argv.push(hostname.to_string());
  if let Some(account_name) = account_name {
    argv.push(account_name.to_string());
  }
  argv
}

#[cfg(test)]
mod tests {
  use keywarden_client::entities::server::KeyManagement;

  use super::*;
  use crate::store::JsonStore;

  fn config_with_command(command: &str) -> CoreConfig {
    CoreConfig {
      sync_command: command.to_string(),
      ..Default::default()
    }
  }

  async fn store_with_server(id: &str) -> Arc<JsonStore> {
    let store = Arc::new(JsonStore::in_memory());
    store
      .upsert_server(Server {
        id: id.to_string(),
        hostname: "app01".to_string(),
        key_management: KeyManagement::Keys,
        ..Default::default()
      })
      .await
      .unwrap();
    store
  }

  #[test]
  fn argv_wraps_timeout_utility() {
    let config = config_with_command("scripts/sync");
    let argv = sync_argv(&config, "app01", None);
    assert_eq!(
      argv,
      vec!["/usr/bin/timeout", "60s", "scripts/sync", "app01"]
    );

    let argv = sync_argv(&config, "app01", Some("deploy"));
    assert_eq!(
      argv,
      vec![
        "/usr/bin/timeout",
        "60s",
        "scripts/sync",
        "app01",
        "deploy"
      ]
    );

    let busybox = CoreConfig {
      timeout_util: TimeoutUtil::BusyBox,
      ..config_with_command("scripts/sync")
    };
    let argv = sync_argv(&busybox, "app01", None);
    assert_eq!(
      argv,
      vec!["/usr/bin/timeout", "-t", "60", "scripts/sync", "app01"]
    );
  }

  #[tokio::test]
  async fn successful_sync_consumes_the_request() {
    let store = store_with_server("srv1").await;
    let scheduler = Scheduler::new(
      store.clone(),
      store.clone(),
      config_with_command("true"),
    );
    store
      .add(SyncRequest {
        server_id: "srv1".to_string(),
        ..Default::default()
      })
      .await
      .unwrap();

    scheduler.run().await.unwrap();

    let now = keywarden_timestamp();
    assert!(store.list_due(now).await.unwrap().is_empty());
    let server = store
      .get_server_by_id("srv1")
      .await
      .unwrap()
      .unwrap();
    // success reporting is the subprocess's job
    assert_eq!(server.sync_status, SyncStatus::NotSyncedYet);
  }

  #[tokio::test]
  async fn failed_sync_reports_and_reschedules() {
    let store = store_with_server("srv1").await;
    let scheduler = Scheduler::new(
      store.clone(),
      store.clone(),
      config_with_command("false"),
    );
    store
      .add(SyncRequest {
        server_id: "srv1".to_string(),
        ..Default::default()
      })
      .await
      .unwrap();

    let before = keywarden_timestamp();
    scheduler.run().await.unwrap();

    let server = store
      .get_server_by_id("srv1")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(server.sync_status, SyncStatus::Failure);
    assert_eq!(
      server.sync_status_message.as_deref(),
      Some("Internal error during sync")
    );

    // the original request is gone, a deferred retry replaces it
    assert!(
      store.list_due(keywarden_timestamp()).await.unwrap().is_empty()
    );
    let later = store
      .list_due(before + RETRY_DELAY_MS + 60_000)
      .await
      .unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].server_id, "srv1");
    assert!(later[0].execution_time.unwrap() >= before);
  }

  #[tokio::test]
  async fn request_for_unknown_server_is_dropped() {
    let store = Arc::new(JsonStore::in_memory());
    let scheduler = Scheduler::new(
      store.clone(),
      store.clone(),
      config_with_command("true"),
    );
    store
      .add(SyncRequest {
        server_id: "gone".to_string(),
        ..Default::default()
      })
      .await
      .unwrap();

    scheduler.run().await.unwrap();
    assert!(
      store
        .list_due(keywarden_timestamp())
        .await
        .unwrap()
        .is_empty()
    );
  }
}
