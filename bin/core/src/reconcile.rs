use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
  time::Duration,
};

use chrono::Utc;
use keywarden_client::entities::{
  config::CoreConfig,
  external_key::{
    ExternalKey, ExternalKeyOccurrence, ExternalKeyStatus,
  },
  optional_string,
  server::Server,
};
use transport::{ConnectArgs, Connection};

use crate::{
  interfaces::{KeyRegistry, Notifier, ServerDirectory},
  scan::{self, KeyEntry},
  status,
};

const HOSTNAMES_FILE: &str = "/var/local/keys-sync/.hostnames";

/// Drives one supervision pass: scans every managed server and
/// folds the findings into the key registry.
pub struct Reconciler {
  registry: Arc<dyn KeyRegistry>,
  directory: Arc<dyn ServerDirectory>,
  notifier: Arc<dyn Notifier>,
  config: CoreConfig,
}

/// All sightings of one keydata across the fleet, before it is
/// matched against the registry.
struct FoundKey {
  key_type: String,
  occurrences: Vec<ExternalKeyOccurrence>,
}

impl Reconciler {
  pub fn new(
    registry: Arc<dyn KeyRegistry>,
    directory: Arc<dyn ServerDirectory>,
    notifier: Arc<dyn Notifier>,
    config: CoreConfig,
  ) -> Reconciler {
    Reconciler {
      registry,
      directory,
      notifier,
      config,
    }
  }

  /// Run one pass across all managed servers. Per-server failures
  /// are folded into that server's supervision error, they never
  /// abort the pass.
  pub async fn run(&self) -> anyhow::Result<()> {
    let keys = self.registry.list_all_keys().await?;
    let denied = keys
      .iter()
      .filter(|key| key.status == ExternalKeyStatus::Denied)
      .map(|key| key.keydata.clone())
      .collect::<HashSet<_>>();

    let servers = self.directory.list_managed_servers().await?;
    info!("supervising {} managed servers", servers.len());

    let mut found: HashMap<String, FoundKey> = HashMap::new();
    let mut reachable: HashSet<String> = HashSet::new();

    for server in &servers {
      let start = Utc::now();
      let mut errors = Vec::new();
      let entries = self
        .supervise_server(server, &servers, &denied, &mut errors)
        .await;
      if let Some(entries) = entries {
        reachable.insert(server.id.clone());
        for entry in entries {
          record_sighting(&mut found, &server.id, entry);
        }
      }

      let error = if errors.is_empty() {
        None
      } else {
        Some(format!(
          "{}: {}",
          start.format("%Y-%m-%d %H:%M:%S"),
          errors.join("\n")
        ))
      };
      if let Err(e) = self.persist_server_error(server, error).await
      {
        error!(
          "failed to persist supervision result for {}: {e:#}",
          server.hostname
        );
      }
    }

    self.reconcile_registry(keys, found, &reachable).await
  }

  /// Scan one server. Returns its surviving key entries, or None
  /// when the server could not be reached or its scan had to be
  /// aborted. Diagnostics accumulate in `errors`.
  async fn supervise_server(
    &self,
    server: &Server,
    all_servers: &[Server],
    denied: &HashSet<String>,
    errors: &mut Vec<String>,
  ) -> Option<Vec<KeyEntry>> {
    if !Server::hostname_valid(&server.hostname) {
      errors.push(format!(
        "Invalid hostname {:?}, scan skipped",
        server.hostname
      ));
      return None;
    }

    let connection = match self.connect(server).await {
      Ok(connection) => connection,
      Err(e) => {
        warn!("could not reach {}: {e:#}", server.hostname);
        errors.push(format!("Connection failed: {e:#}"));
        return None;
      }
    };

    if connection.host_key_learned() {
      let mut updated = server.clone();
      updated.host_key = connection.host_key().to_string();
      if let Err(e) = self.directory.update_server(&updated).await {
        errors
          .push(format!("Failed to store learned host key: {e:#}"));
      }
    }

    if self.config.host_key_collision_protection {
      if let Some(other) = all_servers.iter().find(|other| {
        other.id != server.id
          && !other.host_key.is_empty()
          && other.host_key == connection.host_key()
      }) {
        errors.push(format!(
          "Host key collision with server {}, scan aborted",
          other.hostname
        ));
        return None;
      }
    }

    if let Err(note) =
      self.verify_hostname(server, &connection).await
    {
      errors.push(note);
      return None;
    }

    let outcome = scan::scan(&connection, denied).await;
    errors.extend(outcome.errors);

    self
      .report_status(server, &connection, errors)
      .await;

    Some(outcome.entries)
  }

  /// Try each configured login user in order. Only an outright
  /// authentication rejection moves on to the next user, any other
  /// failure is final.
  async fn connect(
    &self,
    server: &Server,
  ) -> Result<Connection, transport::Error> {
    let chain = server.parse_jumphosts();
    let mut last_error = None;
    for username in &self.config.login_users {
      match transport::connect(ConnectArgs {
        host: &server.hostname,
        port: server.port,
        chain: &chain,
        username,
        expected_host_key: &server.host_key,
        identity_file: &self.config.identity_file,
        connect_timeout: Duration::from_secs(
          self.config.connect_timeout,
        ),
      })
      .await
      {
        Ok(connection) => return Ok(connection),
        Err(e) if e.is_auth_failure() => {
          debug!(
            "login as {username} rejected by {}",
            server.hostname
          );
          last_error = Some(e);
        }
        Err(e) => return Err(e),
      }
    }
    Err(last_error.unwrap_or(transport::Error::NoResponse {
      host: server.hostname.clone(),
      port: server.port,
    }))
  }

  /// Check that the machine we reached is the machine we meant to
  /// reach. Level 0 skips the check, level 1 asks the host for its
  /// fqdn, levels 2 and 3 prefer an explicit allowlist file.
  async fn verify_hostname(
    &self,
    server: &Server,
    connection: &Connection,
  ) -> Result<(), String> {
    if self.config.hostname_verification == 0 {
      return Ok(());
    }
    let chain = server.parse_jumphosts();
    let expected =
      chain.host_alias.as_deref().unwrap_or(&server.hostname);

    if self.config.hostname_verification >= 2 {
      match connection.read_lines(HOSTNAMES_FILE).await {
        Ok(names) => {
          return if names.iter().any(|name| name == expected) {
            Ok(())
          } else {
            Err(format!(
              "Hostname verification failed: {expected} not \
               listed in {HOSTNAMES_FILE}"
            ))
          };
        }
        Err(_) if self.config.hostname_verification == 3 => {
          return Err(format!(
            "Hostname verification failed: {HOSTNAMES_FILE} \
             could not be read"
          ));
        }
        // level 2 falls back to asking the host
        Err(_) => {}
      }
    }

    match connection.exec("/bin/hostname -f").await {
      Ok(output) if output.trim() == expected => Ok(()),
      Ok(output) => Err(format!(
        "Hostname verification failed: expected {expected}, \
         got {}",
        output.trim()
      )),
      Err(e) => Err(format!(
        "Hostname verification failed: {e:#}"
      )),
    }
  }

  /// Store the accumulated error text, but only when it changed,
  /// repeating identical text every pass would just be noise.
  async fn persist_server_error(
    &self,
    server: &Server,
    error: Option<String>,
  ) -> anyhow::Result<()> {
    if server.key_supervision_error == error {
      return Ok(());
    }
    let current = self
      .directory
      .get_server_by_id(&server.id)
      .await?
      .unwrap_or_else(|| server.clone());
    let mut updated = current;
    updated.key_supervision_error = error;
    self.directory.update_server(&updated).await
  }

  /// Write the monitoring status artifact onto the server while the
  /// connection is still open. Failures are folded into the error
  /// notes, monitoring must never break supervision.
  async fn report_status(
    &self,
    server: &Server,
    connection: &Connection,
    errors: &mut Vec<String>,
  ) {
    let error = optional_string(errors.join("\n"));
    if let Err(note) = status::write_status_file(
      connection,
      server,
      self.registry.as_ref(),
      error.as_deref(),
      &self.config,
    )
    .await
    {
      errors.push(note);
    }
  }

  /// Fold the fleet-wide findings into the registry. Occurrences
  /// on servers that did not respond this pass are carried over
  /// untouched, an unreachable server must never look like a server
  /// without keys.
  async fn reconcile_registry(
    &self,
    keys: Vec<ExternalKey>,
    mut found: HashMap<String, FoundKey>,
    reachable: &HashSet<String>,
  ) -> anyhow::Result<()> {
    for key in keys {
      let fresh = found.remove(&key.keydata);
      let mut occurrences = fresh
        .map(|fresh| fresh.occurrences)
        .unwrap_or_default();
      occurrences.extend(
        key
          .occurrence
          .iter()
          .filter(|occurrence| {
            !reachable.contains(&occurrence.server)
          })
          .cloned(),
      );

      if occurrences.is_empty() {
        if key.status == ExternalKeyStatus::New {
          // an admin may have allowed or denied the key while this
          // pass was running, check again right before deleting
          let current = self.registry.get_key(&key.id).await?;
          match current {
            Some(current)
              if current.status == ExternalKeyStatus::New =>
            {
              info!(
                "external key {} disappeared, dropping it",
                key.id
              );
              self.registry.delete_key(&key).await?;
            }
            _ => {}
          }
          continue;
        }
        // allowed / denied keys are decision memory, clear the
        // occurrences but keep the record
        self.registry.update_occurrences(&key, Vec::new()).await?;
        continue;
      }

      self.registry.update_occurrences(&key, occurrences).await?;
    }

    // everything left in the map was never seen before
    for (keydata, fresh) in found {
      info!("new external key appeared: {keydata}");
      let key = self
        .registry
        .insert_key(&fresh.key_type, &keydata, fresh.occurrences)
        .await?;
      self
        .notifier
        .notify_new_key_appeared(&key, &key.occurrence)
        .await;
    }
    Ok(())
  }
}

fn record_sighting(
  found: &mut HashMap<String, FoundKey>,
  server_id: &str,
  entry: KeyEntry,
) {
  let occurrence = ExternalKeyOccurrence {
    server: server_id.to_string(),
    account_name: entry.account_name,
    comment: entry.comment,
    ..Default::default()
  };
  let fresh =
    found.entry(entry.keydata).or_insert_with(|| FoundKey {
      key_type: entry.key_type,
      occurrences: Vec::new(),
    });
  // the same key may appear for several accounts of one server,
  // but identical sightings collapse
  if !fresh
    .occurrences
    .iter()
    .any(|existing| existing.same_sighting(&occurrence))
  {
    fresh.occurrences.push(occurrence);
  }
}

#[cfg(test)]
mod tests {
  use tokio::sync::Mutex;

  use super::*;
  use crate::store::JsonStore;

  struct RecordingNotifier {
    notified: Mutex<Vec<String>>,
  }

  #[async_trait::async_trait]
  impl Notifier for RecordingNotifier {
    async fn notify_new_key_appeared(
      &self,
      key: &ExternalKey,
      _occurrences: &[ExternalKeyOccurrence],
    ) {
      self.notified.lock().await.push(key.keydata.clone());
    }
  }

  fn entry(
    account: &str,
    keydata: &str,
    comment: &str,
  ) -> KeyEntry {
    KeyEntry {
      account_name: account.to_string(),
      key_type: "ssh-rsa".to_string(),
      keydata: keydata.to_string(),
      comment: comment.to_string(),
    }
  }

  fn harness() -> (
    Arc<JsonStore>,
    Arc<RecordingNotifier>,
    Reconciler,
  ) {
    let store = Arc::new(JsonStore::in_memory());
    let notifier = Arc::new(RecordingNotifier {
      notified: Mutex::new(Vec::new()),
    });
    let reconciler = Reconciler::new(
      store.clone(),
      store.clone(),
      notifier.clone(),
      CoreConfig::default(),
    );
    (store, notifier, reconciler)
  }

  fn found_from(
    entries: Vec<(&str, KeyEntry)>,
  ) -> HashMap<String, FoundKey> {
    let mut found = HashMap::new();
    for (server, entry) in entries {
      record_sighting(&mut found, server, entry);
    }
    found
  }

  #[tokio::test]
  async fn new_keys_are_inserted_and_notified() {
    let (store, notifier, reconciler) = harness();
    let found = found_from(vec![(
      "srv1",
      entry("root", "AAAAnew", "alice@laptop"),
    )]);
    let reachable = HashSet::from(["srv1".to_string()]);
    reconciler
      .reconcile_registry(Vec::new(), found, &reachable)
      .await
      .unwrap();

    let keys = store.list_all_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].status, ExternalKeyStatus::New);
    assert_eq!(keys[0].occurrence.len(), 1);
    assert_eq!(
      *notifier.notified.lock().await,
      vec!["AAAAnew".to_string()]
    );
  }

  #[tokio::test]
  async fn second_identical_pass_changes_nothing() {
    let (store, notifier, reconciler) = harness();
    let reachable = HashSet::from(["srv1".to_string()]);
    let pass = || {
      found_from(vec![(
        "srv1",
        entry("root", "AAAAsame", "bob@desk"),
      )])
    };
    reconciler
      .reconcile_registry(Vec::new(), pass(), &reachable)
      .await
      .unwrap();
    let keys = store.list_all_keys().await.unwrap();
    let occurrence_id = keys[0].occurrence[0].id.clone();

    reconciler
      .reconcile_registry(keys, pass(), &reachable)
      .await
      .unwrap();
    let keys = store.list_all_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].occurrence.len(), 1);
    assert_eq!(keys[0].occurrence[0].id, occurrence_id);
    assert_eq!(notifier.notified.lock().await.len(), 1);
  }

  #[tokio::test]
  async fn vanished_new_key_is_deleted() {
    let (store, _notifier, reconciler) = harness();
    let key = store
      .insert_key("ssh-rsa", "AAAAgone", Vec::new())
      .await
      .unwrap();
    reconciler
      .reconcile_registry(
        vec![key.clone()],
        HashMap::new(),
        &HashSet::from(["srv1".to_string()]),
      )
      .await
      .unwrap();
    assert!(store.get_key(&key.id).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn vanished_allowed_key_is_kept_without_occurrences() {
    let (store, _notifier, reconciler) = harness();
    let key = store
      .insert_key(
        "ssh-rsa",
        "AAAAkept",
        vec![ExternalKeyOccurrence {
          server: "srv1".to_string(),
          account_name: "root".to_string(),
          ..Default::default()
        }],
      )
      .await
      .unwrap();
    store
      .set_status(&key, ExternalKeyStatus::Allowed)
      .await
      .unwrap();
    let key = store.get_key(&key.id).await.unwrap().unwrap();

    reconciler
      .reconcile_registry(
        vec![key.clone()],
        HashMap::new(),
        &HashSet::from(["srv1".to_string()]),
      )
      .await
      .unwrap();
    let kept = store.get_key(&key.id).await.unwrap().unwrap();
    assert_eq!(kept.status, ExternalKeyStatus::Allowed);
    assert!(kept.occurrence.is_empty());
  }

  #[tokio::test]
  async fn denied_key_still_on_host_keeps_its_occurrence() {
    let (store, _notifier, reconciler) = harness();
    let key = store
      .insert_key(
        "ssh-rsa",
        "AAAAdenied",
        vec![ExternalKeyOccurrence {
          server: "srv1".to_string(),
          account_name: "root".to_string(),
          ..Default::default()
        }],
      )
      .await
      .unwrap();
    store
      .set_status(&key, ExternalKeyStatus::Denied)
      .await
      .unwrap();
    let key = store.get_key(&key.id).await.unwrap().unwrap();

    // the scanner reports denied keys as long as their line is
    // still in the file, eg. when the file is not writable
    let found = found_from(vec![(
      "srv1",
      entry("root", "AAAAdenied", ""),
    )]);
    reconciler
      .reconcile_registry(
        vec![key.clone()],
        found,
        &HashSet::from(["srv1".to_string()]),
      )
      .await
      .unwrap();

    let kept = store.get_key(&key.id).await.unwrap().unwrap();
    assert_eq!(kept.status, ExternalKeyStatus::Denied);
    assert_eq!(kept.occurrence.len(), 1);
    assert_eq!(kept.occurrence[0].server, "srv1");
  }

  #[tokio::test]
  async fn unreachable_server_keeps_its_occurrences() {
    let (store, _notifier, reconciler) = harness();
    let key = store
      .insert_key(
        "ssh-rsa",
        "AAAAunreachable",
        vec![ExternalKeyOccurrence {
          server: "srv-down".to_string(),
          account_name: "root".to_string(),
          ..Default::default()
        }],
      )
      .await
      .unwrap();

    // srv-down did not respond this pass: it is absent from the
    // reachable set, and contributed nothing to the findings
    reconciler
      .reconcile_registry(
        vec![key.clone()],
        HashMap::new(),
        &HashSet::from(["srv-up".to_string()]),
      )
      .await
      .unwrap();

    let kept = store.get_key(&key.id).await.unwrap().unwrap();
    assert_eq!(kept.occurrence.len(), 1);
    assert_eq!(kept.occurrence[0].server, "srv-down");
  }

  #[tokio::test]
  async fn duplicate_sightings_collapse() {
    let mut found = HashMap::new();
    record_sighting(
      &mut found,
      "srv1",
      entry("root", "AAAA", "x"),
    );
    record_sighting(
      &mut found,
      "srv1",
      entry("root", "AAAA", "x"),
    );
    record_sighting(
      &mut found,
      "srv1",
      entry("deploy", "AAAA", "x"),
    );
    assert_eq!(found["AAAA"].occurrences.len(), 2);
  }
}
