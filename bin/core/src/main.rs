use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use keywarden_client::entities::config::CoreCommand;

#[macro_use]
extern crate tracing;

mod alert;
mod config;
mod interfaces;
mod reconcile;
mod scan;
mod schedule;
mod status;
mod store;

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = config::core_config();
  logger::init(&config.logging)?;

  info!("Keywarden Core version: v{}", env!("CARGO_PKG_VERSION"));
  info!("{config:?}");

  // Two overlapping runs against the same hosts risk conflicting
  // file rewrites, so at most one core runs per store.
  let _lock = RunLock::acquire(&config.store_path)?;

  let store =
    Arc::new(store::JsonStore::load(&config.store_path).await?);

  match config::core_args().command {
    CoreCommand::Supervise => {
      let notifier = Arc::new(alert::LogNotifier::new(store.clone()));
      reconcile::Reconciler::new(
        store.clone(),
        store.clone(),
        notifier,
        config.clone(),
      )
      .run()
      .await
    }
    CoreCommand::Sync => {
      schedule::Scheduler::new(
        store.clone(),
        store.clone(),
        config.clone(),
      )
      .run()
      .await
    }
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;

  let app = tokio::spawn(app());

  tokio::select! {
    res = app => return res?,
    _ = term_signal.recv() => {
      info!("Terminate signal received, aborting run");
    },
  }

  Ok(())
}

/// Exclusive run lock next to the store file. Held for the whole
/// invocation, released on exit.
struct RunLock {
  path: PathBuf,
}

impl RunLock {
  fn acquire(store_path: &std::path::Path) -> anyhow::Result<RunLock> {
    let path = store_path.with_extension("lock");
    std::fs::OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(&path)
      .with_context(|| {
        format!(
          "another run appears to be active (lock file {} exists)",
          path.display()
        )
      })?;
    Ok(RunLock { path })
  }
}

impl Drop for RunLock {
  fn drop(&mut self) {
    if let Err(e) = std::fs::remove_file(&self.path) {
      error!(
        "failed to remove lock file {}: {e:#}",
        self.path.display()
      );
    }
  }
}
