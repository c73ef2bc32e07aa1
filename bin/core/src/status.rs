use chrono::{TimeZone, Utc};
use keywarden_client::entities::{
  I64,
  config::CoreConfig,
  external_key::{ExternalKey, ExternalKeyStatus},
  keywarden_timestamp,
  server::{Server, SyncStatus},
};
use serde::Serialize;
use transport::Connection;

use crate::interfaces::KeyRegistry;

/// A key in `new` status older than this is considered unnoticed,
/// admins were supposed to decide on it by now.
const UNNOTICED_AFTER_MS: I64 = 96 * 60 * 60 * 1000;

/// Monitoring artifact written onto each managed server after its
/// scan. Consumed by external monitoring, not by the core itself.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusFile {
  /// Bump to force monitors below the given artifact version into
  /// warning / error state after an incompatible format change.
  pub warn_below_version: u32,
  pub error_below_version: u32,
  pub sync_status: String,
  pub sync_status_message: Option<String>,
  pub key_supervision_error: Option<String>,
  pub accounts_with_unnoticed_keys: Vec<String>,
  /// RFC 2822 timestamp after which monitors should treat this
  /// artifact as stale.
  pub expire: String,
}

/// Compose and upload the status artifact for `server`, reusing the
/// still-open scan connection. On failure returns a note for the
/// server's supervision error, monitoring trouble is reported but
/// never raised.
pub async fn write_status_file(
  connection: &Connection,
  server: &Server,
  registry: &dyn KeyRegistry,
  error: Option<&str>,
  config: &CoreConfig,
) -> Result<(), String> {
  if !should_write(server, error) {
    return Ok(());
  }
  let keys = registry
    .list_all_keys()
    .await
    .map_err(|e| format!("Failed to load key registry: {e:#}"))?;
  let status = compose_status(
    server,
    &keys,
    error,
    keywarden_timestamp(),
    config.status_file_timeout,
  );
  let json = serde_json::to_vec(&status).map_err(|e| {
    format!("Failed to serialize status file: {e:#}")
  })?;
  connection
    .write_file(&config.status_file_path, &json)
    .await
    .map_err(|e| {
      format!(
        "Failed to write status file {}: {e:#}",
        config.status_file_path
      )
    })
}

/// A status artifact is only written when there is something to
/// report or the last sync succeeded. Overwriting a persisted
/// failure status with a clean-looking snapshot would hide the
/// failure from monitoring.
fn should_write(server: &Server, error: Option<&str>) -> bool {
  error.is_some() || server.sync_status == SyncStatus::Success
}

fn compose_status(
  server: &Server,
  keys: &[ExternalKey],
  error: Option<&str>,
  now: I64,
  timeout_secs: u64,
) -> StatusFile {
  let expire = now + (timeout_secs as I64) * 1000;
  StatusFile {
    warn_below_version: 1,
    error_below_version: 1,
    sync_status: server.sync_status.to_string(),
    sync_status_message: server.sync_status_message.clone(),
    key_supervision_error: error.map(str::to_string),
    accounts_with_unnoticed_keys: unnoticed_accounts(
      server, keys, now,
    ),
    expire: Utc
      .timestamp_millis_opt(expire)
      .single()
      .unwrap_or_else(Utc::now)
      .to_rfc2822(),
  }
}

/// Distinct account names on `server` holding a key that is still
/// undecided after the grace period.
fn unnoticed_accounts(
  server: &Server,
  keys: &[ExternalKey],
  now: I64,
) -> Vec<String> {
  let mut accounts = keys
    .iter()
    .filter(|key| key.status == ExternalKeyStatus::New)
    .flat_map(|key| &key.occurrence)
    .filter(|occurrence| {
      occurrence.server == server.id
        && occurrence.appeared <= now - UNNOTICED_AFTER_MS
    })
    .map(|occurrence| occurrence.account_name.clone())
    .collect::<Vec<_>>();
  accounts.sort();
  accounts.dedup();
  accounts
}
