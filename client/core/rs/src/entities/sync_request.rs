use serde::{Deserialize, Serialize};

use super::I64;

/// A pending request to synchronize keys out to one server, or to a
/// single account on it. Created by any mutation that should
/// trigger a resync, consumed exactly once by the sync scheduler.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SyncRequest {
  /// Unique id.
  pub id: String,

  /// Id of the target server.
  pub server_id: String,

  /// None: whole-server resync.
  #[serde(default)]
  pub account_name: Option<String>,

  /// None: run immediately. Some: deferred retry, due once the
  /// timestamp is reached.
  #[serde(default)]
  pub execution_time: Option<I64>,
}

impl SyncRequest {
  /// Whether the request should be executed now.
  pub fn due(&self, now: I64) -> bool {
    match self.execution_time {
      None => true,
      Some(execution_time) => execution_time <= now,
    }
  }
}
