use async_trait::async_trait;
use keywarden_client::entities::{
  I64,
  external_key::{
    ExternalKey, ExternalKeyOccurrence, ExternalKeyStatus,
  },
  server::Server,
  sync_request::SyncRequest,
};

/// Durable record of known external keys and where each one occurs.
/// Implemented by [crate::store::JsonStore] here and by the web
/// application's database on the frontend side.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
  /// All keys, with their occurrences attached.
  async fn list_all_keys(&self) -> anyhow::Result<Vec<ExternalKey>>;

  /// Re-read one key. Used for the optimistic status check right
  /// before a status-dependent deletion.
  async fn get_key(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<ExternalKey>>;

  /// Insert a newly discovered key (status `new`) together with its
  /// first occurrences.
  async fn insert_key(
    &self,
    key_type: &str,
    keydata: &str,
    occurrences: Vec<ExternalKeyOccurrence>,
  ) -> anyhow::Result<ExternalKey>;

  /// Diff the stored occurrences of `key` against `occurrences`:
  /// insert sightings not stored yet, delete stored sightings no
  /// longer in the list. Matching entries keep their `appeared`
  /// timestamp. The key's status is never touched.
  async fn update_occurrences(
    &self,
    key: &ExternalKey,
    occurrences: Vec<ExternalKeyOccurrence>,
  ) -> anyhow::Result<()>;

  async fn set_status(
    &self,
    key: &ExternalKey,
    status: ExternalKeyStatus,
  ) -> anyhow::Result<()>;

  /// Delete the key, cascading its occurrences.
  async fn delete_key(&self, key: &ExternalKey)
  -> anyhow::Result<()>;
}

/// Directory of managed servers.
#[async_trait]
pub trait ServerDirectory: Send + Sync {
  /// Servers with `key_management == keys`, ie. the ones
  /// participating in scanning and reconciliation.
  async fn list_managed_servers(
    &self,
  ) -> anyhow::Result<Vec<Server>>;

  async fn get_server_by_id(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<Server>>;

  async fn update_server(
    &self,
    server: &Server,
  ) -> anyhow::Result<()>;
}

/// Queue of pending synchronization requests.
#[async_trait]
pub trait SyncRequestStore: Send + Sync {
  /// Requests due at `now`, ie. with no execution time or one that
  /// has passed.
  async fn list_due(
    &self,
    now: I64,
  ) -> anyhow::Result<Vec<SyncRequest>>;

  async fn add(&self, request: SyncRequest) -> anyhow::Result<()>;

  /// Idempotent: deleting an already consumed request is fine.
  async fn delete(
    &self,
    request: &SyncRequest,
  ) -> anyhow::Result<()>;

  async fn delete_all_for_server(
    &self,
    server_id: &str,
  ) -> anyhow::Result<()>;
}

/// Sink for "a new external key appeared" notifications.
/// Fire and forget: failures are logged by the implementation and
/// must never abort reconciliation.
#[async_trait]
pub trait Notifier: Send + Sync {
  async fn notify_new_key_appeared(
    &self,
    key: &ExternalKey,
    occurrences: &[ExternalKeyOccurrence],
  );
}
