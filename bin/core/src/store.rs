use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use keywarden_client::entities::{
  I64,
  external_key::{
    ExternalKey, ExternalKeyOccurrence, ExternalKeyStatus,
  },
  keywarden_timestamp,
  server::{KeyManagement, Server},
  sync_request::SyncRequest,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::interfaces::{
  KeyRegistry, ServerDirectory, SyncRequestStore,
};

/// JSON-file-backed implementation of the registry, server
/// directory and sync request store. The web application maintains
/// the same records in its own database; the core only needs a
/// small durable backend, and all mutations of one pass are
/// serialized behind a single lock.
pub struct JsonStore {
  path: Option<PathBuf>,
  data: RwLock<StoreData>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct StoreData {
  #[serde(default)]
  servers: Vec<Server>,
  #[serde(default)]
  keys: Vec<ExternalKey>,
  #[serde(default)]
  sync_requests: Vec<SyncRequest>,
}

impl JsonStore {
  /// Load the store from disk. A missing file is an empty store.
  pub async fn load(path: &Path) -> anyhow::Result<JsonStore> {
    let data = match tokio::fs::read(path).await {
      Ok(contents) => serde_json::from_slice(&contents)
        .with_context(|| {
          format!("invalid store file at {}", path.display())
        })?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        StoreData::default()
      }
      Err(e) => {
        return Err(e).with_context(|| {
          format!("failed to read store file at {}", path.display())
        });
      }
    };
    Ok(JsonStore {
      path: Some(path.to_path_buf()),
      data: RwLock::new(data),
    })
  }

  /// A store without a backing file. Used by the tests.
  pub fn in_memory() -> JsonStore {
    JsonStore {
      path: None,
      data: RwLock::new(StoreData::default()),
    }
  }

  /// Insert or replace a server record. Not part of the
  /// [ServerDirectory] contract, servers are provisioned by the
  /// web application.
  pub async fn upsert_server(
    &self,
    server: Server,
  ) -> anyhow::Result<()> {
    let mut data = self.data.write().await;
    match data.servers.iter_mut().find(|s| s.id == server.id) {
      Some(existing) => *existing = server,
      None => data.servers.push(server),
    }
    self.persist(&data).await
  }

  async fn persist(&self, data: &StoreData) -> anyhow::Result<()> {
    let Some(path) = &self.path else {
      return Ok(());
    };
    let json = serde_json::to_vec_pretty(data)
      .context("failed to serialize store")?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await.with_context(|| {
      format!("failed to write store file at {}", tmp.display())
    })?;
    tokio::fs::rename(&tmp, path).await.with_context(|| {
      format!("failed to move store file to {}", path.display())
    })
  }
}

#[async_trait]
impl KeyRegistry for JsonStore {
  async fn list_all_keys(&self) -> anyhow::Result<Vec<ExternalKey>> {
    Ok(self.data.read().await.keys.clone())
  }

  async fn get_key(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<ExternalKey>> {
    Ok(
      self
        .data
        .read()
        .await
        .keys
        .iter()
        .find(|key| key.id == id)
        .cloned(),
    )
  }

  async fn insert_key(
    &self,
    key_type: &str,
    keydata: &str,
    occurrences: Vec<ExternalKeyOccurrence>,
  ) -> anyhow::Result<ExternalKey> {
    let mut data = self.data.write().await;
    let id = uuid::Uuid::new_v4().to_string();
    let now = keywarden_timestamp();
    let key = ExternalKey {
      id: id.clone(),
      status: ExternalKeyStatus::New,
      key_type: key_type.to_string(),
      keydata: keydata.to_string(),
      occurrence: occurrences
        .into_iter()
        .map(|occurrence| adopt(occurrence, &id, now))
        .collect(),
    };
    data.keys.push(key.clone());
    self.persist(&data).await?;
    Ok(key)
  }

  async fn update_occurrences(
    &self,
    key: &ExternalKey,
    occurrences: Vec<ExternalKeyOccurrence>,
  ) -> anyhow::Result<()> {
    let mut data = self.data.write().await;
    let Some(stored) =
      data.keys.iter_mut().find(|stored| stored.id == key.id)
    else {
      return Ok(());
    };
    // drop sightings no longer observed
    stored.occurrence.retain(|existing| {
      occurrences
        .iter()
        .any(|fresh| fresh.same_sighting(existing))
    });
    // record sightings not stored yet
    let now = keywarden_timestamp();
    let fresh = occurrences
      .into_iter()
      .filter(|fresh| {
        !stored
          .occurrence
          .iter()
          .any(|existing| existing.same_sighting(fresh))
      })
      .map(|occurrence| adopt(occurrence, &stored.id, now))
      .collect::<Vec<_>>();
    stored.occurrence.extend(fresh);
    self.persist(&data).await
  }

  async fn set_status(
    &self,
    key: &ExternalKey,
    status: ExternalKeyStatus,
  ) -> anyhow::Result<()> {
    let mut data = self.data.write().await;
    if let Some(stored) =
      data.keys.iter_mut().find(|stored| stored.id == key.id)
    {
      stored.status = status;
    }
    self.persist(&data).await
  }

  async fn delete_key(
    &self,
    key: &ExternalKey,
  ) -> anyhow::Result<()> {
    let mut data = self.data.write().await;
    // occurrences live inside the key record, deleting the key
    // cascades them
    data.keys.retain(|stored| stored.id != key.id);
    self.persist(&data).await
  }
}

/// Assign store identity to a freshly scanned occurrence.
/// An already set `appeared` timestamp is kept, so first sightings
/// stay first sightings.
fn adopt(
  mut occurrence: ExternalKeyOccurrence,
  key_id: &str,
  now: I64,
) -> ExternalKeyOccurrence {
  occurrence.id = uuid::Uuid::new_v4().to_string();
  occurrence.key = key_id.to_string();
  if occurrence.appeared == 0 {
    occurrence.appeared = now;
  }
  occurrence
}

#[async_trait]
impl ServerDirectory for JsonStore {
  async fn list_managed_servers(
    &self,
  ) -> anyhow::Result<Vec<Server>> {
    Ok(
      self
        .data
        .read()
        .await
        .servers
        .iter()
        .filter(|server| {
          server.key_management == KeyManagement::Keys
        })
        .cloned()
        .collect(),
    )
  }

  async fn get_server_by_id(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<Server>> {
    Ok(
      self
        .data
        .read()
        .await
        .servers
        .iter()
        .find(|server| server.id == id)
        .cloned(),
    )
  }

  async fn update_server(
    &self,
    server: &Server,
  ) -> anyhow::Result<()> {
    let mut data = self.data.write().await;
    if let Some(stored) =
      data.servers.iter_mut().find(|stored| stored.id == server.id)
    {
      *stored = server.clone();
    }
    self.persist(&data).await
  }
}

#[async_trait]
impl SyncRequestStore for JsonStore {
  async fn list_due(
    &self,
    now: I64,
  ) -> anyhow::Result<Vec<SyncRequest>> {
    Ok(
      self
        .data
        .read()
        .await
        .sync_requests
        .iter()
        .filter(|request| request.due(now))
        .cloned()
        .collect(),
    )
  }

  async fn add(
    &self,
    mut request: SyncRequest,
  ) -> anyhow::Result<()> {
    let mut data = self.data.write().await;
    if request.id.is_empty() {
      request.id = uuid::Uuid::new_v4().to_string();
    }
    data.sync_requests.push(request);
    self.persist(&data).await
  }

  async fn delete(
    &self,
    request: &SyncRequest,
  ) -> anyhow::Result<()> {
    let mut data = self.data.write().await;
    data.sync_requests.retain(|stored| stored.id != request.id);
    self.persist(&data).await
  }

  async fn delete_all_for_server(
    &self,
    server_id: &str,
  ) -> anyhow::Result<()> {
    let mut data = self.data.write().await;
    data
      .sync_requests
      .retain(|stored| stored.server_id != server_id);
    self.persist(&data).await
  }
}
