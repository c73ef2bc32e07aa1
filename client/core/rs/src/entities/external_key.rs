use serde::{Deserialize, Serialize};

use super::I64;

/// An ssh public key found in an `authorized_keys` file on a managed
/// server which was not provisioned by Keywarden. External keys are
/// not managed but supervised: newly appearing keys are recorded,
/// and admins decide whether each one is allowed or denied.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExternalKey {
  /// Unique id, assigned on first insert.
  pub id: String,

  /// Admin decision state for this key.
  pub status: ExternalKeyStatus,

  /// Key algorithm string, eg. `ssh-rsa`.
  #[serde(rename = "type")]
  pub key_type: String,

  /// Base64 key material. The natural deduplication key across the
  /// whole fleet: the same key text on different hosts refers to
  /// the same external key.
  pub keydata: String,

  /// Everywhere this key was sighted.
  #[serde(default)]
  pub occurrence: Vec<ExternalKeyOccurrence>,
}

/// Lifecycle of an [ExternalKey]. Keys start out `new`. Keys still
/// in `new` state which disappear from the whole fleet are dropped
/// again; `allowed` / `denied` keys are retained indefinitely as
/// decision memory.
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
)]
#[serde(rename_all = "lowercase")]
pub enum ExternalKeyStatus {
  #[default]
  New,
  Allowed,
  Denied,
}

impl std::fmt::Display for ExternalKeyStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    match self {
      ExternalKeyStatus::New => write!(f, "new"),
      ExternalKeyStatus::Allowed => write!(f, "allowed"),
      ExternalKeyStatus::Denied => write!(f, "denied"),
    }
  }
}

/// One concrete sighting of an [ExternalKey] at a specific
/// server / account. Never outlives its parent key.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExternalKeyOccurrence {
  /// Unique id, assigned on insert.
  pub id: String,

  /// Id of the parent [ExternalKey].
  pub key: String,

  /// Id of the server the key was sighted on.
  pub server: String,

  /// Local account owning the scanned `authorized_keys` file.
  pub account_name: String,

  /// Trailing comment field of the key line.
  pub comment: String,

  /// When this sighting was first recorded.
  /// Not updated on rediscovery.
  pub appeared: I64,
}

impl ExternalKeyOccurrence {
  /// Whether both records describe the same sighting. Identity for
  /// occurrence diffing is (server, account, comment) - the keydata
  /// is fixed at the parent key.
  pub fn same_sighting(&self, other: &Self) -> bool {
    self.server == other.server
      && self.account_name == other.account_name
      && self.comment == other.comment
  }
}
