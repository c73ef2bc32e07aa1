use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::entity::Entity;

/// A managed server as seen by the supervision core. Only servers
/// with `key_management == keys` participate in scanning and
/// reconciliation.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Server {
  /// Unique id.
  pub id: String,

  /// Hostname used to reach (and by default, to verify) the server.
  pub hostname: String,

  /// Ssh port.
  #[serde(default = "default_port")]
  pub port: u16,

  /// Jumphost chain specification, empty for directly reachable
  /// servers. Format: `user@hop[:port]` comma-list, optionally
  /// followed by ` -> alias` naming the final dial target.
  /// Eg. `sync@bastion,sync@dmz:2222 -> app01.internal`.
  #[serde(default)]
  pub jumphosts: String,

  /// Pinned host key, base64 of the wire encoding of the server's
  /// public key. Empty until learned on first contact.
  #[serde(default)]
  pub host_key: String,

  /// How keys on this server are managed.
  #[serde(default)]
  pub key_management: KeyManagement,

  /// Result of the last key synchronization.
  #[serde(default)]
  pub sync_status: SyncStatus,

  /// Details of the last sync attempt's success or failure.
  #[serde(default)]
  pub sync_status_message: Option<String>,

  /// Accumulated errors / warnings of the last supervision scan,
  /// prefixed with the scan start time. None when the scan was
  /// clean.
  #[serde(default)]
  pub key_supervision_error: Option<String>,

  /// Accounts provisioned on this server.
  #[serde(default)]
  pub accounts: Vec<ServerAccount>,

  /// Effective server admins.
  #[serde(default)]
  pub admins: Vec<Entity>,
}

fn default_port() -> u16 {
  22
}

/// An account on a managed server, with the admins responsible
/// for it.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ServerAccount {
  pub name: String,
  #[serde(default)]
  pub admins: Vec<Entity>,
}

/// Key management mode of a [Server].
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
pub enum KeyManagement {
  /// Not managed at all.
  #[default]
  None,
  /// Managed and supervised by Keywarden.
  Keys,
  /// Managed by some other system.
  Other,
}

/// Result of the last sync run against a [Server].
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
pub enum SyncStatus {
  #[default]
  #[serde(rename = "not synced yet")]
  NotSyncedYet,
  #[serde(rename = "sync success")]
  Success,
  #[serde(rename = "sync failure")]
  Failure,
  #[serde(rename = "sync warning")]
  Warning,
}

impl std::fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    let status = match self {
      SyncStatus::NotSyncedYet => "not synced yet",
      SyncStatus::Success => "sync success",
      SyncStatus::Failure => "sync failure",
      SyncStatus::Warning => "sync warning",
    };
    write!(f, "{status}")
  }
}

/// One hop of a jumphost chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jumphost {
  pub user: String,
  pub host: String,
  pub port: u16,
}

/// Parsed form of [Server::jumphosts]. The hops are applied
/// strictly in order, first hop closest to the authority. The alias
/// is only used as the final dial target name, decoupling "how to
/// reach" from "what name to expect".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JumphostChain {
  pub host_alias: Option<String>,
  pub jumphosts: Vec<Jumphost>,
}

const HOST_CHARS: &str = r"[a-zA-Z0-9\-.\x{80}-\x{10FFFF}]";

fn alias_regex() -> &'static Regex {
  static ALIAS: OnceLock<Regex> = OnceLock::new();
  ALIAS.get_or_init(|| {
    Regex::new(&format!(r"^([^ >]*) *-> *({HOST_CHARS}+)$")).unwrap()
  })
}

fn hop_regex() -> &'static Regex {
  static HOP: OnceLock<Regex> = OnceLock::new();
  HOP.get_or_init(|| {
    Regex::new(&format!(r"^([^@]+)@({HOST_CHARS}+)(:([0-9]+))?$"))
      .unwrap()
  })
}

impl Server {
  /// Check if a given hostname string is syntactically correct.
  pub fn hostname_valid(hostname: &str) -> bool {
    static HOSTNAME: OnceLock<Regex> = OnceLock::new();
    HOSTNAME
      .get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9\-._\x{80}-\x{10FFFF}]+$").unwrap()
      })
      .is_match(hostname)
  }

  /// Check if a given jumphosts string is syntactically correct.
  pub fn jumphosts_valid(jumphosts: &str) -> bool {
    static JUMPHOSTS: OnceLock<Regex> = OnceLock::new();
    JUMPHOSTS
      .get_or_init(|| {
        let one = format!(r"[^@]+@{HOST_CHARS}+(:[0-9]+)?");
        Regex::new(&format!(
          r"^({one}(,{one})*)?( *-> *{HOST_CHARS}+)?$"
        ))
        .unwrap()
      })
      .is_match(jumphosts)
  }

  /// Parse the jumphosts string of this server. Ports default
  /// to 22. Invalid hop specifications are skipped, callers should
  /// validate with [Server::jumphosts_valid] on entry.
  pub fn parse_jumphosts(&self) -> JumphostChain {
    let (spec, host_alias) =
      match alias_regex().captures(&self.jumphosts) {
        Some(captures) => (
          captures[1].to_string(),
          Some(captures[2].to_string()),
        ),
        None => (self.jumphosts.clone(), None),
      };
    let jumphosts = if spec.is_empty() {
      Vec::new()
    } else {
      spec
        .split(',')
        .filter_map(|part| {
          let captures = hop_regex().captures(part)?;
          let port = captures
            .get(4)
            .and_then(|port| port.as_str().parse().ok())
            .unwrap_or(22);
          Some(Jumphost {
            user: captures[1].to_string(),
            host: captures[2].to_string(),
            port,
          })
        })
        .collect()
    };
    JumphostChain {
      host_alias,
      jumphosts,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn server_with_jumphosts(jumphosts: &str) -> Server {
    Server {
      jumphosts: jumphosts.to_string(),
      ..Default::default()
    }
  }

  #[test]
  fn hostname_grammar() {
    assert!(Server::hostname_valid("app01.example.org"));
    assert!(Server::hostname_valid("app_01"));
    assert!(Server::hostname_valid("höst.example.org"));
    assert!(!Server::hostname_valid(""));
    assert!(!Server::hostname_valid("app 01"));
    assert!(!Server::hostname_valid("app01;reboot"));
  }

  #[test]
  fn jumphost_grammar() {
    assert!(Server::jumphosts_valid(""));
    assert!(Server::jumphosts_valid("sync@bastion"));
    assert!(Server::jumphosts_valid("sync@bastion:2222"));
    assert!(Server::jumphosts_valid(
      "sync@bastion,root@dmz.example.org:22"
    ));
    assert!(Server::jumphosts_valid(
      "sync@bastion -> app01.internal"
    ));
    assert!(Server::jumphosts_valid(" -> app01.internal"));
    assert!(!Server::jumphosts_valid("bastion"));
    assert!(!Server::jumphosts_valid("sync@bastion:"));
    assert!(!Server::jumphosts_valid("sync@bastion,"));
  }

  #[test]
  fn parse_empty_chain() {
    let chain = server_with_jumphosts("").parse_jumphosts();
    assert_eq!(chain, JumphostChain::default());
  }

  #[test]
  fn parse_chain_with_alias() {
    let chain = server_with_jumphosts(
      "sync@bastion,sync@dmz:2222 -> app01.internal",
    )
    .parse_jumphosts();
    assert_eq!(chain.host_alias.as_deref(), Some("app01.internal"));
    assert_eq!(
      chain.jumphosts,
      vec![
        Jumphost {
          user: "sync".to_string(),
          host: "bastion".to_string(),
          port: 22,
        },
        Jumphost {
          user: "sync".to_string(),
          host: "dmz".to_string(),
          port: 2222,
        },
      ]
    );
  }

  #[test]
  fn parse_alias_only() {
    let chain = server_with_jumphosts("-> app01.internal")
      .parse_jumphosts();
    assert_eq!(chain.host_alias.as_deref(), Some("app01.internal"));
    assert!(chain.jumphosts.is_empty());
  }
}
