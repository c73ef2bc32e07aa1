use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use super::logger::LogConfig;

/// Configuration of the supervision core. Loaded at startup from an
/// optional TOML file, with environment / cli overrides applied on
/// top.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CoreConfig {
  /// Path of the JSON store holding servers, external keys and
  /// sync requests.
  pub store_path: PathBuf,

  /// Command the scheduler spawns for one synchronization run.
  /// Called with the target hostname, and the account name when the
  /// request is account scoped.
  pub sync_command: String,

  /// Which flavor of the `timeout` utility wraps sync subprocesses.
  pub timeout_util: TimeoutUtil,

  /// Login names tried in order when connecting to managed hosts.
  pub login_users: Vec<String>,

  /// Private key file the authority authenticates with.
  pub identity_file: PathBuf,

  /// Seconds before a connect attempt is abandoned.
  pub connect_timeout: u64,

  /// Abort a server's scan when more than one managed server pins
  /// the same host key.
  pub host_key_collision_protection: bool,

  /// Hostname verification level.
  /// - 0: off
  /// - 1: compare against `/bin/hostname -f` on the target
  /// - 2: compare against `/var/local/keys-sync/.hostnames`,
  ///   falling back to `/bin/hostname -f` when the file is missing
  /// - 3: like 2, but a missing file aborts the scan
  pub hostname_verification: u8,

  /// Remote path the monitoring status artifact is written to.
  pub status_file_path: String,

  /// Seconds until a written status artifact expires.
  pub status_file_timeout: u64,

  /// Logging configuration.
  pub logging: LogConfig,
}

impl Default for CoreConfig {
  fn default() -> Self {
    CoreConfig {
      store_path: PathBuf::from("keywarden.store.json"),
      sync_command: String::from("scripts/sync"),
      timeout_util: TimeoutUtil::default(),
      login_users: vec![
        String::from("keys-sync"),
        String::from("root"),
      ],
      identity_file: PathBuf::from("config/keys-sync"),
      connect_timeout: 30,
      host_key_collision_protection: true,
      hostname_verification: 0,
      status_file_path: String::from("/var/local/keys-sync.status"),
      status_file_timeout: 7200,
      logging: LogConfig::default(),
    }
  }
}

/// Flavor of the process-level `timeout` utility available on the
/// host running the core.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutUtil {
  /// GNU coreutils: `timeout 60s <cmd>`
  #[default]
  Gnu,
  /// BusyBox: `timeout -t 60 <cmd>`
  BusyBox,
}

/// Keywarden core: fleet ssh key supervision.
#[derive(Parser, Debug)]
#[command(name = "core", version)]
pub struct CliArgs {
  #[command(subcommand)]
  pub command: CoreCommand,

  /// Path to the core config file.
  #[arg(long)]
  pub config_path: Option<PathBuf>,

  /// Override the configured log level.
  #[arg(long)]
  pub log_level: Option<tracing::Level>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreCommand {
  /// Run one supervision pass across all managed servers.
  Supervise,
  /// Execute all due sync requests.
  Sync,
}

/// Environment overrides.
#[derive(Deserialize, Debug, Default)]
pub struct Env {
  #[serde(default)]
  pub keywarden_config_path: Option<PathBuf>,
}
