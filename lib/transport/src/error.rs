use thiserror::Error;

/// Transport failures. All of these are recoverable at the
/// reconciler level: they end one server's scan and are folded into
/// that server's supervision error, they never abort the fleet pass.
#[derive(Debug, Error)]
pub enum Error {
  #[error("Failed to connect to {host}:{port}: {reason}")]
  Connect {
    host: String,
    port: u16,
    reason: String,
  },

  /// The handshake died without the proxy chain reporting anything,
  /// ie. the target itself never answered.
  #[error("No response from ssh server at {host}:{port}")]
  NoResponse { host: String, port: u16 },

  /// The spawned jumphost chain could not be set up at all.
  #[error(
    "Failed to build jumphost tunnel to {host}:{port}: {reason}"
  )]
  Tunnel {
    host: String,
    port: u16,
    reason: String,
  },

  /// The jumphost chain died underneath the handshake.
  #[error("Jumphost tunnel to {host}:{port} broke: {stderr}")]
  TunnelBroken {
    host: String,
    port: u16,
    stderr: String,
  },

  /// The presented host key does not match the pinned one.
  /// Security relevant, aborts the server's scan.
  #[error("Host key validation failed for {host}:{port}")]
  HostKeyMismatch { host: String, port: u16 },

  #[error("Public key authentication failed for {user}@{host}")]
  Auth { user: String, host: String },

  #[error("Failed to load identity key {path}: {reason}")]
  Identity { path: String, reason: String },

  #[error("Failed to execute command {command:?}: {reason}")]
  Exec { command: String, reason: String },

  #[error("Could not access {path}: {reason}")]
  File { path: String, reason: String },

  #[error("Ssh protocol error: {0}")]
  Protocol(#[from] russh::Error),
}

impl Error {
  /// Auth failures against one login user may be retried with the
  /// next configured user; everything else is final.
  pub fn is_auth_failure(&self) -> bool {
    matches!(self, Error::Auth { .. })
  }
}
