//! Ssh transport of the Keywarden supervision core.
//!
//! Opens an authenticated session to a managed server, optionally
//! tunneled through a chain of jumphosts, pins and verifies the
//! host key, and exposes command execution plus sftp file access.

use std::{path::Path, sync::Arc, time::Duration};

use keywarden_client::entities::{
  optional_string, server::JumphostChain,
};
use russh::{
  ChannelMsg,
  client::{self, AuthResult},
  keys::PrivateKeyWithHashAlg,
};
use russh_sftp::client::SftpSession;
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::TcpStream,
  sync::OnceCell,
  time::timeout,
};
use tracing::debug;

mod error;
mod handler;
mod tunnel;

pub use error::Error;

use handler::ClientHandler;
use tunnel::Tunnel;

/// Everything needed to reach one managed server.
pub struct ConnectArgs<'a> {
  pub host: &'a str,
  pub port: u16,
  /// Jumphost chain, empty hops for directly reachable servers.
  pub chain: &'a JumphostChain,
  pub username: &'a str,
  /// Pinned host key as base64 wire blob.
  /// Empty: learn on first use.
  pub expected_host_key: &'a str,
  /// Private key file to authenticate with.
  pub identity_file: &'a Path,
  /// Bound on tcp connect and ssh handshake.
  pub connect_timeout: Duration,
}

/// Open an authenticated connection to the target described by
/// `args`.
pub async fn connect(
  args: ConnectArgs<'_>,
) -> Result<Connection, Error> {
  let identity = load_identity(args.identity_file).await?;

  // The alias only renames the final dial target, reachability is
  // fully described by the hop list.
  let dial_host =
    args.chain.host_alias.as_deref().unwrap_or(args.host);

  let expected = optional_string(args.expected_host_key);
  let handler = ClientHandler::new(expected.clone());
  let seen = handler.seen.clone();

  let config = Arc::new(client::Config::default());

  let (handshake, mut tunnel) =
    if args.chain.jumphosts.is_empty() {
      debug!("connecting to {dial_host}:{} directly", args.port);
      let stream = timeout(
        args.connect_timeout,
        TcpStream::connect((dial_host, args.port)),
      )
      .await
      .map_err(|_| Error::Connect {
        host: dial_host.to_string(),
        port: args.port,
        reason: String::from("connection timed out"),
      })?
      .map_err(|e| Error::Connect {
        host: dial_host.to_string(),
        port: args.port,
        reason: e.to_string(),
      })?;
      let handshake = timeout(
        args.connect_timeout,
        client::connect_stream(config, stream, handler),
      )
      .await;
      (handshake, None)
    } else {
      debug!(
        "connecting to {dial_host}:{} through {} jumphosts",
        args.port,
        args.chain.jumphosts.len()
      );
      let (stream, tunnel) = Tunnel::spawn(
        &args.chain.jumphosts,
        args.identity_file,
        dial_host,
        args.port,
      )
      .await
      .map_err(|e| Error::Tunnel {
        host: dial_host.to_string(),
        port: args.port,
        reason: e.to_string(),
      })?;
      let handshake = timeout(
        args.connect_timeout,
        client::connect_stream(config, stream, handler),
      )
      .await;
      (handshake, Some(tunnel))
    };

  let mut handle = match handshake {
    Ok(Ok(handle)) => handle,
    Ok(Err(russh::Error::UnknownKey)) => {
      return Err(Error::HostKeyMismatch {
        host: dial_host.to_string(),
        port: args.port,
      });
    }
    Ok(Err(e)) => {
      return Err(
        classify_handshake_failure(
          dial_host,
          args.port,
          &seen,
          tunnel.as_mut(),
          Some(e),
        )
        .await,
      );
    }
    Err(_elapsed) => {
      return Err(
        classify_handshake_failure(
          dial_host,
          args.port,
          &seen,
          tunnel.as_mut(),
          None,
        )
        .await,
      );
    }
  };

  let auth = handle
    .authenticate_publickey(
      args.username,
      PrivateKeyWithHashAlg::new(Arc::new(identity), None),
    )
    .await?;
  if let AuthResult::Failure { .. } = auth {
    return Err(Error::Auth {
      user: args.username.to_string(),
      host: dial_host.to_string(),
    });
  }

  let host_key = seen.lock().unwrap().clone().ok_or_else(|| {
    Error::NoResponse {
      host: dial_host.to_string(),
      port: args.port,
    }
  })?;

  Ok(Connection {
    handle,
    sftp: OnceCell::new(),
    host_key,
    host_key_learned: expected.is_none(),
    _tunnel: tunnel,
  })
}

/// The host key never arrived. Distinguish a broken proxy chain
/// from a target that did not answer by inspecting the chain's
/// captured stderr.
async fn classify_handshake_failure(
  host: &str,
  port: u16,
  seen: &std::sync::Mutex<Option<String>>,
  tunnel: Option<&mut Tunnel>,
  error: Option<russh::Error>,
) -> Error {
  if seen.lock().unwrap().is_none() {
    if let Some(tunnel) = tunnel {
      let stderr = tunnel.collect_stderr().await;
      if !stderr.trim().is_empty() {
        return Error::TunnelBroken {
          host: host.to_string(),
          port,
          stderr: stderr.trim().to_string(),
        };
      }
    }
    return Error::NoResponse {
      host: host.to_string(),
      port,
    };
  }
  match error {
    Some(e) => Error::Protocol(e),
    None => Error::NoResponse {
      host: host.to_string(),
      port,
    },
  }
}

async fn load_identity(
  path: &Path,
) -> Result<russh::keys::PrivateKey, Error> {
  let identity = |reason: String| Error::Identity {
    path: path.display().to_string(),
    reason,
  };
  let pem = tokio::fs::read_to_string(path)
    .await
    .map_err(|e| identity(e.to_string()))?;
  russh::keys::decode_secret_key(&pem, None)
    .map_err(|e| identity(e.to_string()))
}

/// An authenticated ssh connection to one managed server.
pub struct Connection {
  handle: client::Handle<ClientHandler>,
  /// Sftp subsystem, initialized lazily on first file access.
  sftp: OnceCell<SftpSession>,
  host_key: String,
  host_key_learned: bool,
  /// Keeps the proxy chain alive for tunneled connections.
  _tunnel: Option<Tunnel>,
}

impl Connection {
  /// Base64 wire blob of the host key the server presented.
  pub fn host_key(&self) -> &str {
    &self.host_key
  }

  /// True when no key was pinned before this connection, ie. the
  /// caller should persist [Connection::host_key] now.
  pub fn host_key_learned(&self) -> bool {
    self.host_key_learned
  }

  /// Execute a command and return its stdout. Stderr is logged,
  /// the exit status is not interpreted.
  pub async fn exec(&self, command: &str) -> Result<String, Error> {
    let exec_error = |reason: String| Error::Exec {
      command: command.to_string(),
      reason,
    };
    let mut channel = self
      .handle
      .channel_open_session()
      .await
      .map_err(|e| exec_error(e.to_string()))?;
    channel
      .exec(true, command)
      .await
      .map_err(|e| exec_error(e.to_string()))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(msg) = channel.wait().await {
      match msg {
        ChannelMsg::Data { data } => {
          stdout.extend_from_slice(&data);
        }
        ChannelMsg::ExtendedData { data, ext: 1 } => {
          stderr.extend_from_slice(&data);
        }
        ChannelMsg::Eof | ChannelMsg::Close => break,
        _ => {}
      }
    }
    if !stderr.is_empty() {
      debug!(
        "remote command {command:?} wrote to stderr: {}",
        String::from_utf8_lossy(&stderr)
      );
    }

    Ok(String::from_utf8_lossy(&stdout).into_owned())
  }

  /// Read a whole remote file.
  pub async fn read_file(
    &self,
    path: &str,
  ) -> Result<Vec<u8>, Error> {
    let mut file = self
      .sftp()
      .await?
      .open(path)
      .await
      .map_err(|e| file_error(path, e))?;
    let mut content = Vec::new();
    file
      .read_to_end(&mut content)
      .await
      .map_err(|e| file_error(path, e))?;
    Ok(content)
  }

  /// Read a remote file and split it at linefeeds. One linefeed at
  /// the end of the file (which should be there, by convention)
  /// does not produce an empty last element.
  pub async fn read_lines(
    &self,
    path: &str,
  ) -> Result<Vec<String>, Error> {
    let content = self.read_file(path).await?;
    Ok(split_lines(&String::from_utf8_lossy(&content)))
  }

  /// Create or overwrite a remote file.
  pub async fn write_file(
    &self,
    path: &str,
    content: &[u8],
  ) -> Result<(), Error> {
    let mut file = self
      .sftp()
      .await?
      .create(path)
      .await
      .map_err(|e| file_error(path, e))?;
    file
      .write_all(content)
      .await
      .map_err(|e| file_error(path, e))?;
    file.shutdown().await.map_err(|e| file_error(path, e))?;
    Ok(())
  }

  /// Delete a remote file.
  pub async fn delete_file(&self, path: &str) -> Result<(), Error> {
    self
      .sftp()
      .await?
      .remove_file(path)
      .await
      .map_err(|e| file_error(path, e))
  }

  /// Whether the remote path exists. Fails when existence cannot
  /// be determined, callers decide how much that matters.
  pub async fn exists(&self, path: &str) -> Result<bool, Error> {
    self
      .sftp()
      .await?
      .try_exists(path)
      .await
      .map_err(|e| file_error(path, e))
  }

  /// Whether the remote directory can be listed.
  pub async fn dir_readable(
    &self,
    path: &str,
  ) -> Result<bool, Error> {
    Ok(self.sftp().await?.read_dir(path).await.is_ok())
  }

  async fn sftp(&self) -> Result<&SftpSession, Error> {
    self
      .sftp
      .get_or_try_init(|| async {
        let channel = self
          .handle
          .channel_open_session()
          .await
          .map_err(|e| file_error("<sftp>", e))?;
        channel
          .request_subsystem(true, "sftp")
          .await
          .map_err(|e| file_error("<sftp>", e))?;
        SftpSession::new(channel.into_stream())
          .await
          .map_err(|e| file_error("<sftp>", e))
      })
      .await
  }
}

fn file_error(
  path: &str,
  error: impl std::fmt::Display,
) -> Error {
  Error::File {
    path: path.to_string(),
    reason: error.to_string(),
  }
}

fn split_lines(content: &str) -> Vec<String> {
  let mut lines = content
    .split('\n')
    .map(str::to_string)
    .collect::<Vec<_>>();
  if lines.last().is_some_and(String::is_empty) {
    lines.pop();
  }
  lines
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn split_lines_drops_one_trailing_linefeed() {
    assert_eq!(split_lines("a\nb\n"), vec!["a", "b"]);
    assert_eq!(split_lines("a\nb"), vec!["a", "b"]);
    assert_eq!(split_lines("a\nb\n\n"), vec!["a", "b", ""]);
    assert_eq!(split_lines("\n"), vec![""; 1]);
    assert!(split_lines("").is_empty());
  }
}
