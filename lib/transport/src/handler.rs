use std::sync::{Arc, Mutex};

use russh::keys::PublicKey;

/// Client side handler doing host key pinning.
///
/// The key presented by the server is recorded in `seen` so the
/// caller can persist it on first contact and inspect it after a
/// failed handshake. With a pinned key present, anything but a
/// byte-for-byte match rejects the connection.
pub(crate) struct ClientHandler {
  /// Pinned host key as base64 wire blob. None: trust on first use.
  expected: Option<String>,
  /// The host key the server actually presented.
  pub seen: Arc<Mutex<Option<String>>>,
}

impl ClientHandler {
  pub fn new(expected: Option<String>) -> ClientHandler {
    ClientHandler {
      expected,
      seen: Arc::new(Mutex::new(None)),
    }
  }
}

/// Base64 wire blob of a public key, ie. the second token of its
/// OpenSSH representation.
pub(crate) fn host_key_blob(key: &PublicKey) -> Option<String> {
  let openssh = key.to_openssh().ok()?;
  openssh.split_whitespace().nth(1).map(str::to_string)
}

impl russh::client::Handler for ClientHandler {
  type Error = russh::Error;

  fn check_server_key(
    &mut self,
    server_public_key: &PublicKey,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
    let blob = host_key_blob(server_public_key);
    let accept = match (&self.expected, &blob) {
      // Learn on first use, the caller persists the seen key.
      (None, Some(_)) => true,
      (Some(expected), Some(presented)) => expected == presented,
      (_, None) => false,
    };
    *self.seen.lock().unwrap() = blob;
    async move { Ok(accept) }
  }
}
