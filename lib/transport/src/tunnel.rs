use std::{
  borrow::Cow, os::fd::OwnedFd, path::Path, process::Stdio,
  time::Duration,
};

use keywarden_client::entities::server::Jumphost;
use tokio::{
  io::AsyncReadExt,
  net::UnixStream,
  process::{Child, ChildStderr, Command},
};

/// A spawned `ssh -W` proxy chain carrying one connection through a
/// list of jumphosts. One end of a local socket pair is wired as the
/// chain's stdio, the other end is handed to the ssh client library
/// as its transport stream. The chain's stderr is retained for
/// diagnostics.
///
/// Must be kept alive as long as the connection is in use.
pub(crate) struct Tunnel {
  child: Child,
  stderr: Option<ChildStderr>,
}

impl Tunnel {
  /// Spawn the proxy chain for the given hops. The last hop dials
  /// `target_host:target_port`.
  pub async fn spawn(
    hops: &[Jumphost],
    identity_file: &Path,
    target_host: &str,
    target_port: u16,
  ) -> std::io::Result<(UnixStream, Tunnel)> {
    let argv =
      proxy_command(hops, identity_file, target_host, target_port);
    let (ours, theirs) = UnixStream::pair()?;
    let theirs = theirs.into_std()?;
    theirs.set_nonblocking(false)?;
    let stdin = theirs.try_clone()?;

    let mut child = Command::new(&argv[0])
      .args(&argv[1..])
      .stdin(Stdio::from(OwnedFd::from(stdin)))
      .stdout(Stdio::from(OwnedFd::from(theirs)))
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()?;
    let stderr = child.stderr.take();

    Ok((ours, Tunnel { child, stderr }))
  }

  /// Drain whatever the proxy chain wrote to stderr. Only called
  /// after the connection attempt failed, so the chain is usually
  /// dead and eof comes quickly; a hung chain is abandoned after a
  /// short grace period.
  pub async fn collect_stderr(&mut self) -> String {
    let Some(mut stderr) = self.stderr.take() else {
      return String::new();
    };
    let _ = self.child.start_kill();
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(
      Duration::from_secs(2),
      stderr.read_to_end(&mut buf),
    )
    .await;
    String::from_utf8_lossy(&buf).into_owned()
  }
}

/// Build the argv of the proxy chain process.
///
/// Each hop runs `ssh -W <next>` toward the following hop, the last
/// hop pointing at the real target. Stage n is wired into stage
/// n + 1 as its `ProxyCommand`, so the returned argv is the stage of
/// the final hop and the first stage carries no `ProxyCommand` at
/// all.
pub(crate) fn proxy_command(
  hops: &[Jumphost],
  identity_file: &Path,
  target_host: &str,
  target_port: u16,
) -> Vec<String> {
  let mut argv = Vec::new();
  let mut prev: Option<String> = None;
  for (i, hop) in hops.iter().enumerate() {
    let (next_host, next_port) = match hops.get(i + 1) {
      Some(next) => (next.host.as_str(), next.port),
      None => (target_host, target_port),
    };
    argv = vec![
      "ssh".to_string(),
      "-o".to_string(),
      "BatchMode=yes".to_string(),
      "-i".to_string(),
      identity_file.display().to_string(),
      "-p".to_string(),
      hop.port.to_string(),
      "-W".to_string(),
      format!("{next_host}:{next_port}"),
    ];
    if let Some(prev) = prev.take() {
      argv.push("-o".to_string());
      argv.push(format!("ProxyCommand={prev}"));
    }
    argv.push(format!("{}@{}", hop.user, hop.host));
    prev = Some(shell_join(&argv));
  }
  argv
}

fn shell_join(argv: &[String]) -> String {
  argv
    .iter()
    .map(|arg| shell_escape::escape(Cow::from(arg.as_str())))
    .collect::<Vec<_>>()
    .join(" ")
}
