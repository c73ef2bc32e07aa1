use std::{borrow::Cow, collections::HashSet, sync::OnceLock};

use regex::Regex;
use transport::Connection;

/// One surviving key line of an `authorized_keys` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
  pub account_name: String,
  pub key_type: String,
  pub keydata: String,
  pub comment: String,
}

/// Result of scanning one server: the surviving key entries of all
/// active accounts, plus accumulated error / warning notes.
#[derive(Debug, Default)]
pub struct ScanOutcome {
  pub entries: Vec<KeyEntry>,
  pub errors: Vec<String>,
}

/// Scan every active account's `authorized_keys` file(s), stripping
/// lines whose keydata is in `denied` and rewriting files that were
/// modified. Errors are collected per file, a broken file never
/// aborts the rest of the scan.
pub async fn scan(
  connection: &Connection,
  denied: &HashSet<String>,
) -> ScanOutcome {
  let mut outcome = ScanOutcome::default();

  match keys_file_honored(connection).await {
    Ok(true) => {}
    Ok(false) => {
      // sshd ignores ~/.ssh/authorized_keys on this host, its
      // contents are inert and not worth supervising
      debug!("authorized_keys not honored by sshd, skipping scan");
      return outcome;
    }
    Err(e) => {
      outcome.errors.push(format!(
        "Failed to read /etc/ssh/sshd_config: {e:#}"
      ));
    }
  }

  let passwd = match connection.read_lines("/etc/passwd").await {
    Ok(lines) => lines,
    Err(e) => {
      outcome
        .errors
        .push(format!("Failed to read /etc/passwd: {e:#}"));
      return outcome;
    }
  };

  for user in passwd.iter().filter_map(|line| parse_passwd_line(line))
  {
    if !user.active {
      continue;
    }
    for filename in ["authorized_keys", "authorized_keys2"] {
      let path = format!("{}/.ssh/{}", user.home, filename);
      scan_file(connection, &user.name, &path, denied, &mut outcome)
        .await;
    }
  }
  outcome
}

/// Whether sshd on this host actually consults the per-user
/// `authorized_keys` file. A host configured with a different
/// `AuthorizedKeysFile` would make the scan meaningless.
async fn keys_file_honored(
  connection: &Connection,
) -> Result<bool, transport::Error> {
  if !connection.exists("/etc/ssh/sshd_config").await? {
    return Ok(true);
  }
  let lines =
    connection.read_lines("/etc/ssh/sshd_config").await?;
  Ok(sshd_config_honors_keys_file(&lines))
}

fn sshd_config_honors_keys_file(lines: &[String]) -> bool {
  for line in lines {
    let line = line.trim();
    if let Some(value) = line
      .strip_prefix("AuthorizedKeysFile")
      .filter(|rest| rest.starts_with([' ', '\t']))
    {
      return value.contains(".ssh/authorized_keys");
    }
  }
  true
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PasswdEntry {
  name: String,
  home: String,
  active: bool,
}

const INACTIVE_SHELLS: &[&str] = &[
  "/bin/false",
  "/bin/nologin",
  "/sbin/nologin",
  "/usr/bin/false",
  "/usr/bin/nologin",
  "/usr/sbin/false",
  "/usr/sbin/nologin",
];

/// Parse one line of `/etc/passwd`. Lines without exactly 7 fields
/// are dropped.
fn parse_passwd_line(line: &str) -> Option<PasswdEntry> {
  let fields = line.split(':').collect::<Vec<_>>();
  if fields.len() != 7 {
    return None;
  }
  Some(PasswdEntry {
    name: fields[0].to_string(),
    home: fields[5].to_string(),
    active: !INACTIVE_SHELLS.contains(&fields[6]),
  })
}

fn key_line_regex() -> &'static Regex {
  static KEY_LINE: OnceLock<Regex> = OnceLock::new();
  KEY_LINE.get_or_init(|| {
    Regex::new(
      r"^([^ ]+ )?((ssh|ecdsa)-[^ ]+) ([A-Za-z0-9+/=]+)( (.*))?$",
    )
    .unwrap()
  })
}

/// Parse one key line. Returns (type, keydata, comment), or None
/// when the line does not match the grammar.
fn parse_key_line(line: &str) -> Option<(String, String, String)> {
  let captures = key_line_regex().captures(line)?;
  Some((
    captures[2].to_string(),
    captures[4].to_string(),
    captures
      .get(6)
      .map(|comment| comment.as_str().to_string())
      .unwrap_or_default(),
  ))
}

async fn scan_file(
  connection: &Connection,
  account_name: &str,
  path: &str,
  denied: &HashSet<String>,
  outcome: &mut ScanOutcome,
) {
  match connection.exists(path).await {
    Ok(true) => {}
    Ok(false) => {
      if let Some(note) =
        check_missing_file(connection, path).await
      {
        outcome.errors.push(note);
      }
      return;
    }
    Err(e) => {
      outcome.errors.push(format!(
        "Failed to check existence of {path}: {e:#}"
      ));
      return;
    }
  }

  let lines = match connection.read_lines(path).await {
    Ok(lines) => lines,
    Err(e) => {
      outcome
        .errors
        .push(format!("Failed to read {path}: {e:#}"));
      return;
    }
  };

  // Local stat-based checks lie under posix acls, ask the remote
  // shell instead.
  let writable = match connection
    .exec(&format!(
      "test -w {}; echo $?",
      shell_escape::escape(Cow::from(path))
    ))
    .await
  {
    Ok(output) => output.trim() == "0",
    Err(_) => false,
  };
  if !writable {
    outcome.errors.push(format!(
      "{path} is not writable, denied keys cannot be removed"
    ));
  }

  let file_scan =
    filter_key_lines(account_name, path, &lines, denied);
  outcome.entries.extend(file_scan.entries);
  outcome.errors.extend(file_scan.errors);

  if file_scan.modified && writable {
    let mut content = file_scan.retained.join("\n");
    content.push('\n');
    if let Err(e) =
      connection.write_file(path, content.as_bytes()).await
    {
      outcome
        .errors
        .push(format!("Failed to rewrite {path}: {e:#}"));
    }
  }
}

/// Result of filtering the lines of one `authorized_keys` file.
#[derive(Debug, Default)]
struct FileScan {
  retained: Vec<String>,
  entries: Vec<KeyEntry>,
  /// A line was dropped, the file needs to be rewritten.
  modified: bool,
  errors: Vec<String>,
}

fn filter_key_lines(
  account_name: &str,
  path: &str,
  lines: &[String],
  denied: &HashSet<String>,
) -> FileScan {
  let mut scan = FileScan::default();
  for (index, line) in lines.iter().enumerate() {
    if line.trim().is_empty() || line.starts_with('#') {
      scan.retained.push(line.clone());
      continue;
    }
    match parse_key_line(line) {
      Some((key_type, keydata, comment)) => {
        if denied.contains(&keydata) {
          scan.modified = true;
        } else {
          scan.retained.push(line.clone());
        }
        // denied keys still count as sightings: the occurrence is
        // removed on the scan after the line is confirmed gone,
        // not while it may still grant access
        scan.entries.push(KeyEntry {
          account_name: account_name.to_string(),
          key_type,
          keydata,
          comment,
        });
      }
      None => {
        scan.errors.push(format!(
          "Failed to parse line {} of {path}",
          index + 1
        ));
        scan.retained.push(line.clone());
      }
    }
  }
  scan
}

/// A missing `authorized_keys` file is only fine when its absence
/// could actually be observed. Probe upward through the parent
/// directories until one exists; an existing but unreadable ancestor
/// means the file may well be there without us seeing it.
async fn check_missing_file(
  connection: &Connection,
  path: &str,
) -> Option<String> {
  let mut dir = parent_dir(path);
  loop {
    match connection.exists(&dir).await {
      Ok(true) => {
        match connection.dir_readable(&dir).await {
          Ok(true) | Err(_) => return None,
          Ok(false) => {
            return Some(format!(
              "Could not check existence of {path} because {dir} \
               is not readable"
            ));
          }
        }
      }
      Ok(false) => {}
      Err(_) => return None,
    }
    if dir == "/" {
      return None;
    }
    dir = parent_dir(&dir);
  }
}

fn parent_dir(path: &str) -> String {
  match path.rfind('/') {
    Some(0) | None => String::from("/"),
    Some(index) => path[..index].to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn passwd_line_parsing() {
    let entry = parse_passwd_line(
      "deploy:x:1001:1001:Deploy:/home/deploy:/bin/bash",
    )
    .unwrap();
    assert_eq!(entry.name, "deploy");
    assert_eq!(entry.home, "/home/deploy");
    assert!(entry.active);

    let inactive = parse_passwd_line(
      "daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin",
    )
    .unwrap();
    assert!(!inactive.active);

    assert!(parse_passwd_line("malformed:line").is_none());
    assert!(parse_passwd_line("").is_none());
  }

  #[test]
  fn key_line_grammar() {
    let (key_type, keydata, comment) = parse_key_line(
      "ssh-rsa AAAAB3NzaC1yc2EAAAADAQAB alice@laptop",
    )
    .unwrap();
    assert_eq!(key_type, "ssh-rsa");
    assert_eq!(keydata, "AAAAB3NzaC1yc2EAAAADAQAB");
    assert_eq!(comment, "alice@laptop");

    // leading options token
    let (key_type, _, comment) = parse_key_line(
      "no-pty ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 backup job",
    )
    .unwrap();
    assert_eq!(key_type, "ssh-ed25519");
    assert_eq!(comment, "backup job");

    // no comment
    let (_, keydata, comment) =
      parse_key_line("ecdsa-sha2-nistp256 AAAAE2VjZHNh").unwrap();
    assert_eq!(keydata, "AAAAE2VjZHNh");
    assert_eq!(comment, "");

    assert!(parse_key_line("ssh-rsa").is_none());
    assert!(parse_key_line("garbage here").is_none());
    assert!(
      parse_key_line("ssh-rsa not*base64*at*all").is_none()
    );
  }

  #[test]
  fn sshd_config_directive() {
    let honors = |config: &[&str]| {
      sshd_config_honors_keys_file(
        &config
          .iter()
          .map(|s| s.to_string())
          .collect::<Vec<_>>(),
      )
    };
    // no directive: default location applies
    assert!(honors(&["Port 22", "PermitRootLogin no"]));
    assert!(honors(&[
      "AuthorizedKeysFile .ssh/authorized_keys"
    ]));
    assert!(honors(&[
      "AuthorizedKeysFile .ssh/authorized_keys .ssh/extra_keys"
    ]));
    assert!(!honors(&[
      "AuthorizedKeysFile /etc/ssh/keys/%u"
    ]));
    // commented out directive does not count
    assert!(honors(&[
      "#AuthorizedKeysFile /etc/ssh/keys/%u"
    ]));
  }

  fn lines(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|line| line.to_string()).collect()
  }

  #[test]
  fn denied_lines_are_stripped_but_still_sighted() {
    let denied = HashSet::from(["BBBB".to_string()]);
    let scan = filter_key_lines(
      "root",
      "/root/.ssh/authorized_keys",
      &lines(&[
        "# provisioned keys above",
        "ssh-rsa AAAA alice@laptop",
        "ssh-rsa BBBB mallory@old",
      ]),
      &denied,
    );
    assert!(scan.modified);
    assert_eq!(
      scan.retained,
      lines(&[
        "# provisioned keys above",
        "ssh-rsa AAAA alice@laptop",
      ])
    );
    // the denied key is still reported as present, its occurrence
    // only goes away once a later scan no longer sees the line
    assert_eq!(scan.entries.len(), 2);
    assert_eq!(scan.entries[1].keydata, "BBBB");
    assert!(scan.errors.is_empty());
  }

  #[test]
  fn clean_file_is_not_marked_modified() {
    let scan = filter_key_lines(
      "deploy",
      "/home/deploy/.ssh/authorized_keys",
      &lines(&["", "ssh-ed25519 CCCC deploy@ci"]),
      &HashSet::new(),
    );
    assert!(!scan.modified);
    assert_eq!(scan.retained.len(), 2);
    assert_eq!(scan.entries.len(), 1);
  }

  #[test]
  fn unparsable_lines_are_kept_and_reported() {
    let scan = filter_key_lines(
      "root",
      "/root/.ssh/authorized_keys",
      &lines(&["ssh-rsa AAAA ok", "garbage here"]),
      &HashSet::new(),
    );
    assert!(!scan.modified);
    assert_eq!(scan.retained.len(), 2);
    assert_eq!(scan.entries.len(), 1);
    assert_eq!(
      scan.errors,
      vec![
        "Failed to parse line 2 of /root/.ssh/authorized_keys"
          .to_string()
      ]
    );
  }

  #[test]
  fn parent_dir_walks_to_root() {
    assert_eq!(
      parent_dir("/home/deploy/.ssh/authorized_keys"),
      "/home/deploy/.ssh"
    );
    assert_eq!(parent_dir("/home"), "/");
    assert_eq!(parent_dir("/"), "/");
  }
}
