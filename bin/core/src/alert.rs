use std::sync::Arc;

use async_trait::async_trait;
use keywarden_client::entities::{
  external_key::{ExternalKey, ExternalKeyOccurrence},
  server::Server,
};

use crate::interfaces::{Notifier, ServerDirectory};

/// Notification sink resolving the responsible admins for each
/// sighting and emitting the alert into the log stream. The mail
/// frontend consumes the same registry events on its own side.
pub struct LogNotifier {
  directory: Arc<dyn ServerDirectory>,
}

impl LogNotifier {
  pub fn new(directory: Arc<dyn ServerDirectory>) -> LogNotifier {
    LogNotifier { directory }
  }
}

#[async_trait]
impl Notifier for LogNotifier {
  async fn notify_new_key_appeared(
    &self,
    key: &ExternalKey,
    occurrences: &[ExternalKeyOccurrence],
  ) {
    for occurrence in occurrences {
      let server = match self
        .directory
        .get_server_by_id(&occurrence.server)
        .await
      {
        Ok(Some(server)) => server,
        Ok(None) => continue,
        Err(e) => {
          warn!(
            "could not resolve server {} for key alert: {e:#}",
            occurrence.server
          );
          continue;
        }
      };
      let recipients =
        recipients_for(&server, &occurrence.account_name);
      let recipients = recipients
        .iter()
        .map(|(email, _)| email.as_str())
        .collect::<Vec<_>>()
        .join(", ");
      info!(
        "new external key {} {} appeared for {}@{}, \
         responsible admins: {recipients}",
        key.key_type,
        key.keydata,
        occurrence.account_name,
        server.hostname
      );
    }
  }
}

/// Admins responsible for a sighting: the admins of the owning
/// account when the account is known, otherwise the server admins.
fn recipients_for(
  server: &Server,
  account_name: &str,
) -> Vec<(String, String)> {
  let mut recipients = Vec::new();
  if let Some(account) = server
    .accounts
    .iter()
    .find(|account| account.name == account_name)
  {
    for admin in &account.admins {
      admin.collect_emails(&mut recipients);
    }
  }
  if recipients.is_empty() {
    for admin in &server.admins {
      admin.collect_emails(&mut recipients);
    }
  }
  recipients
}

#[cfg(test)]
mod tests {
  use keywarden_client::entities::{
    entity::Entity, server::ServerAccount,
  };

  use super::*;

  fn user(name: &str, email: &str) -> Entity {
    Entity::User {
      name: name.to_string(),
      email: email.to_string(),
    }
  }

  fn server() -> Server {
    Server {
      id: "srv1".to_string(),
      hostname: "app01".to_string(),
      accounts: vec![ServerAccount {
        name: "deploy".to_string(),
        admins: vec![Entity::Group {
          name: "deployers".to_string(),
          members: vec![
            user("alice", "alice@example.org"),
            user("bob", "bob@example.org"),
            // duplicate through group nesting
            user("alice", "alice@example.org"),
          ],
        }],
      }],
      admins: vec![user("carol", "carol@example.org")],
      ..Default::default()
    }
  }

  #[test]
  fn account_admins_take_precedence() {
    let recipients = recipients_for(&server(), "deploy");
    assert_eq!(
      recipients,
      vec![
        (
          "alice@example.org".to_string(),
          "alice".to_string()
        ),
        ("bob@example.org".to_string(), "bob".to_string()),
      ]
    );
  }

  #[test]
  fn unknown_account_falls_back_to_server_admins() {
    let recipients = recipients_for(&server(), "root");
    assert_eq!(
      recipients,
      vec![(
        "carol@example.org".to_string(),
        "carol".to_string()
      )]
    );
  }
}
