use serde::{Deserialize, Serialize};

/// Closed set of principal kinds referenced by admin lists.
/// Resolved by pattern match wherever the supervision core needs to
/// route information to people.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
  User {
    name: String,
    email: String,
  },
  Group {
    name: String,
    members: Vec<Entity>,
  },
  ServerAccount {
    server_id: String,
    name: String,
    admins: Vec<Entity>,
  },
}

impl Entity {
  /// Collect the email addresses of all users reachable through
  /// this entity, depth first.
  pub fn collect_emails(&self, out: &mut Vec<(String, String)>) {
    match self {
      Entity::User { name, email } => {
        if !out.iter().any(|(mail, _)| mail == email) {
          out.push((email.clone(), name.clone()));
        }
      }
      Entity::Group { members, .. } => {
        for member in members {
          member.collect_emails(out);
        }
      }
      Entity::ServerAccount { admins, .. } => {
        for admin in admins {
          admin.collect_emails(out);
        }
      }
    }
  }
}
