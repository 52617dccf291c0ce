//! Authenticated identities: subjects with their role memberships, the
//! well-known subjects, bearer-token verification and the subject
//! directory used to resolve ids to names and roles.

mod directory;
mod token;

pub use directory::{DatabaseDirectory, SubjectDirectory, SubjectRecord};
pub use token::{Claims, Hs256Verifier, TokenVerifier};

use serde::{Deserialize, Serialize};

pub const ROOT_ID: &str = "59f1f6e6f0a22200126638d8";
pub const ROOT_NAME: &str = "root";
pub const ADMINS_ID: &str = "5a1702fa245d9013697656fb";
pub const ADMINS_NAME: &str = "admins";
pub const USERS_ID: &str = "5a17f157c4815318c8536c21";
pub const USERS_NAME: &str = "users";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl RoleRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// The identity an operation runs as.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<RoleRef>,
}

impl Subject {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            roles: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new(ROOT_ID, ROOT_NAME)
    }

    pub fn with_role(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        let role = RoleRef::new(id, name);
        if !self.roles.iter().any(|r| r.id == role.id) {
            self.roles.push(role);
        }
        self
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    pub fn has_role(&self, role_id: &str) -> bool {
        self.roles.iter().any(|r| r.id == role_id)
    }

    /// Root and members of the administrators role bypass ACL checks.
    pub fn is_admin(&self) -> bool {
        self.is_root() || self.id == ADMINS_ID || self.has_role(ADMINS_ID)
    }

    /// The subject's own id followed by every role id.
    pub fn principal_ids(&self) -> Vec<String> {
        std::iter::once(self.id.clone())
            .chain(self.roles.iter().map(|r| r.id.clone()))
            .collect()
    }
}
