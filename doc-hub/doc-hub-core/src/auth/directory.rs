use super::{RoleRef, Subject, ADMINS_ID, ADMINS_NAME, ROOT_ID, ROOT_NAME, USERS_ID, USERS_NAME};
use crate::db::{Database, DbError, FindOptions};
use crate::document::{fields, Document};
use crate::filter::Filter;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectRecord {
    pub id: String,
    pub name: String,
    /// `user`, `role` or `customer`.
    pub kind: String,
    pub disabled: bool,
    pub locked: bool,
}

impl SubjectRecord {
    fn well_known(id: &str) -> Option<Self> {
        let (name, kind) = match id {
            ROOT_ID => (ROOT_NAME, "user"),
            ADMINS_ID => (ADMINS_NAME, "role"),
            USERS_ID => (USERS_NAME, "role"),
            _ => return None,
        };
        Some(Self {
            id: id.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            disabled: false,
            locked: false,
        })
    }

    fn from_document(doc: &Document) -> Option<Self> {
        Some(Self {
            id: doc.id()?.to_string(),
            name: doc.str_field("name").unwrap_or_default().to_string(),
            kind: doc.doc_type().unwrap_or("unknown").to_string(),
            disabled: doc.bool_field("disabled"),
            locked: doc.bool_field("dblocked"),
        })
    }
}

/// Resolves subject ids to names and role memberships.
#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    async fn lookup(&self, id: &str) -> Result<Option<SubjectRecord>, DbError>;

    /// Every role `id` belongs to, directly or through nested roles.
    async fn roles_of(&self, id: &str) -> Result<Vec<RoleRef>, DbError>;

    async fn resolve(&self, id: &str) -> Result<Option<Subject>, DbError> {
        let Some(record) = self.lookup(id).await? else {
            return Ok(None);
        };
        let mut subject = Subject::new(record.id, record.name);
        subject.roles = self.roles_of(id).await?;
        Ok(Some(subject))
    }
}

/// Directory backed by the subject collection. Roles are documents of
/// type `role` whose `members` list holds `{_id, name}` entries.
pub struct DatabaseDirectory {
    db: Arc<dyn Database>,
    collection: String,
}

impl DatabaseDirectory {
    pub fn new(db: Arc<dyn Database>, collection: impl Into<String>) -> Self {
        Self {
            db,
            collection: collection.into(),
        }
    }
}

#[async_trait]
impl SubjectDirectory for DatabaseDirectory {
    async fn lookup(&self, id: &str) -> Result<Option<SubjectRecord>, DbError> {
        let found = self.db.find_one(&self.collection, &Filter::id(id)).await?;
        Ok(found
            .as_ref()
            .and_then(SubjectRecord::from_document)
            .or_else(|| SubjectRecord::well_known(id)))
    }

    async fn roles_of(&self, id: &str) -> Result<Vec<RoleRef>, DbError> {
        let mut seen: HashSet<String> = HashSet::from([id.to_string()]);
        let mut roles = Vec::new();
        let mut frontier = vec![Value::String(id.to_string())];
        while !frontier.is_empty() {
            let filter = Filter::and([
                Filter::eq(fields::TYPE, "role"),
                Filter::In("members._id".to_string(), std::mem::take(&mut frontier)),
            ]);
            let found = self
                .db
                .find(&self.collection, &filter, &FindOptions::default())
                .await?;
            for role in found {
                let Some(role_id) = role.id() else { continue };
                if !seen.insert(role_id.to_string()) {
                    continue;
                }
                let name = role.str_field("name").unwrap_or_default();
                roles.push(RoleRef::new(role_id, name));
                frontier.push(Value::String(role_id.to_string()));
            }
        }
        Ok(roles)
    }
}
