//! Chunked message transport.
//!
//! A logical [`Message`] travels as one or more [`Fragment`]s sharing its
//! id. The sending side splits the payload into `package_size` pieces; the
//! receiving side buffers pieces per id in a [`Reassembler`] until all
//! `count` have arrived. A [`Connection`] adds request/reply correlation,
//! watch subscriptions and liveness on top.

mod connection;
mod reassembly;
mod registry;

#[cfg(test)]
mod tests;

pub use connection::{run_heartbeat, run_writer, Connection};
pub use reassembly::Reassembler;
pub use registry::ConnectionRegistry;

use crate::error::{StoreError, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// One frame on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub command: String,
    #[serde(default)]
    pub data: String,
    pub index: usize,
    pub count: usize,
}

impl Fragment {
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::MalformedFrame(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::MalformedFrame(e.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    /// Set on replies and one-way deliveries. Messages without it expect a reply.
    pub reply_to: Option<String>,
    pub command: String,
    pub data: String,
}

impl Message {
    pub fn request(command: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            reply_to: None,
            command: command.into(),
            data: data.into(),
        }
    }

    /// A one-way delivery. It replies to itself so the peer never waits on it.
    pub fn notification(command: impl Into<String>, data: impl Into<String>) -> Self {
        let mut msg = Self::request(command, data);
        msg.reply_to = Some(msg.id.clone());
        msg
    }

    pub fn reply(&self, data: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            reply_to: Some(self.id.clone()),
            command: self.command.clone(),
            data: data.into(),
        }
    }

    pub fn error_reply(&self, err: &StoreError) -> Self {
        self.reply(json!({"error": err.to_string(), "kind": err.kind()}).to_string())
    }

    /// The error carried by a reply, if its data is an object with a
    /// non-null `error` field.
    pub fn error(&self) -> Option<String> {
        let value: Value = serde_json::from_str(&self.data).ok()?;
        match value.get("error")? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Split into fragments of at most `package_size` bytes of data,
    /// never cutting a UTF-8 sequence. An empty payload still yields one fragment.
    pub fn into_fragments(self, package_size: usize) -> Vec<Fragment> {
        let size = package_size.max(1);
        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        for ch in self.data.chars() {
            if !current.is_empty() && current.len() + ch.len_utf8() > size {
                chunks.push(std::mem::take(&mut current));
            }
            current.push(ch);
        }
        if !current.is_empty() || chunks.is_empty() {
            chunks.push(current);
        }

        let count = chunks.len();
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, data)| Fragment {
                message_id: self.id.clone(),
                reply_to: self.reply_to.clone(),
                command: self.command.clone(),
                data,
                index,
                count,
            })
            .collect()
    }
}
