use super::{Fragment, Message};
use crate::error::TransportError;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Messages one peer may have in flight at once unless configured otherwise.
pub const DEFAULT_MAX_PENDING: usize = 256;

struct Partial {
    count: usize,
    started: u64,
    parts: BTreeMap<usize, Fragment>,
}

/// Buffers inbound fragments per message id until the message is complete.
pub struct Reassembler {
    limit: usize,
    max_pending: usize,
    started: u64,
    pending: HashMap<String, Partial>,
}

impl Reassembler {
    /// `limit` bounds the fragments one message may span.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            max_pending: DEFAULT_MAX_PENDING,
            started: 0,
            pending: HashMap::new(),
        }
    }

    /// Bound the messages buffered at once. Starting one more drops the
    /// oldest incomplete message.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    /// Buffer `fragment`. Returns the message once its last fragment has
    /// arrived. A repeated index replaces the earlier copy.
    pub fn push(&mut self, fragment: Fragment) -> Result<Option<Message>, TransportError> {
        if fragment.count == 0 || fragment.index >= fragment.count {
            return Err(TransportError::MalformedFrame(format!(
                "fragment {} of {} for {}",
                fragment.index, fragment.count, fragment.message_id
            )));
        }
        if fragment.count > self.limit {
            self.pending.remove(&fragment.message_id);
            return Err(TransportError::BufferOverflow {
                id: fragment.message_id,
                limit: self.limit,
            });
        }

        let id = fragment.message_id.clone();
        if !self.pending.contains_key(&id) {
            self.make_room();
        }
        self.started += 1;
        let started = self.started;
        let partial = self.pending.entry(id.clone()).or_insert_with(|| Partial {
            count: fragment.count,
            started,
            parts: BTreeMap::new(),
        });
        if partial.count != fragment.count {
            self.pending.remove(&id);
            return Err(TransportError::MalformedFrame(format!(
                "fragment count for {id} changed mid-message"
            )));
        }
        partial.parts.insert(fragment.index, fragment);
        if partial.parts.len() < partial.count {
            return Ok(None);
        }

        let Some(partial) = self.pending.remove(&id) else {
            return Ok(None);
        };
        let mut parts = partial.parts.into_values();
        let Some(first) = parts.next() else {
            return Ok(None);
        };
        let mut data = first.data;
        for part in parts {
            data.push_str(&part.data);
        }
        Ok(Some(Message {
            id,
            reply_to: first.reply_to,
            command: first.command,
            data,
        }))
    }

    fn make_room(&mut self) {
        while self.pending.len() >= self.max_pending {
            let Some(oldest) = self
                .pending
                .iter()
                .min_by_key(|(_, p)| p.started)
                .map(|(id, _)| id.clone())
            else {
                return;
            };
            debug!(message = %oldest, "dropping oldest incomplete message");
            self.pending.remove(&oldest);
        }
    }

    /// Messages with fragments still outstanding.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
