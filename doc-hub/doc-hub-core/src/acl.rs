//! Bit-encoded rights and access-control entries.
//!
//! Pure values, no I/O. Rights are persisted as a plain integer; the
//! `FullControl` sentinel is the all-ones value and satisfies every
//! per-bit check.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single grantable right.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Right {
    Create,
    Read,
    Update,
    Delete,
    Invoke,
    FullControl,
}

impl Right {
    pub const ALL: [Right; 5] = [
        Right::Create,
        Right::Read,
        Right::Update,
        Right::Delete,
        Right::Invoke,
    ];

    /// Zero-based bit position, `None` for the full-control sentinel.
    pub fn bit(self) -> Option<u32> {
        match self {
            Right::Create => Some(0),
            Right::Read => Some(1),
            Right::Update => Some(2),
            Right::Delete => Some(3),
            Right::Invoke => Some(4),
            Right::FullControl => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Right::Create => "create",
            Right::Read => "read",
            Right::Update => "update",
            Right::Delete => "delete",
            Right::Invoke => "invoke",
            Right::FullControl => "full_control",
        }
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitset of rights.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rights(u32);

impl Rights {
    pub const NONE: Rights = Rights(0);
    pub const FULL_CONTROL: Rights = Rights(u32::MAX);

    pub fn from_bits(bits: u32) -> Self {
        Rights(bits)
    }

    pub fn of(rights: &[Right]) -> Self {
        let mut out = Rights::NONE;
        for right in rights {
            out.set(*right);
        }
        out
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn set(&mut self, right: Right) {
        match right.bit() {
            Some(bit) => self.0 |= 1 << bit,
            None => self.reset_to_full_control(),
        }
    }

    pub fn unset(&mut self, right: Right) {
        match right.bit() {
            Some(bit) => self.0 &= !(1 << bit),
            None => self.reset_to_none(),
        }
    }

    pub fn is_set(self, right: Right) -> bool {
        match right.bit() {
            Some(bit) => self.0 & (1 << bit) != 0,
            None => self == Rights::FULL_CONTROL,
        }
    }

    pub fn reset_to_none(&mut self) {
        self.0 = 0;
    }

    pub fn reset_to_full_control(&mut self) {
        self.0 = u32::MAX;
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Every bit of `other` is set in `self`.
    pub fn contains_all(self, other: Rights) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Rights) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: Rights) -> Rights {
        Rights(self.0 | other.0)
    }
}

impl fmt::Debug for Rights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Rights::FULL_CONTROL {
            return f.write_str("Rights(full_control)");
        }
        let names: Vec<&str> = Right::ALL
            .iter()
            .filter(|r| self.is_set(**r))
            .map(|r| r.as_str())
            .collect();
        write!(f, "Rights({})", names.join("|"))
    }
}

/// Access-control entry: grants (or denies) `rights` to one subject.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ace {
    #[serde(rename = "_id")]
    pub subject_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deny: bool,
    pub rights: Rights,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Ace {
    pub fn allow(subject_id: impl Into<String>, name: impl Into<String>, rights: Rights) -> Self {
        Self {
            subject_id: subject_id.into(),
            name: name.into(),
            deny: false,
            rights,
        }
    }

    pub fn deny(subject_id: impl Into<String>, name: impl Into<String>, rights: Rights) -> Self {
        Self {
            deny: true,
            ..Self::allow(subject_id, name, rights)
        }
    }

    pub fn same_key(&self, other: &Ace) -> bool {
        self.subject_id == other.subject_id && self.deny == other.deny
    }

    /// OR the rights of two entries for the same `(subject, deny)` pair.
    pub fn merge(a: &Ace, b: &Ace) -> Option<Ace> {
        if !a.same_key(b) {
            return None;
        }
        let name = if a.name.is_empty() { b.name.clone() } else { a.name.clone() };
        Some(Ace {
            subject_id: a.subject_id.clone(),
            name,
            deny: a.deny,
            rights: a.rights.union(b.rights),
        })
    }
}
