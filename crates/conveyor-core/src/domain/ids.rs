//! Domain identifiers (strongly-typed IDs).
//!
//! IDs are ULID based: sortable by creation time, generated without
//! coordination, 128-bit. `Id<T>` carries a phantom marker so a task id can
//! never be confused with another kind of id at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for id kinds. Supplies the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID id.
///
/// `T` is a zero-sized marker, so `Id<T>` has the same size as `Ulid`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Parse error for ids.
#[derive(Debug, thiserror::Error)]
#[error("invalid id '{input}': {reason}")]
pub struct ParseIdError {
    input: String,
    reason: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// Accepts both the prefixed display form (`task-01H...`) and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|e| ParseIdError {
                input: s.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Marker for tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Identifier of a persisted task.
pub type TaskId = Id<Task>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_has_prefix() {
        let ulid = Ulid::new();
        let id = TaskId::from_ulid(ulid);
        assert_eq!(id.to_string(), format!("task-{ulid}"));
        assert_eq!(id.as_ulid(), ulid);
    }

    #[test]
    fn parses_prefixed_and_bare_forms() {
        let id = TaskId::from_ulid(Ulid::new());
        let prefixed: TaskId = id.to_string().parse().unwrap();
        let bare: TaskId = id.as_ulid().to_string().parse().unwrap();
        assert_eq!(prefixed, id);
        assert_eq!(bare, id);
        assert!("task-not-a-ulid".parse::<TaskId>().is_err());
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());
        assert!(id1 < id2);
    }

    #[test]
    fn serializes_as_bare_ulid() {
        let id = TaskId::from_ulid(Ulid::new());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_ulid()));
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        assert_eq!(std::mem::size_of::<TaskId>(), std::mem::size_of::<Ulid>());
    }
}
