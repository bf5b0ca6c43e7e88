//! Mock broker handler tables.
//!
//! Entries are keyed by a monotonic registration id, so removing one never
//! shifts or invalidates the ids of the others. Matching returns a cloned
//! snapshot, letting the caller release the table lock before invoking
//! anything.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use super::Responder;

/// Handler for `send` frames; may answer through the [`Responder`].
pub type SendHandler = Arc<dyn Fn(&Value, &Responder) + Send + Sync>;

/// Handler for `publish` frames. Cannot respond.
pub type PublishHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Registration id of a send handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendHandlerId(pub(crate) u64);

/// Registration id of a publish handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublishHandlerId(pub(crate) u64);

/// Address-filtered handlers in registration order.
pub(crate) struct HandlerTable<H> {
    entries: BTreeMap<u64, (String, H)>,
    next_id: u64,
}

impl<H> Default for HandlerTable<H> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl<H: Clone> HandlerTable<H> {
    pub(crate) fn insert(&mut self, address: String, handler: H) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, (address, handler));
        id
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Every handler registered on exactly `address`, oldest first.
    pub(crate) fn matching(&self, address: &str) -> Vec<H> {
        self.entries
            .values()
            .filter(|(registered, _)| registered == address)
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_survive_removal() {
        let mut table: HandlerTable<&str> = HandlerTable::default();
        let first = table.insert("a".into(), "one");
        let second = table.insert("a".into(), "two");
        let third = table.insert("b".into(), "three");

        assert!(table.remove(second));
        assert!(!table.remove(second));
        let fourth = table.insert("a".into(), "four");

        assert_eq!((first, third, fourth), (1, 3, 4));
        assert_eq!(table.matching("a"), vec!["one", "four"]);
        assert_eq!(table.matching("b"), vec!["three"]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_matching_filters_by_exact_address() {
        let mut table: HandlerTable<u8> = HandlerTable::default();
        table.insert("echo".into(), 1);
        table.insert("echo.other".into(), 2);
        table.insert("echo".into(), 3);
        assert_eq!(table.matching("echo"), vec![1, 3]);
        assert!(table.matching("missing").is_empty());
    }
}
