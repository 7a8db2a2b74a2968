//! Bounded history of cross-platform message identities.
//!
//! Every logical message the dispatcher mirrors is remembered as a
//! [`MessageTuple`]: the set of platform-local message ids that represent the
//! same message everywhere it was delivered. Reply chains link tuples through
//! arena handles ([`TupleId`]) rather than pointers; the dispatcher owns the
//! whole structure exclusively, so no locking is involved.

use std::collections::VecDeque;
use std::fmt;

use crate::model::{MessageType, Source};

/// Default number of tuples a room remembers before evicting the oldest.
pub const DEFAULT_CAPACITY: usize = 500;

/// Stable handle of a tuple within its owning [`History`]. Handles are never
/// reused, so a stale handle simply stops resolving after eviction.
pub type TupleId = u64;

/// The address of one physical message on one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Platform-returned message id; empty when the mirror send failed.
    pub id: String,
    pub channel_id: String,
    pub source: Source,
}

impl MessageRecord {
    pub fn new(id: impl Into<String>, channel_id: impl Into<String>, source: Source) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            source,
        }
    }
}

/// One logical event as observed across all platforms of a room.
///
/// The first record is always the origin message that entered the
/// dispatcher; one more record is appended per peer delivery, with an empty
/// id when that delivery failed (kept so later edits can still be attempted).
#[derive(Debug)]
pub struct MessageTuple {
    id: TupleId,
    pub kind: MessageType,
    pub records: Vec<MessageRecord>,
    parent: Option<TupleId>,
    child: Option<TupleId>,
}

impl MessageTuple {
    /// Start a tuple from its origin record. The handle is assigned when the
    /// tuple is pushed into a [`History`].
    pub fn new(kind: MessageType, origin: MessageRecord) -> Self {
        Self {
            id: 0,
            kind,
            records: vec![origin],
            parent: None,
            child: None,
        }
    }

    pub fn id(&self) -> TupleId {
        self.id
    }

    pub fn parent(&self) -> Option<TupleId> {
        self.parent
    }

    pub fn child(&self) -> Option<TupleId> {
        self.child
    }

    pub fn push_record(&mut self, record: MessageRecord) {
        self.records.push(record);
    }

    /// Whether this tuple holds `message_id` for the given platform channel.
    pub fn has_record(&self, source: Source, channel_id: &str, message_id: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.source == source && r.channel_id == channel_id && r.id == message_id)
    }

    fn find_record(&self, source: Source, channel_id: &str) -> Option<&MessageRecord> {
        self.records
            .iter()
            .find(|r| r.source == source && r.channel_id == channel_id)
    }
}

impl fmt::Display for MessageTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{} [", self.kind)?;
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}|{}|{}", record.source, record.channel_id, record.id)?;
        }
        f.write_str("]}")
    }
}

/// Ordered, bounded container of message tuples.
#[derive(Debug)]
pub struct History {
    tuples: VecDeque<MessageTuple>,
    capacity: usize,
    next_id: TupleId,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            tuples: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Append a tuple, evicting the oldest one first when at capacity.
    /// Returns the handle assigned to the stored tuple.
    pub fn push(&mut self, mut tuple: MessageTuple) -> TupleId {
        if self.tuples.len() >= self.capacity {
            if let Some(evicted) = self.tuples.pop_front() {
                self.clear_links_to(evicted.id);
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        tuple.id = id;
        self.tuples.push_back(tuple);
        id
    }

    /// First match scanning from the tail backwards, so recent tuples win
    /// over older ones that collide on the same platform id.
    pub fn search_back(&self, pred: impl Fn(&MessageTuple) -> bool) -> Option<&MessageTuple> {
        self.tuples.iter().rev().find(|t| pred(t))
    }

    /// Tail-backwards search that removes the match, rewiring its reply
    /// neighbours around the gap.
    pub fn delete_back(
        &mut self,
        pred: impl Fn(&MessageTuple) -> bool,
    ) -> Option<MessageTuple> {
        let index = self.tuples.iter().rposition(pred)?;
        let removed = self.tuples.remove(index)?;
        if let Some(parent) = removed.parent.and_then(|id| self.get_mut(id)) {
            parent.child = removed.child;
        }
        if let Some(child) = removed.child.and_then(|id| self.get_mut(id)) {
            child.parent = removed.parent;
        }
        Some(removed)
    }

    pub fn get(&self, id: TupleId) -> Option<&MessageTuple> {
        self.tuples.iter().find(|t| t.id == id)
    }

    fn get_mut(&mut self, id: TupleId) -> Option<&mut MessageTuple> {
        self.tuples.iter_mut().find(|t| t.id == id)
    }

    /// Clear any dangling parent/child reply links pointing at a tuple that
    /// is no longer stored (e.g. just evicted).
    fn clear_links_to(&mut self, id: TupleId) {
        for tuple in self.tuples.iter_mut() {
            if tuple.parent == Some(id) {
                tuple.parent = None;
            }
            if tuple.child == Some(id) {
                tuple.child = None;
            }
        }
    }

    /// Attach `child` as the most recent reply to `parent`. A later reply to
    /// the same parent overwrites the link; the superseded sibling stays
    /// findable by linear search until it is evicted.
    pub fn link_reply(&mut self, parent: TupleId, child: TupleId) {
        if let Some(tuple) = self.get_mut(child) {
            tuple.parent = Some(parent);
        }
        if let Some(tuple) = self.get_mut(parent) {
            tuple.child = Some(child);
        }
    }

    /// Resolve the message id a peer knows a tuple by.
    ///
    /// Slack threads address every reply by the root message's timestamp, so
    /// for Slack peers the reply chain is walked up to its root tuple before
    /// the records are searched. Records with empty ids (failed mirrors) do
    /// not resolve.
    pub fn peer_message_id(
        &self,
        tuple: TupleId,
        source: Source,
        channel_id: &str,
    ) -> Option<String> {
        self.get(tuple)
            .and_then(|t| self.peer_message_id_of(t, source, channel_id))
    }

    /// Same as [`peer_message_id`](Self::peer_message_id), but starting from
    /// a tuple that may already have been detached from the history (a just
    /// deleted one still carries its parent handle).
    pub fn peer_message_id_of(
        &self,
        tuple: &MessageTuple,
        source: Source,
        channel_id: &str,
    ) -> Option<String> {
        let mut current = tuple;
        if source == Source::Slack {
            // Parents are always older than their children, so the walk is
            // bounded by the history length.
            let mut steps = self.tuples.len();
            while let Some(parent) = current.parent.and_then(|id| self.get(id)) {
                current = parent;
                steps = steps.saturating_sub(1);
                if steps == 0 {
                    break;
                }
            }
        }
        current
            .find_record(source, channel_id)
            .filter(|r| !r.id.is_empty())
            .map(|r| r.id.clone())
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, tuple) in self.tuples.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{tuple}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(kind: MessageType, id: &str, channel: &str, source: Source) -> MessageTuple {
        MessageTuple::new(kind, MessageRecord::new(id, channel, source))
    }

    #[test]
    fn push_evicts_oldest_at_capacity() {
        let mut history = History::new(2);
        history.push(tuple(MessageType::TextCreate, "1", "C", Source::Slack));
        history.push(tuple(MessageType::TextCreate, "2", "C", Source::Slack));
        history.push(tuple(MessageType::TextCreate, "3", "C", Source::Slack));

        assert_eq!(history.len(), 2);
        assert!(history.search_back(|t| t.has_record(Source::Slack, "C", "1")).is_none());
        assert!(history.search_back(|t| t.has_record(Source::Slack, "C", "3")).is_some());
    }

    #[test]
    fn search_back_prefers_recent_tuples() {
        let mut history = History::new(10);
        let first = history.push(tuple(MessageType::TextCreate, "dup", "C", Source::Slack));
        let second = history.push(tuple(MessageType::TextUpdate, "dup", "C", Source::Slack));

        let found = history
            .search_back(|t| t.has_record(Source::Slack, "C", "dup"))
            .unwrap();
        assert_eq!(found.id(), second);
        assert_ne!(found.id(), first);
    }

    #[test]
    fn delete_back_removes_and_rewires_chain() {
        let mut history = History::new(10);
        let root = history.push(tuple(MessageType::TextCreate, "a", "C", Source::Slack));
        let middle = history.push(tuple(MessageType::TextReply, "b", "C", Source::Slack));
        let leaf = history.push(tuple(MessageType::TextReply, "c", "C", Source::Slack));
        history.link_reply(root, middle);
        history.link_reply(middle, leaf);

        let removed = history
            .delete_back(|t| t.has_record(Source::Slack, "C", "b"))
            .unwrap();
        assert_eq!(removed.id(), middle);
        assert_eq!(history.get(root).unwrap().child(), Some(leaf));
        assert_eq!(history.get(leaf).unwrap().parent(), Some(root));
    }

    #[test]
    fn delete_back_misses_return_none() {
        let mut history = History::new(10);
        history.push(tuple(MessageType::TextCreate, "a", "C", Source::Slack));
        assert!(history
            .delete_back(|t| t.has_record(Source::Slack, "C", "zzz"))
            .is_none());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn eviction_clears_dangling_links() {
        let mut history = History::new(2);
        let root = history.push(tuple(MessageType::TextCreate, "a", "C", Source::Slack));
        let reply = history.push(tuple(MessageType::TextReply, "b", "C", Source::Slack));
        history.link_reply(root, reply);

        // Third push evicts the root.
        history.push(tuple(MessageType::TextCreate, "c", "C", Source::Slack));
        assert!(history.get(root).is_none());
        assert_eq!(history.get(reply).unwrap().parent(), None);
    }

    #[test]
    fn slack_lookup_walks_to_thread_root() {
        let mut history = History::new(10);

        let mut root_tuple = tuple(MessageType::TextCreate, "s-root", "CS", Source::Slack);
        root_tuple.push_record(MessageRecord::new("d-root", "CD", Source::Discord));
        let root = history.push(root_tuple);

        let mut reply_tuple = tuple(MessageType::TextReply, "d-reply", "CD", Source::Discord);
        reply_tuple.push_record(MessageRecord::new("s-reply", "CS", Source::Slack));
        let reply = history.push(reply_tuple);
        history.link_reply(root, reply);

        // Slack peers resolve through the thread root; everyone else stays
        // on the reply tuple itself.
        assert_eq!(
            history.peer_message_id(reply, Source::Slack, "CS"),
            Some("s-root".to_string())
        );
        assert_eq!(
            history.peer_message_id(reply, Source::Discord, "CD"),
            Some("d-reply".to_string())
        );
    }

    #[test]
    fn slack_walk_terminates_on_long_chains() {
        let mut history = History::new(64);
        let mut previous = None;
        for i in 0..32 {
            let mut t = tuple(MessageType::TextReply, &format!("d{i}"), "CD", Source::Discord);
            t.push_record(MessageRecord::new(format!("s{i}"), "CS", Source::Slack));
            let id = history.push(t);
            if let Some(parent) = previous {
                history.link_reply(parent, id);
            }
            previous = Some(id);
        }
        assert_eq!(
            history.peer_message_id(previous.unwrap(), Source::Slack, "CS"),
            Some("s0".to_string())
        );
    }

    #[test]
    fn empty_record_ids_do_not_resolve() {
        let mut history = History::new(10);
        let mut t = tuple(MessageType::TextCreate, "s1", "CS", Source::Slack);
        t.push_record(MessageRecord::new("", "CD", Source::Discord));
        let id = history.push(t);

        assert_eq!(history.peer_message_id(id, Source::Discord, "CD"), None);
        assert_eq!(
            history.peer_message_id(id, Source::Slack, "CS"),
            Some("s1".to_string())
        );
    }

    #[test]
    fn display_is_deterministic() {
        let mut history = History::new(10);
        let mut t = tuple(MessageType::TextCreate, "1700.001", "CS", Source::Slack);
        t.push_record(MessageRecord::new("42", "CD", Source::Discord));
        history.push(t);

        assert_eq!(
            history.to_string(),
            "[{create [Slack|CS|1700.001 Discord|CD|42]}]"
        );
    }
}
