//! Completion-event routing.
//!
//! Each binding gets an [`EventTag`] that maps to the object waiting on
//! it. The tag is released when the binding's terminal event has been
//! handled; an event whose tag is unknown means buffer or identity
//! confusion and is reported as a protocol violation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bulk::BulkShared;
use crate::message::{ReplyState, RequestBuffer, RequestShared};
use crate::router_checker::RcdId;

/// Opaque per-binding tag carried by every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTag(pub u64);

/// Object an event is delivered to.
#[derive(Clone)]
pub(crate) enum EventTarget {
    /// Outgoing request buffer.
    RequestOut(Arc<RequestShared>),
    /// Reply buffer of an outgoing request.
    ReplyIn(Arc<RequestShared>),
    /// Service request buffer.
    RequestIn(Arc<RequestBuffer>),
    /// Outgoing reply.
    ReplyOut(Arc<ReplyState>),
    /// Bulk descriptor, either side.
    Bulk(Arc<BulkShared>),
    /// Router checker ping buffer.
    RouterCheck(RcdId),
}

impl EventTarget {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            EventTarget::RequestOut(_) => "request-out",
            EventTarget::ReplyIn(_) => "reply-in",
            EventTarget::RequestIn(_) => "request-in",
            EventTarget::ReplyOut(_) => "reply-out",
            EventTarget::Bulk(_) => "bulk",
            EventTarget::RouterCheck(_) => "router-check",
        }
    }
}

/// Tag allocator and tag → target map.
pub(crate) struct EventTable {
    next: AtomicU64,
    targets: DashMap<EventTag, EventTarget>,
}

impl EventTable {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            targets: DashMap::new(),
        }
    }

    /// Allocates a tag for `target`.
    pub(crate) fn register(&self, target: EventTarget) -> EventTag {
        let tag = EventTag(self.next.fetch_add(1, Ordering::Relaxed));
        self.targets.insert(tag, target);
        tag
    }

    pub(crate) fn lookup(&self, tag: EventTag) -> Option<EventTarget> {
        self.targets.get(&tag).map(|entry| entry.value().clone())
    }

    /// Forgets a tag after its terminal event, or after a binding attempt failed.
    pub(crate) fn release(&self, tag: EventTag) {
        self.targets.remove(&tag);
    }

    pub(crate) fn live(&self) -> usize {
        self.targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_unique_and_released() {
        let table = EventTable::new();
        let a = table.register(EventTarget::RouterCheck(RcdId(1)));
        let b = table.register(EventTarget::RouterCheck(RcdId(2)));
        assert_ne!(a, b);
        assert_eq!(table.live(), 2);

        assert!(matches!(table.lookup(a), Some(EventTarget::RouterCheck(RcdId(1)))));
        table.release(a);
        assert!(table.lookup(a).is_none());
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn test_target_names() {
        assert_eq!(EventTarget::RouterCheck(RcdId(9)).name(), "router-check");
    }
}
