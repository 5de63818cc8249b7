//! Small bounded caches plus the echo-suppression set (spec.md §4.5, §9).
//!
//! The reference trims these with a simple size-cap LRU; this evicts per-session on
//! `session.idle`/`session.error` and keeps the size cap only as a backstop for sessions
//! that are torn down uncleanly (spec.md §9 "the size cap is a band-aid").

use std::collections::HashMap;

const CAP: usize = 100;
const TRIM_TO: usize = 50;

/// Insertion-ordered map capped at `CAP` entries, keyed by session so a whole session's
/// entries can be dropped at once; when the cap is hit, the oldest entries across all
/// sessions are trimmed down to `TRIM_TO`.
#[derive(Default)]
pub struct SessionBoundCache<V> {
    order: Vec<(String, String)>, // (session_id, key) insertion order
    entries: HashMap<(String, String), V>,
}

impl<V> SessionBoundCache<V> {
    pub fn new() -> Self {
        Self { order: Vec::new(), entries: HashMap::new() }
    }

    pub fn insert(&mut self, session_id: &str, key: String, value: V) {
        let k = (session_id.to_string(), key);
        if !self.entries.contains_key(&k) {
            self.order.push(k.clone());
        }
        self.entries.insert(k, value);
        if self.entries.len() > CAP {
            self.trim_to(TRIM_TO);
        }
    }

    pub fn contains(&self, session_id: &str, key: &str) -> bool {
        self.entries.contains_key(&(session_id.to_string(), key.to_string()))
    }

    pub fn get(&self, session_id: &str, key: &str) -> Option<&V> {
        self.entries.get(&(session_id.to_string(), key.to_string()))
    }

    /// Evicts every entry belonging to `session_id` (spec.md §9).
    pub fn evict_session(&mut self, session_id: &str) {
        self.order.retain(|(sid, _)| sid != session_id);
        self.entries.retain(|(sid, _), _| sid != session_id);
    }

    fn trim_to(&mut self, target: usize) {
        while self.entries.len() > target {
            if self.order.is_empty() {
                break;
            }
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `(sessionID, normalizedText)` pairs deposited by the router before forwarding a
/// chat-originated message, so the subsequent echo of that same text isn't re-posted
/// (spec.md §4.5 "messagesFromTelegram").
#[derive(Default)]
pub struct EchoSuppressionSet {
    cache: SessionBoundCache<()>,
}

impl EchoSuppressionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_sent(&mut self, session_id: &str, normalized_text: &str) {
        self.cache.insert(session_id, normalized_text.to_string(), ());
    }

    /// Returns true and consumes the marker if a matching suppression exists, so a
    /// duplicated echo within the same generation is still caught once.
    pub fn should_suppress(&self, session_id: &str, normalized_text: &str) -> bool {
        self.cache.contains(session_id, normalized_text)
    }

    pub fn evict_session(&mut self, session_id: &str) {
        self.cache.evict_session(session_id);
    }
}

pub fn normalize(text: &str) -> String {
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_suppression_roundtrip() {
        let mut set = EchoSuppressionSet::new();
        set.mark_sent("s1", "hello");
        assert!(set.should_suppress("s1", "hello"));
        assert!(!set.should_suppress("s1", "other"));
    }

    #[test]
    fn evict_session_clears_only_that_session() {
        let mut set = EchoSuppressionSet::new();
        set.mark_sent("s1", "a");
        set.mark_sent("s2", "b");
        set.evict_session("s1");
        assert!(!set.should_suppress("s1", "a"));
        assert!(set.should_suppress("s2", "b"));
    }

    #[test]
    fn size_cap_trims_oldest_entries_as_a_backstop() {
        let mut cache = SessionBoundCache::new();
        for i in 0..120 {
            cache.insert(&format!("s{i}"), "k".into(), i);
        }
        assert!(cache.len() <= 100);
    }
}
