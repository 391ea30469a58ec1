//! Ordered in-process map with per-entry revisions and a change feed.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use stash_core::Event;

/// Default buffer of the change feed. A watcher that falls further behind
/// than this sees a lag error.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Slot {
    value: Vec<u8>,
    revision: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Slot>,
    revision: u64,
}

/// `String -> Vec<u8>` map that publishes every mutation.
///
/// Each write bumps a map-wide revision and stamps it on the entry, so a
/// caller holding a revision can later delete only if nothing has written
/// the key since. Events are sent while the write lock is held, so their
/// order on the feed matches the order of the writes.
#[derive(Debug)]
pub struct EventfulMap {
    state: RwLock<State>,
    events: broadcast::Sender<Event>,
}

impl EventfulMap {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: RwLock::new(State::default()),
            events,
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.read().entries.get(key).map(|s| s.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.read().entries.contains_key(key)
    }

    /// Revision of the last write to `key`.
    pub fn revision_of(&self, key: &str) -> Option<u64> {
        self.state.read().entries.get(key).map(|s| s.revision)
    }

    /// Insert or overwrite and return the entry's new revision.
    pub fn insert(&self, key: &str, value: Vec<u8>) -> u64 {
        let mut state = self.state.write();
        state.revision += 1;
        let revision = state.revision;
        let event = Event::Put {
            key: key.to_string(),
            value: value.clone(),
        };
        state
            .entries
            .insert(key.to_string(), Slot { value, revision });
        // No receivers is not an error.
        let _ = self.events.send(event);
        revision
    }

    /// Remove `key`. Returns the map revision of the removal, or `None` when
    /// the key was absent.
    pub fn remove(&self, key: &str) -> Option<u64> {
        let mut state = self.state.write();
        self.remove_locked(&mut state, key)
    }

    /// Remove `key` only if it was last written at `revision`.
    pub fn remove_if_revision(&self, key: &str, revision: u64) -> bool {
        let mut state = self.state.write();
        match state.entries.get(key) {
            Some(slot) if slot.revision == revision => {
                self.remove_locked(&mut state, key).is_some()
            }
            _ => false,
        }
    }

    fn remove_locked(&self, state: &mut State, key: &str) -> Option<u64> {
        state.entries.remove(key)?;
        state.revision += 1;
        let _ = self.events.send(Event::Delete {
            key: key.to_string(),
        });
        Some(state.revision)
    }

    /// Pairs whose key starts with `prefix`, ascending.
    pub fn scan(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.with_prefix(prefix, |k, s| (k.to_string(), s.value.clone()))
    }

    pub fn count(&self, prefix: &str) -> usize {
        let state = self.state.read();
        state
            .entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .count()
    }

    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.with_prefix(prefix, |k, _| k.to_string())
    }

    pub fn values(&self, prefix: &str) -> Vec<Vec<u8>> {
        self.with_prefix(prefix, |_, s| s.value.clone())
    }

    fn with_prefix<T>(&self, prefix: &str, f: impl Fn(&str, &Slot) -> T) -> Vec<T> {
        let state = self.state.read();
        state
            .entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, s)| f(k, s))
            .collect()
    }

    /// Subscribe to every mutation from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Copy of the whole map.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.state
            .read()
            .entries
            .iter()
            .map(|(k, s)| (k.clone(), s.value.clone()))
            .collect()
    }

    /// Bulk-load entries without publishing events.
    pub fn load(&self, entries: impl IntoIterator<Item = (String, Vec<u8>)>) {
        let mut state = self.state.write();
        for (key, value) in entries {
            state.revision += 1;
            let revision = state.revision;
            state.entries.insert(key, Slot { value, revision });
        }
    }

    /// Map-wide revision. Changes on every mutation.
    pub fn revision(&self) -> u64 {
        self.state.read().revision
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventfulMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let map = EventfulMap::new();
        assert!(map.get("a").is_none());
        let put = map.insert("a", vec![1]);
        assert_eq!(map.get("a"), Some(vec![1]));
        assert_eq!(map.remove("a"), Some(put + 1));
        assert_eq!(map.remove("a"), None);
        assert!(map.is_empty());
    }

    #[test]
    fn revisions_guard_conditional_remove() {
        let map = EventfulMap::new();
        let first = map.insert("k", vec![1]);
        let second = map.insert("k", vec![2]);
        assert!(second > first);
        assert!(!map.remove_if_revision("k", first));
        assert_eq!(map.get("k"), Some(vec![2]));
        assert!(map.remove_if_revision("k", second));
        assert!(!map.contains("k"));
        assert!(map.revision() > second);
    }

    #[test]
    fn prefix_scans_are_ordered_and_bounded() {
        let map = EventfulMap::new();
        for k in ["user/2", "order/1", "user/1", "users"] {
            map.insert(k, k.as_bytes().to_vec());
        }
        assert_eq!(map.keys("user/"), vec!["user/1", "user/2"]);
        assert_eq!(map.count("user"), 3);
        assert_eq!(map.count(""), 4);
        assert_eq!(map.values("order/"), vec![b"order/1".to_vec()]);
        assert_eq!(map.scan("zzz"), Vec::new());
    }

    #[tokio::test]
    async fn feed_reports_puts_and_deletes_in_order() {
        let map = EventfulMap::new();
        let mut rx = map.subscribe();
        map.insert("a", vec![1]);
        map.remove("a");
        map.remove("missing");
        assert_eq!(
            rx.recv().await.unwrap(),
            Event::Put {
                key: "a".into(),
                value: vec![1]
            }
        );
        assert_eq!(rx.recv().await.unwrap(), Event::Delete { key: "a".into() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn load_is_silent() {
        let map = EventfulMap::new();
        let mut rx = map.subscribe();
        map.load([("x".to_string(), vec![9])]);
        assert_eq!(map.snapshot().len(), 1);
        assert!(rx.try_recv().is_err());
        assert!(map.revision_of("x").is_some());
    }
}
