//! Subscription bookkeeping
//!
//! Tracks every stream hash the client has asked for, with the caller's
//! metadata, its confirmation state and whoever is waiting on it.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::ClientError;

/// Length of a stream hash in hex characters
pub const HASH_LEN: usize = 32;

/// True for exactly 32 hex characters, nothing else
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Confirmation state of a tracked stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Subscribe written, confirmation window still open
    Pending,
    /// Confirmed
    Subscribed,
}

/// A tracked stream as seen by callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub hash: String,
    pub state: StreamState,
    pub metadata: Value,
}

/// Result for one hash of a subscribe call
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOutcome {
    pub hash: String,
    pub result: Result<Subscription, ClientError>,
}

impl SubscribeOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// The full set of streams a subscribe call asks for, with metadata
///
/// Hashes not in the set are unsubscribed by that call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSet(BTreeMap<String, Value>);

impl StreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with(mut self, hash: impl Into<String>, metadata: Value) -> Self {
        self.insert(hash, metadata);
        self
    }

    pub fn insert(&mut self, hash: impl Into<String>, metadata: Value) {
        self.0.insert(hash.into(), metadata);
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.0.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl IntoIterator for StreamSet {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

fn empty_metadata() -> Value {
    Value::Object(Map::new())
}

impl From<&str> for StreamSet {
    fn from(hash: &str) -> Self {
        Self::new().with(hash, empty_metadata())
    }
}

impl From<String> for StreamSet {
    fn from(hash: String) -> Self {
        Self::new().with(hash, empty_metadata())
    }
}

impl From<BTreeMap<String, Value>> for StreamSet {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<'a> FromIterator<&'a str> for StreamSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(|h| (h.to_string(), empty_metadata())).collect())
    }
}

impl FromIterator<String> for StreamSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().map(|h| (h, empty_metadata())).collect())
    }
}

impl FromIterator<(String, Value)> for StreamSet {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub(crate) type Waiter = oneshot::Sender<Result<Subscription, ClientError>>;

/// One tracked stream
#[derive(Debug)]
pub(crate) struct StreamEntry {
    pub hash: String,
    pub metadata: Value,
    pub state: StreamState,
    /// Bumped on every (re)subscribe so stale confirmation windows are ignored
    pub generation: u64,
    /// Subscribe written on the current link
    pub sent: bool,
    /// Confirmation window running for this generation
    pub ack_armed: bool,
    /// Re-issued after a recovery
    pub replayed: bool,
    waiters: Vec<Waiter>,
}

impl StreamEntry {
    pub fn snapshot(&self) -> Subscription {
        Subscription {
            hash: self.hash.clone(),
            state: self.state,
            metadata: self.metadata.clone(),
        }
    }

    /// Wait on this entry; answered at once if already confirmed
    pub fn attach(&mut self, waiter: Waiter) {
        match self.state {
            StreamState::Subscribed => {
                let _ = waiter.send(Ok(self.snapshot()));
            }
            StreamState::Pending => self.waiters.push(waiter),
        }
    }

    /// Mark confirmed and answer every waiter
    pub fn confirm(&mut self) {
        self.state = StreamState::Subscribed;
        self.ack_armed = false;
        let snapshot = self.snapshot();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(snapshot.clone()));
        }
    }

    pub fn reject_waiters(&mut self, error: &ClientError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

/// All tracked streams, keyed by hash
#[derive(Debug, Default)]
pub(crate) struct StreamTable {
    entries: BTreeMap<String, StreamEntry>,
    next_generation: u64,
}

impl StreamTable {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Track a new pending stream
    pub fn insert(&mut self, hash: String, metadata: Value) -> &mut StreamEntry {
        let generation = self.next_generation();
        self.entries.entry(hash.clone()).or_insert(StreamEntry {
            hash,
            metadata,
            state: StreamState::Pending,
            generation,
            sent: false,
            ack_armed: false,
            replayed: false,
            waiters: Vec::new(),
        })
    }

    /// Start a new subscribe round for an entry
    pub fn renew(&mut self, hash: &str) {
        let generation = self.next_generation();
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.generation = generation;
            entry.state = StreamState::Pending;
            entry.sent = false;
            entry.ack_armed = false;
            entry.replayed = true;
        }
    }

    /// Send every entry back to pending for the next link, as a fresh round
    /// rather than a replay
    pub fn rewind(&mut self) {
        for hash in self.hashes() {
            self.renew(&hash);
            if let Some(entry) = self.entries.get_mut(&hash) {
                entry.replayed = false;
            }
        }
    }

    pub fn get_mut(&mut self, hash: &str) -> Option<&mut StreamEntry> {
        self.entries.get_mut(hash)
    }

    pub fn remove(&mut self, hash: &str) -> Option<StreamEntry> {
        self.entries.remove(hash)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hashes(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Hashes whose subscribe has not been written on the current link
    pub fn unsent(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| !e.sent)
            .map(|e| e.hash.clone())
            .collect()
    }

    /// Tracked hashes missing from `requested`
    pub fn difference(&self, requested: &StreamSet) -> Vec<String> {
        self.entries
            .keys()
            .filter(|hash| !requested.contains(hash))
            .cloned()
            .collect()
    }

    /// The link went away; everything must be written again on the next one
    pub fn mark_unsent(&mut self) {
        for entry in self.entries.values_mut() {
            entry.sent = false;
        }
    }

    /// Answer waiters of unconfirmed entries with `error`, keeping the entries
    pub fn reject_pending(&mut self, error: &ClientError) {
        for entry in self.entries.values_mut() {
            entry.reject_waiters(error);
        }
    }

    /// Remove every unconfirmed entry
    pub fn take_pending(&mut self) -> Vec<StreamEntry> {
        let hashes: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.state == StreamState::Pending)
            .map(|e| e.hash.clone())
            .collect();
        hashes
            .iter()
            .filter_map(|hash| self.entries.remove(hash))
            .collect()
    }

    pub fn clear(&mut self, error: &ClientError) {
        self.reject_pending(error);
        self.entries.clear();
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries.values().map(StreamEntry::snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[test]
    fn test_hash_validation() {
        assert!(is_valid_hash("0123456789abcdef0123456789ABCDEF"));
        assert!(!is_valid_hash("0123456789abcdef0123456789abcde"));
        assert!(!is_valid_hash("0123456789abcdef0123456789abcdef0"));
        assert!(!is_valid_hash("0123456789abcdef0123456789abcdeg"));
        assert!(!is_valid_hash("0123456789abcdef0123456789abcdef\n"));
        assert!(!is_valid_hash(" 0123456789abcdef0123456789abcdef"));
        assert!(!is_valid_hash(""));
    }

    #[test]
    fn test_stream_set_conversions() {
        let single = StreamSet::from(A);
        assert_eq!(single.len(), 1);
        assert!(single.contains(A));

        let many: StreamSet = [A, B].into_iter().collect();
        assert_eq!(many.hashes().collect::<Vec<_>>(), vec![A, B]);

        let with_meta = StreamSet::new().with(A, json!({"name": "tweets"}));
        let (hash, metadata) = with_meta.into_iter().next().unwrap();
        assert_eq!(hash, A);
        assert_eq!(metadata, json!({"name": "tweets"}));
    }

    #[test]
    fn test_waiters_share_confirmation() {
        let mut table = StreamTable::default();
        let entry = table.insert(A.to_string(), json!({"n": 1}));
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        entry.attach(tx1);
        entry.attach(tx2);
        assert!(rx1.try_recv().is_err());

        entry.confirm();

        let expected = Subscription {
            hash: A.to_string(),
            state: StreamState::Subscribed,
            metadata: json!({"n": 1}),
        };
        assert_eq!(rx1.try_recv().unwrap(), Ok(expected.clone()));
        assert_eq!(rx2.try_recv().unwrap(), Ok(expected));
    }

    #[test]
    fn test_attach_to_confirmed_answers_immediately() {
        let mut table = StreamTable::default();
        table.insert(A.to_string(), json!({})).confirm();

        let (tx, mut rx) = oneshot::channel();
        table.get_mut(A).unwrap().attach(tx);

        assert_eq!(rx.try_recv().unwrap().unwrap().state, StreamState::Subscribed);
    }

    #[test]
    fn test_renew_bumps_generation() {
        let mut table = StreamTable::default();
        let first = table.insert(A.to_string(), json!({})).generation;
        table.get_mut(A).unwrap().confirm();
        table.get_mut(A).unwrap().sent = true;

        table.renew(A);

        let entry = table.get_mut(A).unwrap();
        assert!(entry.generation > first);
        assert_eq!(entry.state, StreamState::Pending);
        assert!(!entry.sent);
        assert!(entry.replayed);
    }

    #[test]
    fn test_rewind_returns_confirmed_entries_to_pending() {
        let mut table = StreamTable::default();
        let first = table.insert(A.to_string(), json!({"n": 1})).generation;
        table.get_mut(A).unwrap().confirm();
        table.insert(B.to_string(), json!({}));
        table.mark_unsent();

        table.rewind();

        assert_eq!(table.unsent(), vec![A.to_string(), B.to_string()]);
        let entry = table.get_mut(A).unwrap();
        assert!(entry.generation > first);
        assert_eq!(entry.state, StreamState::Pending);
        assert_eq!(entry.metadata, json!({"n": 1}));
        assert!(!entry.ack_armed);
        assert!(!entry.replayed);
    }

    #[test]
    fn test_difference_and_take_pending() {
        let mut table = StreamTable::default();
        table.insert(A.to_string(), json!({}));
        table.insert(B.to_string(), json!({})).confirm();

        assert_eq!(table.difference(&StreamSet::from(B)), vec![A.to_string()]);

        let (tx, mut rx) = oneshot::channel();
        table.get_mut(A).unwrap().attach(tx);
        let failed = table.take_pending();
        assert_eq!(failed.len(), 1);
        assert_eq!(table.hashes(), vec![B.to_string()]);

        for mut entry in failed {
            entry.reject_waiters(&ClientError::Stopped);
        }
        assert_eq!(rx.try_recv().unwrap(), Err(ClientError::Stopped));
    }
}
