//! Doubles shared by the unit tests.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::notify::Notifier;
use crate::protocol::Message;
use crate::remote::DocumentStore;

#[derive(Default)]
struct StoreState {
    docs: BTreeMap<String, Document>,
    offline: bool,
    read_only: bool,
    writes: usize,
}

/// In-memory document collection that can be switched offline.
/// Clones share state, so a test can keep a handle after moving one into
/// the engine.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    /// Reads keep working; every write is refused.
    pub fn set_read_only(&self, read_only: bool) {
        self.state.lock().unwrap().read_only = read_only;
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn document(&self, id: &str) -> Option<Document> {
        self.state.lock().unwrap().docs.get(id).cloned()
    }

    pub fn insert(&self, id: &str, doc: Value) {
        let Value::Object(doc) = doc else {
            panic!("documents are objects");
        };
        self.state.lock().unwrap().docs.insert(id.to_string(), doc);
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn get(&self, id: &str) -> Result<Option<Document>> {
        let state = self.state.lock().unwrap();
        if state.offline {
            return Err(SyncError::RemoteReadFailed("offline".to_string()));
        }
        Ok(state.docs.get(id).cloned())
    }

    fn set(&self, id: &str, doc: &Document) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.offline || state.read_only {
            return Err(SyncError::RemoteWriteFailed("offline".to_string()));
        }
        state.writes += 1;
        state.docs.insert(id.to_string(), doc.clone());
        Ok(())
    }

    fn update(&self, id: &str, fields: &Document) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.offline || state.read_only {
            return Err(SyncError::RemoteWriteFailed("offline".to_string()));
        }
        state.writes += 1;
        let doc = state.docs.entry(id.to_string()).or_default();
        for (key, value) in fields {
            doc.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn find_by(&self, field: &str, value: &str) -> Result<Vec<(String, Document)>> {
        let state = self.state.lock().unwrap();
        if state.offline {
            return Err(SyncError::RemoteReadFailed("offline".to_string()));
        }
        Ok(state
            .docs
            .iter()
            .filter(|(_, doc)| doc.get(field).and_then(Value::as_str) == Some(value))
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Message>>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn broadcast(&self, message: &Message) {
        self.sent.lock().unwrap().push(message.clone());
    }
}

/// Settable clock; `today` is the UTC calendar day of `now`.
#[derive(Clone)]
pub struct FixedClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn at(rfc3339: &str) -> Self {
        Self {
            now: Arc::new(Mutex::new(rfc3339.parse().unwrap())),
        }
    }

    pub fn set(&self, rfc3339: &str) {
        *self.now.lock().unwrap() = rfc3339.parse().unwrap();
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}
