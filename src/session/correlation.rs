//! Routes incoming frames to the exchange that asked for them.
//!
//! A fresh exchange is known only by the sequence number stamped into its
//! request. The first reply that carries a session id moves the queue from
//! the sequence map to the session map; later frames are routed by session.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::Response;

pub type QueueItem = Result<Response>;
pub type Route = mpsc::Sender<QueueItem>;

/// Receiving end of one exchange. The senders live only in the maps, so
/// the receiver sees the end of the channel once its entries are gone.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<QueueItem>,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    tx: Route,
}

#[derive(Debug)]
pub struct Correlation {
    capacity: usize,
    next_id: u64,
    by_sequence: HashMap<u64, Entry>,
    by_session: HashMap<u64, Entry>,
}

impl Correlation {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, next_id: 0, by_sequence: HashMap::new(), by_session: HashMap::new() }
    }

    fn channel(&mut self) -> (Entry, Subscription) {
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.capacity);
        (Entry { id: self.next_id, tx }, Subscription { id: self.next_id, rx })
    }

    /// New queue for a fresh exchange, or `None` if `sequence` is taken.
    pub fn register_sequence(&mut self, sequence: u64) -> Option<Subscription> {
        if self.by_sequence.contains_key(&sequence) {
            return None;
        }
        let (entry, subscription) = self.channel();
        self.by_sequence.insert(sequence, entry);
        Some(subscription)
    }

    /// Queue for a continued session. A previous consumer of the same
    /// session is cut off and its stream ends.
    pub fn subscribe_session(&mut self, session: u64) -> Subscription {
        let (entry, subscription) = self.channel();
        if self.by_session.insert(session, entry).is_some() {
            tracing::debug!(session, "session taken over by a new exchange");
        }
        subscription
    }

    /// Finds the queue for a frame, moving a pending exchange to the session
    /// map when the frame is the first to name its session.
    pub fn resolve(&mut self, sequence: Option<u64>, session: Option<u64>) -> Option<Route> {
        if let Some(entry) = session.and_then(|s| self.by_session.get(&s)) {
            return Some(entry.tx.clone());
        }
        let sequence = sequence?;
        match session {
            Some(session) => {
                let entry = self.by_sequence.remove(&sequence)?;
                tracing::debug!(sequence, session, "exchange bound to session");
                let tx = entry.tx.clone();
                self.by_session.insert(session, entry);
                Some(tx)
            }
            None => self.by_sequence.get(&sequence).map(|e| e.tx.clone()),
        }
    }

    /// Queues of every exchange still waiting for its first reply
    pub fn waiting(&self) -> Vec<Route> {
        self.by_sequence.values().map(|e| e.tx.clone()).collect()
    }

    /// Forgets every entry of subscription `id`.
    pub fn release(&mut self, id: u64) {
        self.by_sequence.retain(|_, e| e.id != id);
        self.by_session.retain(|_, e| e.id != id);
    }

    /// Drops every sender; open subscriptions drain and then end.
    pub fn clear(&mut self) {
        self.by_sequence.clear();
        self.by_session.clear();
    }

    pub fn pending(&self) -> usize {
        self.by_sequence.len()
    }

    pub fn sessions(&self) -> usize {
        self.by_session.len()
    }
}
