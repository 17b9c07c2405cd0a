//! Record subscriptions: best-effort fan-out of details writes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::debug;
use parking_lot::Mutex;

use crate::database::Filter;
use crate::domain::Details;

/// Per-subscriber queue depth. A full queue drops the update.
pub const SUBSCRIPTION_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    filter: Option<Filter>,
    ids: HashSet<String>,
    tx: Sender<Details>,
}

impl Subscriber {
    /// No filter and no seed ids subscribes to everything.
    fn wants(&self, details: &Details) -> bool {
        let id = details.id().unwrap_or_default();
        match &self.filter {
            None => self.ids.is_empty() || self.ids.contains(id),
            Some(f) => self.ids.contains(id) || f.matches(details),
        }
    }
}

pub struct Subscription {
    pub id: u64,
    pub updates: Receiver<Details>,
}

#[derive(Default)]
pub(super) struct Subscriptions {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Subscriptions {
    pub(super) fn subscribe(&self, filter: Option<Filter>, seed_ids: Vec<String>) -> Subscription {
        let (tx, rx) = bounded(SUBSCRIPTION_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribers.lock().push(Subscriber {
            id,
            filter,
            ids: seed_ids.into_iter().collect(),
            tx,
        });
        Subscription { id, updates: rx }
    }

    pub(super) fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    pub(super) fn publish(&self, details: &Details) {
        self.subscribers.lock().retain(|s| {
            if !s.wants(details) {
                return true;
            }
            match s.tx.try_send(details.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("subscription {} is full, dropping update", s.id);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    pub(super) fn len(&self) -> usize {
        self.subscribers.lock().len()
    }
}
