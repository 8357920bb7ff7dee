//! Per-poll fan-out of tally changes to live viewers.
//!
//! Every subscriber owns a bounded queue. Delivery never waits: when a queue
//! is full the update is dropped and the subscriber is marked stale, and the
//! next delivery it gets is a full snapshot flagged `resync`. Subscribers
//! whose receiving side is gone are pruned on the next delivery.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::lifecycle::PollStatus;
use crate::tally::{Counts, Tally};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultsEvent {
    Snapshot {
        poll_id: String,
        status: PollStatus,
        counts: Counts,
        resync: bool,
    },
    Delta {
        poll_id: String,
        option_id: String,
        count: u64,
    },
    Status {
        poll_id: String,
        status: PollStatus,
    },
}

impl ResultsEvent {
    pub fn poll_id(&self) -> &str {
        match self {
            ResultsEvent::Snapshot { poll_id, .. }
            | ResultsEvent::Delta { poll_id, .. }
            | ResultsEvent::Status { poll_id, .. } => poll_id,
        }
    }
}

/// Receiving end of a results feed. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    poll_id: String,
    rx: mpsc::Receiver<ResultsEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn poll_id(&self) -> &str {
        &self.poll_id
    }

    /// Waits for the next event. `None` once the poll's feed is gone.
    pub async fn recv(&mut self) -> Option<ResultsEvent> {
        self.rx.recv().await
    }

    /// Returns an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ResultsEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ResultsEvent>,
    stale: bool,
}

enum Delivery {
    Sent,
    Full,
    Closed,
}

impl Subscriber {
    fn deliver(&mut self, event: ResultsEvent) -> Delivery {
        match self.tx.try_send(event) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

#[derive(Debug)]
pub struct Hub {
    poll_id: String,
    capacity: usize,
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

impl Hub {
    pub fn new(poll_id: &str, capacity: usize) -> Self {
        Self {
            poll_id: poll_id.to_string(),
            // mpsc::channel panics on zero
            capacity: capacity.max(1),
            next_id: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Registers a viewer whose first event is a snapshot of `tally`.
    pub fn subscribe(&mut self, tally: &Tally, status: PollStatus) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id;
        self.next_id += 1;

        let mut subscriber = Subscriber { id, tx, stale: false };
        // A fresh queue always has room for the opening snapshot.
        if let Delivery::Full = subscriber.deliver(self.snapshot_event(tally, status, false)) {
            subscriber.stale = true;
        }
        self.subscribers.push(subscriber);
        debug!("Subscriber {} joined poll {} ({} total)", id, self.poll_id, self.subscribers.len());

        Subscription {
            id,
            poll_id: self.poll_id.clone(),
            rx,
        }
    }

    pub fn publish_delta(&mut self, tally: &Tally, status: PollStatus, option_id: &str, count: u64) {
        let event = ResultsEvent::Delta {
            poll_id: self.poll_id.clone(),
            option_id: option_id.to_string(),
            count,
        };
        self.fan_out(tally, status, event);
    }

    pub fn publish_status(&mut self, tally: &Tally, status: PollStatus) {
        let event = ResultsEvent::Status {
            poll_id: self.poll_id.clone(),
            status,
        };
        self.fan_out(tally, status, event);
    }

    /// Forces every subscriber onto a fresh snapshot, e.g. after a rebuild.
    pub fn publish_snapshot(&mut self, tally: &Tally, status: PollStatus) {
        for subscriber in &mut self.subscribers {
            subscriber.stale = true;
        }
        self.resync_stale(tally, status);
    }

    /// Retries the snapshot for subscribers that fell behind and prunes closed ones.
    pub fn resync_stale(&mut self, tally: &Tally, status: PollStatus) {
        let snapshot = self.snapshot_event(tally, status, true);
        let poll_id = &self.poll_id;
        self.subscribers.retain_mut(|subscriber| {
            if subscriber.tx.is_closed() {
                debug!("Subscriber {} left poll {}", subscriber.id, poll_id);
                return false;
            }
            if !subscriber.stale {
                return true;
            }
            match subscriber.deliver(snapshot.clone()) {
                Delivery::Sent => {
                    subscriber.stale = false;
                    true
                }
                Delivery::Full => true,
                Delivery::Closed => false,
            }
        });
    }

    fn fan_out(&mut self, tally: &Tally, status: PollStatus, event: ResultsEvent) {
        let mut snapshot: Option<ResultsEvent> = None;
        let poll_id = &self.poll_id;

        self.subscribers.retain_mut(|subscriber| {
            let next = if subscriber.stale {
                snapshot
                    .get_or_insert_with(|| ResultsEvent::Snapshot {
                        poll_id: poll_id.clone(),
                        status,
                        counts: tally.snapshot(),
                        resync: true,
                    })
                    .clone()
            } else {
                event.clone()
            };

            match subscriber.deliver(next) {
                Delivery::Sent => {
                    subscriber.stale = false;
                    true
                }
                Delivery::Full => {
                    if !subscriber.stale {
                        info!("Subscriber {} of poll {} fell behind, will resync", subscriber.id, poll_id);
                    }
                    subscriber.stale = true;
                    true
                }
                Delivery::Closed => {
                    debug!("Subscriber {} left poll {}", subscriber.id, poll_id);
                    false
                }
            }
        });
    }

    fn snapshot_event(&self, tally: &Tally, status: PollStatus, resync: bool) -> ResultsEvent {
        ResultsEvent::Snapshot {
            poll_id: self.poll_id.clone(),
            status,
            counts: tally.snapshot(),
            resync,
        }
    }
}
