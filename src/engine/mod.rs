//! Entry point used by the admin/voter surface.
//!
//! `Engine` owns the poll store and a registry of per-poll actors. Reads of
//! poll metadata go straight to the store; anything that touches ballots,
//! tallies or the early-close override goes through the poll's actor.

mod actor;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

use crate::broadcast::Subscription;
use crate::clock::Clock;
use crate::config::Config;
use crate::db::PollStore;
use crate::error::{EngineError, NotFoundError, Result, ValidationError};
use crate::ledger::{BallotLedger, CastOutcome};
use crate::lifecycle::{Admins, CloseOutcome, PollStatus};
use crate::models::{Ballot, NewPoll, Poll, PollUpdate, PollView};
use crate::tally::Counts;

use actor::{ActorContext, Command, PollActor, PollHandle};

/// Point-in-time results of one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Results {
    pub poll_id: String,
    pub status: PollStatus,
    pub counts: Counts,
    pub total: u64,
}

/// Outcome of comparing the cached tally against a full ledger replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub poll_id: String,
    pub consistent: bool,
    pub ballots: u64,
    pub incremental: Counts,
    pub rebuilt: Counts,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub mailbox_capacity: usize,
    pub subscriber_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            subscriber_capacity: 64,
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            mailbox_capacity: config.actor_mailbox_capacity,
            subscriber_capacity: config.subscriber_queue_capacity,
        }
    }
}

/// Attempts per request when the poll's actor is retiring.
const MAX_ATTEMPTS: usize = 2;

pub struct Engine {
    store: Arc<dyn PollStore>,
    clock: Arc<dyn Clock>,
    ledger: BallotLedger,
    ctx: ActorContext,
    actors: Mutex<HashMap<String, PollHandle>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn PollStore>,
        clock: Arc<dyn Clock>,
        admins: Admins,
        settings: EngineSettings,
    ) -> Self {
        let ctx = ActorContext {
            store: Arc::clone(&store),
            clock: Arc::clone(&clock),
            admins: Arc::new(admins),
            mailbox_capacity: settings.mailbox_capacity,
            subscriber_capacity: settings.subscriber_capacity,
        };

        Self {
            ledger: BallotLedger::new(Arc::clone(&store)),
            store,
            clock,
            ctx,
            actors: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_poll(&self, new_poll: NewPoll) -> Result<String> {
        let poll = Poll::new(new_poll, self.clock.now())?;
        self.store.insert_poll(&poll).await?;
        info!(
            "Poll {} created by {} with {} option(s)",
            poll.id,
            poll.created_by,
            poll.options.len()
        );
        Ok(poll.id)
    }

    pub async fn list_polls(&self) -> Result<Vec<PollView>> {
        let now = self.clock.now();
        Ok(self
            .store
            .list_polls()
            .await?
            .iter()
            .map(|poll| poll.view(now))
            .collect())
    }

    pub async fn list_active_polls(&self) -> Result<Vec<PollView>> {
        Ok(self
            .list_polls()
            .await?
            .into_iter()
            .filter(|view| view.status == PollStatus::Active)
            .collect())
    }

    pub async fn get_poll(&self, poll_id: &str) -> Result<PollView> {
        let poll = self.load(poll_id).await?;
        Ok(poll.view(self.clock.now()))
    }

    pub async fn update_poll(&self, poll_id: &str, admin_id: &str, update: PollUpdate) -> Result<PollView> {
        self.request(poll_id, |reply| Command::Update {
            admin_id: admin_id.to_string(),
            update: update.clone(),
            reply,
        })
        .await
    }

    pub async fn delete_poll(&self, poll_id: &str, admin_id: &str) -> Result<()> {
        // The actor stops after a delete; `loaded` drops its handle.
        self.request(poll_id, |reply| Command::Delete {
            admin_id: admin_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn close_poll_early(&self, poll_id: &str, admin_id: &str) -> Result<CloseOutcome> {
        self.request(poll_id, |reply| Command::Close {
            admin_id: admin_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn cast_vote(&self, poll_id: &str, voter_id: &str, option_id: &str) -> Result<CastOutcome> {
        if voter_id.trim().is_empty() {
            return Err(ValidationError::EmptyVoterId.into());
        }
        self.request(poll_id, |reply| Command::Cast {
            voter_id: voter_id.to_string(),
            option_id: option_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn ballot_of(&self, poll_id: &str, voter_id: &str) -> Result<Option<Ballot>> {
        self.load(poll_id).await?;
        Ok(self.ledger.ballot_of(poll_id, voter_id).await?)
    }

    pub async fn get_results(&self, poll_id: &str) -> Result<Results> {
        self.request(poll_id, |reply| Command::Results { reply }).await
    }

    /// Live results feed: a snapshot first, then deltas and status changes.
    pub async fn subscribe_results(&self, poll_id: &str) -> Result<Subscription> {
        self.request(poll_id, |reply| Command::Subscribe { reply }).await
    }

    /// Replays the ledger and compares it against the cached tally, rebuilding on mismatch.
    pub async fn audit(&self, poll_id: &str) -> Result<AuditReport> {
        self.request(poll_id, |reply| Command::Audit { reply }).await
    }

    /// Audits every poll that currently has a live actor. Actors that retire
    /// before the audit reaches them are left out.
    pub async fn audit_loaded(&self) -> Vec<(String, Result<AuditReport>)> {
        let mut reports = Vec::new();
        for (poll_id, handle) in self.loaded() {
            match handle.request(|reply| Command::Audit { reply }).await {
                Err(EngineError::Shutdown(_)) => debug!("Poll {} retired before its audit", poll_id),
                report => reports.push((poll_id, report)),
            }
        }
        reports
    }

    /// Asks every live actor to re-derive its status and resync lagging
    /// subscribers. Actors of completed polls with no subscribers retire.
    /// Returns how many actors were reached.
    pub fn tick(&self) -> usize {
        self.loaded()
            .into_iter()
            .filter(|(poll_id, handle)| {
                let queued = handle.try_tick();
                if !queued {
                    warn!("Skipped tick for busy poll {}", poll_id);
                }
                queued
            })
            .count()
    }

    /// Number of polls with a running actor.
    pub fn loaded_polls(&self) -> usize {
        self.loaded().len()
    }

    fn loaded(&self) -> Vec<(String, PollHandle)> {
        let mut actors = self.actors.lock().unwrap_or_else(PoisonError::into_inner);
        actors.retain(|_, handle| !handle.is_closed());
        actors
            .iter()
            .map(|(poll_id, handle)| (poll_id.clone(), handle.clone()))
            .collect()
    }

    /// Sends a command to the poll's actor. A retiring actor answers
    /// `Shutdown` without doing any work, so the command is sent once more
    /// to a fresh actor.
    async fn request<T>(
        &self,
        poll_id: &str,
        make: impl Fn(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let handle = self.handle(poll_id).await?;
            match handle.request(&make).await {
                Err(EngineError::Shutdown(_)) if attempts < MAX_ATTEMPTS => {
                    debug!("Actor of poll {} retired, retrying on a fresh one", poll_id);
                }
                result => return result,
            }
        }
    }

    async fn load(&self, poll_id: &str) -> Result<Poll> {
        self.store
            .get_poll(poll_id)
            .await?
            .ok_or_else(|| NotFoundError::Poll(poll_id.to_string()).into())
    }

    /// Returns the poll's actor, starting it if this is the first request for the poll.
    async fn handle(&self, poll_id: &str) -> Result<PollHandle> {
        if let Some(handle) = self.lookup(poll_id) {
            return Ok(handle);
        }

        let poll = self.load(poll_id).await?;

        let mut actors = self.actors.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = actors.get(poll_id).filter(|handle| !handle.is_closed()) {
            return Ok(handle.clone());
        }
        let handle = PollActor::spawn(poll, self.ctx.clone());
        actors.insert(poll_id.to_string(), handle.clone());
        Ok(handle)
    }

    fn lookup(&self, poll_id: &str) -> Option<PollHandle> {
        let actors = self.actors.lock().unwrap_or_else(PoisonError::into_inner);
        actors
            .get(poll_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }
}
