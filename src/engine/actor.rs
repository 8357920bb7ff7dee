//! Single writer per poll.
//!
//! Every mutation of a poll (ballots, early close, edits, deletion) and every
//! read that must agree with the tally is a `Command` processed in arrival
//! order by that poll's actor task. Polls never share an actor, so work on
//! different polls proceeds in parallel.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::broadcast::{Hub, Subscription};
use crate::clock::Clock;
use crate::db::PollStore;
use crate::error::{EngineError, NotFoundError, Result};
use crate::ledger::{BallotLedger, CastOutcome};
use crate::lifecycle::{self, Admins, CloseOutcome, CloseRejection, PollStatus};
use crate::models::{Poll, PollUpdate, PollView};
use crate::tally::{Tally, TallyDelta};

use super::{AuditReport, Results};

pub(crate) enum Command {
    Cast {
        voter_id: String,
        option_id: String,
        reply: oneshot::Sender<Result<CastOutcome>>,
    },
    Close {
        admin_id: String,
        reply: oneshot::Sender<Result<CloseOutcome>>,
    },
    Update {
        admin_id: String,
        update: PollUpdate,
        reply: oneshot::Sender<Result<PollView>>,
    },
    Delete {
        admin_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Results {
        reply: oneshot::Sender<Result<Results>>,
    },
    Subscribe {
        reply: oneshot::Sender<Result<Subscription>>,
    },
    Audit {
        reply: oneshot::Sender<Result<AuditReport>>,
    },
    Tick,
}

/// Shared collaborators every actor needs.
#[derive(Clone)]
pub(crate) struct ActorContext {
    pub store: Arc<dyn PollStore>,
    pub clock: Arc<dyn Clock>,
    pub admins: Arc<Admins>,
    pub mailbox_capacity: usize,
    pub subscriber_capacity: usize,
}

/// Cloneable address of a running poll actor.
#[derive(Clone)]
pub(crate) struct PollHandle {
    poll_id: String,
    tx: mpsc::Sender<Command>,
}

impl PollHandle {
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Sends a command and waits for its reply.
    pub async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| EngineError::Shutdown(self.poll_id.clone()))?;
        rx.await
            .map_err(|_| EngineError::Shutdown(self.poll_id.clone()))?
    }

    /// Queues a tick without waiting. Returns false if the mailbox is full or gone.
    pub fn try_tick(&self) -> bool {
        self.tx.try_send(Command::Tick).is_ok()
    }
}

pub(crate) struct PollActor {
    poll: Poll,
    tally: Tally,
    hub: Hub,
    ledger: BallotLedger,
    ctx: ActorContext,
    last_status: PollStatus,
    needs_rebuild: bool,
    deleted: bool,
    retiring: bool,
    rx: mpsc::Receiver<Command>,
}

impl PollActor {
    /// Starts the actor for `poll`. The poll is re-read and its tally rebuilt
    /// from the ledger before the first command is served.
    pub fn spawn(poll: Poll, ctx: ActorContext) -> PollHandle {
        let (tx, rx) = mpsc::channel(ctx.mailbox_capacity.max(1));
        let handle = PollHandle {
            poll_id: poll.id.clone(),
            tx,
        };

        let now = ctx.clock.now();
        let actor = PollActor {
            tally: Tally::new(&poll.id, poll.option_ids()),
            hub: Hub::new(&poll.id, ctx.subscriber_capacity),
            ledger: BallotLedger::new(Arc::clone(&ctx.store)),
            last_status: poll.status(now),
            needs_rebuild: true,
            deleted: false,
            retiring: false,
            poll,
            ctx,
            rx,
        };
        tokio::spawn(actor.run());

        handle
    }

    async fn run(mut self) {
        debug!("Poll actor {} started", self.poll.id);
        self.reload().await;
        if !self.deleted {
            if let Err(e) = self.rebuild().await {
                error!("Initial tally rebuild for poll {} failed: {}", self.poll.id, e);
            }
        }

        while let Some(command) = self.rx.recv().await {
            self.handle(command).await;
        }
        debug!("Poll actor {} stopped", self.poll.id);
    }

    async fn handle(&mut self, command: Command) {
        if self.deleted {
            let poll_id = self.poll.id.clone();
            reject(command, || NotFoundError::Poll(poll_id.clone()).into());
            return;
        }
        if self.retiring {
            // The caller retries on a fresh actor.
            let poll_id = self.poll.id.clone();
            reject(command, || EngineError::Shutdown(poll_id.clone()));
            return;
        }

        match command {
            Command::Cast { voter_id, option_id, reply } => {
                // Caller gave up before commit: nothing happens.
                if reply.is_closed() {
                    debug!("Cast by {} in poll {} cancelled before commit", voter_id, self.poll.id);
                    return;
                }
                let _ = reply.send(self.cast(&voter_id, &option_id).await);
            }
            Command::Close { admin_id, reply } => {
                let _ = reply.send(self.close(&admin_id).await);
            }
            Command::Update { admin_id, update, reply } => {
                let _ = reply.send(self.update(&admin_id, update).await);
            }
            Command::Delete { admin_id, reply } => {
                let _ = reply.send(self.delete(&admin_id).await);
            }
            Command::Results { reply } => {
                let _ = reply.send(self.results().await);
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(self.subscribe().await);
            }
            Command::Audit { reply } => {
                let _ = reply.send(self.audit().await);
            }
            Command::Tick => self.tick(),
        }
    }

    /// Picks up the stored version of the poll. The poll may have been deleted
    /// between the registry loading it and this actor starting.
    async fn reload(&mut self) {
        match self.ctx.store.get_poll(&self.poll.id).await {
            Ok(Some(poll)) => {
                self.poll = poll;
                self.last_status = self.poll.status(self.ctx.clock.now());
            }
            Ok(None) => {
                info!("Poll {} no longer exists, stopping its actor", self.poll.id);
                self.deleted = true;
                self.rx.close();
            }
            Err(e) => error!("Failed to reload poll {}: {}", self.poll.id, e),
        }
    }

    async fn cast(&mut self, voter_id: &str, option_id: &str) -> Result<CastOutcome> {
        self.ensure_consistent().await?;

        let now = self.ctx.clock.now();
        self.refresh_status(now);
        let outcome = self.ledger.commit(&self.poll, voter_id, option_id, now).await?;

        if let CastOutcome::Accepted { ballot } = &outcome {
            let delta = TallyDelta::from(ballot);
            match self.tally.apply(&delta) {
                Some(count) => {
                    self.hub
                        .publish_delta(&self.tally, self.last_status, &delta.option_id, count);
                }
                None => {
                    warn!(
                        "Ledger accepted ballot of {} in poll {} but the tally refused it, scheduling rebuild",
                        voter_id, self.poll.id
                    );
                    self.needs_rebuild = true;
                }
            }
        }

        Ok(outcome)
    }

    async fn close(&mut self, admin_id: &str) -> Result<CloseOutcome> {
        let now = self.ctx.clock.now();
        if let Err(reason) = lifecycle::check_close(&self.poll, admin_id, &self.ctx.admins, now) {
            info!("Close of poll {} by {} rejected: {:?}", self.poll.id, admin_id, reason);
            return Ok(CloseOutcome::Rejected { reason });
        }

        if !self.ctx.store.mark_closed(&self.poll.id, admin_id, now).await? {
            // Written outside this actor, e.g. by another engine on the same store.
            warn!("Poll {} was already closed in the store", self.poll.id);
            return Ok(CloseOutcome::Rejected {
                reason: CloseRejection::AlreadyCompleted,
            });
        }

        self.poll.closed_at = Some(now);
        self.poll.closed_by = Some(admin_id.to_string());
        info!("Poll {} closed early by {}", self.poll.id, admin_id);
        self.refresh_status(now);

        Ok(CloseOutcome::Accepted { closed_at: now })
    }

    async fn update(&mut self, admin_id: &str, update: PollUpdate) -> Result<PollView> {
        let now = self.ctx.clock.now();
        lifecycle::check_edit(&self.poll, admin_id, &self.ctx.admins, &update, now)?;

        let options_changed = update.options.is_some();
        let updated = self.poll.with_update(update)?;
        self.ctx.store.replace_poll(&updated).await?;
        self.poll = updated;
        info!("Poll {} updated by {}", self.poll.id, admin_id);

        if options_changed {
            // Only pending polls get new options, so there is nothing to replay.
            self.tally = Tally::new(&self.poll.id, self.poll.option_ids());
            self.last_status = self.poll.status(now);
            self.hub.publish_snapshot(&self.tally, self.last_status);
        }
        self.refresh_status(now);

        Ok(self.poll.view(now))
    }

    async fn delete(&mut self, admin_id: &str) -> Result<()> {
        let now = self.ctx.clock.now();
        lifecycle::check_delete(&self.poll, admin_id, &self.ctx.admins, now)?;

        if !self.ctx.store.delete_poll(&self.poll.id).await? {
            return Err(NotFoundError::Poll(self.poll.id.clone()).into());
        }
        info!("Poll {} deleted by {}", self.poll.id, admin_id);

        self.deleted = true;
        // Drain what is already queued, then stop.
        self.rx.close();
        Ok(())
    }

    async fn results(&mut self) -> Result<Results> {
        self.ensure_consistent().await?;
        let now = self.ctx.clock.now();
        self.refresh_status(now);
        Ok(Results {
            poll_id: self.poll.id.clone(),
            status: self.last_status,
            counts: self.tally.snapshot(),
            total: self.tally.total(),
        })
    }

    async fn subscribe(&mut self) -> Result<Subscription> {
        self.ensure_consistent().await?;
        let now = self.ctx.clock.now();
        self.refresh_status(now);
        Ok(self.hub.subscribe(&self.tally, self.last_status))
    }

    async fn audit(&mut self) -> Result<AuditReport> {
        let ballots = self.ledger.replay(&self.poll.id).await?;
        let rebuilt = Tally::rebuild(&self.poll.id, self.poll.option_ids(), &ballots);
        let consistent = rebuilt == self.tally;

        let report = AuditReport {
            poll_id: self.poll.id.clone(),
            consistent,
            ballots: ballots.len() as u64,
            incremental: self.tally.snapshot(),
            rebuilt: rebuilt.snapshot(),
        };

        if !consistent {
            warn!(
                "Tally of poll {} diverged from its ledger ({:?} vs {:?}), rebuilding",
                self.poll.id, report.incremental, report.rebuilt
            );
            self.tally = rebuilt;
            self.hub.publish_snapshot(&self.tally, self.last_status);
        }
        self.needs_rebuild = false;

        Ok(report)
    }

    fn tick(&mut self) {
        let now = self.ctx.clock.now();
        self.refresh_status(now);
        self.hub.resync_stale(&self.tally, self.last_status);

        // A finished poll nobody watches needs no actor; the next request
        // starts a fresh one from the ledger.
        if self.last_status == PollStatus::Completed && self.hub.is_empty() {
            info!("Retiring idle actor of completed poll {}", self.poll.id);
            self.retiring = true;
            self.rx.close();
        }
    }

    async fn ensure_consistent(&mut self) -> Result<()> {
        if self.needs_rebuild {
            self.rebuild().await?;
        }
        Ok(())
    }

    async fn rebuild(&mut self) -> Result<()> {
        let ballots = self.ledger.replay(&self.poll.id).await?;
        self.tally = Tally::rebuild(&self.poll.id, self.poll.option_ids(), &ballots);
        self.needs_rebuild = false;
        debug!("Rebuilt tally of poll {} from {} ballot(s)", self.poll.id, ballots.len());
        if !self.hub.is_empty() {
            self.hub.publish_snapshot(&self.tally, self.last_status);
        }
        Ok(())
    }

    fn refresh_status(&mut self, now: DateTime<Utc>) {
        let status = self.poll.status(now);
        if status != self.last_status {
            info!("Poll {} is now {} (was {})", self.poll.id, status, self.last_status);
            self.last_status = status;
            self.hub.publish_status(&self.tally, status);
        }
    }
}

fn reject(command: Command, err: impl Fn() -> EngineError) {
    match command {
        Command::Cast { reply, .. } => {
            let _ = reply.send(Err(err()));
        }
        Command::Close { reply, .. } => {
            let _ = reply.send(Err(err()));
        }
        Command::Update { reply, .. } => {
            let _ = reply.send(Err(err()));
        }
        Command::Delete { reply, .. } => {
            let _ = reply.send(Err(err()));
        }
        Command::Results { reply } => {
            let _ = reply.send(Err(err()));
        }
        Command::Subscribe { reply } => {
            let _ = reply.send(Err(err()));
        }
        Command::Audit { reply } => {
            let _ = reply.send(Err(err()));
        }
        Command::Tick => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::models::NewPoll;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn context() -> ActorContext {
        ActorContext {
            store: Arc::new(Database::in_memory().await.unwrap()),
            clock: Arc::new(ManualClock::new(t0() + Duration::seconds(10))),
            admins: Arc::new(Admins::new(["root"])),
            mailbox_capacity: 8,
            subscriber_capacity: 8,
        }
    }

    fn poll() -> Poll {
        Poll::new(
            NewPoll {
                title: "P".to_string(),
                description: String::new(),
                options: vec!["A".into(), "B".into()],
                starts_at: t0(),
                ends_at: t0() + Duration::seconds(3600),
                created_by: "root".to_string(),
            },
            t0(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn actor_started_for_a_deleted_poll_answers_not_found() {
        let ctx = context().await;
        // Loaded by the registry, then deleted before the actor started.
        let poll = poll();
        let option_id = poll.options[0].id.clone();
        let handle = PollActor::spawn(poll, ctx.clone());

        let cast = handle
            .request(|reply| Command::Cast {
                voter_id: "v1".to_string(),
                option_id,
                reply,
            })
            .await;
        assert!(matches!(cast, Err(EngineError::NotFound(_))), "{:?}", cast.map(|_| ()));
        assert!(ctx.store.ballots_for_poll(&handle.poll_id).await.unwrap().is_empty());

        tokio::time::timeout(std::time::Duration::from_secs(5), handle.tx.closed())
            .await
            .expect("actor kept running");
    }

    #[tokio::test]
    async fn stored_poll_is_reloaded_on_start() {
        let ctx = context().await;
        let stored = poll();
        ctx.store.insert_poll(&stored).await.unwrap();
        ctx.store.mark_closed(&stored.id, "root", t0() + Duration::seconds(5)).await.unwrap();

        // The registry's copy predates the close.
        let handle = PollActor::spawn(stored, ctx);
        let results = handle.request(|reply| Command::Results { reply }).await.unwrap();
        assert_eq!(results.status, PollStatus::Completed);
    }
}
