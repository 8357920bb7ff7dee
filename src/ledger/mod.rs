use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::PollStore;
use crate::error::{EngineError, StateError, StoreError};
use crate::lifecycle::PollStatus;
use crate::models::{Ballot, Poll};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    PollNotActive,
    UnknownOption,
    DuplicateVote,
}

impl From<RejectReason> for StateError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::PollNotActive => StateError::PollNotActive,
            RejectReason::UnknownOption => StateError::UnknownOption,
            RejectReason::DuplicateVote => StateError::DuplicateVote,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CastOutcome {
    Accepted { ballot: Ballot },
    Rejected { reason: RejectReason },
}

impl CastOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CastOutcome::Accepted { .. })
    }

    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            CastOutcome::Accepted { .. } => None,
            CastOutcome::Rejected { reason } => Some(*reason),
        }
    }

    pub fn into_result(self) -> Result<Ballot, EngineError> {
        match self {
            CastOutcome::Accepted { ballot } => Ok(ballot),
            CastOutcome::Rejected { reason } => Err(StateError::from(reason).into()),
        }
    }
}

/// Append-only record of accepted ballots.
///
/// Callers must serialize `commit` per poll; the poll passed in is the
/// caller's current view and its status is evaluated at `now`.
#[derive(Clone)]
pub struct BallotLedger {
    store: Arc<dyn PollStore>,
}

impl BallotLedger {
    pub fn new(store: Arc<dyn PollStore>) -> Self {
        Self { store }
    }

    pub async fn commit(
        &self,
        poll: &Poll,
        voter_id: &str,
        option_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CastOutcome, StoreError> {
        let status = poll.status(now);
        if status != PollStatus::Active {
            debug!("Rejecting ballot of {} in poll {}: poll is {}", voter_id, poll.id, status);
            return Ok(CastOutcome::Rejected { reason: RejectReason::PollNotActive });
        }
        if !poll.has_option(option_id) {
            debug!("Rejecting ballot of {} in poll {}: unknown option {}", voter_id, poll.id, option_id);
            return Ok(CastOutcome::Rejected { reason: RejectReason::UnknownOption });
        }

        let ballot = Ballot {
            poll_id: poll.id.clone(),
            voter_id: voter_id.to_string(),
            option_id: option_id.to_string(),
            cast_at: now,
        };

        if !self.store.insert_ballot(&ballot).await? {
            debug!("Rejecting ballot of {} in poll {}: already voted", voter_id, poll.id);
            return Ok(CastOutcome::Rejected { reason: RejectReason::DuplicateVote });
        }

        info!("Accepted ballot: poll_id={}, voter_id={}, option_id={}", poll.id, voter_id, option_id);
        Ok(CastOutcome::Accepted { ballot })
    }

    pub async fn replay(&self, poll_id: &str) -> Result<Vec<Ballot>, StoreError> {
        self.store.ballots_for_poll(poll_id).await
    }

    pub async fn ballot_of(&self, poll_id: &str, voter_id: &str) -> Result<Option<Ballot>, StoreError> {
        self.store.ballot_of(poll_id, voter_id).await
    }
}
