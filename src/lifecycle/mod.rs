//! Poll status derivation and administrative lifecycle control.
//!
//! Status is never stored. It is recomputed from the voting window, the
//! current time and the early-close override every time it is needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{AuthorizationError, EngineError, StateError};
use crate::models::{Poll, PollUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollStatus {
    Pending,
    Active,
    Completed,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Pending => "PENDING",
            PollStatus::Active => "ACTIVE",
            PollStatus::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for PollStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure status function over the voting window.
///
/// An early-closed poll is `Completed` regardless of the window, which also
/// covers a pending poll that was cancelled before it opened.
pub fn status_of(
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    now: DateTime<Utc>,
    closed_early: bool,
) -> PollStatus {
    if closed_early || now >= ends_at {
        PollStatus::Completed
    } else if now < starts_at {
        PollStatus::Pending
    } else {
        PollStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseRejection {
    NotAdmin,
    AlreadyCompleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CloseOutcome {
    Accepted { closed_at: DateTime<Utc> },
    Rejected { reason: CloseRejection },
}

impl CloseOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CloseOutcome::Accepted { .. })
    }

    pub fn into_result(self, admin_id: &str) -> Result<DateTime<Utc>, EngineError> {
        match self {
            CloseOutcome::Accepted { closed_at } => Ok(closed_at),
            CloseOutcome::Rejected { reason: CloseRejection::NotAdmin } => {
                Err(AuthorizationError::NotAdmin(admin_id.to_string()).into())
            }
            CloseOutcome::Rejected { reason: CloseRejection::AlreadyCompleted } => {
                Err(StateError::AlreadyCompleted.into())
            }
        }
    }
}

/// The set of principals allowed to control poll lifecycles.
#[derive(Debug, Clone, Default)]
pub struct Admins(HashSet<String>);

impl Admins {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(ids.into_iter().map(Into::into).collect())
    }

    pub fn is_admin(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn check_close(
    poll: &Poll,
    admin_id: &str,
    admins: &Admins,
    now: DateTime<Utc>,
) -> Result<(), CloseRejection> {
    if !admins.is_admin(admin_id) {
        return Err(CloseRejection::NotAdmin);
    }
    if poll.status(now) == PollStatus::Completed {
        return Err(CloseRejection::AlreadyCompleted);
    }
    Ok(())
}

/// Options and the voting window are frozen once a poll leaves `Pending`;
/// completed polls accept no edits at all.
pub fn check_edit(
    poll: &Poll,
    admin_id: &str,
    admins: &Admins,
    update: &PollUpdate,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    if !admins.is_admin(admin_id) {
        return Err(AuthorizationError::NotAdmin(admin_id.to_string()).into());
    }
    match poll.status(now) {
        PollStatus::Completed => Err(StateError::AlreadyCompleted.into()),
        PollStatus::Active if update.is_structural() => Err(StateError::NotPending.into()),
        _ => Ok(()),
    }
}

/// Only pending polls can be deleted, so no ballot is ever discarded.
pub fn check_delete(
    poll: &Poll,
    admin_id: &str,
    admins: &Admins,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    if !admins.is_admin(admin_id) {
        return Err(AuthorizationError::NotAdmin(admin_id.to_string()).into());
    }
    if poll.status(now) != PollStatus::Pending {
        return Err(StateError::NotPending.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewPoll, OptionSpec};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn poll() -> Poll {
        Poll::new(
            NewPoll {
                title: "Lunch".to_string(),
                description: String::new(),
                options: vec![OptionSpec::from("A"), OptionSpec::from("B")],
                starts_at: t0(),
                ends_at: t0() + Duration::seconds(3600),
                created_by: "root".to_string(),
            },
            t0() - Duration::days(1),
        )
        .unwrap()
    }

    #[test]
    fn status_follows_the_window() {
        let start = t0();
        let end = t0() + Duration::seconds(3600);

        assert_eq!(status_of(start, end, start - Duration::seconds(1), false), PollStatus::Pending);
        assert_eq!(status_of(start, end, start, false), PollStatus::Active);
        assert_eq!(status_of(start, end, end - Duration::seconds(1), false), PollStatus::Active);
        assert_eq!(status_of(start, end, end, false), PollStatus::Completed);
        assert_eq!(status_of(start, end, end + Duration::days(3), false), PollStatus::Completed);
    }

    #[test]
    fn early_close_overrides_the_window() {
        let start = t0();
        let end = t0() + Duration::seconds(3600);

        assert_eq!(status_of(start, end, start + Duration::seconds(10), true), PollStatus::Completed);
        assert_eq!(status_of(start, end, start - Duration::seconds(10), true), PollStatus::Completed);
    }

    #[test]
    fn status_is_deterministic() {
        let start = t0();
        let end = t0() + Duration::seconds(3600);
        let now = start + Duration::seconds(42);
        let first = status_of(start, end, now, false);
        for _ in 0..100 {
            assert_eq!(status_of(start, end, now, false), first);
        }
    }

    #[test]
    fn close_requires_admin_and_an_open_poll() {
        let admins = Admins::new(["root"]);
        let poll = poll();
        let during = t0() + Duration::seconds(10);

        assert_eq!(check_close(&poll, "mallory", &admins, during), Err(CloseRejection::NotAdmin));
        assert_eq!(check_close(&poll, "root", &admins, during), Ok(()));
        assert_eq!(
            check_close(&poll, "root", &admins, t0() + Duration::seconds(3600)),
            Err(CloseRejection::AlreadyCompleted)
        );

        let mut closed = poll.clone();
        closed.closed_at = Some(during);
        assert_eq!(check_close(&closed, "root", &admins, during), Err(CloseRejection::AlreadyCompleted));
    }

    #[test]
    fn active_polls_only_take_cosmetic_edits() {
        let admins = Admins::new(["root"]);
        let poll = poll();
        let during = t0() + Duration::seconds(10);

        let retitle = PollUpdate {
            title: Some("Brunch".to_string()),
            ..PollUpdate::default()
        };
        let reoption = PollUpdate {
            options: Some(vec!["C".into()]),
            ..PollUpdate::default()
        };

        assert!(check_edit(&poll, "root", &admins, &retitle, during).is_ok());
        assert!(matches!(
            check_edit(&poll, "root", &admins, &reoption, during),
            Err(EngineError::State(StateError::NotPending))
        ));
        assert!(check_edit(&poll, "root", &admins, &reoption, t0() - Duration::seconds(1)).is_ok());
        assert!(matches!(
            check_edit(&poll, "bob", &admins, &retitle, during),
            Err(EngineError::Authorization(_))
        ));
    }

    #[test]
    fn only_pending_polls_can_be_deleted() {
        let admins = Admins::new(["root"]);
        let poll = poll();
        assert!(check_delete(&poll, "root", &admins, t0() - Duration::seconds(1)).is_ok());
        assert!(matches!(
            check_delete(&poll, "root", &admins, t0()),
            Err(EngineError::State(StateError::NotPending))
        ));
    }
}
