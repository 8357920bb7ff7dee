//! Poll lifecycle state machine and live result aggregation.
//!
//! A poll's status is derived from its voting window and an early-close
//! override. Ballots go through a per-poll actor that checks status at commit
//! time, appends to the ledger, updates the cached tally and pushes the change
//! to live subscribers.

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod lifecycle;
pub mod models;
pub mod tally;
pub mod tasks;

pub use broadcast::{ResultsEvent, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use db::{Database, PollStore};
pub use engine::{AuditReport, Engine, EngineSettings, Results};
pub use error::{EngineError, Result};
pub use ledger::{CastOutcome, RejectReason};
pub use lifecycle::{Admins, CloseOutcome, CloseRejection, PollStatus};
pub use models::{Ballot, NewPoll, OptionSpec, Poll, PollOption, PollUpdate, PollView};
