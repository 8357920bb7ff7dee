use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::models::Ballot;

/// option id -> count
pub type Counts = BTreeMap<String, u64>;

/// The +1 produced by one accepted ballot. Identified by (poll, voter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyDelta {
    pub poll_id: String,
    pub voter_id: String,
    pub option_id: String,
}

impl From<&Ballot> for TallyDelta {
    fn from(ballot: &Ballot) -> Self {
        Self {
            poll_id: ballot.poll_id.clone(),
            voter_id: ballot.voter_id.clone(),
            option_id: ballot.option_id.clone(),
        }
    }
}

/// Cached per-poll projection of the ballot ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    poll_id: String,
    counts: Counts,
    // voters whose ballot is already counted
    applied: HashSet<String>,
}

impl Tally {
    pub fn new<'a>(poll_id: &str, option_ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            poll_id: poll_id.to_string(),
            counts: option_ids.into_iter().map(|id| (id.to_string(), 0)).collect(),
            applied: HashSet::new(),
        }
    }

    /// Replays `ballots` onto a zeroed tally.
    pub fn rebuild<'a, 'b>(
        poll_id: &str,
        option_ids: impl IntoIterator<Item = &'a str>,
        ballots: impl IntoIterator<Item = &'b Ballot>,
    ) -> Self {
        let mut tally = Self::new(poll_id, option_ids);
        for ballot in ballots {
            tally.apply(&TallyDelta::from(ballot));
        }
        tally
    }

    /// Counts one ballot and returns the option's new total.
    ///
    /// Returns `None` and leaves the tally untouched when the delta was
    /// already applied or does not belong to this poll's option set.
    pub fn apply(&mut self, delta: &TallyDelta) -> Option<u64> {
        if delta.poll_id != self.poll_id {
            warn!("Delta for poll {} routed to tally of poll {}", delta.poll_id, self.poll_id);
            return None;
        }
        if self.applied.contains(&delta.voter_id) {
            return None;
        }
        let Some(count) = self.counts.get_mut(&delta.option_id) else {
            warn!("Delta for unknown option {} in poll {}", delta.option_id, self.poll_id);
            return None;
        };
        *count += 1;
        self.applied.insert(delta.voter_id.clone());
        Some(*count)
    }

    pub fn snapshot(&self) -> Counts {
        self.counts.clone()
    }

    pub fn count(&self, option_id: &str) -> Option<u64> {
        self.counts.get(option_id).copied()
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn poll_id(&self) -> &str {
        &self.poll_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ballot(voter: &str, option: &str) -> Ballot {
        Ballot {
            poll_id: "p".to_string(),
            voter_id: voter.to_string(),
            option_id: option.to_string(),
            cast_at: Utc::now(),
        }
    }

    #[test]
    fn apply_counts_each_ballot_once() {
        let mut tally = Tally::new("p", ["a", "b"]);
        let delta = TallyDelta::from(&ballot("v1", "a"));

        assert_eq!(tally.apply(&delta), Some(1));
        assert_eq!(tally.apply(&delta), None);
        assert_eq!(tally.count("a"), Some(1));
        assert_eq!(tally.count("b"), Some(0));
        assert_eq!(tally.total(), 1);
    }

    #[test]
    fn apply_ignores_foreign_deltas() {
        let mut tally = Tally::new("p", ["a"]);
        assert_eq!(tally.apply(&TallyDelta::from(&ballot("v1", "zzz"))), None);

        let mut other_poll = TallyDelta::from(&ballot("v2", "a"));
        other_poll.poll_id = "q".to_string();
        assert_eq!(tally.apply(&other_poll), None);
        assert_eq!(tally.total(), 0);
    }

    #[test]
    fn rebuild_matches_incremental() {
        let ballots = vec![
            ballot("v1", "a"),
            ballot("v2", "b"),
            ballot("v3", "a"),
            ballot("v4", "a"),
        ];

        let mut incremental = Tally::new("p", ["a", "b", "c"]);
        for b in &ballots {
            incremental.apply(&TallyDelta::from(b));
        }
        let rebuilt = Tally::rebuild("p", ["a", "b", "c"], &ballots);

        assert_eq!(rebuilt, incremental);
        assert_eq!(rebuilt.snapshot().get("a"), Some(&3));
        assert_eq!(rebuilt.snapshot().get("c"), Some(&0));
    }
}
