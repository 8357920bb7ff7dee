use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::lifecycle::{self, PollStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub title: String,
    pub description: String,
    pub options: Vec<PollOption>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    // Early-close override set by an administrator
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An option as supplied by the caller, before it gets an id.
///
/// Deserializes from either a bare label string or `{"label": .., "description": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawOptionSpec")]
pub struct OptionSpec {
    pub label: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOptionSpec {
    Label(String),
    Full {
        label: String,
        #[serde(default)]
        description: Option<String>,
    },
}

impl From<RawOptionSpec> for OptionSpec {
    fn from(raw: RawOptionSpec) -> Self {
        match raw {
            RawOptionSpec::Label(label) => OptionSpec { label, description: None },
            RawOptionSpec::Full { label, description } => OptionSpec { label, description },
        }
    }
}

impl From<&str> for OptionSpec {
    fn from(label: &str) -> Self {
        OptionSpec {
            label: label.to_string(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPoll {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub options: Vec<OptionSpec>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub created_by: String,
}

/// Partial edit of a poll. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub options: Option<Vec<OptionSpec>>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

impl PollUpdate {
    /// Whether the edit touches the option set or the voting window.
    pub fn is_structural(&self) -> bool {
        self.options.is_some() || self.starts_at.is_some() || self.ends_at.is_some()
    }
}

/// One voter's recorded choice in one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub poll_id: String,
    pub voter_id: String,
    pub option_id: String,
    pub cast_at: DateTime<Utc>,
}

/// A poll together with its status as of the moment it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollView {
    #[serde(flatten)]
    pub poll: Poll,
    pub status: PollStatus,
}

impl Poll {
    pub fn new(new_poll: NewPoll, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        validate_definition(
            &new_poll.title,
            &new_poll.options,
            new_poll.starts_at,
            new_poll.ends_at,
        )?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            title: new_poll.title.trim().to_string(),
            description: new_poll.description,
            options: build_options(new_poll.options),
            starts_at: new_poll.starts_at,
            ends_at: new_poll.ends_at,
            created_by: new_poll.created_by,
            created_at: now,
            closed_at: None,
            closed_by: None,
        })
    }

    pub fn status(&self, now: DateTime<Utc>) -> PollStatus {
        lifecycle::status_of(self.starts_at, self.ends_at, now, self.closed_at.is_some())
    }

    pub fn view(&self, now: DateTime<Utc>) -> PollView {
        PollView {
            poll: self.clone(),
            status: self.status(now),
        }
    }

    pub fn has_option(&self, option_id: &str) -> bool {
        self.options.iter().any(|option| option.id == option_id)
    }

    pub fn option_ids(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(|option| option.id.as_str())
    }

    /// Returns a copy of this poll with `update` applied and re-validated.
    /// Replaced options get fresh ids.
    pub fn with_update(&self, update: PollUpdate) -> Result<Self, ValidationError> {
        let mut next = self.clone();
        if let Some(title) = update.title {
            next.title = title.trim().to_string();
        }
        if let Some(description) = update.description {
            next.description = description;
        }
        if let Some(starts_at) = update.starts_at {
            next.starts_at = starts_at;
        }
        if let Some(ends_at) = update.ends_at {
            next.ends_at = ends_at;
        }

        match update.options {
            Some(specs) => {
                validate_definition(&next.title, &specs, next.starts_at, next.ends_at)?;
                next.options = build_options(specs);
            }
            None => {
                let specs: Vec<OptionSpec> = next
                    .options
                    .iter()
                    .map(|option| OptionSpec {
                        label: option.label.clone(),
                        description: option.description.clone(),
                    })
                    .collect();
                validate_definition(&next.title, &specs, next.starts_at, next.ends_at)?;
            }
        }

        Ok(next)
    }
}

fn build_options(specs: Vec<OptionSpec>) -> Vec<PollOption> {
    specs
        .into_iter()
        .map(|spec| PollOption {
            id: Uuid::new_v4().to_string(),
            label: spec.label.trim().to_string(),
            description: spec.description,
        })
        .collect()
}

pub fn validate_definition(
    title: &str,
    options: &[OptionSpec],
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    if options.is_empty() {
        return Err(ValidationError::NoOptions);
    }

    let mut seen = HashSet::new();
    for option in options {
        let label = option.label.trim();
        if label.is_empty() {
            return Err(ValidationError::EmptyOptionLabel);
        }
        if !seen.insert(label.to_lowercase()) {
            return Err(ValidationError::DuplicateOption(label.to_string()));
        }
    }

    if starts_at >= ends_at {
        return Err(ValidationError::InvalidWindow { starts_at, ends_at });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn new_poll(options: &[&str]) -> NewPoll {
        NewPoll {
            title: "Lunch".to_string(),
            description: String::new(),
            options: options.iter().map(|label| OptionSpec::from(*label)).collect(),
            starts_at: t0(),
            ends_at: t0() + Duration::hours(1),
            created_by: "admin".to_string(),
        }
    }

    #[test]
    fn new_poll_assigns_distinct_option_ids() {
        let poll = Poll::new(new_poll(&["Pizza", "Tacos"]), t0()).unwrap();
        assert_eq!(poll.options.len(), 2);
        assert_ne!(poll.options[0].id, poll.options[1].id);
        assert_eq!(poll.options[0].label, "Pizza");
        assert!(poll.closed_at.is_none());
    }

    #[test]
    fn rejects_malformed_definitions() {
        assert_eq!(
            Poll::new(new_poll(&[]), t0()).unwrap_err(),
            ValidationError::NoOptions
        );
        assert_eq!(
            Poll::new(new_poll(&["Pizza", " pizza "]), t0()).unwrap_err(),
            ValidationError::DuplicateOption("pizza".to_string())
        );
        assert_eq!(
            Poll::new(new_poll(&["Pizza", "  "]), t0()).unwrap_err(),
            ValidationError::EmptyOptionLabel
        );

        let mut backwards = new_poll(&["Pizza"]);
        backwards.ends_at = backwards.starts_at;
        assert!(matches!(
            Poll::new(backwards, t0()),
            Err(ValidationError::InvalidWindow { .. })
        ));

        let mut untitled = new_poll(&["Pizza"]);
        untitled.title = " ".to_string();
        assert_eq!(Poll::new(untitled, t0()).unwrap_err(), ValidationError::EmptyTitle);
    }

    #[test]
    fn update_keeps_option_ids_unless_options_replaced() {
        let poll = Poll::new(new_poll(&["Pizza", "Tacos"]), t0()).unwrap();

        let renamed = poll
            .with_update(PollUpdate {
                title: Some("Dinner".to_string()),
                ..PollUpdate::default()
            })
            .unwrap();
        assert_eq!(renamed.title, "Dinner");
        assert_eq!(renamed.options, poll.options);

        let replaced = poll
            .with_update(PollUpdate {
                options: Some(vec!["Sushi".into()]),
                ..PollUpdate::default()
            })
            .unwrap();
        assert_eq!(replaced.options.len(), 1);
        assert_eq!(replaced.options[0].label, "Sushi");

        let inverted = poll.with_update(PollUpdate {
            ends_at: Some(t0() - Duration::minutes(1)),
            ..PollUpdate::default()
        });
        assert!(matches!(inverted, Err(ValidationError::InvalidWindow { .. })));
    }

    #[test]
    fn option_spec_accepts_string_or_object() {
        let specs: Vec<OptionSpec> =
            serde_json::from_str(r#"["A", {"label": "B", "description": "second"}]"#).unwrap();
        assert_eq!(specs[0], OptionSpec::from("A"));
        assert_eq!(specs[1].description.as_deref(), Some("second"));
    }
}
