//! Feature data model.
//!
//! A feature is an atomic unit of verifiable functionality. It has identity
//! (a monotonically increasing id), a queue position (priority), descriptive
//! text the engine never interprets, and a disposition derived from its
//! status flags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Feature
// ---------------------------------------------------------------------------

/// A unit of work tracked by the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Unique identifier. Assigned at creation, never reused.
    pub id: FeatureId,

    /// Queue position. Lower = earlier; ties broken by `id`.
    pub priority: i64,

    pub category: String,
    pub name: String,
    pub description: String,

    /// Verification steps. Never empty, immutable after creation.
    pub steps: Vec<String>,

    /// Terminal-success flag.
    pub passes: bool,

    /// Advisory flag set by the session driver. Not a lock.
    pub in_progress: bool,

    /// Consecutive failures since the last pass or skip.
    pub failure_count: u32,

    /// Most recent failure detail.
    pub last_error: Option<String>,

    pub skipped: bool,

    /// Only meaningful while `skipped` is set: distinguishes awaiting review
    /// from resolved.
    pub approved: bool,

    /// Present iff `skipped`.
    pub skip_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Feature {
    /// Disposition derived from the status flags.
    pub fn state(&self) -> State {
        State::from_flags(self.passes, self.skipped, self.approved)
    }
}

/// Newtype for feature IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(pub i64);

impl std::fmt::Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl std::str::FromStr for FeatureId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim_start_matches('#')
            .parse::<i64>()
            .map(FeatureId)
            .map_err(|_| Error::Validation(format!("invalid feature id: {s}")))
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Disposition of a feature. Exactly one applies at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Eligible for work assignment.
    Pending,
    /// Implemented and verified. Terminal.
    Passing,
    /// Evicted from the queue, waiting for a reviewer.
    SkippedPendingReview,
    /// Skip confirmed by a reviewer. Terminal.
    SkippedResolved,
}

impl State {
    pub fn from_flags(passes: bool, skipped: bool, approved: bool) -> Self {
        match (passes, skipped, approved) {
            (true, _, _) => State::Passing,
            (false, true, true) => State::SkippedResolved,
            (false, true, false) => State::SkippedPendingReview,
            (false, false, _) => State::Pending,
        }
    }

    /// Can transition from self to `to`? Terminal states have no outgoing
    /// edges; reopening a passing feature after a failed regression check
    /// is a separate administrative path.
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Pending, Passing)
                | (Pending, SkippedPendingReview)
                | (SkippedPendingReview, SkippedPendingReview) // re-skip with a new reason
                | (SkippedPendingReview, Passing)
                | (SkippedPendingReview, Pending)              // approve
                | (SkippedPendingReview, SkippedResolved)      // reject
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Passing | State::SkippedResolved)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Passing => "passing",
            State::SkippedPendingReview => "skipped_pending_review",
            State::SkippedResolved => "skipped_resolved",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(State::Pending),
            "passing" => Ok(State::Passing),
            "skipped_pending_review" | "review" => Ok(State::SkippedPendingReview),
            "skipped_resolved" | "rejected" => Ok(State::SkippedResolved),
            _ => Err(Error::Validation(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Work descriptor for creating a feature. Priority and id are assigned by
/// the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFeature {
    pub category: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<String>,
    /// Legacy imports carry their pass flag across; everything else starts
    /// pending.
    #[serde(skip)]
    pub(crate) passes: bool,
}

impl NewFeature {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            passes: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn steps<I, T>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.steps.extend(steps.into_iter().map(Into::into));
        self
    }

    pub(crate) fn already_passing(mut self, passes: bool) -> Self {
        self.passes = passes;
        self
    }

    /// Check the creation invariants: a non-blank name and at least one step.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("feature name must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(Error::Validation(format!(
                "feature '{}' must have at least one step",
                self.name
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

/// The only field the generic update path may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassesUpdate {
    pub passes: bool,
}

/// Progress summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub passing: u64,
    pub total: u64,
    /// `100 * passing / total`, or 0 for an empty backlog.
    pub percentage: f64,
}

impl Stats {
    pub fn new(passing: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            100.0 * passing as f64 / total as f64
        };
        Self {
            passing,
            total,
            percentage,
        }
    }
}

/// Result of moving a feature to the end of the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipReport {
    pub feature: Feature,
    pub old_priority: i64,
    pub new_priority: i64,
}

/// Result of recording a failure, for stuck-loop detection by the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub feature: Feature,
    pub failure_count: u32,
    pub max_failures: u32,
    /// The driver should consider skipping this feature.
    pub threshold_exceeded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_follows_flags() {
        assert_eq!(State::from_flags(false, false, false), State::Pending);
        // approve leaves approved set on a pending item
        assert_eq!(State::from_flags(false, false, true), State::Pending);
        assert_eq!(State::from_flags(true, false, false), State::Passing);
        assert_eq!(
            State::from_flags(false, true, false),
            State::SkippedPendingReview
        );
        assert_eq!(State::from_flags(false, true, true), State::SkippedResolved);
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        let all = [
            State::Pending,
            State::Passing,
            State::SkippedPendingReview,
            State::SkippedResolved,
        ];
        for from in all.into_iter().filter(|s| s.is_terminal()) {
            assert!(all.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn resolved_skip_is_terminal() {
        assert!(State::SkippedResolved.is_terminal());
        assert!(!State::SkippedResolved.can_transition_to(State::Pending));
        assert!(!State::SkippedResolved.can_transition_to(State::Passing));
    }

    #[test]
    fn stats_percentage_handles_empty_backlog() {
        assert_eq!(Stats::new(0, 0).percentage, 0.0);
        assert_eq!(Stats::new(1, 4).percentage, 25.0);
        assert_eq!(Stats::new(3, 3).percentage, 100.0);
    }

    #[test]
    fn validate_rejects_missing_steps_and_blank_name() {
        assert!(matches!(
            NewFeature::new("ui", "login").validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            NewFeature::new("ui", "  ").step("open page").validate(),
            Err(Error::Validation(_))
        ));
        assert!(NewFeature::new("ui", "login").step("open page").validate().is_ok());
    }

    #[test]
    fn feature_id_parses_with_or_without_hash() {
        assert_eq!("#12".parse::<FeatureId>().unwrap(), FeatureId(12));
        assert_eq!("7".parse::<FeatureId>().unwrap(), FeatureId(7));
        assert!("abc".parse::<FeatureId>().is_err());
    }
}
