//! Backlog store abstraction.
//!
//! Single source of truth for feature state. Every mutation is applied as
//! one atomic, guarded update: the store re-checks the observed state at
//! write time so a transition computed against stale data cannot land.
//! Two implementations exist: [`memory::MemoryStore`] for tests and
//! embedding, and [`crate::db::Db`] (SQLite) for production.

pub mod memory;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use crate::error::{Error, Result};
use crate::model::feature::{Feature, FeatureId, NewFeature, State, Stats};

/// Storage backend for the backlog.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Insert a batch, preserving input order. Each feature gets the next id
    /// and `priority = max + 1 + offset`. The whole batch is rejected if any
    /// item fails validation.
    async fn insert(&self, items: Vec<NewFeature>) -> Result<Vec<FeatureId>>;

    /// Like [`insert`](Self::insert), but only when the backlog holds no
    /// rows. The emptiness check and the insert are one atomic step; returns
    /// `None` and writes nothing when rows already exist.
    async fn insert_if_empty(&self, items: Vec<NewFeature>) -> Result<Option<Vec<FeatureId>>>;

    async fn get(&self, id: FeatureId) -> Result<Feature>;

    /// Filtered listing. Ordered by `(priority, id)` unless `query.random`.
    async fn list(&self, query: &ListQuery) -> Result<Vec<Feature>>;

    /// The pending feature with the smallest `(priority, id)`.
    async fn next_pending(&self) -> Result<Option<Feature>>;

    /// Apply a mutation atomically, returning the feature before and after.
    ///
    /// A mutation that no longer applies because another writer moved the
    /// feature first is re-planned against the current row: it returns the
    /// unchanged row when the feature already sits in the target state, and
    /// [`Error::InvalidTransition`] when the new state rules it out.
    /// [`Error::Conflict`] is left for writes whose guard failed but which
    /// would still be legal from the current state, so callers may retry
    /// those. A store that serializes all writers never reports a conflict.
    async fn update(&self, id: FeatureId, mutation: Mutation) -> Result<Change>;

    async fn stats(&self) -> Result<Stats>;

    /// Administrative escape hatch. Ids are never reused afterwards.
    async fn delete(&self, id: FeatureId) -> Result<()>;

    async fn health_check(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filters for [`FeatureStore::list`].
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub passes: Option<bool>,
    pub category: Option<String>,
    pub state: Option<State>,
    pub limit: usize,
    /// Ignored for random sampling.
    pub offset: usize,
    /// Uniform sample of the filtered set instead of queue order.
    pub random: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            passes: None,
            category: None,
            state: None,
            limit: usize::MAX,
            offset: 0,
            random: false,
        }
    }
}

impl ListQuery {
    pub fn matches(&self, feature: &Feature) -> bool {
        self.passes.is_none_or(|p| feature.passes == p)
            && self
                .category
                .as_deref()
                .is_none_or(|c| feature.category == c)
            && self.state.is_none_or(|s| feature.state() == s)
    }
}

/// Shuffle-then-slice. Works for any backend since it only needs the ids of
/// the filtered set.
pub(crate) fn sample_ids(mut ids: Vec<FeatureId>, n: usize) -> Vec<FeatureId> {
    ids.shuffle(&mut rand::rng());
    ids.truncate(n);
    ids
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// A field-level mutation. Each variant knows which states it may start
/// from; the store enforces that guard inside its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    MarkPassing,
    /// Passing -> Pending, when a regression check fails.
    MarkFailing,
    Skip { reason: String },
    Approve,
    RejectSkip,
    RecordFailure { message: String },
    SetInProgress(bool),
}

/// What a mutation does to a feature in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Write, moving the feature to `to`.
    Apply { to: State },
    /// Already in the target state; nothing to write.
    NoOp,
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::MarkPassing => "mark_passing",
            Mutation::MarkFailing => "mark_failing",
            Mutation::Skip { .. } => "skip",
            Mutation::Approve => "approve",
            Mutation::RejectSkip => "reject_skip",
            Mutation::RecordFailure { .. } => "record_failure",
            Mutation::SetInProgress(_) => "set_in_progress",
        }
    }

    /// Whether the write must be conditioned on the observed state.
    /// `in_progress` and `last_error` are last-writer-wins.
    pub fn is_guarded(&self) -> bool {
        !matches!(
            self,
            Mutation::RecordFailure { .. } | Mutation::SetInProgress(_)
        )
    }

    /// Decide what applying this mutation to a feature in `from` means.
    pub fn plan(&self, from: State) -> Result<Plan> {
        let to = match self {
            Mutation::MarkPassing if from == State::Passing => return Ok(Plan::NoOp),
            Mutation::MarkPassing => State::Passing,
            Mutation::MarkFailing if from != State::Passing => return Ok(Plan::NoOp),
            Mutation::MarkFailing => State::Pending,
            Mutation::Skip { .. } => State::SkippedPendingReview,
            Mutation::Approve => State::Pending,
            Mutation::RejectSkip => State::SkippedResolved,
            Mutation::RecordFailure { .. } | Mutation::SetInProgress(_) => {
                return Ok(Plan::Apply { to: from });
            }
        };

        // Approve only re-admits an item awaiting review; a pending item that
        // was approved earlier has no skip to approve.
        // MarkFailing reopens a passing feature outside the normal lifecycle
        // when a regression check fails; it only gets here from Passing.
        let allowed = match self {
            Mutation::Approve => from == State::SkippedPendingReview,
            Mutation::MarkFailing => true,
            _ => from.can_transition_to(to),
        };
        if !allowed {
            return Err(Error::InvalidTransition { from, to });
        }
        Ok(Plan::Apply { to })
    }

    /// Apply the field changes to an in-memory feature. `next_priority` is
    /// `max(priority) + 1` over the whole backlog, read under the same lock.
    pub(crate) fn apply(&self, feature: &mut Feature, next_priority: i64) {
        match self {
            Mutation::MarkPassing => {
                feature.passes = true;
                feature.failure_count = 0;
                feature.in_progress = false;
                feature.last_error = None;
                feature.skipped = false;
                feature.skip_reason = None;
            }
            Mutation::MarkFailing => {
                feature.passes = false;
                feature.in_progress = false;
            }
            Mutation::Skip { reason } => {
                feature.skipped = true;
                feature.approved = false;
                feature.skip_reason = Some(reason.clone());
                feature.priority = next_priority;
                feature.in_progress = false;
                feature.failure_count = 0;
                feature.last_error = None;
            }
            Mutation::Approve => {
                feature.skipped = false;
                feature.approved = true;
                feature.skip_reason = None;
            }
            Mutation::RejectSkip => {
                feature.approved = true;
                feature.in_progress = false;
            }
            Mutation::RecordFailure { message } => {
                feature.failure_count += 1;
                feature.last_error = Some(message.clone());
            }
            Mutation::SetInProgress(flag) => {
                feature.in_progress = *flag;
            }
        }
    }
}

/// A feature before and after a mutation.
#[derive(Debug, Clone)]
pub struct Change {
    pub before: Feature,
    pub after: Feature,
}

impl Change {
    pub fn from_state(&self) -> State {
        self.before.state()
    }

    pub fn to_state(&self) -> State {
        self.after.state()
    }

    /// True when the mutation was a no-op.
    pub fn is_unchanged(&self) -> bool {
        self.before == self.after
    }
}
