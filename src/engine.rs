//! Core engine. The public API for fetching, completing, skipping, and
//! reviewing features.
//!
//! The engine owns a [`FeatureStore`] and layers the backlog policy over it:
//! caller-facing limits, input validation, stuck-loop reporting, and
//! tracing/metrics for every transition. All state changes go through
//! here; the store enforces atomicity.

use std::time::Instant;

use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{Instrument, info, warn};

use crate::error::{Error, Result};
use crate::model::feature::*;
use crate::store::memory::MemoryStore;
use crate::store::{Change, FeatureStore, ListQuery, Mutation};
use crate::telemetry::feature::{record_state_transition, start_feature_span};
use crate::telemetry::metrics;

/// Hard cap on `list` page size, whatever the caller asks for.
pub const LIST_LIMIT_CAP: usize = 5;

/// Upper bound for a regression sample.
pub const REGRESSION_LIMIT_MAX: usize = 10;

/// Default stuck-loop threshold.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Failure messages are truncated to this many characters.
pub const MAX_ERROR_LEN: usize = 500;

/// Liveness report.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub ok: bool,
    pub total: u64,
}

/// The backlog engine. Cheap to clone when the store is.
#[derive(Debug, Clone)]
pub struct Engine<S> {
    store: S,
    /// Failure count at which a feature is reported as stuck.
    pub max_failures: u32,
}

impl Engine<MemoryStore> {
    /// Create an engine with in-memory storage (for testing).
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }
}

impl<S: FeatureStore> Engine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn stats(&self) -> Result<Stats> {
        self.store.stats().await
    }

    pub async fn get(&self, id: FeatureId) -> Result<Feature> {
        self.store.get(id).await
    }

    /// The highest-priority pending feature, or `None` when the backlog is
    /// drained or everything left is skipped. Never an error.
    pub async fn get_next(&self) -> Result<Option<Feature>> {
        self.store.next_pending().await
    }

    /// [`get_next`](Self::get_next), then flag the feature in progress.
    ///
    /// The flag is advisory: a second driver calling this concurrently may
    /// be handed the same feature.
    pub async fn claim_next(&self) -> Result<Option<Feature>> {
        let Some(feature) = self.store.next_pending().await? else {
            return Ok(None);
        };
        let change = self
            .transition(feature.id, Mutation::SetInProgress(true))
            .await?;
        Ok(Some(change.after))
    }

    /// Filtered listing with the page size capped at [`LIST_LIMIT_CAP`].
    pub async fn list(&self, mut query: ListQuery) -> Result<Vec<Feature>> {
        query.limit = query.limit.min(LIST_LIMIT_CAP);
        self.store.list(&query).await
    }

    /// Random sample of passing features, for re-verification.
    pub async fn get_for_regression(&self, limit: usize) -> Result<Vec<Feature>> {
        if !(1..=REGRESSION_LIMIT_MAX).contains(&limit) {
            return Err(Error::Validation(format!(
                "regression limit must be between 1 and {REGRESSION_LIMIT_MAX}, got {limit}"
            )));
        }
        self.store
            .list(&ListQuery {
                state: Some(State::Passing),
                limit,
                random: true,
                ..ListQuery::default()
            })
            .await
    }

    /// Every skipped feature still waiting for a reviewer, in queue order.
    pub async fn list_pending_review(&self) -> Result<Vec<Feature>> {
        self.store
            .list(&ListQuery {
                state: Some(State::SkippedPendingReview),
                ..ListQuery::default()
            })
            .await
    }

    pub async fn health(&self) -> Result<Health> {
        self.store.health_check().await?;
        let stats = self.store.stats().await?;
        Ok(Health {
            ok: true,
            total: stats.total,
        })
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    pub async fn create(&self, feature: NewFeature) -> Result<Feature> {
        let ids = self.store.insert(vec![feature]).await?;
        metrics::features_created().add(1, &[KeyValue::new("source", "single")]);
        let id = ids
            .first()
            .copied()
            .ok_or_else(|| Error::Other("insert returned no id".into()))?;
        info!(feature.id = id.0, "feature created");
        self.store.get(id).await
    }

    /// Create a batch in input order. Typically called once by the
    /// initializer to seed the backlog; later calls append.
    pub async fn bulk_create(&self, features: Vec<NewFeature>) -> Result<Vec<FeatureId>> {
        if features.is_empty() {
            return Err(Error::Validation(
                "bulk create needs at least one feature".into(),
            ));
        }
        let ids = self.store.insert(features).await?;
        metrics::features_created().add(ids.len() as u64, &[KeyValue::new("source", "bulk")]);
        info!(count = ids.len(), "features created");
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Mark a feature as passing. Idempotent.
    pub async fn mark_passing(&self, id: FeatureId) -> Result<Feature> {
        Ok(self.transition(id, Mutation::MarkPassing).await?.after)
    }

    /// Generic update path. Only `passes` is writable here: `true` behaves
    /// like [`mark_passing`](Self::mark_passing), `false` sends a passing
    /// feature back to the queue.
    pub async fn update(&self, id: FeatureId, update: PassesUpdate) -> Result<Feature> {
        let mutation = if update.passes {
            Mutation::MarkPassing
        } else {
            Mutation::MarkFailing
        };
        Ok(self.transition(id, mutation).await?.after)
    }

    /// Evict a feature from the queue and move it to the end, pending review.
    pub async fn skip(&self, id: FeatureId, reason: &str) -> Result<SkipReport> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(Error::Validation("skip reason must not be empty".into()));
        }

        let change = self
            .transition(
                id,
                Mutation::Skip {
                    reason: reason.to_string(),
                },
            )
            .await?;

        Ok(SkipReport {
            old_priority: change.before.priority,
            new_priority: change.after.priority,
            feature: change.after,
        })
    }

    /// Re-admit a skipped feature at its current priority.
    pub async fn approve(&self, id: FeatureId) -> Result<Feature> {
        Ok(self.transition(id, Mutation::Approve).await?.after)
    }

    /// Confirm a skip. The feature never returns to the queue.
    pub async fn reject_skip(&self, id: FeatureId) -> Result<Feature> {
        Ok(self.transition(id, Mutation::RejectSkip).await?.after)
    }

    /// Count a failed attempt. The returned report tells the driver whether
    /// the feature has hit the stuck-loop threshold; the engine itself never
    /// skips on its own.
    pub async fn record_failure(&self, id: FeatureId, message: &str) -> Result<FailureReport> {
        let change = self
            .transition(
                id,
                Mutation::RecordFailure {
                    message: truncate_error(message),
                },
            )
            .await?;

        let failure_count = change.after.failure_count;
        let threshold_exceeded = failure_count >= self.max_failures;
        metrics::feature_failures().add(
            1,
            &[KeyValue::new("threshold_exceeded", threshold_exceeded)],
        );
        if threshold_exceeded {
            warn!(
                feature.id = id.0,
                failure_count,
                max_failures = self.max_failures,
                "feature looks stuck"
            );
        }

        Ok(FailureReport {
            feature: change.after,
            failure_count,
            max_failures: self.max_failures,
            threshold_exceeded,
        })
    }

    /// Set or clear the advisory in-progress flag. Last writer wins.
    pub async fn set_in_progress(&self, id: FeatureId, in_progress: bool) -> Result<Feature> {
        Ok(self
            .transition(id, Mutation::SetInProgress(in_progress))
            .await?
            .after)
    }

    /// Administrative delete. Outside the state machine.
    pub async fn delete(&self, id: FeatureId) -> Result<()> {
        self.store.delete(id).await?;
        warn!(feature.id = id.0, "feature deleted");
        Ok(())
    }

    /// Run one mutation through the store with tracing and metrics.
    async fn transition(&self, id: FeatureId, mutation: Mutation) -> Result<Change> {
        let operation = mutation.name();
        let span = start_feature_span(operation, id);
        let started = Instant::now();

        let result = self.store.update(id, mutation).instrument(span.clone()).await;

        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", operation)],
        );

        match &result {
            Ok(change) if change.from_state() != change.to_state() => {
                let (from, to) = (change.from_state().to_string(), change.to_state().to_string());
                record_state_transition(&span, &from, &to);
                metrics::feature_transitions()
                    .add(1, &[KeyValue::new("from", from), KeyValue::new("to", to)]);
            }
            Ok(_) => {}
            Err(Error::Conflict { .. }) => {
                metrics::feature_conflicts().add(1, &[KeyValue::new("operation", operation)]);
                span.in_scope(|| warn!("lost race on guarded update"));
            }
            Err(err @ (Error::InvalidTransition { .. } | Error::NotFound(_))) => {
                span.in_scope(|| warn!(error = %err, "transition rejected"));
            }
            Err(_) => {}
        }

        result
    }
}

/// Cap a failure message at [`MAX_ERROR_LEN`] characters.
fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}
