//! Span helpers for backlog operations.

use tracing::Span;

use crate::model::feature::FeatureId;

/// Start a span for an operation on one feature.
///
/// The `feature.state` field is declared empty and is filled in by
/// [`record_state_transition`].
pub fn start_feature_span(operation: &str, id: FeatureId) -> Span {
    tracing::info_span!(
        "backlog.feature",
        "backlog.operation" = operation,
        "feature.id" = id.0,
        "feature.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit an `info` event in it.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("feature.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
