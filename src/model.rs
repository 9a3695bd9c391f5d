//! Core data model.
//!
//! The backlog holds one entity, the feature. Everything the engine knows
//! about a feature's lifecycle is derived from its flags; see
//! [`feature::State`].

pub mod feature;

pub use feature::{
    FailureReport, Feature, FeatureId, NewFeature, PassesUpdate, SkipReport, State, Stats,
};
