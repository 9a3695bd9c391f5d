//! One-time import of the legacy `feature_list.json` flat file.
//!
//! Idempotent: does nothing when the backlog already has rows or when no
//! legacy file exists. After a successful import the file is renamed, never
//! deleted, so the original stays available for inspection.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::error::Result;
use crate::model::feature::NewFeature;
use crate::store::FeatureStore;

/// File name of the legacy flat-file backlog inside the project directory.
pub const LEGACY_FILE: &str = "feature_list.json";

/// What [`import_legacy`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Imported this many features; the file was archived at the given path.
    Imported { count: usize, archived_to: PathBuf },
    /// The backlog already had features. The legacy file was left untouched.
    SkippedNonEmpty,
    NoLegacyFile,
}

/// A feature as written by the flat-file era. Older files had no `name`.
#[derive(Debug, Deserialize)]
struct LegacyFeature {
    #[serde(default)]
    category: String,
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    steps: Vec<String>,
    #[serde(default)]
    passes: bool,
}

impl From<LegacyFeature> for NewFeature {
    fn from(legacy: LegacyFeature) -> Self {
        let name = legacy
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| legacy.description.clone());
        NewFeature::new(legacy.category, name)
            .description(legacy.description)
            .steps(legacy.steps)
            .already_passing(legacy.passes)
    }
}

/// Import `<project_dir>/feature_list.json` into an empty store, keeping the
/// file's order as priority order.
pub async fn import_legacy<S>(store: &S, project_dir: &Path) -> Result<ImportOutcome>
where
    S: FeatureStore + ?Sized,
{
    let path = project_dir.join(LEGACY_FILE);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(ImportOutcome::NoLegacyFile);
    }

    if store.stats().await?.total > 0 {
        info!(path = %path.display(), "backlog not empty, skipping legacy import");
        return Ok(ImportOutcome::SkippedNonEmpty);
    }

    // A concurrent import may archive the file between the check above and
    // this read.
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ImportOutcome::NoLegacyFile),
        Err(e) => return Err(e.into()),
    };
    let legacy: Vec<LegacyFeature> = serde_json::from_str(&raw)?;
    let count = legacy.len();

    let inserted = store
        .insert_if_empty(legacy.into_iter().map(NewFeature::from).collect())
        .await?;
    if inserted.is_none() {
        info!(path = %path.display(), "backlog filled concurrently, skipping legacy import");
        return Ok(ImportOutcome::SkippedNonEmpty);
    }

    let archived_to = project_dir.join(format!(
        "{LEGACY_FILE}.migrated-{}",
        Utc::now().format("%Y%m%d%H%M%S")
    ));
    tokio::fs::rename(&path, &archived_to).await?;

    info!(
        count,
        archived_to = %archived_to.display(),
        "imported legacy feature list"
    );
    Ok(ImportOutcome::Imported { count, archived_to })
}
