//! Feature operations on SQLite: batch insert, ordered and sampled listing,
//! and guarded state transitions.
//!
//! Every guarded transition is a single `UPDATE ... WHERE id = ? AND <state>`
//! statement. If it touches no row after the pre-read saw a valid state,
//! somebody else moved the feature first and the mutation is re-planned
//! against the row as it is now.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::Db;
use crate::error::{Error, Result};
use crate::model::feature::{Feature, FeatureId, NewFeature, State, Stats};
use crate::store::{Change, FeatureStore, ListQuery, Mutation, Plan, sample_ids};

const COLUMNS: &str = "id, priority, category, name, description, steps, passes, in_progress, \
                       failure_count, last_error, skipped, approved, skip_reason, created_at, updated_at";

/// SQL predicate matching rows in `state`. Mirrors [`State::from_flags`].
fn state_predicate(state: State) -> &'static str {
    match state {
        State::Pending => "(passes = 0 AND skipped = 0)",
        State::Passing => "(passes = 1)",
        State::SkippedPendingReview => "(passes = 0 AND skipped = 1 AND approved = 0)",
        State::SkippedResolved => "(passes = 0 AND skipped = 1 AND approved = 1)",
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &ListQuery) {
    qb.push(" WHERE 1 = 1");
    if let Some(passes) = query.passes {
        qb.push(" AND passes = ").push_bind(passes);
    }
    if let Some(category) = &query.category {
        qb.push(" AND category = ").push_bind(category.clone());
    }
    if let Some(state) = query.state {
        qb.push(" AND ").push(state_predicate(state));
    }
}

fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl FeatureStore for Db {
    async fn insert(&self, items: Vec<NewFeature>) -> Result<Vec<FeatureId>> {
        for item in &items {
            item.validate()?;
        }

        let mut tx = self.pool().begin().await?;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(items.len());
        for item in &items {
            if let Some(id) = insert_row(&mut *tx, item, now, false).await? {
                ids.push(id);
            }
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn insert_if_empty(&self, items: Vec<NewFeature>) -> Result<Option<Vec<FeatureId>>> {
        for item in &items {
            item.validate()?;
        }

        let Some((first, rest)) = items.split_first() else {
            let total = self.stats().await?.total;
            return Ok((total == 0).then(Vec::new));
        };

        // The first statement writes, so the transaction takes the write
        // lock before it checks for rows and a concurrent import waits
        // behind it instead of reading a stale empty table.
        let mut tx = self.pool().begin().await?;
        let now = Utc::now();
        let Some(first_id) = insert_row(&mut *tx, first, now, true).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut ids = Vec::with_capacity(items.len());
        ids.push(first_id);
        for item in rest {
            if let Some(id) = insert_row(&mut *tx, item, now, false).await? {
                ids.push(id);
            }
        }
        tx.commit().await?;
        Ok(Some(ids))
    }

    async fn get(&self, id: FeatureId) -> Result<Feature> {
        let row: Option<FeatureRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM features WHERE id = ?1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or(Error::NotFound(id))?.try_into_feature()
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Feature>> {
        if !query.random {
            let mut qb = QueryBuilder::new(format!("SELECT {COLUMNS} FROM features"));
            push_filters(&mut qb, query);
            qb.push(" ORDER BY priority ASC, id ASC LIMIT ")
                .push_bind(sql_limit(query.limit))
                .push(" OFFSET ")
                .push_bind(sql_limit(query.offset));

            let rows: Vec<FeatureRow> = qb.build_query_as().fetch_all(self.pool()).await?;
            return rows.into_iter().map(FeatureRow::try_into_feature).collect();
        }

        // Sample ids in Rust and fetch the rows inside one read transaction
        // so the sample reflects a single snapshot.
        let mut tx = self.pool().begin().await?;

        let mut qb = QueryBuilder::new("SELECT id FROM features");
        push_filters(&mut qb, query);
        let ids: Vec<i64> = qb.build_query_scalar().fetch_all(&mut *tx).await?;

        let sampled = sample_ids(ids.into_iter().map(FeatureId).collect(), query.limit);
        if sampled.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::new(format!("SELECT {COLUMNS} FROM features WHERE id IN ("));
        let mut separated = qb.separated(", ");
        for id in &sampled {
            separated.push_bind(id.0);
        }
        separated.push_unseparated(")");
        let rows: Vec<FeatureRow> = qb.build_query_as().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let mut by_id = HashMap::with_capacity(rows.len());
        for row in rows {
            let feature = row.try_into_feature()?;
            by_id.insert(feature.id, feature);
        }
        Ok(sampled.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn next_pending(&self) -> Result<Option<Feature>> {
        let row: Option<FeatureRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM features
             WHERE passes = 0 AND skipped = 0
             ORDER BY priority ASC, id ASC
             LIMIT 1"
        ))
        .fetch_optional(self.pool())
        .await?;

        row.map(FeatureRow::try_into_feature).transpose()
    }

    async fn update(&self, id: FeatureId, mutation: Mutation) -> Result<Change> {
        let before = self.get(id).await?;
        let from = before.state();

        if mutation.plan(from)? == Plan::NoOp {
            return Ok(Change {
                after: before.clone(),
                before,
            });
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE features SET updated_at = ");
        qb.push_bind(Utc::now());
        match &mutation {
            Mutation::MarkPassing => qb.push(
                ", passes = 1, failure_count = 0, in_progress = 0, last_error = NULL, \
                 skipped = 0, skip_reason = NULL",
            ),
            Mutation::MarkFailing => qb.push(", passes = 0, in_progress = 0"),
            Mutation::Skip { reason } => qb
                .push(", skipped = 1, approved = 0, skip_reason = ")
                .push_bind(reason.clone())
                .push(
                    ", priority = (SELECT COALESCE(MAX(priority), 0) + 1 FROM features), \
                     in_progress = 0, failure_count = 0, last_error = NULL",
                ),
            Mutation::Approve => qb.push(", skipped = 0, approved = 1, skip_reason = NULL"),
            Mutation::RejectSkip => qb.push(", approved = 1, in_progress = 0"),
            Mutation::RecordFailure { message } => qb
                .push(", failure_count = failure_count + 1, last_error = ")
                .push_bind(message.clone()),
            Mutation::SetInProgress(flag) => qb.push(", in_progress = ").push_bind(*flag),
        };
        qb.push(" WHERE id = ").push_bind(id.0);
        if mutation.is_guarded() {
            qb.push(" AND ").push(state_predicate(from));
        }

        let rows_affected = qb.build().execute(self.pool()).await?.rows_affected();

        if rows_affected == 0 {
            // The guard no longer held. Re-plan against the current row: a
            // deleted row surfaces as NotFound, a row already in the target
            // state is a no-op, and a state that forbids the mutation is an
            // invalid transition.
            let current = self.get(id).await?;
            return match mutation.plan(current.state())? {
                Plan::NoOp => Ok(Change {
                    after: current.clone(),
                    before: current,
                }),
                Plan::Apply { .. } => Err(Error::Conflict {
                    id,
                    operation: mutation.name(),
                }),
            };
        }

        let after = self.get(id).await?;
        Ok(Change { before, after })
    }

    async fn stats(&self) -> Result<Stats> {
        let (total, passing): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(passes), 0) FROM features")
                .fetch_one(self.pool())
                .await?;
        Ok(Stats::new(passing as u64, total as u64))
    }

    async fn delete(&self, id: FeatureId) -> Result<()> {
        let rows_affected = sqlx::query("DELETE FROM features WHERE id = ?1")
            .bind(id.0)
            .execute(self.pool())
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Db::health_check(self).await
    }
}

/// Insert one feature at `max(priority) + 1`. With `only_if_empty` the row
/// is written only when the table has no rows; `None` means it was not.
async fn insert_row(
    conn: &mut SqliteConnection,
    item: &NewFeature,
    now: DateTime<Utc>,
    only_if_empty: bool,
) -> Result<Option<FeatureId>> {
    let mut sql = String::from(
        "INSERT INTO features (priority, category, name, description, steps, passes, created_at, updated_at)
         SELECT (SELECT COALESCE(MAX(priority), 0) + 1 FROM features), ?1, ?2, ?3, ?4, ?5, ?6, ?6",
    );
    if only_if_empty {
        sql.push_str(" WHERE NOT EXISTS (SELECT 1 FROM features)");
    }

    let result = sqlx::query(&sql)
        .bind(&item.category)
        .bind(&item.name)
        .bind(&item.description)
        .bind(serde_json::to_string(&item.steps)?)
        .bind(item.passes)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    Ok((result.rows_affected() > 0).then(|| FeatureId(result.last_insert_rowid())))
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct FeatureRow {
    id: i64,
    priority: i64,
    category: String,
    name: String,
    description: String,
    steps: String,
    passes: bool,
    in_progress: bool,
    failure_count: i64,
    last_error: Option<String>,
    skipped: bool,
    approved: bool,
    skip_reason: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl FeatureRow {
    fn try_into_feature(self) -> Result<Feature> {
        let failure_count = u32::try_from(self.failure_count).map_err(|_| {
            Error::Other(format!(
                "feature #{} has invalid failure_count {}",
                self.id, self.failure_count
            ))
        })?;

        Ok(Feature {
            id: FeatureId(self.id),
            priority: self.priority,
            category: self.category,
            name: self.name,
            description: self.description,
            steps: serde_json::from_str(&self.steps)?,
            passes: self.passes,
            in_progress: self.in_progress,
            failure_count,
            last_error: self.last_error,
            skipped: self.skipped,
            approved: self.approved,
            skip_reason: self.skip_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
