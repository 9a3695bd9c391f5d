//! In-memory backlog store.
//!
//! A single mutex guards the whole table, so every operation is trivially
//! atomic and a guard check can never go stale between read and write.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{Change, FeatureStore, ListQuery, Mutation, Plan, sample_ids};
use crate::error::{Error, Result};
use crate::model::feature::{Feature, FeatureId, NewFeature, Stats};

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<FeatureId, Feature>,
    /// Last id handed out. Survives deletes so ids are never reused.
    last_id: i64,
}

impl Table {
    fn max_priority(&self) -> i64 {
        self.rows.values().map(|f| f.priority).max().unwrap_or(0)
    }

    fn sorted(&self, query: &ListQuery) -> Vec<&Feature> {
        let mut matching: Vec<&Feature> =
            self.rows.values().filter(|f| query.matches(f)).collect();
        matching.sort_by_key(|f| (f.priority, f.id));
        matching
    }

    fn insert_rows(&mut self, items: Vec<NewFeature>) -> Vec<FeatureId> {
        let base = self.max_priority();
        let now = Utc::now();
        let mut ids = Vec::with_capacity(items.len());

        for (offset, item) in items.into_iter().enumerate() {
            self.last_id += 1;
            let id = FeatureId(self.last_id);
            self.rows.insert(
                id,
                Feature {
                    id,
                    priority: base + 1 + offset as i64,
                    category: item.category,
                    name: item.name,
                    description: item.description,
                    steps: item.steps,
                    passes: item.passes,
                    in_progress: false,
                    failure_count: 0,
                    last_error: None,
                    skipped: false,
                    approved: false,
                    skip_reason: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            ids.push(id);
        }
        ids
    }
}

/// Backlog held in process memory. Cheap to clone; clones share the table.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    table: Arc<Mutex<Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeatureStore for MemoryStore {
    async fn insert(&self, items: Vec<NewFeature>) -> Result<Vec<FeatureId>> {
        for item in &items {
            item.validate()?;
        }

        let mut table = self.table.lock().await;
        Ok(table.insert_rows(items))
    }

    async fn insert_if_empty(&self, items: Vec<NewFeature>) -> Result<Option<Vec<FeatureId>>> {
        for item in &items {
            item.validate()?;
        }

        let mut table = self.table.lock().await;
        if !table.rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(table.insert_rows(items)))
    }

    async fn get(&self, id: FeatureId) -> Result<Feature> {
        let table = self.table.lock().await;
        table.rows.get(&id).cloned().ok_or(Error::NotFound(id))
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Feature>> {
        let table = self.table.lock().await;

        if query.random {
            let ids = table.sorted(query).iter().map(|f| f.id).collect();
            return Ok(sample_ids(ids, query.limit)
                .into_iter()
                .filter_map(|id| table.rows.get(&id).cloned())
                .collect());
        }

        Ok(table
            .sorted(query)
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn next_pending(&self) -> Result<Option<Feature>> {
        let table = self.table.lock().await;
        Ok(table
            .rows
            .values()
            .filter(|f| !f.passes && !f.skipped)
            .min_by_key(|f| (f.priority, f.id))
            .cloned())
    }

    async fn update(&self, id: FeatureId, mutation: Mutation) -> Result<Change> {
        let mut table = self.table.lock().await;
        let next_priority = table.max_priority() + 1;

        let feature = table.rows.get_mut(&id).ok_or(Error::NotFound(id))?;
        let before = feature.clone();

        if let Plan::Apply { .. } = mutation.plan(before.state())? {
            mutation.apply(feature, next_priority);
            feature.updated_at = Utc::now();
        }

        Ok(Change {
            before,
            after: feature.clone(),
        })
    }

    async fn stats(&self) -> Result<Stats> {
        let table = self.table.lock().await;
        let passing = table.rows.values().filter(|f| f.passes).count() as u64;
        Ok(Stats::new(passing, table.rows.len() as u64))
    }

    async fn delete(&self, id: FeatureId) -> Result<()> {
        let mut table = self.table.lock().await;
        table.rows.remove(&id).map(|_| ()).ok_or(Error::NotFound(id))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(name: &str) -> NewFeature {
        NewFeature::new("core", name).step("verify")
    }

    #[tokio::test]
    async fn ids_survive_deletes() {
        let store = MemoryStore::new();
        let first = store.insert(vec![feature("a"), feature("b")]).await.unwrap();
        store.delete(first[1]).await.unwrap();

        let next = store.insert(vec![feature("c")]).await.unwrap();
        assert_eq!(next, vec![FeatureId(3)]);
    }

    #[tokio::test]
    async fn invalid_item_rejects_whole_batch() {
        let store = MemoryStore::new();
        let result = store
            .insert(vec![feature("ok"), NewFeature::new("core", "no steps")])
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(store.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn noop_mutation_leaves_updated_at_alone() {
        let store = MemoryStore::new();
        let ids = store.insert(vec![feature("a")]).await.unwrap();
        store.update(ids[0], Mutation::MarkPassing).await.unwrap();

        let change = store.update(ids[0], Mutation::MarkPassing).await.unwrap();
        assert!(change.is_unchanged());
    }
}
