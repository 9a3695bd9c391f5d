//! Backlog engine over the SQLite store.
//!
//! Each test gets its own database file in a temp directory, so the pool
//! can hold several connections and concurrent writers really race.

use backlog_rs::db::Db;
use backlog_rs::engine::{Engine, LIST_LIMIT_CAP};
use backlog_rs::error::Error;
use backlog_rs::model::*;
use backlog_rs::store::{FeatureStore, ListQuery, Mutation};
use tempfile::TempDir;

async fn test_db() -> (TempDir, Db) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("features.db")).await.unwrap();
    db.migrate().await.unwrap();
    (dir, db)
}

fn feature(name: &str) -> NewFeature {
    NewFeature::new("functional", name)
        .description(format!("{name} works"))
        .steps(["open the app", "check the result"])
}

async fn seed(engine: &Engine<Db>, names: &[&str]) -> Vec<FeatureId> {
    engine
        .bulk_create(names.iter().map(|n| feature(n)).collect())
        .await
        .unwrap()
}

#[tokio::test]
async fn connects_and_migrates() {
    let (_dir, db) = test_db().await;
    assert!(db.health_check().await.is_ok());
    // migrations are idempotent
    db.migrate().await.unwrap();
}

#[tokio::test]
async fn in_memory_database_works() {
    let db = Db::in_memory().await.unwrap();
    db.migrate().await.unwrap();
    let engine = Engine::new(db);

    seed(&engine, &["a"]).await;
    assert_eq!(engine.stats().await.unwrap().total, 1);
}

#[tokio::test]
async fn insert_round_trips_every_field() {
    let (_dir, db) = test_db().await;
    let engine = Engine::new(db);

    let created = engine.create(feature("login")).await.unwrap();
    assert_eq!(created.id, FeatureId(1));
    assert_eq!(created.priority, 1);
    assert_eq!(created.category, "functional");
    assert_eq!(created.description, "login works");
    assert_eq!(created.steps, vec!["open the app", "check the result"]);
    assert_eq!(created.state(), State::Pending);
    assert!(created.last_error.is_none());
    assert!(created.skip_reason.is_none());
}

#[tokio::test]
async fn skip_approve_scenario_keeps_queue_order() {
    let (_dir, db) = test_db().await;
    let engine = Engine::new(db);
    let ids = seed(&engine, &["A", "B", "C"]).await;
    let (a, b, c) = (ids[0], ids[1], ids[2]);

    for (i, id) in ids.iter().enumerate() {
        assert_eq!(engine.get(*id).await.unwrap().priority, i as i64 + 1);
    }
    assert_eq!(engine.get_next().await.unwrap().unwrap().id, a);

    let report = engine.skip(a, "blocked").await.unwrap();
    assert_eq!((report.old_priority, report.new_priority), (1, 4));
    assert_eq!(engine.get_next().await.unwrap().unwrap().id, b);

    engine.approve(a).await.unwrap();
    assert_eq!(engine.get_next().await.unwrap().unwrap().id, b);

    engine.mark_passing(b).await.unwrap();
    engine.mark_passing(c).await.unwrap();
    assert_eq!(engine.get_next().await.unwrap().unwrap().id, a);
}

#[tokio::test]
async fn rejected_skip_blocks_approve() {
    let (_dir, db) = test_db().await;
    let engine = Engine::new(db);
    let ids = seed(&engine, &["a"]).await;

    engine.skip(ids[0], "out of scope").await.unwrap();
    engine.reject_skip(ids[0]).await.unwrap();

    assert!(matches!(
        engine.approve(ids[0]).await,
        Err(Error::InvalidTransition {
            from: State::SkippedResolved,
            to: State::Pending
        })
    ));
    assert!(engine.get_next().await.unwrap().is_none());
    assert_eq!(
        engine.get(ids[0]).await.unwrap().state(),
        State::SkippedResolved
    );
}

#[tokio::test]
async fn failures_count_up_and_reset_on_pass() {
    let (_dir, db) = test_db().await;
    let engine = Engine::new(db).with_max_failures(3);
    let ids = seed(&engine, &["A", "B"]).await;
    let b = ids[1];

    let mut last = None;
    for _ in 0..3 {
        last = Some(engine.record_failure(b, "timeout").await.unwrap());
    }
    let report = last.unwrap();
    assert_eq!(report.failure_count, 3);
    assert!(report.threshold_exceeded);
    assert_eq!(report.feature.last_error.as_deref(), Some("timeout"));

    let passed = engine.mark_passing(b).await.unwrap();
    assert_eq!(passed.failure_count, 0);
    assert!(passed.last_error.is_none());
    assert_eq!(engine.mark_passing(b).await.unwrap(), passed);
}

#[tokio::test]
async fn list_caps_orders_and_filters() {
    let (_dir, db) = test_db().await;
    let engine = Engine::new(db);
    let ids = engine
        .bulk_create(
            (0..8)
                .map(|i| {
                    NewFeature::new(if i % 2 == 0 { "ui" } else { "api" }, format!("f{i}"))
                        .step("verify")
                })
                .collect(),
        )
        .await
        .unwrap();
    engine.mark_passing(ids[0]).await.unwrap();

    let page = engine
        .list(ListQuery {
            limit: 100,
            ..ListQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(page.len(), LIST_LIMIT_CAP);
    assert_eq!(
        page.iter().map(|f| f.id).collect::<Vec<_>>(),
        ids[..LIST_LIMIT_CAP].to_vec()
    );

    let ui_pending = engine
        .list(ListQuery {
            category: Some("ui".into()),
            passes: Some(false),
            ..ListQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(
        ui_pending.iter().map(|f| f.id).collect::<Vec<_>>(),
        vec![ids[2], ids[4], ids[6]]
    );

    let second_page = engine
        .list(ListQuery {
            limit: 5,
            offset: 5,
            ..ListQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(second_page.len(), 3);
}

#[tokio::test]
async fn regression_sample_is_random_subset_of_passing() {
    let (_dir, db) = test_db().await;
    let engine = Engine::new(db);
    let ids = seed(&engine, &["a", "b", "c", "d", "e"]).await;
    for id in &ids[..3] {
        engine.mark_passing(*id).await.unwrap();
    }

    let sample = engine.get_for_regression(2).await.unwrap();
    assert_eq!(sample.len(), 2);
    assert!(sample.iter().all(|f| f.passes && ids[..3].contains(&f.id)));

    let everything = engine.get_for_regression(10).await.unwrap();
    assert_eq!(everything.len(), 3);
}

#[tokio::test]
async fn stats_and_delete() {
    let (_dir, db) = test_db().await;
    let engine = Engine::new(db);
    assert_eq!(engine.stats().await.unwrap(), Stats::new(0, 0));

    let ids = seed(&engine, &["a", "b", "c"]).await;
    engine.mark_passing(ids[0]).await.unwrap();
    let stats = engine.stats().await.unwrap();
    assert_eq!((stats.passing, stats.total), (1, 3));
    assert!((stats.percentage - 100.0 / 3.0).abs() < 1e-9);

    engine.delete(ids[2]).await.unwrap();
    assert!(matches!(
        engine.get(ids[2]).await,
        Err(Error::NotFound(_))
    ));
    let next = engine.create(feature("d")).await.unwrap();
    assert_eq!(next.id, FeatureId(4));
}

#[tokio::test]
async fn store_update_on_missing_feature_is_not_found() {
    let (_dir, db) = test_db().await;
    let result = db.update(FeatureId(7), Mutation::Approve).await;
    assert!(matches!(result, Err(Error::NotFound(FeatureId(7)))));
}

#[tokio::test]
async fn backlog_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("features.db");

    {
        let db = Db::open(&path).await.unwrap();
        db.migrate().await.unwrap();
        let engine = Engine::new(db);
        let ids = seed(&engine, &["a", "b"]).await;
        engine.skip(ids[0], "blocked").await.unwrap();
    }

    let db = Db::open(&path).await.unwrap();
    db.migrate().await.unwrap();
    let engine = Engine::new(db);
    assert_eq!(engine.stats().await.unwrap().total, 2);
    assert_eq!(engine.get_next().await.unwrap().unwrap().id, FeatureId(2));
    assert_eq!(engine.list_pending_review().await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approve_and_reject_have_one_winner() {
    let (_dir, db) = test_db().await;
    let engine = Engine::new(db);
    let ids = seed(&engine, &["a"]).await;
    let id = ids[0];
    engine.skip(id, "blocked").await.unwrap();

    let approver = tokio::spawn({
        let engine = engine.clone();
        async move { engine.approve(id).await }
    });
    let rejecter = tokio::spawn({
        let engine = engine.clone();
        async move { engine.reject_skip(id).await }
    });

    let approved = approver.await.unwrap();
    let rejected = rejecter.await.unwrap();
    assert!(approved.is_ok() ^ rejected.is_ok());

    let loser = if approved.is_ok() { rejected } else { approved };
    // the loser sees the winner's state, which rules out its own move
    assert!(matches!(loser, Err(Error::InvalidTransition { .. })));

    // whichever won, the row holds exactly one coherent disposition
    let state = engine.get(id).await.unwrap().state();
    assert!(matches!(state, State::Pending | State::SkippedResolved));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mark_passing_is_idempotent() {
    for _ in 0..5 {
        let (_dir, db) = test_db().await;
        let engine = Engine::new(db);
        let ids = seed(&engine, &["a"]).await;
        let id = ids[0];
        engine.record_failure(id, "flaky").await.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.mark_passing(id).await })
            })
            .collect();

        for handle in handles {
            let feature = handle.await.unwrap().unwrap();
            assert!(feature.passes);
            assert_eq!(feature.failure_count, 0);
        }

        let feature = engine.get(id).await.unwrap();
        assert!(feature.passes);
        assert_eq!(feature.failure_count, 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_skips_get_distinct_priorities() {
    let (_dir, db) = test_db().await;
    let engine = Engine::new(db);
    let ids = seed(&engine, &["a", "b", "c", "d", "e", "f", "g", "h"]).await;

    let handles: Vec<_> = ids
        .iter()
        .map(|&id| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.skip(id, "blocked").await })
        })
        .collect();

    let mut priorities = Vec::new();
    for handle in handles {
        priorities.push(handle.await.unwrap().unwrap().new_priority);
    }
    priorities.sort_unstable();
    let expected: Vec<i64> = (9..=16).collect();
    assert_eq!(priorities, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_reskips_settle_in_pending_review() {
    let (_dir, db) = test_db().await;
    let engine = Engine::new(db);
    let ids = seed(&engine, &["a", "b"]).await;
    let id = ids[0];

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.skip(id, &format!("reason {i}")).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            // re-skipping is legal, so a lost guard is a retryable conflict
            Err(Error::Conflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(successes >= 1);
    assert_eq!(
        engine.get(id).await.unwrap().state(),
        State::SkippedPendingReview
    );
}
