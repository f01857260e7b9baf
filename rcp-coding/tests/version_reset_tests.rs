//! Integration tests for version reset and its v2 -> v3 cascade

mod helpers;

use helpers::*;
use rcp_common::events::CodingEvent;
use rcp_common::{CodingTriad, CodingVersion, Error, JobContext, StatusCode};
use sqlx::SqlitePool;

fn v1() -> CodingTriad {
    CodingTriad::new(StatusCode::CodingIncomplete, Some(1), Some(0))
}

fn v2() -> CodingTriad {
    CodingTriad::new(StatusCode::CodingComplete, Some(10), Some(1))
}

fn v3() -> CodingTriad {
    CodingTriad::new(StatusCode::CodingComplete, Some(11), Some(1))
}

/// Fully coded response in every version
async fn coded_response(pool: &SqlitePool, login: &str, unit: &str, variable: &str) -> i64 {
    let id = manual_response(pool, 1, login, unit, variable, Some("v")).await.unwrap();
    set_triad(pool, id, CodingVersion::V1, v1()).await.unwrap();
    set_triad(pool, id, CodingVersion::V2, v2()).await.unwrap();
    set_triad(pool, id, CodingVersion::V3, v3()).await.unwrap();
    id
}

#[tokio::test]
async fn test_reset_v2_cascades_to_v3() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;
    let mut ids = Vec::new();
    for login in ["p1", "p2", "p3"] {
        ids.push(coded_response(pool, login, "U1", "V1").await);
    }

    let summary = state
        .version_reset()
        .reset(1, CodingVersion::V2, None, None, &JobContext::detached())
        .await
        .unwrap()
        .into_inner();

    assert_eq!(summary.affected_response_count, 3);
    assert_eq!(
        summary.cascade_reset_versions,
        vec![CodingVersion::V2, CodingVersion::V3]
    );

    for id in ids {
        let response = load(pool, id).await.unwrap();
        assert!(response.v2.is_empty());
        assert!(response.v3.is_empty());
        assert_eq!(response.v1, v1());
    }
}

#[tokio::test]
async fn test_reset_v3_leaves_earlier_versions() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;
    let id = coded_response(pool, "p1", "U1", "V1").await;

    let summary = state
        .version_reset()
        .reset(1, CodingVersion::V3, None, None, &JobContext::detached())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(summary.cascade_reset_versions, vec![CodingVersion::V3]);

    let response = load(pool, id).await.unwrap();
    assert_eq!(response.v1, v1());
    assert_eq!(response.v2, v2());
    assert!(response.v3.is_empty());
    assert_eq!(response.effective(), v2());
}

#[tokio::test]
async fn test_reset_v1_does_not_cascade() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;
    let id = coded_response(pool, "p1", "U1", "V1").await;

    state
        .version_reset()
        .reset(1, CodingVersion::V1, None, None, &JobContext::detached())
        .await
        .unwrap();

    let response = load(pool, id).await.unwrap();
    assert!(response.v1.is_empty());
    assert_eq!(response.v2, v2());
    assert_eq!(response.v3, v3());
}

#[tokio::test]
async fn test_unit_and_variable_filters() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;
    let target = coded_response(pool, "p1", "U1", "V1").await;
    let other_variable = coded_response(pool, "p2", "U1", "V2").await;
    let other_unit = coded_response(pool, "p3", "U2", "V1").await;

    let summary = state
        .version_reset()
        .reset(
            1,
            CodingVersion::V2,
            Some(vec!["U1".to_string()]),
            Some(vec!["V1".to_string()]),
            &JobContext::detached(),
        )
        .await
        .unwrap()
        .into_inner();

    assert_eq!(summary.affected_response_count, 1);
    assert!(load(pool, target).await.unwrap().v2.is_empty());
    assert_eq!(load(pool, other_variable).await.unwrap().v2, v2());
    assert_eq!(load(pool, other_unit).await.unwrap().v2, v2());
}

#[tokio::test]
async fn test_unconsidered_persons_are_untouched() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;

    let booklet = add_booklet(pool, 1, "withdrawn", false).await.unwrap();
    let unit = add_unit(pool, booklet, "U1").await.unwrap();
    let id = add_response(pool, unit, "V1", Some("v"), StatusCode::CodingIncomplete)
        .await
        .unwrap();
    set_triad(pool, id, CodingVersion::V2, v2()).await.unwrap();

    let summary = state
        .version_reset()
        .reset(1, CodingVersion::V2, None, None, &JobContext::detached())
        .await
        .unwrap()
        .into_inner();

    assert_eq!(summary.affected_response_count, 0);
    assert_eq!(load(pool, id).await.unwrap().v2, v2());
}

#[tokio::test]
async fn test_nothing_to_reset_is_success() {
    let (state, _cache) = test_state().await.unwrap();

    let mut rx = state.event_bus.subscribe();
    let ctx = JobContext::new("reset").with_events(state.event_bus.clone());
    let outcome = state
        .version_reset()
        .reset(7, CodingVersion::V2, None, None, &ctx)
        .await
        .unwrap();

    assert!(!outcome.is_cancelled());
    let summary = outcome.into_inner();
    assert_eq!(summary.affected_response_count, 0);
    assert_eq!(
        summary.cascade_reset_versions,
        vec![CodingVersion::V2, CodingVersion::V3]
    );

    // No write, so no invalidation either
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, CodingEvent::CacheInvalidated { .. }));
    }
}

#[tokio::test]
async fn test_empty_filter_list_is_rejected() {
    let (state, _cache) = test_state().await.unwrap();

    let err = state
        .version_reset()
        .reset(1, CodingVersion::V1, Some(vec![]), None, &JobContext::detached())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_reset_refreshes_statistics() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;
    coded_response(pool, "p1", "U1", "V1").await;
    coded_response(pool, "p2", "U1", "V1").await;

    let stats = state.statistics();
    let before = stats.get_statistics(1, CodingVersion::V3).await.unwrap();
    assert_eq!(before.status_counts.get(&StatusCode::CodingComplete), Some(&2));

    state
        .version_reset()
        .reset(1, CodingVersion::V2, None, None, &JobContext::detached())
        .await
        .unwrap();

    let after = stats.get_statistics(1, CodingVersion::V3).await.unwrap();
    assert!(after.status_counts.is_empty());
    assert_eq!(after.uncoded, 2);
}

#[tokio::test]
async fn test_progress_runs_from_zero_to_hundred() {
    let (state, _cache) = test_state().await.unwrap();
    coded_response(&state.db, "p1", "U1", "V1").await;

    let mut rx = state.event_bus.subscribe();
    let ctx = JobContext::new("reset").with_events(state.event_bus.clone());
    state
        .version_reset()
        .reset(1, CodingVersion::V3, None, None, &ctx)
        .await
        .unwrap();

    let mut percents = Vec::new();
    let mut completed = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            CodingEvent::JobProgress { percent, .. } => percents.push(percent),
            CodingEvent::JobCompleted { .. } => completed = true,
            _ => {}
        }
    }
    assert_eq!(percents.first(), Some(&0));
    assert_eq!(percents.last(), Some(&100));
    assert!(completed);
}

#[tokio::test]
async fn test_cancelled_reset_touches_nothing() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;
    let id = coded_response(pool, "p1", "U1", "V1").await;

    let ctx = JobContext::new("reset");
    ctx.cancellation_token().cancel();
    let outcome = state
        .version_reset()
        .reset(1, CodingVersion::V2, None, None, &ctx)
        .await
        .unwrap();

    assert!(outcome.is_cancelled());
    assert_eq!(outcome.into_inner().affected_response_count, 0);
    assert_eq!(load(pool, id).await.unwrap().v2, v2());
}

#[tokio::test]
async fn test_failing_batch_keeps_committed_batches() {
    let (state, cache) = test_state().await.unwrap();
    let pool = &state.db;
    let booklet = add_booklet(pool, 1, "bulk", true).await.unwrap();
    let unit = add_unit(pool, booklet, "U1").await.unwrap();

    // One full batch plus three rows
    sqlx::query(
        "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 5003) \
         INSERT INTO responses (unit_id, variable_id, value, status_v1, status_v2, code_v2, score_v2) \
         SELECT ?, 'V1', 'v', ?, ?, 10, 1 FROM seq",
    )
    .bind(unit)
    .bind(StatusCode::CodingIncomplete.code())
    .bind(StatusCode::CodingComplete.code())
    .execute(pool)
    .await
    .unwrap();

    let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM responses ORDER BY id")
        .fetch_all(pool)
        .await
        .unwrap();
    assert_eq!(ids.len(), 5003);
    let refused = ids[5001];

    sqlx::query(&format!(
        "CREATE TRIGGER refuse_update BEFORE UPDATE ON responses WHEN NEW.id = {} \
         BEGIN SELECT RAISE(ABORT, 'update refused'); END",
        refused
    ))
    .execute(pool)
    .await
    .unwrap();

    state.statistics().get_statistics(1, CodingVersion::V2).await.unwrap();
    state
        .analyzer()
        .analyze(1, Some(2), &JobContext::detached())
        .await
        .unwrap();
    assert!(!cache.is_empty().await);

    let err = state
        .version_reset()
        .reset(1, CodingVersion::V2, None, None, &JobContext::detached())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DataAccess { .. }));

    let cleared: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM responses WHERE status_v2 IS NULL")
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(cleared, 5000);
    for id in &ids[5000..] {
        assert_eq!(load(pool, *id).await.unwrap().v2, v2());
    }
    assert!(cache.is_empty().await);
}
