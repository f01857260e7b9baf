//! Integration tests for empty/duplicate response analysis

mod helpers;

use helpers::*;
use rcp_common::db::{
    set_aggregation_threshold, set_matching_flags, set_setting, AGGREGATION_THRESHOLD_KEY,
};
use rcp_common::events::CodingEvent;
use rcp_common::{CodingTriad, CodingVersion, Error, JobContext, MatchingFlag, MatchingFlags, StatusCode};

fn case_and_space() -> MatchingFlags {
    MatchingFlags::new()
        .with(MatchingFlag::IgnoreCase)
        .with(MatchingFlag::IgnoreWhitespace)
}

#[tokio::test]
async fn test_scenario_normalized_duplicates() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;
    set_matching_flags(pool, 1, &case_and_space()).await.unwrap();

    for (login, value) in [("p1", "abc"), ("p2", "ABC"), ("p3", " abc "), ("p4", "xyz")] {
        manual_response(pool, 1, login, "U1", "V1", Some(value)).await.unwrap();
    }

    let result = state
        .analyzer()
        .analyze(1, Some(2), &JobContext::detached())
        .await
        .unwrap()
        .completed()
        .expect("analysis completes");

    assert_eq!(result.duplicate_groups.len(), 1);
    let group = &result.duplicate_groups[0];
    assert_eq!(group.unit_name, "U1");
    assert_eq!(group.variable_id, "V1");
    assert_eq!(group.normalized_value, "abc");
    assert_eq!(group.count(), 3);
    assert!(result.empty_responses.is_empty());
    assert!(!result.aggregation_already_applied);
}

#[tokio::test]
async fn test_empty_classification_respects_v2() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;

    let null_id = manual_response(pool, 1, "p1", "U1", "V1", None).await.unwrap();
    let blank_id = manual_response(pool, 1, "p2", "U1", "V1", Some("")).await.unwrap();
    let list_id = manual_response(pool, 1, "p3", "U1", "V1", Some("[]")).await.unwrap();
    let coded_id = manual_response(pool, 1, "p4", "U1", "V1", Some("")).await.unwrap();
    set_triad(
        pool,
        coded_id,
        CodingVersion::V2,
        CodingTriad::new(StatusCode::CodingComplete, Some(0), Some(0)),
    )
    .await
    .unwrap();

    let result = state
        .analyzer()
        .analyze(1, None, &JobContext::detached())
        .await
        .unwrap()
        .into_inner();

    let ids: Vec<i64> = result.empty_responses.iter().map(|e| e.response_id).collect();
    assert_eq!(ids, vec![null_id, blank_id, list_id]);
    assert!(result.duplicate_groups.is_empty(), "empty values never group");

    let first = &result.empty_responses[0];
    assert_eq!(first.person_login, "p1");
    assert_eq!(first.booklet_name, "BOOKLET_1");
    assert_eq!(first.unit_alias.as_deref(), Some("U1 alias"));
}

#[tokio::test]
async fn test_no_aggregation_forces_threshold_two() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;
    set_matching_flags(pool, 1, &MatchingFlags::new().with(MatchingFlag::NoAggregation))
        .await
        .unwrap();

    manual_response(pool, 1, "p1", "U1", "V1", Some("same")).await.unwrap();
    manual_response(pool, 1, "p2", "U1", "V1", Some("same")).await.unwrap();

    let result = state
        .analyzer()
        .analyze(1, Some(5), &JobContext::detached())
        .await
        .unwrap()
        .into_inner();

    assert_eq!(result.threshold, 2);
    assert_eq!(result.duplicate_groups.len(), 1);
    assert_eq!(result.duplicate_groups[0].count(), 2);
}

#[tokio::test]
async fn test_threshold_filters_small_groups() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;

    for (i, value) in ["a", "a", "b", "b", "b"].iter().enumerate() {
        manual_response(pool, 1, &format!("p{}", i), "U1", "V1", Some(value))
            .await
            .unwrap();
    }

    let result = state
        .analyzer()
        .analyze(1, Some(3), &JobContext::detached())
        .await
        .unwrap()
        .into_inner();

    assert_eq!(result.duplicate_groups.len(), 1);
    assert_eq!(result.duplicate_groups[0].normalized_value, "b");
}

#[tokio::test]
async fn test_threshold_below_two_is_rejected() {
    let (state, _cache) = test_state().await.unwrap();

    let err = state
        .analyzer()
        .analyze(1, Some(1), &JobContext::detached())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_default_threshold_follows_applied_aggregation() {
    let (state, _cache) = test_state().await.unwrap();
    set_aggregation_threshold(&state.db, 1, 4).await.unwrap();

    let result = state
        .analyzer()
        .analyze(1, None, &JobContext::detached())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(result.threshold, 4);
}

#[tokio::test]
async fn test_corrupt_threshold_setting_uses_default() {
    let (state, _cache) = test_state().await.unwrap();
    set_setting(&state.db, 1, AGGREGATION_THRESHOLD_KEY, "lots").await.unwrap();

    let result = state
        .analyzer()
        .analyze(1, None, &JobContext::detached())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(result.threshold, 2);
}

#[tokio::test]
async fn test_universe_excludes_sentinels_unconsidered_and_auto_coded() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;

    manual_response(pool, 1, "p1", "U1", "V1", Some("x")).await.unwrap();
    let sentinel = manual_response(pool, 1, "p2", "U1", "V1", Some("x")).await.unwrap();
    set_triad(pool, sentinel, CodingVersion::V2, CodingTriad::aggregated_duplicate())
        .await
        .unwrap();

    // Excluded person
    let booklet = add_booklet(pool, 1, "withdrawn", false).await.unwrap();
    let unit = add_unit(pool, booklet, "U1").await.unwrap();
    add_response(pool, unit, "V1", Some("x"), StatusCode::CodingIncomplete)
        .await
        .unwrap();

    // Already coded by v1
    let booklet = add_booklet(pool, 1, "auto", true).await.unwrap();
    let unit = add_unit(pool, booklet, "U1").await.unwrap();
    add_response(pool, unit, "V1", Some("x"), StatusCode::CodingComplete)
        .await
        .unwrap();

    // Other workspace
    manual_response(pool, 2, "p3", "U1", "V1", Some("x")).await.unwrap();

    let result = state
        .analyzer()
        .analyze(1, Some(2), &JobContext::detached())
        .await
        .unwrap()
        .into_inner();

    assert!(result.duplicate_groups.is_empty());
    assert!(result.aggregation_already_applied);
}

#[tokio::test]
async fn test_intended_incomplete_is_eligible() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;

    for login in ["p1", "p2"] {
        let booklet = add_booklet(pool, 1, login, true).await.unwrap();
        let unit = add_unit(pool, booklet, "U1").await.unwrap();
        add_response(pool, unit, "V1", Some("y"), StatusCode::IntendedIncomplete)
            .await
            .unwrap();
    }

    let result = state
        .analyzer()
        .analyze(1, Some(2), &JobContext::detached())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(result.duplicate_groups.len(), 1);
}

#[tokio::test]
async fn test_second_call_hits_cache() {
    let (state, cache) = test_state().await.unwrap();
    let pool = &state.db;
    manual_response(pool, 1, "p1", "U1", "V1", Some("a")).await.unwrap();
    manual_response(pool, 1, "p2", "U1", "V1", Some("a")).await.unwrap();

    let analyzer = state.analyzer();
    let first = analyzer
        .analyze(1, Some(2), &JobContext::detached())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(cache.len().await, 1);

    // Written behind the analyzer's back: only a recomputation would see it
    manual_response(pool, 1, "p3", "U1", "V1", Some("a")).await.unwrap();

    let second = analyzer
        .analyze(1, Some(2), &JobContext::detached())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(second, first);
    assert_eq!(second.duplicate_groups[0].count(), 2);

    // A different threshold is a different key
    let other_threshold = analyzer
        .analyze(1, Some(3), &JobContext::detached())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(other_threshold.duplicate_groups[0].count(), 3);

    // So is a different flag set
    set_matching_flags(pool, 1, &MatchingFlags::new().with(MatchingFlag::IgnoreCase))
        .await
        .unwrap();
    let other_flags = analyzer
        .analyze(1, Some(2), &JobContext::detached())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(other_flags.duplicate_groups[0].count(), 3);
    assert_eq!(cache.len().await, 3);
}

#[tokio::test]
async fn test_chunked_scan_reports_progress() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;

    // More variables than fit in one chunk
    for v in 0..60 {
        let variable = format!("V{:02}", v);
        manual_response(pool, 1, &format!("a{}", v), "U1", &variable, Some("dup"))
            .await
            .unwrap();
        manual_response(pool, 1, &format!("b{}", v), "U1", &variable, Some("dup"))
            .await
            .unwrap();
    }

    let mut rx = state.event_bus.subscribe();
    let ctx = JobContext::new("analysis").with_events(state.event_bus.clone());
    let result = state
        .analyzer()
        .analyze(1, Some(2), &ctx)
        .await
        .unwrap()
        .into_inner();

    assert_eq!(result.duplicate_groups.len(), 60);
    let variables: Vec<&str> = result
        .duplicate_groups
        .iter()
        .map(|g| g.variable_id.as_str())
        .collect();
    let mut sorted = variables.clone();
    sorted.sort();
    assert_eq!(variables, sorted);

    let mut percents = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CodingEvent::JobProgress { percent, .. } = event {
            percents.push(percent);
        }
    }
    assert_eq!(percents, vec![0, 50, 100]);
}

#[tokio::test]
async fn test_cancelled_analysis_is_partial_and_uncached() {
    let (state, cache) = test_state().await.unwrap();
    let pool = &state.db;
    manual_response(pool, 1, "p1", "U1", "V1", Some("a")).await.unwrap();
    manual_response(pool, 1, "p2", "U1", "V1", Some("a")).await.unwrap();

    let ctx = JobContext::new("analysis");
    ctx.cancellation_token().cancel();

    let outcome = state.analyzer().analyze(1, Some(2), &ctx).await.unwrap();
    assert!(outcome.is_cancelled());
    assert!(outcome.as_inner().duplicate_groups.is_empty());
    assert!(cache.is_empty().await);

    let fresh = state
        .analyzer()
        .analyze(1, Some(2), &JobContext::detached())
        .await
        .unwrap();
    assert!(!fresh.is_cancelled());
    assert_eq!(fresh.into_inner().duplicate_groups.len(), 1);
}

#[tokio::test]
async fn test_empty_workspace_is_not_an_error() {
    let (state, _cache) = test_state().await.unwrap();

    let result = state
        .analyzer()
        .analyze(42, Some(2), &JobContext::detached())
        .await
        .unwrap()
        .into_inner();

    assert!(result.empty_responses.is_empty());
    assert!(result.duplicate_groups.is_empty());
    assert_eq!(result.page_duplicate_groups(1, 50).total, 0);
}

#[tokio::test]
async fn test_pagination_over_full_result() {
    let (state, _cache) = test_state().await.unwrap();
    let pool = &state.db;
    for i in 0..5 {
        manual_response(pool, 1, &format!("p{}", i), "U1", "V1", None).await.unwrap();
    }

    let result = state
        .analyzer()
        .analyze(1, Some(2), &JobContext::detached())
        .await
        .unwrap()
        .into_inner();

    let page = result.page_empty_responses(2, 2);
    assert_eq!(page.total, 5);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].person_login, "p2");
}
