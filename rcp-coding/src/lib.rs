//! rcp-coding library - multi-version coding pipeline services
//!
//! Duplicate/empty response analysis, duplicate aggregation, version reset
//! with cascade, inter-rater agreement and the autocoder runner. All services
//! share one SQLite pool and an explicitly passed cache.

pub mod filters;
pub mod normalization;
pub mod pagination;
pub mod services;

use rcp_common::cache::CacheStore;
use rcp_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

/// State shared by the pipeline services
#[derive(Clone)]
pub struct PipelineState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Result cache (analysis, statistics, incomplete variables)
    pub cache: Arc<dyn CacheStore>,
    /// Event bus for job progress
    pub event_bus: EventBus,
    /// Optional bounded lifetime for cached analysis results
    pub cache_ttl: Option<Duration>,
}

impl PipelineState {
    pub fn new(db: SqlitePool, cache: Arc<dyn CacheStore>, event_bus: EventBus) -> Self {
        Self {
            db,
            cache,
            event_bus,
            cache_ttl: None,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn analyzer(&self) -> services::ResponseAnalyzer {
        services::ResponseAnalyzer::new(self.db.clone(), self.cache.clone())
            .with_cache_ttl(self.cache_ttl)
    }

    pub fn aggregation_resolver(&self) -> services::AggregationResolver {
        services::AggregationResolver::new(self.db.clone(), self.cache.clone(), self.analyzer())
    }

    pub fn version_reset(&self) -> services::VersionResetCascade {
        services::VersionResetCascade::new(self.db.clone(), self.cache.clone())
    }

    pub fn agreement(&self) -> services::AgreementService {
        services::AgreementService::new(self.db.clone())
    }

    pub fn statistics(&self) -> services::CodingStatisticsService {
        services::CodingStatisticsService::new(self.db.clone(), self.cache.clone())
    }
}
