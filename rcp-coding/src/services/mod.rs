//! Pipeline services

pub mod aggregation_resolver;
pub mod agreement;
pub mod autocoder;
pub mod kappa;
pub mod response_analyzer;
pub mod statistics;
pub mod version_reset;
pub mod workspace_settings;

pub use aggregation_resolver::{AggregationResolver, AggregationSummary};
pub use agreement::{AgreementService, KappaSummary, VariableKappa, WeightingMethod};
pub use autocoder::{Autocoder, AutocoderInput, AutocoderRunSummary, AutocoderRunner, SchemeVariable};
pub use kappa::{compute_pairwise, CodePair, CoderPair, KappaInterpretation, PairKappa};
pub use response_analyzer::{AnalysisResult, DuplicateGroup, DuplicateOccurrence, EmptyResponse, ResponseAnalyzer};
pub use statistics::{CodingStatistics, CodingStatisticsService, IncompleteVariable};
pub use version_reset::{ResetSummary, VersionResetCascade};
pub use workspace_settings::update_matching_flags;

use rcp_common::cache::{
    invalidate_analysis, invalidate_incomplete_variables, invalidate_statistics, ANALYSIS_PREFIX,
    INCOMPLETE_VARIABLES_PREFIX, STATISTICS_PREFIX,
};
use rcp_common::cache::CacheStore;
use rcp_common::{CodingVersion, JobContext};

/// Drop every cached result a response write can make stale
///
/// Runs after every committed mutation, including on error and cancel paths.
/// Failures here are logged only so they never mask the operation's own result.
pub(crate) async fn invalidate_after_write(
    cache: &dyn CacheStore,
    ctx: &JobContext,
    workspace_id: i64,
    versions: &[CodingVersion],
) {
    match invalidate_analysis(cache, workspace_id).await {
        Ok(removed) => {
            tracing::debug!(workspace_id, removed, "Invalidated analysis cache");
            ctx.report_cache_invalidated(workspace_id, &format!("{}:{}_*", ANALYSIS_PREFIX, workspace_id));
        }
        Err(e) => tracing::warn!(workspace_id, error = %e, "Analysis cache invalidation failed"),
    }

    invalidate_incomplete_variables(cache, workspace_id).await;
    ctx.report_cache_invalidated(
        workspace_id,
        &format!("{}:{}", INCOMPLETE_VARIABLES_PREFIX, workspace_id),
    );

    for version in versions {
        invalidate_statistics(cache, workspace_id, *version).await;
        ctx.report_cache_invalidated(
            workspace_id,
            &format!("{}:{}:{}", STATISTICS_PREFIX, workspace_id, version),
        );
    }
}
