//! Workspace-level inter-rater agreement
//!
//! Collects responses coded in at least two coding jobs, pairs up the coders
//! per (unit, variable) and summarizes the per-pair kappas into one number.

use super::kappa::{compute_pairwise, round3, CodePair, CoderPair, PairKappa};
use rcp_common::{DbContext, Result, StatusCode};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

const OPERATION: &str = "kappa summary";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingMethod {
    /// Mean of pair kappas weighted by valid pair count
    Weighted,
    Unweighted,
}

/// Kappa of one coder pair on one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableKappa {
    pub unit_name: String,
    pub variable_id: String,
    #[serde(flatten)]
    pub result: PairKappa,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KappaSummary {
    pub workspace_id: i64,
    /// `None` when no pair has a defined kappa
    pub average_kappa: Option<f64>,
    pub weighting_method: WeightingMethod,
    pub variable_count: usize,
    pub coder_count: usize,
    /// Pairs that contributed to the average
    pub included_pairs: usize,
    pub pairs: Vec<VariableKappa>,
}

/// One coder's code for one double-coded response
#[derive(Debug, Clone)]
pub(crate) struct CodingRow {
    pub response_id: i64,
    pub coding_job_id: i64,
    pub unit_name: String,
    pub variable_id: String,
    pub coder_id: i64,
    pub coder_name: String,
    pub code: Option<i64>,
}

/// (unit name, variable id, lower coder id, higher coder id)
type PairKey = (String, String, i64, i64);

pub struct AgreementService {
    db: SqlitePool,
}

impl AgreementService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Summarize coder agreement for a workspace
    ///
    /// Only responses whose v1 status sent them to manual coding and that
    /// appear in two or more distinct coding jobs count as double-coded.
    pub async fn compute_workspace_summary(
        &self,
        workspace_id: i64,
        weighted: bool,
        exclude_trainings: bool,
    ) -> Result<KappaSummary> {
        let rows = self
            .double_coded_rows(workspace_id, exclude_trainings)
            .await?;
        let weighting = if weighted {
            WeightingMethod::Weighted
        } else {
            WeightingMethod::Unweighted
        };

        let grouped = build_coder_pairs(rows);
        let summary = summarize(workspace_id, grouped, weighting);

        info!(
            workspace_id,
            pairs = summary.pairs.len(),
            variables = summary.variable_count,
            coders = summary.coder_count,
            kappa = ?summary.average_kappa,
            "Computed workspace kappa summary"
        );
        Ok(summary)
    }

    async fn double_coded_rows(
        &self,
        workspace_id: i64,
        exclude_trainings: bool,
    ) -> Result<Vec<CodingRow>> {
        let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new(
            "SELECT cju.response_id, cju.coding_job_id, cju.unit_name, cju.variable_id, \
                    cjc.coder_id, c.username AS coder_name, cju.code \
             FROM coding_job_units cju \
             JOIN coding_jobs cj ON cj.id = cju.coding_job_id \
             JOIN coding_job_coders cjc ON cjc.coding_job_id = cj.id \
             JOIN coders c ON c.id = cjc.coder_id \
             JOIN responses r ON r.id = cju.response_id \
             WHERE cj.workspace_id = ",
        );
        qb.push_bind(workspace_id);
        if exclude_trainings {
            qb.push(" AND cj.training_id IS NULL");
        }
        qb.push(" AND r.status_v1 IN (");
        let mut sep = qb.separated(", ");
        for status in StatusCode::MANUAL_CODING_STATES {
            sep.push_bind(status.code());
        }
        sep.push_unseparated(")");

        qb.push(
            " AND cju.response_id IN (\
                SELECT cju2.response_id FROM coding_job_units cju2 \
                JOIN coding_jobs cj2 ON cj2.id = cju2.coding_job_id \
                WHERE cj2.workspace_id = ",
        );
        qb.push_bind(workspace_id);
        if exclude_trainings {
            qb.push(" AND cj2.training_id IS NULL");
        }
        qb.push(
            " GROUP BY cju2.response_id HAVING COUNT(DISTINCT cju2.coding_job_id) >= 2) \
             ORDER BY cju.response_id, cjc.coder_id, cju.coding_job_id",
        );

        let rows = qb
            .build()
            .fetch_all(&self.db)
            .await
            .db_context(OPERATION, workspace_id)?;

        Ok(rows
            .iter()
            .map(|row| CodingRow {
                response_id: row.get("response_id"),
                coding_job_id: row.get("coding_job_id"),
                unit_name: row.get("unit_name"),
                variable_id: row.get("variable_id"),
                coder_id: row.get("coder_id"),
                coder_name: row.get("coder_name"),
                code: row.get("code"),
            })
            .collect())
    }
}

/// Group codings into canonical coder pairs per variable
///
/// Rows must be ordered by response id. A coder who coded the same response
/// in several jobs counts once, with the first code seen. Coders sharing one
/// job share its code and are never paired. The lower coder id always lands
/// in `code1`.
pub(crate) fn build_coder_pairs(rows: Vec<CodingRow>) -> BTreeMap<PairKey, CoderPair> {
    let mut pairs: BTreeMap<PairKey, CoderPair> = BTreeMap::new();

    let mut current: Vec<CodingRow> = Vec::new();
    let mut flush = |codings: &mut Vec<CodingRow>| {
        codings.sort_by_key(|c| c.coder_id);
        codings.dedup_by_key(|c| c.coder_id);

        for (i, low) in codings.iter().enumerate() {
            for high in &codings[i + 1..] {
                if low.coding_job_id == high.coding_job_id {
                    continue;
                }
                let key = (
                    low.unit_name.clone(),
                    low.variable_id.clone(),
                    low.coder_id,
                    high.coder_id,
                );
                pairs
                    .entry(key)
                    .or_insert_with(|| CoderPair {
                        coder1_id: low.coder_id,
                        coder1_name: low.coder_name.clone(),
                        coder2_id: high.coder_id,
                        coder2_name: high.coder_name.clone(),
                        codes: Vec::new(),
                    })
                    .codes
                    .push(CodePair::new(low.code, high.code));
            }
        }
        codings.clear();
    };

    for row in rows {
        if current
            .first()
            .is_some_and(|first| first.response_id != row.response_id)
        {
            flush(&mut current);
        }
        current.push(row);
    }
    flush(&mut current);

    pairs
}

fn summarize(
    workspace_id: i64,
    grouped: BTreeMap<PairKey, CoderPair>,
    weighting: WeightingMethod,
) -> KappaSummary {
    let keys: Vec<(String, String)> = grouped.keys().map(|(u, v, _, _)| (u.clone(), v.clone())).collect();
    let coder_pairs: Vec<CoderPair> = grouped.into_values().collect();
    let results = compute_pairwise(&coder_pairs);

    let variables: BTreeSet<&(String, String)> = keys.iter().collect();
    let coders: BTreeSet<i64> = results
        .iter()
        .flat_map(|r| [r.coder1_id, r.coder2_id])
        .collect();

    let defined: Vec<(f64, usize)> = results
        .iter()
        .filter_map(|r| r.kappa.map(|k| (k, r.valid_pairs)))
        .collect();
    let average_kappa = mean_kappa(&defined, weighting);

    let variable_count = variables.len();
    let coder_count = coders.len();
    let pairs = keys
        .into_iter()
        .zip(results)
        .map(|((unit_name, variable_id), result)| VariableKappa {
            unit_name,
            variable_id,
            result,
        })
        .collect();

    KappaSummary {
        workspace_id,
        average_kappa,
        weighting_method: weighting,
        variable_count,
        coder_count,
        included_pairs: defined.len(),
        pairs,
    }
}

/// Mean over `(kappa, valid pair count)`, rounded to 3 decimals
fn mean_kappa(defined: &[(f64, usize)], weighting: WeightingMethod) -> Option<f64> {
    if defined.is_empty() {
        return None;
    }

    let mean = match weighting {
        WeightingMethod::Weighted => {
            let total: usize = defined.iter().map(|&(_, n)| n).sum();
            if total == 0 {
                return None;
            }
            defined.iter().map(|&(k, n)| k * n as f64).sum::<f64>() / total as f64
        }
        WeightingMethod::Unweighted => {
            defined.iter().map(|&(k, _)| k).sum::<f64>() / defined.len() as f64
        }
    };

    Some(round3(mean))
}
