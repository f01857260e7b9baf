//! Response filters and query construction
//!
//! A [`ResponseFilter`] is a plain value describing which responses an
//! operation touches. [`ResponseFilter::build_select`] is the single place
//! turning it into SQL, so the generated statement can be inspected in
//! tests without a database.

use rcp_common::models::{CodingTriad, CodingVersion, AGGREGATION_SENTINEL_CODE};
use rcp_common::{Error, Result, StatusCode};
use sqlx::{QueryBuilder, Sqlite};

/// Joins every response to its unit, booklet and person
const RESPONSE_JOINS: &str = " FROM responses r \
     JOIN units u ON r.unit_id = u.id \
     JOIN booklets b ON u.booklet_id = b.id \
     JOIN persons p ON b.person_id = p.id";

/// Optional predicates over the response table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFilter {
    pub workspace_id: i64,
    /// Restrict to persons flagged as considered
    pub considered_only: bool,
    pub unit_names: Option<Vec<String>>,
    pub variable_ids: Option<Vec<String>>,
    /// Exact (unit name, variable id) pairs
    pub unit_variables: Option<Vec<(String, String)>>,
    pub v1_statuses: Option<Vec<StatusCode>>,
    /// Skip responses carrying the aggregation sentinel
    pub exclude_aggregated: bool,
    /// Keep only responses carrying the aggregation sentinel
    pub only_aggregated: bool,
    /// Keep only responses whose v2 status is unset
    pub v2_unset: bool,
    /// Keep only responses whose v2 status is set
    pub v2_set: bool,
    /// Keyset pagination: only ids strictly greater than this
    pub after_id: Option<i64>,
}

impl ResponseFilter {
    /// All responses of considered persons in a workspace
    pub fn workspace(workspace_id: i64) -> Self {
        Self {
            workspace_id,
            considered_only: true,
            unit_names: None,
            variable_ids: None,
            unit_variables: None,
            v1_statuses: None,
            exclude_aggregated: false,
            only_aggregated: false,
            v2_unset: false,
            v2_set: false,
            after_id: None,
        }
    }

    /// Include responses of persons excluded from analysis
    pub fn including_unconsidered(mut self) -> Self {
        self.considered_only = false;
        self
    }

    pub fn units(mut self, names: Option<Vec<String>>) -> Self {
        self.unit_names = names;
        self
    }

    pub fn variables(mut self, ids: Option<Vec<String>>) -> Self {
        self.variable_ids = ids;
        self
    }

    pub fn unit_variables(mut self, pairs: Vec<(String, String)>) -> Self {
        self.unit_variables = Some(pairs);
        self
    }

    pub fn v1_statuses(mut self, statuses: &[StatusCode]) -> Self {
        self.v1_statuses = Some(statuses.to_vec());
        self
    }

    pub fn excluding_aggregated(mut self) -> Self {
        self.exclude_aggregated = true;
        self
    }

    pub fn only_aggregated(mut self) -> Self {
        self.only_aggregated = true;
        self
    }

    pub fn v2_unset(mut self) -> Self {
        self.v2_unset = true;
        self
    }

    pub fn v2_set(mut self) -> Self {
        self.v2_set = true;
        self
    }

    pub fn after_id(mut self, id: i64) -> Self {
        self.after_id = Some(id);
        self
    }

    /// Reject filters that cannot match anything meaningful
    pub fn validate(&self) -> Result<()> {
        check_list("unit filter", self.unit_names.as_deref())?;
        check_list("variable filter", self.variable_ids.as_deref())?;

        if let Some(pairs) = &self.unit_variables {
            if pairs.is_empty() {
                return Err(Error::Validation("unit/variable pair list is empty".to_string()));
            }
        }
        if let Some(statuses) = &self.v1_statuses {
            if statuses.is_empty() {
                return Err(Error::Validation("status filter is empty".to_string()));
            }
        }
        if self.exclude_aggregated && self.only_aggregated {
            return Err(Error::Validation(
                "cannot both exclude and require aggregated duplicates".to_string(),
            ));
        }
        if self.v2_set && self.v2_unset {
            return Err(Error::Validation(
                "cannot require v2 status to be both set and unset".to_string(),
            ));
        }

        Ok(())
    }

    /// Build `SELECT <columns> FROM responses ... WHERE ...`
    ///
    /// The WHERE clause always starts with the workspace predicate, so callers
    /// may append further `AND ...` conditions, ORDER BY and LIMIT.
    pub fn build_select(&self, columns: &str) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new(format!("SELECT {}{}", columns, RESPONSE_JOINS));
        self.push_conditions(&mut qb);
        qb
    }

    fn push_conditions(&self, qb: &mut QueryBuilder<'static, Sqlite>) {
        qb.push(" WHERE p.workspace_id = ");
        qb.push_bind(self.workspace_id);

        if self.considered_only {
            qb.push(" AND p.consider = 1");
        }

        if let Some(names) = &self.unit_names {
            qb.push(" AND u.name IN (");
            let mut sep = qb.separated(", ");
            for name in names {
                sep.push_bind(name.clone());
            }
            sep.push_unseparated(")");
        }

        if let Some(ids) = &self.variable_ids {
            qb.push(" AND r.variable_id IN (");
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(id.clone());
            }
            sep.push_unseparated(")");
        }

        if let Some(pairs) = &self.unit_variables {
            qb.push(" AND (");
            for (i, (unit, variable)) in pairs.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push("(u.name = ");
                qb.push_bind(unit.clone());
                qb.push(" AND r.variable_id = ");
                qb.push_bind(variable.clone());
                qb.push(")");
            }
            qb.push(")");
        }

        if let Some(statuses) = &self.v1_statuses {
            qb.push(" AND r.status_v1 IN (");
            let mut sep = qb.separated(", ");
            for status in statuses {
                sep.push_bind(status.code());
            }
            sep.push_unseparated(")");
        }

        if self.exclude_aggregated {
            qb.push(" AND (r.code_v2 IS NULL OR r.code_v2 <> ");
            qb.push_bind(AGGREGATION_SENTINEL_CODE);
            qb.push(")");
        }

        if self.only_aggregated {
            qb.push(" AND r.code_v2 = ");
            qb.push_bind(AGGREGATION_SENTINEL_CODE);
        }

        if self.v2_unset {
            qb.push(" AND r.status_v2 IS NULL");
        }

        if self.v2_set {
            qb.push(" AND r.status_v2 IS NOT NULL");
        }

        if let Some(after) = self.after_id {
            qb.push(" AND r.id > ");
            qb.push_bind(after);
        }
    }
}

fn check_list(what: &str, list: Option<&[String]>) -> Result<()> {
    if let Some(list) = list {
        if list.is_empty() {
            return Err(Error::Validation(format!("{} is empty", what)));
        }
        if list.iter().any(|v| v.trim().is_empty()) {
            return Err(Error::Validation(format!("{} contains a blank entry", what)));
        }
    }
    Ok(())
}

/// Build `UPDATE responses SET <triad of each version> WHERE id IN (...)`
///
/// `triad` is written to every listed version; pass `CodingTriad::default()`
/// to null the columns. Callers may append further `AND ...` guards.
pub fn build_triad_update(
    versions: &[CodingVersion],
    triad: &CodingTriad,
    ids: &[i64],
) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new("UPDATE responses SET ");

    for (i, version) in versions.iter().enumerate() {
        let (status_col, code_col, score_col) = version.columns();
        if i > 0 {
            qb.push(", ");
        }
        qb.push(status_col);
        qb.push(" = ");
        qb.push_bind(triad.status.map(StatusCode::code));
        qb.push(", ");
        qb.push(code_col);
        qb.push(" = ");
        qb.push_bind(triad.code);
        qb.push(", ");
        qb.push(score_col);
        qb.push(" = ");
        qb.push_bind(triad.score);
    }

    qb.push(" WHERE id IN (");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(*id);
    }
    sep.push_unseparated(")");

    qb
}
