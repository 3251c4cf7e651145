//! # Round Handlers
//!
//! The two local computations of single-shot decentralized ridge regression, plus the typed
//! request/response envelopes that carry them.
//!
//! Round one (`local_1`) fits each target column on this site's rows and returns the betas,
//! means and counts the aggregator needs to form global estimates. Its cache holds the raw
//! covariate and dependent tables and `lambda`, and nothing else.
//!
//! Round two (`local_2`) reloads those tables from the cache and, given the global beta and
//! mean per column, returns the residual and total sums of squares and the `XᵀX` cross-product.
//! Its cache is empty: the fit is finished as far as this site is concerned.
//!
//! Both handlers are pure functions of `(input, cache) -> (output, cache)`.

use crate::data::{self, DataError, TableRef};
use crate::faer_ndarray::FaerLinalgError;
use crate::phase::{self, Phase, PhaseError};
use crate::settings::SiteSettings;
use crate::stats::{self, LocalStats};
use crate::table::{Table, TableError};
use crate::types::{Coefficients, PerColumn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComputationError {
    #[error(transparent)]
    Protocol(#[from] PhaseError),

    #[error("The {phase} request could not be parsed: {source}")]
    MalformedRequest {
        phase: Phase,
        source: serde_json::Error,
    },

    #[error("The response could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("The round-one cache is unusable: {0}")]
    MalformedCache(#[from] TableError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("The local regression solve failed: {0}")]
    Linalg(#[from] FaerLinalgError),

    #[error("The regularization parameter lambda must be finite and non-negative, got {0}.")]
    InvalidLambda(f64),

    #[error(
        "The aggregator sent {field} for {found} target columns, but this site cached {expected}."
    )]
    ColumnCountMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("The aggregator sent no global {field} for target column '{column}', which has observed values at this site.")]
    GlobalStatisticMissing { field: &'static str, column: String },

    #[error(
        "The global beta for target column '{column}' has {found} entries, but the design matrix has {expected} columns."
    )]
    BetaLengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
}

/// Round-one input: the site's own tables and the ridge penalty.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LocalOneInput {
    pub covariates: TableRef,
    #[serde(rename = "data")]
    pub dependents: TableRef,
    pub lambda: f64,
}

/// State a site keeps between its two rounds. The tables are split-orientation JSON strings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteCache {
    pub covariates: String,
    pub dependents: String,
    pub lambda: f64,
}

impl SiteCache {
    pub fn new(covariates: &Table, dependents: &Table, lambda: f64) -> Result<Self, TableError> {
        Ok(Self {
            covariates: covariates.to_split_json()?,
            dependents: dependents.to_split_json()?,
            lambda,
        })
    }

    /// Restores the covariate and dependent tables.
    pub fn tables(&self) -> Result<(Table, Table), TableError> {
        Ok((
            Table::from_split_json(&self.covariates)?,
            Table::from_split_json(&self.dependents)?,
        ))
    }
}

/// The cache a site returns once its part of the fit is complete.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearedCache {}

/// Round-two input: the aggregator's combined estimates, one entry per target column.
///
/// The `remote_1` marker that travels alongside is consumed by [`phase::detect_phase`].
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LocalTwoInput {
    pub avg_beta_vector: Vec<PerColumn<Coefficients>>,
    pub mean_y_global: Vec<PerColumn<f64>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocalOneOutput {
    pub beta_vector_local: Vec<PerColumn<Coefficients>>,
    pub mean_y_local: Vec<PerColumn<f64>>,
    pub count_y_local: Vec<usize>,
    #[serde(rename = "X_labels")]
    pub covariate_labels: Vec<String>,
    #[serde(rename = "y_labels")]
    pub target_labels: Vec<String>,
    #[serde(rename = "local_stats_dict", skip_serializing_if = "Option::is_none")]
    pub local_stats: Option<Vec<PerColumn<LocalStats>>>,
    pub computation_phase: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocalTwoOutput {
    #[serde(rename = "SSE_local")]
    pub sse_local: Vec<PerColumn<f64>>,
    #[serde(rename = "SST_local")]
    pub sst_local: Vec<PerColumn<f64>>,
    #[serde(rename = "varX_matrix_local")]
    pub var_x_local: Vec<PerColumn<Vec<Vec<f64>>>>,
    pub computation_phase: &'static str,
}

/// What a handler hands back to the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Response<O, C> {
    pub output: O,
    pub cache: C,
}

/// A request whose round has been decided.
#[derive(Clone, Debug, PartialEq)]
pub enum SiteRequest {
    LocalOne(LocalOneInput),
    LocalTwo {
        input: LocalTwoInput,
        cache: SiteCache,
    },
}

#[derive(Deserialize)]
struct Envelope<I, C> {
    input: I,
    cache: C,
}

#[derive(Deserialize)]
struct InputOnly<I> {
    input: I,
}

impl SiteRequest {
    /// Detects the round and parses the request into its typed form.
    pub fn from_value(request: Value) -> Result<Self, ComputationError> {
        let phase = phase::detect_phase(&request)?;
        log::info!("Detected phase: {phase}");
        let malformed = |source| ComputationError::MalformedRequest { phase, source };
        match phase {
            Phase::LocalOne => {
                let envelope: InputOnly<LocalOneInput> =
                    serde_json::from_value(request).map_err(malformed)?;
                Ok(SiteRequest::LocalOne(envelope.input))
            }
            Phase::LocalTwo => {
                let envelope: Envelope<LocalTwoInput, SiteCache> =
                    serde_json::from_value(request).map_err(malformed)?;
                Ok(SiteRequest::LocalTwo {
                    input: envelope.input,
                    cache: envelope.cache,
                })
            }
        }
    }
}

/// Round one: fits every target column locally and caches the tables for round two.
pub fn local_1(
    input: &LocalOneInput,
    settings: &SiteSettings,
) -> Result<Response<LocalOneOutput, SiteCache>, ComputationError> {
    if !input.lambda.is_finite() || input.lambda < 0.0 {
        return Err(ComputationError::InvalidLambda(input.lambda));
    }

    let site = data::parse_site_data(
        &input.covariates,
        &input.dependents,
        settings.separator_byte(),
    )?;
    let local = stats::local_statistics(&site.covariates, &site.dependents, settings.solver.rcond)?;

    let output = LocalOneOutput {
        beta_vector_local: local.columns.iter().map(|c| c.map(|c| c.beta.clone())).collect(),
        mean_y_local: local.columns.iter().map(|c| c.map(|c| c.mean)).collect(),
        count_y_local: local.counts(),
        local_stats: settings.output.local_stats.then(|| {
            local
                .columns
                .iter()
                .map(|c| c.map(|c| c.stats.clone()))
                .collect()
        }),
        covariate_labels: local.covariate_labels,
        target_labels: local.target_labels,
        computation_phase: phase::LOCAL_ROUND_ONE,
    };
    let cache = SiteCache::new(&site.covariates, &site.dependents, input.lambda)?;

    log::info!(
        "Round one complete: {} target columns, {} empty.",
        output.count_y_local.len(),
        output.count_y_local.iter().filter(|&&n| n == 0).count()
    );
    Ok(Response { output, cache })
}

/// Round two: residual and total sums of squares against the global estimates, and the
/// per-column cross-product of the observed design rows.
pub fn local_2(
    input: &LocalTwoInput,
    cache: &SiteCache,
) -> Result<Response<LocalTwoOutput, ClearedCache>, ComputationError> {
    let (covariates, dependents) = cache.tables()?;
    data::validate(&covariates, &dependents)?;
    let targets = dependents.ncols();

    for (field, found) in [
        ("avg_beta_vector", input.avg_beta_vector.len()),
        ("mean_y_global", input.mean_y_global.len()),
    ] {
        if found != targets {
            return Err(ComputationError::ColumnCountMismatch {
                field,
                expected: targets,
                found,
            });
        }
    }

    let augmented = stats::add_constant(covariates.values.view());
    let mut sse_local = Vec::with_capacity(targets);
    let mut sst_local = Vec::with_capacity(targets);
    let mut var_x_local = Vec::with_capacity(targets);

    for (j, label) in dependents.columns.iter().enumerate() {
        let y = dependents.column(j);
        if y.iter().all(|v| v.is_nan()) {
            log::debug!("Target column '{label}' has no observed values; skipping.");
            sse_local.push(PerColumn::Empty);
            sst_local.push(PerColumn::Empty);
            var_x_local.push(PerColumn::Empty);
            continue;
        }

        let beta = input.avg_beta_vector[j].as_observed().ok_or_else(|| {
            ComputationError::GlobalStatisticMissing {
                field: "beta",
                column: label.clone(),
            }
        })?;
        if beta.len() != augmented.ncols() {
            return Err(ComputationError::BetaLengthMismatch {
                column: label.clone(),
                expected: augmented.ncols(),
                found: beta.len(),
            });
        }
        let mean = *input.mean_y_global[j].as_observed().ok_or_else(|| {
            ComputationError::GlobalStatisticMissing {
                field: "mean",
                column: label.clone(),
            }
        })?;

        let residual = stats::residual_statistics(augmented.view(), y, beta.as_view(), mean);
        sse_local.push(residual.map(|r| r.sse));
        sst_local.push(residual.map(|r| r.sst));
        var_x_local.push(residual.map(|r| {
            r.var_x
                .rows()
                .into_iter()
                .map(|row| row.to_vec())
                .collect::<Vec<_>>()
        }));
    }

    log::info!("Round two complete for {targets} target columns.");
    Ok(Response {
        output: LocalTwoOutput {
            sse_local,
            sst_local,
            var_x_local,
            computation_phase: phase::LOCAL_ROUND_TWO,
        },
        cache: ClearedCache {},
    })
}

/// Runs whichever round `request` belongs to and returns the response document.
pub fn run(request: Value, settings: &SiteSettings) -> Result<Value, ComputationError> {
    let response = match SiteRequest::from_value(request)? {
        SiteRequest::LocalOne(input) => serde_json::to_value(local_1(&input, settings)?)?,
        SiteRequest::LocalTwo { input, cache } => serde_json::to_value(local_2(&input, &cache)?)?,
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use serde_json::json;

    fn scenario_request() -> Value {
        json!({
            "input": {
                "covariates": {"columns": ["x"], "data": [[1.0], [2.0], [3.0], [4.0]]},
                "data": {"columns": ["y"], "data": [[2.0], [null], [4.0], [8.0]]},
                "lambda": 0.0
            },
            "cache": {}
        })
    }

    #[test]
    fn round_one_scenario_uses_observed_rows_only() {
        let request = SiteRequest::from_value(scenario_request()).unwrap();
        let SiteRequest::LocalOne(input) = request else {
            panic!("expected a round-one request");
        };
        let response = local_1(&input, &SiteSettings::default()).unwrap();

        let beta = response.output.beta_vector_local[0].as_observed().unwrap();
        assert_abs_diff_eq!(beta[0], -2.0 / 7.0, epsilon = 1e-10);
        assert_abs_diff_eq!(beta[1], 13.0 / 7.0, epsilon = 1e-10);
        assert_eq!(response.output.mean_y_local[0], PerColumn::Observed(14.0 / 3.0));
        assert_eq!(response.output.count_y_local, vec![3]);
        assert_eq!(response.output.covariate_labels, vec!["const", "x"]);
        assert_eq!(response.output.target_labels, vec!["y"]);
        assert_eq!(response.output.computation_phase, "local_1");
        assert_eq!(response.cache.lambda, 0.0);
    }

    #[test]
    fn round_one_cache_holds_the_unaugmented_tables() {
        let SiteRequest::LocalOne(input) = SiteRequest::from_value(scenario_request()).unwrap()
        else {
            panic!("expected a round-one request");
        };
        let response = local_1(&input, &SiteSettings::default()).unwrap();
        let (covariates, dependents) = response.cache.tables().unwrap();
        assert_eq!(covariates.columns, vec!["x"]);
        assert_eq!(covariates.values.ncols(), 1);
        assert_eq!(dependents.columns, vec!["y"]);
        assert!(dependents.values[[1, 0]].is_nan());
        assert_eq!(dependents.values[[3, 0]], 8.0);
    }

    #[test]
    fn local_stats_can_be_switched_off() {
        let SiteRequest::LocalOne(input) = SiteRequest::from_value(scenario_request()).unwrap()
        else {
            panic!("expected a round-one request");
        };
        let mut settings = SiteSettings::default();
        settings.output.local_stats = false;
        let response = serde_json::to_value(local_1(&input, &settings).unwrap()).unwrap();
        assert!(response["output"].get("local_stats_dict").is_none());
        assert!(response["output"].get("beta_vector_local").is_some());
    }

    #[test]
    fn negative_lambda_is_rejected() {
        let mut request = scenario_request();
        request["input"]["lambda"] = json!(-1.0);
        let err = run(request, &SiteSettings::default()).unwrap_err();
        assert!(matches!(err, ComputationError::InvalidLambda(v) if v == -1.0));
    }

    #[test]
    fn round_two_request_parses_beside_its_marker() {
        let request = json!({
            "input": {
                "avg_beta_vector": [[0.0, 2.0], []],
                "mean_y_global": [5.0, null],
                "computation_phase": "remote_1"
            },
            "cache": serde_json::to_value(scenario_cache()).unwrap()
        });
        let SiteRequest::LocalTwo { input, cache } = SiteRequest::from_value(request).unwrap()
        else {
            panic!("expected a round-two request");
        };
        assert_eq!(
            input.avg_beta_vector[0],
            PerColumn::Observed(Coefficients::from(vec![0.0, 2.0]))
        );
        assert!(input.avg_beta_vector[1].is_empty());
        assert!(input.mean_y_global[1].is_empty());
        assert_eq!(cache, scenario_cache());
    }

    #[test]
    fn round_two_request_requires_a_cache() {
        let request = json!({
            "input": {"avg_beta_vector": [[0.0, 1.0]], "mean_y_global": [1.0], "computation_phase": "remote_1"},
            "cache": {}
        });
        let err = SiteRequest::from_value(request).unwrap_err();
        assert!(matches!(
            err,
            ComputationError::MalformedRequest { phase: Phase::LocalTwo, .. }
        ));
    }

    fn scenario_cache() -> SiteCache {
        let covariates =
            Table::new(vec!["x".into()], ndarray::array![[1.0], [2.0], [3.0], [4.0]]).unwrap();
        let dependents = Table::new(
            vec!["y".into(), "gone".into()],
            ndarray::array![[2.0, f64::NAN], [f64::NAN, f64::NAN], [4.0, f64::NAN], [8.0, f64::NAN]],
        )
        .unwrap();
        SiteCache::new(&covariates, &dependents, 0.5).unwrap()
    }

    #[test]
    fn round_two_sums_against_global_values() {
        let input = LocalTwoInput {
            avg_beta_vector: vec![
                PerColumn::Observed(Coefficients::from(vec![0.0, 2.0])),
                PerColumn::Empty,
            ],
            mean_y_global: vec![PerColumn::Observed(5.0), PerColumn::Empty],
        };
        let response = local_2(&input, &scenario_cache()).unwrap();

        // Observed rows x = 1, 3, 4 with y = 2, 4, 8; predictions 2, 6, 8.
        assert_eq!(response.output.sse_local[0], PerColumn::Observed(4.0));
        // (2-5)² + (4-5)² + (8-5)²
        assert_eq!(response.output.sst_local[0], PerColumn::Observed(19.0));
        assert_eq!(
            response.output.var_x_local[0],
            PerColumn::Observed(vec![vec![3.0, 8.0], vec![8.0, 26.0]])
        );
        assert!(response.output.sse_local[1].is_empty());
        assert!(response.output.sst_local[1].is_empty());
        assert!(response.output.var_x_local[1].is_empty());
        assert_eq!(response.output.computation_phase, "local_2");
        assert_eq!(serde_json::to_value(&response).unwrap()["cache"], json!({}));
    }

    #[test]
    fn round_two_rejects_wrong_column_count() {
        let input = LocalTwoInput {
            avg_beta_vector: vec![PerColumn::Observed(Coefficients::from(vec![0.0, 2.0]))],
            mean_y_global: vec![PerColumn::Observed(5.0)],
        };
        let err = local_2(&input, &scenario_cache()).unwrap_err();
        assert!(matches!(
            err,
            ComputationError::ColumnCountMismatch { field: "avg_beta_vector", expected: 2, found: 1 }
        ));
    }

    #[test]
    fn round_two_rejects_missing_global_beta_for_observed_column() {
        let input = LocalTwoInput {
            avg_beta_vector: vec![PerColumn::Empty, PerColumn::Empty],
            mean_y_global: vec![PerColumn::Observed(5.0), PerColumn::Empty],
        };
        let err = local_2(&input, &scenario_cache()).unwrap_err();
        assert!(matches!(
            err,
            ComputationError::GlobalStatisticMissing { field: "beta", ref column } if column == "y"
        ));
    }

    #[test]
    fn round_two_rejects_short_beta() {
        let input = LocalTwoInput {
            avg_beta_vector: vec![
                PerColumn::Observed(Coefficients::from(vec![1.0])),
                PerColumn::Empty,
            ],
            mean_y_global: vec![PerColumn::Observed(5.0), PerColumn::Empty],
        };
        assert!(matches!(
            local_2(&input, &scenario_cache()).unwrap_err(),
            ComputationError::BetaLengthMismatch { expected: 2, found: 1, .. }
        ));
    }

    #[test]
    fn corrupt_cache_is_fatal() {
        let input = LocalTwoInput {
            avg_beta_vector: vec![PerColumn::Observed(Coefficients::from(vec![0.0, 2.0]))],
            mean_y_global: vec![PerColumn::Observed(5.0)],
        };
        let cache = SiteCache {
            covariates: "{not json".to_string(),
            dependents: "{}".to_string(),
            lambda: 0.0,
        };
        assert!(matches!(
            local_2(&input, &cache).unwrap_err(),
            ComputationError::MalformedCache(_)
        ));
    }
}
