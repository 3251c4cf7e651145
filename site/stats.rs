//! # Local Regression Statistics
//!
//! Everything a site computes from its own rows: the augmented design matrix, the per-column
//! missing-value filter, the rank-tolerant OLS fit used in round one, and the residual and
//! cross-product sums used in round two.
//!
//! - Missingness is judged per target column. A row dropped for one target may be used by another.
//! - OLS is solved through the SVD pseudo-inverse, so a rank-deficient design yields the
//!   minimum-norm solution instead of NaN or Inf.
//! - A target column with no observed rows is `PerColumn::Empty`, not an error.

use crate::faer_ndarray::{FaerLinalgError, FaerSvd};
use crate::table::Table;
use crate::types::{Coefficients, PerColumn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Label of the synthetic intercept column prepended to every design matrix.
pub const CONSTANT_LABEL: &str = "const";

/// Prepends a column of ones.
pub fn add_constant(x: ArrayView2<f64>) -> Array2<f64> {
    let mut augmented = Array2::ones((x.nrows(), x.ncols() + 1));
    augmented.slice_mut(s![.., 1..]).assign(&x);
    augmented
}

/// Keeps only the rows where `y` is observed, preserving their order.
pub fn ignore_nans(x: ArrayView2<f64>, y: ArrayView1<f64>) -> (Array2<f64>, Array1<f64>) {
    let kept: Vec<usize> = y
        .iter()
        .enumerate()
        .filter(|&(_, v)| !v.is_nan())
        .map(|(i, _)| i)
        .collect();
    (x.select(Axis(0), &kept), y.select(Axis(0), &kept))
}

/// Residual sum of squares of `y` against the prediction `x · beta`.
pub fn sum_squared_error(x: ArrayView2<f64>, y: ArrayView1<f64>, beta: ArrayView1<f64>) -> f64 {
    let residuals = &y - &x.dot(&beta);
    residuals.dot(&residuals)
}

/// Sum of squared deviations of `y` from `center`.
pub fn total_sum_of_squares(y: ArrayView1<f64>, center: f64) -> f64 {
    y.iter().map(|&v| (v - center) * (v - center)).sum()
}

/// A least-squares fit through the SVD pseudo-inverse.
#[derive(Clone, Debug)]
pub struct OlsFit {
    pub beta: Coefficients,
    /// Numerical rank of the design matrix.
    pub rank: usize,
    /// Pseudo-inverse of `XᵀX`, used for coefficient standard errors.
    pub normal_pinv: Array2<f64>,
}

/// Solves `min ‖y − Xβ‖²`.
///
/// Singular values at or below the cutoff are treated as zero. With `rcond = None` the cutoff is
/// `max(n, p) · ε · σ_max`; otherwise it is `rcond · σ_max`.
pub fn fit_ols(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    rcond: Option<f64>,
) -> Result<OlsFit, FaerLinalgError> {
    let (n, p) = x.dim();
    let (u, singular, vt) = x.thin_svd()?;

    let sigma_max = singular.iter().fold(0.0_f64, |acc, &v| acc.max(v));
    let cutoff = match rcond {
        Some(rcond) => rcond * sigma_max,
        None => n.max(p) as f64 * f64::EPSILON * sigma_max,
    };

    let mut beta = Array1::<f64>::zeros(p);
    let mut normal_pinv = Array2::<f64>::zeros((p, p));
    let mut rank = 0;
    for (i, &sigma) in singular.iter().enumerate() {
        if sigma <= cutoff || sigma == 0.0 {
            continue;
        }
        rank += 1;
        let v_i = vt.row(i);
        let weight = u.column(i).dot(&y) / sigma;
        beta.scaled_add(weight, &v_i);

        let outer = v_i
            .insert_axis(Axis(1))
            .dot(&v_i.insert_axis(Axis(0)));
        normal_pinv.scaled_add(1.0 / (sigma * sigma), &outer);
    }

    if rank < p {
        log::warn!(
            "Design matrix is rank deficient (rank {rank} of {p} columns); using the minimum-norm solution."
        );
    }

    Ok(OlsFit {
        beta: Coefficients::new(beta),
        rank,
        normal_pinv,
    })
}

/// Per-column diagnostics of a site's own fit, as reported under `local_stats_dict`.
///
/// Values that are undefined for the data at hand are `None` and serialize as `null`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocalStats {
    #[serde(rename = "Coefficient")]
    pub coefficient: Coefficients,
    #[serde(rename = "Sum Square of Errors")]
    pub sum_square_of_errors: f64,
    #[serde(rename = "t Stat")]
    pub t_stat: Vec<Option<f64>>,
    #[serde(rename = "P-value")]
    pub p_value: Vec<Option<f64>>,
    #[serde(rename = "R Squared")]
    pub r_squared: Option<f64>,
    pub covariate_labels: Vec<String>,
}

impl OlsFit {
    /// Standard errors, t statistics, two-sided p-values and centered R² for this fit.
    pub fn diagnostics(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        covariate_labels: &[String],
    ) -> LocalStats {
        let n = y.len();
        let sse = sum_squared_error(x, y, self.beta.as_view());
        let dof = n.saturating_sub(self.rank);

        let (t_stat, p_value) = if dof == 0 {
            (vec![None; self.beta.len()], vec![None; self.beta.len()])
        } else {
            let sigma2 = sse / dof as f64;
            let student = StudentsT::new(0.0, 1.0, dof as f64).ok();
            self.beta
                .iter()
                .zip(self.normal_pinv.diag().iter())
                .map(|(&b, &d)| {
                    let se = (sigma2 * d).sqrt();
                    let t = b / se;
                    if se > 0.0 && t.is_finite() {
                        let p = student.as_ref().map(|dist| 2.0 * dist.sf(t.abs()));
                        (Some(t), p.filter(|p| p.is_finite()))
                    } else {
                        (None, None)
                    }
                })
                .unzip()
        };

        let mean = y.mean().unwrap_or(f64::NAN);
        let sst = total_sum_of_squares(y, mean);
        let r_squared = if sst > 0.0 {
            Some(1.0 - sse / sst)
        } else {
            None
        };

        LocalStats {
            coefficient: self.beta.clone(),
            sum_square_of_errors: sse,
            t_stat,
            p_value,
            r_squared,
            covariate_labels: covariate_labels.to_vec(),
        }
    }
}

/// Round-one statistics for one target column with at least one observed row.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedColumn {
    pub beta: Coefficients,
    pub mean: f64,
    pub count: usize,
    pub stats: LocalStats,
}

/// Output of the local statistics calculator.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalStatistics {
    /// Augmented covariate labels, `const` first.
    pub covariate_labels: Vec<String>,
    pub target_labels: Vec<String>,
    pub columns: Vec<PerColumn<ObservedColumn>>,
}

impl LocalStatistics {
    pub fn counts(&self) -> Vec<usize> {
        self.columns
            .iter()
            .map(|column| column.as_observed().map_or(0, |c| c.count))
            .collect()
    }
}

/// Fits every target column of `dependents` against `covariates` independently.
pub fn local_statistics(
    covariates: &Table,
    dependents: &Table,
    rcond: Option<f64>,
) -> Result<LocalStatistics, FaerLinalgError> {
    let augmented = add_constant(covariates.values.view());
    let mut covariate_labels = Vec::with_capacity(covariates.ncols() + 1);
    covariate_labels.push(CONSTANT_LABEL.to_string());
    covariate_labels.extend(covariates.columns.iter().cloned());

    let mut columns = Vec::with_capacity(dependents.ncols());
    for (j, label) in dependents.columns.iter().enumerate() {
        let (x_obs, y_obs) = ignore_nans(augmented.view(), dependents.column(j));
        if y_obs.is_empty() {
            log::warn!("Target column '{label}' has no observed values; reporting it as empty.");
            columns.push(PerColumn::Empty);
            continue;
        }

        let fit = fit_ols(x_obs.view(), y_obs.view(), rcond)?;
        let stats = fit.diagnostics(x_obs.view(), y_obs.view(), &covariates.columns);
        let count = y_obs.len();
        let mean = y_obs.sum() / count as f64;
        log::debug!(
            "Fitted '{label}' on {count} of {} rows (rank {}), mean {mean:.6}",
            dependents.nrows(),
            fit.rank
        );

        columns.push(PerColumn::Observed(ObservedColumn {
            beta: fit.beta,
            mean,
            count,
            stats,
        }));
    }

    Ok(LocalStatistics {
        covariate_labels,
        target_labels: dependents.columns.clone(),
        columns,
    })
}

/// Round-two sums for one target column with at least one observed row.
#[derive(Clone, Debug, PartialEq)]
pub struct ResidualColumn {
    pub sse: f64,
    pub sst: f64,
    /// `X'ᵀ · X'` over the observed rows, not scaled.
    pub var_x: Array2<f64>,
}

/// SSE against the global beta, SST around the global mean, and the raw cross-product,
/// all over the rows where `y` is observed.
pub fn residual_statistics(
    augmented: ArrayView2<f64>,
    y: ArrayView1<f64>,
    global_beta: ArrayView1<f64>,
    global_mean: f64,
) -> PerColumn<ResidualColumn> {
    let (x_obs, y_obs) = ignore_nans(augmented, y);
    if y_obs.is_empty() {
        return PerColumn::Empty;
    }
    PerColumn::Observed(ResidualColumn {
        sse: sum_squared_error(x_obs.view(), y_obs.view(), global_beta),
        sst: total_sum_of_squares(y_obs.view(), global_mean),
        var_x: x_obs.t().dot(&x_obs),
    })
}
