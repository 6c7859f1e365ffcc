//! Summary statistics over fitted voxels.

use statrs::statistics::Statistics;

use crate::error::AppError;
use crate::fit::FittedModel;

/// Pearson correlation of paired samples; pairs with a non-finite member are
/// skipped. `None` with fewer than two pairs or zero variance.
pub fn pearson_r(x: &[f64], y: &[f64]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(&a, &b)| (a, b))
        .collect();
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mx = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let my = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in &pairs {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }
    Some(sxy / (sxx * syy).sqrt())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSummary {
    pub name: String,
    /// Voxels contributing (successful and finite).
    pub n: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl ParameterSummary {
    pub fn from_values(name: impl Into<String>, values: &[f64]) -> Self {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let (min, max) = finite
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let std = if finite.len() > 1 { finite.iter().std_dev() } else { 0.0 };
        Self {
            name: name.into(),
            n: finite.len(),
            mean: finite.iter().mean(),
            std,
            min,
            max,
        }
    }
}

/// One summary per output component (`name[k]` for vector parameters),
/// followed by `volume_fraction_<i>` rows for multi-tissue fits.
pub fn summarize_parameters(fitted: &FittedModel) -> Result<Vec<ParameterSummary>, AppError> {
    let mut out = Vec::new();
    for (name, &n) in fitted.parameter_names().iter().zip(fitted.parameter_cardinalities()) {
        let values = fitted.fitted_parameter(name)?;
        for k in 0..n {
            let column: Vec<f64> = values
                .iter()
                .zip(fitted.success())
                .filter(|(_, ok)| **ok)
                .map(|(v, _)| v[k])
                .collect();
            let label = if n == 1 { name.clone() } else { format!("{name}[{k}]") };
            out.push(ParameterSummary::from_values(label, &column));
        }
    }
    if fitted.model().s0_responses().is_some() {
        let fractions = fitted.volume_fractions()?;
        let n = fractions.first().map_or(0, Vec::len);
        for i in 0..n {
            let column: Vec<f64> = fractions
                .iter()
                .zip(fitted.success())
                .filter(|(_, ok)| **ok)
                .map(|(f, _)| f[i])
                .collect();
            out.push(ParameterSummary::from_values(format!("volume_fraction_{i}"), &column));
        }
    }
    Ok(out)
}

/// Agreement between estimates and ground truth.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub name: String,
    pub n: usize,
    pub pearson_r: Option<f64>,
    pub rmse: f64,
    /// Mean of `estimate - truth`.
    pub bias: f64,
}

pub fn recovery(name: impl Into<String>, estimated: &[f64], truth: &[f64]) -> Recovery {
    let diffs: Vec<f64> = estimated
        .iter()
        .zip(truth)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| a - b)
        .collect();
    let n = diffs.len();
    let (rmse, bias) = if n > 0 {
        let m = n as f64;
        (
            (diffs.iter().map(|d| d * d).sum::<f64>() / m).sqrt(),
            diffs.iter().sum::<f64>() / m,
        )
    } else {
        (f64::NAN, f64::NAN)
    };
    Recovery {
        name: name.into(),
        n,
        pearson_r: pearson_r(estimated, truth),
        rmse,
        bias,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pearson_of_linear_relation() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson_r(&x, &y).unwrap() - 1.0).abs() < 1e-12);
        let z = [8.0, 6.0, 4.0, 2.0];
        assert!((pearson_r(&x, &z).unwrap() + 1.0).abs() < 1e-12);
        assert!(pearson_r(&x, &[1.0; 4]).is_none());
    }

    #[test]
    fn non_finite_pairs_are_skipped() {
        let x = [1.0, f64::NAN, 2.0, 3.0];
        let y = [1.0, 5.0, 2.0, 3.0];
        assert!((pearson_r(&x, &y).unwrap() - 1.0).abs() < 1e-12);
        let s = ParameterSummary::from_values("a", &x);
        assert_eq!(s.n, 3);
        assert!((s.mean - 2.0).abs() < 1e-12);
        assert!((s.std - 1.0).abs() < 1e-12);
        assert_eq!((s.min, s.max), (1.0, 3.0));
    }

    #[test]
    fn recovery_reports_bias() {
        let r = recovery("f", &[0.6, 0.7, 0.8], &[0.5, 0.6, 0.7]);
        assert_eq!(r.n, 3);
        assert!((r.bias - 0.1).abs() < 1e-12);
        assert!((r.rmse - 0.1).abs() < 1e-12);
        assert!((r.pearson_r.unwrap() - 1.0).abs() < 1e-12);
    }
}
