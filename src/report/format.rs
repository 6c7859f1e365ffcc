//! Formatted terminal output.
//!
//! Formatting lives in one place so the fitting code stays free of
//! presentation details and output changes stay localized.

use crate::acquisition::AcquisitionScheme;
use crate::fit::FittedModel;
use crate::report::stats::{ParameterSummary, Recovery};

/// Header of a fit run: model, solver, data size and failures.
pub fn format_run_summary(fitted: &FittedModel, scheme: &AcquisitionScheme, elapsed_secs: f64) -> String {
    let model = fitted.model();
    let mut out = String::new();

    out.push_str("=== dmi - microstructure model fit ===\n");
    let names: Vec<&str> = model.compartments().iter().map(|c| c.model_name()).collect();
    out.push_str(&format!("Model: {} ({:?})\n", names.join(" + "), model.representation()));
    out.push_str(&format!("Solver: {}\n", fitted.solver().display_name()));
    out.push_str(&format!(
        "Scheme: {} measurements, {} shells\n",
        scheme.n_measurements(),
        scheme.shells().len()
    ));

    let links = model.links();
    if !links.is_empty() {
        out.push_str("Links:\n");
        for (name, link) in links {
            out.push_str(&format!("- {name}: {link:?}\n"));
        }
    }

    let failed = fitted.success().iter().filter(|ok| !**ok).count();
    out.push_str(&format!(
        "Voxels: n={} | failed={} | {:.2}s ({:.2} ms/voxel)\n",
        fitted.n_voxels(),
        failed,
        elapsed_secs,
        1e3 * elapsed_secs / fitted.n_voxels().max(1) as f64
    ));
    if let Some(lmax) = fitted.sh_order() {
        out.push_str(&format!("SH order: {lmax}\n"));
    }
    out.push('\n');
    out
}

pub fn format_parameter_table(rows: &[ParameterSummary]) -> String {
    let mut out = String::new();
    out.push_str(
        format!(
            "{:<44} {:>6} {:>12} {:>12} {:>12} {:>12}",
            "parameter", "n", "mean", "std", "min", "max"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(&format!("{:-<44} {:-<6} {:-<12} {:-<12} {:-<12} {:-<12}", "", "", "", "", "", ""));
    out.push('\n');

    for r in rows {
        out.push_str(
            format!(
                "{:<44} {:>6} {:>12} {:>12} {:>12} {:>12}",
                truncate(&r.name, 44),
                r.n,
                fmt_value(r.mean),
                fmt_value(r.std),
                fmt_value(r.min),
                fmt_value(r.max),
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

pub fn format_recovery_table(rows: &[Recovery]) -> String {
    let mut out = String::new();
    out.push_str(format!("{:<44} {:>6} {:>9} {:>12} {:>12}", "parameter", "n", "pearson", "rmse", "bias").trim_end());
    out.push('\n');
    out.push_str(&format!("{:-<44} {:-<6} {:-<9} {:-<12} {:-<12}", "", "", "", "", ""));
    out.push('\n');
    for r in rows {
        let pearson = r.pearson_r.map(|v| format!("{v:.4}")).unwrap_or_else(|| "n/a".to_string());
        out.push_str(
            format!(
                "{:<44} {:>6} {:>9} {:>12} {:>12}",
                truncate(&r.name, 44),
                r.n,
                pearson,
                fmt_value(r.rmse),
                fmt_value(r.bias),
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

/// Fixed-point for O(1) values, scientific for diffusivities and diameters.
fn fmt_value(v: f64) -> String {
    if !v.is_finite() {
        "nan".to_string()
    } else if v == 0.0 || (1e-3..1e4).contains(&v.abs()) {
        format!("{v:.4}")
    } else {
        format!("{v:.4e}")
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_switch_to_scientific() {
        assert_eq!(fmt_value(0.5), "0.5000");
        assert_eq!(fmt_value(1.7e-9), "1.7000e-9");
        assert_eq!(fmt_value(f64::NAN), "nan");
    }

    #[test]
    fn long_names_are_truncated() {
        assert_eq!(truncate("abcdef", 4), "abc.");
        assert_eq!(truncate("abc", 4), "abc");
    }

    #[test]
    fn parameter_table_rows() {
        let rows = vec![ParameterSummary::from_values("partial_volume_0", &[0.25, 0.75])];
        let table = format_parameter_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("partial_volume_0"));
        assert!(lines[2].contains("0.5000"));
    }
}
