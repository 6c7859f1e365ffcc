//! Export fit results to JSON and CSV.
//!
//! JSON keeps the full structure (parameter cardinalities, per-voxel vectors)
//! and can be read back; CSV is one row per voxel with vector parameters split
//! into `name[k]` columns, for spreadsheets and downstream scripts.

use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::SolverKind;
use crate::error::AppError;
use crate::fit::FittedModel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelResult {
    pub index: usize,
    pub success: bool,
    pub s0: Option<f64>,
    /// Flattened output vector; `None` marks non-finite values.
    pub parameters: Vec<Option<f64>>,
    pub mse: Option<f64>,
    pub r2: Option<f64>,
    /// Multi-tissue corrected fractions, present when S0 responses are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_fractions: Option<Vec<Option<f64>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsFile {
    pub tool: String,
    pub generated: DateTime<Utc>,
    pub solver: SolverKind,
    pub parameter_names: Vec<String>,
    pub parameter_cardinalities: Vec<usize>,
    pub voxels: Vec<VoxelResult>,
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

impl ResultsFile {
    /// Collect results. `mse`/`r2` are optional per-voxel quality measures.
    pub fn from_fit(fitted: &FittedModel, mse: Option<&[f64]>, r2: Option<&[f64]>) -> Self {
        let volume_fractions = fitted
            .model()
            .s0_responses()
            .and_then(|_| fitted.volume_fractions().ok());
        let voxels = fitted
            .parameter_vectors()
            .iter()
            .enumerate()
            .map(|(i, p)| VoxelResult {
                index: i,
                success: fitted.success()[i],
                s0: finite(fitted.s0()[i]),
                parameters: p.iter().map(|&v| finite(v)).collect(),
                mse: mse.and_then(|m| m.get(i).copied()).and_then(finite),
                r2: r2.and_then(|r| r.get(i).copied()).and_then(finite),
                volume_fractions: volume_fractions
                    .as_ref()
                    .and_then(|vf| vf.get(i))
                    .map(|f| f.iter().map(|&v| finite(v)).collect()),
            })
            .collect();
        Self {
            tool: "dmi".to_string(),
            generated: Utc::now(),
            solver: fitted.solver(),
            parameter_names: fitted.parameter_names().to_vec(),
            parameter_cardinalities: fitted.parameter_cardinalities().to_vec(),
            voxels,
        }
    }

    /// CSV column names of the flattened parameter vector.
    pub fn column_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, &n) in self.parameter_names.iter().zip(&self.parameter_cardinalities) {
            if n == 1 {
                out.push(name.clone());
            } else {
                out.extend((0..n).map(|k| format!("{name}[{k}]")));
            }
        }
        out
    }

    /// `volume_fraction_<i>` columns, empty unless the fit was multi-tissue.
    pub fn volume_fraction_columns(&self) -> Vec<String> {
        let n = self
            .voxels
            .iter()
            .find_map(|v| v.volume_fractions.as_ref().map(Vec::len))
            .unwrap_or(0);
        (0..n).map(|i| format!("volume_fraction_{i}")).collect()
    }
}

pub fn write_results_json(path: &Path, results: &ResultsFile) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create results JSON '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(file, results)
        .map_err(|e| AppError::new(2, format!("Failed to write results JSON: {e}")))?;
    Ok(())
}

pub fn read_results_json(path: &Path) -> Result<ResultsFile, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::new(2, format!("Failed to open results JSON '{}': {e}", path.display())))?;
    let results: ResultsFile =
        serde_json::from_reader(file).map_err(|e| AppError::new(2, format!("Invalid results JSON: {e}")))?;
    Ok(results)
}

fn cell(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.10e}")).unwrap_or_default()
}

pub fn write_results_csv(path: &Path, results: &ResultsFile) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| AppError::new(2, format!("Failed to create export CSV '{}': {e}", path.display())))?;

    let mut header = vec!["voxel".to_string(), "success".to_string(), "s0".to_string()];
    header.extend(results.column_names());
    let volume_columns = results.volume_fraction_columns();
    header.extend(volume_columns.iter().cloned());
    header.push("mse".to_string());
    header.push("r2".to_string());
    writer
        .write_record(&header)
        .map_err(|e| AppError::new(2, format!("Failed to write export CSV header: {e}")))?;

    for v in &results.voxels {
        let mut row = vec![v.index.to_string(), v.success.to_string(), cell(v.s0)];
        row.extend(v.parameters.iter().map(|&p| cell(p)));
        for k in 0..volume_columns.len() {
            row.push(cell(v.volume_fractions.as_ref().and_then(|f| f.get(k).copied().flatten())));
        }
        row.push(cell(v.mse));
        row.push(cell(v.r2));
        writer
            .write_record(&row)
            .map_err(|e| AppError::new(2, format!("Failed to write export CSV row: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| AppError::new(2, format!("Failed to write export CSV: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultsFile {
        ResultsFile {
            tool: "dmi".to_string(),
            generated: Utc::now(),
            solver: SolverKind::Mix,
            parameter_names: vec!["C1Stick_1_mu".to_string(), "partial_volume_0".to_string()],
            parameter_cardinalities: vec![2, 1],
            voxels: vec![
                VoxelResult {
                    index: 0,
                    success: true,
                    s0: Some(100.0),
                    parameters: vec![Some(0.5), Some(1.0), Some(0.7)],
                    mse: Some(1e-4),
                    r2: Some(0.99),
                    volume_fractions: None,
                },
                VoxelResult {
                    index: 1,
                    success: false,
                    s0: None,
                    parameters: vec![None, None, None],
                    mse: None,
                    r2: None,
                    volume_fractions: None,
                },
            ],
        }
    }

    #[test]
    fn vector_parameters_get_indexed_columns() {
        assert_eq!(
            sample().column_names(),
            vec!["C1Stick_1_mu[0]", "C1Stick_1_mu[1]", "partial_volume_0"]
        );
    }

    #[test]
    fn json_round_trip_keeps_failed_voxels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.json");
        let results = sample();
        write_results_json(&path, &results).unwrap();
        assert_eq!(read_results_json(&path).unwrap(), results);
    }

    #[test]
    fn csv_has_one_row_per_voxel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.csv");
        write_results_csv(&path, &sample()).unwrap();

        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), 3 + 3 + 2);
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][1], "false");
        assert_eq!(&rows[1][3], "");
    }

    #[test]
    fn multi_tissue_results_carry_volume_fraction_columns() {
        let mut results = sample();
        results.voxels[0].volume_fractions = Some(vec![Some(0.6), Some(0.4)]);
        assert_eq!(results.volume_fraction_columns(), vec!["volume_fraction_0", "volume_fraction_1"]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.csv");
        write_results_csv(&path, &results).unwrap();
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[6], "volume_fraction_0");
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows[0][6].parse::<f64>().unwrap(), 0.6);
        assert_eq!(&rows[1][7], "");

        let json = dir.path().join("fit.json");
        write_results_json(&json, &results).unwrap();
        assert_eq!(read_results_json(&json).unwrap(), results);
    }

    #[test]
    fn single_tissue_json_omits_volume_fractions() {
        let text = serde_json::to_string(&sample()).unwrap();
        assert!(!text.contains("volume_fractions"));
    }
}
