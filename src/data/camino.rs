//! Camino Monte-Carlo benchmark datasets.
//!
//! The text files are not bundled. Each dataset is split into three blocks
//! simulated with intra-axonal diffusivities of 1.7, 2.0 and 2.3 µm²/ms; the
//! signals are attenuations (S0 = 1) for the WU-Minn HCP gradient table.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::domain::SignalMatrix;
use crate::error::AppError;
use crate::io::matrix::{read_matrix, rectangular};

/// `(file suffix, diffusivity in m²/s)` per block.
pub const CAMINO_BLOCKS: [(&str, f64); 3] = [("D1_7", STATIC_DIFFUSIVITY), ("D2_0", 2.0e-9), ("D2_3", 2.3e-9)];

const DOWNLOAD_HINT: &str = "Download the Camino text datasets (data_camino_*.txt, fractions_camino_*.txt, \
     parameters_camino_dispersed_*.txt) from the dmipy repository (dmipy/data/camino) into this directory.";

/// Static intra-axonal diffusivity of the first block.
pub const STATIC_DIFFUSIVITY: f64 = 1.7e-9;

/// Loaded Camino dataset, blocks concatenated in `CAMINO_BLOCKS` order.
#[derive(Debug, Clone)]
pub struct CaminoData {
    pub signal: SignalMatrix,
    /// Intra-axonal volume fraction per voxel.
    pub fractions: Vec<f64>,
    /// Intra-axonal diffusivity the voxel was simulated with.
    pub diffusivities: Vec<f64>,
}

fn required(dir: &Path, name: String) -> Result<PathBuf, AppError> {
    let path = dir.join(name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(AppError::input(format!("Missing Camino file '{}'. {DOWNLOAD_HINT}", path.display())))
    }
}

fn read_block(path: &Path) -> Result<Vec<Vec<f64>>, AppError> {
    rectangular(read_matrix(path)?, &path.display().to_string())
}

fn column(rows: &[Vec<f64>], k: usize, label: &str) -> Result<Vec<f64>, AppError> {
    rows.iter()
        .map(|r| {
            r.get(k)
                .copied()
                .ok_or_else(|| AppError::input(format!("{label} has no column {k}.")))
        })
        .collect()
}

fn check_block(signal: &[Vec<f64>], n: usize, label: &str) -> Result<(), AppError> {
    if signal.len() != n {
        return Err(AppError::input(format!(
            "{label}: {} signal rows but {n} ground-truth entries.",
            signal.len()
        )));
    }
    Ok(())
}

pub fn load_parallel(dir: &Path) -> Result<CaminoData, AppError> {
    let mut rows = Vec::new();
    let mut fractions = Vec::new();
    let mut diffusivities = Vec::new();
    for (suffix, diffusivity) in CAMINO_BLOCKS {
        let fraction_path = required(dir, format!("fractions_camino_{suffix}.txt"))?;
        let data_path = required(dir, format!("data_camino_{suffix}.txt"))?;
        // Stored as a row or a column vector.
        let f: Vec<f64> = read_matrix(&fraction_path)?.into_iter().flatten().collect();
        let data = read_block(&data_path)?;
        check_block(&data, f.len(), &data_path.display().to_string())?;

        diffusivities.extend(std::iter::repeat_n(diffusivity, f.len()));
        fractions.extend(f);
        rows.extend(data);
    }
    let signal = SignalMatrix::from_rows(rows)?;
    info!(voxels = signal.n_voxels(), "loaded Camino parallel data");
    Ok(CaminoData {
        signal,
        fractions,
        diffusivities,
    })
}

/// Parameter files hold `fraction kappa beta` per row; only the fraction is
/// used as ground truth.
pub fn load_dispersed(dir: &Path) -> Result<CaminoData, AppError> {
    let mut rows = Vec::new();
    let (mut fractions, mut diffusivities) = (Vec::new(), Vec::new());
    for (suffix, diffusivity) in CAMINO_BLOCKS {
        let parameter_path = required(dir, format!("parameters_camino_dispersed_{suffix}.txt"))?;
        let data_path = required(dir, format!("data_camino_dispersed_{suffix}.txt"))?;
        let label = parameter_path.display().to_string();
        let table = read_block(&parameter_path)?;
        if table[0].len() < 3 {
            return Err(AppError::input(format!("{label} needs columns fraction, kappa, beta.")));
        }
        let data = read_block(&data_path)?;
        check_block(&data, table.len(), &data_path.display().to_string())?;

        diffusivities.extend(std::iter::repeat_n(diffusivity, table.len()));
        fractions.extend(column(&table, 0, &label)?);
        rows.extend(data);
    }
    let signal = SignalMatrix::from_rows(rows)?;
    info!(voxels = signal.n_voxels(), "loaded Camino dispersed data");
    Ok(CaminoData {
        signal,
        fractions,
        diffusivities,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_parallel(dir: &Path) {
        for (suffix, _) in CAMINO_BLOCKS {
            fs::write(dir.join(format!("fractions_camino_{suffix}.txt")), "0.5\n0.6\n").unwrap();
            fs::write(dir.join(format!("data_camino_{suffix}.txt")), "1 0.5 0.2\n1 0.4 0.1\n").unwrap();
        }
    }

    #[test]
    fn parallel_blocks_are_concatenated() {
        let dir = tempfile::tempdir().unwrap();
        write_parallel(dir.path());
        let data = load_parallel(dir.path()).unwrap();
        assert_eq!(data.signal.n_voxels(), 6);
        assert_eq!(data.fractions, vec![0.5, 0.6, 0.5, 0.6, 0.5, 0.6]);
        assert_eq!(data.diffusivities[0], 1.7e-9);
        assert_eq!(data.diffusivities[5], 2.3e-9);
    }

    #[test]
    fn missing_files_point_to_the_download() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_parallel(dir.path()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.message().contains("Download"));
    }

    #[test]
    fn dispersed_parameters_are_split_by_column() {
        let dir = tempfile::tempdir().unwrap();
        for (suffix, _) in CAMINO_BLOCKS {
            fs::write(
                dir.path().join(format!("parameters_camino_dispersed_{suffix}.txt")),
                "0.5 4.0 1.0\n",
            )
            .unwrap();
            fs::write(dir.path().join(format!("data_camino_dispersed_{suffix}.txt")), "1 0.3\n").unwrap();
        }
        let data = load_dispersed(dir.path()).unwrap();
        assert_eq!(data.fractions, vec![0.5; 3]);
        assert_eq!(data.diffusivities, vec![1.7e-9, 2.0e-9, 2.3e-9]);
    }
}
