//! Whitespace-delimited numeric text matrices.
//!
//! One row per line; `#` starts a comment; blank lines are skipped. This is
//! the format of FSL `bval`/`bvec` files, of signal dumps and of the Camino
//! text datasets.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::domain::SignalMatrix;
use crate::error::AppError;

/// Parse matrix text. Rows may have different lengths; callers check shape.
pub fn parse_matrix(text: &str, label: &str) -> Result<Vec<Vec<f64>>, AppError> {
    let mut rows = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let row = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse::<f64>().map_err(|e| {
                    AppError::input(format!("{label}, line {}: cannot parse '{t}': {e}", idx + 1))
                })
            })
            .collect::<Result<Vec<f64>, AppError>>()?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn read_matrix(path: &Path) -> Result<Vec<Vec<f64>>, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::input(format!("Failed to open '{}': {e}", path.display())))?;
    let mut text = String::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| AppError::input(format!("Failed to read '{}': {e}", path.display())))?;
        text.push_str(&line);
        text.push('\n');
    }
    parse_matrix(&text, &path.display().to_string())
}

/// Require a rectangular, non-empty matrix.
pub fn rectangular(rows: Vec<Vec<f64>>, label: &str) -> Result<Vec<Vec<f64>>, AppError> {
    let Some(first) = rows.first() else {
        return Err(AppError::data(format!("{label} contains no rows.")));
    };
    let n = first.len();
    if let Some((i, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != n) {
        return Err(AppError::input(format!(
            "{label}: row {} has {} columns, expected {n}.",
            i + 1,
            r.len()
        )));
    }
    Ok(rows)
}

/// Voxel × measurement signal matrix from a text file.
pub fn read_signal_matrix(path: &Path) -> Result<SignalMatrix, AppError> {
    let rows = rectangular(read_matrix(path)?, &path.display().to_string())?;
    SignalMatrix::from_rows(rows)
}

pub fn write_matrix<'a, I>(path: &Path, rows: I, header: Option<&str>) -> Result<(), AppError>
where
    I: IntoIterator<Item = &'a [f64]>,
{
    let file = File::create(path)
        .map_err(|e| AppError::input(format!("Failed to create '{}': {e}", path.display())))?;
    let mut out = BufWriter::new(file);
    let write_err = |e: std::io::Error| AppError::input(format!("Failed to write '{}': {e}", path.display()));

    if let Some(header) = header {
        for line in header.lines() {
            writeln!(out, "# {line}").map_err(write_err)?;
        }
    }
    for row in rows {
        let line: Vec<String> = row.iter().map(|v| format!("{v:.10e}")).collect();
        writeln!(out, "{}", line.join(" ")).map_err(write_err)?;
    }
    out.flush().map_err(write_err)
}

pub fn write_signal_matrix(path: &Path, signal: &SignalMatrix, header: Option<&str>) -> Result<(), AppError> {
    write_matrix(path, signal.rows(), header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = "# header\n1 2 3\n\n4\t5  6 # trailing\n";
        let rows = parse_matrix(text, "test").unwrap();
        assert_eq!(rows, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
    }

    #[test]
    fn bad_token_reports_line() {
        let err = parse_matrix("1 2\n3 x\n", "signal.txt").unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.message().contains("line 2"));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = rectangular(vec![vec![1.0, 2.0], vec![3.0]], "m").unwrap_err();
        assert!(err.message().contains("row 2"));
        assert_eq!(rectangular(Vec::new(), "m").unwrap_err().exit_code(), 3);
    }

    #[test]
    fn signal_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal.txt");
        let signal = SignalMatrix::from_rows(vec![vec![1.0, 0.5, 0.25], vec![2.0, 1.5e-3, 0.0]]).unwrap();
        write_signal_matrix(&path, &signal, Some("voxels x measurements")).unwrap();
        let back = read_signal_matrix(&path).unwrap();
        assert_eq!(back.n_voxels(), 2);
        for (a, b) in back.values().iter().zip(signal.values()) {
            assert!((a - b).abs() <= 1e-9 * b.abs().max(1.0));
        }
    }
}
