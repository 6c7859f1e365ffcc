//! ASCII scatter plots for terminal output.
//!
//! Fixed-size character grid with deterministic output (golden-testable).
//! Both axes share one range so the identity line is the diagonal.
//!
//! Plot elements:
//! - samples: `o`
//! - identity line `y = x`: `.`

use crate::report::stats::pearson_r;

/// Scatter `estimate` (vertical) against `truth` (horizontal).
pub fn render_scatter(truth: &[f64], estimate: &[f64], width: usize, height: usize, label: &str) -> String {
    let width = width.max(10);
    let height = height.max(5);
    let points: Vec<(f64, f64)> = truth
        .iter()
        .zip(estimate)
        .filter(|(t, e)| t.is_finite() && e.is_finite())
        .map(|(&t, &e)| (t, e))
        .collect();

    let (lo, hi) = value_range(&points).unwrap_or((0.0, 1.0));
    let (lo, hi) = pad_range(lo, hi, 0.05);

    let mut grid = vec![vec![' '; width]; height];
    let (x0, y0) = (map_x(lo, lo, hi, width), map_y(lo, lo, hi, height));
    let (x1, y1) = (map_x(hi, lo, hi, width), map_y(hi, lo, hi, height));
    draw_line(&mut grid, x0, y0, x1, y1, '.');

    for &(t, e) in &points {
        grid[map_y(e, lo, hi, height)][map_x(t, lo, hi, width)] = 'o';
    }

    let r = pearson_r(truth, estimate)
        .map(|r| format!("{r:.3}"))
        .unwrap_or_else(|| "n/a".to_string());
    let mut out = format!(
        "Scatter: {label} (estimate vs truth) | range=[{lo:.3}, {hi:.3}] | n={} | r={r}\n",
        points.len()
    );
    for row in grid {
        out.push_str(&row.into_iter().collect::<String>());
        out.push('\n');
    }
    out
}

fn value_range(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &(a, b) in points {
        min = min.min(a).min(b);
        max = max.max(a).max(b);
    }
    if min.is_finite() && max.is_finite() && max > min {
        Some((min, max))
    } else if min.is_finite() {
        Some((min - 0.5, min + 0.5))
    } else {
        None
    }
}

fn pad_range(min: f64, max: f64, frac: f64) -> (f64, f64) {
    let span = (max - min).abs();
    let pad = (span * frac).max(1e-12);
    (min - pad, max + pad)
}

fn map_x(v: f64, lo: f64, hi: f64, width: usize) -> usize {
    let u = ((v - lo) / (hi - lo)).clamp(0.0, 1.0);
    (u * (width as f64 - 1.0)).round() as usize
}

fn map_y(v: f64, lo: f64, hi: f64, height: usize) -> usize {
    let u = ((v - lo) / (hi - lo)).clamp(0.0, 1.0);
    // Row 0 is the top.
    (height as f64 - 1.0 - (u * (height as f64 - 1.0))).round() as usize
}

/// Integer line drawing (Bresenham). Only blank cells are written.
fn draw_line(grid: &mut [Vec<char>], x0: usize, y0: usize, x1: usize, y1: usize, ch: char) {
    let (mut x, mut y) = (x0 as isize, y0 as isize);
    let (x1, y1) = (x1 as isize, y1 as isize);
    let dx = (x1 - x).abs();
    let sx = if x < x1 { 1 } else { -1 };
    let dy = -(y1 - y).abs();
    let sy = if y < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        if let Some(cell) = grid.get_mut(y as usize).and_then(|row| row.get_mut(x as usize)) {
            if *cell == ' ' {
                *cell = ch;
            }
        }
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scatter_golden_snapshot_small() {
        let truth = [0.0, 1.0, 1.0];
        let estimate = [0.0, 1.0, 0.0];
        let txt = render_scatter(&truth, &estimate, 10, 5, "f_intra");
        let expected = concat!(
            "Scatter: f_intra (estimate vs truth) | range=[-0.050, 1.050] | n=3 | r=0.500\n",
            "        .o\n",
            "      ..  \n",
            "    ..    \n",
            "  ..      \n",
            "o.       o\n",
        );
        assert_eq!(txt, expected);
    }

    #[test]
    fn empty_input_still_renders() {
        let txt = render_scatter(&[], &[], 10, 5, "x");
        assert!(txt.contains("n=0 | r=n/a"));
        assert_eq!(txt.lines().count(), 6);
    }
}
