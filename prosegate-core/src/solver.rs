//! Simplex-constrained least squares.
//!
//! Solves
//!
//! ```text
//! minimize   (1/n) * Σ (w · x_i − y_i)²
//! subject to Σ w_j = 1,  0 ≤ w_j ≤ 1
//! ```
//!
//! The problem is a convex quadratic program, so its optimum lies in the
//! relative interior of exactly one face of the probability simplex. The
//! solver enumerates every face (every non-empty support set), solves the
//! equality-constrained KKT system on that face by Gaussian elimination with
//! partial pivoting, discards faces whose solution leaves the simplex, and
//! keeps the feasible solution with the lowest objective.
//!
//! `tolerance` is used for three things: a pivot smaller than it marks the
//! face's KKT system singular, a weight above `-tolerance` counts as
//! non-negative, and a later face must improve the objective by more than it
//! to replace an earlier one. Faces are visited in increasing bitmask order,
//! so identical input always yields bit-identical output.

use crate::error::LearningError;

/// Optimal weights on the simplex.
#[derive(Debug, Clone, PartialEq)]
pub struct SimplexSolution<const N: usize> {
    pub weights: [f64; N],
    /// Mean squared error at `weights`.
    pub objective: f64,
    /// Indices with non-zero weight on the winning face.
    pub support: Vec<usize>,
    pub faces_examined: usize,
}

/// Fit simplex weights mapping `rows` onto `targets`.
pub fn solve<const N: usize>(
    rows: &[[f64; N]],
    targets: &[f64],
    tolerance: f64,
) -> Result<SimplexSolution<N>, LearningError> {
    if N == 0 || N > 16 {
        return Err(not_converged(format!("unsupported dimension {N}")));
    }
    if rows.is_empty() {
        return Err(not_converged("no samples"));
    }
    if rows.len() != targets.len() {
        return Err(not_converged(format!(
            "{} rows but {} targets",
            rows.len(),
            targets.len()
        )));
    }
    if rows.iter().flatten().chain(targets).any(|v| !v.is_finite()) {
        return Err(not_converged("input contains non-finite values"));
    }

    let (gram, cross, target_sq) = moments(rows, targets);
    let objective = |w: &[f64; N]| -> f64 {
        let mut quad = 0.0;
        for i in 0..N {
            for j in 0..N {
                quad += w[i] * gram[i][j] * w[j];
            }
        }
        let lin: f64 = (0..N).map(|i| cross[i] * w[i]).sum();
        (quad - 2.0 * lin + target_sq).max(0.0)
    };

    let mut best: Option<SimplexSolution<N>> = None;
    let mut faces_examined = 0;

    for mask in 1u32..(1u32 << N) {
        faces_examined += 1;
        let support: Vec<usize> = (0..N).filter(|i| mask & (1 << i) != 0).collect();
        let Some(face_weights) = solve_face(&gram, &cross, &support, tolerance) else {
            continue;
        };
        if face_weights.iter().any(|w| *w < -tolerance) {
            continue;
        }

        let mut weights = [0.0; N];
        for (slot, value) in support.iter().zip(&face_weights) {
            weights[*slot] = value.max(0.0);
        }
        let total: f64 = weights.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            continue;
        }
        for w in weights.iter_mut() {
            *w /= total;
        }

        let value = objective(&weights);
        if !value.is_finite() {
            continue;
        }
        let better = match &best {
            Some(current) => value < current.objective - tolerance,
            None => true,
        };
        if better {
            best = Some(SimplexSolution {
                weights,
                objective: value,
                support: (0..N).filter(|i| weights[*i] > 0.0).collect(),
                faces_examined: 0,
            });
        }
    }

    let mut solution = best.ok_or_else(|| not_converged("no feasible face of the simplex"))?;
    solution.faces_examined = faces_examined;
    Ok(solution)
}

/// Second moments: `G = XᵀX / n`, `b = Xᵀy / n`, `c = yᵀy / n`.
fn moments<const N: usize>(rows: &[[f64; N]], targets: &[f64]) -> ([[f64; N]; N], [f64; N], f64) {
    let n = rows.len() as f64;
    let mut gram = [[0.0; N]; N];
    let mut cross = [0.0; N];
    let mut target_sq = 0.0;
    for (x, y) in rows.iter().zip(targets) {
        for i in 0..N {
            cross[i] += x[i] * y;
            for j in 0..N {
                gram[i][j] += x[i] * x[j];
            }
        }
        target_sq += y * y;
    }
    for i in 0..N {
        cross[i] /= n;
        for j in 0..N {
            gram[i][j] /= n;
        }
    }
    (gram, cross, target_sq / n)
}

/// Solve `[2G_SS 1; 1ᵀ 0] [w; λ] = [2b_S; 1]` for the weights on one face.
fn solve_face<const N: usize>(
    gram: &[[f64; N]; N],
    cross: &[f64; N],
    support: &[usize],
    tolerance: f64,
) -> Option<Vec<f64>> {
    let k = support.len();
    let size = k + 1;
    let mut a = vec![vec![0.0; size]; size];
    let mut rhs = vec![0.0; size];
    for (r, &i) in support.iter().enumerate() {
        for (c, &j) in support.iter().enumerate() {
            a[r][c] = 2.0 * gram[i][j];
        }
        a[r][k] = 1.0;
        a[k][r] = 1.0;
        rhs[r] = 2.0 * cross[i];
    }
    rhs[k] = 1.0;

    let solution = gaussian_elimination(a, rhs, tolerance)?;
    Some(solution[..k].to_vec())
}

fn gaussian_elimination(mut a: Vec<Vec<f64>>, mut b: Vec<f64>, tolerance: f64) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&x, &y| a[x][col].abs().total_cmp(&a[y][col].abs()))?;
        if a[pivot][col].abs() < tolerance {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

fn not_converged(reason: impl Into<String>) -> LearningError {
    LearningError::NotConverged {
        reason: reason.into(),
    }
}
