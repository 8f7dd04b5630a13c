//! Two-component principal component analysis for embedding sets.
//!
//! Used for per-person spread (threshold calibration) and for the 2-D
//! gallery projection shown by review UIs. Components are the two leading
//! right-singular vectors of the centered data matrix.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Singular values below this carry no variance.
const ZERO_SINGULAR_EPS: f64 = 1e-9;

#[derive(Error, Debug, PartialEq)]
pub enum PcaError {
    #[error("no samples to fit")]
    Empty,
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// A fitted two-component PCA model.
#[derive(Debug, Clone)]
pub struct Pca2 {
    mean: DVector<f64>,
    components: [DVector<f64>; 2],
}

impl Pca2 {
    /// Fit the model to `samples` (one row per sample).
    pub fn fit<S: AsRef<[f32]>>(samples: &[S]) -> Result<Self, PcaError> {
        let data = to_matrix(samples)?;
        let dim = data.ncols();
        let mean = data.row_mean().transpose();
        let centered = DMatrix::from_fn(data.nrows(), dim, |r, c| data[(r, c)] - mean[c]);

        // Singular values come back in descending order.
        let svd = centered.svd(false, true);
        let mut components = [DVector::zeros(dim), DVector::zeros(dim)];
        if let Some(v_t) = svd.v_t {
            for (i, component) in components.iter_mut().enumerate() {
                if i < v_t.nrows() && svd.singular_values[i] > ZERO_SINGULAR_EPS {
                    *component = canonical_sign(v_t.row(i).transpose());
                }
            }
        }

        Ok(Self { mean, components })
    }

    /// Fit and project the training samples in one step.
    pub fn fit_transform<S: AsRef<[f32]>>(samples: &[S]) -> Result<(Self, Vec<[f64; 2]>), PcaError> {
        let model = Self::fit(samples)?;
        let points = samples
            .iter()
            .map(|s| model.transform(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((model, points))
    }

    /// Project one vector onto the two fitted components.
    pub fn transform(&self, sample: &[f32]) -> Result<[f64; 2], PcaError> {
        if sample.len() != self.mean.len() {
            return Err(PcaError::DimensionMismatch {
                expected: self.mean.len(),
                actual: sample.len(),
            });
        }
        let centered = DVector::from_iterator(sample.len(), sample.iter().map(|&v| v as f64)) - &self.mean;
        Ok([
            centered.dot(&self.components[0]),
            centered.dot(&self.components[1]),
        ])
    }

    /// The two unit components; a component with no variance is zero.
    pub fn components(&self) -> [&DVector<f64>; 2] {
        [&self.components[0], &self.components[1]]
    }
}

/// Population standard deviation of each coordinate of a 2-D point set.
pub fn spread(points: &[[f64; 2]]) -> (f64, f64) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let n = points.len() as f64;
    let mx = points.iter().map(|p| p[0]).sum::<f64>() / n;
    let my = points.iter().map(|p| p[1]).sum::<f64>() / n;
    let vx = points.iter().map(|p| (p[0] - mx).powi(2)).sum::<f64>() / n;
    let vy = points.iter().map(|p| (p[1] - my).powi(2)).sum::<f64>() / n;
    (vx.sqrt(), vy.sqrt())
}

/// Area `π·σ₁·σ₂` of the 1-σ ellipse of a sample set reduced to 2-D.
pub fn ellipse_area<S: AsRef<[f32]>>(samples: &[S]) -> Result<f64, PcaError> {
    let (_, points) = Pca2::fit_transform(samples)?;
    let (s1, s2) = spread(&points);
    Ok(std::f64::consts::PI * s1 * s2)
}

fn to_matrix<S: AsRef<[f32]>>(samples: &[S]) -> Result<DMatrix<f64>, PcaError> {
    let first = samples.first().ok_or(PcaError::Empty)?;
    let dim = first.as_ref().len();
    if let Some(bad) = samples.iter().find(|s| s.as_ref().len() != dim) {
        return Err(PcaError::DimensionMismatch { expected: dim, actual: bad.as_ref().len() });
    }
    Ok(DMatrix::from_fn(samples.len(), dim, |r, c| samples[r].as_ref()[c] as f64))
}

/// Flip `v` so its largest-magnitude coordinate is positive. Singular
/// vectors are only defined up to sign.
fn canonical_sign(mut v: DVector<f64>) -> DVector<f64> {
    let pivot = v
        .iter()
        .copied()
        .max_by(|a, b| a.abs().partial_cmp(&b.abs()).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or(0.0);
    if pivot < 0.0 {
        v.neg_mut();
    }
    v
}
