//! Two-dimensional Gaussian kernel density estimation.
//!
//! A cluster head summarizes member positions as a density surface. The
//! estimator works on CH-relative offsets in single precision; bandwidth
//! is either derived from the sample covariance (Scott or Silverman rule)
//! or supplied explicitly as a 2x2 matrix.

use thiserror::Error;

/// Errors raised while constructing an estimator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KdeError {
    /// Density needs spread; a single point has none.
    #[error("at least two samples are required")]
    NotEnoughSamples,

    /// The bandwidth matrix has no inverse.
    #[error("singular bandwidth matrix")]
    SingularBandwidth,

    /// det(H)^(-1/2) left the real domain.
    #[error("bandwidth determinant out of domain")]
    DomainError,
}

/// Bandwidth selection for [`Kde2d`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bandwidth {
    /// Scott's rule: sample covariance scaled by `n^(-1/(d+4))` squared.
    Scott,
    /// Silverman's rule; coincides with Scott for d = 2 up to the
    /// `(4/(d+2))^(-1/(d+4))` factor.
    Silverman,
    /// Caller-provided 2x2 matrix, row-major `[h00, h01, h10, h11]`.
    Explicit([f32; 4]),
}

/// Unbiased 2-D sample covariance, row-major `[c00, c01, c10, c11]`.
pub fn covariance2d(data: &[[f32; 2]]) -> [f32; 4] {
    let n = data.len() as f32;
    let mut mean = [0.0f32; 2];
    for p in data {
        mean[0] += p[0];
        mean[1] += p[1];
    }
    mean[0] /= n;
    mean[1] /= n;

    let mut cov = [0.0f32; 4];
    for p in data {
        let dx = p[0] - mean[0];
        let dy = p[1] - mean[1];
        cov[0] += dx * dx;
        cov[1] += dx * dy;
        cov[3] += dy * dy;
    }
    cov[2] = cov[1];

    let divisor = n - 1.0;
    [cov[0] / divisor, cov[1] / divisor, cov[2] / divisor, cov[3] / divisor]
}

/// Gaussian KDE over 2-D offset samples.
///
/// `eval` returns the raw kernel sum, not the mean: callers threshold
/// absolute mass, so the 1/N normalization is deliberately omitted.
#[derive(Debug, Clone)]
pub struct Kde2d {
    samples: Vec<[f32; 2]>,
    h_inv: [f32; 4],
    // det(H)^(-1/2) * (2*pi)^(-1), hoisted out of the kernel.
    norm_term: f32,
}

impl Kde2d {
    pub fn new(samples: Vec<[f32; 2]>, bandwidth: Bandwidth) -> Result<Self, KdeError> {
        if samples.len() < 2 {
            return Err(KdeError::NotEnoughSamples);
        }

        let h = match bandwidth {
            Bandwidth::Explicit(h) => h,
            Bandwidth::Scott => {
                let cov = covariance2d(&samples);
                let n_term = (samples.len() as f32).powf(-1.0 / 6.0);
                cov.map(|c| c * n_term * n_term)
            }
            Bandwidth::Silverman => {
                let cov = covariance2d(&samples);
                let n_term = (samples.len() as f32).powf(-1.0 / 6.0);
                let s_term = (4.0f32 / 4.0).powf(-1.0 / 6.0);
                cov.map(|c| c * (s_term * n_term) * (s_term * n_term))
            }
        };

        let det = h[0] * h[3] - h[1] * h[2];
        if det == 0.0 {
            return Err(KdeError::SingularBandwidth);
        }
        let h_inv = [h[3] / det, -h[1] / det, -h[2] / det, h[0] / det];

        let det_term = det.powf(-0.5);
        if det_term.is_nan() {
            return Err(KdeError::DomainError);
        }
        let norm_term = det_term / (2.0 * std::f32::consts::PI);

        Ok(Self { samples, h_inv, norm_term })
    }

    /// Kernel sum at `point`.
    pub fn eval(&self, point: [f32; 2]) -> f32 {
        let mut sum = 0.0f32;
        for s in &self.samples {
            let dx = point[0] - s[0];
            let dy = point[1] - s[1];
            // (d^T H^-1 d) written out for the 2x2 case.
            let mx = dx * self.h_inv[0] + dy * self.h_inv[2];
            let my = dx * self.h_inv[1] + dy * self.h_inv[3];
            let quad = mx * dx + my * dy;
            sum += self.norm_term * (-0.5 * quad).exp();
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spread_samples() -> Vec<[f32; 2]> {
        vec![[0.0, 0.0], [1.0, 0.5], [-1.0, 0.25], [0.5, -1.0]]
    }

    #[test]
    fn rejects_single_sample() {
        let err = Kde2d::new(vec![[0.0, 0.0]], Bandwidth::Scott).unwrap_err();
        assert_eq!(err, KdeError::NotEnoughSamples);
    }

    #[test]
    fn rejects_singular_covariance() {
        // Collinear points along x: zero variance in y.
        let data = vec![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0]];
        let err = Kde2d::new(data, Bandwidth::Scott).unwrap_err();
        assert_eq!(err, KdeError::SingularBandwidth);
    }

    #[test]
    fn rejects_singular_explicit_bandwidth() {
        let err = Kde2d::new(spread_samples(), Bandwidth::Explicit([0.0; 4])).unwrap_err();
        assert_eq!(err, KdeError::SingularBandwidth);
    }

    #[test]
    fn positive_at_samples_vanishing_far_away() {
        let kde = Kde2d::new(spread_samples(), Bandwidth::Explicit([0.1, 0.0, 0.0, 0.1])).unwrap();
        for s in spread_samples() {
            assert!(kde.eval(s) > 0.0);
        }
        assert_eq!(kde.eval([1e6, 1e6]), 0.0);
    }

    #[test]
    fn eval_is_a_raw_sum() {
        // Two coincident-ish tight clusters: mass at a point scales with
        // the number of samples there instead of averaging out.
        let h = Bandwidth::Explicit([0.01, 0.0, 0.0, 0.01]);
        let one = Kde2d::new(vec![[0.0, 0.0], [100.0, 100.0]], h).unwrap();
        let two = Kde2d::new(vec![[0.0, 0.0], [0.0, 0.0], [100.0, 100.0]], h).unwrap();
        assert!(two.eval([0.0, 0.0]) > 1.9 * one.eval([0.0, 0.0]));
    }

    #[test]
    fn covariance_matches_hand_computation() {
        let data = vec![[0.0, 0.0], [2.0, 0.0], [0.0, 2.0], [2.0, 2.0]];
        let cov = covariance2d(&data);
        // var = sum((x - 1)^2) / 3 = 4/3 on each axis, no correlation.
        assert!((cov[0] - 4.0 / 3.0).abs() < 1e-6);
        assert!((cov[3] - 4.0 / 3.0).abs() < 1e-6);
        assert_eq!(cov[1], 0.0);
        assert_eq!(cov[2], cov[1]);
    }

    #[test]
    fn covariance_determinant_non_negative_for_spread_data() {
        let cov = covariance2d(&spread_samples());
        let det = cov[0] * cov[3] - cov[1] * cov[2];
        assert!(det >= 0.0);
    }

    #[test]
    fn scott_and_silverman_agree_in_two_dimensions() {
        // (4/(d+2))^(-1/(d+4)) = 1 when d = 2.
        let scott = Kde2d::new(spread_samples(), Bandwidth::Scott).unwrap();
        let silverman = Kde2d::new(spread_samples(), Bandwidth::Silverman).unwrap();
        let p = [0.3, -0.2];
        assert!((scott.eval(p) - silverman.eval(p)).abs() < 1e-6);
    }
}
