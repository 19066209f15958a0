//! Weighted least-squares AM/AM and AM/PM polynomial fit with
//! learning-rate blending.

use crate::error::ModelError;
use nalgebra::{DMatrix, DVector};
use rustfft::num_complex::Complex64;

/// Fixed polynomial degree.
pub const K: usize = 5;
/// AM/PM small-value suppression threshold: below this TX amplitude, phase
/// is unobservable and forced to zero before fitting.
pub const MPM_TX_MIN: f64 = 0.1;

/// Tagged union of the two predistorter representations.
#[derive(Debug, Clone, PartialEq)]
pub enum DpdData {
    Poly {
        coefs_am: [f64; K],
        coefs_pm: [f64; K],
    },
    Lut {
        scale: f64,
        table: [(f64, f64); 32],
    },
}

/// Two real polynomials in `|tx|` approximating AM/AM and AM/PM distortion.
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialModel {
    coefs_am: [f64; K],
    coefs_pm: [f64; K],
}

impl Default for PolynomialModel {
    fn default() -> Self {
        Self::new()
    }
}

impl PolynomialModel {
    pub fn new() -> Self {
        let mut model = PolynomialModel {
            coefs_am: [0.0; K],
            coefs_pm: [0.0; K],
        };
        model.reset_coefs();
        model
    }

    /// Restore identity: AM = [1, 0, 0, 0, 0], PM = [0, 0, 0, 0, 0].
    pub fn reset_coefs(&mut self) {
        self.coefs_am = [0.0; K];
        self.coefs_am[0] = 1.0;
        self.coefs_pm = [0.0; K];
    }

    pub fn get_dpd_data(&self) -> DpdData {
        DpdData::Poly {
            coefs_am: self.coefs_am,
            coefs_pm: self.coefs_pm,
        }
    }

    pub fn set_dpd_data(&mut self, data: &DpdData) -> Result<(), ModelError> {
        match data {
            DpdData::Poly { coefs_am, coefs_pm } => {
                self.coefs_am = *coefs_am;
                self.coefs_pm = *coefs_pm;
                Ok(())
            }
            DpdData::Lut { .. } => Err(ModelError::WrongTag),
        }
    }

    /// Apply the predistortion function to a complex sample.
    pub fn predistort(&self, x: Complex64) -> Complex64 {
        let amp = x.norm();
        let am_gain: f64 = self
            .coefs_am
            .iter()
            .enumerate()
            .map(|(k, c)| c * amp.powi(k as i32))
            .sum();
        let phase_correction: f64 = self
            .coefs_pm
            .iter()
            .enumerate()
            .map(|(k, c)| c * amp.powi(k as i32))
            .sum();
        Complex64::from_polar(amp * am_gain, x.arg() + phase_correction)
    }

    /// Fit new coefficients from extracted bin means and blend them with
    /// the current ones by `lr`.
    pub fn train(
        &mut self,
        tx_mean: &[f64],
        rx_mean: &[f64],
        phase_mean: &[f64],
        lr: f64,
    ) -> Result<(), ModelError> {
        if tx_mean.len() != rx_mean.len() || tx_mean.len() != phase_mean.len() {
            return Err(ModelError::LengthMismatch);
        }
        let l = tx_mean.len();
        if l < K {
            return Err(ModelError::NotEnoughData { got: l, k: K });
        }

        let c_new_am = fit_polynomial(rx_mean, tx_mean, |base, k| base.powi((k + 1) as i32))?;

        let mut suppressed_phase = phase_mean.to_vec();
        for (phi, &tx) in suppressed_phase.iter_mut().zip(tx_mean.iter()) {
            if tx < MPM_TX_MIN {
                *phi = 0.0;
            }
        }
        let p_new = fit_polynomial(tx_mean, &suppressed_phase, |base, k| base.powi(k as i32))?;

        for k in 0..K {
            self.coefs_am[k] += lr * (c_new_am[k] - self.coefs_am[k]);
            self.coefs_pm[k] += lr * (p_new[k] - self.coefs_pm[k]);
        }
        Ok(())
    }
}

/// Solve `A * c = target` in the least-squares sense, with `A[i][k] =
/// basis(input[i], k)` for `k in 0..K`, falling back to the minimum-norm
/// solution if the system is rank-deficient.
fn fit_polynomial(
    input: &[f64],
    target: &[f64],
    basis: impl Fn(f64, usize) -> f64,
) -> Result<[f64; K], ModelError> {
    let l = input.len();
    let a = DMatrix::from_fn(l, K, |i, k| basis(input[i], k));
    let b = DVector::from_row_slice(target);

    let svd = a.clone().svd(true, true);
    let solution = svd
        .solve(&b, 1e-12)
        .map_err(|_| ModelError::NotEnoughData { got: l, k: K })?;

    let mut coefs = [0.0; K];
    for (k, c) in coefs.iter_mut().enumerate() {
        *c = solution[k];
    }
    Ok(coefs)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn identity_model_leaves_samples_unchanged() {
        let model = PolynomialModel::new();
        let x = Complex64::from_polar(0.7, 1.1);
        let y = model.predistort(x);
        assert_abs_diff_eq!(y.re, x.re, epsilon = 1e-9);
        assert_abs_diff_eq!(y.im, x.im, epsilon = 1e-9);
    }

    #[test]
    fn nonzero_am_and_pm_coefficients_scale_amplitude_and_rotate_phase() {
        let mut model = PolynomialModel::new();
        model.coefs_am = [0.5, 0.0, 0.0, 0.0, 0.0];
        model.coefs_pm = [0.2, 0.0, 0.0, 0.0, 0.0];
        let x = Complex64::from_polar(1.0, 0.0);
        let y = model.predistort(x);
        assert_abs_diff_eq!(y.norm(), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(y.arg(), 0.2, epsilon = 1e-9);
    }

    #[test]
    fn reset_coefs_yields_identity() {
        let mut model = PolynomialModel::new();
        model.coefs_am = [2.0, 1.0, 1.0, 1.0, 1.0];
        model.reset_coefs();
        match model.get_dpd_data() {
            DpdData::Poly { coefs_am, coefs_pm } => {
                assert_eq!(coefs_am, [1.0, 0.0, 0.0, 0.0, 0.0]);
                assert_eq!(coefs_pm, [0.0, 0.0, 0.0, 0.0, 0.0]);
            }
            _ => panic!("expected poly data"),
        }
    }

    #[test]
    fn training_on_a_linear_amplifier_converges_to_identity_in_one_step() {
        let mut model = PolynomialModel::new();
        // Start from a displaced point so convergence is non-trivial.
        model.coefs_am = [0.5, 0.1, 0.0, 0.0, 0.0];

        let tx_mean: Vec<f64> = (1..=20).map(|i| i as f64 * 0.05).collect();
        let rx_mean = tx_mean.clone();
        let phase_mean = vec![0.0; tx_mean.len()];

        model.train(&tx_mean, &rx_mean, &phase_mean, 1.0).unwrap();

        match model.get_dpd_data() {
            DpdData::Poly { coefs_am, coefs_pm } => {
                assert_abs_diff_eq!(coefs_am[0], 1.0, epsilon = 1e-6);
                for c in &coefs_am[1..] {
                    assert_abs_diff_eq!(*c, 0.0, epsilon = 1e-6);
                }
                for c in coefs_pm {
                    assert_abs_diff_eq!(c, 0.0, epsilon = 1e-6);
                }
            }
            _ => panic!("expected poly data"),
        }
    }

    #[test]
    fn small_amplitude_phase_is_suppressed_before_fitting() {
        let mut model = PolynomialModel::new();
        let tx_mean = vec![0.01, 0.02, 0.03, 0.5, 0.6, 0.7];
        let rx_mean = tx_mean.clone();
        // Large bogus phase at small amplitude should be ignored.
        let phase_mean = vec![3.0, -3.0, 2.5, 0.0, 0.0, 0.0];
        model.train(&tx_mean, &rx_mean, &phase_mean, 1.0).unwrap();
        match model.get_dpd_data() {
            DpdData::Poly { coefs_pm, .. } => {
                assert!(coefs_pm[0].abs() < 0.5);
            }
            _ => panic!("expected poly data"),
        }
    }

    #[test]
    fn blend_uses_learning_rate() {
        let mut model = PolynomialModel::new();
        let tx_mean: Vec<f64> = (1..=20).map(|i| i as f64 * 0.05).collect();
        let rx_mean: Vec<f64> = tx_mean.iter().map(|t| t * 2.0).collect();
        let phase_mean = vec![0.0; tx_mean.len()];
        model.train(&tx_mean, &rx_mean, &phase_mean, 0.5).unwrap();
        match model.get_dpd_data() {
            DpdData::Poly { coefs_am, .. } => {
                // Halfway between identity (1.0) and the fitted ~0.5 gain.
                assert!(coefs_am[0] < 1.0 && coefs_am[0] > 0.5);
            }
            _ => panic!("expected poly data"),
        }
    }
}
