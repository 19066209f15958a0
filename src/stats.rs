//! Amplitude-binned accumulation of aligned (TX, RX) pairs into the
//! nonlinear characteristic later fit by [`crate::model`].

use crate::error::ExtractError;
use rustfft::num_complex::Complex64;

/// Default bin count.
pub const DEFAULT_B: usize = 64;
/// Default per-bin sample cap.
pub const DEFAULT_N_PER_BIN: usize = 128;
/// Derives the amplitude-binning peak from `tx_median` on the first call.
pub const MEDIAN_TO_PEAK: f64 = 12.0;

const NORMALISATION_TOLERANCE: f64 = 0.01;

/// Accumulates aligned (TX, RX) sample pairs into `b` equal-width amplitude
/// bins over `[0, a_peak]`, up to `n_per_bin` pairs per bin.
pub struct BinStatistic {
    edges: Vec<f64>,
    tx_values: Vec<Vec<Complex64>>,
    rx_values: Vec<Vec<Complex64>>,
    n_per_bin: usize,
    n_meas: u32,
}

impl BinStatistic {
    pub fn new(b: usize, n_per_bin: usize, a_peak: f64) -> Self {
        let edges: Vec<f64> = (0..=b).map(|i| a_peak * i as f64 / b as f64).collect();
        BinStatistic {
            tx_values: vec![Vec::with_capacity(n_per_bin); b],
            rx_values: vec![Vec::with_capacity(n_per_bin); b],
            edges,
            n_per_bin,
            n_meas: 0,
        }
    }

    pub fn with_defaults(a_peak: f64) -> Self {
        Self::new(DEFAULT_B, DEFAULT_N_PER_BIN, a_peak)
    }

    pub fn n_meas(&self) -> u32 {
        self.n_meas
    }

    fn bin_index(&self, amplitude: f64) -> Option<usize> {
        for i in 0..self.edges.len() - 1 {
            if amplitude > self.edges[i] && amplitude <= self.edges[i + 1] {
                return Some(i);
            }
        }
        None
    }

    /// Bin one aligned (tx, rx) capture. Returns a normalisation error
    /// without mutating state if the medians disagree by more than 1%.
    pub fn extract(&mut self, tx: &[Complex64], rx: &[Complex64]) -> Result<(), ExtractError> {
        if tx.len() != rx.len() {
            return Err(ExtractError::LengthMismatch {
                tx: tx.len(),
                rx: rx.len(),
            });
        }

        let tx_median = crate::capture::median_abs(tx);
        let rx_median = crate::capture::median_abs(rx);
        if (tx_median - rx_median).abs() / (tx_median + rx_median).max(f64::EPSILON)
            >= NORMALISATION_TOLERANCE
        {
            return Err(ExtractError::NotNormalised);
        }

        for (t, r) in tx.iter().zip(rx.iter()) {
            let amp = t.norm();
            if let Some(i) = self.bin_index(amp) {
                if self.tx_values[i].len() < self.n_per_bin {
                    self.tx_values[i].push(*t);
                    self.rx_values[i].push(*r);
                }
            }
        }
        self.n_meas += 1;
        Ok(())
    }

    /// Derive per-bin means, truncated to the usable low-index prefix: the
    /// first index at which a bin is not yet full.
    pub fn means(&self) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<usize>) {
        let usable = self
            .tx_values
            .iter()
            .position(|v| v.len() < self.n_per_bin)
            .unwrap_or(self.tx_values.len());

        let mut tx_mean = Vec::with_capacity(usable);
        let mut rx_mean = Vec::with_capacity(usable);
        let mut phase_mean = Vec::with_capacity(usable);
        let mut n_per_bin = Vec::with_capacity(usable);

        for i in 0..usable {
            let tx_bin = &self.tx_values[i];
            let rx_bin = &self.rx_values[i];
            let midpoint = (self.edges[i] + self.edges[i + 1]) / 2.0;
            tx_mean.push(midpoint);

            if rx_bin.is_empty() {
                rx_mean.push(0.0);
                phase_mean.push(0.0);
                n_per_bin.push(0);
                continue;
            }

            let rx_abs_mean: f64 = rx_bin.iter().map(|c| c.norm()).sum::<f64>() / rx_bin.len() as f64;
            let phase_diffs: Vec<f64> = tx_bin
                .iter()
                .zip(rx_bin.iter())
                .map(|(t, r)| (r * t.conj()).arg())
                .collect();
            let phase_avg = phase_diffs.iter().sum::<f64>() / phase_diffs.len() as f64;

            rx_mean.push(rx_abs_mean);
            phase_mean.push(phase_avg);
            n_per_bin.push(rx_bin.len());
        }

        (tx_mean, rx_mean, phase_mean, n_per_bin)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::f64::consts::TAU;

    #[test]
    fn never_stores_more_than_n_per_bin_entries() {
        let mut stat = BinStatistic::new(4, 8, 4.0);
        for _ in 0..20 {
            let tx: Vec<Complex64> = vec![Complex64::new(1.0, 0.0)];
            let rx: Vec<Complex64> = vec![Complex64::new(1.0, 0.0)];
            let _ = stat.extract(&tx, &rx);
        }
        assert!(stat.tx_values.iter().all(|v| v.len() <= 8));
    }

    #[test]
    fn means_report_gain_of_point_nine_for_compressed_amplifier() {
        let mut stat = BinStatistic::with_defaults(2.0);
        for k in 0..2000 {
            let amp = 0.05 + 1.9 * (k as f64 / 2000.0);
            let phase = TAU * (k as f64 / 37.0);
            let tx = vec![Complex64::from_polar(amp, phase)];
            let rx = vec![Complex64::from_polar(amp * 0.9, phase)];
            stat.extract(&tx, &rx).unwrap();
        }
        let (tx_mean, rx_mean, _phase_mean, _n) = stat.means();
        assert!(!tx_mean.is_empty());
        for (t, r) in tx_mean.iter().zip(rx_mean.iter()) {
            if *r > 0.0 {
                assert!((r / t - 0.9).abs() < 0.2);
            }
        }
    }

    #[test]
    fn rejects_mismatched_medians() {
        let mut stat = BinStatistic::with_defaults(4.0);
        let tx = vec![Complex64::new(1.0, 0.0); 10];
        let rx = vec![Complex64::new(2.0, 0.0); 10];
        assert_eq!(stat.extract(&tx, &rx), Err(ExtractError::NotNormalised));
    }
}
