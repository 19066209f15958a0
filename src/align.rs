//! Sample, subsample and phase alignment between a transmitted (TX) frame
//! and the feedback (RX) frame captured from the power amplifier: coarse
//! correlation, FFT-domain fractional delay, and median-of-components
//! phase rotation.

use rustfft::FftPlanner;
use rustfft::num_complex::Complex64;
use std::f64::consts::PI;

/// Bounded 1-D golden-section minimisation over `[-1, 1]`, standing in for
/// `scipy.optimize.minimize_scalar(..., method='bounded')`.
fn minimize_scalar_bounded(mut f: impl FnMut(f64) -> f64, lo: f64, hi: f64) -> (f64, f64) {
    const GOLDEN: f64 = 0.6180339887498949;
    let mut a = lo;
    let mut b = hi;
    let mut x1 = b - GOLDEN * (b - a);
    let mut x2 = a + GOLDEN * (b - a);
    let mut f1 = f(x1);
    let mut f2 = f(x2);
    for _ in 0..200 {
        if (b - a).abs() < 1e-10 {
            break;
        }
        if f1 < f2 {
            b = x2;
            x2 = x1;
            f2 = f1;
            x1 = b - GOLDEN * (b - a);
            f1 = f(x1);
        } else {
            a = x1;
            x1 = x2;
            f1 = f2;
            x2 = a + GOLDEN * (b - a);
            f2 = f(x2);
        }
    }
    let best_x = if f1 < f2 { x1 } else { x2 };
    let best_f = if f1 < f2 { f1 } else { f2 };
    (best_x, best_f)
}

/// Standard FFT angular-frequency grid, see `subsample_align.py::gen_omega`.
fn gen_omega(length: usize) -> Vec<f64> {
    assert!(length % 2 == 0, "gen_omega needs an even length");
    let halflen = length / 2;
    let factor = 2.0 * PI / length as f64;
    (0..length)
        .map(|i| {
            if i < halflen {
                factor * i as f64
            } else {
                factor * (i as f64 - length as f64)
            }
        })
        .collect()
}

/// Coarse integer-sample alignment by cross-correlation argmax, see
/// `Dab_Util.py::lag`. Returns the lag `k` such that `rx` leads `tx` by `k`
/// samples (positive `k`: drop the tail of `tx` and the head of `rx`).
fn coarse_lag(tx: &[Complex64], rx: &[Complex64]) -> i64 {
    let n = tx.len().max(rx.len());
    let fft_len = (2 * n).next_power_of_two();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(fft_len);
    let ifft = planner.plan_fft_inverse(fft_len);

    let mut tx_buf = vec![Complex64::new(0.0, 0.0); fft_len];
    let mut rx_buf = vec![Complex64::new(0.0, 0.0); fft_len];
    for (dst, src) in tx_buf.iter_mut().zip(tx.iter()) {
        *dst = *src;
    }
    for (dst, src) in rx_buf.iter_mut().zip(rx.iter()) {
        *dst = *src;
    }

    fft.process(&mut tx_buf);
    fft.process(&mut rx_buf);

    // cross-correlation of rx against tx: conj(TX) * RX in the frequency domain
    let mut prod: Vec<Complex64> = tx_buf
        .iter()
        .zip(rx_buf.iter())
        .map(|(t, r)| t.conj() * r)
        .collect();
    ifft.process(&mut prod);

    let (argmax, _) = prod
        .iter()
        .enumerate()
        .map(|(i, c)| (i, c.norm()))
        .fold((0usize, f64::MIN), |best, cur| {
            if cur.1 > best.1 { cur } else { best }
        });

    // Unwrap the circular index into a signed lag centred at zero.
    let signed_idx = if argmax > fft_len / 2 {
        argmax as i64 - fft_len as i64
    } else {
        argmax as i64
    };
    // Matches `np.argmax(correlate(rx, tx)) - len(tx) + 1` for the
    // `full`-mode correlation used by the original: rx lags tx by
    // `-signed_idx` in our frequency-domain formulation.
    -signed_idx
}

/// Fractional-delay alignment via FFT-domain phase rotation, see
/// `subsample_align.py::subsample_align`. `sig` is rotated so that it lines
/// up with `ref_sig`; both must already be coarsely aligned and of equal,
/// even length.
fn subsample_align(sig: &[Complex64], ref_sig: &[Complex64]) -> Option<Vec<Complex64>> {
    let n = sig.len();
    assert!(n % 2 == 0, "subsample_align needs an even length signal");
    if n == 0 {
        return Some(Vec::new());
    }
    let halflen = n / 2;
    let omega = gen_omega(n);

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    let ifft = planner.plan_fft_inverse(n);

    let mut fft_sig = sig.to_vec();
    fft.process(&mut fft_sig);

    let rotate = |tau: f64| -> Vec<Complex64> {
        let mut rotate_vec: Vec<Complex64> = omega
            .iter()
            .map(|&w| Complex64::from_polar(1.0, tau * w))
            .collect();
        rotate_vec[halflen] = Complex64::new((PI * tau).cos(), 0.0);
        rotate_vec
            .iter()
            .zip(fft_sig.iter())
            .map(|(r, s)| r * s)
            .collect()
    };

    let correlate_for_delay = |tau: f64| -> f64 {
        let mut corr = rotate(tau);
        ifft.process(&mut corr);
        // rustfft's inverse transform is unnormalised; the scale factor is
        // constant across tau and irrelevant to the minimiser.
        let sum: Complex64 = corr
            .iter()
            .zip(ref_sig.iter())
            .map(|(c, r)| c.conj() * r)
            .sum();
        -sum.norm()
    };

    let (best_tau, best_val) = minimize_scalar_bounded(correlate_for_delay, -1.0, 1.0);
    if !best_val.is_finite() {
        return None;
    }

    let mut rotated = rotate(best_tau);
    ifft.process(&mut rotated);
    let scale = 1.0 / n as f64;
    Some(rotated.iter().map(|c| c * scale).collect())
}

/// Rotate `rx` so its phase matches `tx`, using the median of the real and
/// imaginary parts of the per-sample phase difference (robust to wrap
/// outliers), see `phase_align.py::phase_align`.
fn phase_align(rx: &[Complex64], tx: &[Complex64]) -> Vec<Complex64> {
    let mut real_diffs: Vec<f64> = Vec::with_capacity(rx.len());
    let mut imag_diffs: Vec<f64> = Vec::with_capacity(rx.len());
    for (r, t) in rx.iter().zip(tx.iter()) {
        let angle_diff = (r.arg() - t.arg()).rem_euclid(2.0 * PI);
        real_diffs.push(angle_diff.cos());
        imag_diffs.push(angle_diff.sin());
    }
    let real_median = median(&mut real_diffs);
    let imag_median = median(&mut imag_diffs);
    let angle = imag_median.atan2(real_median);
    let correction = Complex64::from_polar(1.0, -angle);
    rx.iter().map(|r| r * correction).collect()
}

fn median(xs: &mut [f64]) -> f64 {
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = xs.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 0 {
        (xs[n / 2 - 1] + xs[n / 2]) / 2.0
    } else {
        xs[n / 2]
    }
}

/// Full alignment pipeline: coarse integer lag, subsample (fractional delay)
/// alignment, then constant phase alignment. Returns `None` if the
/// subsample optimiser fails to converge, in which case the capture must be
/// treated as failed.
pub fn align(tx: &[Complex64], rx: &[Complex64]) -> Option<(Vec<Complex64>, Vec<Complex64>)> {
    let k = coarse_lag(tx, rx);

    let (mut tx_trimmed, mut rx_trimmed) = trim_by_lag(tx, rx, k);

    if tx_trimmed.len() % 2 == 1 {
        tx_trimmed.pop();
        rx_trimmed.pop();
    }
    if tx_trimmed.is_empty() {
        return None;
    }

    let rx_subsample = subsample_align(&rx_trimmed, &tx_trimmed)?;
    let rx_phase_aligned = phase_align(&rx_subsample, &tx_trimmed);

    Some((tx_trimmed, rx_phase_aligned))
}

/// Drop samples so that `tx` and `rx` overlap according to lag `k`: if
/// `k > 0`, rx leads, so drop the tail of tx and the head of rx; if `k < 0`,
/// the opposite.
fn trim_by_lag(tx: &[Complex64], rx: &[Complex64], k: i64) -> (Vec<Complex64>, Vec<Complex64>) {
    if k > 0 {
        let k = k as usize;
        if k >= tx.len() || k >= rx.len() {
            return (Vec::new(), Vec::new());
        }
        (tx[..tx.len() - k].to_vec(), rx[k..].to_vec())
    } else if k < 0 {
        let k = (-k) as usize;
        if k >= tx.len() || k >= rx.len() {
            return (Vec::new(), Vec::new());
        }
        (tx[k..].to_vec(), rx[..rx.len() - k].to_vec())
    } else {
        (tx.to_vec(), rx.to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::f64::consts::TAU;

    fn tone(len: usize, cycles_per_sample: f64) -> Vec<Complex64> {
        (0..len)
            .map(|n| Complex64::from_polar(1.0, TAU * cycles_per_sample * n as f64))
            .collect()
    }

    #[test]
    fn align_produces_equal_length_frames_with_zero_residual_lag() {
        let tx = tone(1024, 1.0 / 64.0);
        // Shift rx by 3 samples relative to tx (rx is a delayed copy of tx).
        let rx: Vec<Complex64> = {
            let mut v = vec![Complex64::new(0.0, 0.0); 3];
            v.extend_from_slice(&tx[..tx.len() - 3]);
            v
        };
        let (tx_aligned, rx_aligned) = align(&tx, &rx).expect("alignment should succeed");
        assert_eq!(tx_aligned.len(), rx_aligned.len());
        assert_eq!(tx_aligned.len() % 2, 0);

        let residual = coarse_lag(&tx_aligned, &rx_aligned);
        assert_eq!(residual, 0);
    }

    #[test]
    fn subsample_align_recovers_fractional_delay() {
        let n = 512;
        let tx = tone(n, 4.0 / n as f64);
        let tau_true = 0.3;
        let omega = gen_omega(n);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n);
        let ifft = planner.plan_fft_inverse(n);
        let mut fft_tx = tx.clone();
        fft.process(&mut fft_tx);
        let mut rotate_vec: Vec<Complex64> = omega
            .iter()
            .map(|&w| Complex64::from_polar(1.0, tau_true * w))
            .collect();
        rotate_vec[n / 2] = Complex64::new((PI * tau_true).cos(), 0.0);
        let mut shifted: Vec<Complex64> = rotate_vec
            .iter()
            .zip(fft_tx.iter())
            .map(|(r, s)| r * s)
            .collect();
        ifft.process(&mut shifted);
        for c in shifted.iter_mut() {
            *c *= 1.0 / n as f64;
        }

        let aligned = subsample_align(&shifted, &tx).expect("optimiser should converge");
        assert_eq!(aligned.len(), n);

        // `shifted` is `tx` delayed by `tau_true`; a correct fractional-delay
        // correction should bring `aligned` back within 0.02 of `tx` itself.
        let max_abs_err = aligned
            .iter()
            .zip(tx.iter())
            .map(|(a, t)| (a - t).norm())
            .fold(0.0_f64, f64::max);
        assert!(max_abs_err < 0.02, "max_abs_err = {max_abs_err}");
    }

    #[test]
    fn phase_align_compensates_constant_rotation() {
        let n = 256;
        let tx = tone(n, 3.0 / n as f64);
        let alpha = 0.7_f64;
        let rx: Vec<Complex64> = tx.iter().map(|s| s * Complex64::from_polar(1.0, alpha)).collect();
        let aligned = phase_align(&rx, &tx);
        let mean: Complex64 = aligned
            .iter()
            .zip(tx.iter())
            .map(|(r, t)| r * t.conj())
            .sum::<Complex64>()
            / n as f64;
        assert!(mean.arg().abs() < 1e-3);
    }

    #[test]
    fn coarse_lag_is_zero_for_identical_signals() {
        let tx = tone(200, 2.0 / 200.0);
        assert_eq!(coarse_lag(&tx, &tx), 0);
    }
}
