//! Phase-slope delay estimation.
//!
//! A delay of `d` samples between two ADCs sampling at `fs` shows up in their
//! cross-spectrum as a phase that grows linearly with frequency, with a slope
//! of `2 * pi * d / fs` radians per Hz. This module fits that slope to a set of
//! phase ratio measurements and converts it back to samples.

use crate::error::DataShapeError;
use num_complex::Complex;
use std::f64::consts::PI;

/// Linear fit of phase against frequency.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PhaseFit {
    /// Slope in radians per Hz.
    pub slope: f64,
    /// Phase at zero frequency in radians.
    pub intercept: f64,
    /// Delay in samples corresponding to the slope, before rounding.
    pub delay: f64,
}

impl PhaseFit {
    /// Gives the delay rounded to the nearest whole sample.
    pub fn delay_samples(&self) -> i64 {
        self.delay.round() as i64
    }
}

/// Gives the phase of a complex number, or zero for zero.
pub fn safe_arg(z: &Complex<f64>) -> f64 {
    if z.re == 0.0 && z.im == 0.0 {
        0.0
    } else {
        z.arg()
    }
}

/// Removes 2π jumps from a phase sequence.
///
/// Whenever two consecutive phases differ by more than π, a multiple of 2π is
/// added to the rest of the sequence to make the jump smaller than π.
pub fn unwrap_phase(phase: &[f64]) -> Vec<f64> {
    let mut unwrapped = Vec::with_capacity(phase.len());
    let mut offset = 0.0;
    for (n, &x) in phase.iter().enumerate() {
        if n > 0 {
            let diff = x - phase[n - 1];
            if diff > PI {
                offset -= 2.0 * PI;
            } else if diff < -PI {
                offset += 2.0 * PI;
            }
        }
        unwrapped.push(x + offset);
    }
    unwrapped
}

// ordinary least squares fit y = slope * x + intercept
fn linear_fit(x: &[f64], y: &[f64]) -> Result<(f64, f64), DataShapeError> {
    let mut distinct = x.to_vec();
    distinct.sort_by(f64::total_cmp);
    distinct.dedup();
    if distinct.len() < 2 {
        return Err(DataShapeError::InsufficientData {
            points: distinct.len(),
        });
    }
    let n = x.len() as f64;
    let x_mean = x.iter().sum::<f64>() / n;
    let y_mean = y.iter().sum::<f64>() / n;
    let (sxy, sxx) = x
        .iter()
        .zip(y.iter())
        .fold((0.0, 0.0), |(sxy, sxx), (&u, &v)| {
            let du = u - x_mean;
            (sxy + du * (v - y_mean), sxx + du * du)
        });
    let slope = sxy / sxx;
    Ok((slope, y_mean - slope * x_mean))
}

/// Fits a phase slope to phase ratio measurements.
///
/// The `ratios` are the complex ratios between the two channels measured at
/// the frequencies `frequencies` (in Hz, in increasing order). The phase of
/// the ratios is unwrapped in that order and fitted with a line by least
/// squares. The `samp_rate` is the ADC sampling frequency in samples per
/// second.
pub fn fit_phase_slope(
    frequencies: &[f64],
    ratios: &[Complex<f64>],
    samp_rate: f64,
) -> Result<PhaseFit, DataShapeError> {
    if frequencies.len() != ratios.len() {
        return Err(DataShapeError::LengthMismatch {
            left: frequencies.len(),
            right: ratios.len(),
        });
    }
    let phase = unwrap_phase(&ratios.iter().map(safe_arg).collect::<Vec<_>>());
    let (slope, intercept) = linear_fit(frequencies, &phase)?;
    Ok(PhaseFit {
        slope,
        intercept,
        delay: slope * samp_rate / (2.0 * PI),
    })
}

/// Estimates the delay between two channels.
///
/// This fits the phase slope with [`fit_phase_slope`] and rounds the
/// corresponding delay to the nearest sample. A positive result means that
/// the second channel is ahead of the first one; zero means that they are
/// aligned. At least two distinct frequencies are needed.
pub fn estimate_delay(
    frequencies: &[f64],
    ratios: &[Complex<f64>],
    samp_rate: f64,
) -> Result<i64, DataShapeError> {
    Ok(fit_phase_slope(frequencies, ratios, samp_rate)?.delay_samples())
}

#[cfg(test)]
mod test {
    use super::*;

    const BANDWIDTH: f64 = 1080e6;
    const SAMP_RATE: f64 = 2.0 * BANDWIDTH;
    const NUM_CHANNELS: usize = 2048;

    fn sweep_frequencies() -> Vec<f64> {
        (1..2047)
            .step_by(8)
            .map(|k| BANDWIDTH * k as f64 / NUM_CHANNELS as f64)
            .collect()
    }

    fn ratios_for_delay(frequencies: &[f64], delay: f64) -> Vec<Complex<f64>> {
        frequencies
            .iter()
            .map(|&f| Complex::from_polar(0.8, 2.0 * PI * delay / SAMP_RATE * f + 0.3))
            .collect()
    }

    #[test]
    fn unwrap() {
        let wrapped = [3.0, -3.0, -2.9, 3.1, 0.0];
        let unwrapped = unwrap_phase(&wrapped);
        let expected = [3.0, 2.0 * PI - 3.0, 2.0 * PI - 2.9, 3.1, 0.0];
        for (a, b) in unwrapped.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
        assert!(unwrap_phase(&[]).is_empty());
    }

    #[test]
    fn in_phase() {
        let freqs = [100e6, 200e6];
        let ratios = [Complex::new(1.0, 0.0), Complex::new(2.0, 0.0)];
        assert_eq!(estimate_delay(&freqs, &ratios, SAMP_RATE), Ok(0));

        let freqs = sweep_frequencies();
        let ratios = vec![Complex::from_polar(1.0, -1.2); freqs.len()];
        let fit = fit_phase_slope(&freqs, &ratios, SAMP_RATE).unwrap();
        assert!(fit.slope.abs() < 1e-20);
        assert_eq!(fit.delay_samples(), 0);
    }

    #[test]
    fn known_delay() {
        let freqs = sweep_frequencies();
        for delay in [-100, -17, -5, -1, 1, 3, 17, 100] {
            let ratios = ratios_for_delay(&freqs, delay as f64);
            assert_eq!(estimate_delay(&freqs, &ratios, SAMP_RATE), Ok(delay));
        }
    }

    #[test]
    fn fractional_delay() {
        let freqs = sweep_frequencies();
        let fit = fit_phase_slope(&freqs, &ratios_for_delay(&freqs, 2.3), SAMP_RATE).unwrap();
        assert!((fit.delay - 2.3).abs() < 1e-6);
        assert!((fit.intercept - 0.3).abs() < 1e-6);
        assert_eq!(fit.delay_samples(), 2);
    }

    #[test]
    fn insufficient_data() {
        assert_eq!(
            estimate_delay(&[], &[], SAMP_RATE),
            Err(DataShapeError::InsufficientData { points: 0 })
        );
        assert_eq!(
            estimate_delay(&[1e6], &[Complex::new(1.0, 0.0)], SAMP_RATE),
            Err(DataShapeError::InsufficientData { points: 1 })
        );
        let ratios = [Complex::new(1.0, 0.0), Complex::new(0.0, 1.0)];
        assert_eq!(
            estimate_delay(&[1e6, 1e6], &ratios, SAMP_RATE),
            Err(DataShapeError::InsufficientData { points: 1 })
        );
    }

    #[test]
    fn length_mismatch() {
        assert_eq!(
            estimate_delay(&[1e6, 2e6], &[Complex::new(1.0, 0.0)], SAMP_RATE),
            Err(DataShapeError::LengthMismatch { left: 2, right: 1 })
        );
    }
}
