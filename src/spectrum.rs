//! Spectrometer data scaling.
//!
//! This module converts the accumulated power values read from the
//! spectrometer into dBFS and maps spectral channels to frequencies.

/// Full-scale reference of a spectrometer, in dB.
///
/// This is the level in dB of a full-scale sinusoid for an ADC with
/// `bits_per_sample` bits when the spectrum has `num_channels` channels, and it
/// is computed as `6.02 * bits + 1.76 + 10 * log10(channels)`. Subtracting it
/// from a power in dB gives dBFS.
pub fn dbfs_reference(bits_per_sample: u32, num_channels: usize) -> f64 {
    6.02 * f64::from(bits_per_sample) + 1.76 + 10.0 * (num_channels as f64).log10()
}

/// Converts an accumulated power value to dBFS.
///
/// The power is normalized by the accumulation length and converted to dB
/// relative to `reference_db` (see [`dbfs_reference`]). One unit of power is
/// added before taking the logarithm, so that channels with zero power give
/// `-reference_db` instead of minus infinity.
pub fn power_to_dbfs(power: f64, acc_len: u32, reference_db: f64) -> f64 {
    10.0 * (power / f64::from(acc_len) + 1.0).log10() - reference_db
}

/// Converts accumulated power values to dBFS.
///
/// This applies [`power_to_dbfs`] to every channel.
///
/// # Examples
/// ```
/// use adcsync::spectrum::scale_to_dbfs;
/// let scaled = scale_to_dbfs(&[0.0, 9.0 * 16.0], 16, 50.0);
/// assert_eq!(scaled, vec![-50.0, -40.0]);
/// ```
pub fn scale_to_dbfs(power: &[f64], acc_len: u32, reference_db: f64) -> Vec<f64> {
    power
        .iter()
        .map(|&p| power_to_dbfs(p, acc_len, reference_db))
        .collect()
}

/// Returns the channels that are above full scale.
///
/// A scaled value above 0 dBFS means that the ADC is clipping. This is not an
/// error, but it makes the phase measurements less reliable.
pub fn overrange_channels(scaled: &[f64]) -> impl Iterator<Item = usize> + '_ {
    scaled
        .iter()
        .enumerate()
        .filter(|&(_, &x)| x > 0.0)
        .map(|(n, _)| n)
}

/// Gives the center frequency of a spectral channel.
///
/// Channel `channel` out of `num_channels` spanning `bandwidth` Hz has
/// frequency `bandwidth * channel / num_channels`.
pub fn channel_frequency(bandwidth: f64, channel: usize, num_channels: usize) -> f64 {
    bandwidth * channel as f64 / num_channels as f64
}

/// Gives the frequencies of all the spectral channels.
pub fn channel_frequencies(bandwidth: f64, num_channels: usize) -> Vec<f64> {
    (0..num_channels)
        .map(|n| channel_frequency(bandwidth, n, num_channels))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reference() {
        let reference = dbfs_reference(8, 2048);
        assert!((reference - (48.16 + 1.76 + 33.1133)).abs() < 1e-3);
    }

    #[test]
    fn zero_power_floor() {
        for acc_len in [1, 2, 1000, 1 << 16] {
            assert_eq!(power_to_dbfs(0.0, acc_len, 83.0), -83.0);
        }
        assert_eq!(scale_to_dbfs(&[0.0; 4], 10, 12.5), vec![-12.5; 4]);
    }

    #[test]
    fn monotonic() {
        let power: Vec<f64> = (0..200).map(|n| (n as f64).powi(3)).collect();
        let scaled = scale_to_dbfs(&power, 1 << 16, 83.0);
        assert!(scaled.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn overrange() {
        let scaled = [-10.0, 0.0, 0.5, -3.0, 12.0];
        assert_eq!(overrange_channels(&scaled).collect::<Vec<_>>(), vec![2, 4]);
    }

    #[test]
    fn frequencies() {
        let freqs = channel_frequencies(1080e6, 2048);
        assert_eq!(freqs.len(), 2048);
        assert_eq!(freqs[0], 0.0);
        assert_eq!(freqs[1024], 540e6);
        assert_eq!(channel_frequency(1080e6, 8, 2048), freqs[8]);
    }
}
