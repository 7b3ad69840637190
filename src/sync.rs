//! ADC synchronization loop.
//!
//! This module contains [`Synchronizer`], which aligns the sampling instants
//! of the two ADCs of a two-input spectrometer. Each iteration sweeps a test
//! tone over a set of spectral channels, measures the complex ratio between
//! both ADCs at each channel, estimates the delay between the ADCs from the
//! slope of the phase of the ratios, and corrects the delay by writing to the
//! delay register of the ADC that is ahead. The loop ends when the estimated
//! delay is zero.

use crate::delay::{fit_phase_slope, PhaseFit};
use crate::device::{Generator, Registers};
use crate::error::{DataShapeError, SyncError};
use crate::format::ElementFormat;
use crate::lanes::{bram_size, read_interleaved};
use crate::spectrum::{channel_frequency, dbfs_reference, overrange_channels, scale_to_dbfs};
use adcsync_json::Channel;
use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use num_complex::Complex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Synchronization settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// BRAMs holding the ZDOK0 power spectrum, in interleaving order.
    pub zdok0_brams: Vec<String>,
    /// BRAMs holding the ZDOK1 power spectrum, in interleaving order.
    pub zdok1_brams: Vec<String>,
    /// BRAMs holding the real part of the cross spectrum.
    pub cross_real_brams: Vec<String>,
    /// BRAMs holding the imaginary part of the cross spectrum.
    pub cross_imag_brams: Vec<String>,
    /// BRAM address width in bits.
    pub address_width: u32,
    /// BRAM data width in bits.
    pub data_width: u32,
    /// Format of the power spectra.
    pub power_format: ElementFormat,
    /// Format of the cross spectrum.
    pub cross_format: ElementFormat,
    /// Spectrometer bandwidth in Hz.
    ///
    /// The ADCs sample at twice this frequency.
    pub bandwidth: f64,
    /// Number of bits of the ADCs.
    pub adc_bits: u32,
    /// Register that resets the accumulation counter.
    pub count_register: String,
    /// Register holding the accumulation length.
    pub acc_len_register: String,
    /// Number of spectra accumulated.
    pub acc_len: u32,
    /// Delay registers of the ZDOK0 and ZDOK1 ADCs.
    pub delay_registers: [String; 2],
    /// First test channel.
    pub start_channel: usize,
    /// Test channel at which the sweep stops (not included).
    pub stop_channel: usize,
    /// Distance between test channels.
    pub channel_step: usize,
    /// Generator power in dBm, or `None` to leave it unchanged.
    pub generator_power: Option<f64>,
    /// Maximum number of sweeps.
    pub max_iterations: u32,
}

impl SyncConfig {
    /// Gives the number of spectral channels.
    pub fn num_channels(&self) -> usize {
        self.zdok0_brams.len() << self.address_width
    }

    /// Gives the ADC sampling frequency in samples per second.
    pub fn sampling_frequency(&self) -> f64 {
        2.0 * self.bandwidth
    }

    /// Gives the channels visited by a sweep.
    pub fn test_channels(&self) -> impl Iterator<Item = usize> {
        (self.start_channel..self.stop_channel).step_by(self.channel_step.max(1))
    }

    /// Gives the time to wait after changing the generator frequency.
    ///
    /// This is the time it takes to produce two accumulated spectra, which
    /// guarantees that the spectra read afterwards have been fully accumulated
    /// with the new frequency.
    ///
    /// Settings that pass [`SyncConfig::validate`] always give a finite settle
    /// time. Otherwise the result saturates at [`Duration::MAX`].
    pub fn settle_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.settle_secs()).unwrap_or(Duration::MAX)
    }

    fn settle_secs(&self) -> f64 {
        2.0 * f64::from(self.acc_len) * f64::from(self.address_width).exp2() / self.bandwidth
    }

    /// Checks the settings.
    ///
    /// This catches mistakes in the settings before talking to the hardware.
    pub fn validate(&self) -> Result<()> {
        let lanes = self.zdok0_brams.len();
        anyhow::ensure!(lanes > 0, "no BRAMs given for the ZDOK0 spectrum");
        for (brams, what) in [
            (&self.zdok1_brams, "ZDOK1 spectrum"),
            (&self.cross_real_brams, "cross spectrum (real part)"),
            (&self.cross_imag_brams, "cross spectrum (imaginary part)"),
        ] {
            anyhow::ensure!(
                brams.len() == lanes,
                "{} BRAMs given for the {what}, but {lanes} for the ZDOK0 spectrum",
                brams.len()
            );
        }
        anyhow::ensure!(self.address_width < 24, "address width too large");
        for format in [self.power_format, self.cross_format] {
            bram_size(self.address_width, self.data_width, format)?;
            anyhow::ensure!(
                self.data_width as usize == 8 * format.width(),
                "data width of {} bits does not match element format {format}",
                self.data_width
            );
        }
        anyhow::ensure!(
            self.bandwidth.is_finite() && self.bandwidth > 0.0,
            "invalid bandwidth {}",
            self.bandwidth
        );
        anyhow::ensure!(
            (1..=i32::MAX as u32).contains(&self.acc_len),
            "invalid accumulation length {}",
            self.acc_len
        );
        anyhow::ensure!(
            Duration::try_from_secs_f64(self.settle_secs()).is_ok(),
            "settle time of {} s is too long (bandwidth {} Hz too small)",
            self.settle_secs(),
            self.bandwidth
        );
        anyhow::ensure!(self.channel_step > 0, "channel step must be positive");
        anyhow::ensure!(
            self.stop_channel <= self.num_channels(),
            "stop channel {} is beyond the {} spectral channels",
            self.stop_channel,
            self.num_channels()
        );
        anyhow::ensure!(
            self.test_channels().count() >= 2,
            "the sweep must visit at least 2 channels"
        );
        anyhow::ensure!(self.max_iterations > 0, "maximum iterations must be positive");
        Ok(())
    }
}

/// Accumulated delay corrections.
///
/// This records the number of samples that have been added to the delay
/// register of each ADC since the [`Synchronizer`] was created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SyncState {
    corrections: [i64; 2],
}

impl SyncState {
    /// Gives the total correction applied to a channel, in samples.
    pub fn correction(&self, channel: Channel) -> i64 {
        self.corrections[Self::index(channel)]
    }

    fn add(&mut self, channel: Channel, samples: i64) {
        self.corrections[Self::index(channel)] += samples;
    }

    fn index(channel: Channel) -> usize {
        match channel {
            Channel::Zdok0 => 0,
            Channel::Zdok1 => 1,
        }
    }
}

impl From<SyncState> for adcsync_json::Corrections {
    fn from(value: SyncState) -> adcsync_json::Corrections {
        adcsync_json::Corrections {
            zdok0: value.corrections[0],
            zdok1: value.corrections[1],
        }
    }
}

/// Result of a synchronization run.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SyncOutcome {
    /// The ADCs are aligned.
    Converged {
        /// Number of sweeps performed.
        iterations: u32,
    },
    /// The loop gave up before aligning the ADCs.
    NotConverged {
        /// Why the loop gave up.
        reason: NonConvergence,
        /// Number of sweeps performed.
        iterations: u32,
    },
    /// The run was cancelled.
    Cancelled,
}

/// Reason for giving up synchronization.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NonConvergence {
    /// The maximum number of sweeps was reached with a non-zero delay.
    IterationLimit,
    /// The delay estimate undid the previous correction.
    ///
    /// Applying it would bring the registers back to where they were one
    /// sweep ago.
    Oscillating,
}

impl From<SyncOutcome> for adcsync_json::Outcome {
    fn from(value: SyncOutcome) -> adcsync_json::Outcome {
        match value {
            SyncOutcome::Converged { .. } => adcsync_json::Outcome::Converged,
            SyncOutcome::NotConverged {
                reason: NonConvergence::IterationLimit,
                ..
            } => adcsync_json::Outcome::IterationLimit,
            SyncOutcome::NotConverged {
                reason: NonConvergence::Oscillating,
                ..
            } => adcsync_json::Outcome::Oscillating,
            SyncOutcome::Cancelled => adcsync_json::Outcome::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Measurement {
    channel: usize,
    frequency: f64,
    ratio: Complex<f64>,
    power_dbfs: [f64; 2],
}

impl From<&Measurement> for adcsync_json::PhasePoint {
    fn from(value: &Measurement) -> adcsync_json::PhasePoint {
        adcsync_json::PhasePoint {
            channel: u32::try_from(value.channel).unwrap_or(u32::MAX),
            frequency: value.frequency,
            magnitude_ratio: value.ratio.norm(),
            phase_difference: value.ratio.arg().to_degrees(),
            power_zdok0: value.power_dbfs[0],
            power_zdok1: value.power_dbfs[1],
        }
    }
}

#[derive(Debug)]
enum Phase {
    Init,
    Sweeping,
    Estimating(Vec<Measurement>),
    Correcting(i64),
    Converged,
}

/// ADC synchronizer.
///
/// The synchronizer owns the board registers and the signal generator for as
/// long as it exists. See the [module documentation](self) for a description
/// of the algorithm.
#[derive(Debug)]
pub struct Synchronizer<R, G> {
    registers: R,
    generator: G,
    config: SyncConfig,
    state: SyncState,
    iterations: Vec<adcsync_json::Iteration>,
    cancel: CancellationToken,
}

impl<R: Registers, G: Generator> Synchronizer<R, G> {
    /// Creates a new synchronizer.
    ///
    /// The configuration is validated with [`SyncConfig::validate`]. The
    /// `cancel` token can be used to stop [`Synchronizer::run`] early.
    pub fn new(
        registers: R,
        generator: G,
        config: SyncConfig,
        cancel: CancellationToken,
    ) -> Result<Synchronizer<R, G>> {
        config.validate().context("invalid synchronization settings")?;
        Ok(Synchronizer {
            registers,
            generator,
            config,
            state: SyncState::default(),
            iterations: Vec::new(),
            cancel,
        })
    }

    /// Gives access to the board registers.
    pub fn registers(&self) -> &R {
        &self.registers
    }

    /// Gives access to the signal generator.
    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// Gives the synchronization settings.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Gives the corrections applied so far.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Gives the iterations of the last run.
    pub fn iterations(&self) -> &[adcsync_json::Iteration] {
        &self.iterations
    }

    /// Runs the synchronization loop.
    ///
    /// The loop runs until the ADCs are aligned, until it gives up, or until it
    /// is cancelled. Cancellation is checked between measurements; a sweep
    /// that has been completed is always estimated and its correction
    /// applied.
    ///
    /// The generator output is turned off before returning.
    #[tracing::instrument(name = "Synchronizer::run", level = "debug", skip_all)]
    pub async fn run(&mut self) -> Result<SyncOutcome, SyncError> {
        self.iterations.clear();
        let result = self.run_loop().await;
        match self.generator.set_output_enabled(false).await {
            Ok(()) => result,
            Err(err) if result.is_ok() => Err(SyncError::Hardware(
                err.context("failed to turn off generator output"),
            )),
            Err(err) => {
                tracing::error!("failed to turn off generator output: {err:#}");
                result
            }
        }
    }

    async fn run_loop(&mut self) -> Result<SyncOutcome, SyncError> {
        let mut phase = Phase::Init;
        let mut last_correction = None;
        loop {
            tracing::trace!(?phase, "synchronizer phase");
            phase = match phase {
                Phase::Init => {
                    if !self.initialize().await? {
                        return Ok(SyncOutcome::Cancelled);
                    }
                    Phase::Sweeping
                }
                Phase::Sweeping => match self.sweep().await? {
                    Some(measurements) => Phase::Estimating(measurements),
                    None => return Ok(SyncOutcome::Cancelled),
                },
                Phase::Estimating(measurements) => {
                    let fit = self.estimate(&measurements)?;
                    let delay = fit.delay_samples();
                    let iterations = self.record(&fit, &measurements);
                    if delay == 0 {
                        Phase::Converged
                    } else if last_correction == Some(-delay) {
                        tracing::warn!(delay, "delay estimate undoes the previous correction");
                        return Ok(SyncOutcome::NotConverged {
                            reason: NonConvergence::Oscillating,
                            iterations,
                        });
                    } else if iterations >= self.config.max_iterations {
                        tracing::warn!(delay, iterations, "maximum number of sweeps reached");
                        return Ok(SyncOutcome::NotConverged {
                            reason: NonConvergence::IterationLimit,
                            iterations,
                        });
                    } else {
                        Phase::Correcting(delay)
                    }
                }
                Phase::Correcting(delay) => {
                    let channel = self.correct(delay).await?;
                    if let Some(iteration) = self.iterations.last_mut() {
                        iteration.corrected = Some(channel);
                    }
                    last_correction = Some(delay);
                    Phase::Sweeping
                }
                Phase::Converged => {
                    let iterations = self.iterations.len() as u32;
                    tracing::info!(iterations, "ADCs synchronized");
                    return Ok(SyncOutcome::Converged { iterations });
                }
            };
        }
    }

    // Returns false if cancelled
    async fn initialize(&mut self) -> Result<bool, SyncError> {
        tracing::info!("setting up generator and spectrometer");
        if let Some(power) = self.config.generator_power {
            self.generator
                .set_power_dbm(power)
                .await
                .context("failed to set generator power")?;
        }
        self.generator
            .set_output_enabled(true)
            .await
            .context("failed to turn on generator output")?;
        let config = &self.config;
        // acc_len fits in an i32 (checked in SyncConfig::validate)
        self.registers
            .write_int(&config.acc_len_register, config.acc_len as i32)
            .await
            .context("failed to set accumulation length")?;
        for value in [1, 0] {
            self.registers
                .write_int(&config.count_register, value)
                .await
                .context("failed to reset accumulation counter")?;
        }
        Ok(self.settle().await)
    }

    // Returns false if cancelled
    async fn settle(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.settle_time()) => true,
        }
    }

    // Returns None if cancelled
    async fn sweep(&mut self) -> Result<Option<Vec<Measurement>>, SyncError> {
        tracing::info!(
            iteration = self.iterations.len() + 1,
            "sweeping test tone"
        );
        let channels: Vec<usize> = self.config.test_channels().collect();
        let mut measurements = Vec::with_capacity(channels.len());
        for channel in channels {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            let frequency =
                channel_frequency(self.config.bandwidth, channel, self.config.num_channels());
            self.generator
                .set_frequency_hz(frequency)
                .await
                .with_context(|| format!("failed to set generator frequency to {frequency} Hz"))?;
            if !self.settle().await {
                return Ok(None);
            }
            if let Some(measurement) = self.measure(channel, frequency).await? {
                measurements.push(measurement);
            }
        }
        Ok(Some(measurements))
    }

    async fn measure(
        &mut self,
        channel: usize,
        frequency: f64,
    ) -> Result<Option<Measurement>, SyncError> {
        let config = &self.config;
        let (aw, dw) = (config.address_width, config.data_width);
        let aa = read_interleaved(
            &mut self.registers,
            &config.zdok0_brams,
            aw,
            dw,
            config.power_format,
        )
        .await?;
        let bb = read_interleaved(
            &mut self.registers,
            &config.zdok1_brams,
            aw,
            dw,
            config.power_format,
        )
        .await?;
        let ab_re = read_interleaved(
            &mut self.registers,
            &config.cross_real_brams,
            aw,
            dw,
            config.cross_format,
        )
        .await?;
        let ab_im = read_interleaved(
            &mut self.registers,
            &config.cross_imag_brams,
            aw,
            dw,
            config.cross_format,
        )
        .await?;

        let num_channels = config.num_channels();
        let at = |data: &[f64]| {
            data.get(channel)
                .copied()
                .ok_or(DataShapeError::LengthMismatch {
                    left: data.len(),
                    right: num_channels,
                })
        };
        let reference = dbfs_reference(config.adc_bits, num_channels);
        let mut power_dbfs = [0.0; 2];
        for (input, spectrum) in [(Channel::Zdok0, &aa), (Channel::Zdok1, &bb)] {
            let scaled = scale_to_dbfs(spectrum, config.acc_len, reference);
            let overrange = overrange_channels(&scaled).count();
            if overrange > 0 {
                tracing::warn!(%input, overrange, "spectrum above full scale (ADC clipping)");
            }
            power_dbfs[SyncState::index(input)] = at(&scaled)?;
        }

        let auto = at(&aa)?;
        let cross = Complex::new(at(&ab_re)?, at(&ab_im)?);
        if auto == 0.0 {
            tracing::warn!(channel, frequency, "no power in ZDOK0 at test channel; skipping");
            return Ok(None);
        }
        // conj(A conj(B)) / |A|^2 = B / A
        let ratio = cross.conj() / auto;
        tracing::debug!(
            channel,
            frequency,
            magnitude = ratio.norm(),
            phase = ratio.arg().to_degrees(),
            "measured phase ratio"
        );
        Ok(Some(Measurement {
            channel,
            frequency,
            ratio,
            power_dbfs,
        }))
    }

    fn estimate(&self, measurements: &[Measurement]) -> Result<PhaseFit, DataShapeError> {
        let frequencies: Vec<f64> = measurements.iter().map(|m| m.frequency).collect();
        let ratios: Vec<Complex<f64>> = measurements.iter().map(|m| m.ratio).collect();
        let fit = fit_phase_slope(&frequencies, &ratios, self.config.sampling_frequency())?;
        tracing::info!(
            delay = fit.delay,
            slope = fit.slope,
            points = measurements.len(),
            "estimated delay"
        );
        Ok(fit)
    }

    // Returns the number of iterations so far
    fn record(&mut self, fit: &PhaseFit, measurements: &[Measurement]) -> u32 {
        let index = self.iterations.len() as u32 + 1;
        self.iterations.push(adcsync_json::Iteration {
            index,
            delay_samples: fit.delay_samples(),
            slope: fit.slope,
            intercept: fit.intercept,
            corrected: None,
            points: measurements.iter().map(Into::into).collect(),
        });
        index
    }

    // Adds the delay to the register of the ADC that is ahead. This is never
    // retried, since a repeated write would apply the correction twice.
    async fn correct(&mut self, delay: i64) -> Result<Channel, SyncError> {
        let channel = if delay > 0 {
            Channel::Zdok1
        } else {
            Channel::Zdok0
        };
        let register = &self.config.delay_registers[SyncState::index(channel)];
        let current = self
            .registers
            .read_int(register)
            .await
            .with_context(|| format!("failed to read delay register {register}"))?;
        let amount = delay.abs();
        let value = i32::try_from(i64::from(current) + amount).map_err(|_| {
            anyhow::anyhow!("delay register {register} would overflow ({current} + {amount})")
        })?;
        self.registers
            .write_int(register, value)
            .await
            .with_context(|| format!("failed to write delay register {register}"))?;
        self.state.add(channel, amount);
        tracing::info!(%channel, %register, value, "delay corrected");
        Ok(channel)
    }

    /// Builds the JSON report of the last run.
    pub fn report(&self, outcome: SyncOutcome) -> adcsync_json::SyncReport {
        let config = &self.config;
        adcsync_json::SyncReport {
            datetime: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            outcome: outcome.into(),
            sweep: adcsync_json::Sweep {
                start_channel: config.start_channel as u32,
                stop_channel: config.stop_channel as u32,
                channel_step: config.channel_step as u32,
                num_channels: config.num_channels() as u32,
                bandwidth: config.bandwidth,
                sampling_frequency: config.sampling_frequency(),
                settle_time: config.settle_time().as_secs_f64(),
            },
            iterations: self.iterations.clone(),
            corrections: self.state.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::test::{example_model, names};
    use crate::sim::{SimulatedBoard, SimulatedGenerator, SpectrometerModel};

    fn example_config() -> SyncConfig {
        let model = example_model(0.0);
        SyncConfig {
            zdok0_brams: model.zdok0_brams,
            zdok1_brams: model.zdok1_brams,
            cross_real_brams: model.cross_real_brams,
            cross_imag_brams: model.cross_imag_brams,
            address_width: 9,
            data_width: 64,
            power_format: model.power_format,
            cross_format: model.cross_format,
            bandwidth: 1080e6,
            adc_bits: 8,
            count_register: "cnt_rst".to_string(),
            acc_len_register: model.acc_len_register,
            acc_len: 1 << 16,
            delay_registers: model.delay_registers,
            start_channel: 1,
            stop_channel: 2047,
            channel_step: 32,
            generator_power: Some(-5.0),
            max_iterations: 10,
        }
    }

    fn synchronizer(
        model: SpectrometerModel,
        config: SyncConfig,
    ) -> (
        Synchronizer<SimulatedBoard, SimulatedGenerator>,
        CancellationToken,
    ) {
        let (board, generator) = SimulatedBoard::with_spectrometer(model);
        let cancel = CancellationToken::new();
        let sync = Synchronizer::new(board, generator, config, cancel.clone()).unwrap();
        (sync, cancel)
    }

    fn register(sync: &Synchronizer<SimulatedBoard, SimulatedGenerator>, name: &str) -> i32 {
        let data = sync.registers().memory(name).unwrap();
        i32::from_be_bytes(data[..4].try_into().unwrap())
    }

    #[test]
    fn config() {
        let config = example_config();
        config.validate().unwrap();
        assert_eq!(config.num_channels(), 2048);
        assert_eq!(config.sampling_frequency(), 2160e6);
        assert_eq!(config.test_channels().count(), 64);
        let settle = config.settle_time().as_secs_f64();
        assert!((settle - 2.0 * 65536.0 * 512.0 / 1080e6).abs() < 1e-9);
    }

    #[test]
    fn invalid_config() {
        let mut config = example_config();
        config.zdok1_brams = names("x", 3);
        assert!(config.validate().is_err());

        let mut config = example_config();
        config.data_width = 32;
        assert!(config.validate().is_err());

        let mut config = example_config();
        config.stop_channel = 4096;
        assert!(config.validate().is_err());

        let mut config = example_config();
        config.start_channel = 10;
        config.stop_channel = 11;
        assert!(config.validate().is_err());

        let mut config = example_config();
        config.channel_step = 0;
        assert!(config.validate().is_err());

        let mut config = example_config();
        config.address_width = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tiny_bandwidth() {
        let mut config = example_config();
        config.bandwidth = 1e-12;
        let err = config.validate().unwrap_err();
        assert!(format!("{err}").contains("settle time"));
        assert_eq!(config.settle_time(), Duration::MAX);

        config.bandwidth = 1.0;
        config.validate().unwrap();
        assert_eq!(config.settle_time(), Duration::from_secs(2 * 65536 * 512));
    }

    #[tokio::test(start_paused = true)]
    async fn converges_zdok1_lagging() {
        let (mut sync, _) = synchronizer(example_model(3.0), example_config());
        let outcome = sync.run().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Converged { iterations: 2 });
        assert_eq!(sync.iterations()[0].delay_samples, -3);
        assert_eq!(sync.iterations()[0].corrected, Some(Channel::Zdok0));
        assert_eq!(sync.iterations()[1].delay_samples, 0);
        assert_eq!(sync.state().correction(Channel::Zdok0), 3);
        assert_eq!(sync.state().correction(Channel::Zdok1), 0);
        assert_eq!(register(&sync, "adc0_delay"), 3);
        assert_eq!(register(&sync, "adc1_delay"), 0);
        assert_eq!(register(&sync, "acc_len"), 1 << 16);
        assert_eq!(register(&sync, "cnt_rst"), 0);
        assert!(!sync.generator().output_enabled());
        assert_eq!(sync.generator().power_dbm(), -5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn converges_zdok1_leading() {
        let (mut sync, _) = synchronizer(example_model(-4.0), example_config());
        let outcome = sync.run().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Converged { iterations: 2 });
        assert_eq!(sync.iterations()[0].delay_samples, 4);
        assert_eq!(sync.state().correction(Channel::Zdok1), 4);
        assert_eq!(register(&sync, "adc1_delay"), 4);
        assert_eq!(register(&sync, "adc0_delay"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn already_aligned() {
        let (mut sync, _) = synchronizer(example_model(0.0), example_config());
        let outcome = sync.run().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Converged { iterations: 1 });
        assert_eq!(sync.state(), SyncState::default());
        let points = &sync.iterations()[0].points;
        assert_eq!(points.len(), 64);
        assert!(points
            .iter()
            .all(|p| (p.magnitude_ratio - 1.0).abs() < 1e-6 && p.phase_difference.abs() < 1e-3));
        // 1e6 per spectrum with an 8-bit ADC and 2048 channels
        let expected_dbfs = 60.0 - dbfs_reference(8, 2048);
        assert!((points[0].power_zdok0 - expected_dbfs).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn fractional_skew() {
        let (mut sync, _) = synchronizer(example_model(2.3), example_config());
        let outcome = sync.run().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Converged { iterations: 2 });
        assert_eq!(sync.state().correction(Channel::Zdok0), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fine_sweep() {
        let mut config = example_config();
        config.channel_step = 8;
        let (mut sync, _) = synchronizer(example_model(-37.0), config);
        let outcome = sync.run().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Converged { iterations: 2 });
        assert_eq!(sync.iterations()[0].points.len(), 256);
        assert_eq!(sync.state().correction(Channel::Zdok1), 37);
    }

    #[tokio::test(start_paused = true)]
    async fn oscillation() {
        let mut model = example_model(3.0);
        // every register unit moves the ADC by two samples
        model.register_gain = 2.0;
        let (mut sync, _) = synchronizer(model, example_config());
        let outcome = sync.run().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::NotConverged {
                reason: NonConvergence::Oscillating,
                iterations: 2
            }
        );
        assert_eq!(sync.iterations()[1].delay_samples, 3);
        assert_eq!(sync.iterations()[1].corrected, None);
        assert_eq!(register(&sync, "adc0_delay"), 3);
        assert_eq!(register(&sync, "adc1_delay"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_limit() {
        let mut model = example_model(3.0);
        // delay registers have no effect
        model.register_gain = 0.0;
        let mut config = example_config();
        config.max_iterations = 3;
        let (mut sync, _) = synchronizer(model, config);
        let outcome = sync.run().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::NotConverged {
                reason: NonConvergence::IterationLimit,
                iterations: 3
            }
        );
        // the last estimate is not applied
        assert_eq!(sync.state().correction(Channel::Zdok0), 6);
        assert_eq!(register(&sync, "adc0_delay"), 6);
        assert!(!sync.generator().output_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start() {
        let (mut sync, cancel) = synchronizer(example_model(3.0), example_config());
        cancel.cancel();
        assert_eq!(sync.run().await.unwrap(), SyncOutcome::Cancelled);
        assert!(sync.iterations().is_empty());
        assert!(!sync.generator().output_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_during_sweep() {
        let (mut sync, cancel) = synchronizer(example_model(3.0), example_config());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        assert_eq!(sync.run().await.unwrap(), SyncOutcome::Cancelled);
        assert!(sync.iterations().is_empty());
        assert_eq!(sync.state(), SyncState::default());
        assert_eq!(register(&sync, "adc0_delay"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_bram() {
        let board = SimulatedBoard::new();
        let generator = SimulatedGenerator::new();
        let mut sync = Synchronizer::new(
            board,
            generator,
            example_config(),
            CancellationToken::new(),
        )
        .unwrap();
        let err = sync.run().await.unwrap_err();
        assert!(matches!(err, SyncError::Hardware(_)));
        assert!(!sync.generator().output_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn no_signal() {
        let mut model = example_model(3.0);
        model.amplitudes = [0.0, 1000.0];
        let (mut sync, _) = synchronizer(model, example_config());
        let err = sync.run().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::DataShape(DataShapeError::InsufficientData { points: 0 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn clipping_does_not_abort() {
        let mut model = example_model(-3.0);
        // 100 dB per spectrum, well above the 83 dB full scale of an 8-bit
        // ADC with 2048 channels
        model.amplitudes = [1e5, 1e5];
        let (mut sync, _) = synchronizer(model, example_config());
        let outcome = sync.run().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Converged { iterations: 2 });
        assert_eq!(sync.state().correction(Channel::Zdok1), 3);
        let points = &sync.iterations()[0].points;
        assert_eq!(points.len(), 64);
        assert!(points
            .iter()
            .all(|p| p.power_zdok0 > 0.0 && p.power_zdok1 > 0.0));
    }

    #[test]
    fn outcome_names() {
        let outcome = SyncOutcome::NotConverged {
            reason: NonConvergence::Oscillating,
            iterations: 2,
        };
        assert_eq!(adcsync_json::Outcome::from(outcome).to_string(), "oscillating");
        let outcome = SyncOutcome::NotConverged {
            reason: NonConvergence::IterationLimit,
            iterations: 10,
        };
        assert_eq!(
            adcsync_json::Outcome::from(outcome).to_string(),
            "iteration limit reached"
        );
        assert_eq!(
            "cancelled".parse::<adcsync_json::Outcome>(),
            Ok(adcsync_json::Outcome::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn report() {
        let (mut sync, _) = synchronizer(example_model(-2.0), example_config());
        let outcome = sync.run().await.unwrap();
        let report = sync.report(outcome);
        assert_eq!(report.outcome, adcsync_json::Outcome::Converged);
        assert_eq!(report.iterations.len(), 2);
        assert_eq!(report.iterations[0].corrected, Some(Channel::Zdok1));
        assert_eq!(
            report.corrections,
            adcsync_json::Corrections { zdok0: 0, zdok1: 2 }
        );
        assert_eq!(report.sweep.num_channels, 2048);
    }
}
