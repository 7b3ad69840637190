//! adcsync application.
//!
//! This module contains a top-level structure [`App`] that represents the whole
//! adcsync application. The application connects to the board and the signal
//! generator (or builds simulated ones), runs the [`Synchronizer`] until it
//! finishes or Ctrl-C is pressed, and writes the synchronization report.

use crate::{
    args::Args,
    device::{Generator, Registers},
    katcp::KatcpClient,
    scpi::ScpiGenerator,
    sim::{SimulatedBoard, SimulatedGenerator, SpectrometerModel},
    sync::{SyncOutcome, Synchronizer},
};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// adcsync application.
#[derive(Debug)]
pub struct App {
    synchronizer: Backend,
    report: Option<PathBuf>,
    cancel: CancellationToken,
}

#[derive(Debug)]
enum Backend {
    Hardware(Synchronizer<KatcpClient, ScpiGenerator>),
    Simulated(Synchronizer<SimulatedBoard, SimulatedGenerator>),
}

impl App {
    /// Creates a new application.
    ///
    /// This connects to the board and to the signal generator, unless the
    /// simulation is requested.
    #[tracing::instrument(name = "App::new", level = "debug")]
    pub async fn new(args: &Args) -> Result<App> {
        let config = args.sync_config();
        config.validate().context("invalid arguments")?;
        let cancel = CancellationToken::new();
        let synchronizer = if args.simulate {
            let (board, generator) = SimulatedBoard::with_spectrometer(SpectrometerModel {
                zdok0_brams: config.zdok0_brams.clone(),
                zdok1_brams: config.zdok1_brams.clone(),
                cross_real_brams: config.cross_real_brams.clone(),
                cross_imag_brams: config.cross_imag_brams.clone(),
                address_width: config.address_width,
                power_format: config.power_format,
                cross_format: config.cross_format,
                bandwidth: config.bandwidth,
                acc_len_register: config.acc_len_register.clone(),
                delay_registers: config.delay_registers.clone(),
                skew: args.sim_skew,
                register_gain: 1.0,
                // -23 dBFS with an 8-bit ADC and 2048 channels
                amplitudes: [1000.0, 1000.0],
            });
            tracing::info!(skew = args.sim_skew, "using simulated board");
            Backend::Simulated(Synchronizer::new(board, generator, config, cancel.clone())?)
        } else {
            let timeout = Duration::try_from_secs_f64(args.timeout)
                .with_context(|| format!("invalid timeout {}", args.timeout))?;
            // clap makes these required when not simulating
            let (Some(ip), Some(generator)) = (&args.ip, &args.generator) else {
                anyhow::bail!("ROACH and generator addresses are required");
            };
            let board = KatcpClient::connect(ip, args.port, timeout).await?;
            let generator = ScpiGenerator::connect(generator, args.generator_port, timeout).await?;
            Backend::Hardware(Synchronizer::new(board, generator, config, cancel.clone())?)
        };
        Ok(App {
            synchronizer,
            report: args.report.clone(),
            cancel,
        })
    }

    /// Runs the application.
    ///
    /// An error is returned if the synchronization fails or does not converge.
    /// Cancelling with Ctrl-C is not an error.
    #[tracing::instrument(name = "App::run", level = "debug", skip_all)]
    pub async fn run(self) -> Result<()> {
        let cancel = self.cancel.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping synchronization");
                cancel.cancel();
            }
        });
        let report = self.report.as_deref();
        let outcome = match self.synchronizer {
            Backend::Hardware(sync) => synchronize(sync, report).await,
            Backend::Simulated(sync) => synchronize(sync, report).await,
        };
        ctrl_c.abort();
        match outcome? {
            SyncOutcome::Converged { iterations } => {
                tracing::info!(iterations, "synchronization finished");
                Ok(())
            }
            outcome @ SyncOutcome::NotConverged { iterations, .. } => anyhow::bail!(
                "ADCs not synchronized after {iterations} sweeps: {}",
                adcsync_json::Outcome::from(outcome)
            ),
            SyncOutcome::Cancelled => {
                tracing::warn!("synchronization cancelled");
                Ok(())
            }
        }
    }
}

async fn synchronize<R: Registers, G: Generator>(
    mut sync: Synchronizer<R, G>,
    report: Option<&Path>,
) -> Result<SyncOutcome> {
    let outcome = sync.run().await?;
    let corrections = adcsync_json::Corrections::from(sync.state());
    tracing::info!(
        outcome = %adcsync_json::Outcome::from(outcome),
        zdok0 = corrections.zdok0,
        zdok1 = corrections.zdok1,
        "synchronization outcome"
    );
    if let Some(path) = report {
        let json = serde_json::to_string_pretty(&sync.report(outcome))?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        tracing::info!(path = %path.display(), "report written");
    }
    Ok(outcome)
}
