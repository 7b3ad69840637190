//! adcsync CLI arguments.
//!
//! This module contains the definition of the CLI arguments for the adcsync
//! application.

use crate::format::ElementFormat;
use crate::sync::SyncConfig;
use clap::Parser;
use std::path::PathBuf;

/// adcsync CLI arguments.
#[derive(Parser, Debug, Clone, PartialEq)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// ROACH IP address or hostname
    #[clap(long, short, required_unless_present = "simulate")]
    pub ip: Option<String>,
    /// ROACH KATCP port
    #[clap(long, default_value_t = crate::katcp::DEFAULT_PORT)]
    pub port: u16,
    /// Signal generator IP address or hostname
    #[clap(long, short, required_unless_present = "simulate")]
    pub generator: Option<String>,
    /// Signal generator SCPI port
    #[clap(long, default_value_t = crate::scpi::DEFAULT_PORT)]
    pub generator_port: u16,
    /// Signal generator power in dBm (left unchanged if not given)
    #[clap(long, allow_negative_numbers = true)]
    pub generator_power: Option<f64>,
    /// Timeout for board and generator requests in seconds
    #[clap(long, default_value_t = 10.0)]
    pub timeout: f64,
    /// Run against a simulated board and generator
    #[clap(long)]
    pub simulate: bool,
    /// Delay of ZDOK1 with respect to ZDOK0 in the simulation, in samples
    #[clap(long, default_value_t = 3.0, allow_negative_numbers = true)]
    pub sim_skew: f64,
    /// BRAM names for the ZDOK0 spectrum
    #[clap(long, num_args = 1.., default_values = ["dout0_0", "dout0_1", "dout0_2", "dout0_3"])]
    pub zdok0_brams: Vec<String>,
    /// BRAM names for the ZDOK1 spectrum
    #[clap(long, num_args = 1.., default_values = ["dout1_0", "dout1_1", "dout1_2", "dout1_3"])]
    pub zdok1_brams: Vec<String>,
    /// BRAM names for the cross spectrum, real part
    #[clap(long, num_args = 1.., default_values = ["dout01_re0", "dout01_re1", "dout01_re2", "dout01_re3"])]
    pub cross_brams_real: Vec<String>,
    /// BRAM names for the cross spectrum, imaginary part
    #[clap(long, num_args = 1.., default_values = ["dout01_im0", "dout01_im1", "dout01_im2", "dout01_im3"])]
    pub cross_brams_imag: Vec<String>,
    /// Width of the BRAM address in bits
    #[clap(long, default_value_t = 9)]
    pub addr_width: u32,
    /// Width of the BRAM data in bits
    #[clap(long, default_value_t = 64)]
    pub data_width: u32,
    /// Element format of the power spectra
    #[clap(long, default_value = ">u8")]
    pub power_format: ElementFormat,
    /// Element format of the cross spectrum
    #[clap(long, default_value = ">i8")]
    pub cross_format: ElementFormat,
    /// Spectrometer bandwidth in MHz
    #[clap(long, default_value_t = 1080.0)]
    pub bandwidth: f64,
    /// Number of bits of the ADCs
    #[clap(long, default_value_t = 8)]
    pub bits: u32,
    /// Counter reset register name
    #[clap(long, default_value = "cnt_rst")]
    pub count_reg: String,
    /// Accumulation length register name
    #[clap(long, default_value = "acc_len")]
    pub acc_reg: String,
    /// Accumulation length
    #[clap(long, default_value_t = 1 << 16)]
    pub acc_len: u32,
    /// First channel of the synchronization sweep
    #[clap(long, default_value_t = 1)]
    pub start_channel: usize,
    /// Channel at which the synchronization sweep stops (not included)
    #[clap(long, default_value_t = 2047)]
    pub stop_channel: usize,
    /// Channel step of the synchronization sweep
    #[clap(long, default_value_t = 8)]
    pub channel_step: usize,
    /// Delay register name of the ZDOK0 ADC
    #[clap(long, default_value = "adc0_delay")]
    pub zdok0_delay_reg: String,
    /// Delay register name of the ZDOK1 ADC
    #[clap(long, default_value = "adc1_delay")]
    pub zdok1_delay_reg: String,
    /// Maximum number of sweeps before giving up
    #[clap(long, default_value_t = 10)]
    pub max_iterations: u32,
    /// Path to write a JSON report of the synchronization to
    #[clap(long)]
    pub report: Option<PathBuf>,
}

impl Args {
    /// Builds the synchronization settings given by the arguments.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            zdok0_brams: self.zdok0_brams.clone(),
            zdok1_brams: self.zdok1_brams.clone(),
            cross_real_brams: self.cross_brams_real.clone(),
            cross_imag_brams: self.cross_brams_imag.clone(),
            address_width: self.addr_width,
            data_width: self.data_width,
            power_format: self.power_format,
            cross_format: self.cross_format,
            bandwidth: self.bandwidth * 1e6,
            adc_bits: self.bits,
            count_register: self.count_reg.clone(),
            acc_len_register: self.acc_reg.clone(),
            acc_len: self.acc_len,
            delay_registers: [self.zdok0_delay_reg.clone(), self.zdok1_delay_reg.clone()],
            start_channel: self.start_channel,
            stop_channel: self.stop_channel,
            channel_step: self.channel_step,
            generator_power: self.generator_power,
            max_iterations: self.max_iterations,
        }
    }
}
