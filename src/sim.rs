//! Simulated board and signal generator.
//!
//! This module contains in-memory implementations of [`Registers`] and
//! [`Generator`]. [`SimulatedBoard`] stores BRAMs and software registers in RAM
//! and, optionally, emulates a two-input spectrometer whose second ADC is
//! skewed with respect to the first one. The spectrometer is fed by the tone of
//! a [`SimulatedGenerator`], so that the whole synchronization loop can run
//! without hardware.

use crate::device::{Generator, Registers};
use crate::format::ElementFormat;
use crate::lanes::deinterleave;
use anyhow::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

/// Simulated FPGA board.
///
/// Devices are created by writing to them, or with
/// [`SimulatedBoard::set_memory`]. Reading a device that does not exist is an
/// error, as it is on a real board. Reads that extend past the end of a device
/// return only the bytes that exist.
#[derive(Debug, Default)]
pub struct SimulatedBoard {
    memory: HashMap<String, Vec<u8>>,
    spectrometer: Option<SimulatedSpectrometer>,
}

/// Simulated signal generator.
///
/// The generator shares its tone with the [`SimulatedBoard`] it was created
/// for by [`SimulatedBoard::with_spectrometer`].
#[derive(Debug, Clone)]
pub struct SimulatedGenerator {
    tone: Arc<Mutex<Tone>>,
}

#[derive(Debug, Clone, Default)]
struct Tone {
    frequency: f64,
    power_dbm: f64,
    enabled: bool,
}

/// Layout and behaviour of a simulated spectrometer.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrometerModel {
    /// BRAMs holding the ZDOK0 power spectrum.
    pub zdok0_brams: Vec<String>,
    /// BRAMs holding the ZDOK1 power spectrum.
    pub zdok1_brams: Vec<String>,
    /// BRAMs holding the real part of the cross spectrum.
    pub cross_real_brams: Vec<String>,
    /// BRAMs holding the imaginary part of the cross spectrum.
    pub cross_imag_brams: Vec<String>,
    /// BRAM address width in bits.
    pub address_width: u32,
    /// Format of the power spectra.
    pub power_format: ElementFormat,
    /// Format of the cross spectrum.
    pub cross_format: ElementFormat,
    /// Spectrometer bandwidth in Hz.
    pub bandwidth: f64,
    /// Register holding the accumulation length.
    pub acc_len_register: String,
    /// Delay registers of ZDOK0 and ZDOK1.
    pub delay_registers: [String; 2],
    /// Delay of ZDOK1 with respect to ZDOK0 in samples, before corrections.
    pub skew: f64,
    /// Samples of delay applied per unit written to a delay register.
    pub register_gain: f64,
    /// Amplitude of the tone at each ADC, per spectrum.
    pub amplitudes: [f64; 2],
}

#[derive(Debug)]
struct SimulatedSpectrometer {
    model: SpectrometerModel,
    tone: Arc<Mutex<Tone>>,
}

impl SimulatedBoard {
    /// Creates an empty simulated board.
    pub fn new() -> SimulatedBoard {
        SimulatedBoard::default()
    }

    /// Creates a simulated board with a spectrometer.
    ///
    /// Returns the board and the generator that feeds its spectrometer. The
    /// accumulation length register and the delay registers of the model are
    /// created and set to zero.
    pub fn with_spectrometer(model: SpectrometerModel) -> (SimulatedBoard, SimulatedGenerator) {
        let tone = Arc::new(Mutex::new(Tone::default()));
        let mut board = SimulatedBoard::new();
        for register in model.delay_registers.iter().chain([&model.acc_len_register]) {
            board.set_memory(register, vec![0; 4]);
        }
        board.spectrometer = Some(SimulatedSpectrometer {
            model,
            tone: Arc::clone(&tone),
        });
        (board, SimulatedGenerator { tone })
    }

    /// Sets the contents of a device.
    pub fn set_memory(&mut self, name: &str, data: Vec<u8>) {
        self.memory.insert(name.to_string(), data);
    }

    /// Gives the contents of a device.
    pub fn memory(&self, name: &str) -> Option<&[u8]> {
        self.memory.get(name).map(Vec::as_slice)
    }

    fn register(&self, name: &str) -> Result<i32> {
        let data = self
            .memory
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("no device named {name}"))?;
        anyhow::ensure!(data.len() >= 4, "device {name} is not a register");
        Ok(i32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    fn spectrometer_bram(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(spectrometer) = &self.spectrometer else {
            return Ok(None);
        };
        let model = &spectrometer.model;
        let lists = [
            (&model.zdok0_brams, Product::Zdok0),
            (&model.zdok1_brams, Product::Zdok1),
            (&model.cross_real_brams, Product::CrossReal),
            (&model.cross_imag_brams, Product::CrossImag),
        ];
        let Some((brams, lane, product)) = lists.iter().find_map(|(brams, product)| {
            brams
                .iter()
                .position(|b| b == name)
                .map(|lane| (brams, lane, *product))
        }) else {
            return Ok(None);
        };
        let acc_len = f64::from(self.register(&model.acc_len_register)?.max(1));
        let delays = [
            f64::from(self.register(&model.delay_registers[0])?),
            f64::from(self.register(&model.delay_registers[1])?),
        ];
        let spectrum = spectrometer.spectrum(product, acc_len, delays);
        let lanes = deinterleave(&spectrum, brams.len())?;
        let format = match product {
            Product::Zdok0 | Product::Zdok1 => model.power_format,
            Product::CrossReal | Product::CrossImag => model.cross_format,
        };
        Ok(Some(format.encode(&lanes[lane])))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Product {
    Zdok0,
    Zdok1,
    CrossReal,
    CrossImag,
}

impl SimulatedSpectrometer {
    fn spectrum(&self, product: Product, acc_len: f64, delays: [f64; 2]) -> Vec<f64> {
        let model = &self.model;
        let num_channels = model.zdok0_brams.len() << model.address_width;
        let mut spectrum = vec![0.0; num_channels];
        let tone = self.tone.lock().unwrap().clone();
        if !tone.enabled {
            return spectrum;
        }
        let channel = (tone.frequency / model.bandwidth * num_channels as f64).round();
        if !(0.0..num_channels as f64).contains(&channel) {
            return spectrum;
        }
        // delay of ZDOK1 with respect to ZDOK0 after corrections
        let lag = model.skew + model.register_gain * (delays[1] - delays[0]);
        let samp_rate = 2.0 * model.bandwidth;
        let phase = -2.0 * PI * tone.frequency * lag / samp_rate;
        let [a, b] = model.amplitudes;
        // The cross spectrum is A * conj(B)
        spectrum[channel as usize] = acc_len
            * match product {
                Product::Zdok0 => a * a,
                Product::Zdok1 => b * b,
                Product::CrossReal => a * b * phase.cos(),
                Product::CrossImag => -a * b * phase.sin(),
            };
        spectrum
    }
}

impl Registers for SimulatedBoard {
    async fn read_bytes(&mut self, name: &str, len: usize, offset: usize) -> Result<Bytes> {
        let data = match self.spectrometer_bram(name)? {
            Some(data) => data,
            None => self
                .memory
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("no device named {name}"))?
                .clone(),
        };
        let start = offset.min(data.len());
        let end = offset.saturating_add(len).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write_bytes(&mut self, name: &str, data: &[u8], offset: usize) -> Result<()> {
        let memory = self.memory.entry(name.to_string()).or_default();
        if memory.len() < offset + data.len() {
            memory.resize(offset + data.len(), 0);
        }
        memory[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn write_int(&mut self, name: &str, value: i32) -> Result<()> {
        self.write_bytes(name, &value.to_be_bytes(), 0).await
    }

    async fn read_int(&mut self, name: &str) -> Result<i32> {
        self.register(name)
    }
}

impl SimulatedGenerator {
    /// Creates a generator that is not connected to any board.
    pub fn new() -> SimulatedGenerator {
        SimulatedGenerator {
            tone: Arc::new(Mutex::new(Tone::default())),
        }
    }

    /// Gives the current output frequency in Hz.
    pub fn frequency(&self) -> f64 {
        self.tone.lock().unwrap().frequency
    }

    /// Gives the current output power in dBm.
    pub fn power_dbm(&self) -> f64 {
        self.tone.lock().unwrap().power_dbm
    }

    /// Returns `true` if the output is enabled.
    pub fn output_enabled(&self) -> bool {
        self.tone.lock().unwrap().enabled
    }
}

impl Default for SimulatedGenerator {
    fn default() -> SimulatedGenerator {
        SimulatedGenerator::new()
    }
}

impl Generator for SimulatedGenerator {
    async fn set_frequency_hz(&mut self, frequency: f64) -> Result<()> {
        self.tone.lock().unwrap().frequency = frequency;
        Ok(())
    }

    async fn set_power_dbm(&mut self, power: f64) -> Result<()> {
        self.tone.lock().unwrap().power_dbm = power;
        Ok(())
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<()> {
        self.tone.lock().unwrap().enabled = enabled;
        Ok(())
    }
}
