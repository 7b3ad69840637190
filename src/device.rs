//! Board and instrument interfaces.
//!
//! This module contains the traits through which the synchronization loop
//! talks to the hardware. The loop owns one [`Registers`] and one
//! [`Generator`] for the whole run, and every call completes (or fails) before
//! the next one is made.
//!
//! Implementations are given in [`katcp`](crate::katcp) (ROACH boards),
//! [`scpi`](crate::scpi) (signal generators) and [`sim`](crate::sim)
//! (in-memory simulation).

use anyhow::Result;
use bytes::Bytes;

/// FPGA register and BRAM access.
///
/// Registers and BRAMs are addressed by the name given to them in the FPGA
/// design. Offsets and lengths are in bytes.
#[allow(async_fn_in_trait)]
pub trait Registers {
    /// Reads `len` bytes from the device `name` starting at `offset`.
    async fn read_bytes(&mut self, name: &str, len: usize, offset: usize) -> Result<Bytes>;

    /// Writes `data` into the device `name` starting at `offset`.
    async fn write_bytes(&mut self, name: &str, data: &[u8], offset: usize) -> Result<()>;

    /// Writes a 32-bit software register.
    async fn write_int(&mut self, name: &str, value: i32) -> Result<()>;

    /// Reads a 32-bit software register.
    async fn read_int(&mut self, name: &str) -> Result<i32>;
}

/// Signal generator.
///
/// Each setter returns only once the instrument has confirmed that the setting
/// is in effect.
#[allow(async_fn_in_trait)]
pub trait Generator {
    /// Sets the output frequency in Hz.
    async fn set_frequency_hz(&mut self, frequency: f64) -> Result<()>;

    /// Sets the output power in dBm.
    async fn set_power_dbm(&mut self, power: f64) -> Result<()>;

    /// Enables or disables the RF output.
    async fn set_output_enabled(&mut self, enabled: bool) -> Result<()>;
}
