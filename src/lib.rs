//! adcsync synchronizes the two ADC5G converters of a ROACH2 spectrometer. It
//! sweeps a test tone from a signal generator across the band, measures the
//! phase of the cross spectrum between both ADCs, estimates their relative
//! delay from the phase slope, and corrects it through the ADC delay registers
//! until both ADCs sample at the same instant. Board registers and BRAMs are
//! accessed through KATCP, and the generator through SCPI. A simulated board
//! allows running everything without hardware.

#![warn(missing_docs)]

pub mod app;
pub mod args;
pub mod delay;
pub mod device;
pub mod error;
pub mod format;
pub mod katcp;
pub mod lanes;
pub mod scpi;
pub mod sim;
pub mod spectrum;
pub mod sync;
