//! adcsync-json contains the JSON schemas of the reports written by adcsync.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};

/// Synchronization report JSON schema.
///
/// This is the document written by `adcsync --report`. It contains the
/// settings of the sweep, every iteration of the synchronization loop and the
/// final outcome.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// Time at which the synchronization finished, in RFC 3339 format.
    pub datetime: String,
    /// Final outcome of the synchronization.
    pub outcome: Outcome,
    /// Sweep settings.
    pub sweep: Sweep,
    /// Iterations of the synchronization loop, in order.
    pub iterations: Vec<Iteration>,
    /// Total correction written to the delay registers.
    pub corrections: Corrections,
}

/// Sweep settings JSON schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Sweep {
    /// First test channel.
    pub start_channel: u32,
    /// Test channel at which the sweep stops (not included).
    pub stop_channel: u32,
    /// Distance between consecutive test channels.
    pub channel_step: u32,
    /// Number of spectral channels.
    pub num_channels: u32,
    /// Spectrometer bandwidth in Hz.
    pub bandwidth: f64,
    /// ADC sampling frequency in samples per second.
    pub sampling_frequency: f64,
    /// Time waited after each generator change, in seconds.
    pub settle_time: f64,
}

/// Synchronization outcome.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Outcome {
    /// The measured delay reached zero samples.
    Converged,
    /// The maximum number of sweeps was exhausted.
    IterationLimit,
    /// Consecutive corrections cancelled each other.
    Oscillating,
    /// The synchronization was cancelled by the user.
    Cancelled,
}

/// ADC input.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Channel {
    /// ADC connected to ZDOK0. This is the reference input.
    Zdok0,
    /// ADC connected to ZDOK1.
    Zdok1,
}

macro_rules! impl_str_conv {
    ($ty:ty, $($s:expr => $v:ident),*) => {
        impl std::str::FromStr for $ty {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, ()> {
                Ok(match s {
                    $(
                        $s => <$ty>::$v,
                    )*
                        _ => return Err(()),
                })
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                write!(f, "{}", match self {
                    $(
                        <$ty>::$v => $s,
                    )*
                })
            }
        }
    }
}

impl_str_conv!(Outcome,
               "converged" => Converged,
               "iteration limit reached" => IterationLimit,
               "oscillating" => Oscillating,
               "cancelled" => Cancelled);

impl_str_conv!(Channel,
               "ZDOK0" => Zdok0,
               "ZDOK1" => Zdok1);

/// Synchronization loop iteration JSON schema.
///
/// An iteration corresponds to one sweep and the delay estimated from it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Iteration {
    /// Iteration number, starting at 1.
    pub index: u32,
    /// Estimated delay in samples.
    pub delay_samples: i64,
    /// Fitted phase slope in radians per Hz.
    pub slope: f64,
    /// Fitted phase intercept in radians.
    pub intercept: f64,
    /// Channel whose delay register was corrected, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected: Option<Channel>,
    /// Measurements of the sweep.
    pub points: Vec<PhasePoint>,
}

/// Phase ratio measurement JSON schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PhasePoint {
    /// Test channel.
    pub channel: u32,
    /// Test tone frequency in Hz.
    pub frequency: f64,
    /// Magnitude ratio ZDOK1 / ZDOK0 (linear).
    pub magnitude_ratio: f64,
    /// Phase difference ZDOK1 - ZDOK0 in degrees.
    pub phase_difference: f64,
    /// ZDOK0 power at the test channel in dBFS.
    pub power_zdok0: f64,
    /// ZDOK1 power at the test channel in dBFS.
    pub power_zdok1: f64,
}

/// Delay register corrections JSON schema.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Corrections {
    /// Samples added to the ZDOK0 delay register.
    pub zdok0: i64,
    /// Samples added to the ZDOK1 delay register.
    pub zdok1: i64,
}
