//! BRAM lane readout.
//!
//! Spectrometer designs store their output in several BRAMs ("lanes") that are
//! written in parallel, so that BRAM `j` out of `N` holds the samples `j`,
//! `j + N`, `j + 2N`, ... of the logical sequence. This module reads lanes from
//! the board and converts between the per-lane layout and the logical order.

use crate::device::Registers;
use crate::error::DataShapeError;
use crate::format::{ElementFormat, Endianness, FixedPoint};
use anyhow::{Context, Result};
use bytes::Bytes;

/// Contents of one BRAM.
///
/// A lane buffer owns the raw bytes read from a BRAM together with the format
/// needed to interpret them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneBuffer {
    data: Bytes,
    format: ElementFormat,
    address_width: u32,
}

impl LaneBuffer {
    /// Creates a lane buffer from raw bytes.
    pub fn new(data: Bytes, format: ElementFormat, address_width: u32) -> LaneBuffer {
        LaneBuffer {
            data,
            format,
            address_width,
        }
    }

    /// Gives the raw bytes of the buffer.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Gives the element format of the buffer.
    pub fn format(&self) -> ElementFormat {
        self.format
    }

    /// Gives the BRAM address width in bits.
    pub fn address_width(&self) -> u32 {
        self.address_width
    }

    /// Gives the number of elements in the buffer.
    pub fn len(&self) -> usize {
        self.data.len() / self.format.width()
    }

    /// Returns `true` if the buffer contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts the buffer contents to numbers.
    pub fn samples(&self) -> Vec<f64> {
        self.format.decode(&self.data)
    }
}

/// Gives the number of bytes stored in a BRAM.
///
/// The BRAM has `2^address_width` words of `data_width` bits. An error is
/// returned if the words cannot be split into whole elements of `format`, or
/// if the size does not fit in a `usize`.
pub fn bram_size(
    address_width: u32,
    data_width: u32,
    format: ElementFormat,
) -> Result<usize, DataShapeError> {
    let word_bytes = (data_width / 8) as usize;
    if data_width % 8 != 0 || word_bytes == 0 || word_bytes % format.width() != 0 {
        return Err(DataShapeError::DataWidth {
            bits: data_width,
            element_bytes: format.width(),
        });
    }
    1usize
        .checked_shl(address_width)
        .and_then(|words| words.checked_mul(word_bytes))
        .ok_or(DataShapeError::AddressWidth {
            bits: address_width,
        })
}

/// Reads a BRAM.
///
/// Reads the whole BRAM `name`, which has `2^address_width` words of
/// `data_width` bits. Communication errors are returned as is, and are not
/// retried.
pub async fn read_lane<R: Registers>(
    registers: &mut R,
    name: &str,
    address_width: u32,
    data_width: u32,
    format: ElementFormat,
) -> Result<LaneBuffer> {
    let size = bram_size(address_width, data_width, format)?;
    let data = registers
        .read_bytes(name, size, 0)
        .await
        .with_context(|| format!("failed to read BRAM {name}"))?;
    if data.len() != size {
        return Err(DataShapeError::ByteCount {
            expected: size,
            found: data.len(),
        })
        .with_context(|| format!("wrong size reading BRAM {name}"));
    }
    tracing::trace!(name, size, %format, "read BRAM");
    Ok(LaneBuffer::new(data, format, address_width))
}

/// Interleaves lanes into a single sequence.
///
/// Element `i` of the result is element `i / N` of lane `i % N`, where `N` is
/// the number of lanes. All the lanes must have the same length.
///
/// # Examples
/// ```
/// use adcsync::lanes::interleave;
/// let lanes = [vec![1, 3, 5], vec![2, 4, 6]];
/// assert_eq!(interleave(&lanes).unwrap(), vec![1, 2, 3, 4, 5, 6]);
/// ```
pub fn interleave<T: Clone>(lanes: &[Vec<T>]) -> Result<Vec<T>, DataShapeError> {
    let Some(first) = lanes.first() else {
        return Ok(Vec::new());
    };
    let lane_len = first.len();
    if let Some((lane, found)) = lanes
        .iter()
        .map(Vec::len)
        .enumerate()
        .find(|&(_, len)| len != lane_len)
    {
        return Err(DataShapeError::UnequalLanes {
            lane,
            expected: lane_len,
            found,
        });
    }
    Ok((0..lane_len)
        .flat_map(|n| lanes.iter().map(move |lane| lane[n].clone()))
        .collect())
}

/// Deinterleaves a sequence into `factor` lanes.
///
/// This is the inverse of [`interleave`]: lane `j` receives the elements `j`,
/// `j + factor`, `j + 2 * factor`, ... An error is returned if the length of
/// `data` is not a multiple of `factor`.
pub fn deinterleave<T: Clone>(data: &[T], factor: usize) -> Result<Vec<Vec<T>>, DataShapeError> {
    if factor == 0 {
        return Err(DataShapeError::ZeroFactor);
    }
    if data.len() % factor != 0 {
        return Err(DataShapeError::Indivisible {
            len: data.len(),
            factor,
        });
    }
    Ok((0..factor)
        .map(|j| data.iter().skip(j).step_by(factor).cloned().collect())
        .collect())
}

/// Reads several BRAMs and interleaves their contents.
///
/// This gives the data in the order of a typical multi-BRAM spectrometer, with
/// the first BRAM holding channel 0.
pub async fn read_interleaved<R: Registers>(
    registers: &mut R,
    names: &[String],
    address_width: u32,
    data_width: u32,
    format: ElementFormat,
) -> Result<Vec<f64>> {
    let mut lanes = Vec::with_capacity(names.len());
    for name in names {
        let lane = read_lane(registers, name, address_width, data_width, format).await?;
        lanes.push(lane.samples());
    }
    Ok(interleave(&lanes)?)
}

/// Reads a BRAM and deinterleaves its contents.
///
/// This is used when independent data, such as several spectra, is stored
/// interleaved in the same BRAM. The BRAM contents are split into `factor`
/// sequences.
pub async fn read_deinterleaved<R: Registers>(
    registers: &mut R,
    name: &str,
    factor: usize,
    address_width: u32,
    data_width: u32,
    format: ElementFormat,
) -> Result<Vec<Vec<f64>>> {
    let lane = read_lane(registers, name, address_width, data_width, format).await?;
    Ok(deinterleave(&lane.samples(), factor)?)
}

/// Deinterleaves a sequence and writes it into several BRAMs.
///
/// The sequence is split in as many lanes as BRAMs are given, and each lane
/// is encoded with `format` and written at the beginning of its BRAM.
pub async fn write_interleaved<R: Registers>(
    registers: &mut R,
    names: &[String],
    data: &[f64],
    format: ElementFormat,
) -> Result<()> {
    let lanes = deinterleave(data, names.len())?;
    for (name, lane) in names.iter().zip(lanes) {
        registers
            .write_bytes(name, &format.encode(&lane), 0)
            .await
            .with_context(|| format!("failed to write BRAM {name}"))?;
    }
    Ok(())
}

/// Converts a sequence to fixed point and writes it into several BRAMs.
///
/// This is like [`write_interleaved`], but the values are first converted to
/// the fixed-point format `fixed` with [`FixedPoint::encode`], using big-endian
/// byte order as the FPGA does. Values that overflow the format are warned
/// about and saturate.
pub async fn write_interleaved_fixed<R: Registers>(
    registers: &mut R,
    names: &[String],
    data: &[f64],
    fixed: FixedPoint,
) -> Result<()> {
    let lanes = deinterleave(data, names.len())?;
    for (name, lane) in names.iter().zip(lanes) {
        registers
            .write_bytes(name, &fixed.encode(&lane, Endianness::Be), 0)
            .await
            .with_context(|| format!("failed to write BRAM {name}"))?;
    }
    tracing::debug!(lanes = names.len(), %fixed, "wrote fixed-point data");
    Ok(())
}
