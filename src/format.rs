//! BRAM element formats.
//!
//! This module describes how the words stored in a BRAM are laid out, so that
//! they can be converted to numbers.

use anyhow::Result;

/// Element format.
///
/// The element format indicates the width, signedness and byte order of the
/// numbers stored in a BRAM.
///
/// Formats can be parsed from the compact notation `<byte order><kind><width>`,
/// where the byte order is `>` (big-endian) or `<` (little-endian), the kind is
/// `i` (signed) or `u` (unsigned), and the width is given in bytes. The byte
/// order can be omitted (or given as `|`) for 1-byte formats.
///
/// # Examples
/// ```
/// use adcsync::format::{ElementFormat, Endianness};
/// let format: ElementFormat = ">u8".parse().unwrap();
/// assert_eq!(format, ElementFormat::U64(Endianness::Be));
/// assert_eq!(format.width(), 8);
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ElementFormat {
    /// 8-bit signed integer.
    I8,
    /// 8-bit unsigned integer.
    U8,
    /// 16-bit signed integer.
    I16(Endianness),
    /// 16-bit unsigned integer.
    U16(Endianness),
    /// 32-bit signed integer.
    I32(Endianness),
    /// 32-bit unsigned integer.
    U32(Endianness),
    /// 64-bit signed integer.
    I64(Endianness),
    /// 64-bit unsigned integer.
    U64(Endianness),
}

/// Endianness.
///
/// The endianness indicates the order of the bytes forming a multi-byte number
/// in memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Endianness {
    /// Little-endian.
    Le,
    /// Big-endian.
    Be,
}

macro_rules! decode_as {
    ($bytes:expr, $ty:ty, $endianness:expr) => {
        $bytes
            .chunks_exact(std::mem::size_of::<$ty>())
            .map(|chunk| {
                // chunks_exact guarantees the length
                let chunk: [u8; std::mem::size_of::<$ty>()] = chunk.try_into().unwrap();
                (match $endianness {
                    Endianness::Le => <$ty>::from_le_bytes(chunk),
                    Endianness::Be => <$ty>::from_be_bytes(chunk),
                }) as f64
            })
            .collect()
    };
}

macro_rules! encode_as {
    ($values:expr, $ty:ty, $endianness:expr) => {
        $values
            .iter()
            .flat_map(|&x| {
                let x = x.round() as $ty;
                match $endianness {
                    Endianness::Le => x.to_le_bytes(),
                    Endianness::Be => x.to_be_bytes(),
                }
            })
            .collect()
    };
}

impl ElementFormat {
    /// Returns the width of an element in bytes.
    pub fn width(&self) -> usize {
        match self {
            ElementFormat::I8 | ElementFormat::U8 => 1,
            ElementFormat::I16(_) | ElementFormat::U16(_) => 2,
            ElementFormat::I32(_) | ElementFormat::U32(_) => 4,
            ElementFormat::I64(_) | ElementFormat::U64(_) => 8,
        }
    }

    /// Returns `true` if the format is a signed integer.
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            ElementFormat::I8
                | ElementFormat::I16(_)
                | ElementFormat::I32(_)
                | ElementFormat::I64(_)
        )
    }

    /// Converts raw bytes to numbers.
    ///
    /// Trailing bytes that do not form a whole element are ignored.
    pub fn decode(&self, bytes: &[u8]) -> Vec<f64> {
        match *self {
            ElementFormat::I8 => bytes.iter().map(|&b| f64::from(b as i8)).collect(),
            ElementFormat::U8 => bytes.iter().map(|&b| f64::from(b)).collect(),
            ElementFormat::I16(e) => decode_as!(bytes, i16, e),
            ElementFormat::U16(e) => decode_as!(bytes, u16, e),
            ElementFormat::I32(e) => decode_as!(bytes, i32, e),
            ElementFormat::U32(e) => decode_as!(bytes, u32, e),
            ElementFormat::I64(e) => decode_as!(bytes, i64, e),
            ElementFormat::U64(e) => decode_as!(bytes, u64, e),
        }
    }

    /// Gives the smallest and largest values of the format.
    pub fn range(&self) -> (f64, f64) {
        match self {
            ElementFormat::I8 => (i8::MIN as f64, i8::MAX as f64),
            ElementFormat::U8 => (0.0, u8::MAX as f64),
            ElementFormat::I16(_) => (i16::MIN as f64, i16::MAX as f64),
            ElementFormat::U16(_) => (0.0, u16::MAX as f64),
            ElementFormat::I32(_) => (i32::MIN as f64, i32::MAX as f64),
            ElementFormat::U32(_) => (0.0, u32::MAX as f64),
            ElementFormat::I64(_) => (i64::MIN as f64, i64::MAX as f64),
            ElementFormat::U64(_) => (0.0, u64::MAX as f64),
        }
    }

    /// Converts numbers to raw bytes.
    ///
    /// Values are rounded to the nearest integer and saturate at the limits of
    /// the format. A warning is logged if any value saturates.
    pub fn encode(&self, values: &[f64]) -> Vec<u8> {
        let (min, max) = self.range();
        let overflows = values
            .iter()
            .map(|x| x.round())
            .filter(|x| !(min..=max).contains(x))
            .count();
        if overflows > 0 {
            tracing::warn!(
                format = %self,
                overflows,
                "values out of range of element format (saturated)"
            );
        }
        match *self {
            ElementFormat::I8 => values.iter().map(|&x| x.round() as i8 as u8).collect(),
            ElementFormat::U8 => values.iter().map(|&x| x.round() as u8).collect(),
            ElementFormat::I16(e) => encode_as!(values, i16, e),
            ElementFormat::U16(e) => encode_as!(values, u16, e),
            ElementFormat::I32(e) => encode_as!(values, i32, e),
            ElementFormat::U32(e) => encode_as!(values, u32, e),
            ElementFormat::I64(e) => encode_as!(values, i64, e),
            ElementFormat::U64(e) => encode_as!(values, u64, e),
        }
    }
}

/// Fixed-point format.
///
/// A fixed-point number with `bits` bits and binary point `binary_point`
/// stores the value `x` as the integer `x * 2^binary_point`. This is the format
/// used by coefficient and lookup BRAMs in FPGA designs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FixedPoint {
    bits: u32,
    binary_point: u32,
    signed: bool,
}

impl FixedPoint {
    /// Creates a fixed-point format.
    ///
    /// The number of bits must be between 1 and 64, and the binary point
    /// cannot be larger than the number of bits.
    pub fn new(bits: u32, binary_point: u32, signed: bool) -> Result<FixedPoint> {
        anyhow::ensure!(
            (1..=64).contains(&bits),
            "fixed-point width of {bits} bits not supported"
        );
        anyhow::ensure!(
            binary_point <= bits,
            "binary point {binary_point} beyond the {bits} bits of the fixed-point format"
        );
        Ok(FixedPoint {
            bits,
            binary_point,
            signed,
        })
    }

    /// Gives the number of bits.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Gives the binary point.
    pub fn binary_point(&self) -> u32 {
        self.binary_point
    }

    /// Returns `true` if the format is signed.
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Gives the smallest and largest values that the format can represent.
    pub fn range(&self) -> (f64, f64) {
        let scale = f64::from(self.binary_point).exp2();
        if self.signed {
            let half = f64::from(self.bits - 1).exp2();
            (-half / scale, (half - 1.0) / scale)
        } else {
            (0.0, (f64::from(self.bits).exp2() - 1.0) / scale)
        }
    }

    /// Gives the element format that holds the fixed-point numbers.
    ///
    /// This is the smallest integer format at least as wide as the
    /// fixed-point format.
    pub fn element_format(&self, endianness: Endianness) -> ElementFormat {
        match (self.bits.div_ceil(8), self.signed) {
            (1, true) => ElementFormat::I8,
            (1, false) => ElementFormat::U8,
            (2, true) => ElementFormat::I16(endianness),
            (2, false) => ElementFormat::U16(endianness),
            (3 | 4, true) => ElementFormat::I32(endianness),
            (3 | 4, false) => ElementFormat::U32(endianness),
            (_, true) => ElementFormat::I64(endianness),
            (_, false) => ElementFormat::U64(endianness),
        }
    }

    /// Counts the values that are out of range of the format.
    ///
    /// A warning is logged for the smallest and for the largest values if they
    /// are out of range.
    pub fn check_overflow(&self, values: &[f64]) -> usize {
        let (min, max) = self.range();
        let lowest = values.iter().copied().fold(f64::INFINITY, f64::min);
        let highest = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if highest > max {
            tracing::warn!(max, highest, format = %self, "maximum fixed-point value exceeded");
        }
        if lowest < min {
            tracing::warn!(min, lowest, format = %self, "minimum fixed-point value exceeded");
        }
        values.iter().filter(|&&x| x < min || x > max).count()
    }

    /// Converts numbers to fixed point and then to raw bytes.
    ///
    /// Values are multiplied by `2^binary_point`, rounded, and encoded with
    /// [`FixedPoint::element_format`]. Values out of range are warned about by
    /// [`FixedPoint::check_overflow`] and saturate.
    pub fn encode(&self, values: &[f64], endianness: Endianness) -> Vec<u8> {
        self.check_overflow(values);
        let (min, max) = self.range();
        let scale = f64::from(self.binary_point).exp2();
        let scaled: Vec<f64> = values
            .iter()
            .map(|&x| (x.clamp(min, max) * scale).round())
            .collect();
        self.element_format(endianness).encode(&scaled)
    }
}

impl std::fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let kind = if self.signed { "Fix" } else { "UFix" };
        write!(f, "{kind}_{}_{}", self.bits, self.binary_point)
    }
}

impl std::str::FromStr for ElementFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<ElementFormat> {
        let (endianness, rest) = match s.chars().next() {
            Some('>') => (Some(Endianness::Be), &s[1..]),
            Some('<') => (Some(Endianness::Le), &s[1..]),
            Some('|') => (None, &s[1..]),
            _ => (None, s),
        };
        let multibyte = |e: Option<Endianness>| {
            e.ok_or_else(|| anyhow::anyhow!("element format {s} needs a byte order (< or >)"))
        };
        Ok(match rest {
            "i1" => ElementFormat::I8,
            "u1" => ElementFormat::U8,
            "i2" => ElementFormat::I16(multibyte(endianness)?),
            "u2" => ElementFormat::U16(multibyte(endianness)?),
            "i4" => ElementFormat::I32(multibyte(endianness)?),
            "u4" => ElementFormat::U32(multibyte(endianness)?),
            "i8" => ElementFormat::I64(multibyte(endianness)?),
            "u8" => ElementFormat::U64(multibyte(endianness)?),
            _ => anyhow::bail!("unsupported element format {s}"),
        })
    }
}

impl std::fmt::Display for ElementFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let (kind, endianness) = match self {
            ElementFormat::I8 => ("i", None),
            ElementFormat::U8 => ("u", None),
            ElementFormat::I16(e)
            | ElementFormat::I32(e)
            | ElementFormat::I64(e) => ("i", Some(e)),
            ElementFormat::U16(e)
            | ElementFormat::U32(e)
            | ElementFormat::U64(e) => ("u", Some(e)),
        };
        let endianness = match endianness {
            Some(Endianness::Le) => "<",
            Some(Endianness::Be) => ">",
            None => "|",
        };
        write!(f, "{endianness}{kind}{}", self.width())
    }
}
