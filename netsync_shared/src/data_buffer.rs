//! Typed bit codec over a [`BitArray`].
//!
//! A `DataBuffer` is a cursor over a bit array with a typed, compressed
//! write/read API. Every type can be stored at one of four compression
//! levels; the bit cost is fixed and known up front (except the dynamic
//! sub-buffer), which is what makes skip/size accounting possible without
//! decoding.
//!
//! All encodings are little-endian and bit-exact across platforms: integers
//! are clamped then truncated two's-complement, reals are split via `frexp`
//! into sign/mantissa/exponent and re-assembled with `ldexp`, unit reals are
//! fixed-point.

use crate::bit_array::BitArray;
use crate::math::{self, Vec2, Vec3};
use tracing::error;

/// Compression level for the stored data.
///
/// Depending on the data type and the level used, the amount of bits used
/// and the loss change:
///
/// | Type | L0 | L1 | L2 | L3 |
/// |---|---|---|---|---|
/// | bool | 1 | 1 | 1 | 1 |
/// | int / uint | 64 | 32 | 16 | 8 |
/// | real | 64 | 32 | 16 | 8 |
/// | positive unit real | 10 | 8 | 6 | 4 |
/// | unit real | 11 | 9 | 7 | 5 |
/// | vector2 | 2×real | 2×real | 2×real | 2×real |
/// | normalized vector2 | 12 | 11 | 10 | 9 |
/// | vector3 | 3×real | 3×real | 3×real | 3×real |
/// | normalized vector3 | 3×unit | 3×unit | 3×unit | 3×unit |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompressionLevel {
    Level0,
    Level1,
    Level2,
    Level3,
}

pub use CompressionLevel::{Level0, Level1, Level2, Level3};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Read,
}

/// Cursor + mode + failed-flag over an owned [`BitArray`].
///
/// Invariant: `bit_offset <= metadata_size + bit_size <= backing bits`.
/// After a failed decode the failed flag latches true and every subsequent
/// read returns a zero-initialized value.
#[derive(Debug, Clone)]
pub struct DataBuffer {
    metadata_size: u32,
    bit_offset: u32,
    bit_size: u32,
    mode: Mode,
    buffer: BitArray,
    buffer_failed: bool,
}

impl Default for DataBuffer {
    fn default() -> Self {
        Self {
            metadata_size: 0,
            bit_offset: 0,
            bit_size: 0,
            mode: Mode::Write,
            buffer: BitArray::new(),
            buffer_failed: false,
        }
    }
}

impl DataBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing bit array, ready for reading.
    pub fn from_bit_array(buffer: BitArray) -> Self {
        Self {
            metadata_size: 0,
            bit_offset: 0,
            bit_size: buffer.size_in_bits(),
            mode: Mode::Read,
            buffer,
            buffer_failed: false,
        }
    }

    /// Wraps raw bytes, ready for reading.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::from_bit_array(BitArray::from_bytes(bytes))
    }

    pub fn buffer(&self) -> &BitArray {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut BitArray {
        &mut self.buffer
    }

    pub fn begin_write(&mut self, metadata_size: u32) {
        self.metadata_size = metadata_size;
        self.bit_size = 0;
        self.bit_offset = 0;
        self.mode = Mode::Write;
        self.buffer_failed = false;
    }

    pub fn begin_read(&mut self) {
        self.bit_offset = 0;
        self.mode = Mode::Read;
        self.buffer_failed = false;
    }

    /// Trims the backing storage down to `metadata_size + bit_size`.
    pub fn dry(&mut self) {
        self.buffer.resize_in_bits(self.metadata_size + self.bit_size);
    }

    /// Moves the cursor. Seeking past the end is refused.
    pub fn seek(&mut self, bits: u32) {
        if bits > self.metadata_size + self.bit_size {
            error!(bits, total = self.total_size(), "seek out of range");
            return;
        }
        self.bit_offset = bits;
    }

    /// Sets the metadata size and the bit size, without touching the storage.
    pub fn shrink_to(&mut self, metadata_bit_size: u32, bit_size: u32) {
        if self.buffer.size_in_bits() < metadata_bit_size + bit_size {
            error!(
                backing = self.buffer.size_in_bits(),
                requested = metadata_bit_size + bit_size,
                "shrink_to beyond the backing buffer"
            );
            return;
        }
        self.metadata_size = metadata_bit_size;
        self.bit_size = bit_size;
    }

    pub fn metadata_size(&self) -> u32 {
        self.metadata_size
    }

    /// Buffer size in bits, metadata excluded.
    pub fn size(&self) -> u32 {
        self.bit_size
    }

    pub fn total_size(&self) -> u32 {
        self.bit_size + self.metadata_size
    }

    pub fn bit_offset(&self) -> u32 {
        self.bit_offset
    }

    pub fn is_buffer_failed(&self) -> bool {
        self.buffer_failed
    }

    /// Advances the cursor by `bits` without reading.
    pub fn skip(&mut self, bits: u32) {
        if self.metadata_size + self.bit_size < self.bit_offset + bits {
            self.buffer_failed = true;
            return;
        }
        self.bit_offset += bits;
    }

    /// Puts all the bytes to 0.
    pub fn zero(&mut self) {
        self.buffer.zero();
    }

    fn ensure_write(&self) -> bool {
        if self.mode != Mode::Write {
            debug_assert!(false, "write on a read-mode buffer");
            error!("write on a read-mode buffer, ignored");
            return false;
        }
        true
    }

    fn ensure_read(&self) -> bool {
        if self.mode != Mode::Read {
            debug_assert!(false, "read on a write-mode buffer");
            error!("read on a write-mode buffer, ignored");
            return false;
        }
        true
    }

    fn make_room_in_bits(&mut self, dim: u32) {
        let array_min_dim = self.bit_offset + dim;
        if array_min_dim > self.buffer.size_in_bits() {
            self.buffer.resize_in_bits(array_min_dim);
        }
        if array_min_dim > self.metadata_size {
            let new_bit_size = array_min_dim - self.metadata_size;
            if new_bit_size > self.bit_size {
                self.bit_size = new_bit_size;
            }
        }
    }

    fn store(&mut self, value: u64, bits: u32) {
        if !self.buffer.store_bits(self.bit_offset, value, bits) {
            self.buffer_failed = true;
        }
        self.bit_offset += bits;
    }

    fn fetch(&mut self, bits: u32) -> Option<u64> {
        match self.buffer.read_bits(self.bit_offset, bits) {
            Some(v) => {
                self.bit_offset += bits;
                Some(v)
            }
            None => {
                self.buffer_failed = true;
                None
            }
        }
    }

    // ---------------------------------------------------------------- bool

    pub fn add_bool(&mut self, input: bool) -> bool {
        if !self.ensure_write() {
            return input;
        }
        self.make_room_in_bits(1);
        self.store(input as u64, 1);
        input
    }

    pub fn read_bool(&mut self) -> bool {
        if !self.ensure_read() {
            return false;
        }
        self.fetch(1).map(|v| v != 0).unwrap_or(false)
    }

    // ----------------------------------------------------------------- int

    /// Adds a signed integer, clamped to the range of the chosen width.
    /// Returns the clamped value so both sides operate on the same data.
    pub fn add_int(&mut self, input: i64, level: CompressionLevel) -> i64 {
        if !self.ensure_write() {
            return input;
        }
        let bits = Self::int_size(level);
        let value = match bits {
            8 => input.clamp(i8::MIN as i64, i8::MAX as i64),
            16 => input.clamp(i16::MIN as i64, i16::MAX as i64),
            32 => input.clamp(i32::MIN as i64, i32::MAX as i64),
            _ => input,
        };
        self.make_room_in_bits(bits);
        self.store(value as u64, bits);
        value
    }

    pub fn read_int(&mut self, level: CompressionLevel) -> i64 {
        if !self.ensure_read() {
            return 0;
        }
        let bits = Self::int_size(level);
        let Some(uvalue) = self.fetch(bits) else {
            return 0;
        };
        match bits {
            8 => uvalue as u8 as i8 as i64,
            16 => uvalue as u16 as i16 as i64,
            32 => uvalue as u32 as i32 as i64,
            _ => uvalue as i64,
        }
    }

    // ---------------------------------------------------------------- uint

    /// Adds an unsigned integer, clamped to the maximum of the chosen width.
    pub fn add_uint(&mut self, input: u64, level: CompressionLevel) -> u64 {
        if !self.ensure_write() {
            return input;
        }
        let bits = Self::uint_size(level);
        let value = match bits {
            8 => input.min(u8::MAX as u64),
            16 => input.min(u16::MAX as u64),
            32 => input.min(u32::MAX as u64),
            _ => input,
        };
        self.make_room_in_bits(bits);
        self.store(value, bits);
        value
    }

    pub fn read_uint(&mut self, level: CompressionLevel) -> u64 {
        if !self.ensure_read() {
            return 0;
        }
        let bits = Self::uint_size(level);
        self.fetch(bits).unwrap_or(0)
    }

    // ---------------------------------------------------------------- real

    fn mantissa_bits(level: CompressionLevel) -> i32 {
        // IEEE-754 basic formats; level 3 is a 4e4m minifloat.
        match level {
            Level0 => 53,
            Level1 => 24,
            Level2 => 11,
            Level3 => 4,
        }
    }

    fn exponent_bits(level: CompressionLevel) -> i32 {
        match level {
            Level0 => 11,
            Level1 => 8,
            Level2 => 5,
            Level3 => 4,
        }
    }

    fn real_bias(level: CompressionLevel) -> i32 {
        let e = Self::exponent_bits(level);
        if level == Level3 {
            (1 << e) - 3
        } else {
            (1 << (e - 1)) - 1
        }
    }

    /// Largest magnitude whose biased exponent fits the exponent field.
    fn real_max(level: CompressionLevel) -> f64 {
        let m = Self::mantissa_bits(level);
        let e = Self::exponent_bits(level);
        let max_exp = ((1 << e) - 1) - Self::real_bias(level);
        math::ldexp(1.0 - math::exp2i(-m), max_exp)
    }

    /// Adds a real, split IEEE-754 style into sign, mantissa and exponent.
    /// The input is clamped to the representable range of the level.
    /// Returns the quantized value so both sides operate on the same data.
    pub fn add_real(&mut self, input: f64, level: CompressionLevel) -> f64 {
        if !self.ensure_write() {
            return input;
        }
        let exponent_bits = Self::exponent_bits(level);
        let mantissa_bits = Self::mantissa_bits(level);
        let bias = Self::real_bias(level);
        let max_value = Self::real_max(level);
        let clamped = input.clamp(-max_value, max_value);

        // Mantissa represented in [0.5, 1); exponent is the power of two.
        let (m, e) = math::frexp(clamped);
        let sign = m < 0.0;
        let mut mantissa = m.abs();
        let mut exponent = e;

        // Round the mantissa into the specified number of bits.
        let mut mantissa_scale = math::exp2i(mantissa_bits);
        if exponent <= 0 {
            // Subnormal: fold the exponent into the mantissa, halve the scale.
            mantissa *= math::exp2i(exponent);
            exponent = 0;
            mantissa_scale /= 2.0;
        }
        mantissa = (mantissa * mantissa_scale).round() / mantissa_scale;
        if mantissa < 0.5 && mantissa != 0.0 {
            // Underflow: extract the exponent back out of the mantissa.
            exponent += math::ilogb(mantissa) + 1;
            mantissa /= math::exp2i(exponent);
        } else if mantissa == 1.0 {
            // Overflow of the rounding: bump the exponent.
            exponent += 1;
            mantissa = 0.5;
        }

        let integer_mantissa: u64 = if exponent <= 0 {
            (mantissa * mantissa_scale * math::exp2i(exponent)) as u64
        } else {
            ((mantissa - 0.5) * mantissa_scale) as u64
        };

        self.make_room_in_bits((1 + (mantissa_bits - 1) + exponent_bits) as u32);
        self.store(sign as u64, 1);
        self.store(integer_mantissa, (mantissa_bits - 1) as u32);
        // The exponent is shifted by the bias so an unsigned field suffices.
        self.store((exponent + bias) as u64, exponent_bits as u32);

        math::ldexp(if sign { -mantissa } else { mantissa }, exponent)
    }

    pub fn read_real(&mut self, level: CompressionLevel) -> f64 {
        if !self.ensure_read() {
            return 0.0;
        }
        let Some(sign) = self.fetch(1) else {
            return 0.0;
        };
        let mantissa_bits = Self::mantissa_bits(level);
        let Some(integer_mantissa) = self.fetch((mantissa_bits - 1) as u32) else {
            return 0.0;
        };
        let exponent_bits = Self::exponent_bits(level);
        let Some(encoded_exponent) = self.fetch(exponent_bits as u32) else {
            return 0.0;
        };
        let exponent = encoded_exponent as i32 - Self::real_bias(level);

        let mantissa_scale = math::exp2i(if exponent <= 0 {
            mantissa_bits - 1
        } else {
            mantissa_bits
        });
        let mantissa = if exponent <= 0 {
            integer_mantissa as f64 / mantissa_scale / math::exp2i(exponent)
        } else {
            integer_mantissa as f64 / mantissa_scale + 0.5
        };

        math::ldexp(if sign != 0 { -mantissa } else { mantissa }, exponent)
    }

    // ----------------------------------------------------------- unit real

    fn compress_unit_float(value: f64, scale: f64) -> u64 {
        (value.clamp(0.0, 1.0) * scale).min(scale).round() as u64
    }

    fn decompress_unit_float(value: u64, scale: f64) -> f64 {
        value as f64 / scale
    }

    /// Adds a real in `[0, 1]` as fixed point.
    /// Returns the quantized value so both sides operate on the same data.
    pub fn add_positive_unit_real(&mut self, input: f32, level: CompressionLevel) -> f32 {
        if !self.ensure_write() {
            return input;
        }
        let bits = Self::positive_unit_real_size(level);
        let max_value = ((1u64 << bits) - 1) as f64;
        let compressed = Self::compress_unit_float(input as f64, max_value);
        self.make_room_in_bits(bits);
        self.store(compressed, bits);
        Self::decompress_unit_float(compressed, max_value) as f32
    }

    pub fn read_positive_unit_real(&mut self, level: CompressionLevel) -> f32 {
        if !self.ensure_read() {
            return 0.0;
        }
        let bits = Self::positive_unit_real_size(level);
        let max_value = ((1u64 << bits) - 1) as f64;
        let Some(compressed) = self.fetch(bits) else {
            return 0.0;
        };
        Self::decompress_unit_float(compressed, max_value) as f32
    }

    /// Adds a real in `[-1, 1]`; one extra bit carries the sign.
    pub fn add_unit_real(&mut self, input: f32, level: CompressionLevel) -> f32 {
        if !self.ensure_write() {
            return input;
        }
        let value = self.add_positive_unit_real(input.abs(), level);
        let is_negative = input < 0.0;
        self.make_room_in_bits(1);
        self.store(is_negative as u64, 1);
        if is_negative {
            -value
        } else {
            value
        }
    }

    pub fn read_unit_real(&mut self, level: CompressionLevel) -> f32 {
        if !self.ensure_read() {
            return 0.0;
        }
        let value = self.read_positive_unit_real(level);
        let Some(is_negative) = self.fetch(1) else {
            return 0.0;
        };
        if is_negative != 0 {
            -value
        } else {
            value
        }
    }

    // ------------------------------------------------------------- vectors

    pub fn add_vector2(&mut self, input: Vec2, level: CompressionLevel) -> Vec2 {
        Vec2::new(self.add_real(input.x, level), self.add_real(input.y, level))
    }

    pub fn read_vector2(&mut self, level: CompressionLevel) -> Vec2 {
        Vec2::new(self.read_real(level), self.read_real(level))
    }

    /// Adds a normalized vector2 as one zero-flag bit plus a quantized angle.
    /// The behaviour is unexpected for not normalized vectors.
    pub fn add_normalized_vector2(&mut self, input: Vec2, level: CompressionLevel) -> Vec2 {
        if !self.ensure_write() {
            return input;
        }
        let is_zero = input.is_zero_approx();
        debug_assert!(is_zero || input.is_normalized(), "vector must be normalized");

        let bits = Self::normalized_vector2_size(level);
        let bits_for_the_angle = bits - 1;
        let max_value = ((1u64 << bits_for_the_angle) - 1) as f64;

        let angle = input.angle();
        let compressed_angle =
            Self::compress_unit_float(((angle + math::PI) / math::TAU) as f64, max_value);

        self.make_room_in_bits(bits);
        self.store(is_zero as u64, 1);
        self.store(compressed_angle, bits_for_the_angle);

        if is_zero {
            Vec2::ZERO
        } else {
            let decompressed = (Self::decompress_unit_float(compressed_angle, max_value)
                * math::TAU as f64
                - math::PI as f64) as f32;
            Vec2::new(math::cos(decompressed) as f64, math::sin(decompressed) as f64)
        }
    }

    pub fn read_normalized_vector2(&mut self, level: CompressionLevel) -> Vec2 {
        if !self.ensure_read() {
            return Vec2::ZERO;
        }
        let bits = Self::normalized_vector2_size(level);
        let bits_for_the_angle = bits - 1;
        let max_value = ((1u64 << bits_for_the_angle) - 1) as f64;

        let Some(is_zero) = self.fetch(1) else {
            return Vec2::ZERO;
        };
        let Some(compressed_angle) = self.fetch(bits_for_the_angle) else {
            return Vec2::ZERO;
        };
        if is_zero != 0 {
            return Vec2::ZERO;
        }
        let angle = (Self::decompress_unit_float(compressed_angle, max_value) * math::TAU as f64
            - math::PI as f64) as f32;
        Vec2::new(math::cos(angle) as f64, math::sin(angle) as f64)
    }

    pub fn add_vector3(&mut self, input: Vec3, level: CompressionLevel) -> Vec3 {
        Vec3::new(
            self.add_real(input.x, level),
            self.add_real(input.y, level),
            self.add_real(input.z, level),
        )
    }

    pub fn read_vector3(&mut self, level: CompressionLevel) -> Vec3 {
        Vec3::new(
            self.read_real(level),
            self.read_real(level),
            self.read_real(level),
        )
    }

    /// Adds a normalized vector3 as three unit reals. The result is not
    /// re-normalized on decode; the quantization artifact is accepted.
    pub fn add_normalized_vector3(&mut self, input: Vec3, level: CompressionLevel) -> Vec3 {
        Vec3::new(
            self.add_unit_real(input.x as f32, level) as f64,
            self.add_unit_real(input.y as f32, level) as f64,
            self.add_unit_real(input.z as f32, level) as f64,
        )
    }

    pub fn read_normalized_vector3(&mut self, level: CompressionLevel) -> Vec3 {
        Vec3::new(
            self.read_unit_real(level) as f64,
            self.read_unit_real(level) as f64,
            self.read_unit_real(level) as f64,
        )
    }

    // ------------------------------------------------------------- strings

    pub fn add_string(&mut self, input: &str) {
        debug_assert!(input.len() <= i16::MAX as usize);
        self.add_uint(input.len() as u64, Level2);
        if !input.is_empty() {
            self.add_bits(input.as_bytes(), input.len() as u32 * 8);
        }
    }

    pub fn read_string(&mut self) -> String {
        let size = self.read_uint(Level2) as usize;
        if size == 0 {
            return String::new();
        }
        let mut bytes = vec![0u8; size];
        self.read_bits_into(&mut bytes, size as u32 * 8);
        if self.buffer_failed {
            return String::new();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn add_string16(&mut self, input: &[u16]) {
        debug_assert!(input.len() <= u16::MAX as usize);
        self.add_uint(input.len() as u64, Level2);
        for unit in input {
            self.make_room_in_bits(16);
            self.store(*unit as u64, 16);
        }
    }

    pub fn read_string16(&mut self) -> Vec<u16> {
        let size = self.read_uint(Level2) as usize;
        let mut out = Vec::with_capacity(size);
        for _ in 0..size {
            let Some(unit) = self.fetch(16) else {
                return Vec::new();
            };
            out.push(unit as u16);
        }
        out
    }

    // ---------------------------------------------------------- sub-buffer

    /// Appends another buffer: a short/long length header, padding up to the
    /// next byte boundary, then the raw bytes.
    pub fn add_data_buffer(&mut self, other: &DataBuffer) {
        let other_bit_size = other.total_size();
        let using_compression_lvl_2 = other_bit_size < u16::MAX as u32;
        self.add_bool(using_compression_lvl_2);
        self.add_uint(
            other_bit_size as u64,
            if using_compression_lvl_2 { Level2 } else { Level1 },
        );
        self.make_room_pad_to_next_byte();
        self.add_bits(other.buffer.bytes(), other_bit_size);
    }

    /// Symmetric read of [`Self::add_data_buffer`]. The returned buffer is in
    /// write mode with the copied bits; call `begin_read` on it to decode.
    pub fn read_data_buffer(&mut self) -> DataBuffer {
        let mut out = DataBuffer::new();
        if !self.ensure_read() {
            return out;
        }
        let using_compression_lvl_2 = self.read_bool();
        if self.buffer_failed {
            return out;
        }
        let other_bit_size = self.read_uint(if using_compression_lvl_2 {
            Level2
        } else {
            Level1
        }) as u32;
        if !self.pad_to_next_byte() {
            return out;
        }
        let start = (self.bit_offset / 8) as usize;
        let byte_count = (other_bit_size as usize).div_ceil(8);
        if start + byte_count > self.buffer.bytes().len() {
            self.buffer_failed = true;
            return out;
        }
        let chunk = self.buffer.bytes()[start..start + byte_count].to_vec();
        out.begin_write(0);
        out.add_bits(&chunk, other_bit_size);
        self.bit_offset += other_bit_size;
        out
    }

    // ------------------------------------------------------------ raw bits

    pub fn add_bits(&mut self, data: &[u8], bit_count: u32) {
        if !self.ensure_write() {
            return;
        }
        let mut bit_count = bit_count;
        self.make_room_in_bits(bit_count);
        for byte in data {
            if bit_count == 0 {
                break;
            }
            let this_bit_count = bit_count.min(8);
            self.store(*byte as u64, this_bit_count);
            bit_count -= this_bit_count;
        }
    }

    pub fn read_bits_into(&mut self, out: &mut [u8], bit_count: u32) {
        if !self.ensure_read() {
            return;
        }
        let mut bit_count = bit_count;
        for byte in out {
            if bit_count == 0 {
                break;
            }
            let this_bit_count = bit_count.min(8);
            let Some(value) = self.fetch(this_bit_count) else {
                return;
            };
            *byte = value as u8;
            bit_count -= this_bit_count;
        }
    }

    // ------------------------------------------------------------- padding

    /// Write-mode: grows the buffer and moves the cursor to the next byte
    /// boundary.
    pub fn make_room_pad_to_next_byte(&mut self) {
        let bits_to_next_byte = ((self.bit_offset + 7) & !7) - self.bit_offset;
        self.make_room_in_bits(bits_to_next_byte);
        self.bit_offset += bits_to_next_byte;
    }

    /// Read-mode: moves the cursor to the next byte boundary. Returns false
    /// when that would run past the backing buffer.
    pub fn pad_to_next_byte(&mut self) -> bool {
        let bits_to_next_byte = ((self.bit_offset + 7) & !7) - self.bit_offset;
        if self.bit_offset + bits_to_next_byte > self.buffer.size_in_bits() {
            self.buffer_failed = true;
            return false;
        }
        self.bit_offset += bits_to_next_byte;
        true
    }

    // ------------------------------------------------------ sizes and skip

    pub fn bool_size() -> u32 {
        1
    }

    pub fn int_size(level: CompressionLevel) -> u32 {
        match level {
            Level0 => 64,
            Level1 => 32,
            Level2 => 16,
            Level3 => 8,
        }
    }

    pub fn uint_size(level: CompressionLevel) -> u32 {
        Self::int_size(level)
    }

    pub fn real_size(level: CompressionLevel) -> u32 {
        (Self::mantissa_bits(level) + Self::exponent_bits(level)) as u32
    }

    pub fn positive_unit_real_size(level: CompressionLevel) -> u32 {
        match level {
            Level0 => 10,
            Level1 => 8,
            Level2 => 6,
            Level3 => 4,
        }
    }

    pub fn unit_real_size(level: CompressionLevel) -> u32 {
        Self::positive_unit_real_size(level) + 1
    }

    pub fn vector2_size(level: CompressionLevel) -> u32 {
        Self::real_size(level) * 2
    }

    pub fn normalized_vector2_size(level: CompressionLevel) -> u32 {
        // One extra bit to tell a zero vector from a direction.
        match level {
            Level0 => 11 + 1,
            Level1 => 10 + 1,
            Level2 => 9 + 1,
            Level3 => 8 + 1,
        }
    }

    pub fn vector3_size(level: CompressionLevel) -> u32 {
        Self::real_size(level) * 3
    }

    pub fn normalized_vector3_size(level: CompressionLevel) -> u32 {
        Self::unit_real_size(level) * 3
    }

    pub fn skip_bool(&mut self) {
        self.skip(Self::bool_size());
    }

    pub fn skip_int(&mut self, level: CompressionLevel) {
        self.skip(Self::int_size(level));
    }

    pub fn skip_uint(&mut self, level: CompressionLevel) {
        self.skip(Self::uint_size(level));
    }

    pub fn skip_real(&mut self, level: CompressionLevel) {
        self.skip(Self::real_size(level));
    }

    pub fn skip_positive_unit_real(&mut self, level: CompressionLevel) {
        self.skip(Self::positive_unit_real_size(level));
    }

    pub fn skip_unit_real(&mut self, level: CompressionLevel) {
        self.skip(Self::unit_real_size(level));
    }

    pub fn skip_vector2(&mut self, level: CompressionLevel) {
        self.skip(Self::vector2_size(level));
    }

    pub fn skip_normalized_vector2(&mut self, level: CompressionLevel) {
        self.skip(Self::normalized_vector2_size(level));
    }

    pub fn skip_vector3(&mut self, level: CompressionLevel) {
        self.skip(Self::vector3_size(level));
    }

    pub fn skip_normalized_vector3(&mut self, level: CompressionLevel) {
        self.skip(Self::normalized_vector3_size(level));
    }

    /// Skips a sub-buffer, reading just its length header.
    pub fn skip_buffer(&mut self) {
        self.read_buffer_size();
    }

    /// Reads the sub-buffer header and skips the payload, returning its bit
    /// size.
    pub fn read_buffer_size(&mut self) -> u32 {
        let using_compression_lvl_2 = self.read_bool();
        if self.buffer_failed {
            return 0;
        }
        let other_bit_size = self.read_uint(if using_compression_lvl_2 {
            Level2
        } else {
            Level1
        }) as u32;
        if !self.pad_to_next_byte() {
            return 0;
        }
        self.skip(other_bit_size);
        other_bit_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_int8_bit_pattern() {
        let mut db = DataBuffer::new();
        db.begin_write(0);
        db.add_bool(true);
        db.add_int(-5, Level3);
        db.add_bool(false);
        assert_eq!(db.total_size(), 10);

        // -5 is 0b11111011; bit 0 is the leading bool.
        let bits = db.buffer().read_bits(0, 10).unwrap();
        assert_eq!(bits & 0b1, 1);
        assert_eq!((bits >> 1) & 0xff, 0b1111_1011);
        assert_eq!((bits >> 9) & 0b1, 0);

        db.begin_read();
        assert_eq!(db.read_bool(), true);
        assert_eq!(db.read_int(Level3), -5);
        assert_eq!(db.read_bool(), false);
        assert!(!db.is_buffer_failed());
    }

    #[test]
    fn int_clamps_to_width() {
        let mut db = DataBuffer::new();
        db.begin_write(0);
        assert_eq!(db.add_int(300, Level3), 127);
        assert_eq!(db.add_int(-300, Level3), -128);
        assert_eq!(db.add_int(i64::MIN, Level1), i32::MIN as i64);
        assert_eq!(db.add_uint(u64::MAX, Level2), u16::MAX as u64);
        db.begin_read();
        assert_eq!(db.read_int(Level3), 127);
        assert_eq!(db.read_int(Level3), -128);
        assert_eq!(db.read_int(Level1), i32::MIN as i64);
        assert_eq!(db.read_uint(Level2), u16::MAX as u64);
    }

    #[test]
    fn int_roundtrip_all_levels() {
        for level in [Level0, Level1, Level2, Level3] {
            for value in [-100i64, -1, 0, 1, 100] {
                let mut db = DataBuffer::new();
                db.begin_write(0);
                db.add_int(value, level);
                db.begin_read();
                assert_eq!(db.read_int(level), value);
            }
        }
    }

    #[test]
    fn real_minifloat_exact() {
        let mut db = DataBuffer::new();
        db.begin_write(0);
        // 3.25 is 1.101 * 2^1, representable in 4 mantissa bits.
        let quantized = db.add_real(3.25, Level3);
        assert_eq!(quantized, 3.25);
        assert_eq!(db.total_size(), 8);
        db.begin_read();
        assert_eq!(db.read_real(Level3), 3.25);
    }

    #[test]
    fn real_minifloat_clamps_at_max() {
        let mut db = DataBuffer::new();
        db.begin_write(0);
        let clamped = db.add_real(1e30, Level3);
        assert_eq!(clamped, 3.75);
        db.begin_read();
        assert_eq!(db.read_real(Level3), 3.75);
    }

    #[test]
    fn real_roundtrip_is_idempotent() {
        for level in [Level0, Level1, Level2, Level3] {
            for value in [0.0, 1.0, -1.0, 0.5, 3.25, -0.125, 0.3, 1234.56, -0.004] {
                let mut db = DataBuffer::new();
                db.begin_write(0);
                let quantized = db.add_real(value, level);
                db.begin_read();
                let read_back = db.read_real(level);
                assert_eq!(read_back, quantized, "level {level:?} value {value}");

                // quantize(quantize(v)) == quantize(v)
                let mut db2 = DataBuffer::new();
                db2.begin_write(0);
                assert_eq!(db2.add_real(quantized, level), quantized);
            }
        }
    }

    #[test]
    fn real_level0_is_lossless() {
        for value in [std::f64::consts::PI, -1e300, 4.9e-324, 0.1] {
            let mut db = DataBuffer::new();
            db.begin_write(0);
            assert_eq!(db.add_real(value, Level0), value);
            db.begin_read();
            assert_eq!(db.read_real(Level0), value);
        }
    }

    #[test]
    fn unit_real_roundtrip() {
        for level in [Level0, Level1, Level2, Level3] {
            let mut db = DataBuffer::new();
            db.begin_write(0);
            let q = db.add_unit_real(-0.75, level);
            assert!(q <= 0.0);
            db.begin_read();
            assert_eq!(db.read_unit_real(level), q);
        }
    }

    #[test]
    fn positive_unit_real_clamps() {
        let mut db = DataBuffer::new();
        db.begin_write(0);
        assert_eq!(db.add_positive_unit_real(7.5, Level0), 1.0);
        db.begin_read();
        assert_eq!(db.read_positive_unit_real(Level0), 1.0);
    }

    #[test]
    fn normalized_vector2_roundtrip() {
        let v = Vec2::new(std::f64::consts::FRAC_1_SQRT_2, std::f64::consts::FRAC_1_SQRT_2);
        for level in [Level0, Level1, Level2, Level3] {
            let mut db = DataBuffer::new();
            db.begin_write(0);
            let q = db.add_normalized_vector2(v, level);
            db.begin_read();
            let r = db.read_normalized_vector2(level);
            assert_eq!(r, q);
            // Quantization loss stays under a degree at every level.
            assert!((r.x - v.x).abs() < 0.03 && (r.y - v.y).abs() < 0.03);
        }
    }

    #[test]
    fn normalized_vector2_zero_flag() {
        let mut db = DataBuffer::new();
        db.begin_write(0);
        db.add_normalized_vector2(Vec2::ZERO, Level1);
        db.begin_read();
        assert_eq!(db.read_normalized_vector2(Level1), Vec2::ZERO);
    }

    #[test]
    fn vector3_roundtrip() {
        let v = Vec3::new(1.5, -2.25, 100.0);
        let mut db = DataBuffer::new();
        db.begin_write(0);
        let q = db.add_vector3(v, Level1);
        db.begin_read();
        assert_eq!(db.read_vector3(Level1), q);
    }

    #[test]
    fn sequence_cursor_accounting() {
        let mut db = DataBuffer::new();
        db.begin_write(0);
        db.add_bool(true);
        db.add_uint(42, Level2);
        db.add_real(1.5, Level2);
        db.add_unit_real(0.5, Level1);
        let expected = DataBuffer::bool_size()
            + DataBuffer::uint_size(Level2)
            + DataBuffer::real_size(Level2)
            + DataBuffer::unit_real_size(Level1);
        assert_eq!(db.bit_offset(), expected);
        assert_eq!(db.total_size(), expected);

        db.begin_read();
        assert_eq!(db.read_bool(), true);
        assert_eq!(db.read_uint(Level2), 42);
        assert_eq!(db.read_real(Level2), 1.5);
        assert_eq!(db.read_unit_real(Level1), 0.5);
        assert_eq!(db.bit_offset(), expected);
    }

    #[test]
    fn skip_advances_without_reading() {
        let mut db = DataBuffer::new();
        db.begin_write(0);
        db.add_uint(7, Level3);
        db.add_bool(true);
        db.begin_read();
        db.skip_uint(Level3);
        assert_eq!(db.read_bool(), true);
    }

    #[test]
    fn read_past_end_latches_failure() {
        let mut db = DataBuffer::new();
        db.begin_write(0);
        db.add_bool(true);
        db.dry();
        db.begin_read();
        db.read_bool();
        assert_eq!(db.read_uint(Level0), 0);
        assert!(db.is_buffer_failed());
        // Every further read keeps returning zeroed values.
        assert_eq!(db.read_int(Level3), 0);
    }

    #[test]
    fn sub_buffer_roundtrip() {
        let mut inner = DataBuffer::new();
        inner.begin_write(0);
        inner.add_uint(123, Level2);
        inner.add_bool(true);
        inner.dry();

        let mut outer = DataBuffer::new();
        outer.begin_write(0);
        outer.add_bool(false);
        outer.add_data_buffer(&inner);
        outer.add_uint(9, Level3);

        outer.begin_read();
        assert_eq!(outer.read_bool(), false);
        let mut copy = outer.read_data_buffer();
        assert_eq!(outer.read_uint(Level3), 9);

        copy.shrink_to(0, inner.total_size());
        copy.begin_read();
        assert_eq!(copy.read_uint(Level2), 123);
        assert_eq!(copy.read_bool(), true);
    }

    #[test]
    fn skip_buffer_matches_layout() {
        let mut inner = DataBuffer::new();
        inner.begin_write(0);
        inner.add_uint(55, Level1);
        inner.dry();

        let mut outer = DataBuffer::new();
        outer.begin_write(0);
        outer.add_data_buffer(&inner);
        outer.add_uint(3, Level3);

        outer.begin_read();
        outer.skip_buffer();
        assert_eq!(outer.read_uint(Level3), 3);
    }

    #[test]
    fn string_roundtrip() {
        let mut db = DataBuffer::new();
        db.begin_write(0);
        db.add_string("hello net");
        db.add_string("");
        db.add_string16(&[104, 105, 0x2764]);
        db.begin_read();
        assert_eq!(db.read_string(), "hello net");
        assert_eq!(db.read_string(), "");
        assert_eq!(db.read_string16(), vec![104, 105, 0x2764]);
    }

    #[test]
    fn metadata_is_preserved_across_writes() {
        let mut db = DataBuffer::new();
        db.begin_write(1);
        db.seek(1);
        db.add_uint(99, Level3);
        assert_eq!(db.metadata_size(), 1);
        assert_eq!(db.size(), 8);
        db.seek(0);
        db.add_bool(true);
        db.begin_read();
        assert_eq!(db.read_bool(), true);
        assert_eq!(db.read_uint(Level3), 99);
    }

    #[test]
    fn shrink_and_seek_bounds() {
        let mut db = DataBuffer::new();
        db.begin_write(0);
        db.add_uint(1, Level0);
        db.dry();
        db.shrink_to(0, 32);
        assert_eq!(db.size(), 32);
        db.begin_read();
        db.seek(40); // refused, past the logical size
        assert_eq!(db.bit_offset(), 0);
    }
}
