//! Deterministic math.
//!
//! The bit codec and the rollback machinery require bit-identical results on
//! every platform, so nothing here calls into the system `libm`: the
//! float-splitting helpers are pure bit manipulation and the trigonometry is
//! a polynomial approximation (ported from Jolt) that evaluates the same
//! everywhere IEEE-754 holds.

use serde::{Deserialize, Serialize};

pub const TAU: f32 = 6.28318530718;
pub const PI: f32 = 3.14159265359;
pub const HALF_PI: f32 = 1.57079632679;
const TWO_OVER_PI: f32 = 0.636_619_772_367_581_4;

/// Splits `x` into `(mantissa, exponent)` with the mantissa in `[0.5, 1)`.
///
/// Zero, infinities and NaN are returned unchanged with exponent 0, matching
/// the C `frexp` contract.
pub fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || x.is_nan() || x.is_infinite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let exp_field = ((bits >> 52) & 0x7ff) as i32;
    if exp_field == 0 {
        // Subnormal: renormalize through a 2^64 scale, then undo it.
        let (m, e) = frexp(x * f64::from_bits((1023u64 + 64) << 52));
        return (m, e - 64);
    }
    let mantissa = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (mantissa, exp_field - 1022)
}

/// Computes `x * 2^e` without going through `powf`.
pub fn ldexp(mut x: f64, mut e: i32) -> f64 {
    while e > 1023 {
        x *= f64::from_bits(2046u64 << 52); // 2^1023
        e -= 1023;
    }
    while e < -1022 {
        x *= f64::from_bits(1u64 << 52); // 2^-1022
        e += 1022;
    }
    x * f64::from_bits(((e + 1023) as u64) << 52)
}

/// `floor(log2(|x|))` for finite non-zero `x`.
pub fn ilogb(x: f64) -> i32 {
    let (_, e) = frexp(x);
    e - 1
}

/// `2^e` as an `f64`.
pub fn exp2i(e: i32) -> f64 {
    ldexp(1.0, e)
}

pub fn is_equal_approx(a: f64, b: f64, epsilon: f64) -> bool {
    // Exact comparison first, required to handle infinities.
    if a == b {
        return true;
    }
    (a - b).abs() <= epsilon
}

pub fn is_zero_approx(a: f64) -> bool {
    a.abs() < f64::EPSILON
}

// Ported from Jolt. Deterministic across platforms.
fn cross_sin_cos(x: f32) -> (f32, f32) {
    // quadrant = int(angle * 2/π + 0.5)
    let quad = (x * TWO_OVER_PI + 0.5) as i32;
    let fquad = quad as f32;

    // Subtract quadrant*(π/2) via Cody-Waite steps.
    let x = ((x - fquad * 1.5703125) - fquad * 0.000_483_751_296_997_070_3)
        - fquad * 7.549_789_948_768_648e-8;
    let x2 = x * x;

    let sin_approx =
        ((-1.951_529_589_1e-4 * x2 + 8.332_160_873_6e-3) * x2 - 1.666_665_461_1e-1) * x2 * x + x;
    let cos_approx = (((2.443_315_711_809_948e-5 * x2 - 1.388_731_625_493_765e-3) * x2
        + 4.166_664_568_298_827e-2)
        * x2
        * x2)
        - 0.5 * x2
        + 1.0;

    match quad & 3 {
        0 => (sin_approx, cos_approx),
        1 => (cos_approx, -sin_approx),
        2 => (-sin_approx, -cos_approx),
        _ => (-cos_approx, sin_approx),
    }
}

pub fn sin(x: f32) -> f32 {
    cross_sin_cos(x).0
}

pub fn cos(x: f32) -> f32 {
    cross_sin_cos(x).1
}

// Ported from Jolt. Deterministic across platforms.
pub fn atan(v: f32) -> f32 {
    let sign = v.to_bits() & 0x8000_0000;
    let x = if sign == 0 { v } else { -v };

    let greater1 = x > 0.414_213_57; // tan(π/8)
    let x1 = (x - 1.0) / (x + 1.0);

    let greater2 = x > 2.414_213_5; // tan(3π/8)
    let x2 = -1.0 / (x + 1e-38);

    let x_sel = if greater1 { x1 } else { x };
    let y_sel = if greater1 { 0.785_398_16 } else { 0.0 };

    let x_final = if greater2 { x2 } else { x_sel };
    let y_final = if greater2 { HALF_PI } else { y_sel };

    let z = x_final * x_final;
    let add = (((8.053_744_5e-2 * z - 1.387_768_56e-1) * z + 1.997_771_06e-1) * z
        - 3.333_294_9e-1)
        * z
        * x_final
        + x_final;
    let result = y_final + add;

    f32::from_bits(result.to_bits() ^ sign)
}

// Ported from Jolt. Deterministic across platforms.
pub fn atan2(y: f32, x: f32) -> f32 {
    if x == 0.0 {
        if y > 0.0 {
            return HALF_PI;
        }
        if y < 0.0 {
            return -HALF_PI;
        }
        return 0.0;
    }

    let x_sign = x.to_bits() & 0x8000_0000;
    let y_sign = y.to_bits() & 0x8000_0000;
    let ax = if x_sign == 0 { x } else { -x };
    let ay = if y_sign == 0 { y } else { -y };

    // Always divide the smaller by the larger.
    let x_is_numer = ax < ay;
    let (numer, denom) = if x_is_numer { (ax, ay) } else { (ay, ax) };

    let ratio = if denom < 1e-38 { 0.0 } else { numer / denom };
    let mut angle = atan(ratio);

    if x_is_numer {
        angle = HALF_PI - angle;
    }

    if x_sign != 0 {
        angle = if y_sign == 0 { angle + PI } else { angle - PI };
    }

    f32::from_bits(angle.to_bits() ^ (x_sign ^ y_sign))
}

/// 2D vector with double components, the precision the codec operates at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn length(self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn is_normalized(self) -> bool {
        is_equal_approx(self.length(), 1.0, 1e-6)
    }

    pub fn is_zero_approx(self) -> bool {
        is_zero_approx(self.x) && is_zero_approx(self.y)
    }

    /// Angle of the vector, computed with the deterministic `atan2`.
    pub fn angle(self) -> f32 {
        atan2(self.y as f32, self.x as f32)
    }
}

/// 3D vector with double components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn length(self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_normalized(self) -> bool {
        is_equal_approx(self.length(), 1.0, 1e-6)
    }
}
