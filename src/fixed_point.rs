//! 17.14 signed fixed-point arithmetic.
//!
//! The decayed-usage scheduler needs fractional load and usage values
//! but the kernel has no floating point. Values are stored as `i32`
//! with the low 14 bits holding the fraction.

use core::ops::{Add, Sub};

/// Fraction bits
const SHIFT: u32 = 14;
/// Scale factor (1.0 in fixed point)
const F: i32 = 1 << SHIFT;

/// A signed 17.14 fixed-point number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed(i32);

impl Fixed {
    /// Zero
    pub const ZERO: Fixed = Fixed(0);

    /// Convert an integer to fixed point
    pub const fn from_int(n: i32) -> Fixed {
        Fixed(n * F)
    }

    /// Build from a raw 17.14 representation
    pub const fn from_raw(raw: i32) -> Fixed {
        Fixed(raw)
    }

    /// Raw 17.14 representation
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Convert to integer, truncating toward zero
    pub const fn to_int_trunc(self) -> i32 {
        self.0 / F
    }

    /// Convert to integer, rounding to nearest
    pub const fn to_int_round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }

    /// Add an integer
    pub const fn add_int(self, n: i32) -> Fixed {
        Fixed(self.0 + n * F)
    }

    /// Subtract an integer
    pub const fn sub_int(self, n: i32) -> Fixed {
        Fixed(self.0 - n * F)
    }

    /// Multiply by another fixed-point value.
    ///
    /// Widens to 64 bits for the intermediate product.
    pub const fn mul(self, other: Fixed) -> Fixed {
        Fixed(((self.0 as i64 * other.0 as i64) >> SHIFT) as i32)
    }

    /// Divide by another fixed-point value
    pub const fn div(self, other: Fixed) -> Fixed {
        Fixed((((self.0 as i64) << SHIFT) / other.0 as i64) as i32)
    }

    /// Multiply by an integer
    pub const fn mul_int(self, n: i32) -> Fixed {
        Fixed(self.0 * n)
    }

    /// Divide by an integer
    pub const fn div_int(self, n: i32) -> Fixed {
        Fixed(self.0 / n)
    }

    /// Ratio of two integers as a fixed-point value
    pub const fn ratio(num: i32, den: i32) -> Fixed {
        Fixed(((num as i64 * F as i64) / den as i64) as i32)
    }
}

impl Add for Fixed {
    type Output = Fixed;
    fn add(self, other: Fixed) -> Fixed {
        Fixed(self.0 + other.0)
    }
}

impl Sub for Fixed {
    type Output = Fixed;
    fn sub(self, other: Fixed) -> Fixed {
        Fixed(self.0 - other.0)
    }
}
