//! Floating point helpers that reproduce the rounding behaviour of the Espresso FPU.
//!
//! These are shared by the interpreter and the JIT so both produce bit-identical results.

const F64_SIGN: u64 = 1 << 63;
const F64_EXP_MASK: u64 = 0x7FF0_0000_0000_0000;
const F64_EXP_ONE: u64 = 1 << 52;
const F64_MANTISSA_MASK: u64 = 0x000F_FFFF_FFFF_FFFF;
const F64_QUIET_BIT: u64 = 1 << 51;
const F32_QUIET_BIT: u32 = 1 << 22;
const MULTIPLY_ROUND_BIT: u64 = 1 << 27;

static FRES_BASE: [u16; 32] = [
    0x3FFC, 0x3C1C, 0x3875, 0x3504, 0x31C4, 0x2EB1, 0x2BC8, 0x2904, 0x2664, 0x23E5, 0x2184, 0x1F40,
    0x1D16, 0x1B04, 0x190A, 0x1725, 0x1554, 0x1396, 0x11EB, 0x104F, 0x0EC4, 0x0D48, 0x0BD7, 0x0A7C,
    0x0922, 0x07DF, 0x069C, 0x056F, 0x0442, 0x0328, 0x020E, 0x0106,
];

static FRES_DELTA: [u16; 32] = [
    0x3E1, 0x3A7, 0x371, 0x340, 0x313, 0x2EA, 0x2C4, 0x2A0, 0x27F, 0x261, 0x245, 0x22A, 0x212,
    0x1FB, 0x1E5, 0x1D1, 0x1BE, 0x1AC, 0x19B, 0x18B, 0x17C, 0x16E, 0x15B, 0x15B, 0x143, 0x143,
    0x12D, 0x12D, 0x11A, 0x11A, 0x108, 0x106,
];

static FRSQRTE_BASE: [u16; 32] = [
    0x7FF4, 0x7852, 0x7154, 0x6AE4, 0x64F2, 0x5F6E, 0x5A4C, 0x5580, 0x5102, 0x4CCA, 0x48D0, 0x450E,
    0x4182, 0x3E24, 0x3AF2, 0x37E8, 0x34FD, 0x2F97, 0x2AA5, 0x2618, 0x21E4, 0x1DFE, 0x1A5C, 0x16F8,
    0x13CA, 0x10CE, 0x0DFE, 0x0B57, 0x08D4, 0x0673, 0x0431, 0x020B,
];

static FRSQRTE_DELTA: [u16; 32] = [
    0x7A4, 0x700, 0x670, 0x5F2, 0x584, 0x524, 0x4CC, 0x47E, 0x43A, 0x3FA, 0x3C2, 0x38E, 0x35E,
    0x332, 0x30A, 0x2E6, 0x568, 0x4F3, 0x48D, 0x435, 0x3E7, 0x3A2, 0x365, 0x32E, 0x2FC, 0x2D0,
    0x2A8, 0x283, 0x261, 0x243, 0x226, 0x20B,
];

/// Rounds `value` to single precision using the host rounding mode.
#[inline(always)]
pub fn round_to_single(value: f64) -> f64 {
    value as f32 as f64
}

/// Drops the low 27 bits of the mantissa, rounding on bit 27. This is how the multiplier of a
/// single precision multiply is narrowed to 24 bits.
#[inline(always)]
fn truncate_to_24_bit(bits: u64) -> u64 {
    (bits & !(MULTIPLY_ROUND_BIT - 1)) + (bits & MULTIPLY_ROUND_BIT)
}

/// Prepares the operands of a single precision multiply `a * c`, returning the adjusted pair.
///
/// `c` is narrowed to 24 bits, ignoring the rounding mode. A denormal `c` is normalized first,
/// with its exponent moved into `a`. If narrowing carries `c` into infinity, a power of two is
/// moved into `a` instead, so the product keeps its precision for fused operations. Nothing
/// changes when `a` is zero or infinite, or when `c` is NaN.
pub fn round_for_multiply(a: f64, c: f64) -> (f64, f64) {
    let mut a_bits = a.to_bits();
    let mut c_bits = c.to_bits();

    if c_bits & ((MULTIPLY_ROUND_BIT << 1) - 1) == 0 || a == 0.0 || a.is_infinite() || c.is_nan()
    {
        return (a, c);
    }

    if c_bits & F64_EXP_MASK == 0 {
        let sign = c_bits & F64_SIGN;
        while c_bits & F64_EXP_MASK == 0 {
            c_bits <<= 1;
            if a_bits & F64_EXP_MASK == 0 {
                // the product is going to be flushed anyway
                return (a, c);
            }

            a_bits -= F64_EXP_ONE;
        }

        c_bits = (c_bits & !F64_SIGN) | sign;
    }

    c_bits = truncate_to_24_bit(c_bits);
    if f64::from_bits(c_bits).is_infinite() {
        c_bits -= F64_EXP_ONE;

        let a_exponent = (a_bits & F64_EXP_MASK) >> 52;
        if a_exponent == 0 {
            let sign = a_bits & F64_SIGN;
            a_bits = ((a_bits << 1) & !F64_SIGN) | sign;
        } else if a_exponent < 0x7FE {
            a_bits += F64_EXP_ONE;
        }
    }

    (f64::from_bits(a_bits), f64::from_bits(c_bits))
}

/// `a * c` as computed by a single precision multiply, before the product is rounded.
#[inline]
pub fn multiply_single(a: f64, c: f64) -> f64 {
    let (a, c) = round_for_multiply(a, c);
    a * c
}

#[inline(always)]
pub fn is_nan_bits(bits: u64) -> bool {
    bits & F64_EXP_MASK == F64_EXP_MASK && bits & F64_MANTISSA_MASK != 0
}

/// Whether `value` is a signalling NaN.
#[inline(always)]
pub fn is_signalling_nan(value: f64) -> bool {
    let bits = value.to_bits();
    is_nan_bits(bits) && bits & F64_QUIET_BIT == 0
}

/// Sets the quiet bit of a NaN.
#[inline(always)]
pub fn make_quiet(value: f64) -> f64 {
    f64::from_bits(value.to_bits() | F64_QUIET_BIT)
}

/// Converts a double to a single by chopping the mantissa instead of rounding it. NaN payloads
/// (and their signalling state) are kept.
pub fn truncate_double(value: f64) -> f32 {
    let bits = value.to_bits();
    let sign = ((bits >> 32) & 0x8000_0000) as u32;
    let exponent = ((bits >> 52) & 0x7FF) as u32;
    let mantissa = bits & F64_MANTISSA_MASK;

    let result = if exponent == 0x7FF {
        let mut narrowed = (mantissa >> 29) as u32;
        if mantissa != 0 && narrowed == 0 {
            narrowed = 1;
        }

        sign | 0x7F80_0000 | narrowed
    } else if exponent >= 1151 {
        sign | 0x7F7F_FFFF
    } else if exponent > 896 {
        sign | ((exponent - 896) << 23) | (mantissa >> 29) as u32
    } else if exponent >= 874 {
        sign | ((mantissa | (1 << 52)) >> (29 + 897 - exponent)) as u32
    } else {
        sign
    };

    f32::from_bits(result)
}

/// Widens a single to a double. Unlike an `as` conversion, NaN payloads are kept exactly.
pub fn extend_single(value: f32) -> f64 {
    if value.is_nan() {
        let bits = value.to_bits() as u64;
        let sign = (bits & 0x8000_0000) << 32;
        let mantissa = bits & 0x7F_FFFF;
        f64::from_bits(sign | F64_EXP_MASK | (mantissa << 29))
    } else {
        value as f64
    }
}

/// Reciprocal estimate with the precision and table of the Espresso `fres` instruction.
pub fn estimate_reciprocal(value: f32) -> f32 {
    let bits = value.to_bits();
    let sign = bits & 0x8000_0000;
    let mut exponent = ((bits >> 23) & 0xFF) as i32;
    let mut mantissa = bits & 0x7F_FFFF;

    if exponent == 0xFF {
        return if mantissa == 0 {
            0.0f32.copysign(value)
        } else {
            f32::from_bits(bits | F32_QUIET_BIT)
        };
    }

    if exponent == 0 {
        if mantissa == 0 {
            return f32::INFINITY.copysign(value);
        } else if mantissa < 0x20_0000 {
            return f32::MAX.copysign(value);
        } else if mantissa < 0x40_0000 {
            exponent = -1;
            mantissa = (mantissa << 2) & 0x7F_FFFF;
        } else {
            mantissa = (mantissa << 1) & 0x7F_FFFF;
        }
    }

    let index = (mantissa >> 18) as usize;
    let delta_mult = (mantissa >> 8) & 0x3FF;
    let lookup = ((FRES_BASE[index] as u32) << 10) - FRES_DELTA[index] as u32 * delta_mult;

    let mut new_exponent = 253 - exponent;
    let mut new_mantissa = lookup >> 1;
    if new_exponent <= 0 {
        new_mantissa = (new_mantissa >> 1) | 0x40_0000;
        if new_exponent < 0 {
            new_mantissa >>= 1;
            new_exponent = 0;
        }
    }

    f32::from_bits(sign | ((new_exponent as u32 & 0xFF) << 23) | (new_mantissa & 0x7F_FFFF))
}

/// Reciprocal square root estimate with the precision and table of the Espresso `frsqrte`
/// instruction.
pub fn estimate_reciprocal_root(value: f64) -> f64 {
    let bits = value.to_bits();
    let negative = bits >> 63 != 0;
    let mut exponent = ((bits >> 52) & 0x7FF) as i32;
    let mut mantissa = bits & F64_MANTISSA_MASK;

    if exponent == 0x7FF {
        return if mantissa != 0 {
            make_quiet(value)
        } else if negative {
            f64::NAN
        } else {
            0.0
        };
    }

    if exponent == 0 {
        if mantissa == 0 {
            return f64::INFINITY.copysign(value);
        }

        let shift = mantissa.leading_zeros() as i32 - 11;
        mantissa = (mantissa << shift) & F64_MANTISSA_MASK;
        exponent -= shift - 1;
    }

    if negative {
        return f64::NAN;
    }

    let index = ((mantissa >> 48) & 15) as usize | if exponent & 1 != 0 { 0 } else { 16 };
    let delta_mult = (mantissa >> 37) & 0x7FF;
    let lookup =
        ((FRSQRTE_BASE[index] as u64) << 11) - FRSQRTE_DELTA[index] as u64 * delta_mult;

    let new_exponent = ((3068 - exponent) / 2) as u64;
    let new_mantissa = (lookup << 26) & F64_MANTISSA_MASK;

    f64::from_bits((new_exponent << 52) | new_mantissa)
}

#[cfg(test)]
mod test {
    use super::*;
    use nanorand::{Rng, WyRand};

    fn random_doubles(count: usize) -> impl Iterator<Item = f64> {
        let mut rng = WyRand::new_seed(0xF10A7);
        (0..count).map(move |_| f64::from_bits(rng.generate::<u64>()))
    }

    #[test]
    fn single_rounding_is_idempotent() {
        for value in random_doubles(100_000).filter(|v| !v.is_nan()) {
            let once = round_to_single(value);
            assert_eq!(round_to_single(once).to_bits(), once.to_bits());

            let once = truncate_to_24_bit(value.to_bits());
            assert_eq!(truncate_to_24_bit(once), once);
        }
    }

    #[test]
    fn truncate_to_24_bit_rounds_on_bit_27() {
        assert_eq!(
            truncate_to_24_bit(0x3FF0_0000_0800_0000),
            0x3FF0_0000_1000_0000
        );
        assert_eq!(
            truncate_to_24_bit(0x3FF0_0000_07FF_FFFF),
            0x3FF0_0000_0000_0000
        );
    }

    #[test]
    fn multiplier_is_kept_for_special_factors() {
        let c = f64::from_bits(0x3FF0_0000_0800_0001);
        assert_eq!(round_for_multiply(0.0, c), (0.0, c));
        assert_eq!(round_for_multiply(f64::INFINITY, c), (f64::INFINITY, c));
        assert_eq!(
            round_for_multiply(2.0, f64::INFINITY),
            (2.0, f64::INFINITY)
        );

        let nan = f64::from_bits(0x7FF8_0000_0000_0001);
        assert_eq!(round_for_multiply(2.0, nan).1.to_bits(), nan.to_bits());

        let (a, narrowed) = round_for_multiply(2.0, c);
        assert_eq!(a, 2.0);
        assert_eq!(narrowed.to_bits(), 0x3FF0_0000_1000_0000);
    }

    #[test]
    fn denormal_multiplier_is_normalized() {
        let a = 2f64.powi(1000);
        let c = f64::from_bits(1);

        let (adjusted_a, adjusted_c) = round_for_multiply(a, c);
        assert_eq!(adjusted_c, 2f64.powi(-1022));
        assert_eq!(adjusted_a, 2f64.powi(948));
        assert_eq!(multiply_single(a, c), 2f64.powi(-74));
        assert_eq!(round_to_single(multiply_single(a, c)), 2f64.powi(-74));

        // a too small to take the exponent: left alone
        let tiny = f64::from_bits(0x0010_0000_0000_0000);
        let c = f64::from_bits(0x0000_0000_0000_0003);
        assert_eq!(round_for_multiply(tiny, c), (tiny, c));
    }

    #[test]
    fn overflowing_multiplier_moves_a_power_of_two() {
        let a = 2f64.powi(-1000);
        let (adjusted_a, adjusted_c) = round_for_multiply(a, f64::MAX);
        assert_eq!(adjusted_c, 2f64.powi(1023));
        assert_eq!(adjusted_a, 2f64.powi(-999));

        let product = multiply_single(a, f64::MAX);
        assert!(product.is_finite());
        assert_eq!(product, 2f64.powi(24));

        // denormal a is doubled instead
        let a = f64::from_bits(0x8000_0000_0000_0004);
        let (adjusted_a, _) = round_for_multiply(a, f64::MAX);
        assert_eq!(adjusted_a.to_bits(), 0x8000_0000_0000_0008);
    }

    #[test]
    fn multiply_matches_narrowed_product() {
        let mut rng = WyRand::new_seed(0x24B17);
        for _ in 0..100_000 {
            let a = f64::from_bits(rng.generate::<u64>());
            let c = f64::from_bits(rng.generate::<u64>());
            if !a.is_normal() || !c.is_normal() || c.abs() > 1e300 {
                continue;
            }

            let narrowed = f64::from_bits(truncate_to_24_bit(c.to_bits()));
            assert_eq!(multiply_single(a, c).to_bits(), (a * narrowed).to_bits());
        }
    }

    #[test]
    fn truncation_chops() {
        // 1 + 2^-24 + 2^-25 would round up
        let value = 1.0 + 2f64.powi(-24) + 2f64.powi(-25);
        assert_eq!(truncate_double(value), 1.0);
        assert_eq!(truncate_double(-2.5), -2.5);
        assert_eq!(truncate_double(1e300), f32::MAX);
        assert_eq!(truncate_double(-1e300), -f32::MAX);
        assert_eq!(truncate_double(1e-300).to_bits(), 0);

        // smallest single denormal
        let denormal = f32::from_bits(1);
        assert_eq!(truncate_double(denormal as f64), denormal);
    }

    #[test]
    fn truncation_matches_exact_singles() {
        let mut rng = WyRand::new_seed(0x516);
        for _ in 0..100_000 {
            let single = f32::from_bits(rng.generate::<u32>());
            if single.is_nan() {
                continue;
            }

            assert_eq!(truncate_double(single as f64).to_bits(), single.to_bits());
        }
    }

    #[test]
    fn signalling_nans_survive_narrowing() {
        let snan = f64::from_bits(0x7FF0_0000_2000_0000);
        assert!(is_signalling_nan(snan));
        assert!(!is_signalling_nan(make_quiet(snan)));

        let narrowed = truncate_double(snan);
        assert_eq!(narrowed.to_bits(), 0x7F80_0001);
        assert!(is_signalling_nan(extend_single(narrowed)));

        let tiny_payload = f64::from_bits(0x7FF0_0000_0000_0001);
        assert!(truncate_double(tiny_payload).is_nan());
    }

    #[test]
    fn reciprocal_estimate_precision() {
        for value in [1.0f32, 1.5, 2.0, 3.0, 0.1, 1234.5, -7.25, 1e-30, 3e30] {
            let estimate = estimate_reciprocal(value) as f64;
            let exact = 1.0 / value as f64;
            assert!(
                ((estimate - exact) / exact).abs() < 1.0 / 2048.0,
                "{value}: {estimate} vs {exact}"
            );
        }
    }

    #[test]
    fn reciprocal_estimate_special_values() {
        assert_eq!(estimate_reciprocal(0.0), f32::INFINITY);
        assert_eq!(estimate_reciprocal(-0.0), f32::NEG_INFINITY);
        assert_eq!(estimate_reciprocal(f32::INFINITY).to_bits(), 0);
        assert_eq!(estimate_reciprocal(f32::from_bits(1)), f32::MAX);
        assert!(estimate_reciprocal(f32::NAN).is_nan());
    }

    #[test]
    fn reciprocal_root_estimate_precision() {
        for value in [1.0f64, 2.0, 4.0, 10.0, 0.3, 12345.678, 1e-200, 5e250] {
            let estimate = estimate_reciprocal_root(value);
            let exact = 1.0 / value.sqrt();
            assert!(
                ((estimate - exact) / exact).abs() < 1.0 / 1024.0,
                "{value}: {estimate} vs {exact}"
            );
        }

        let denormal = f64::from_bits(0x0000_8000_0000_0000);
        let exact = 1.0 / denormal.sqrt();
        let estimate = estimate_reciprocal_root(denormal);
        assert!(((estimate - exact) / exact).abs() < 1.0 / 1024.0);
    }

    #[test]
    fn reciprocal_root_estimate_special_values() {
        assert_eq!(estimate_reciprocal_root(0.0), f64::INFINITY);
        assert_eq!(estimate_reciprocal_root(-0.0), f64::NEG_INFINITY);
        assert_eq!(estimate_reciprocal_root(f64::INFINITY), 0.0);
        assert!(estimate_reciprocal_root(f64::NEG_INFINITY).is_nan());
        assert!(estimate_reciprocal_root(-4.0).is_nan());
    }
}
