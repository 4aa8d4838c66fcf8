//! IEEE-754 binary16 conversion for displacement directions.

/// Convert to half precision bits, rounding to nearest even.
#[must_use]
pub fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xFF) as i32;
    let mantissa = bits & 0x007F_FFFF;

    if exponent == 0xFF {
        // Inf stays inf; NaN keeps a quiet payload bit.
        let nan = if mantissa == 0 { 0 } else { 0x0200 };
        return sign | 0x7C00 | nan;
    }

    let half_exponent = exponent - 127 + 15;
    if half_exponent >= 0x1F {
        return sign | 0x7C00;
    }

    if half_exponent <= 0 {
        // Subnormal half, or underflow to signed zero.
        if half_exponent < -10 {
            return sign;
        }
        let full = mantissa | 0x0080_0000;
        let shift = (14 - half_exponent) as u32;
        return sign | round_shift(full, shift) as u16;
    }

    // A carry out of the mantissa correctly bumps the exponent.
    let rounded = round_shift(mantissa, 13);
    sign | (((half_exponent as u32) << 10) + rounded) as u16
}

/// `value >> shift`, rounding half to even.
fn round_shift(value: u32, shift: u32) -> u32 {
    let truncated = value >> shift;
    let remainder = value & ((1 << shift) - 1);
    let halfway = 1 << (shift - 1);
    if remainder > halfway || (remainder == halfway && truncated & 1 == 1) {
        truncated + 1
    } else {
        truncated
    }
}

/// Convert half precision bits back to `f32`.
#[must_use]
pub fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits & 0x8000) << 16;
    let exponent = u32::from((bits >> 10) & 0x1F);
    let mantissa = u32::from(bits & 0x03FF);

    let out = match (exponent, mantissa) {
        (0, 0) => sign,
        (0, m) => {
            // Renormalize the subnormal.
            let shift = m.leading_zeros() - 21;
            let m = (m << shift) & 0x03FF;
            sign | ((113 - shift) << 23) | (m << 13)
        }
        (0x1F, m) => sign | 0x7F80_0000 | (m << 13),
        (e, m) => sign | ((e + 112) << 23) | (m << 13),
    };
    f32::from_bits(out)
}
