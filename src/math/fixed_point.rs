use alloy::primitives::{uint, U256};

use super::log_exp;
use super::{MathError, MathResult};

/// 1.0 in 18-decimal fixed point
pub const ONE: U256 = uint!(1_000_000_000_000_000_000_U256);
pub const TWO: U256 = uint!(2_000_000_000_000_000_000_U256);
pub const FOUR: U256 = uint!(4_000_000_000_000_000_000_U256);

/// Relative error bound applied by `pow_up` (1e-14)
pub const MAX_POW_RELATIVE_ERROR: U256 = uint!(10000_U256);

fn checked_mul(a: U256, b: U256, op: &'static str) -> MathResult<U256> {
    a.checked_mul(b).ok_or(MathError::Overflow(op))
}

pub fn add(a: U256, b: U256) -> MathResult<U256> {
    a.checked_add(b).ok_or(MathError::Overflow("add"))
}

pub fn sub(a: U256, b: U256) -> MathResult<U256> {
    a.checked_sub(b).ok_or(MathError::Underflow("sub"))
}

pub fn mul_down(a: U256, b: U256) -> MathResult<U256> {
    Ok(checked_mul(a, b, "mul_down")? / ONE)
}

pub fn mul_up(a: U256, b: U256) -> MathResult<U256> {
    let product = checked_mul(a, b, "mul_up")?;
    if product.is_zero() {
        Ok(U256::ZERO)
    } else {
        Ok((product - U256::from(1)) / ONE + U256::from(1))
    }
}

pub fn div_down(a: U256, b: U256) -> MathResult<U256> {
    if b.is_zero() {
        return Err(MathError::DivisionByZero("div_down"));
    }
    if a.is_zero() {
        return Ok(U256::ZERO);
    }
    Ok(checked_mul(a, ONE, "div_down")? / b)
}

pub fn div_up(a: U256, b: U256) -> MathResult<U256> {
    if b.is_zero() {
        return Err(MathError::DivisionByZero("div_up"));
    }
    if a.is_zero() {
        return Ok(U256::ZERO);
    }
    let inflated = checked_mul(a, ONE, "div_up")?;
    Ok((inflated - U256::from(1)) / b + U256::from(1))
}

/// `1 - x`, clamped at zero
pub fn complement(x: U256) -> U256 {
    if x < ONE {
        ONE - x
    } else {
        U256::ZERO
    }
}

/// `x^y` rounded up, with the exact fast paths for integral exponents 1, 2 and 4.
pub fn pow_up(x: U256, y: U256) -> MathResult<U256> {
    if y == ONE {
        Ok(x)
    } else if y == TWO {
        mul_up(x, x)
    } else if y == FOUR {
        let square = mul_up(x, x)?;
        mul_up(square, square)
    } else {
        pow_up_legacy(x, y)
    }
}

/// `x^y` rounded up through `LogExpMath` for every exponent (first-generation weighted pools).
pub fn pow_up_legacy(x: U256, y: U256) -> MathResult<U256> {
    let raw = log_exp::pow(x, y)?;
    let max_error = add(mul_up(raw, MAX_POW_RELATIVE_ERROR)?, U256::from(1))?;
    add(raw, max_error)
}

fn decimal_scale(decimals: u8) -> MathResult<U256> {
    if decimals > 18 {
        return Err(MathError::OutOfBounds("token decimals"));
    }
    Ok(U256::from(10u64).pow(U256::from(18 - decimals)))
}

/// Scale a raw token amount to 18 decimals
pub fn upscale(amount: U256, decimals: u8) -> MathResult<U256> {
    checked_mul(amount, decimal_scale(decimals)?, "upscale")
}

/// Scale an 18-decimal amount back to raw token units, rounding down
pub fn downscale_down(amount: U256, decimals: u8) -> MathResult<U256> {
    Ok(amount / decimal_scale(decimals)?)
}

/// Spot price (token out per token in, 18 decimals) of a weighted pool including the swap fee.
pub fn weighted_spot_price(
    balance_in: U256,
    weight_in: U256,
    balance_out: U256,
    weight_out: U256,
    swap_fee: U256,
) -> MathResult<U256> {
    let numer = div_down(balance_in, weight_in)?;
    let denom = div_down(balance_out, weight_out)?;
    let ratio = div_down(numer, denom)?;
    let scale = div_down(ONE, complement(swap_fee))?;
    let price_in_per_out = mul_down(ratio, scale)?;
    div_down(ONE, price_in_per_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_directions() {
        let a = U256::from(1);
        let b = U256::from(3) * ONE / U256::from(10); // 0.3
        assert_eq!(mul_down(a, b).unwrap(), U256::ZERO);
        assert_eq!(mul_up(a, b).unwrap(), U256::from(1));

        assert_eq!(div_down(U256::from(1000), U256::from(1100)).unwrap(), U256::from(909090909090909090u64));
        assert_eq!(div_up(U256::from(1000), U256::from(1100)).unwrap(), U256::from(909090909090909091u64));
    }

    #[test]
    fn test_complement_clamps() {
        assert_eq!(complement(ONE + U256::from(5)), U256::ZERO);
        assert_eq!(complement(U256::from(3) * ONE / U256::from(10)), U256::from(7) * ONE / U256::from(10));
    }

    #[test]
    fn test_pow_up_fast_paths_are_exact() {
        let x = U256::from(909090909090909091u64);
        assert_eq!(pow_up(x, ONE).unwrap(), x);
        assert_eq!(pow_up(x, TWO).unwrap(), mul_up(x, x).unwrap());
    }

    #[test]
    fn test_pow_up_legacy_bounds_from_above() {
        let x = U256::from(909090909090909091u64);
        let raw = log_exp::pow(x, ONE).unwrap();
        let up = pow_up_legacy(x, ONE).unwrap();
        assert!(up > raw);
        // within 1e-13 of the exact base
        let diff = if up > x { up - x } else { x - up };
        assert!(diff < U256::from(100_000u64));
    }

    #[test]
    fn test_scaling() {
        let six = U256::from(1_500_000u64); // 1.5 USDC
        let up = upscale(six, 6).unwrap();
        assert_eq!(up, U256::from(15) * ONE / U256::from(10));
        assert_eq!(downscale_down(up + U256::from(999), 6).unwrap(), six);
        assert!(upscale(six, 19).is_err());
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(div_down(ONE, U256::ZERO), Err(MathError::DivisionByZero("div_down")));
    }
}
