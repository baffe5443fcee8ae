//! Balancer V1 pool math (`BNum` / `BMath`)
//!
//! Multiplication and division round half up; `bpow` splits the exponent into a whole
//! part (square-and-multiply) and a fractional part (binomial series approximation).

use alloy::primitives::{uint, U256};

use super::{MathError, MathResult};

pub const BONE: U256 = uint!(1_000_000_000_000_000_000_U256);
pub const MIN_BPOW_BASE: U256 = uint!(1_U256);
pub const MAX_BPOW_BASE: U256 = uint!(1_999_999_999_999_999_999_U256);
pub const BPOW_PRECISION: U256 = uint!(100_000_000_U256);
/// A single swap may not bring in more than half the pool's balance
pub const MAX_IN_RATIO: U256 = uint!(500_000_000_000_000_000_U256);

// the series converges well before this for any base inside the bpow bounds
const MAX_APPROX_TERMS: u32 = 10_000;

pub fn badd(a: U256, b: U256) -> MathResult<U256> {
    a.checked_add(b).ok_or(MathError::Overflow("badd"))
}

pub fn bsub(a: U256, b: U256) -> MathResult<U256> {
    a.checked_sub(b).ok_or(MathError::Underflow("bsub"))
}

/// `|a - b|` and whether the difference is negative
pub fn bsub_sign(a: U256, b: U256) -> (U256, bool) {
    if a >= b {
        (a - b, false)
    } else {
        (b - a, true)
    }
}

pub fn bmul(a: U256, b: U256) -> MathResult<U256> {
    let c0 = a.checked_mul(b).ok_or(MathError::Overflow("bmul"))?;
    let c1 = badd(c0, BONE / U256::from(2))?;
    Ok(c1 / BONE)
}

pub fn bdiv(a: U256, b: U256) -> MathResult<U256> {
    if b.is_zero() {
        return Err(MathError::DivisionByZero("bdiv"));
    }
    let c0 = a.checked_mul(BONE).ok_or(MathError::Overflow("bdiv"))?;
    let c1 = badd(c0, b / U256::from(2))?;
    Ok(c1 / b)
}

fn bfloor(a: U256) -> U256 {
    (a / BONE) * BONE
}

/// `a^n` for a whole number `n`
pub fn bpowi(a: U256, n: U256) -> MathResult<U256> {
    let two = U256::from(2);
    let mut a = a;
    let mut n = n;
    let mut z = if n % two != U256::ZERO { a } else { BONE };

    n /= two;
    while !n.is_zero() {
        a = bmul(a, a)?;
        if n % two != U256::ZERO {
            z = bmul(z, a)?;
        }
        n /= two;
    }
    Ok(z)
}

/// `base^exp` for 18-decimal base in `[MIN_BPOW_BASE, MAX_BPOW_BASE]`
pub fn bpow(base: U256, exp: U256) -> MathResult<U256> {
    if base < MIN_BPOW_BASE || base > MAX_BPOW_BASE {
        return Err(MathError::OutOfBounds("bpow base"));
    }

    let whole = bfloor(exp);
    let remain = exp - whole;

    let whole_pow = bpowi(base, whole / BONE)?;
    if remain.is_zero() {
        return Ok(whole_pow);
    }

    let partial = bpow_approx(base, remain, BPOW_PRECISION)?;
    bmul(whole_pow, partial)
}

/// Binomial expansion of `base^exp` for a fractional `exp`, stopping once a term drops below `precision`
pub fn bpow_approx(base: U256, exp: U256, precision: U256) -> MathResult<U256> {
    let a = exp;
    let (x, xneg) = bsub_sign(base, BONE);
    let mut term = BONE;
    let mut sum = term;
    let mut negative = false;

    let mut i: u32 = 1;
    while term >= precision {
        if i > MAX_APPROX_TERMS {
            return Err(MathError::OutOfBounds("bpow_approx convergence"));
        }
        let big_k = U256::from(i) * BONE;
        let (c, cneg) = bsub_sign(a, bsub(big_k, BONE)?);
        term = bmul(term, bmul(c, x)?)?;
        term = bdiv(term, big_k)?;
        if term.is_zero() {
            break;
        }

        if xneg {
            negative = !negative;
        }
        if cneg {
            negative = !negative;
        }
        sum = if negative { bsub(sum, term)? } else { badd(sum, term)? };
        i += 1;
    }

    Ok(sum)
}

/// Output of an exact-in swap
pub fn calc_out_given_in(
    balance_in: U256,
    weight_in: U256,
    balance_out: U256,
    weight_out: U256,
    amount_in: U256,
    swap_fee: U256,
) -> MathResult<U256> {
    let weight_ratio = bdiv(weight_in, weight_out)?;
    let adjusted_in = bmul(amount_in, bsub(BONE, swap_fee)?)?;
    let y = bdiv(balance_in, badd(balance_in, adjusted_in)?)?;
    let foo = bpow(y, weight_ratio)?;
    let bar = bsub(BONE, foo)?;
    bmul(balance_out, bar)
}

/// Spot price (token in per token out) including the swap fee
pub fn calc_spot_price(
    balance_in: U256,
    weight_in: U256,
    balance_out: U256,
    weight_out: U256,
    swap_fee: U256,
) -> MathResult<U256> {
    let numer = bdiv(balance_in, weight_in)?;
    let denom = bdiv(balance_out, weight_out)?;
    let ratio = bdiv(numer, denom)?;
    let scale = bdiv(BONE, bsub(BONE, swap_fee)?)?;
    bmul(ratio, scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e18(n: u64) -> U256 {
        U256::from(n) * BONE
    }

    #[test]
    fn test_bmul_bdiv_round_half_up() {
        // 1.5 wei rounds to 2
        assert_eq!(bmul(U256::from(3), BONE / U256::from(2)).unwrap(), U256::from(2));
        assert_eq!(bdiv(e18(1000), e18(1100)).unwrap(), U256::from(909090909090909091u64));
        assert!(bdiv(BONE, U256::ZERO).is_err());
    }

    #[test]
    fn test_bpowi_matches_repeated_multiplication() {
        let half = BONE / U256::from(2);
        assert_eq!(bpowi(half, U256::from(3)).unwrap(), BONE / U256::from(8));
        assert_eq!(bpowi(half, U256::ZERO).unwrap(), BONE);
    }

    #[test]
    fn test_bpow_fractional_exponent() {
        // 0.81^0.5 = 0.9
        let base = U256::from(810_000_000_000_000_000u64);
        let result = bpow(base, BONE / U256::from(2)).unwrap();
        let expected = U256::from(900_000_000_000_000_000u64);
        let diff = if result > expected { result - expected } else { expected - result };
        assert!(diff < U256::from(10_000_000_000u64), "got {result}");
    }

    #[test]
    fn test_bpow_rejects_out_of_range_base() {
        assert!(bpow(e18(2), BONE).is_err());
        assert!(bpow(U256::ZERO, BONE).is_err());
    }

    #[test]
    fn test_calc_out_given_in_equal_weights() {
        let out = calc_out_given_in(e18(1000), e18(5), e18(1000), e18(5), e18(100), U256::ZERO).unwrap();
        assert_eq!(out, U256::from(90909090909090909000u128));
    }

    #[test]
    fn test_spot_price_with_fee() {
        // 0.3% fee on a balanced pool
        let fee = U256::from(3_000_000_000_000_000u64);
        let price = calc_spot_price(e18(1000), e18(1), e18(1000), e18(1), fee).unwrap();
        assert!(price > BONE);
        assert!(price < BONE + BONE / U256::from(100));
    }
}
