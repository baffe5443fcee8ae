//! Fixed-point natural logarithm and exponent (18-decimal in and out, 20/36-decimal internally).
//!
//! Mirrors the vault's `LogExpMath` step for step; every division truncates toward zero.

use alloy::primitives::{uint, I256, U256};

use super::{MathError, MathResult};

const fn fixed(v: U256) -> I256 {
    I256::from_raw(v)
}

const ONE_18: I256 = fixed(uint!(1000000000000000000_U256));
const ONE_20: I256 = fixed(uint!(100000000000000000000_U256));
const ONE_36: I256 = fixed(uint!(1000000000000000000000000000000000000_U256));

const MAX_NATURAL_EXPONENT: I256 = fixed(uint!(130000000000000000000_U256));
// magnitude of the (negative) lower bound, -41e18
const MIN_NATURAL_EXPONENT_ABS: I256 = fixed(uint!(41000000000000000000_U256));

const LN_36_LOWER_BOUND: I256 = fixed(uint!(900000000000000000_U256));
const LN_36_UPPER_BOUND: I256 = fixed(uint!(1100000000000000000_U256));

// 18 decimals
const X0: I256 = fixed(uint!(128000000000000000000_U256));
const A0: I256 = fixed(uint!(38877084059945950922200000000000000000000000000000000000_U256));
const X1: I256 = fixed(uint!(64000000000000000000_U256));
const A1: I256 = fixed(uint!(6235149080811616882910000000_U256));

// 20 decimals
const X2: I256 = fixed(uint!(3200000000000000000000_U256));
const A2: I256 = fixed(uint!(7896296018268069516100000000000000_U256));
const X3: I256 = fixed(uint!(1600000000000000000000_U256));
const A3: I256 = fixed(uint!(888611052050787263676000000_U256));
const X4: I256 = fixed(uint!(800000000000000000000_U256));
const A4: I256 = fixed(uint!(298095798704172827474000_U256));
const X5: I256 = fixed(uint!(400000000000000000000_U256));
const A5: I256 = fixed(uint!(5459815003314423907810_U256));
const X6: I256 = fixed(uint!(200000000000000000000_U256));
const A6: I256 = fixed(uint!(738905609893065022723_U256));
const X7: I256 = fixed(uint!(100000000000000000000_U256));
const A7: I256 = fixed(uint!(271828182845904523536_U256));
const X8: I256 = fixed(uint!(50000000000000000000_U256));
const A8: I256 = fixed(uint!(164872127070012814685_U256));
const X9: I256 = fixed(uint!(25000000000000000000_U256));
const A9: I256 = fixed(uint!(128402541668774148407_U256));
const X10: I256 = fixed(uint!(12500000000000000000_U256));
const A10: I256 = fixed(uint!(113314845306682631683_U256));
const X11: I256 = fixed(uint!(6250000000000000000_U256));
const A11: I256 = fixed(uint!(106449445891785942956_U256));

fn small(n: u64) -> I256 {
    I256::from_raw(U256::from(n))
}

/// `x^y` for 18-decimal `x` and `y`
pub fn pow(x: U256, y: U256) -> MathResult<U256> {
    if y.is_zero() {
        return Ok(ONE_18.into_raw());
    }
    if x.is_zero() {
        return Ok(U256::ZERO);
    }
    if x.bit(255) {
        return Err(MathError::OutOfBounds("pow base"));
    }
    let mild_exponent_bound = (U256::from(1) << 254) / ONE_20.into_raw();
    if y >= mild_exponent_bound {
        return Err(MathError::OutOfBounds("pow exponent"));
    }

    let x_int = I256::from_raw(x);
    let y_int = I256::from_raw(y);

    let mut logx_times_y = if LN_36_LOWER_BOUND < x_int && x_int < LN_36_UPPER_BOUND {
        let ln_36_x = ln_36(x_int);
        (ln_36_x / ONE_18) * y_int + ((ln_36_x % ONE_18) * y_int) / ONE_18
    } else {
        ln(x_int) * y_int
    };
    logx_times_y = logx_times_y / ONE_18;

    if logx_times_y < -MIN_NATURAL_EXPONENT_ABS || logx_times_y > MAX_NATURAL_EXPONENT {
        return Err(MathError::OutOfBounds("pow product"));
    }

    Ok(exp(logx_times_y)?.into_raw())
}

/// `e^x` for 18-decimal `x`
pub fn exp(x: I256) -> MathResult<I256> {
    if x < -MIN_NATURAL_EXPONENT_ABS || x > MAX_NATURAL_EXPONENT {
        return Err(MathError::OutOfBounds("exp"));
    }

    if x.is_negative() {
        return Ok((ONE_18 * ONE_18) / exp(-x)?);
    }

    let mut x = x;
    let first_an = if x >= X0 {
        x = x - X0;
        A0
    } else if x >= X1 {
        x = x - X1;
        A1
    } else {
        small(1)
    };

    x = x * small(100);

    let mut product = ONE_20;
    for (xn, an) in [(X2, A2), (X3, A3), (X4, A4), (X5, A5), (X6, A6), (X7, A7), (X8, A8), (X9, A9)] {
        if x >= xn {
            x = x - xn;
            product = (product * an) / ONE_20;
        }
    }

    let mut series_sum = ONE_20;
    let mut term = x;
    series_sum = series_sum + term;
    for k in 2..=12u64 {
        term = ((term * x) / ONE_20) / small(k);
        series_sum = series_sum + term;
    }

    Ok((((product * series_sum) / ONE_20) * first_an) / small(100))
}

/// Natural log of an 18-decimal value, 18-decimal result
fn ln(a: I256) -> I256 {
    if a < ONE_18 {
        return -ln((ONE_18 * ONE_18) / a);
    }

    let mut a = a;
    let mut sum = I256::ZERO;
    if a >= A0 * ONE_18 {
        a = a / A0;
        sum = sum + X0;
    }
    if a >= A1 * ONE_18 {
        a = a / A1;
        sum = sum + X1;
    }

    sum = sum * small(100);
    a = a * small(100);

    for (xn, an) in [
        (X2, A2),
        (X3, A3),
        (X4, A4),
        (X5, A5),
        (X6, A6),
        (X7, A7),
        (X8, A8),
        (X9, A9),
        (X10, A10),
        (X11, A11),
    ] {
        if a >= an {
            a = (a * ONE_20) / an;
            sum = sum + xn;
        }
    }

    let z = ((a - ONE_20) * ONE_20) / (a + ONE_20);
    let z_squared = (z * z) / ONE_20;

    let mut num = z;
    let mut series_sum = num;
    for k in [3u64, 5, 7, 9, 11] {
        num = (num * z_squared) / ONE_20;
        series_sum = series_sum + num / small(k);
    }
    series_sum = series_sum * small(2);

    (sum + series_sum) / small(100)
}

/// High-precision ln for arguments close to one, 36-decimal result
fn ln_36(x: I256) -> I256 {
    let x = x * ONE_18;

    let z = ((x - ONE_36) * ONE_36) / (x + ONE_36);
    let z_squared = (z * z) / ONE_36;

    let mut num = z;
    let mut series_sum = num;
    for k in [3u64, 5, 7, 9, 11, 13, 15] {
        num = (num * z_squared) / ONE_36;
        series_sum = series_sum + num / small(k);
    }

    series_sum * small(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(actual: U256, expected: U256, tolerance: u64) -> bool {
        let diff = if actual > expected { actual - expected } else { expected - actual };
        diff <= U256::from(tolerance)
    }

    #[test]
    fn test_exp_zero_is_one() {
        assert_eq!(exp(I256::ZERO).unwrap(), ONE_18);
    }

    #[test]
    fn test_pow_integral_exponents() {
        let one = ONE_18.into_raw();
        let two = one * U256::from(2);
        let four = one * U256::from(4);
        // 2^2 = 4 to within 1e-12 relative
        assert!(close(pow(two, two).unwrap(), four, 4_000_000));
        // x^1 near one uses the 36-digit ln path
        let x = U256::from(950_000_000_000_000_000u64);
        assert!(close(pow(x, one).unwrap(), x, 1_000));
    }

    #[test]
    fn test_pow_fractional_exponent() {
        let one = ONE_18.into_raw();
        // 4^0.5 = 2
        let four = one * U256::from(4);
        let half = one / U256::from(2);
        assert!(close(pow(four, half).unwrap(), one * U256::from(2), 2_000_000));
    }

    #[test]
    fn test_pow_rejects_huge_exponent() {
        assert!(pow(U256::from(2), U256::MAX >> 1).is_err());
    }
}
