use alloy::primitives::U256;

use super::{MathError, MathResult};

/// Uniswap V2 family fee: 0.3% (997 / 1000 retained)
pub const FEE_NUMERATOR: u64 = 997;
pub const FEE_DENOMINATOR: u64 = 1000;

/// `getAmountOut` from the V2 router library
pub fn get_amount_out(amount_in: U256, reserve_in: U256, reserve_out: U256) -> MathResult<U256> {
    if amount_in.is_zero() {
        return Ok(U256::ZERO);
    }
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(MathError::DivisionByZero("get_amount_out"));
    }

    let amount_in_with_fee = amount_in
        .checked_mul(U256::from(FEE_NUMERATOR))
        .ok_or(MathError::Overflow("get_amount_out"))?;
    let numerator = amount_in_with_fee
        .checked_mul(reserve_out)
        .ok_or(MathError::Overflow("get_amount_out"))?;
    let denominator = reserve_in
        .checked_mul(U256::from(FEE_DENOMINATOR))
        .and_then(|r| r.checked_add(amount_in_with_fee))
        .ok_or(MathError::Overflow("get_amount_out"))?;

    Ok(numerator / denominator)
}

/// Marginal price of `token_out` per `token_in` after the swap, scaled to 1e18
pub fn spot_price_after(amount_in: U256, amount_out: U256, reserve_in: U256, reserve_out: U256) -> MathResult<U256> {
    let new_in = reserve_in
        .checked_add(amount_in)
        .ok_or(MathError::Overflow("spot_price_after"))?;
    let new_out = reserve_out
        .checked_sub(amount_out)
        .ok_or(MathError::Underflow("spot_price_after"))?;
    if new_in.is_zero() {
        return Err(MathError::DivisionByZero("spot_price_after"));
    }
    let scaled = new_out
        .checked_mul(U256::from(10u64).pow(U256::from(18)))
        .and_then(|v| v.checked_mul(U256::from(FEE_NUMERATOR)))
        .ok_or(MathError::Overflow("spot_price_after"))?;
    Ok(scaled / (new_in * U256::from(FEE_DENOMINATOR)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_amount_out_known_value() {
        // 1 in against (1000, 1000): 997 * 1000 / (1000 * 1000 + 997)
        let out = get_amount_out(U256::from(1), U256::from(1000), U256::from(1000)).unwrap();
        assert_eq!(out, U256::ZERO);

        let out = get_amount_out(U256::from(100), U256::from(1000), U256::from(1000)).unwrap();
        assert_eq!(out, U256::from(90)); // 99700000 / 1099700
    }

    #[test]
    fn test_get_amount_out_never_drains_pool() {
        let reserve = U256::from(1_000_000u64);
        let out = get_amount_out(U256::MAX / U256::from(1u128 << 80), reserve, reserve).unwrap();
        assert!(out < reserve);
    }

    #[test]
    fn test_empty_reserves_error() {
        assert!(get_amount_out(U256::from(5), U256::ZERO, U256::from(10)).is_err());
        assert_eq!(get_amount_out(U256::ZERO, U256::ZERO, U256::ZERO).unwrap(), U256::ZERO);
    }

    #[test]
    fn test_spot_price_after_moves_against_trader() {
        let reserve = U256::from(10u64).pow(U256::from(24));
        let amount_in = U256::from(10u64).pow(U256::from(22));
        let out = get_amount_out(amount_in, reserve, reserve).unwrap();
        let before = spot_price_after(U256::ZERO, U256::ZERO, reserve, reserve).unwrap();
        let after = spot_price_after(amount_in, out, reserve, reserve).unwrap();
        assert!(after < before);
    }
}
