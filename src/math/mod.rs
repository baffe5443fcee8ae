//! Fixed-point AMM math
//!
//! Integer re-implementations of the on-chain math each supported protocol
//! uses, with the same rounding direction at every step:
//! - `fixed_point`: Balancer V2 `FixedPoint` (18-decimal, explicit up/down rounding)
//! - `log_exp`: Balancer V2 `LogExpMath` (fixed-point ln/exp used by `pow`)
//! - `bmath`: Balancer V1 `BNum`/`BMath` (round-half-up, approximated `bpow`)
//! - `constant_product`: Uniswap V2 style `getAmountOut`

pub mod bmath;
pub mod constant_product;
pub mod fixed_point;
pub mod log_exp;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MathError {
    #[error("fixed-point overflow in {0}")]
    Overflow(&'static str),
    #[error("fixed-point underflow in {0}")]
    Underflow(&'static str),
    #[error("division by zero in {0}")]
    DivisionByZero(&'static str),
    #[error("{0} argument out of bounds")]
    OutOfBounds(&'static str),
}

pub type MathResult<T> = Result<T, MathError>;
