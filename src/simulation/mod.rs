//! Relay execution and failure analysis inside a sandbox
//!
//! - `plan`: expected token movements and the relay contract calldata
//! - `trace`: `callTracer` call trees and ERC20 call decoding
//! - `diagnosis`: classification of a failed relay from its trace
//! - `shoot`: the snapshot/attempt/diagnose/retry loop

pub mod diagnosis;
pub mod plan;
pub mod shoot;
pub mod trace;

pub use diagnosis::Diagnosis;
pub use shoot::{shoot, ShootOutcome, ShootSuccess};
