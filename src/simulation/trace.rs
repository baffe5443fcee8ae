//! Call trees from `debug_traceTransaction` with the `callTracer`

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::{Revert, SolError, SolInterface};
use serde::Deserialize;

use crate::erc20::IERC20::IERC20Calls;

/// One frame of a `callTracer` result
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub input: Bytes,
    #[serde(default)]
    pub output: Option<Bytes>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub revert_reason: Option<String>,
    #[serde(default)]
    pub gas_used: Option<U256>,
    #[serde(default)]
    pub calls: Vec<CallFrame>,
}

impl CallFrame {
    /// Callee; creations have none
    pub fn callee(&self) -> Option<Address> {
        self.to
    }

    pub fn is_call(&self) -> bool {
        self.kind.contains("CALL")
    }

    pub fn reverted(&self) -> bool {
        self.error.is_some()
    }

    /// Revert message, decoded from `Error(string)` when the tracer did not already
    pub fn revert_message(&self) -> Option<String> {
        if !self.reverted() {
            return None;
        }
        if let Some(reason) = &self.revert_reason {
            return Some(reason.trim().to_string());
        }
        self.output
            .as_ref()
            .and_then(|out| Revert::abi_decode(out).ok())
            .map(|r| r.reason.trim().to_string())
    }

    /// Returned without reverting and with a non-empty payload
    pub fn returned_data(&self) -> Option<&Bytes> {
        if self.reverted() {
            return None;
        }
        self.output.as_ref().filter(|o| !o.is_empty())
    }

    /// Returned a payload whose first word is zero, i.e. `false` from `transfer`
    pub fn returned_false(&self) -> bool {
        match self.returned_data() {
            Some(out) => out.iter().take(32).all(|b| *b == 0),
            None => false,
        }
    }

    /// First returned word as an unsigned integer
    pub fn returned_word(&self) -> Option<U256> {
        let out = self.returned_data()?;
        if out.len() < 32 {
            return None;
        }
        Some(U256::from_be_slice(&out[..32]))
    }

    /// Frames in execution order. Children of frames for which `descend` is false are skipped.
    pub fn walk<'a>(&'a self, descend: impl Fn(&CallFrame) -> bool) -> Vec<&'a CallFrame> {
        let mut order = Vec::new();
        let mut stack = vec![self];
        while let Some(frame) = stack.pop() {
            order.push(frame);
            if descend(frame) {
                stack.extend(frame.calls.iter().rev().filter(|c| c.is_call()));
            }
        }
        order
    }
}

/// ERC20 calls the diagnosis cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenCall {
    /// `transfer` or `transferFrom`, with the sender resolved
    Transfer { from: Address, to: Address, amount: U256 },
    BalanceOf { owner: Address },
    /// Any other ERC20 function
    Other,
}

/// Decode a frame's input as an ERC20 call; `None` when the selector is not ERC20
pub fn decode_token_call(frame: &CallFrame) -> Option<TokenCall> {
    let call = IERC20Calls::abi_decode(&frame.input).ok()?;
    Some(match call {
        IERC20Calls::transfer(c) => TokenCall::Transfer {
            from: frame.from,
            to: c.to,
            amount: c.amount,
        },
        IERC20Calls::transferFrom(c) => TokenCall::Transfer {
            from: c.from,
            to: c.to,
            amount: c.amount,
        },
        IERC20Calls::balanceOf(c) => TokenCall::BalanceOf { owner: c.owner },
        _ => TokenCall::Other,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::pricers::test_support::token;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_deserialize_call_tracer_output() {
        let raw = serde_json::json!({
            "type": "CALL",
            "from": "0x0000000000000000000000000000000000000001",
            "to": "0x0000000000000000000000000000000000000002",
            "input": "0x",
            "gasUsed": "0x5208",
            "error": "execution reverted",
            "revertReason": "UniswapV2: OVERFLOW",
            "calls": [
                {"type": "STATICCALL", "from": "0x0000000000000000000000000000000000000002",
                 "to": "0x0000000000000000000000000000000000000003", "input": "0x", "output": "0x"}
            ]
        });
        let frame: CallFrame = serde_json::from_value(raw).unwrap();
        assert!(frame.reverted());
        assert_eq!(frame.revert_message().as_deref(), Some("UniswapV2: OVERFLOW"));
        assert_eq!(frame.gas_used, Some(U256::from(21000u64)));
        assert_eq!(frame.calls[0].callee(), Some(token(3)));
    }

    #[test]
    fn test_revert_message_decoded_from_output() {
        let f = reverting(frame(token(1), token(2), vec![], vec![]), "ERR_MATH_APPROX");
        assert_eq!(f.revert_message().as_deref(), Some("ERR_MATH_APPROX"));
    }

    #[test]
    fn test_walk_is_execution_order_and_respects_descend() {
        let leaf_a = frame(token(2), token(3), vec![], vec![frame(token(3), token(9), vec![], vec![])]);
        let leaf_b = frame(token(2), token(4), vec![], vec![]);
        let root = frame(token(1), token(2), vec![], vec![leaf_a, leaf_b]);

        let all: Vec<_> = root.walk(|_| true).iter().map(|f| f.callee().unwrap()).collect();
        assert_eq!(all, vec![token(2), token(3), token(9), token(4)]);

        let shallow: Vec<_> = root
            .walk(|f| f.callee() != Some(token(3)))
            .iter()
            .map(|f| f.callee().unwrap())
            .collect();
        assert_eq!(shallow, vec![token(2), token(3), token(4)]);
    }

    #[test]
    fn test_decode_token_calls() {
        let t = frame(token(5), token(7), transfer_input(token(6), U256::from(10u64)), vec![]);
        assert_eq!(
            decode_token_call(&t),
            Some(TokenCall::Transfer { from: token(5), to: token(6), amount: U256::from(10u64) })
        );
        let tf = frame(token(5), token(7), transfer_from_input(token(8), token(6), U256::from(3u64)), vec![]);
        assert_eq!(
            decode_token_call(&tf),
            Some(TokenCall::Transfer { from: token(8), to: token(6), amount: U256::from(3u64) })
        );
        let b = frame(token(5), token(7), balance_of_input(token(6)), vec![]);
        assert_eq!(decode_token_call(&b), Some(TokenCall::BalanceOf { owner: token(6) }));
        assert_eq!(decode_token_call(&frame(token(5), token(7), vec![1, 2, 3, 4], vec![])), None);
    }

    #[test]
    fn test_false_return_detected() {
        let f = returning(frame(token(1), token(2), vec![], vec![]), U256::ZERO);
        assert!(f.returned_false());
        let t = returning(frame(token(1), token(2), vec![], vec![]), U256::from(1u64));
        assert!(!t.returned_false());
        assert_eq!(t.returned_word(), Some(U256::from(1u64)));
    }
}
