//! Expected token movements for a relay, and the relay contract calls built from them

use alloy::primitives::{Address, Bytes, FixedBytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use eyre::{ensure, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::arbitrage::FoundArbitrage;
use crate::fee_transfer::TransferFeeModel;
use crate::pricers::{token_holder, ExchangePricer, PricerKind};

sol! {
    #[sol(rpc)]
    #[derive(Debug)]
    interface IRelayer {
        struct Hop {
            uint8 kind;
            address exchange;
            bytes32 poolId;
            address tokenIn;
            address tokenOut;
            uint256 amountIn;
            uint256 amountOut;
            address recipient;
        }

        function doApprove(address token, address spender) external;
        function relay(Hop[] calldata hops) external;
    }
}

/// Hop kind understood by the relay contract
pub fn hop_kind(kind: PricerKind) -> u8 {
    match kind {
        PricerKind::UniswapV2 => 0,
        PricerKind::UniswapV3 => 1,
        PricerKind::BalancerV1 => 2,
        PricerKind::BalancerV2Weighted | PricerKind::BalancerV2LiquidityBootstrapping => 3,
    }
}

/// Whether the output of `pricer` must pass through the relayer before reaching `next`
fn routed_through_relayer(pricer: &Arc<dyn ExchangePricer>, next: Option<&Arc<dyn ExchangePricer>>) -> bool {
    pricer.kind() == PricerKind::BalancerV1 || next.is_some_and(|n| n.kind().is_balancer())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedTransfer {
    /// Nominal amount passed to `transfer`
    pub sent: U256,
    /// Amount the recipient should end up with after any transfer fee
    pub received: U256,
}

/// Everything one relay attempt is expected to do
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub hops: Vec<IRelayer::Hop>,
    /// `(sender, token) -> transfer`
    pub expected: BTreeMap<(Address, Address), ExpectedTransfer>,
    /// `(spender, token)` approvals the relayer must grant before the relay
    pub approvals: Vec<(Address, Address)>,
    /// Pivot amount returned to the relayer
    pub amount_out: U256,
}

impl TransferPlan {
    pub fn relay_calldata(&self) -> Bytes {
        IRelayer::relayCall {
            hops: self.hops.clone(),
        }
        .abi_encode()
        .into()
    }
}

pub fn approve_calldata(token: Address, spender: Address) -> Bytes {
    IRelayer::doApproveCall { token, spender }.abi_encode().into()
}

/// Walk the circuit once, pricing every hop from the amount that actually arrives at it.
///
/// Output leaving a Balancer V1 pool, or heading into any Balancer pool, is sent to the
/// relayer first and forwarded from there, so it is charged two transfer fees.
pub async fn plan_transfers(
    fa: &FoundArbitrage,
    relayer: Address,
    fees: &dyn TransferFeeModel,
    block: u64,
    timestamp: Option<u64>,
) -> Result<TransferPlan> {
    ensure!(!fa.circuit.is_empty(), "empty circuit");
    ensure!(fa.circuit.len() == fa.directions.len(), "circuit and directions misaligned");

    let mut expected = BTreeMap::new();
    let mut hops = Vec::with_capacity(fa.circuit.len());
    let mut approvals = Vec::new();

    let first_holder = token_holder(&fa.circuit[0]);
    let mut amount = fees.out_from_transfer(fa.pivot, relayer, first_holder, fa.amount_in);
    expected.insert(
        (relayer, fa.pivot),
        ExpectedTransfer {
            sent: fa.amount_in,
            received: amount,
        },
    );
    let mut last_token = fa.pivot;

    for (i, (pricer, (token_in, token_out))) in fa.circuit.iter().zip(&fa.directions).enumerate() {
        ensure!(*token_in == last_token, "hop {i} does not continue from {last_token}");
        let next = fa.circuit.get(i + 1);
        let quote = pricer
            .compute_output(*token_in, *token_out, amount, block, timestamp)
            .await?;

        let sender = token_holder(pricer);
        let next_holder = next.map(token_holder).unwrap_or(relayer);
        let via_relayer = routed_through_relayer(pricer, next);

        if pricer.kind().is_balancer() {
            approvals.push((token_holder(pricer), *token_in));
        }
        hops.push(IRelayer::Hop {
            kind: hop_kind(pricer.kind()),
            exchange: pricer.address(),
            poolId: pricer.pool_id().unwrap_or(FixedBytes::ZERO),
            tokenIn: *token_in,
            tokenOut: *token_out,
            amountIn: amount,
            amountOut: quote.amount_out,
            recipient: if via_relayer { relayer } else { next_holder },
        });

        let sent = quote.amount_out;
        if via_relayer {
            amount = fees.out_from_transfer(*token_out, sender, relayer, sent);
            expected.insert((sender, *token_out), ExpectedTransfer { sent, received: amount });
            if next.is_some() {
                let forwarded = amount;
                amount = fees.out_from_transfer(*token_out, relayer, next_holder, forwarded);
                expected.insert(
                    (relayer, *token_out),
                    ExpectedTransfer {
                        sent: forwarded,
                        received: amount,
                    },
                );
            }
        } else {
            amount = fees.out_from_transfer(*token_out, sender, next_holder, sent);
            expected.insert((sender, *token_out), ExpectedTransfer { sent, received: amount });
        }
        last_token = *token_out;
    }
    ensure!(last_token == fa.pivot, "circuit does not return to the pivot");

    Ok(TransferPlan {
        hops,
        expected,
        approvals,
        amount_out: amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WETH;
    use crate::fee_transfer::{FeeTransferCalculator, NoTransferFees};
    use crate::pricers::test_support::{e18, offline_provider, token};
    use crate::pricers::{BalancerV1Pricer, UniswapV2Pricer};
    use alloy::sol_types::SolCall;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn found(circuit: Vec<Arc<dyn ExchangePricer>>, directions: Vec<(Address, Address)>, amount_in: U256) -> FoundArbitrage {
        FoundArbitrage {
            circuit,
            directions,
            pivot: WETH,
            amount_in,
            profit: U256::ZERO,
        }
    }

    fn uni(address: u8, reserves: (u64, u64)) -> Arc<dyn ExchangePricer> {
        Arc::new(
            UniswapV2Pricer::new(offline_provider(), token(address), WETH, token(1))
                .with_reserves(U256::from(reserves.0), U256::from(reserves.1)),
        )
    }

    #[tokio::test]
    async fn test_direct_hops_send_to_next_exchange() {
        let relayer = token(50);
        let fa = found(
            vec![uni(10, (1_000_000, 2_000_000)), uni(11, (1_000_000, 1_000_000))],
            vec![(WETH, token(1)), (token(1), WETH)],
            U256::from(1000u64),
        );
        let plan = plan_transfers(&fa, relayer, &NoTransferFees, 1, None).await.unwrap();

        assert_eq!(plan.amount_out, U256::from(1982u64));
        assert!(plan.approvals.is_empty());
        assert_eq!(plan.hops[0].recipient, token(11));
        assert_eq!(plan.hops[1].recipient, relayer);
        assert_eq!(
            plan.expected.get(&(token(10), token(1))),
            Some(&ExpectedTransfer {
                sent: U256::from(1992u64),
                received: U256::from(1992u64)
            })
        );
        assert!(!plan.expected.contains_key(&(relayer, token(1))));
    }

    #[tokio::test]
    async fn test_balancer_hop_is_relayed_and_charged_twice() {
        let relayer = token(50);
        let bal: Arc<dyn ExchangePricer> = Arc::new(
            BalancerV1Pricer::new(offline_provider(), token(12), vec![WETH, token(1)]).with_state(
                &[(WETH, e18(1000)), (token(1), e18(1000))],
                &[(WETH, e18(1)), (token(1), e18(1))],
                U256::ZERO,
            ),
        );
        let fa = found(
            vec![uni(10, (1_000_000, 2_000_000)), bal],
            vec![(WETH, token(1)), (token(1), WETH)],
            U256::from(1000u64),
        );
        let mut fees = FeeTransferCalculator::new();
        fees.propose(token(1), token(10), relayer, dec!(0.5), true);
        fees.propose(token(1), relayer, token(12), dec!(0.5), true);

        let plan = plan_transfers(&fa, relayer, &fees, 1, None).await.unwrap();

        assert_eq!(plan.approvals, vec![(token(12), token(1))]);
        assert_eq!(plan.hops[0].recipient, relayer);
        assert_eq!(plan.hops[1].amountIn, U256::from(498u64));
        assert_eq!(
            plan.expected.get(&(relayer, token(1))),
            Some(&ExpectedTransfer {
                sent: U256::from(996u64),
                received: U256::from(498u64)
            })
        );
        // last hop out of balancer v1 lands on the relayer with no forward
        assert_eq!(plan.hops[1].recipient, relayer);
    }

    #[test]
    fn test_calldata_selectors() {
        let data = approve_calldata(token(1), token(2));
        assert_eq!(&data[..4], IRelayer::doApproveCall::SELECTOR.as_slice());
        let plan = TransferPlan {
            hops: vec![],
            expected: BTreeMap::new(),
            approvals: vec![],
            amount_out: U256::ZERO,
        };
        assert_eq!(&plan.relay_calldata()[..4], IRelayer::relayCall::SELECTOR.as_slice());
    }
}
