//! Per-pass relay state
//!
//! Ban lists and interference maps learned while relaying one block. A session is owned by
//! one worker and threaded through the candidate loop; nothing here is shared across workers.

use alloy::primitives::Address;
use eyre::Result;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::arbitrage::CandidateArbitrage;
use crate::config::{is_known_token, AMPLEFORTH};
use crate::error::RelayError;
use crate::simulation::{Diagnosis, ShootOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub skipped: usize,
    pub banned: usize,
    pub no_arbitrage_after_fee: usize,
    pub succeeded: usize,
}

#[derive(Debug)]
pub struct RelaySession {
    banned_tokens: HashSet<Address>,
    banned_exchanges: HashSet<Address>,
    /// token -> exchanges it re-enters during a transfer
    interfering: HashMap<Address, BTreeSet<Address>>,
    /// exchange -> tokens it cannot trade
    incompatible: HashMap<Address, BTreeSet<Address>>,
    new_banned_tokens: BTreeSet<Address>,
    new_banned_exchanges: BTreeSet<Address>,
    counters: SessionCounters,
}

impl Default for RelaySession {
    fn default() -> Self {
        Self::new()
    }
}

impl RelaySession {
    pub fn new() -> Self {
        Self {
            banned_tokens: HashSet::from([AMPLEFORTH]),
            banned_exchanges: HashSet::new(),
            interfering: HashMap::new(),
            incompatible: HashMap::new(),
            new_banned_tokens: BTreeSet::new(),
            new_banned_exchanges: BTreeSet::new(),
            counters: SessionCounters::default(),
        }
    }

    /// Failure label for a candidate that can be skipped without relaying
    pub fn skip_reason(&mut self, candidate: &CandidateArbitrage) -> Option<String> {
        let reason = self.check(candidate);
        if let Some(reason) = &reason {
            self.counters.skipped += 1;
            debug!(candidate_id = candidate.id, reason = %reason, "Skipping candidate");
        }
        reason
    }

    fn check(&self, candidate: &CandidateArbitrage) -> Option<String> {
        let exchanges: BTreeSet<Address> = candidate.exchanges.iter().copied().collect();
        let tokens: BTreeSet<Address> = candidate.tokens().collect();

        let banned: Vec<String> = exchanges
            .iter()
            .filter(|e| self.banned_exchanges.contains(*e))
            .map(|e| e.to_string())
            .collect();
        if !banned.is_empty() {
            return Some(format!("Broken exchange/s: {}", banned.join(",")));
        }

        let banned: Vec<String> = tokens
            .iter()
            .filter(|t| self.banned_tokens.contains(*t))
            .map(|t| t.to_string())
            .collect();
        if !banned.is_empty() {
            return Some(format!("Broken token/s: {}", banned.join(",")));
        }

        for token in &tokens {
            if let Some(interferers) = self.interfering.get(token) {
                let hit: Vec<String> = interferers
                    .intersection(&exchanges)
                    .map(|e| e.to_string())
                    .collect();
                if !hit.is_empty() {
                    return Some(format!("Token {token} interferes with {}", hit.join(",")));
                }
            }
        }

        for (exchange, (token_in, token_out)) in candidate.exchanges.iter().zip(&candidate.directions) {
            if let Some(tokens) = self.incompatible.get(exchange) {
                for token in [token_in, token_out] {
                    if tokens.contains(token) {
                        return Some(format!("Token {token} incompatible with {exchange}"));
                    }
                }
            }
        }
        None
    }

    /// Fold a relay outcome into the session.
    ///
    /// Returns the failure label to store, or `None` for a success.
    pub fn record(&mut self, candidate: &CandidateArbitrage, outcome: &ShootOutcome) -> Result<Option<String>> {
        let diagnosis = match outcome {
            ShootOutcome::Success(_) => {
                self.counters.succeeded += 1;
                return Ok(None);
            }
            ShootOutcome::Failed(d) => d,
        };

        match diagnosis {
            Diagnosis::BrokenToken { token, .. } => {
                if is_known_token(token) {
                    return Err(RelayError::KnownTokenBanned(*token).into());
                }
                self.banned_tokens.insert(*token);
                self.new_banned_tokens.insert(*token);
                self.counters.banned += 1;
            }
            Diagnosis::BadExchange { exchange, .. } => {
                self.banned_exchanges.insert(*exchange);
                self.new_banned_exchanges.insert(*exchange);
                self.counters.banned += 1;
            }
            Diagnosis::ExchangeInterference { token, exchange } => {
                self.interfering.entry(*token).or_default().insert(*exchange);
            }
            Diagnosis::IncompatibleToken { exchange, token } => {
                self.incompatible.entry(*exchange).or_default().insert(*token);
            }
            Diagnosis::NoArbitrageAfterFee => self.counters.no_arbitrage_after_fee += 1,
            Diagnosis::FeeOnTransfer { .. } | Diagnosis::Other { .. } => {}
        }
        debug!(candidate_id = candidate.id, %diagnosis, "Candidate failed");
        Ok(Some(diagnosis.relay_label()))
    }

    /// Tokens banned during this session, excluding the static ban list
    pub fn new_banned_tokens(&self) -> impl Iterator<Item = &Address> {
        self.new_banned_tokens.iter()
    }

    pub fn new_banned_exchanges(&self) -> impl Iterator<Item = &Address> {
        self.new_banned_exchanges.iter()
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }
}
