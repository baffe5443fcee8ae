//! Top-arbitrage campaigns
//!
//! A campaign is the longest run of blocks over which one route keeps relaying
//! successfully. Workers walk a reserved block range forward, extending open campaigns
//! while the route keeps succeeding and closing them when it fails or one of its
//! exchanges changes state without a fresh candidate. A newly found route is also
//! walked backward through earlier state changes of its exchanges.

use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider};
use alloy::rpc::types::Filter;
use eyre::{eyre, Result, WrapErr};
use petgraph::unionfind::UnionFind;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::arbitrage::{CampaignKey, CandidateArbitrage, FoundArbitrage};
use crate::config::{is_known_token, RelayConfig, MAX_BACKWARD_REACH, RESERVATION_GRACE_BLOCKS, WINDOW_SIZE};
use crate::erc20::TokenDecimals;
use crate::error::{is_transient, RelayError};
use crate::fee_transfer::FeeTransferCalculator;
use crate::pricers::{ordered_pair, ExchangePricer, PricerCache};
use crate::relay::{block_timestamp, connect_upstream, resolve_circuit, shoot_with_recompute, FeeIds};
use crate::reservation::{claim_range, complete_range, record_progress, JobControl, RangeClaim};
use crate::retry::Backoff;
use crate::sandbox::process::SandboxLauncher;
use crate::sandbox::{Sandbox, SandboxRpc, SandboxWindow};
use crate::simulation::{Diagnosis, ShootOutcome, ShootSuccess};
use crate::solver::BisectionSolver;
use crate::store::{self, CampaignSpan, Store};

#[derive(Debug, Clone, PartialEq)]
pub struct CampaignMember {
    pub candidate_id: i64,
    pub block_number: u64,
    pub success: ShootSuccess,
}

/// One route's run of successful relays
#[derive(Debug, Clone, PartialEq)]
pub struct TopArbCampaign {
    pub key: CampaignKey,
    pub start_block: u64,
    pub end_block: u64,
    /// Ascending by block
    pub members: Vec<CampaignMember>,
    pub terminated: bool,
}

impl TopArbCampaign {
    pub fn start(candidate: &CandidateArbitrage, success: ShootSuccess) -> Self {
        Self {
            key: candidate.campaign_key(),
            start_block: candidate.block_number,
            end_block: candidate.block_number,
            members: vec![CampaignMember {
                candidate_id: candidate.id,
                block_number: candidate.block_number,
                success,
            }],
            terminated: false,
        }
    }

    pub fn exchanges(&self) -> &[Address] {
        &self.key.0
    }

    /// Append a later success
    pub fn extend(&mut self, candidate_id: i64, block: u64, success: ShootSuccess) -> Result<()> {
        if self.terminated {
            return Err(RelayError::CampaignInvariant(format!("extending terminated campaign at {block}")).into());
        }
        if block <= self.end_block {
            return Err(RelayError::CampaignInvariant(format!(
                "extension at {block} does not follow end block {}",
                self.end_block
            ))
            .into());
        }
        self.members.push(CampaignMember {
            candidate_id,
            block_number: block,
            success,
        });
        self.end_block = block;
        Ok(())
    }

    /// Prepend an earlier success found by the backward search
    pub fn prepend(&mut self, candidate_id: i64, block: u64, success: ShootSuccess) -> Result<()> {
        if self.terminated || block >= self.start_block {
            return Err(RelayError::CampaignInvariant(format!(
                "prepending block {block} before start block {}",
                self.start_block
            ))
            .into());
        }
        self.members.insert(
            0,
            CampaignMember {
                candidate_id,
                block_number: block,
                success,
            },
        );
        self.start_block = block;
        Ok(())
    }

    /// Close the campaign at `end_block`; the route is known to hold until then
    pub fn terminate(&mut self, end_block: u64) -> Result<()> {
        if self.terminated || end_block < self.end_block {
            return Err(RelayError::CampaignInvariant(format!(
                "terminating at {end_block}, campaign ends at {} (terminated: {})",
                self.end_block, self.terminated
            ))
            .into());
        }
        self.end_block = end_block;
        self.terminated = true;
        Ok(())
    }
}

/// Open campaigns by route, plus those closed since the last drain
#[derive(Debug, Default)]
pub struct CampaignTracker {
    active: HashMap<CampaignKey, TopArbCampaign>,
    completed: Vec<TopArbCampaign>,
}

impl CampaignTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn get(&self, key: &CampaignKey) -> Option<&TopArbCampaign> {
        self.active.get(key)
    }

    pub fn open(&mut self, campaign: TopArbCampaign) -> Result<()> {
        if self.active.contains_key(&campaign.key) {
            return Err(RelayError::CampaignInvariant("route already has an open campaign".to_string()).into());
        }
        self.active.insert(campaign.key.clone(), campaign);
        Ok(())
    }

    pub fn extend(&mut self, key: &CampaignKey, candidate_id: i64, block: u64, success: ShootSuccess) -> Result<()> {
        self.active
            .get_mut(key)
            .ok_or_else(|| RelayError::CampaignInvariant("extending a route with no open campaign".to_string()))?
            .extend(candidate_id, block, success)
    }

    /// A relay of the route failed at `block`: its campaign, if any, ended the block before
    pub fn fail(&mut self, key: &CampaignKey, block: u64) -> Result<bool> {
        match self.active.remove(key) {
            Some(mut campaign) => {
                campaign.terminate(block.saturating_sub(1))?;
                self.completed.push(campaign);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Exchanges of every open campaign
    pub fn monitored_exchanges(&self) -> HashSet<Address> {
        self.active.values().flat_map(|c| c.exchanges().iter().copied()).collect()
    }

    /// Close campaigns whose exchanges changed state in `block` without a successful relay of
    /// the route in that block. A Balancer pool only counts as changed when the hop's own pair
    /// moved, since those pools report every trade against any of their tokens.
    pub fn close_stale(
        &mut self,
        block: u64,
        updated: &HashSet<Address>,
        balancer: &HashSet<Address>,
        balancer_pairs: &HashMap<Address, BTreeSet<(Address, Address)>>,
    ) -> Result<usize> {
        let dead: Vec<CampaignKey> = self
            .active
            .values()
            .filter(|c| c.end_block != block)
            .filter(|c| {
                let (exchanges, directions) = &c.key;
                exchanges.iter().zip(directions).any(|(exchange, (t_in, t_out))| {
                    if !updated.contains(exchange) {
                        return false;
                    }
                    if !balancer.contains(exchange) {
                        return true;
                    }
                    balancer_pairs
                        .get(exchange)
                        .is_some_and(|pairs| pairs.contains(&ordered_pair(*t_in, *t_out)))
                })
            })
            .map(|c| c.key.clone())
            .collect();

        for key in &dead {
            if let Some(mut campaign) = self.active.remove(key) {
                campaign.terminate(block.saturating_sub(1))?;
                self.completed.push(campaign);
            }
        }
        Ok(dead.len())
    }

    /// Close every open campaign without marking it terminated
    pub fn force_close_all(&mut self) {
        self.completed.extend(self.active.drain().map(|(_, c)| c));
    }

    pub fn take_completed(&mut self) -> Vec<TopArbCampaign> {
        std::mem::take(&mut self.completed)
    }
}

/// Where a backward step finds its sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachSlot {
    /// Still inside the rolling window
    Window(u64),
    /// Needs a sandbox of its own
    Dedicated(u64),
}

/// Bounded walk back from a newly found campaign's first block.
///
/// Each step must land strictly before the previous one and no further than
/// [`MAX_BACKWARD_REACH`] blocks behind the origin, so the walk is finite.
#[derive(Debug, Clone)]
pub struct BackwardReach {
    origin: u64,
    cursor: u64,
    steps: u64,
}

impl BackwardReach {
    pub fn new(origin: u64) -> Self {
        Self {
            origin,
            cursor: origin,
            steps: 0,
        }
    }

    /// Block before which the next prior candidate is searched
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Admit a step to `block`, or `None` when it is out of reach
    pub fn admit(&self, block: u64) -> Option<ReachSlot> {
        if block >= self.cursor || self.steps >= MAX_BACKWARD_REACH {
            return None;
        }
        let blocks_ago = self.origin - block;
        if blocks_ago > MAX_BACKWARD_REACH {
            return None;
        }
        if blocks_ago < WINDOW_SIZE as u64 {
            Some(ReachSlot::Window(block))
        } else {
            Some(ReachSlot::Dedicated(block))
        }
    }

    /// The route succeeded at `block`; continue from there
    pub fn advance(&mut self, block: u64) {
        self.cursor = block;
        self.steps += 1;
    }
}

/// Outcome of relaying one top candidate
#[derive(Debug)]
pub enum TopRelay {
    Failed(String),
    Extended(ShootSuccess),
    Started(TopArbCampaign),
}

/// Ids to keep and to remove so that no two kept same-route campaigns overlap.
///
/// Overlapping campaigns form connected components; each keeps its longest member,
/// breaking ties toward the lowest id.
pub fn select_survivors(conflicts: &[(CampaignSpan, CampaignSpan)]) -> (Vec<i64>, Vec<i64>) {
    let mut index: HashMap<i64, usize> = HashMap::new();
    let mut spans: Vec<CampaignSpan> = Vec::new();
    for (a, b) in conflicts {
        for span in [a, b] {
            index.entry(span.id).or_insert_with(|| {
                spans.push(*span);
                spans.len() - 1
            });
        }
    }

    let mut components = UnionFind::<usize>::new(spans.len());
    for (a, b) in conflicts {
        components.union(index[&a.id], index[&b.id]);
    }

    let mut best: HashMap<usize, CampaignSpan> = HashMap::new();
    for (i, span) in spans.iter().enumerate() {
        let root = components.find(i);
        let better = match best.get(&root) {
            None => true,
            Some(current) => {
                span.duration() > current.duration() || (span.duration() == current.duration() && span.id < current.id)
            }
        };
        if better {
            best.insert(root, *span);
        }
    }

    let keep: HashSet<i64> = best.values().map(|s| s.id).collect();
    let mut kept: Vec<i64> = keep.iter().copied().collect();
    let mut removed: Vec<i64> = spans.iter().map(|s| s.id).filter(|id| !keep.contains(id)).collect();
    kept.sort_unstable();
    removed.sort_unstable();
    (kept, removed)
}

/// Mark overlapping same-route campaigns as removed, keeping one per conflict cluster
pub async fn dedupe_campaigns(store: &Store) -> Result<u64> {
    let total = store.count_campaigns().await?;
    let conflicts = store.overlapping_campaigns().await?;
    info!(
        conflicts = conflicts.len(),
        total,
        "Found conflicting campaigns, de-conflicting"
    );
    let (kept, removed) = select_survivors(&conflicts);
    info!(clusters = kept.len(), removing = removed.len(), "Resolved conflict clusters");
    if removed.is_empty() {
        return Ok(0);
    }
    store.mark_campaigns_removed(&removed).await
}

pub struct CampaignWorker {
    config: RelayConfig,
    worker: String,
    slice: u16,
    store: Store,
    upstream: DynProvider,
    launcher: SandboxLauncher,
    solver: BisectionSolver,
    decimals: Arc<TokenDecimals>,
    control: JobControl,
    balancer_v1: HashSet<Address>,
    balancer_v2: HashSet<Address>,
}

impl CampaignWorker {
    pub async fn new(config: RelayConfig, worker: String, slice: u16, control: JobControl) -> Result<Self> {
        let store = Store::connect(&config).await?;
        let upstream = connect_upstream(&config).await?;
        let launcher = SandboxLauncher::from_config(&config)?;
        let (balancer_v1, balancer_v2) = store.balancer_exchanges().await?;
        debug!(
            balancer_v1 = balancer_v1.len(),
            balancer_v2 = balancer_v2.len(),
            "Loaded balancer exchanges"
        );
        Ok(Self {
            config,
            worker,
            slice,
            store,
            upstream,
            launcher,
            solver: BisectionSolver::default(),
            decimals: Arc::new(TokenDecimals::new()),
            control,
            balancer_v1,
            balancer_v2,
        })
    }

    fn window_slice(&self) -> u16 {
        self.slice * 2
    }

    fn reach_slice(&self) -> u16 {
        self.slice * 2 + 1
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.store = Store::connect(&self.config).await?;
        self.upstream = connect_upstream(&self.config).await?;
        info!(worker = %self.worker, "Reconnected store and upstream");
        Ok(())
    }

    /// Claim and process ranges until the queue is empty or cancellation is requested
    pub async fn run(&mut self) -> Result<()> {
        self.control.register().await?;
        while !self.control.cancel_requested().await? {
            let Some(claim) = claim_range(&self.store, &self.worker).await? else {
                break;
            };
            let finished = self
                .process_range(claim)
                .await
                .wrap_err_with(|| format!("campaign reservation {}", claim.id))?;
            if finished {
                complete_range(&self.store, claim.id).await?;
                info!(reservation_id = claim.id, "Completed reservation");
            } else {
                warn!(reservation_id = claim.id, "Stopped before the end of the reservation");
                break;
            }
        }
        info!(worker = %self.worker, "Campaign worker done");
        Ok(())
    }

    /// `false` when cancelled part way
    async fn process_range(&mut self, claim: RangeClaim) -> Result<bool> {
        let Some(lowest) = self.store.lowest_large_arbitrage_block(claim.start_block).await? else {
            info!(reservation_id = claim.id, "No large arbitrages in this reservation");
            return Ok(true);
        };
        let global_end = self
            .store
            .global_end_block()
            .await?
            .ok_or_else(|| eyre!("block_samples is empty"))?;
        let already_relayed = self.store.already_relayed_top(claim.id).await?;
        info!(reservation_id = claim.id, start = lowest, "Starting campaign walk");

        let mut tracker = CampaignTracker::new();
        let mut window: SandboxWindow<Sandbox> = SandboxWindow::new();

        let mut block = lowest;
        loop {
            if block > global_end {
                info!(block, "Reached global end");
                break;
            }
            if block > claim.end_block && tracker.is_empty() {
                info!(block, "Reached end of reservation");
                break;
            }
            if block > claim.end_block + RESERVATION_GRACE_BLOCKS {
                return Err(RelayError::CampaignInvariant(format!(
                    "block {block} is past the grace window of reservation {}",
                    claim.id
                ))
                .into());
            }
            if self.control.cancel_requested().await? {
                return Ok(false);
            }

            self.process_block(claim, block, &already_relayed, &mut tracker, &mut window)
                .await
                .wrap_err_with(|| format!("block {block}"))?;
            block += 1;
        }
        window.clear();
        Ok(true)
    }

    /// Candidates for open routes, plus large candidates while inside the reservation;
    /// one per route
    async fn block_candidates(
        &self,
        claim: RangeClaim,
        block: u64,
        tracker: &CampaignTracker,
        already_relayed: &HashSet<i64>,
    ) -> Result<Vec<CandidateArbitrage>> {
        let monitored: Vec<Address> = tracker.monitored_exchanges().into_iter().collect();
        let mut found: Vec<CandidateArbitrage> = self
            .store
            .candidates_touching(block, &monitored)
            .await?
            .into_iter()
            .filter(|c| tracker.get(&c.campaign_key()).is_some())
            .collect();
        if block <= claim.end_block {
            found.extend(self.store.large_candidates_in_block(block).await?);
        }

        let mut seen_ids = HashSet::new();
        let mut seen_routes = HashSet::new();
        let mut candidates = Vec::with_capacity(found.len());
        for candidate in found {
            if already_relayed.contains(&candidate.id) || !seen_ids.insert(candidate.id) {
                continue;
            }
            if !seen_routes.insert(candidate.campaign_key()) {
                warn!(candidate_id = candidate.id, "Skipping duplicate candidate for route");
                continue;
            }
            candidates.push(candidate);
        }
        Ok(candidates)
    }

    async fn process_block(
        &mut self,
        claim: RangeClaim,
        block: u64,
        already_relayed: &HashSet<i64>,
        tracker: &mut CampaignTracker,
        window: &mut SandboxWindow<Sandbox>,
    ) -> Result<()> {
        debug!(block, "Processing block");
        let timestamp = block_timestamp(&self.upstream, block + 1).await?;
        let candidates = self.block_candidates(claim, block, tracker, already_relayed).await?;
        let mut failed: Vec<(i64, String)> = Vec::new();

        if !candidates.is_empty() {
            let launcher = &self.launcher;
            let slice = self.window_slice();
            window.fill(block, move |b| launcher.open(b, slice)).await?;
        }

        let mut pricers = PricerCache::new();
        debug!(block, candidates = candidates.len(), "Relaying top candidates");
        for candidate in &candidates {
            let key = candidate.campaign_key();
            let relayed = self
                .relay_with_backoff(window, &mut pricers, candidate, timestamp, tracker.get(&key).is_some())
                .await?;
            match relayed {
                TopRelay::Failed(reason) => {
                    if tracker.fail(&key, block)? {
                        debug!(candidate_id = candidate.id, "Campaign ended");
                    }
                    failed.push((candidate.id, reason));
                }
                TopRelay::Extended(success) => tracker.extend(&key, candidate.id, block, success)?,
                TopRelay::Started(campaign) => tracker.open(campaign)?,
            }
        }

        if !tracker.is_empty() {
            let updated = self.store.exchanges_updated_in_block(block).await?;
            let balancer: HashSet<Address> = self.balancer_v1.union(&self.balancer_v2).copied().collect();
            let watched: BTreeSet<Address> = tracker
                .monitored_exchanges()
                .into_iter()
                .filter(|e| updated.contains(e) && balancer.contains(e))
                .collect();
            let pairs = self.balancer_pairs_updated(block, &watched).await?;
            let died = tracker.close_stale(block, &updated, &balancer, &pairs)?;
            if died > 0 {
                debug!(block, died, "Campaigns ended on exchange updates");
            }
        }

        if block >= claim.end_block + RESERVATION_GRACE_BLOCKS && !tracker.is_empty() {
            warn!(
                block,
                open = tracker.len(),
                "Force-closing open campaigns past the end of the reservation"
            );
            tracker.force_close_all();
        }

        let completed = tracker.take_completed();
        info!(
            block,
            open = tracker.len(),
            completed = completed.len(),
            "Campaign status"
        );

        let mut tx = self.store.begin().await?;
        for (candidate_id, reason) in &failed {
            store::insert_top_failure(&mut tx, claim.id, *candidate_id, reason).await?;
        }
        // campaigns relay against their own calculators, so ids are only needed for the rows
        let mut fee_ids = FeeIds::default();
        for campaign in &completed {
            let campaign_id = store::insert_campaign(
                &mut tx,
                claim.id,
                &campaign.key,
                campaign.start_block,
                campaign.end_block,
                campaign.terminated,
            )
            .await?;
            for member in &campaign.members {
                let ids = fee_ids
                    .resolve(&mut tx, &member.success.fees_used, block)
                    .await?;
                store::insert_top_success(&mut tx, claim.id, campaign_id, member.candidate_id, &member.success, &ids)
                    .await?;
            }
        }
        record_progress(&mut tx, claim.id, block).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Relay one candidate, rebuilding the window and connections on transient failures
    async fn relay_with_backoff(
        &mut self,
        window: &mut SandboxWindow<Sandbox>,
        pricers: &mut PricerCache,
        candidate: &CandidateArbitrage,
        timestamp: u64,
        has_campaign: bool,
    ) -> Result<TopRelay> {
        let mut backoff = Backoff::default();
        loop {
            match self.relay_top(window, pricers, candidate, timestamp, has_campaign).await {
                Ok(relayed) => return Ok(relayed),
                Err(e) if is_transient(&e) => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(e.wrap_err(format!("relaying candidate {}", candidate.id)));
                    };
                    warn!(candidate_id = candidate.id, error = %e, delay_secs = delay.as_secs(), "Resetting rolling window");
                    sleep(delay).await;
                    window.clear();
                    *pricers = PricerCache::new();
                    if let Err(e) = self.reconnect().await {
                        warn!(error = %e, "Reconnect failed");
                        continue;
                    }
                    let launcher = &self.launcher;
                    let slice = self.window_slice();
                    if let Err(e) = window.fill(candidate.block_number, move |b| launcher.open(b, slice)).await {
                        warn!(error = %e, "Could not rebuild rolling window");
                    }
                }
                Err(e) => {
                    let unavailable = RelayError::from_report(&e)
                        .filter(|err| matches!(err, RelayError::TokenNotAvailable { .. }));
                    if let Some(err) = unavailable {
                        error!(candidate_id = candidate.id, %err, "Balancer v1 token not available");
                        return Ok(TopRelay::Failed(format!("Balancer v1: {err}")));
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn relay_top(
        &self,
        window: &SandboxWindow<Sandbox>,
        pricers: &mut PricerCache,
        candidate: &CandidateArbitrage,
        timestamp: u64,
        has_campaign: bool,
    ) -> Result<TopRelay> {
        let block = candidate.block_number;
        let sandbox = window
            .get(block)
            .ok_or_else(|| eyre!("rolling window has no sandbox for block {block}"))?;
        let circuit = resolve_circuit(
            &self.store,
            pricers,
            &sandbox.provider(),
            &self.decimals,
            &candidate.exchanges,
            block,
        )
        .await?;
        let fa = FoundArbitrage::from_candidate(candidate, circuit);

        let mut fees = FeeTransferCalculator::new();
        fees.infer_relays_and_aliases(&fa.circuit, sandbox.relayer());

        debug!(candidate_id = candidate.id, "Relaying top candidate");
        let success = match shoot_with_recompute(sandbox, &self.solver, &fa, &mut fees, timestamp, false, candidate.id)
            .await?
        {
            ShootOutcome::Failed(diagnosis) => {
                if let Diagnosis::BrokenToken { token, .. } = &diagnosis {
                    if is_known_token(token) {
                        return Err(RelayError::KnownTokenBanned(*token).into());
                    }
                }
                debug!(candidate_id = candidate.id, %diagnosis, "Top candidate failed");
                return Ok(TopRelay::Failed(diagnosis.campaign_label()));
            }
            ShootOutcome::Success(success) => success,
        };

        if has_campaign {
            return Ok(TopRelay::Extended(success));
        }

        debug!(candidate_id = candidate.id, "Reaching backward");
        let must_recompute = !success.fees_used.is_empty();
        let mut campaign = TopArbCampaign::start(candidate, success);
        self.reach_backward(window, &mut campaign, &mut fees, must_recompute).await?;
        Ok(TopRelay::Started(campaign))
    }

    /// Prepend earlier successes of the campaign's route, stopping at the first failure
    async fn reach_backward(
        &self,
        window: &SandboxWindow<Sandbox>,
        campaign: &mut TopArbCampaign,
        fees: &mut FeeTransferCalculator,
        must_recompute: bool,
    ) -> Result<()> {
        let mut reach = BackwardReach::new(campaign.start_block);
        loop {
            let Some(older) = self.store.prior_route_candidate(&campaign.key, reach.cursor()).await? else {
                debug!(start = campaign.start_block, "Nothing older available");
                return Ok(());
            };
            let slot = match reach.admit(older.block_number) {
                Some(slot) => slot,
                None => {
                    warn!(
                        origin = campaign.end_block,
                        block = older.block_number,
                        "Reached back too far, ending here"
                    );
                    return Ok(());
                }
            };
            debug!(candidate_id = older.id, block = older.block_number, ?slot, "Found prior candidate");

            let dedicated;
            let sandbox: &dyn SandboxRpc = match (slot, window.get(older.block_number)) {
                (ReachSlot::Window(_), Some(sandbox)) => sandbox,
                _ => {
                    dedicated = self.launcher.open(older.block_number, self.reach_slice()).await?;
                    &dedicated
                }
            };

            let circuit = resolve_circuit(
                &self.store,
                &mut PricerCache::new(),
                &sandbox.provider(),
                &self.decimals,
                &older.exchanges,
                older.block_number,
            )
            .await?;
            let older_fa = FoundArbitrage::from_candidate(&older, circuit);
            let older_timestamp = block_timestamp(&self.upstream, older.block_number + 1).await?;
            let outcome = shoot_with_recompute(
                sandbox,
                &self.solver,
                &older_fa,
                fees,
                older_timestamp,
                must_recompute,
                older.id,
            )
            .await?;

            match outcome {
                ShootOutcome::Success(success) => {
                    debug!(candidate_id = older.id, "Prior arbitrage succeeded");
                    campaign.prepend(older.id, older.block_number, success)?;
                    reach.advance(older.block_number);
                }
                ShootOutcome::Failed(diagnosis) => {
                    debug!(candidate_id = older.id, %diagnosis, "Prior arbitrage failed");
                    return Ok(());
                }
            }
        }
    }

    /// Token pairs each watched Balancer pool reports as moved in `block`
    async fn balancer_pairs_updated(
        &self,
        block: u64,
        watched: &BTreeSet<Address>,
    ) -> Result<HashMap<Address, BTreeSet<(Address, Address)>>> {
        let mut pairs = HashMap::new();
        if watched.is_empty() {
            return Ok(pairs);
        }
        debug!(block, pools = watched.len(), "Getting block logs");
        let logs = self
            .upstream
            .get_logs(&Filter::new().from_block(block).to_block(block))
            .await?;
        let mut cache = PricerCache::new();
        for exchange in watched {
            let circuit = resolve_circuit(
                &self.store,
                &mut cache,
                &self.upstream,
                &self.decimals,
                &[*exchange],
                block.saturating_sub(1),
            )
            .await?;
            for pricer in circuit {
                let observation = pricer.observe_block(&logs).await?;
                pairs.insert(*exchange, observation.pairs_updated);
            }
        }
        Ok(pairs)
    }
}
