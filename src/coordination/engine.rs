//! Swap coordinator: discovers the account's swaps and drives one agent per swap

use crate::agent::{drive, for_role, AgentCore, NextAction, RunConfig, StepOutcome, SwapAgent};
use crate::chain::ChainManager;
use crate::config::AgentConfig;
use crate::error::{SwapError, SwapResult};
use crate::swap::{
    resolve, resolve_role, ChainSide, Reconciler, Role, SecretStore, SwapPhase, TimelockPolicy,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

const HALTED: &str = "halted";
const FAILED: &str = "failed";

/// Latest known status of one tracked swap
#[derive(Debug, Clone, Serialize)]
pub struct SwapStatus {
    pub auction_id: u64,
    pub role: Role,
    pub state: String,
    pub phase: Option<SwapPhase>,
    pub next: Option<NextAction>,
    pub terminal: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SwapStatus {
    fn started(auction_id: u64, role: Role, state: &str) -> Self {
        Self {
            auction_id,
            role,
            state: state.to_string(),
            phase: None,
            next: None,
            terminal: false,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    fn apply(&mut self, outcome: &StepOutcome) {
        self.state = outcome.state.to_string();
        self.phase = Some(outcome.phase);
        self.next = Some(outcome.next.clone());
        self.terminal = outcome.terminal;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    fn fail(&mut self, error: &SwapError, terminal: bool) {
        if terminal {
            self.state = if error.is_protocol_violation() {
                HALTED.to_string()
            } else {
                FAILED.to_string()
            };
        }
        self.terminal = terminal;
        self.last_error = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    /// Stopped on an error other than a protocol violation
    fn is_failed(&self) -> bool {
        self.terminal && self.state == FAILED
    }
}

/// Tracks watched auctions and runs their agents
pub struct SwapCoordinator {
    chains: Arc<ChainManager>,
    reconciler: Arc<Reconciler>,
    policy: TimelockPolicy,
    config: AgentConfig,
    statuses: Arc<DashMap<u64, SwapStatus>>,
    tasks: DashMap<u64, JoinHandle<()>>,
    running: Arc<RwLock<bool>>,
}

impl SwapCoordinator {
    pub fn new(chains: Arc<ChainManager>, config: AgentConfig, policy: TimelockPolicy) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            chains.escrow(ChainSide::A),
            chains.escrow(ChainSide::B),
            Arc::new(SecretStore::new()),
            config.lookback_blocks,
            Duration::from_millis(config.rpc_timeout_ms),
        ));

        Self {
            chains,
            reconciler,
            policy,
            config,
            statuses: Arc::new(DashMap::new()),
            tasks: DashMap::new(),
            running: Arc::new(RwLock::new(true)),
        }
    }

    pub fn chains(&self) -> &Arc<ChainManager> {
        &self.chains
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn secrets(&self) -> &Arc<SecretStore> {
        self.reconciler.secrets()
    }

    pub fn status(&self, auction_id: u64) -> Option<SwapStatus> {
        self.statuses.get(&auction_id).map(|s| s.clone())
    }

    /// All tracked swaps, ordered by auction id
    pub fn statuses(&self) -> Vec<SwapStatus> {
        let mut all: Vec<SwapStatus> = self.statuses.iter().map(|s| s.clone()).collect();
        all.sort_by_key(|s| s.auction_id);
        all
    }

    /// Main coordination loop: rescan the watch list until stopped
    pub async fn run(&self) -> SwapResult<()> {
        let mut scan_interval = interval(Duration::from_millis(self.config.poll_interval_ms));

        info!(
            "Swap coordinator started for account {:?} ({} explicit auctions, discovery {})",
            self.chains.account(),
            self.config.auction_ids.len(),
            if self.config.discover { "on" } else { "off" }
        );

        loop {
            if !*self.running.read().await {
                break;
            }

            scan_interval.tick().await;
            if let Err(e) = self.scan().await {
                warn!("Watch list scan failed: {}", e);
            }
        }

        self.join_agents().await;
        info!("Swap coordinator stopped");
        Ok(())
    }

    /// Track every watched auction not yet tracked, including ones whose
    /// agent stopped on a recoverable failure
    pub async fn scan(&self) -> SwapResult<()> {
        self.release_failed();
        for auction_id in self.watch_list().await? {
            if self.tasks.contains_key(&auction_id) {
                continue;
            }
            match self.track(auction_id).await {
                Ok(Some(role)) => info!("Tracking auction {} as {}", auction_id, role),
                Ok(None) => {}
                Err(e) if e.is_precondition() => {
                    debug!("Auction {} not tracked yet: {}", auction_id, e);
                }
                Err(e) => warn!("Failed to track auction {}: {}", auction_id, e),
            }
        }
        Ok(())
    }

    /// Explicit ids plus, with discovery on, every ended auction where the
    /// account is maker or taker
    pub async fn watch_list(&self) -> SwapResult<Vec<u64>> {
        let mut ids = self.config.auction_ids.clone();
        if self.config.discover {
            ids.extend(self.discover().await?);
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn discover(&self) -> SwapResult<Vec<u64>> {
        let auctions = self.chains.auctions();
        let account = self.chains.account();
        let count = auctions.auction_count().await?;

        let mut found = Vec::new();
        for auction_id in 1..=count {
            if self.tasks.contains_key(&auction_id) {
                continue;
            }
            match auctions.auction(auction_id).await? {
                Some(auction) if auction.ended && resolve_role(account, &auction) != Role::Observer => {
                    found.push(auction_id);
                }
                _ => {}
            }
        }
        Ok(found)
    }

    /// Resolve the auction and spawn its agent; `None` for observers
    pub async fn track(&self, auction_id: u64) -> SwapResult<Option<Role>> {
        let auction = self
            .chains
            .auctions()
            .auction(auction_id)
            .await?
            .ok_or(SwapError::AuctionNotFound { auction_id })?;
        let ctx = resolve(&auction)?;
        let role = resolve_role(self.chains.account(), &auction);

        let core = AgentCore::new(ctx, self.reconciler.clone(), self.policy);
        let Some(agent) = for_role(role, core) else {
            debug!("Account is not a party to auction {}", auction_id);
            return Ok(None);
        };

        self.statuses
            .insert(auction_id, SwapStatus::started(auction_id, role, agent.initial_state()));
        crate::metrics::record_swap_started(role);

        let handle = tokio::spawn(run_agent(
            agent,
            RunConfig::from_config(&self.config),
            self.running.clone(),
            self.statuses.clone(),
        ));
        self.tasks.insert(auction_id, handle);
        Ok(Some(role))
    }

    fn release_failed(&self) {
        let failed: Vec<u64> = self
            .tasks
            .iter()
            .filter(|task| task.value().is_finished())
            .map(|task| *task.key())
            .filter(|id| self.statuses.get(id).map_or(false, |s| s.is_failed()))
            .collect();
        for auction_id in failed {
            self.tasks.remove(&auction_id);
            info!("Auction {} agent failed earlier, tracking it again", auction_id);
        }
    }

    async fn join_agents(&self) {
        let ids: Vec<u64> = self.tasks.iter().map(|t| *t.key()).collect();
        let pending: Vec<(u64, JoinHandle<()>)> = ids
            .into_iter()
            .filter_map(|id| self.tasks.remove(&id))
            .collect();

        let (ids, handles): (Vec<u64>, Vec<JoinHandle<()>>) = pending.into_iter().unzip();
        for (auction_id, joined) in ids.into_iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                error!("Agent task for auction {} panicked: {}", auction_id, e);
            }
        }
    }

    /// Stop the coordinator and every agent loop
    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!("Swap coordinator shutdown initiated");
    }
}

async fn run_agent(
    agent: Arc<dyn SwapAgent>,
    config: RunConfig,
    running: Arc<RwLock<bool>>,
    statuses: Arc<DashMap<u64, SwapStatus>>,
) {
    let auction_id = agent.context().auction_id;
    let role = agent.role();

    let result = drive(agent.as_ref(), &config, &running, |step| {
        if let Some(mut status) = statuses.get_mut(&auction_id) {
            match step {
                Ok(outcome) => status.apply(outcome),
                Err(e) => status.fail(e, false),
            }
        }
    })
    .await;

    match result {
        Ok(Some(outcome)) => {
            info!("Auction {} ({}) finished: {}", auction_id, role, outcome.state);
            crate::metrics::record_swap_outcome(role, outcome.state);
        }
        Ok(None) => {
            debug!("Auction {} ({}) left unfinished at shutdown", auction_id, role);
        }
        Err(e) => {
            if e.should_alert() {
                error!("Auction {} ({}) halted: {}", auction_id, role, e);
            } else {
                warn!("Auction {} ({}) stopped: {}", auction_id, role, e);
            }
            let outcome = if let Some(mut status) = statuses.get_mut(&auction_id) {
                status.fail(&e, true);
                status.state.clone()
            } else {
                FAILED.to_string()
            };
            crate::metrics::record_swap_outcome(role, &outcome);
        }
    }
}
