//! Role-specific swap agents
//!
//! An agent owns no swap state of its own. Each `step` reconciles both chains,
//! decides the single next permitted action for its role and performs it.
//! Confirmed writes are remembered per (chain, operation) so a step that runs
//! again before the chain reflects a write never submits it twice.

pub mod maker;
pub mod taker;

pub use maker::{MakerAgent, MakerState};
pub use taker::{TakerAgent, TakerState};

use crate::config::AgentConfig;
use crate::error::{SwapError, SwapResult};
use crate::swap::{
    ChainSide, LegPhase, Reconciler, Role, SwapContext, SwapPhase, SwapSnapshot, TimelockPolicy,
};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::TxHash;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Chain writes an agent may perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    Approve,
    Initiate,
    Claim,
    Refund,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteOp::Approve => "approve",
            WriteOp::Initiate => "initiate",
            WriteOp::Claim => "claim",
            WriteOp::Refund => "refund",
        };
        f.write_str(name)
    }
}

/// What a step did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionTaken {
    SecretGenerated,
    Write {
        chain: ChainSide,
        op: WriteOp,
        tx_hash: TxHash,
    },
}

/// Next action the role is eligible for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextAction {
    Initiate { chain: ChainSide },
    Claim { chain: ChainSide },
    /// Refund `chain` once its timelock passes
    Refund { chain: ChainSide, after: u64 },
    Wait { reason: String },
    Done,
}

impl NextAction {
    fn wait(reason: impl Into<String>) -> Self {
        NextAction::Wait {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextAction::Initiate { chain } => write!(f, "initiate on {}", chain),
            NextAction::Claim { chain } => write!(f, "claim on {}", chain),
            NextAction::Refund { chain, after } => write!(f, "refund on {} after {}", chain, after),
            NextAction::Wait { reason } => write!(f, "wait: {}", reason),
            NextAction::Done => write!(f, "done"),
        }
    }
}

/// Result of one decision step
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    /// Role-specific state name
    pub state: &'static str,
    pub phase: SwapPhase,
    pub action: Option<ActionTaken>,
    pub next: NextAction,
    /// No further action will ever be taken for this role
    pub terminal: bool,
    /// Funds of this role are locked or owed; `drive` never gives up on it
    pub exposed: bool,
}

#[async_trait]
pub trait SwapAgent: Send + Sync {
    fn role(&self) -> Role;

    fn context(&self) -> &SwapContext;

    /// State reported before the first step
    fn initial_state(&self) -> &'static str;

    /// Reconcile, decide and perform at most one action
    async fn step(&self) -> SwapResult<StepOutcome>;
}

/// Build the agent for `role`; observers get none
pub fn for_role(role: Role, core: AgentCore) -> Option<Arc<dyn SwapAgent>> {
    match role {
        Role::Maker => Some(Arc::new(MakerAgent::new(core))),
        Role::Taker => Some(Arc::new(TakerAgent::new(core))),
        Role::Observer => None,
    }
}

/// State shared by both roles
pub struct AgentCore {
    ctx: SwapContext,
    reconciler: Arc<Reconciler>,
    policy: TimelockPolicy,
    performed: DashMap<(ChainSide, WriteOp), TxHash>,
}

impl AgentCore {
    pub fn new(ctx: SwapContext, reconciler: Arc<Reconciler>, policy: TimelockPolicy) -> Self {
        Self {
            ctx,
            reconciler,
            policy,
            performed: DashMap::new(),
        }
    }

    pub fn ctx(&self) -> &SwapContext {
        &self.ctx
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn policy(&self) -> &TimelockPolicy {
        &self.policy
    }

    pub fn performed(&self, chain: ChainSide, op: WriteOp) -> Option<TxHash> {
        self.performed.get(&(chain, op)).map(|h| *h)
    }

    /// Run a chain write unless it already succeeded earlier; `None` when skipped
    pub async fn write_once<F>(
        &self,
        chain: ChainSide,
        op: WriteOp,
        submit: F,
    ) -> SwapResult<Option<ActionTaken>>
    where
        F: Future<Output = SwapResult<TxHash>>,
    {
        if let Some(tx_hash) = self.performed(chain, op) {
            debug!(
                "Swap {}: {} on chain {} already performed ({:?})",
                self.ctx.swap_id, op, chain, tx_hash
            );
            return Ok(None);
        }

        info!("Swap {}: submitting {} on chain {}", self.ctx.swap_id, op, chain);
        let tx_hash = submit.await?;
        self.performed.insert((chain, op), tx_hash);
        Ok(Some(ActionTaken::Write { chain, op, tx_hash }))
    }

    /// Whether the party owning leg `own` still has value at stake, counting
    /// an initiation submitted but not yet visible
    pub fn exposed(&self, snapshot: &SwapSnapshot, own: ChainSide) -> bool {
        snapshot.exposed(own)
            || (snapshot.leg(own).phase == LegPhase::Absent
                && self.performed(own, WriteOp::Initiate).is_some())
    }

    /// Recovery under a protocol violation: refund leg `own` once its
    /// timelock passes and do nothing else. `None` once we hold no locked leg.
    pub async fn refund_own_leg(
        &self,
        snapshot: &SwapSnapshot,
        own: ChainSide,
        violation: &SwapError,
    ) -> SwapResult<Option<(Option<ActionTaken>, NextAction)>> {
        let leg = snapshot.leg(own);
        if leg.phase != LegPhase::Initiated || !leg.terms_ok {
            return Ok(None);
        }

        let after = leg.timelock().unwrap_or_default();
        if !leg.is_refund_eligible(snapshot.chain_time(own)) {
            warn!(
                "Swap {}: {}; holding leg {} until its refund after {}",
                self.ctx.swap_id, violation, own, after
            );
            return Ok(Some((None, NextAction::Refund { chain: own, after })));
        }

        info!(
            "Swap {}: refunding leg {} despite protocol violation",
            self.ctx.swap_id, own
        );
        let escrow = self.reconciler.escrow(own).clone();
        let action = self
            .write_once(own, WriteOp::Refund, escrow.refund(self.ctx.swap_id))
            .await?;
        Ok(Some((
            action,
            NextAction::wait(format!("leg {} refund to become visible", own)),
        )))
    }
}

/// Polling parameters for `drive`
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub max_wait: Duration,
}

impl RunConfig {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_retries: config.max_retries,
            max_wait: Duration::from_secs(config.max_wait_secs),
        }
    }
}

/// Step `agent` until it is terminal, fails permanently or `running` turns
/// false. `max_wait` only bounds waiting while the agent has nothing at stake;
/// with funds locked or owed it keeps stepping until it claims or refunds.
/// Every step result is passed to `report`.
pub async fn drive<F>(
    agent: &dyn SwapAgent,
    config: &RunConfig,
    running: &RwLock<bool>,
    mut report: F,
) -> SwapResult<Option<StepOutcome>>
where
    F: FnMut(Result<&StepOutcome, &SwapError>) + Send,
{
    let auction_id = agent.context().auction_id;
    let deadline = Instant::now() + config.max_wait;
    let mut failures: u32 = 0;
    let mut exposed = false;

    loop {
        if !*running.read().await {
            info!("Agent for auction {} stopping", auction_id);
            return Ok(None);
        }

        let mut delay = config.poll_interval;
        match agent.step().await {
            Ok(outcome) => {
                failures = 0;
                exposed = outcome.exposed;
                report(Ok(&outcome));
                debug!(
                    "Auction {} ({}): {} [{}], next: {}",
                    auction_id,
                    agent.role(),
                    outcome.state,
                    outcome.phase,
                    outcome.next
                );
                if outcome.terminal {
                    return Ok(Some(outcome));
                }
                if outcome.action.is_some() {
                    // Re-observe right away after acting
                    delay = Duration::ZERO;
                }
            }
            Err(e) if e.is_retryable() => {
                failures = failures.saturating_add(1);
                report(Err(&e));
                warn!(
                    "Auction {} step failed (attempt {}): {}",
                    auction_id, failures, e
                );
                let backoff = failures.min(config.max_retries.max(1));
                delay = config.retry_delay * backoff;
            }
            Err(e) => {
                report(Err(&e));
                return Err(e);
            }
        }

        if Instant::now() + delay >= deadline {
            if !exposed {
                return Err(SwapError::Timeout {
                    operation: format!("swap for auction {}", auction_id),
                });
            }
            debug!(
                "Auction {} past its wait budget with funds at stake, still driving",
                auction_id
            );
        }
        tokio::time::sleep(delay).await;
    }
}
