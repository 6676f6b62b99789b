//! Maker side: locks leg A, claims leg B

use super::{ActionTaken, AgentCore, NextAction, StepOutcome, SwapAgent, WriteOp};
use crate::chain::InitiateRequest;
use crate::error::{SwapError, SwapResult};
use crate::swap::{ChainSide, LegPhase, Role, SecretManager, SwapContext, SwapSnapshot};

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakerState {
    NotStarted,
    SecretGenerated,
    InitiatedOnA,
    ClaimedOnB,
    RefundedOnA,
    /// Leg A is locked but no local secret matches its hashlock
    SecretUnavailable,
    /// Leg A claimed by the taker
    Completed,
    /// Protocol violation seen; only a refund of leg A remains
    Halted,
}

impl MakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            MakerState::NotStarted => "not_started",
            MakerState::SecretGenerated => "secret_generated",
            MakerState::InitiatedOnA => "initiated_on_a",
            MakerState::ClaimedOnB => "claimed_on_b",
            MakerState::RefundedOnA => "refunded_on_a",
            MakerState::SecretUnavailable => "secret_unavailable",
            MakerState::Completed => "completed",
            MakerState::Halted => "halted",
        }
    }
}

pub struct MakerAgent {
    core: AgentCore,
}

impl MakerAgent {
    pub fn new(core: AgentCore) -> Self {
        Self { core }
    }

    fn outcome(
        snapshot: &SwapSnapshot,
        state: MakerState,
        action: Option<ActionTaken>,
        next: NextAction,
        terminal: bool,
    ) -> StepOutcome {
        StepOutcome {
            state: state.as_str(),
            phase: snapshot.phase,
            action,
            next,
            terminal,
            exposed: false,
        }
    }

    /// Refund leg A if it is ours and locked, then stop with `violation`
    async fn contain(&self, snapshot: &SwapSnapshot, violation: SwapError) -> SwapResult<StepOutcome> {
        match self
            .core
            .refund_own_leg(snapshot, ChainSide::A, &violation)
            .await?
        {
            Some((action, next)) => {
                let state = if action.is_some() {
                    MakerState::RefundedOnA
                } else {
                    MakerState::Halted
                };
                Ok(Self::outcome(snapshot, state, action, next, false))
            }
            None => {
                self.core.reconciler().secrets().forget(&self.core.ctx().swap_id);
                Err(violation)
            }
        }
    }

    /// Generate the secret, or lock leg A once it exists
    async fn start(&self, snapshot: &SwapSnapshot) -> SwapResult<StepOutcome> {
        let ctx = self.core.ctx();
        let secrets = self.core.reconciler().secrets();

        if self.core.performed(ChainSide::A, WriteOp::Initiate).is_some() {
            return Ok(Self::outcome(
                snapshot,
                MakerState::InitiatedOnA,
                None,
                NextAction::wait("leg A initiation to become visible"),
                false,
            ));
        }

        let Some(hashed_secret) = secrets.hashed(&ctx.swap_id) else {
            secrets.generate_for(ctx.swap_id)?;
            return Ok(Self::outcome(
                snapshot,
                MakerState::SecretGenerated,
                Some(ActionTaken::SecretGenerated),
                NextAction::Initiate { chain: ChainSide::A },
                false,
            ));
        };

        let (timelock_a, timelock_b) = self.core.policy().choose_timelocks(snapshot.chain_time_a)?;
        debug!(
            "Swap {}: leg A timelock {} (leg B expected by {})",
            ctx.swap_id, timelock_a, timelock_b
        );

        let escrow = self.core.reconciler().escrow(ChainSide::A).clone();
        let terms = &ctx.leg_a;
        self.core
            .write_once(ChainSide::A, WriteOp::Approve, escrow.approve(terms.token, terms.amount))
            .await?;
        let action = self
            .core
            .write_once(
                ChainSide::A,
                WriteOp::Initiate,
                escrow.initiate(InitiateRequest {
                    swap_id: ctx.swap_id,
                    recipient: terms.recipient,
                    token: terms.token,
                    amount: terms.amount,
                    hashed_secret,
                    timelock: timelock_a,
                }),
            )
            .await?;

        Ok(Self::outcome(
            snapshot,
            MakerState::InitiatedOnA,
            action,
            NextAction::wait("taker to initiate leg B"),
            false,
        ))
    }

    /// Leg A is locked: claim leg B, or refund leg A after its timelock
    async fn locked(&self, snapshot: &SwapSnapshot) -> SwapResult<StepOutcome> {
        let ctx = self.core.ctx();
        let (leg_a, leg_b) = (&snapshot.leg_a, &snapshot.leg_b);
        let timelock_a = leg_a.timelock().unwrap_or_default();
        let refund_a = NextAction::Refund {
            chain: ChainSide::A,
            after: timelock_a,
        };

        if leg_a.is_refund_eligible(snapshot.chain_time_a) {
            info!("Swap {}: leg A expired unclaimed, refunding", ctx.swap_id);
            let escrow = self.core.reconciler().escrow(ChainSide::A).clone();
            let action = self
                .core
                .write_once(ChainSide::A, WriteOp::Refund, escrow.refund(ctx.swap_id))
                .await?;
            return Ok(Self::outcome(
                snapshot,
                MakerState::RefundedOnA,
                action,
                NextAction::wait("leg A refund to become visible"),
                false,
            ));
        }

        let secret = leg_a.hashed_secret().and_then(|expected| {
            self.core
                .reconciler()
                .secrets()
                .get(&ctx.swap_id)
                .filter(|secret| SecretManager::verify(secret, &expected))
        });
        let Some(secret) = secret else {
            warn!(
                "Swap {}: no local secret for leg A hashlock; waiting to refund after {}",
                ctx.swap_id, timelock_a
            );
            return Ok(Self::outcome(snapshot, MakerState::SecretUnavailable, None, refund_a, false));
        };

        match leg_b.phase {
            LegPhase::Absent => Ok(Self::outcome(
                snapshot,
                MakerState::InitiatedOnA,
                None,
                NextAction::wait(format!(
                    "taker to initiate leg B (leg A refundable after {})",
                    timelock_a
                )),
                false,
            )),
            LegPhase::Initiated => {
                if !leg_b.terms_ok {
                    warn!(
                        "Swap {}: leg B does not match the auction terms, not claiming",
                        ctx.swap_id
                    );
                    return Ok(Self::outcome(snapshot, MakerState::InitiatedOnA, None, refund_a, false));
                }
                if self.core.performed(ChainSide::B, WriteOp::Claim).is_some() {
                    return Ok(Self::outcome(
                        snapshot,
                        MakerState::ClaimedOnB,
                        None,
                        NextAction::wait("leg B claim to become visible"),
                        false,
                    ));
                }
                if !leg_b.can_claim(snapshot.chain_time_b) {
                    return Ok(Self::outcome(snapshot, MakerState::InitiatedOnA, None, refund_a, false));
                }
                self.claim_b(snapshot, secret).await
            }
            LegPhase::Claimed => Ok(Self::outcome(
                snapshot,
                MakerState::ClaimedOnB,
                None,
                NextAction::wait(format!(
                    "taker to claim leg A (refundable after {})",
                    timelock_a
                )),
                false,
            )),
            LegPhase::Refunded => Ok(Self::outcome(snapshot, MakerState::InitiatedOnA, None, refund_a, false)),
        }
    }

    async fn claim_b(
        &self,
        snapshot: &SwapSnapshot,
        secret: crate::swap::Secret,
    ) -> SwapResult<StepOutcome> {
        let ctx = self.core.ctx();
        let expected = snapshot.leg_b.hashed_secret().ok_or_else(|| {
            SwapError::Internal(format!("swap {}: leg B initiated without hashlock", ctx.swap_id))
        })?;
        if !SecretManager::verify(&secret, &expected) {
            return Err(SwapError::SecretMismatch {
                swap_id: ctx.swap_id.to_hex(),
                expected: expected.to_hex(),
            });
        }

        let escrow = self.core.reconciler().escrow(ChainSide::B).clone();
        let action = self
            .core
            .write_once(ChainSide::B, WriteOp::Claim, escrow.claim(ctx.swap_id, secret))
            .await?;
        Ok(Self::outcome(
            snapshot,
            MakerState::ClaimedOnB,
            action,
            NextAction::wait("taker to claim leg A"),
            false,
        ))
    }

    fn finish(&self, snapshot: &SwapSnapshot, state: MakerState) -> StepOutcome {
        let ctx = self.core.ctx();
        self.core.reconciler().secrets().forget(&ctx.swap_id);
        info!("Swap {} finished for maker: {} [{}]", ctx.swap_id, state.as_str(), snapshot.phase);
        Self::outcome(snapshot, state, None, NextAction::Done, true)
    }

    async fn decide(&self, snapshot: &SwapSnapshot) -> SwapResult<StepOutcome> {
        let ctx = self.core.ctx();

        if snapshot.leg_a.phase != LegPhase::Absent && !snapshot.leg_a.terms_ok {
            return Err(SwapError::CorruptLeg {
                chain: ChainSide::A,
                swap_id: ctx.swap_id.to_hex(),
                message: "leg A does not match the auction terms".to_string(),
            });
        }

        match (snapshot.leg_a.phase, snapshot.leg_b.phase) {
            (LegPhase::Absent, _) => self.start(snapshot).await,
            (LegPhase::Initiated, _) => self.locked(snapshot).await,
            (LegPhase::Claimed, LegPhase::Initiated)
                if snapshot.leg_b.terms_ok && snapshot.leg_b.can_claim(snapshot.chain_time_b) =>
            {
                // Taker claimed first; the secret is ours either way
                let secret = snapshot
                    .revealed_secret
                    .clone()
                    .or_else(|| self.core.reconciler().secrets().get(&ctx.swap_id))
                    .ok_or_else(|| {
                        SwapError::Internal(format!("swap {}: secret unavailable", ctx.swap_id))
                    })?;
                self.claim_b(snapshot, secret).await
            }
            (LegPhase::Claimed, leg_b) => {
                if leg_b != LegPhase::Claimed {
                    warn!("Swap {}: leg A claimed but leg B is {}", ctx.swap_id, leg_b);
                }
                Ok(self.finish(snapshot, MakerState::Completed))
            }
            (LegPhase::Refunded, _) => Ok(self.finish(snapshot, MakerState::RefundedOnA)),
        }
    }
}

#[async_trait]
impl SwapAgent for MakerAgent {
    fn role(&self) -> Role {
        Role::Maker
    }

    fn context(&self) -> &SwapContext {
        self.core.ctx()
    }

    fn initial_state(&self) -> &'static str {
        MakerState::NotStarted.as_str()
    }

    async fn step(&self) -> SwapResult<StepOutcome> {
        let mut snapshot = self.core.reconciler().reconcile(self.core.ctx()).await?;
        let mut outcome = match snapshot.violation.take() {
            Some(violation) => self.contain(&snapshot, violation).await?,
            None => self.decide(&snapshot).await?,
        };
        outcome.exposed = self.core.exposed(&snapshot, ChainSide::A);
        Ok(outcome)
    }
}
