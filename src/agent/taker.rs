//! Taker side: locks leg B against a confirmed leg A, claims leg A with the
//! secret the maker reveals on leg B

use super::{ActionTaken, AgentCore, NextAction, StepOutcome, SwapAgent, WriteOp};
use crate::chain::InitiateRequest;
use crate::error::{SwapError, SwapResult};
use crate::swap::{ChainSide, LegPhase, Role, SecretManager, SwapContext, SwapSnapshot};

use async_trait::async_trait;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakerState {
    /// Waiting for the maker's leg A
    NotStarted,
    InitiatedOnB,
    ClaimedOnA,
    RefundedOnB,
    /// Leg A was refunded before leg B existed
    Aborted,
    /// Leg A can no longer be claimed
    Expired,
    /// Protocol violation seen; only a refund of leg B remains
    Halted,
}

impl TakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            TakerState::NotStarted => "not_started",
            TakerState::InitiatedOnB => "initiated_on_b",
            TakerState::ClaimedOnA => "claimed_on_a",
            TakerState::RefundedOnB => "refunded_on_b",
            TakerState::Aborted => "aborted",
            TakerState::Expired => "expired",
            TakerState::Halted => "halted",
        }
    }
}

pub struct TakerAgent {
    core: AgentCore,
}

impl TakerAgent {
    pub fn new(core: AgentCore) -> Self {
        Self { core }
    }

    fn outcome(
        snapshot: &SwapSnapshot,
        state: TakerState,
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

    /// Refund leg B if it is ours and locked, then stop with `violation`
    async fn contain(&self, snapshot: &SwapSnapshot, violation: SwapError) -> SwapResult<StepOutcome> {
        match self
            .core
            .refund_own_leg(snapshot, ChainSide::B, &violation)
            .await?
        {
            Some((action, next)) => {
                let state = if action.is_some() {
                    TakerState::RefundedOnB
                } else {
                    TakerState::Halted
                };
                Ok(Self::outcome(snapshot, state, action, next, false))
            }
            None => {
                self.core.reconciler().secrets().forget(&self.core.ctx().swap_id);
                Err(violation)
            }
        }
    }

    fn finish(&self, snapshot: &SwapSnapshot, state: TakerState) -> StepOutcome {
        let ctx = self.core.ctx();
        self.core.reconciler().secrets().forget(&ctx.swap_id);
        info!("Swap {} finished for taker: {} [{}]", ctx.swap_id, state.as_str(), snapshot.phase);
        Self::outcome(snapshot, state, None, NextAction::Done, true)
    }

    /// Lock leg B against the observed leg A
    async fn lock_b(&self, snapshot: &SwapSnapshot) -> SwapResult<StepOutcome> {
        let ctx = self.core.ctx();
        let leg_a = &snapshot.leg_a;

        if !leg_a.terms_ok {
            warn!(
                "Swap {}: leg A does not match the auction terms, not locking leg B",
                ctx.swap_id
            );
            return Ok(Self::outcome(
                snapshot,
                TakerState::NotStarted,
                None,
                NextAction::wait("a leg A matching the auction terms"),
                false,
            ));
        }
        if self.core.performed(ChainSide::B, WriteOp::Initiate).is_some() {
            return Ok(Self::outcome(
                snapshot,
                TakerState::InitiatedOnB,
                None,
                NextAction::wait("leg B initiation to become visible"),
                false,
            ));
        }
        if !leg_a.can_claim(snapshot.chain_time_a) {
            return Ok(self.finish(snapshot, TakerState::Expired));
        }

        let (Some(hashed_secret), Some(timelock_a)) = (leg_a.hashed_secret(), leg_a.timelock()) else {
            return Err(SwapError::Internal(format!(
                "swap {}: leg A initiated without details",
                ctx.swap_id
            )));
        };
        let timelock_b = self
            .core
            .policy()
            .taker_timelock(snapshot.chain_time_b, timelock_a)?;

        let escrow = self.core.reconciler().escrow(ChainSide::B).clone();
        let terms = &ctx.leg_b;
        self.core
            .write_once(ChainSide::B, WriteOp::Approve, escrow.approve(terms.token, terms.amount))
            .await?;
        let action = self
            .core
            .write_once(
                ChainSide::B,
                WriteOp::Initiate,
                escrow.initiate(InitiateRequest {
                    swap_id: ctx.swap_id,
                    recipient: terms.recipient,
                    token: terms.token,
                    amount: terms.amount,
                    hashed_secret,
                    timelock: timelock_b,
                }),
            )
            .await?;

        Ok(Self::outcome(
            snapshot,
            TakerState::InitiatedOnB,
            action,
            NextAction::wait("maker to claim leg B"),
            false,
        ))
    }

    /// Claim leg A with the secret revealed on leg B
    async fn claim_a(&self, snapshot: &SwapSnapshot) -> SwapResult<StepOutcome> {
        let ctx = self.core.ctx();
        let leg_a = &snapshot.leg_a;

        if self.core.performed(ChainSide::A, WriteOp::Claim).is_some() {
            return Ok(Self::outcome(
                snapshot,
                TakerState::ClaimedOnA,
                None,
                NextAction::wait("leg A claim to become visible"),
                false,
            ));
        }
        if !leg_a.can_claim(snapshot.chain_time_a) {
            warn!("Swap {}: secret revealed but leg A is no longer claimable", ctx.swap_id);
            return Ok(self.finish(snapshot, TakerState::Expired));
        }

        let secret = snapshot
            .revealed_secret
            .clone()
            .or_else(|| self.core.reconciler().secrets().get(&ctx.swap_id));
        let Some(secret) = secret else {
            // Claimed record seen before the event carrying the secret
            return Ok(Self::outcome(
                snapshot,
                TakerState::InitiatedOnB,
                None,
                NextAction::Claim { chain: ChainSide::A },
                false,
            ));
        };

        let expected = leg_a.hashed_secret().ok_or_else(|| {
            SwapError::Internal(format!("swap {}: leg A initiated without hashlock", ctx.swap_id))
        })?;
        if !SecretManager::verify(&secret, &expected) {
            return Err(SwapError::SecretMismatch {
                swap_id: ctx.swap_id.to_hex(),
                expected: expected.to_hex(),
            });
        }

        let escrow = self.core.reconciler().escrow(ChainSide::A).clone();
        let action = self
            .core
            .write_once(ChainSide::A, WriteOp::Claim, escrow.claim(ctx.swap_id, secret))
            .await?;
        Ok(Self::outcome(
            snapshot,
            TakerState::ClaimedOnA,
            action,
            NextAction::wait("leg A claim to become visible"),
            false,
        ))
    }

    /// Refund leg B once its timelock passes
    async fn refund_b(&self, snapshot: &SwapSnapshot, waiting: TakerState) -> SwapResult<StepOutcome> {
        let ctx = self.core.ctx();
        let leg_b = &snapshot.leg_b;
        let timelock_b = leg_b.timelock().unwrap_or_default();

        if !leg_b.is_refund_eligible(snapshot.chain_time_b) {
            return Ok(Self::outcome(
                snapshot,
                waiting,
                None,
                NextAction::Refund {
                    chain: ChainSide::B,
                    after: timelock_b,
                },
                false,
            ));
        }

        info!("Swap {}: leg B expired unclaimed, refunding", ctx.swap_id);
        let escrow = self.core.reconciler().escrow(ChainSide::B).clone();
        let action = self
            .core
            .write_once(ChainSide::B, WriteOp::Refund, escrow.refund(ctx.swap_id))
            .await?;
        Ok(Self::outcome(
            snapshot,
            TakerState::RefundedOnB,
            action,
            NextAction::wait("leg B refund to become visible"),
            false,
        ))
    }

    async fn decide(&self, snapshot: &SwapSnapshot) -> SwapResult<StepOutcome> {
        let ctx = self.core.ctx();

        if snapshot.leg_b.phase != LegPhase::Absent && !snapshot.leg_b.terms_ok {
            return Err(SwapError::CorruptLeg {
                chain: ChainSide::B,
                swap_id: ctx.swap_id.to_hex(),
                message: "leg B does not match the auction terms".to_string(),
            });
        }

        match (snapshot.leg_a.phase, snapshot.leg_b.phase) {
            // Never lock leg B without a confirmed leg A
            (LegPhase::Absent, LegPhase::Absent) => Ok(Self::outcome(
                snapshot,
                TakerState::NotStarted,
                None,
                NextAction::wait("maker to initiate leg A"),
                false,
            )),
            (LegPhase::Absent, LegPhase::Initiated) => {
                self.refund_b(snapshot, TakerState::InitiatedOnB).await
            }
            (LegPhase::Initiated, LegPhase::Absent) => self.lock_b(snapshot).await,
            (LegPhase::Initiated, LegPhase::Initiated) => {
                if snapshot.leg_b.is_refund_eligible(snapshot.chain_time_b) {
                    self.refund_b(snapshot, TakerState::InitiatedOnB).await
                } else {
                    Ok(Self::outcome(
                        snapshot,
                        TakerState::InitiatedOnB,
                        None,
                        NextAction::wait(format!(
                            "maker to claim leg B (refundable after {})",
                            snapshot.leg_b.timelock().unwrap_or_default()
                        )),
                        false,
                    ))
                }
            }
            (LegPhase::Initiated, LegPhase::Claimed) => self.claim_a(snapshot).await,
            (LegPhase::Refunded, LegPhase::Absent) => Ok(self.finish(snapshot, TakerState::Aborted)),
            (LegPhase::Refunded, LegPhase::Initiated) | (LegPhase::Claimed, LegPhase::Initiated) => {
                self.refund_b(snapshot, TakerState::InitiatedOnB).await
            }
            (LegPhase::Claimed, LegPhase::Claimed) => Ok(self.finish(snapshot, TakerState::ClaimedOnA)),
            (_, LegPhase::Refunded) => Ok(self.finish(snapshot, TakerState::RefundedOnB)),
            (LegPhase::Absent, LegPhase::Claimed) | (LegPhase::Refunded, LegPhase::Claimed) => {
                warn!(
                    "Swap {}: leg B claimed while leg A is {}",
                    ctx.swap_id, snapshot.leg_a.phase
                );
                Ok(self.finish(snapshot, TakerState::Expired))
            }
            (LegPhase::Claimed, LegPhase::Absent) => Ok(self.finish(snapshot, TakerState::ClaimedOnA)),
        }
    }
}

#[async_trait]
impl SwapAgent for TakerAgent {
    fn role(&self) -> Role {
        Role::Taker
    }

    fn context(&self) -> &SwapContext {
        self.core.ctx()
    }

    fn initial_state(&self) -> &'static str {
        TakerState::NotStarted.as_str()
    }

    async fn step(&self) -> SwapResult<StepOutcome> {
        let mut snapshot = self.core.reconciler().reconcile(self.core.ctx()).await?;
        let mut outcome = match snapshot.violation.take() {
            Some(violation) => self.contain(&snapshot, violation).await?,
            None => self.decide(&snapshot).await?,
        };
        outcome.exposed = self.core.exposed(&snapshot, ChainSide::B);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{maker, settle, taker, token_a, token_b, World};
    use super::super::MakerAgent;
    use super::*;
    use crate::chain::EscrowLedger;
    use ethers::types::{Address, U256};

    #[tokio::test]
    async fn test_maker_never_claims_taker_refunds() {
        let world = World::new().await;
        let maker_agent = MakerAgent::new(world.core_for(maker()));
        let taker_agent = TakerAgent::new(world.core_for(taker()));
        settle(&maker_agent).await;
        settle(&taker_agent).await;
        assert_eq!(world.escrow_b.balance(token_b(), taker()), U256::from(8));

        world.clock.advance(1_801);
        let refunded = taker_agent.step().await.unwrap();
        assert_eq!(refunded.state, "refunded_on_b");

        let done = taker_agent.step().await.unwrap();
        assert!(done.terminal);
        assert_eq!(done.state, "refunded_on_b");
        assert_eq!(world.escrow_b.balance(token_b(), taker()), U256::from(10));

        // Maker's leg A outlives leg B by the margin, then is refunded too
        world.clock.advance(1_800);
        let maker_refund = settle(&maker_agent).await;
        assert!(maker_refund.terminal);
        assert_eq!(maker_refund.state, "refunded_on_a");
        assert_eq!(world.escrow_a.balance(token_a(), maker()), U256::from(10));
    }

    #[tokio::test]
    async fn test_taker_aborts_when_leg_a_refunded_first() {
        let world = World::new().await;
        let maker_agent = MakerAgent::new(world.core_for(maker()));
        let taker_agent = TakerAgent::new(world.core_for(taker()));
        settle(&maker_agent).await;

        world.clock.advance(3_700);
        settle(&maker_agent).await;

        let outcome = taker_agent.step().await.unwrap();
        assert_eq!(outcome.state, "aborted");
        assert!(outcome.terminal);
        assert!(world.escrow_b.writes_by(taker()).is_empty());
    }

    #[tokio::test]
    async fn test_late_taker_halts_without_locking() {
        let world = World::new().await;
        let maker_agent = MakerAgent::new(world.core_for(maker()));
        settle(&maker_agent).await;

        // Leg B would now end inside the margin before leg A
        world.clock.advance(1_000);
        let taker_agent = TakerAgent::new(world.core_for(taker()));
        let err = taker_agent.step().await.unwrap_err();
        assert!(matches!(err, SwapError::TimelockOrdering { .. }));
        assert!(err.is_protocol_violation());
        assert!(world.escrow_b.writes_by(taker()).is_empty());
    }

    #[tokio::test]
    async fn test_hashlock_mismatch_holds_both_legs_until_refund() {
        let world = World::new().await;
        let maker_agent = MakerAgent::new(world.core_for(maker()));
        settle(&maker_agent).await;

        // Leg B locked under a different hashlock
        let (_, other_hash) = SecretManager::generate().unwrap();
        let escrow_b = world.escrow_b.as_account(taker());
        escrow_b.approve(token_b(), U256::from(2)).await.unwrap();
        escrow_b
            .initiate(InitiateRequest {
                swap_id: world.ctx.swap_id,
                recipient: maker(),
                token: token_b(),
                amount: U256::from(2),
                hashed_secret: other_hash,
                timelock: world.clock.now() + 1_800,
            })
            .await
            .unwrap();

        let taker_agent = TakerAgent::new(world.core_for(taker()));
        let held = taker_agent.step().await.unwrap();
        assert_eq!(held.state, "halted");
        assert!(held.action.is_none());
        assert!(matches!(held.next, NextAction::Refund { chain: ChainSide::B, .. }));

        let maker_held = maker_agent.step().await.unwrap();
        assert_eq!(maker_held.state, "halted");
        assert!(world.escrow_b.writes_by(maker()).is_empty());

        world.clock.advance(1_801);
        let refunded = taker_agent.step().await.unwrap();
        assert_eq!(refunded.state, "refunded_on_b");
        let err = taker_agent.step().await.unwrap_err();
        assert!(matches!(err, SwapError::HashlockMismatch { .. }));
        assert_eq!(world.escrow_b.balance(token_b(), taker()), U256::from(10));

        world.clock.advance(1_800);
        assert_eq!(maker_agent.step().await.unwrap().state, "refunded_on_a");
        assert!(maker_agent.step().await.is_err());
        assert_eq!(world.escrow_a.balance(token_a(), maker()), U256::from(10));
        assert!(world.escrow_a.writes_by(taker()).is_empty());
    }

    #[tokio::test]
    async fn test_taker_never_locks_against_wrong_leg_a() {
        let squatter = Address::repeat_byte(0x33);
        // (initiator, token, amount) of leg A, each off the auction terms once
        let cases = [
            (maker(), token_a(), U256::from(5)),
            (maker(), token_b(), U256::from(1)),
            (squatter, token_a(), U256::from(1)),
        ];

        for (initiator, token, amount) in cases {
            let world = World::new().await;
            world.escrow_a.mint(token, initiator, U256::from(10));
            let (_, hash) = SecretManager::generate().unwrap();
            let escrow_a = world.escrow_a.as_account(initiator);
            escrow_a.approve(token, amount).await.unwrap();
            escrow_a
                .initiate(InitiateRequest {
                    swap_id: world.ctx.swap_id,
                    recipient: taker(),
                    token,
                    amount,
                    hashed_secret: hash,
                    timelock: world.clock.now() + 3_600,
                })
                .await
                .unwrap();

            let taker_agent = TakerAgent::new(world.core_for(taker()));
            for _ in 0..3 {
                let outcome = taker_agent.step().await.unwrap();
                assert_eq!(outcome.state, "not_started");
                assert!(outcome.action.is_none());
                assert!(!outcome.exposed);
            }
            assert!(world.escrow_b.writes_by(taker()).is_empty());
            assert_eq!(world.escrow_b.balance(token_b(), taker()), U256::from(10));
        }
    }

    #[tokio::test]
    async fn test_taker_learns_secret_from_events_only() {
        let world = World::new().await;
        world.escrow_a.hide_records();
        world.escrow_b.hide_records();
        let maker_agent = MakerAgent::new(world.core_for(maker()));
        let taker_agent = TakerAgent::new(world.core_for(taker()));

        settle(&maker_agent).await;
        settle(&taker_agent).await;
        settle(&maker_agent).await;
        let done = settle(&taker_agent).await;
        assert_eq!(done.state, "claimed_on_a");
        assert_eq!(world.escrow_a.balance(token_a(), taker()), U256::from(1));
    }
}
