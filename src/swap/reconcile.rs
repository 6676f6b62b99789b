//! Chain state reconciliation
//!
//! The agents keep no session. Before every decision they rebuild the swap's
//! state from two sources per chain: the escrow's direct `swaps(swapId)`
//! record and a bounded scan of recent escrow events. `reconcile_legs` merges
//! those observations without touching the network; `Reconciler` gathers them.

use super::{
    ChainSide, HashedSecret, Leg, LegPhase, Secret, SecretManager, SecretStore, SwapContext,
    SwapId, SwapPhase, TimelockPolicy,
};
use crate::chain::EscrowLedger;
use crate::error::{SwapError, SwapResult};
use crate::events::EscrowEvent;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Raw data gathered from one escrow
#[derive(Debug, Clone, Default)]
pub struct LegObservation {
    /// Result of the direct record lookup
    pub record: Option<Leg>,
    /// Escrow events for the swap within the lookback window
    pub events: Vec<EscrowEvent>,
    /// Latest block timestamp of the chain
    pub chain_time: u64,
}

/// Merged view of one leg
#[derive(Debug, Clone)]
pub struct LegView {
    pub chain: ChainSide,
    pub phase: LegPhase,
    /// Leg details, when either source exposed them
    pub leg: Option<Leg>,
    /// False when the leg exists but disagrees with the auction's terms
    pub terms_ok: bool,
}

impl LegView {
    pub fn hashed_secret(&self) -> Option<HashedSecret> {
        self.leg.as_ref().map(|l| l.hashed_secret)
    }

    pub fn timelock(&self) -> Option<u64> {
        self.leg.as_ref().map(|l| l.timelock)
    }

    /// Initiated and refundable at `now`
    pub fn is_refund_eligible(&self, now: u64) -> bool {
        self.leg
            .as_ref()
            .map(|leg| TimelockPolicy::is_refund_eligible(leg, now))
            .unwrap_or(false)
    }

    /// Initiated and still claimable at `now`
    pub fn can_claim(&self, now: u64) -> bool {
        self.leg
            .as_ref()
            .map(|leg| TimelockPolicy::can_claim(leg, now))
            .unwrap_or(false)
    }
}

/// Reconciled state of both legs
#[derive(Debug, Clone)]
pub struct SwapSnapshot {
    pub swap_id: SwapId,
    pub phase: SwapPhase,
    pub leg_a: LegView,
    pub leg_b: LegView,
    /// Hashlock shared by both legs, once either is visible
    pub hashed_secret: Option<HashedSecret>,
    /// Secret revealed by a claim and verified against the hashlock
    pub revealed_secret: Option<Secret>,
    pub chain_time_a: u64,
    pub chain_time_b: u64,
    /// Hashlock or secret disagreement between the legs. Anyone can initiate
    /// under a public swap id, so this blocks claims and initiations but never
    /// a refund of the observer's own leg.
    pub violation: Option<SwapError>,
}

impl SwapSnapshot {
    pub fn leg(&self, side: ChainSide) -> &LegView {
        match side {
            ChainSide::A => &self.leg_a,
            ChainSide::B => &self.leg_b,
        }
    }

    pub fn chain_time(&self, side: ChainSide) -> u64 {
        match side {
            ChainSide::A => self.chain_time_a,
            ChainSide::B => self.chain_time_b,
        }
    }

    /// Value of the party owning leg `own` is still at stake: the leg is
    /// locked, or it was claimed while the counter leg is still open
    pub fn exposed(&self, own: ChainSide) -> bool {
        let (mine, theirs) = (self.leg(own), self.leg(own.other()));
        match mine.phase {
            LegPhase::Initiated => mine.terms_ok,
            LegPhase::Claimed => theirs.phase == LegPhase::Initiated && theirs.terms_ok,
            LegPhase::Absent | LegPhase::Refunded => false,
        }
    }
}

/// Merge both chains' observations into a snapshot.
///
/// Fails with `CorruptLeg` when one leg is reported both claimed and refunded
/// or its sources disagree on the hashlock. Two legs carrying different
/// hashlocks, or a revealed secret that does not hash to the hashlock, are
/// reported in `violation`; the snapshot then keeps leg A's hashlock and no
/// revealed secret.
pub fn reconcile_legs(
    ctx: &SwapContext,
    obs_a: &LegObservation,
    obs_b: &LegObservation,
) -> SwapResult<SwapSnapshot> {
    let leg_a = merge_leg(ctx, ChainSide::A, obs_a)?;
    let leg_b = merge_leg(ctx, ChainSide::B, obs_b)?;

    let mut violation = None;
    let hashed_secret = match (leg_a.hashed_secret(), leg_b.hashed_secret()) {
        (Some(hash_a), Some(hash_b)) if hash_a != hash_b => {
            violation = Some(SwapError::HashlockMismatch {
                swap_id: ctx.swap_id.to_hex(),
                hash_a: hash_a.to_hex(),
                hash_b: hash_b.to_hex(),
            });
            Some(hash_a)
        }
        (Some(hash), _) | (None, Some(hash)) => Some(hash),
        (None, None) => None,
    };

    let revealed_secret = if violation.is_some() {
        None
    } else {
        match revealed(ctx, obs_a, obs_b, hashed_secret) {
            Ok(secret) => secret,
            Err(e) => {
                violation = Some(e);
                None
            }
        }
    };

    Ok(SwapSnapshot {
        swap_id: ctx.swap_id,
        phase: SwapPhase {
            leg_a: leg_a.phase,
            leg_b: leg_b.phase,
        },
        leg_a,
        leg_b,
        hashed_secret,
        revealed_secret,
        chain_time_a: obs_a.chain_time,
        chain_time_b: obs_b.chain_time,
        violation,
    })
}

/// First claim event's secret, verified against the hashlock
fn revealed(
    ctx: &SwapContext,
    obs_a: &LegObservation,
    obs_b: &LegObservation,
    hashed_secret: Option<HashedSecret>,
) -> SwapResult<Option<Secret>> {
    for event in obs_b.events.iter().chain(obs_a.events.iter()) {
        let EscrowEvent::Claimed { swap_id, secret, chain, .. } = event else {
            continue;
        };
        if *swap_id != ctx.swap_id {
            continue;
        }
        let Some(expected) = hashed_secret else {
            debug!(
                "Swap {}: claim on chain {} seen but no hashlock visible to verify it",
                ctx.swap_id, chain
            );
            continue;
        };
        if !SecretManager::verify(secret, &expected) {
            return Err(SwapError::SecretMismatch {
                swap_id: ctx.swap_id.to_hex(),
                expected: expected.to_hex(),
            });
        }
        return Ok(Some(secret.clone()));
    }
    Ok(None)
}

fn merge_leg(ctx: &SwapContext, side: ChainSide, obs: &LegObservation) -> SwapResult<LegView> {
    let corrupt = |message: String| SwapError::CorruptLeg {
        chain: side,
        swap_id: ctx.swap_id.to_hex(),
        message,
    };

    let mut leg = obs
        .record
        .as_ref()
        .filter(|record| record.phase != LegPhase::Absent)
        .cloned();
    if let Some(record) = &leg {
        record.validate()?;
        if record.swap_id != ctx.swap_id {
            return Err(corrupt(format!("record belongs to swap {}", record.swap_id)));
        }
    }

    let mut phase = leg.as_ref().map(|l| l.phase).unwrap_or(LegPhase::Absent);
    let mut seen_claimed = phase == LegPhase::Claimed;
    let mut seen_refunded = phase == LegPhase::Refunded;

    for event in obs
        .events
        .iter()
        .filter(|e| e.swap_id() == ctx.swap_id && e.chain() == side)
    {
        let observed = match event {
            EscrowEvent::Initiated {
                initiator,
                recipient,
                hashed_secret,
                timelock,
                ..
            } => {
                match &leg {
                    Some(existing) if existing.hashed_secret != *hashed_secret => {
                        return Err(corrupt(format!(
                            "record hashlock {} but initiation event hashlock {}",
                            existing.hashed_secret, hashed_secret
                        )));
                    }
                    Some(_) => {}
                    None => {
                        // Token and amount are not part of the event
                        let terms = ctx.terms(side);
                        leg = Some(Leg {
                            swap_id: ctx.swap_id,
                            chain: side,
                            initiator: *initiator,
                            recipient: *recipient,
                            token: terms.token,
                            amount: terms.amount,
                            hashed_secret: *hashed_secret,
                            timelock: *timelock,
                            phase: LegPhase::Initiated,
                        });
                    }
                }
                LegPhase::Initiated
            }
            EscrowEvent::Claimed { .. } => {
                seen_claimed = true;
                LegPhase::Claimed
            }
            EscrowEvent::Refunded { .. } => {
                seen_refunded = true;
                LegPhase::Refunded
            }
        };
        if observed.rank() > phase.rank() {
            phase = observed;
        }
    }

    if seen_claimed && seen_refunded {
        return Err(corrupt("leg reported both claimed and refunded".to_string()));
    }

    if let Some(details) = leg.as_mut() {
        details.phase = phase;
    }

    let terms_ok = leg
        .as_ref()
        .map(|l| l.matches_terms(ctx.terms(side)))
        .unwrap_or(true);
    if !terms_ok {
        warn!(
            "Swap {}: leg on chain {} does not match auction terms",
            ctx.swap_id, side
        );
    }

    Ok(LegView {
        chain: side,
        phase,
        leg,
        terms_ok,
    })
}

/// Gathers observations from both escrows and merges them
pub struct Reconciler {
    escrow_a: Arc<dyn EscrowLedger>,
    escrow_b: Arc<dyn EscrowLedger>,
    secrets: Arc<SecretStore>,
    lookback_blocks: u64,
    rpc_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        escrow_a: Arc<dyn EscrowLedger>,
        escrow_b: Arc<dyn EscrowLedger>,
        secrets: Arc<SecretStore>,
        lookback_blocks: u64,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            escrow_a,
            escrow_b,
            secrets,
            lookback_blocks,
            rpc_timeout,
        }
    }

    pub fn secrets(&self) -> &Arc<SecretStore> {
        &self.secrets
    }

    pub fn escrow(&self, side: ChainSide) -> &Arc<dyn EscrowLedger> {
        match side {
            ChainSide::A => &self.escrow_a,
            ChainSide::B => &self.escrow_b,
        }
    }

    /// Fresh snapshot of the swap; a verified revealed secret is cached
    pub async fn reconcile(&self, ctx: &SwapContext) -> SwapResult<SwapSnapshot> {
        let result: SwapResult<SwapSnapshot> = async {
            let (obs_a, obs_b) = tokio::try_join!(
                self.observe(ChainSide::A, ctx.swap_id),
                self.observe(ChainSide::B, ctx.swap_id)
            )?;
            let mut snapshot = reconcile_legs(ctx, &obs_a, &obs_b)?;

            if let (Some(secret), Some(expected)) =
                (snapshot.revealed_secret.take(), snapshot.hashed_secret)
            {
                let cached = self.secrets.record_verified(ctx.swap_id, secret, &expected)?;
                snapshot.revealed_secret = Some(cached);
            }
            Ok(snapshot)
        }
        .await;

        match &result {
            Ok(SwapSnapshot {
                violation: Some(violation),
                ..
            }) => {
                error!(
                    "Reconcile of swap {} found a protocol violation: {}",
                    ctx.swap_id, violation
                );
                crate::metrics::record_reconcile("violation");
                crate::metrics::record_protocol_violation(violation);
            }
            Ok(snapshot) => {
                debug!("Reconciled swap {}: {}", ctx.swap_id, snapshot.phase);
                crate::metrics::record_reconcile("ok");
            }
            Err(e) if e.is_protocol_violation() => {
                error!("Reconcile of swap {} found a protocol violation: {}", ctx.swap_id, e);
                crate::metrics::record_reconcile("violation");
                crate::metrics::record_protocol_violation(e);
            }
            Err(e) => {
                warn!("Reconcile of swap {} failed: {}", ctx.swap_id, e);
                crate::metrics::record_reconcile("error");
            }
        }
        result
    }

    /// Direct lookup, event scan and chain time for one escrow
    pub async fn observe(&self, side: ChainSide, swap_id: SwapId) -> SwapResult<LegObservation> {
        let escrow = self.escrow(side);
        let (chain_time, record, events) = tokio::try_join!(
            self.bounded("chain time", side, escrow.chain_time()),
            self.bounded("swap record", side, escrow.swap_record(swap_id)),
            self.bounded(
                "swap event scan",
                side,
                escrow.scan_swap_events(swap_id, self.lookback_blocks)
            ),
        )?;
        Ok(LegObservation {
            record,
            events,
            chain_time,
        })
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        side: ChainSide,
        fut: impl Future<Output = SwapResult<T>>,
    ) -> SwapResult<T> {
        tokio::time::timeout(self.rpc_timeout, fut)
            .await
            .map_err(|_| SwapError::Timeout {
                operation: format!("{} on chain {}", operation, side),
            })?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::MockEscrowLedger;
    use crate::swap::LegTerms;
    use ethers::types::{Address, H256, U256};

    pub(crate) fn maker() -> Address {
        Address::repeat_byte(0x11)
    }

    pub(crate) fn taker() -> Address {
        Address::repeat_byte(0x22)
    }

    pub(crate) fn context() -> SwapContext {
        let swap_id = SwapId::from_auction_id(7);
        SwapContext {
            auction_id: 7,
            swap_id,
            maker: maker(),
            taker: taker(),
            leg_a: LegTerms {
                chain: ChainSide::A,
                sender: maker(),
                recipient: taker(),
                token: Address::repeat_byte(0xaa),
                amount: U256::from(1),
            },
            leg_b: LegTerms {
                chain: ChainSide::B,
                sender: taker(),
                recipient: maker(),
                token: Address::repeat_byte(0xbb),
                amount: U256::from(2),
            },
        }
    }

    pub(crate) fn leg(ctx: &SwapContext, side: ChainSide, hash: HashedSecret, phase: LegPhase) -> Leg {
        let terms = ctx.terms(side);
        Leg {
            swap_id: ctx.swap_id,
            chain: side,
            initiator: terms.sender,
            recipient: terms.recipient,
            token: terms.token,
            amount: terms.amount,
            hashed_secret: hash,
            timelock: if side == ChainSide::A { 5_000 } else { 3_000 },
            phase,
        }
    }

    fn observed(record: Option<Leg>, events: Vec<EscrowEvent>) -> LegObservation {
        LegObservation {
            record,
            events,
            chain_time: 1_000,
        }
    }

    fn claimed(ctx: &SwapContext, side: ChainSide, secret: &Secret) -> EscrowEvent {
        EscrowEvent::Claimed {
            chain: side,
            swap_id: ctx.swap_id,
            secret: secret.clone(),
            block_number: 10,
            tx_hash: H256::zero(),
        }
    }

    #[test]
    fn test_nothing_on_chain_is_absent() {
        let ctx = context();
        let snapshot =
            reconcile_legs(&ctx, &LegObservation::default(), &LegObservation::default()).unwrap();
        assert_eq!(snapshot.phase.leg_a, LegPhase::Absent);
        assert_eq!(snapshot.phase.leg_b, LegPhase::Absent);
        assert!(snapshot.hashed_secret.is_none());
        assert!(snapshot.leg_a.terms_ok);
    }

    #[test]
    fn test_event_advances_stale_record() {
        let ctx = context();
        let (secret, hash) = SecretManager::generate().unwrap();
        let record_b = leg(&ctx, ChainSide::B, hash, LegPhase::Initiated);

        let snapshot = reconcile_legs(
            &ctx,
            &observed(Some(leg(&ctx, ChainSide::A, hash, LegPhase::Initiated)), vec![]),
            &observed(Some(record_b), vec![claimed(&ctx, ChainSide::B, &secret)]),
        )
        .unwrap();

        assert_eq!(snapshot.phase.leg_b, LegPhase::Claimed);
        assert_eq!(snapshot.leg_b.leg.as_ref().unwrap().phase, LegPhase::Claimed);
        assert_eq!(snapshot.revealed_secret, Some(secret));
    }

    #[test]
    fn test_initiation_event_alone_recovers_leg() {
        let ctx = context();
        let (_, hash) = SecretManager::generate().unwrap();
        let event = EscrowEvent::Initiated {
            chain: ChainSide::A,
            swap_id: ctx.swap_id,
            initiator: maker(),
            recipient: taker(),
            hashed_secret: hash,
            timelock: 5_000,
            block_number: 3,
            tx_hash: H256::zero(),
        };

        let snapshot =
            reconcile_legs(&ctx, &observed(None, vec![event]), &LegObservation::default()).unwrap();
        assert_eq!(snapshot.phase.leg_a, LegPhase::Initiated);
        assert_eq!(snapshot.leg_a.timelock(), Some(5_000));
        assert_eq!(snapshot.hashed_secret, Some(hash));
        assert!(snapshot.leg_a.can_claim(1_000));
        assert!(snapshot.leg_a.is_refund_eligible(5_000));
    }

    #[test]
    fn test_claimed_and_refunded_leg_is_corrupt() {
        let ctx = context();
        let (_, hash) = SecretManager::generate().unwrap();
        let refunded = EscrowEvent::Refunded {
            chain: ChainSide::A,
            swap_id: ctx.swap_id,
            block_number: 12,
            tx_hash: H256::zero(),
        };

        let result = reconcile_legs(
            &ctx,
            &observed(Some(leg(&ctx, ChainSide::A, hash, LegPhase::Claimed)), vec![refunded]),
            &LegObservation::default(),
        );
        assert!(matches!(result, Err(SwapError::CorruptLeg { chain: ChainSide::A, .. })));
    }

    #[test]
    fn test_hashlock_mismatch_between_legs() {
        let ctx = context();
        let (_, hash_a) = SecretManager::generate().unwrap();
        let (_, hash_b) = SecretManager::generate().unwrap();

        let snapshot = reconcile_legs(
            &ctx,
            &observed(Some(leg(&ctx, ChainSide::A, hash_a, LegPhase::Initiated)), vec![]),
            &observed(Some(leg(&ctx, ChainSide::B, hash_b, LegPhase::Initiated)), vec![]),
        )
        .unwrap();
        let err = snapshot.violation.clone().unwrap();
        assert!(matches!(err, SwapError::HashlockMismatch { .. }));
        assert!(err.is_protocol_violation());

        // Both legs stay visible so each owner can still refund
        assert_eq!(snapshot.hashed_secret, Some(hash_a));
        assert!(snapshot.leg_a.is_refund_eligible(5_000));
        assert!(snapshot.leg_b.is_refund_eligible(3_000));
        assert!(snapshot.exposed(ChainSide::A));
    }

    #[test]
    fn test_unverifiable_revealed_secret_is_a_violation() {
        let ctx = context();
        let (_, hash) = SecretManager::generate().unwrap();
        let (wrong, _) = SecretManager::generate().unwrap();

        let snapshot = reconcile_legs(
            &ctx,
            &observed(Some(leg(&ctx, ChainSide::A, hash, LegPhase::Initiated)), vec![]),
            &observed(
                Some(leg(&ctx, ChainSide::B, hash, LegPhase::Claimed)),
                vec![claimed(&ctx, ChainSide::B, &wrong)],
            ),
        )
        .unwrap();
        assert!(matches!(snapshot.violation, Some(SwapError::SecretMismatch { .. })));
        assert!(snapshot.revealed_secret.is_none());
    }

    #[test]
    fn test_exposure_follows_own_leg() {
        let ctx = context();
        let (secret, hash) = SecretManager::generate().unwrap();

        let snapshot = reconcile_legs(
            &ctx,
            &observed(Some(leg(&ctx, ChainSide::A, hash, LegPhase::Initiated)), vec![]),
            &observed(
                Some(leg(&ctx, ChainSide::B, hash, LegPhase::Claimed)),
                vec![claimed(&ctx, ChainSide::B, &secret)],
            ),
        )
        .unwrap();
        // Maker still locked on A; taker owed A after B was claimed
        assert!(snapshot.exposed(ChainSide::A));
        assert!(snapshot.exposed(ChainSide::B));

        let settled = reconcile_legs(
            &ctx,
            &observed(Some(leg(&ctx, ChainSide::A, hash, LegPhase::Refunded)), vec![]),
            &LegObservation::default(),
        )
        .unwrap();
        assert!(!settled.exposed(ChainSide::A));
        assert!(!settled.exposed(ChainSide::B));
    }

    #[test]
    fn test_wrong_terms_are_flagged() {
        let ctx = context();
        let (_, hash) = SecretManager::generate().unwrap();
        let mut short = leg(&ctx, ChainSide::B, hash, LegPhase::Initiated);
        short.amount = U256::from(1);

        let snapshot = reconcile_legs(
            &ctx,
            &observed(Some(leg(&ctx, ChainSide::A, hash, LegPhase::Initiated)), vec![]),
            &observed(Some(short), vec![]),
        )
        .unwrap();
        assert!(snapshot.leg_a.terms_ok);
        assert!(!snapshot.leg_b.terms_ok);
    }

    #[tokio::test]
    async fn test_reconciler_caches_verified_secret() {
        let ctx = context();
        let (secret, hash) = SecretManager::generate().unwrap();

        let mut escrow_a = MockEscrowLedger::new();
        let record_a = leg(&ctx, ChainSide::A, hash, LegPhase::Initiated);
        escrow_a.expect_chain_time().returning(|| Ok(1_000));
        escrow_a
            .expect_swap_record()
            .returning(move |_| Ok(Some(record_a.clone())));
        escrow_a.expect_scan_swap_events().returning(|_, _| Ok(vec![]));

        let mut escrow_b = MockEscrowLedger::new();
        let record_b = leg(&ctx, ChainSide::B, hash, LegPhase::Claimed);
        let reveal = claimed(&ctx, ChainSide::B, &secret);
        escrow_b.expect_chain_time().returning(|| Ok(1_001));
        escrow_b
            .expect_swap_record()
            .returning(move |_| Ok(Some(record_b.clone())));
        escrow_b
            .expect_scan_swap_events()
            .returning(move |_, _| Ok(vec![reveal.clone()]));

        let secrets = Arc::new(SecretStore::new());
        let reconciler = Reconciler::new(
            Arc::new(escrow_a),
            Arc::new(escrow_b),
            secrets.clone(),
            1_000,
            Duration::from_secs(5),
        );

        let snapshot = reconciler.reconcile(&ctx).await.unwrap();
        assert_eq!(snapshot.phase.leg_b, LegPhase::Claimed);
        assert_eq!(snapshot.chain_time(ChainSide::B), 1_001);
        assert_eq!(secrets.get(&ctx.swap_id), Some(secret));
    }

    #[tokio::test]
    async fn test_reconciler_propagates_chain_errors() {
        let ctx = context();
        let mut escrow_a = MockEscrowLedger::new();
        escrow_a.expect_chain_time().returning(|| {
            Err(SwapError::ChainConnection {
                chain: ChainSide::A,
                message: "down".into(),
            })
        });
        escrow_a.expect_swap_record().returning(|_| Ok(None));
        escrow_a.expect_scan_swap_events().returning(|_, _| Ok(vec![]));
        let mut escrow_b = MockEscrowLedger::new();
        escrow_b.expect_chain_time().returning(|| Ok(1));
        escrow_b.expect_swap_record().returning(|_| Ok(None));
        escrow_b.expect_scan_swap_events().returning(|_, _| Ok(vec![]));

        let reconciler = Reconciler::new(
            Arc::new(escrow_a),
            Arc::new(escrow_b),
            Arc::new(SecretStore::new()),
            1_000,
            Duration::from_secs(5),
        );
        let err = reconciler.reconcile(&ctx).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
