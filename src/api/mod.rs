//! HTTP API for health checks, auctions and swap status

use crate::chain::CreateAuctionRequest;
use crate::config::ApiConfig;
use crate::coordination::{SwapCoordinator, SwapStatus};
use crate::error::{SwapError, SwapResult};
use crate::events::AuctionEvent;
use crate::swap::{
    resolve, resolve_for, resolve_role, swap_id_for, Auction, ChainSide, HashedSecret, LegPhase,
    Role, Secret, SecretManager, SwapPhase, SwapSnapshot,
};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::{Address, TxHash, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SwapCoordinator>,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, coordinator: Arc<SwapCoordinator>) -> SwapResult<()> {
    let app = router(AppState { coordinator });

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SwapError::Config(format!("Cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| SwapError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/auctions", get(list_auctions).post(create_auction))
        .route("/auctions/:id", get(get_auction))
        .route("/auctions/:id/bid", post(place_bid))
        .route("/auctions/:id/end", post(end_auction))
        .route("/swaps", get(list_swaps))
        .route("/swaps/:auction_id", get(get_swap))
        .route("/swaps/:auction_id/secret", post(import_secret))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body with a status chosen from the error class
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<SwapError> for ApiError {
    fn from(error: SwapError) -> Self {
        let status = match &error {
            SwapError::AuctionNotFound { .. } => StatusCode::NOT_FOUND,
            SwapError::SecretMismatch { .. } | SwapError::InvalidRecord { kind: "secret", .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            e if e.is_precondition() || e.is_protocol_violation() => StatusCode::CONFLICT,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            SwapError::ChainCallFailed { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        account: state.coordinator.chains().account(),
    })
}

/// Readiness check - both chains reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let chain_health = state.coordinator.chains().health_check().await;
    let ready = chain_health.iter().all(|(_, healthy)| *healthy);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            chains: chain_health
                .into_iter()
                .map(|(chain, healthy)| ChainHealth { chain, healthy })
                .collect(),
        }),
    )
}

async fn list_auctions(State(state): State<AppState>) -> ApiResult<AuctionsResponse> {
    let auctions = state.coordinator.chains().auctions();
    let count = auctions.auction_count().await?;

    let mut response = AuctionsResponse {
        active: Vec::new(),
        ended: Vec::new(),
    };
    for auction_id in 1..=count {
        if let Some(auction) = auctions.auction(auction_id).await? {
            if auction.ended {
                response.ended.push(auction);
            } else {
                response.active.push(auction);
            }
        }
    }
    Ok(Json(response))
}

async fn get_auction(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Auction> {
    let auction = state
        .coordinator
        .chains()
        .auctions()
        .auction(id)
        .await?
        .ok_or(SwapError::AuctionNotFound { auction_id: id })?;
    Ok(Json(auction))
}

async fn create_auction(
    State(state): State<AppState>,
    Json(body): Json<CreateAuctionBody>,
) -> ApiResult<CreateAuctionResponse> {
    let request = CreateAuctionRequest {
        token_a: parse_address("token_a", &body.token_a)?,
        amount_a: parse_amount("amount_a", &body.amount_a)?,
        token_b: parse_address("token_b", &body.token_b)?,
        min_amount_b: parse_amount("min_amount_b", &body.min_amount_b)?,
        duration_secs: body.duration_secs,
    };
    if request.amount_a.is_zero() || request.duration_secs == 0 {
        return Err(ApiError::bad_request("amount_a and duration_secs must be positive"));
    }

    let auction_id = state.coordinator.chains().auctions().create_auction(request).await?;
    info!("Created auction {} via API", auction_id);
    Ok(Json(CreateAuctionResponse { auction_id }))
}

async fn place_bid(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<BidBody>,
) -> ApiResult<TxResponse> {
    let amount_b = parse_amount("amount_b", &body.amount_b)?;
    let tx_hash = state.coordinator.chains().auctions().bid(id, amount_b).await?;
    Ok(Json(TxResponse { tx_hash }))
}

async fn end_auction(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<EndAuctionResponse> {
    let ended = state.coordinator.chains().auctions().end_auction(id).await?;
    let winner = match ended {
        Some(AuctionEvent::Ended { taker, amount_b, .. }) => Some(Winner {
            taker,
            amount_b: amount_b.to_string(),
        }),
        _ => None,
    };
    Ok(Json(EndAuctionResponse {
        auction_id: id,
        winner,
    }))
}

async fn list_swaps(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.statuses())
}

/// Fresh reconcile of both legs plus the agent status, if tracked
async fn get_swap(State(state): State<AppState>, Path(auction_id): Path<u64>) -> ApiResult<SwapResponse> {
    let coordinator = &state.coordinator;
    let auction = coordinator
        .chains()
        .auctions()
        .auction(auction_id)
        .await?
        .ok_or(SwapError::AuctionNotFound { auction_id })?;
    let ctx = resolve(&auction)?;
    let snapshot = coordinator.reconciler().reconcile(&ctx).await?;

    Ok(Json(SwapResponse {
        auction_id,
        swap_id: snapshot.swap_id.to_hex(),
        maker: ctx.maker,
        taker: ctx.taker,
        role: resolve_role(coordinator.chains().account(), &auction),
        phase: snapshot.phase,
        hashed_secret: snapshot.hashed_secret,
        secret_revealed: snapshot.revealed_secret.is_some(),
        settled: snapshot.phase.both_terminal(),
        leg_a: LegSummary::of(&snapshot, ChainSide::A),
        leg_b: LegSummary::of(&snapshot, ChainSide::B),
        violation: snapshot.violation.as_ref().map(|v| v.to_string()),
        status: coordinator.status(auction_id),
    }))
}

/// Maker re-imports a secret after a restart; it must match the leg A hashlock
async fn import_secret(
    State(state): State<AppState>,
    Path(auction_id): Path<u64>,
    Json(body): Json<SecretBody>,
) -> ApiResult<SecretImportResponse> {
    let coordinator = &state.coordinator;
    let auction = coordinator
        .chains()
        .auctions()
        .auction(auction_id)
        .await?
        .ok_or(SwapError::AuctionNotFound { auction_id })?;
    let ctx = resolve_for(coordinator.chains().account(), &auction, Role::Maker)?;

    let secret = Secret::from_hex(&body.secret)?;
    let snapshot = coordinator.reconciler().reconcile(&ctx).await?;
    let Some(expected) = snapshot.leg_a.hashed_secret() else {
        return Err(ApiError {
            status: StatusCode::CONFLICT,
            message: format!("leg A for auction {} is not initiated", auction_id),
        });
    };

    let stored = match coordinator
        .secrets()
        .record_verified(swap_id_for(auction_id), secret, &expected)
    {
        Ok(stored) => stored,
        Err(e) => {
            warn!("Rejected secret import for auction {}", auction_id);
            return Err(e.into());
        }
    };
    if !SecretManager::verify(&stored, &expected) {
        return Err(ApiError {
            status: StatusCode::CONFLICT,
            message: format!("held secret for auction {} does not match leg A", auction_id),
        });
    }
    info!("Imported secret for auction {} (hashlock {})", auction_id, expected);
    Ok(Json(SecretImportResponse {
        auction_id,
        hashed_secret: expected,
    }))
}

fn parse_address(field: &str, raw: &str) -> Result<Address, ApiError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| ApiError::bad_request(format!("invalid {}: {}", field, e)))
}

fn parse_amount(field: &str, raw: &str) -> Result<U256, ApiError> {
    U256::from_dec_str(raw.trim()).map_err(|e| ApiError::bad_request(format!("invalid {}: {}", field, e)))
}

// Request types

#[derive(Deserialize)]
struct CreateAuctionBody {
    token_a: String,
    /// Decimal integer amounts
    amount_a: String,
    token_b: String,
    min_amount_b: String,
    duration_secs: u64,
}

#[derive(Deserialize)]
struct BidBody {
    amount_b: String,
}

#[derive(Deserialize)]
struct SecretBody {
    secret: String,
}

// Response types

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    account: Address,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    chains: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: ChainSide,
    healthy: bool,
}

#[derive(Serialize)]
struct AuctionsResponse {
    active: Vec<Auction>,
    ended: Vec<Auction>,
}

#[derive(Serialize)]
struct CreateAuctionResponse {
    auction_id: u64,
}

#[derive(Serialize)]
struct TxResponse {
    tx_hash: TxHash,
}

#[derive(Serialize)]
struct Winner {
    taker: Address,
    amount_b: String,
}

#[derive(Serialize)]
struct EndAuctionResponse {
    auction_id: u64,
    winner: Option<Winner>,
}

#[derive(Serialize)]
struct LegSummary {
    chain: ChainSide,
    phase: LegPhase,
    initiator: Option<Address>,
    amount: Option<String>,
    timelock: Option<u64>,
    terms_ok: bool,
    claimable: bool,
    refundable: bool,
    chain_time: u64,
}

impl LegSummary {
    fn of(snapshot: &SwapSnapshot, side: ChainSide) -> Self {
        let view = snapshot.leg(side);
        let now = snapshot.chain_time(side);
        Self {
            chain: view.chain,
            phase: view.phase,
            initiator: view.leg.as_ref().map(|l| l.initiator),
            amount: view.leg.as_ref().map(|l| l.amount.to_string()),
            timelock: view.timelock(),
            terms_ok: view.terms_ok,
            claimable: view.can_claim(now),
            refundable: view.is_refund_eligible(now),
            chain_time: now,
        }
    }
}

#[derive(Serialize)]
struct SwapResponse {
    auction_id: u64,
    swap_id: String,
    maker: Address,
    taker: Address,
    role: Role,
    phase: SwapPhase,
    hashed_secret: Option<HashedSecret>,
    secret_revealed: bool,
    /// Both legs claimed or refunded
    settled: bool,
    leg_a: LegSummary,
    leg_b: LegSummary,
    /// Hashlock or secret disagreement between the legs
    violation: Option<String>,
    status: Option<SwapStatus>,
}

#[derive(Serialize)]
struct SecretImportResponse {
    auction_id: u64,
    hashed_secret: HashedSecret,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::{maker, policy, taker, token_a, token_b, START};
    use crate::agent::MakerAgent;
    use crate::agent::{AgentCore, SwapAgent};
    use crate::chain::memory::{MemoryAuctionHouse, MemoryEscrow, TestClock};
    use crate::chain::{AuctionLedger, ChainManager};
    use crate::config::Settings;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct Harness {
        clock: TestClock,
        escrow_a: MemoryEscrow,
        escrow_b: MemoryEscrow,
        house: MemoryAuctionHouse,
    }

    impl Harness {
        fn new() -> Self {
            let clock = TestClock::new(START);
            let escrow_a = MemoryEscrow::new(ChainSide::A, clock.clone());
            let escrow_b = MemoryEscrow::new(ChainSide::B, clock.clone());
            escrow_a.mint(token_a(), maker(), U256::from(10));
            escrow_b.mint(token_b(), taker(), U256::from(10));
            Self {
                house: MemoryAuctionHouse::new(clock.clone()),
                clock,
                escrow_a,
                escrow_b,
            }
        }

        fn coordinator(&self, account: Address) -> Arc<SwapCoordinator> {
            let chains = ChainManager::from_parts(
                Arc::new(self.escrow_a.as_account(account)),
                Arc::new(self.escrow_b.as_account(account)),
                Arc::new(self.house.as_account(account)),
                account,
            );
            let config = Settings::from_toml_str(crate::config::tests::SAMPLE)
                .unwrap()
                .agent;
            Arc::new(SwapCoordinator::new(Arc::new(chains), config, policy()))
        }

        fn app(&self, account: Address) -> Router {
            router(AppState {
                coordinator: self.coordinator(account),
            })
        }
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Create, bid on and end an auction through the API
    async fn settled_auction(harness: &Harness) -> u64 {
        let (status, created) = call(
            harness.app(maker()),
            "POST",
            "/auctions",
            Some(json!({
                "token_a": format!("{:?}", token_a()),
                "amount_a": "1",
                "token_b": format!("{:?}", token_b()),
                "min_amount_b": "1",
                "duration_secs": 60
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let auction_id = created["auction_id"].as_u64().unwrap();

        let uri = format!("/auctions/{}/bid", auction_id);
        let (status, _) = call(harness.app(taker()), "POST", &uri, Some(json!({ "amount_b": "2" }))).await;
        assert_eq!(status, StatusCode::OK);

        harness.clock.advance(61);
        let uri = format!("/auctions/{}/end", auction_id);
        let (status, ended) = call(harness.app(maker()), "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ended["winner"]["amount_b"], "2");
        auction_id
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let harness = Harness::new();
        let (status, body) = call(harness.app(maker()), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(harness.app(maker()), "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn test_auction_lifecycle_and_listing() {
        let harness = Harness::new();
        let settled = settled_auction(&harness).await;

        let (status, body) = call(harness.app(maker()), "GET", "/auctions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["active"].as_array().unwrap().is_empty());
        assert_eq!(body["ended"][0]["id"], settled);

        let (status, _) = call(harness.app(maker()), "GET", "/auctions/99", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_amount_is_rejected() {
        let harness = Harness::new();
        let (status, body) = call(
            harness.app(maker()),
            "POST",
            "/auctions",
            Some(json!({
                "token_a": format!("{:?}", token_a()),
                "amount_a": "lots",
                "token_b": format!("{:?}", token_b()),
                "min_amount_b": "1",
                "duration_secs": 60
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("amount_a"));
    }

    #[tokio::test]
    async fn test_swap_view_before_and_after_leg_a() {
        let harness = Harness::new();
        let auction_id = settled_auction(&harness).await;
        let uri = format!("/swaps/{}", auction_id);

        let (status, body) = call(harness.app(taker()), "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "taker");
        assert_eq!(body["phase"]["leg_a"], "Absent");

        let coordinator = harness.coordinator(maker());
        let auction = harness.house.auction(auction_id).await.unwrap().unwrap();
        let maker_agent = MakerAgent::new(AgentCore::new(
            resolve(&auction).unwrap(),
            coordinator.reconciler().clone(),
            policy(),
        ));
        maker_agent.step().await.unwrap();
        maker_agent.step().await.unwrap();

        let (_, body) = call(harness.app(taker()), "GET", &uri, None).await;
        assert_eq!(body["phase"]["leg_a"], "Initiated");
        assert_eq!(body["leg_a"]["terms_ok"], true);
        assert_eq!(body["leg_a"]["claimable"], true);
        assert_eq!(body["settled"], false);
        assert_eq!(body["secret_revealed"], false);
        assert!(body.get("secret").is_none());
    }

    #[tokio::test]
    async fn test_secret_import_checks_hashlock() {
        let harness = Harness::new();
        let auction_id = settled_auction(&harness).await;
        let uri = format!("/swaps/{}/secret", auction_id);

        // Lock leg A with a secret held by a first process
        let first = harness.coordinator(maker());
        let auction = harness.house.auction(auction_id).await.unwrap().unwrap();
        let ctx = resolve(&auction).unwrap();
        let agent = MakerAgent::new(AgentCore::new(ctx.clone(), first.reconciler().clone(), policy()));
        agent.step().await.unwrap();
        agent.step().await.unwrap();
        let secret = first.secrets().get(&ctx.swap_id).unwrap();
        let secret_hex = format!("0x{}", hex::encode(secret.as_bytes()));

        let restarted = harness.coordinator(maker());
        let app = router(AppState {
            coordinator: restarted.clone(),
        });

        let wrong = format!("0x{}", "ab".repeat(32));
        let (status, _) = call(app.clone(), "POST", &uri, Some(json!({ "secret": wrong }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(restarted.secrets().is_empty());

        // The restarted process generated its own secret before seeing leg A
        restarted.secrets().generate_for(ctx.swap_id).unwrap();
        assert_ne!(restarted.secrets().get(&ctx.swap_id), Some(secret.clone()));

        let (status, body) = call(app.clone(), "POST", &uri, Some(json!({ "secret": secret_hex }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["hashed_secret"],
            harness.escrow_a.leg(ctx.swap_id).unwrap().hashed_secret.to_hex()
        );
        assert_eq!(restarted.secrets().get(&ctx.swap_id), Some(secret));

        // Only the maker imports secrets
        let (status, _) = call(harness.app(taker()), "POST", &uri, Some(json!({ "secret": secret_hex }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
