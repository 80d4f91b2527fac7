//! Gateway handlers: thin adapters over StakeService

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use uuid::Uuid;

use super::state::AppState;
use super::types::{
    ApiError, ApiJson, ApiResult, CreateStakeRequest, CreateUserRequest, PoolResponse,
    RefundRequest, RefundResponse, SettlePoolRequest, SettleResponse, StakeCreatedResponse,
    StakeView, TransferView, UserResponse, ok,
};

/// Open a stake
///
/// POST /api/payments/stake
#[utoipa::path(
    post,
    path = "/api/payments/stake",
    request_body = CreateStakeRequest,
    responses(
        (status = 201, description = "Stake opened", body = StakeCreatedResponse),
        (status = 400, description = "Invalid amount or card mismatch"),
        (status = 404, description = "User not found"),
        (status = 409, description = "User already has an active stake")
    ),
    tag = "Payments"
)]
pub async fn create_stake(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CreateStakeRequest>,
) -> Result<(StatusCode, Json<StakeCreatedResponse>), ApiError> {
    if let Some(ref last4) = req.card_last4 {
        let user = state.service.get_user(req.user_id).await?;
        if user.card_last4 != *last4 {
            return Err(ApiError::bad_request("cardLast4 does not match card on file"));
        }
    }
    let stake = state
        .service
        .create_stake(req.user_id, req.amount.inner())
        .await?;
    Ok((StatusCode::CREATED, Json(stake.into())))
}

/// Refund part of a stake to the user's card
///
/// POST /api/payments/refund
#[utoipa::path(
    post,
    path = "/api/payments/refund",
    request_body = RefundRequest,
    responses(
        (status = 200, description = "Refund pushed", body = RefundResponse),
        (status = 400, description = "Invalid amount"),
        (status = 404, description = "Stake or user not found"),
        (status = 409, description = "Stake closed or balance insufficient"),
        (status = 502, description = "Payment network declined the push"),
        (status = 504, description = "Push outcome unknown; reconcile before retrying")
    ),
    tag = "Payments"
)]
pub async fn refund(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<RefundRequest>,
) -> ApiResult<RefundResponse> {
    let outcome = state
        .service
        .process_refund(
            req.user_id,
            req.stake_id,
            req.amount.inner(),
            req.idempotency_key,
        )
        .await?;
    ok(outcome.into())
}

/// Sweep a stake's unreturned balance into the pool and close it
///
/// POST /api/payments/settle-pool
#[utoipa::path(
    post,
    path = "/api/payments/settle-pool",
    request_body = SettlePoolRequest,
    responses(
        (status = 200, description = "Stake settled", body = SettleResponse),
        (status = 400, description = "Malformed request body"),
        (status = 404, description = "Stake not found"),
        (status = 409, description = "Stake already closed or fully refunded"),
        (status = 502, description = "Payment network declined the push"),
        (status = 504, description = "Push outcome unknown; reconcile before retrying")
    ),
    tag = "Payments"
)]
pub async fn settle_pool(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<SettlePoolRequest>,
) -> ApiResult<SettleResponse> {
    let outcome = state
        .service
        .settle_to_pool(req.stake_id, req.idempotency_key)
        .await?;
    ok(outcome.into())
}

/// List a user's stakes with their transfers, newest first
///
/// GET /api/payments/stakes/{user_id}
#[utoipa::path(
    get,
    path = "/api/payments/stakes/{user_id}",
    params(("user_id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Stakes with nested transfers", body = [StakeView]),
        (status = 404, description = "User not found")
    ),
    tag = "Payments"
)]
pub async fn list_stakes(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Vec<StakeView>> {
    let stakes = state.service.stakes_for_user(user_id).await?;
    ok(stakes.into_iter().map(StakeView::from).collect())
}

/// List a user's transfers, newest first
///
/// GET /api/payments/transfers/{user_id}
#[utoipa::path(
    get,
    path = "/api/payments/transfers/{user_id}",
    params(("user_id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Transfer history", body = [TransferView]),
        (status = 404, description = "User not found")
    ),
    tag = "Payments"
)]
pub async fn list_transfers(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Vec<TransferView>> {
    let transfers = state.service.transfers_for_user(user_id).await?;
    ok(transfers.into_iter().map(TransferView::from).collect())
}

/// Pool aggregate
///
/// GET /api/payments/pool
#[utoipa::path(
    get,
    path = "/api/payments/pool",
    responses(
        (status = 200, description = "Pool total; zero before the first settlement", body = PoolResponse)
    ),
    tag = "Payments"
)]
pub async fn get_pool(State(state): State<Arc<AppState>>) -> ApiResult<PoolResponse> {
    let pool = state.service.pool_summary().await?;
    ok(pool.into())
}

/// Register a user with a funding card
///
/// POST /api/users
#[utoipa::path(
    post,
    path = "/api/users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User registered", body = UserResponse),
        (status = 400, description = "Invalid name or card number")
    ),
    tag = "Users"
)]
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let user = state.service.create_user(&req.name, &req.card_pan).await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

/// List users
///
/// GET /api/users
#[utoipa::path(
    get,
    path = "/api/users",
    responses((status = 200, description = "All users", body = [UserResponse])),
    tag = "Users"
)]
pub async fn list_users(State(state): State<Arc<AppState>>) -> ApiResult<Vec<UserResponse>> {
    let users = state.service.list_users().await?;
    ok(users.into_iter().map(UserResponse::from).collect())
}

/// Get one user
///
/// GET /api/users/{id}
#[utoipa::path(
    get,
    path = "/api/users/{id}",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "User details", body = UserResponse),
        (status = 404, description = "User not found")
    ),
    tag = "Users"
)]
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<UserResponse> {
    let user = state.service.get_user(id).await?;
    ok(user.into())
}

/// Liveness probe
///
/// GET /api/health
#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, description = "Service is up")),
    tag = "Health"
)]
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
