//! OpenAPI / Swagger UI Documentation
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`

use utoipa::OpenApi;

use crate::gateway::types::{
    ApiErrorBody, CreateStakeRequest, CreateUserRequest, PoolResponse, RefundRequest,
    RefundResponse, SettlePoolRequest, SettleResponse, StakeCreatedResponse, StakeView,
    TransferView, UserResponse,
};

/// Main API Documentation struct
#[derive(OpenApi)]
#[openapi(
    info(
        title = "FlowStake Settlement API",
        version = "1.0.0",
        description = "Stake escrow ledger: hold user funds, push partial refunds over Visa Direct, sweep unreturned balances into the shared pool.",
        license(
            name = "MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::gateway::handlers::health,
        crate::gateway::handlers::create_stake,
        crate::gateway::handlers::refund,
        crate::gateway::handlers::settle_pool,
        crate::gateway::handlers::list_stakes,
        crate::gateway::handlers::list_transfers,
        crate::gateway::handlers::get_pool,
        crate::gateway::handlers::create_user,
        crate::gateway::handlers::list_users,
        crate::gateway::handlers::get_user,
    ),
    components(
        schemas(
            ApiErrorBody,
            CreateUserRequest,
            CreateStakeRequest,
            RefundRequest,
            SettlePoolRequest,
            UserResponse,
            StakeCreatedResponse,
            RefundResponse,
            SettleResponse,
            PoolResponse,
            StakeView,
            TransferView,
        )
    ),
    tags(
        (name = "Payments", description = "Stake lifecycle, refunds and pool settlement"),
        (name = "Users", description = "User registration and lookup"),
        (name = "Health", description = "Liveness"),
    )
)]
pub struct ApiDoc;
