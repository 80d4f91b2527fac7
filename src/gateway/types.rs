//! Gateway request/response types and error mapping.
//!
//! - `StrictAmount`: format-validated Decimal at the Serde layer
//! - Request/response DTOs (camelCase on the wire)
//! - `ApiError`: maps `StakeError` kinds onto HTTP statuses while keeping
//!   the kind string in the payload

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::ledger::types::{StakeWithTransfers, Transfer, User};
use crate::ledger::{
    PoolSummary, RefundOutcome, SettlementOutcome, Stake, StakeError, StakeStatus,
    TransferDirection,
};

// ============================================================================
// StrictAmount: Format-Validated Decimal at Serde Layer
// ============================================================================

/// Strict format Decimal - validates format during deserialization
///
/// - Rejects `.5` (must be `0.5`)
/// - Rejects `5.` (must be `5.0` or `5`)
/// - Rejects negative numbers
/// - Rejects empty strings
///
/// Business validation (positivity, balance) happens later in StakeService.
#[derive(Debug, Clone, Copy)]
pub struct StrictAmount(Decimal);

impl StrictAmount {
    /// Get the inner Decimal value
    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl std::ops::Deref for StrictAmount {
    type Target = Decimal;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for StrictAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        // Support both JSON number and JSON string
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum DecimalOrString {
            String(String),
            Number(Decimal),
        }

        let value = DecimalOrString::deserialize(deserializer)?;

        match value {
            DecimalOrString::String(s) => {
                if s.is_empty() {
                    return Err(D::Error::custom("Amount cannot be empty"));
                }
                if s.starts_with('.') {
                    return Err(D::Error::custom("Invalid format: use 0.5 not .5"));
                }
                if s.ends_with('.') {
                    return Err(D::Error::custom("Invalid format: use 5.0 not 5."));
                }

                let d = s
                    .parse::<Decimal>()
                    .map_err(|e| D::Error::custom(format!("Invalid decimal: {}", e)))?;

                if d.is_sign_negative() {
                    return Err(D::Error::custom("Amount cannot be negative"));
                }

                Ok(StrictAmount(d))
            }
            DecimalOrString::Number(d) => {
                if d.is_sign_negative() {
                    return Err(D::Error::custom("Amount cannot be negative"));
                }
                Ok(StrictAmount(d))
            }
        }
    }
}

impl Serialize for StrictAmount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Serialize as string to preserve precision
        serializer.serialize_str(&self.0.to_string())
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub name: String,
    /// Full card number; only the masked form is stored.
    pub card_pan: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateStakeRequest {
    pub user_id: Uuid,
    #[schema(value_type = String)]
    pub amount: StrictAmount,
    /// Optional cross-check against the card on file.
    #[serde(default)]
    pub card_last4: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub user_id: Uuid,
    pub stake_id: Uuid,
    #[schema(value_type = String)]
    pub amount: StrictAmount,
    /// Caller-supplied idempotency key; generated when absent.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SettlePoolRequest {
    pub stake_id: Uuid,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: Uuid,
    pub name: String,
    pub pan_masked: String,
    pub card_last4: String,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            pan_masked: user.pan_masked,
            card_last4: user.card_last4,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StakeCreatedResponse {
    pub stake_id: Uuid,
    pub status: StakeStatus,
    #[schema(value_type = String)]
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl From<Stake> for StakeCreatedResponse {
    fn from(stake: Stake) -> Self {
        Self {
            stake_id: stake.id,
            status: stake.status,
            amount: stake.amount_total,
            created_at: stake.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefundResponse {
    pub transfer_id: Uuid,
    pub visa_transfer_id: String,
    #[schema(value_type = String)]
    pub amount: Decimal,
    pub status: String,
    #[schema(value_type = String)]
    pub remaining_balance: Decimal,
}

impl From<RefundOutcome> for RefundResponse {
    fn from(outcome: RefundOutcome) -> Self {
        Self {
            transfer_id: outcome.transfer_id,
            visa_transfer_id: outcome.visa_transfer_id,
            amount: outcome.amount,
            status: outcome.visa_status,
            remaining_balance: outcome.remaining_balance,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub pool_transfer_id: Uuid,
    pub visa_transfer_id: String,
    #[schema(value_type = String)]
    pub amount: Decimal,
    pub status: StakeStatus,
}

impl From<SettlementOutcome> for SettleResponse {
    fn from(outcome: SettlementOutcome) -> Self {
        Self {
            pool_transfer_id: outcome.transfer_id,
            visa_transfer_id: outcome.visa_transfer_id,
            amount: outcome.amount,
            status: outcome.stake_status,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolResponse {
    #[schema(value_type = String)]
    pub amount_total: Decimal,
    pub last_settlement_at: Option<DateTime<Utc>>,
}

impl From<PoolSummary> for PoolResponse {
    fn from(pool: PoolSummary) -> Self {
        Self {
            amount_total: pool.amount_total,
            last_settlement_at: pool.last_settlement_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferView {
    pub id: Uuid,
    pub stake_id: Option<Uuid>,
    pub direction: TransferDirection,
    #[schema(value_type = String)]
    pub amount: Decimal,
    pub visa_status: String,
    pub visa_transfer_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<Transfer> for TransferView {
    fn from(t: Transfer) -> Self {
        Self {
            id: t.id,
            stake_id: t.stake_id,
            direction: t.direction,
            amount: t.amount,
            visa_status: t.visa_status,
            visa_transfer_id: t.visa_transfer_id,
            created_at: t.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StakeView {
    pub id: Uuid,
    pub user_id: Uuid,
    #[schema(value_type = String)]
    pub amount_total: Decimal,
    #[schema(value_type = String)]
    pub amount_refunded: Decimal,
    #[schema(value_type = String)]
    pub remaining_balance: Decimal,
    pub status: StakeStatus,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub transfers: Vec<TransferView>,
}

impl From<StakeWithTransfers> for StakeView {
    fn from(s: StakeWithTransfers) -> Self {
        let StakeWithTransfers { stake, transfers } = s;
        Self {
            id: stake.id,
            user_id: stake.user_id,
            amount_total: stake.amount_total,
            amount_refunded: stake.amount_refunded,
            remaining_balance: stake.remaining(),
            status: stake.status,
            created_at: stake.created_at,
            closed_at: stake.closed_at,
            transfers: transfers.into_iter().map(TransferView::from).collect(),
        }
    }
}

// ============================================================================
// Error mapping
// ============================================================================

/// Error payload: kind string plus human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    /// Stable error kind, e.g. "INSUFFICIENT_BALANCE"
    pub code: String,
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_REQUEST",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }

    pub fn into_err<T>(self) -> ApiResult<T> {
        Err(self)
    }
}

impl From<StakeError> for ApiError {
    fn from(err: StakeError) -> Self {
        let status = match &err {
            StakeError::InvalidAmount | StakeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            StakeError::UserNotFound | StakeError::StakeNotFound => StatusCode::NOT_FOUND,
            StakeError::DuplicateActiveStake
            | StakeError::StakeNotActive
            | StakeError::StakeAlreadyClosed
            | StakeError::InsufficientBalance
            | StakeError::NothingToSettle
            | StakeError::ConcurrentModification => StatusCode::CONFLICT,
            StakeError::FundTransferFailed(_) => StatusCode::BAD_GATEWAY,
            StakeError::AmbiguousTransferOutcome(_) => StatusCode::GATEWAY_TIMEOUT,
            StakeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, "gateway error: {}", self.message);
        }
        let body = ApiErrorBody {
            code: self.code.to_string(),
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Json body extractor that reports malformed or incomplete bodies as 400
/// with the standard error payload instead of axum's default 422.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::bad_request(rejection.body_text())),
        }
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Wrap a payload in the success shape handlers return.
pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_amount_valid_string() {
        let d: StrictAmount = serde_json::from_str(r#""1.5""#).unwrap();
        assert_eq!(*d, "1.5".parse::<Decimal>().unwrap());
    }

    #[test]
    fn test_strict_amount_valid_number() {
        let d: StrictAmount = serde_json::from_str("1.5").unwrap();
        assert_eq!(*d, "1.5".parse::<Decimal>().unwrap());
    }

    #[test]
    fn test_strict_amount_rejects_dot_prefix() {
        let result: Result<StrictAmount, _> = serde_json::from_str(r#"".5""#);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("use 0.5 not .5"));
    }

    #[test]
    fn test_strict_amount_rejects_dot_suffix() {
        let result: Result<StrictAmount, _> = serde_json::from_str(r#""5.""#);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("use 5.0 not 5."));
    }

    #[test]
    fn test_strict_amount_rejects_negative() {
        let result: Result<StrictAmount, _> = serde_json::from_str(r#""-1.5""#);
        assert!(result.is_err());
        let result: Result<StrictAmount, _> = serde_json::from_str("-1.5");
        assert!(result.is_err());
    }

    #[test]
    fn test_strict_amount_rejects_empty() {
        let result: Result<StrictAmount, _> = serde_json::from_str(r#""""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_refund_request_camel_case() {
        let json = r#"{
            "userId": "5f8b1c9a-0000-4000-8000-000000000001",
            "stakeId": "5f8b1c9a-0000-4000-8000-000000000002",
            "amount": "25.00",
            "idempotencyKey": "k-1"
        }"#;
        let req: RefundRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.idempotency_key.as_deref(), Some("k-1"));
        assert_eq!(req.amount.inner(), "25.00".parse::<Decimal>().unwrap());
    }

    #[tokio::test]
    async fn test_body_with_missing_field_maps_to_bad_request() {
        use axum::body::Body;
        use axum::http::Request as HttpRequest;

        // No `amount` field.
        let req = HttpRequest::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{
                    "userId": "5f8b1c9a-0000-4000-8000-000000000001",
                    "stakeId": "5f8b1c9a-0000-4000-8000-000000000002"
                }"#,
            ))
            .unwrap();
        let err = ApiJson::<RefundRequest>::from_request(req, &())
            .await
            .err()
            .expect("incomplete body must be rejected");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "INVALID_REQUEST");

        let req = HttpRequest::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let err = ApiJson::<RefundRequest>::from_request(req, &())
            .await
            .err()
            .expect("malformed body must be rejected");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_complete_body_still_parses() {
        use axum::body::Body;
        use axum::http::Request as HttpRequest;

        let req = HttpRequest::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{
                    "userId": "5f8b1c9a-0000-4000-8000-000000000001",
                    "stakeId": "5f8b1c9a-0000-4000-8000-000000000002",
                    "amount": "25.00"
                }"#,
            ))
            .unwrap();
        let ApiJson(parsed) = ApiJson::<RefundRequest>::from_request(req, &())
            .await
            .unwrap();
        assert_eq!(parsed.amount.inner(), "25.00".parse::<Decimal>().unwrap());
        assert!(parsed.idempotency_key.is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        let e = ApiError::from(StakeError::InsufficientBalance);
        assert_eq!(e.status, StatusCode::CONFLICT);
        assert_eq!(e.code, "INSUFFICIENT_BALANCE");

        let e = ApiError::from(StakeError::AmbiguousTransferOutcome("timeout".into()));
        assert_eq!(e.status, StatusCode::GATEWAY_TIMEOUT);

        let e = ApiError::from(StakeError::FundTransferFailed("declined".into()));
        assert_eq!(e.status, StatusCode::BAD_GATEWAY);

        let e = ApiError::from(StakeError::UserNotFound);
        assert_eq!(e.status, StatusCode::NOT_FOUND);
    }
}
