//! HTTP surface: operator endpoints behind a bearer token, and the
//! subscription endpoints
//!
//! | Endpoint | Method | Auth |
//! |----------|--------|------|
//! | `/managed-settlement/health` | GET | admin |
//! | `/managed-liquidation/tasks` | GET, POST | admin |
//! | `/reserve-fund/summary` | GET | admin |
//! | `/managed-subscriptions` | GET, POST | - |

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use wealth_keeper::health::HealthQuery;
use wealth_keeper::lifecycle::NewSubscription;
use wealth_keeper::liquidation::{parse_status_filter, OperatorAction, TaskFilter};
use wealth_keeper::types::SubscriptionStatus;
use wealth_keeper::{ControlPlane, KeeperError};

pub struct AppState {
    pub plane: Arc<ControlPlane>,
    pub admin_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Keeper(#[from] KeeperError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, json!({ "error": "Unauthorized" })),
            ApiError::Keeper(err) => keeper_error_body(err),
        };
        (status, Json(body)).into_response()
    }
}

fn keeper_error_body(err: KeeperError) -> (StatusCode, Value) {
    let message = err.to_string();
    match err {
        KeeperError::Validation(_) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
        KeeperError::NotFound(_) => (StatusCode::NOT_FOUND, json!({ "error": message })),
        KeeperError::ReserveCoverage { coverage, required_ratio } => (
            StatusCode::CONFLICT,
            json!({
                "error": "Reserve coverage too low for guaranteed subscription",
                "reserveCoverage": coverage,
                "requiredCoverageRatio": required_ratio,
            }),
        ),
        KeeperError::Conflict(_) => (StatusCode::CONFLICT, json!({ "error": message })),
        KeeperError::Storage(_) => {
            warn!("[Server] storage failure: {}", message);
            (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": message }))
        }
    }
}

type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::Unauthorized);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

fn ok(value: impl serde::Serialize) -> ApiResult {
    Ok((StatusCode::OK, Json(json!(value))))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/managed-settlement/health", get(health))
        .route("/managed-liquidation/tasks", get(list_tasks).post(task_action))
        .route("/reserve-fund/summary", get(reserve_summary))
        .route("/managed-subscriptions", get(list_subscriptions).post(create_subscription))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("[Server] listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ── Admin ───────────────────────────────────────────────────────────────────

async fn health(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<HealthQuery>, QueryRejection>,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let Query(query) = query.map_err(|e| KeeperError::validation(e.body_text()))?;
    let params = query.resolve()?;
    let snapshot = state.plane.health.snapshot(params, Utc::now()).await;
    ok(snapshot)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskQuery {
    statuses: Option<String>,
    subscription_id: Option<String>,
    wallet_address: Option<String>,
    due_only: Option<bool>,
    limit: Option<usize>,
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<TaskQuery>, QueryRejection>,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let Query(query) = query.map_err(|e| KeeperError::validation(e.body_text()))?;
    let statuses = match query.statuses.as_deref() {
        Some(raw) => parse_status_filter(raw)?,
        None => None,
    };
    let subscription_id = match query.subscription_id.as_deref() {
        Some(raw) => Some(
            Uuid::parse_str(raw.trim())
                .map_err(|_| KeeperError::validation(format!("invalid subscriptionId: {}", raw)))?,
        ),
        None => None,
    };
    let filter = TaskFilter {
        statuses,
        subscription_id,
        wallet_address: query.wallet_address,
        due_only: query.due_only.unwrap_or(false),
        limit: query.limit,
    };
    ok(state.plane.queue.list(&filter, Utc::now()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskActionBody {
    #[serde(flatten)]
    action: OperatorAction,
    #[serde(default)]
    task_ids: Vec<Uuid>,
}

async fn task_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<TaskActionBody>, JsonRejection>,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let Json(body) = body.map_err(|e| KeeperError::validation(e.body_text()))?;
    let result = state
        .plane
        .health
        .apply_action(&body.action, &body.task_ids, Utc::now())?;
    ok(result)
}

async fn reserve_summary(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    require_admin(&state, &headers)?;
    ok(state.plane.ledger.summary())
}

// ── Subscriptions ───────────────────────────────────────────────────────────

async fn create_subscription(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewSubscription>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body.map_err(|e| KeeperError::validation(e.body_text()))?;
    let created = state.plane.lifecycle.create(req, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(json!(created))))
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionQuery {
    wallet: Option<String>,
    status: Option<String>,
}

async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubscriptionQuery>,
) -> ApiResult {
    let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(raw.parse::<SubscriptionStatus>().map_err(|_| {
            let allowed: Vec<&str> = SubscriptionStatus::ALL.iter().map(|s| s.as_str()).collect();
            KeeperError::validation(format!(
                "Invalid status: {}. Allowed: {}",
                raw,
                allowed.join(", ")
            ))
        })?),
        None => None,
    };
    let subscriptions = state.plane.lifecycle.list(query.wallet.as_deref(), status);
    ok(json!({ "subscriptions": subscriptions }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wealth_keeper::config::{ProductConfig, TermConfig};
    use wealth_keeper::types::ReserveEntryType;
    use wealth_keeper::KeeperConfig;

    fn test_config() -> KeeperConfig {
        let mut config = KeeperConfig::default();
        config.server.admin_token = Some("s3cret".into());
        config.products.push(ProductConfig {
            id: "shield".into(),
            slug: "shield".into(),
            name: "Shield".into(),
            is_guaranteed: true,
            is_active: true,
            reserve_coverage_min: 1.0,
            performance_fee_rate: 0.2,
            terms: vec![TermConfig {
                id: "30d".into(),
                label: "30 days".into(),
                duration_days: 30,
                min_yield_rate: Some(0.05),
                performance_fee_rate: None,
                max_subscription_amount: None,
                is_active: true,
            }],
        });
        config
    }

    async fn spawn_server() -> (String, Arc<ControlPlane>) {
        let config = test_config();
        let token = config.server.admin_token.clone();
        let plane = Arc::new(crate::config::build_plane(config, None).unwrap());
        let state = Arc::new(AppState {
            plane: plane.clone(),
            admin_token: token,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (format!("http://{}", addr), plane)
    }

    fn subscription_body(principal: f64) -> Value {
        json!({
            "walletAddress": "0xabc",
            "productId": "shield",
            "termId": "30d",
            "principal": principal,
            "acceptedTerms": true,
        })
    }

    #[tokio::test]
    async fn test_admin_endpoints_require_token() {
        let (base, _) = spawn_server().await;
        let client = reqwest::Client::new();

        let res = client.get(format!("{}/reserve-fund/summary", base)).send().await.unwrap();
        assert_eq!(res.status(), 401);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["error"], "Unauthorized");

        let res = client
            .get(format!("{}/managed-settlement/health?windowDays=500", base))
            .bearer_auth("wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 401);

        let res = client
            .get(format!("{}/managed-settlement/health?windowDays=500", base))
            .bearer_auth("s3cret")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 400);

        let res = client
            .get(format!("{}/managed-settlement/health", base))
            .bearer_auth("s3cret")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["params"]["windowDays"], 7);
        assert_eq!(body["liquidation"]["openCount"], 0);
    }

    #[tokio::test]
    async fn test_create_subscription_respects_coverage() {
        let (base, plane) = spawn_server().await;
        let client = reqwest::Client::new();
        let url = format!("{}/managed-subscriptions", base);

        let res = client.post(&url).json(&subscription_body(1_000.0)).send().await.unwrap();
        assert_eq!(res.status(), 409);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["requiredCoverageRatio"], 1.0);
        assert_eq!(body["reserveCoverage"]["projectedLiability"], 50.0);

        plane
            .ledger
            .append(ReserveEntryType::Deposit, 1_000.0, None, Utc::now())
            .unwrap();
        let res = client.post(&url).json(&subscription_body(1_000.0)).send().await.unwrap();
        assert_eq!(res.status(), 201);

        let res = client.get(format!("{}?wallet=0xabc", url)).send().await.unwrap();
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["subscriptions"].as_array().unwrap().len(), 1);

        let res = client.get(format!("{}?status=BOGUS", url)).send().await.unwrap();
        assert_eq!(res.status(), 400);
        let body: Value = res.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().starts_with("Invalid status: BOGUS"));
    }

    #[tokio::test]
    async fn test_task_action_validates_body() {
        let (base, _) = spawn_server().await;
        let client = reqwest::Client::new();
        let url = format!("{}/managed-liquidation/tasks", base);

        let res = client
            .post(&url)
            .bearer_auth("s3cret")
            .json(&json!({ "action": "explode", "taskIds": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 400);

        let res = client.get(&url).bearer_auth("s3cret").send().await.unwrap();
        assert_eq!(res.status(), 200);
    }
}
