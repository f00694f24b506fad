//! JSON API over the engine.
//!
//! Every response body is an envelope: `{"success": true, "data": …}` or
//! `{"success": false, "error": "…"}`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequestParts, MatchedPath, Path, Query, Request, State,
    },
    http::{request::Parts, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use ulid::Ulid;

use crate::engine::{
    parse_date, Engine, EngineError, HoursInput, MoveRequest, NewBlock, NewCategory, NewEmployee,
    NewReservation, NewService, ReorderFamily, ReservationPatch,
};
use crate::model::*;
use crate::observability::{status_label, HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};

/// Header carrying the already-authenticated caller id.
pub const ACTOR_HEADER: &str = "x-actor";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

#[derive(Debug)]
pub struct ApiError {
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

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::Validation(_) | EngineError::InvalidTransition { .. } | EngineError::LimitExceeded(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) | EngineError::BucketNotEmpty(_) => StatusCode::CONFLICT,
            EngineError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if !e.is_client_error() {
            error!("storage failure: {e}");
            return Self {
                status,
                message: "internal storage error".into(),
            };
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_client_error() {
            warn!(status = self.status.as_u16(), "request rejected: {}", self.message);
        }
        (self.status, Json(ApiResponse::error(self.message))).into_response()
    }
}

/// The caller id comes from `x-actor`; a missing header is anonymous.
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(Actor::new(id))
    }
}

fn parse_id(field: &str, value: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(value.trim()).map_err(|_| ApiError::bad_request(format!("invalid {field}: {value:?}")))
}

/// Blank query values count as absent.
fn optional_id(field: &str, value: Option<&str>) -> Result<Option<Ulid>, ApiError> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| parse_id(field, v))
        .transpose()
}

fn required_date(value: Option<&str>) -> Result<chrono::NaiveDate, ApiError> {
    let value = value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("date is required"))?;
    Ok(parse_date(value)?)
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/availability", get(availability))
        .route("/api/reservations", get(list_reservations).post(create_reservation))
        .route(
            "/api/reservations/{id}",
            get(get_reservation).put(update_reservation).delete(delete_reservation),
        )
        .route("/api/reorder/{family}/{item_id}", put(reorder))
        .route("/api/catalog", get(catalog))
        .route("/api/categories", post(create_category))
        .route("/api/categories/{id}", delete(delete_category))
        .route("/api/services", post(create_service))
        .route("/api/services/{id}", delete(delete_service))
        .route("/api/employees", post(save_employee))
        .route("/api/business-hours/{day_of_week}", put(set_business_hours))
        .route("/api/blocks", post(create_block))
        .route("/api/blocks/{id}", delete(delete_block))
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(AppState { engine })
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let method = req.method().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    metrics::counter!(
        HTTP_REQUESTS_TOTAL,
        "route" => route.clone(),
        "method" => method,
        "status" => status_label(response.status().as_u16())
    )
    .increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "route" => route).record(start.elapsed().as_secs_f64());
    response
}

async fn health() -> &'static str {
    "ok"
}

// ── Availability & reservations ──────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailabilityQuery {
    date: Option<String>,
    employee_id: Option<String>,
    service_id: Option<String>,
}

/// GET /api/availability?date=YYYY-MM-DD&employeeId=…&serviceId=…
async fn availability(
    State(state): State<AppState>,
    query: Result<Query<AvailabilityQuery>, QueryRejection>,
) -> ApiResult<AvailabilityReport> {
    let Query(query) = query?;
    let date = required_date(query.date.as_deref())?;
    let employee_id = optional_id("employeeId", query.employee_id.as_deref())?;
    let service_id = optional_id("serviceId", query.service_id.as_deref())?;
    ok(state.engine.compute_availability(date, employee_id, service_id).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    date: Option<String>,
    employee_id: Option<String>,
}

/// GET /api/reservations?date=YYYY-MM-DD&employeeId=…
async fn list_reservations(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Vec<ReservationDetails>> {
    let Query(query) = query?;
    let date = required_date(query.date.as_deref())?;
    let employee_id = optional_id("employeeId", query.employee_id.as_deref())?;
    ok(state.engine.list_reservations(date, employee_id).await)
}

/// POST /api/reservations
async fn create_reservation(
    State(state): State<AppState>,
    actor: Actor,
    body: Result<Json<NewReservation>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<Reservation>>), ApiError> {
    let Json(body) = body?;
    let reservation = state.engine.create_reservation(&actor, body).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(reservation))))
}

/// GET /api/reservations/{id}
async fn get_reservation(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> ApiResult<ReservationDetails> {
    let Path(id) = path?;
    ok(state.engine.get_reservation(parse_id("id", &id)?).await?)
}

/// PUT /api/reservations/{id}
async fn update_reservation(
    State(state): State<AppState>,
    actor: Actor,
    path: Result<Path<String>, PathRejection>,
    body: Result<Json<ReservationPatch>, JsonRejection>,
) -> ApiResult<Reservation> {
    let Path(id) = path?;
    let id = parse_id("id", &id)?;
    let Json(patch) = body?;
    ok(state.engine.update_reservation(&actor, id, patch).await?)
}

/// DELETE /api/reservations/{id}
async fn delete_reservation(
    State(state): State<AppState>,
    actor: Actor,
    path: Result<Path<String>, PathRejection>,
) -> ApiResult<ReservationDetails> {
    let Path(id) = path?;
    ok(state.engine.delete_reservation(&actor, parse_id("id", &id)?).await?)
}

// ── Reordering ───────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MovedItem {
    Service(Service),
    Category(Category),
    Block(ContentBlock),
}

/// PUT /api/reorder/{family}/{itemId} with `{newIndex, newBucketId?}`
async fn reorder(
    State(state): State<AppState>,
    actor: Actor,
    path: Result<Path<(String, String)>, PathRejection>,
    body: Result<Json<MoveRequest>, JsonRejection>,
) -> ApiResult<MovedItem> {
    let Path((family, item_id)) = path?;
    let family: ReorderFamily = family.parse()?;
    let item_id = parse_id("itemId", &item_id)?;
    let Json(request) = body?;
    let moved = match family {
        ReorderFamily::Services => MovedItem::Service(state.engine.move_service(&actor, item_id, request).await?),
        ReorderFamily::Categories => MovedItem::Category(state.engine.move_category(&actor, item_id, request).await?),
        ReorderFamily::Blocks => MovedItem::Block(state.engine.move_block(&actor, item_id, request).await?),
    };
    ok(moved)
}

// ── Catalog ──────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Deleted {
    id: Ulid,
}

async fn catalog(State(state): State<AppState>) -> ApiResult<CatalogView> {
    ok(state.engine.catalog_view().await)
}

async fn create_category(
    State(state): State<AppState>,
    actor: Actor,
    body: Result<Json<NewCategory>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<Category>>), ApiError> {
    let Json(body) = body?;
    let category = state.engine.create_category(&actor, body).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(category))))
}

async fn delete_category(
    State(state): State<AppState>,
    actor: Actor,
    path: Result<Path<String>, PathRejection>,
) -> ApiResult<Deleted> {
    let Path(id) = path?;
    let id = parse_id("id", &id)?;
    state.engine.delete_category(&actor, id).await?;
    ok(Deleted { id })
}

async fn create_service(
    State(state): State<AppState>,
    actor: Actor,
    body: Result<Json<NewService>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<Service>>), ApiError> {
    let Json(body) = body?;
    let service = state.engine.create_service(&actor, body).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(service))))
}

async fn delete_service(
    State(state): State<AppState>,
    actor: Actor,
    path: Result<Path<String>, PathRejection>,
) -> ApiResult<Deleted> {
    let Path(id) = path?;
    let id = parse_id("id", &id)?;
    state.engine.delete_service(&actor, id).await?;
    ok(Deleted { id })
}

async fn save_employee(
    State(state): State<AppState>,
    actor: Actor,
    body: Result<Json<NewEmployee>, JsonRejection>,
) -> ApiResult<Employee> {
    let Json(body) = body?;
    ok(state.engine.save_employee(&actor, body).await?)
}

/// PUT /api/business-hours/{dayOfWeek}, 0 = Sunday.
async fn set_business_hours(
    State(state): State<AppState>,
    actor: Actor,
    path: Result<Path<String>, PathRejection>,
    body: Result<Json<HoursInput>, JsonRejection>,
) -> ApiResult<BusinessHours> {
    let Path(day) = path?;
    let day: u8 = day
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid dayOfWeek: {day:?}")))?;
    let Json(body) = body?;
    ok(state.engine.set_business_hours(&actor, day, body).await?)
}

async fn create_block(
    State(state): State<AppState>,
    actor: Actor,
    body: Result<Json<NewBlock>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<ContentBlock>>), ApiError> {
    let Json(body) = body?;
    let block = state.engine.create_block(&actor, body).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(block))))
}

async fn delete_block(
    State(state): State<AppState>,
    actor: Actor,
    path: Result<Path<String>, PathRejection>,
) -> ApiResult<Deleted> {
    let Path(id) = path?;
    let id = parse_id("id", &id)?;
    state.engine.delete_block(&actor, id).await?;
    ok(Deleted { id })
}
