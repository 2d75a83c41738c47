//! HTTP surface: staff routes, dispatch assignments, unavailability and the
//! password-reset mail hook.
//!
//! Every dispatch and staff-route response uses the same envelope:
//! `{success, message, data, error}`.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{FromRequestParts, MatchedPath, Path, Request, State, rejection::JsonRejection},
    http::{StatusCode, header, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{self, AuthError, Claims, TokenVerifier};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::{NotificationQueue, NotificationTask};
use crate::observability;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub notifications: Arc<NotificationQueue>,
    pub verifier: Arc<dyn TokenVerifier>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        }
    }
}

type ApiResult<T> = Result<(StatusCode, Json<Envelope<T>>), ApiError>;

fn ok<T>(message: impl Into<String>, data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(Envelope::ok(message, data))))
}

fn created<T>(message: impl Into<String>, data: T) -> ApiResult<T> {
    Ok((StatusCode::CREATED, Json(Envelope::ok(message, data))))
}

/// A failed request, rendered as an envelope with `success: false`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    error: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error: error.into(),
        }
    }

    fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid request", error)
    }

    fn not_found(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(StatusCode::NOT_FOUND, message.clone(), message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope::<()> {
            success: false,
            message: self.message,
            data: None,
            error: Some(self.error),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Validation(_)
            | EngineError::InvalidInterval(_)
            | EngineError::Conflict(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Store(_) => {
                error!(error = %err, "store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &err {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => "invalid request",
            EngineError::InvalidInterval(_) => "invalid interval",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidTransition { .. } => "invalid status transition",
            EngineError::NotFound(_) => "not found",
            EngineError::Store(_) => "internal error, safe to retry",
        };
        Self::new(status, message, err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        metrics::counter!(observability::AUTH_FAILURES_TOTAL, "reason" => err.label()).increment(1);
        if err.is_forbidden() {
            Self::new(StatusCode::FORBIDDEN, "forbidden", err.to_string())
        } else {
            Self::new(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

fn parse_id(raw: &str, field: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("{field} is not a valid UUID")))
}

// ── Auth extractors ─────────────────────────────────────────────

async fn authorize_parts(parts: &Parts, state: &AppState, allowed: &[&str]) -> Result<Claims, ApiError> {
    let header = parts
        .headers
        .get(header::AUTHORIZATION)
        .map(|v| v.to_str().map_err(|_| AuthError::MalformedHeader))
        .transpose()?;
    let claims = auth::authorize(state.verifier.as_ref(), header, allowed)
        .await
        .inspect_err(|e| debug!(error = %e, "request rejected"))?;
    Ok(claims)
}

/// Caller allowed to read.
pub struct Reader(pub Claims);

impl FromRequestParts<AppState> for Reader {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authorize_parts(parts, state, auth::READ_ROLES).await.map(Self)
    }
}

/// Caller allowed to write.
pub struct Admin(pub Claims);

impl FromRequestParts<AppState> for Admin {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authorize_parts(parts, state, auth::WRITE_ROLES).await.map(Self)
    }
}

// ── Staff routes ────────────────────────────────────────────────

fn non_empty(routes: Vec<StaffRoute>, what: String) -> ApiResult<Vec<StaffRoute>> {
    if routes.is_empty() {
        return Err(ApiError::not_found(format!("no staff routes found for {what}")));
    }
    let n = routes.len();
    ok(format!("{n} staff route(s) found"), routes)
}

async fn create_staff_route(
    State(state): State<AppState>,
    Admin(caller): Admin,
    body: Result<Json<StaffRouteCreate>, JsonRejection>,
) -> ApiResult<StaffRoute> {
    let Json(req) = body?;
    let route = state.engine.registry.create(req).await?;
    info!(by = %caller.subject, staff_id = %route.staff_id, route_id = %route.route_id, "staff route created via api");
    created("staff route created", route)
}

async fn list_staff_routes(State(state): State<AppState>, _: Reader) -> ApiResult<Vec<StaffRoute>> {
    non_empty(state.engine.registry.get_all(), "any staff".into())
}

async fn staff_routes_by_staff(
    State(state): State<AppState>,
    _: Reader,
    Path(staff_id): Path<String>,
) -> ApiResult<Vec<StaffRoute>> {
    let staff_id = parse_id(&staff_id, "staff_id")?;
    non_empty(state.engine.registry.get_by_staff(staff_id), format!("staff {staff_id}"))
}

async fn staff_routes_by_route(
    State(state): State<AppState>,
    _: Reader,
    Path(route_id): Path<String>,
) -> ApiResult<Vec<StaffRoute>> {
    let route_id = parse_id(&route_id, "route_id")?;
    non_empty(state.engine.registry.get_by_route(route_id), format!("route {route_id}"))
}

async fn update_staff_route(
    State(state): State<AppState>,
    Admin(caller): Admin,
    Path((staff_id, route_id)): Path<(String, String)>,
    body: Result<Json<StaffRouteUpdate>, JsonRejection>,
) -> ApiResult<StaffRoute> {
    let (staff_id, route_id) = (parse_id(&staff_id, "staff_id")?, parse_id(&route_id, "route_id")?);
    let Json(fields) = body?;
    let route = state.engine.registry.update(staff_id, route_id, fields).await?;
    info!(by = %caller.subject, %staff_id, %route_id, "staff route updated via api");
    ok("staff route updated", route)
}

async fn delete_staff_route(
    State(state): State<AppState>,
    Admin(caller): Admin,
    Path((staff_id, route_id)): Path<(String, String)>,
) -> ApiResult<StaffRoute> {
    let (staff_id, route_id) = (parse_id(&staff_id, "staff_id")?, parse_id(&route_id, "route_id")?);
    let route = state.engine.registry.delete(staff_id, route_id).await?;
    info!(by = %caller.subject, %staff_id, %route_id, "staff route deleted via api");
    ok("staff route deleted", route)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActiveState {
    pub is_active: bool,
}

async fn toggle_staff_route(
    State(state): State<AppState>,
    Admin(_): Admin,
    Path((staff_id, route_id)): Path<(String, String)>,
) -> ApiResult<ActiveState> {
    let (staff_id, route_id) = (parse_id(&staff_id, "staff_id")?, parse_id(&route_id, "route_id")?);
    let is_active = state.engine.registry.toggle_active(staff_id, route_id).await?;
    ok("staff route toggled", ActiveState { is_active })
}

// ── Dispatch assignments ────────────────────────────────────────

async fn create_assignment(
    State(state): State<AppState>,
    Admin(caller): Admin,
    body: Result<Json<DispatchAssignmentCreate>, JsonRejection>,
) -> ApiResult<DispatchAssignment> {
    let Json(req) = body?;
    let assignment = state.engine.create_assignment(req).await?;
    debug!(by = %caller.subject, assignment_id = %assignment.id, "assignment created via api");
    created("assignment created", assignment)
}

async fn list_assignments(State(state): State<AppState>, _: Reader) -> ApiResult<Vec<DispatchAssignment>> {
    let all = state.engine.list_assignments(None).await;
    ok(format!("{} assignment(s)", all.len()), all)
}

async fn assignments_by_staff(
    State(state): State<AppState>,
    _: Reader,
    Path(staff_id): Path<String>,
) -> ApiResult<Vec<DispatchAssignment>> {
    let staff_id = parse_id(&staff_id, "staff_id")?;
    let list = state.engine.list_assignments(Some(staff_id)).await;
    ok(format!("{} assignment(s)", list.len()), list)
}

async fn latest_assignment(
    State(state): State<AppState>,
    _: Reader,
    Path(staff_id): Path<String>,
) -> ApiResult<DispatchAssignment> {
    let staff_id = parse_id(&staff_id, "staff_id")?;
    let latest = state.engine.get_latest_assignment(staff_id).await?;
    ok("latest assignment", latest)
}

async fn assignment_by_id(
    State(state): State<AppState>,
    _: Reader,
    Path(id): Path<String>,
) -> ApiResult<DispatchAssignment> {
    let id = parse_id(&id, "assignment_id")?;
    let assignment = state.engine.get_assignment(id).await?;
    ok("assignment found", assignment)
}

async fn delete_assignment(
    State(state): State<AppState>,
    Admin(caller): Admin,
    Path(id): Path<String>,
) -> ApiResult<DispatchAssignment> {
    let id = parse_id(&id, "assignment_id")?;
    let deleted = state.engine.delete_assignment(id).await?;
    info!(by = %caller.subject, assignment_id = %id, "assignment deleted via api");
    ok("assignment deleted", deleted)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: AssignmentStatus,
}

async fn update_assignment_status(
    State(state): State<AppState>,
    Admin(_): Admin,
    Path(id): Path<String>,
    body: Result<Json<StatusUpdate>, JsonRejection>,
) -> ApiResult<DispatchAssignment> {
    let id = parse_id(&id, "assignment_id")?;
    let Json(update) = body?;
    let assignment = state.engine.update_status(id, update.status).await?;
    ok("assignment status updated", assignment)
}

// ── Unavailability ──────────────────────────────────────────────

async fn create_unavailability(
    State(state): State<AppState>,
    Admin(_): Admin,
    body: Result<Json<StaffUnavailabilityCreate>, JsonRejection>,
) -> ApiResult<StaffUnavailability> {
    let Json(req) = body?;
    let window = state.engine.create_unavailability(req).await?;
    created("unavailability recorded", window)
}

async fn unavailability_by_staff(
    State(state): State<AppState>,
    _: Reader,
    Path(staff_id): Path<String>,
) -> ApiResult<Vec<StaffUnavailability>> {
    let staff_id = parse_id(&staff_id, "staff_id")?;
    let windows = state.engine.get_unavailability(staff_id).await;
    ok(format!("{} unavailability window(s)", windows.len()), windows)
}

// ── Password reset mail ─────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetPasswordRequest {
    pub email: String,
    pub otp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

/// Best effort: always 200, the outcome is in the message.
async fn send_reset_password(
    State(state): State<AppState>,
    body: Result<Json<ResetPasswordRequest>, JsonRejection>,
) -> Json<MessageBody> {
    let outcome = body
        .map_err(|e| e.body_text())
        .and_then(|Json(req)| NotificationTask::password_reset(req.email, req.otp).map_err(|e| e.to_string()))
        .and_then(|task| state.notifications.enqueue(task).map_err(|e| e.to_string()));
    let message = match outcome {
        Ok(_) => "email is being sent".to_string(),
        Err(reason) => {
            warn!(reason = %reason, "password reset email not queued");
            format!("could not send email: {reason}")
        }
    };
    Json(MessageBody { message })
}

// ── Router ──────────────────────────────────────────────────────

async fn track_metrics(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(
        observability::HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "route" => route.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(observability::HTTP_REQUEST_DURATION_SECONDS, "method" => method, "route" => route)
        .record(started.elapsed().as_secs_f64());
    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/staff_routes", post(create_staff_route).get(list_staff_routes))
        .route("/staff_routes/by_route/{route_id}", get(staff_routes_by_route))
        .route("/staff_routes/{staff_id}", get(staff_routes_by_staff))
        .route(
            "/staff_routes/{staff_id}/{route_id}",
            put(update_staff_route).delete(delete_staff_route),
        )
        .route("/staff_routes/{staff_id}/{route_id}/toggle", post(toggle_staff_route))
        .route("/dispatch", post(create_assignment).get(list_assignments))
        .route("/dispatch/{id}", get(assignments_by_staff).delete(delete_assignment))
        .route("/dispatch/assignment/{id}", get(assignment_by_id))
        .route("/dispatch/{id}/latest", get(latest_assignment))
        .route("/dispatch/{id}/status", put(update_assignment_status))
        .route("/unavailability", post(create_unavailability))
        .route("/unavailability/{staff_id}", get(unavailability_by_staff))
        .route("/send-reset-password", post(send_reset_password))
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(state)
}
