use crate::errors::{Error, Result, REQUEST_ID};
use crate::external::{CropHealthQuery, CropHealthService, WeatherProvider};
use crate::ingest::SensorPipeline;
use crate::irrigation::IrrigationController;
use crate::metrics::{gather_metrics, RATE_LIMITED_TOTAL};
use crate::model::{ActivationRecord, IngestReceipt, IrrigationZone, Page, Sensor, SensorReading, Trigger};
use crate::query::{PageRequest, PagingLimits, TimeRange};
use crate::ratelimit::{Admission, RateLimiter, Scope, Tier};
use crate::validate;
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
pub const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");
const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SensorPipeline>,
    pub irrigation: Arc<IrrigationController>,
    pub limiter: Arc<RateLimiter>,
    pub api_keys: Arc<HashMap<String, Tier>>,
    pub weather: Option<Arc<dyn WeatherProvider>>,
    pub crops: Option<Arc<dyn CropHealthService>>,
    pub paging: PagingLimits,
}

/// The authenticated caller of a `/v1` request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub api_key: String,
    pub tier: Tier,
}

impl Caller {
    fn require(&self, scope: Scope) -> Result<()> {
        if self.tier.allows(scope) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "{} tier does not include {:?} access",
                self.tier, scope
            )))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    from: Option<String>,
    to: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    zone: Option<String>,
    from: Option<String>,
    to: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    zone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CropHealthParams {
    crop_type: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WeatherParams {
    location: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    let v1 = Router::new()
        .route(
            "/v1/sensors",
            get(list_sensors).post(create_sensor).fallback(method_not_allowed),
        )
        .route("/v1/sensors/:id", get(get_sensor).fallback(method_not_allowed))
        .route("/v1/sensors/:id/data", get(sensor_data).fallback(method_not_allowed))
        .route(
            "/v1/sensors/:id/readings",
            post(ingest_reading).fallback(method_not_allowed),
        )
        .route(
            "/v1/irrigation/status",
            get(irrigation_status).fallback(method_not_allowed),
        )
        .route(
            "/v1/irrigation/start",
            post(start_irrigation).fallback(method_not_allowed),
        )
        .route(
            "/v1/irrigation/stop",
            post(stop_irrigation).fallback(method_not_allowed),
        )
        .route(
            "/v1/irrigation/pause",
            post(pause_irrigation).fallback(method_not_allowed),
        )
        .route(
            "/v1/irrigation/resume",
            post(resume_irrigation).fallback(method_not_allowed),
        )
        .route(
            "/v1/irrigation/zones/:zone/schedule",
            put(set_schedule)
                .delete(clear_schedule)
                .fallback(method_not_allowed),
        )
        .route(
            "/v1/irrigation/history",
            get(irrigation_history).fallback(method_not_allowed),
        )
        .route("/v1/crops/health", get(crop_health).fallback(method_not_allowed))
        .route(
            "/v1/weather/current",
            get(current_weather).fallback(method_not_allowed),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route("/health", get(health).fallback(method_not_allowed))
        .route("/metrics", get(metrics_handler).fallback(method_not_allowed))
        .merge(v1)
        .fallback(route_not_found)
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

async fn route_not_found(uri: Uri) -> Error {
    Error::NotFound(format!("no route for {}", uri.path()))
}

async fn method_not_allowed(method: Method, uri: Uri) -> Error {
    Error::MethodNotAllowed(format!("{} {}", method, uri.path()))
}

/// Runs the request inside its request-id scope and echoes the id back.
async fn request_id(req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut response = REQUEST_ID.scope(id.clone(), next.run(req)).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn api_key(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    bearer
        .or_else(|| headers.get(&API_KEY_HEADER).and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

fn key_prefix(key: &str) -> &str {
    key.char_indices().nth(4).map_or(key, |(i, _)| &key[..i])
}

fn set_rate_headers(headers: &mut HeaderMap, admission: &Admission) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(admission.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(admission.remaining));
    headers.insert(
        RATE_LIMIT_RESET,
        HeaderValue::from(admission.reset_at.timestamp()),
    );
}

/// Resolves the API key, charges its bucket and tags the request with the
/// caller. Every admitted or throttled response carries the bucket headers.
async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    let key = api_key(req.headers())
        .ok_or_else(|| Error::Unauthorized("missing API key".to_string()))?;
    let tier = *state
        .api_keys
        .get(&key)
        .ok_or_else(|| Error::Unauthorized("invalid API key".to_string()))?;

    let admission = state.limiter.admit(&key, tier)?;
    if !admission.allowed {
        RATE_LIMITED_TOTAL.with_label_values(&[tier.as_str()]).inc();
        debug!(key = key_prefix(&key), %tier, "Request throttled");
        let mut response = Error::RateLimited {
            retry_after_secs: admission.retry_after_secs(),
        }
        .into_response();
        set_rate_headers(response.headers_mut(), &admission);
        return Ok(response);
    }

    req.extensions_mut().insert(Caller { api_key: key, tier });
    let mut response = next.run(req).await;
    set_rate_headers(response.headers_mut(), &admission);
    Ok(response)
}

fn parse_body(body: &Bytes) -> Result<Value> {
    serde_json::from_slice(body).map_err(|e| Error::validation(format!("invalid JSON body: {}", e)))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sensors": state.pipeline.catalog().len(),
        "zones": state.irrigation.zone_ids().len(),
    }))
}

async fn metrics_handler() -> Result<Response> {
    let body = gather_metrics()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

async fn list_sensors(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    params: std::result::Result<Query<PageParams>, QueryRejection>,
) -> Result<Json<Page<Sensor>>> {
    caller.require(Scope::Read)?;
    let Query(params) = params?;
    let request = PageRequest::new(params.page, params.per_page, state.paging)?;
    Ok(Json(state.pipeline.sensors(request)))
}

async fn create_sensor(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Result<(StatusCode, Json<Sensor>)> {
    caller.require(Scope::Write)?;
    let sensor = validate::parse_new_sensor(&parse_body(&body)?)?;
    let created = state.pipeline.register(sensor)?;
    info!(sensor_id = %created.id, sensor_type = %created.sensor_type, "Sensor registered");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_sensor(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Sensor>> {
    caller.require(Scope::Read)?;
    Ok(Json(state.pipeline.sensor(&id)?))
}

async fn sensor_data(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    params: std::result::Result<Query<RangeParams>, QueryRejection>,
) -> Result<Json<Page<SensorReading>>> {
    caller.require(Scope::Read)?;
    let Query(params) = params?;
    let range = TimeRange::parse("from", params.from.as_deref(), "to", params.to.as_deref())?;
    let request = PageRequest::new(params.page, params.per_page, state.paging)?;
    Ok(Json(state.pipeline.readings(&id, range, request)?))
}

async fn ingest_reading(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestReceipt>)> {
    caller.require(Scope::Write)?;
    let mut payload = parse_body(&body)?;
    validate::bind_sensor_id(&mut payload, &id)?;
    let receipt = state.pipeline.ingest_json(&payload).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn irrigation_status(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    params: std::result::Result<Query<StatusParams>, QueryRejection>,
) -> Result<Response> {
    caller.require(Scope::Read)?;
    let Query(params) = params?;
    match params.zone {
        Some(zone) => Ok(Json(state.irrigation.status(&zone).await?).into_response()),
        None => {
            let zones = state.irrigation.statuses().await?;
            Ok(Json(json!({ "zones": zones })).into_response())
        }
    }
}

async fn start_irrigation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Result<Json<IrrigationZone>> {
    caller.require(Scope::Write)?;
    let cmd = validate::parse_start(&parse_body(&body)?)?;
    let zone = state
        .irrigation
        .start(&cmd.zone, cmd.duration_minutes, cmd.water_flow_rate, Trigger::Manual)
        .await?;
    Ok(Json(zone))
}

async fn stop_irrigation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Result<Json<ActivationRecord>> {
    caller.require(Scope::Write)?;
    let zone = validate::parse_zone(&parse_body(&body)?)?;
    Ok(Json(state.irrigation.stop(&zone).await?))
}

async fn pause_irrigation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Result<Json<IrrigationZone>> {
    caller.require(Scope::Write)?;
    let zone = validate::parse_zone(&parse_body(&body)?)?;
    Ok(Json(state.irrigation.pause(&zone).await?))
}

async fn resume_irrigation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Result<Json<IrrigationZone>> {
    caller.require(Scope::Write)?;
    let zone = validate::parse_zone(&parse_body(&body)?)?;
    Ok(Json(state.irrigation.resume(&zone).await?))
}

async fn set_schedule(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(zone): Path<String>,
    body: Bytes,
) -> Result<Json<IrrigationZone>> {
    caller.require(Scope::Write)?;
    let schedule = validate::parse_schedule(&parse_body(&body)?)?;
    let updated = state.irrigation.set_schedule(&zone, Some(schedule)).await?;
    info!(zone_id = %zone, "Irrigation schedule set");
    Ok(Json(updated))
}

async fn clear_schedule(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(zone): Path<String>,
) -> Result<Json<IrrigationZone>> {
    caller.require(Scope::Write)?;
    Ok(Json(state.irrigation.set_schedule(&zone, None).await?))
}

async fn irrigation_history(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    params: std::result::Result<Query<HistoryParams>, QueryRejection>,
) -> Result<Json<Page<ActivationRecord>>> {
    caller.require(Scope::Read)?;
    let Query(params) = params?;
    let range = TimeRange::parse("from", params.from.as_deref(), "to", params.to.as_deref())?;
    let request = PageRequest::new(params.page, params.per_page, state.paging)?;
    let page = state
        .irrigation
        .history(params.zone.as_deref(), range, request)
        .await?;
    Ok(Json(page))
}

async fn crop_health(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    params: std::result::Result<Query<CropHealthParams>, QueryRejection>,
) -> Result<Json<Value>> {
    caller.require(Scope::Analytics)?;
    let Query(params) = params?;
    let range = TimeRange::parse(
        "date_from",
        params.date_from.as_deref(),
        "date_to",
        params.date_to.as_deref(),
    )?;
    let service = state
        .crops
        .as_ref()
        .ok_or_else(|| Error::ServiceUnavailable("crop health service is not configured".to_string()))?;
    let query = CropHealthQuery {
        crop_type: params.crop_type,
        date_from: range.from,
        date_to: range.to,
    };
    Ok(Json(service.health(&query).await?))
}

async fn current_weather(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    params: std::result::Result<Query<WeatherParams>, QueryRejection>,
) -> Result<Json<Value>> {
    caller.require(Scope::Analytics)?;
    let Query(params) = params?;
    let location = params
        .location
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| {
            Error::invalid_fields(vec![crate::errors::FieldError::new(
                "location",
                "is required",
            )])
        })?;
    let provider = state
        .weather
        .as_ref()
        .ok_or_else(|| Error::ServiceUnavailable("weather provider is not configured".to_string()))?;
    Ok(Json(provider.current(&location).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_from_bearer_or_legacy_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer k-123"));
        assert_eq!(api_key(&headers).as_deref(), Some("k-123"));

        let mut legacy = HeaderMap::new();
        legacy.insert(API_KEY_HEADER, HeaderValue::from_static("k-456"));
        assert_eq!(api_key(&legacy).as_deref(), Some("k-456"));

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(api_key(&basic), None);
    }

    #[test]
    fn test_key_prefix_is_short() {
        assert_eq!(key_prefix("abcdefgh"), "abcd");
        assert_eq!(key_prefix("ab"), "ab");
    }

    #[test]
    fn test_scope_check() {
        let free = Caller {
            api_key: "k".into(),
            tier: Tier::Free,
        };
        assert!(free.require(Scope::Read).is_ok());
        assert!(matches!(free.require(Scope::Write), Err(Error::Forbidden(_))));
    }
}
