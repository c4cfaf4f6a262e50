use axum::{
    extract::rejection::QueryRejection,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

tokio::task_local! {
    /// Identifier of the request currently being served.
    pub static REQUEST_ID: String;
}

/// Returns the id of the request in scope, or a fresh one outside a request.
pub fn current_request_id() -> String {
    REQUEST_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string())
}

/// A single offending field in a rejected payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingKind {
    /// A reading with the same timestamp is already stored.
    Duplicate,
    /// The reading is older than the latest stored one.
    OutOfOrder,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        fields: Vec<FieldError>,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Reading for sensor {sensor_id} at {timestamp} rejected ({kind:?}), latest is {last_timestamp}")]
    Ordering {
        kind: OrderingKind,
        sensor_id: String,
        timestamp: DateTime<Utc>,
        last_timestamp: DateTime<Utc>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Validation failure without per-field details.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Validation failure listing every offending field.
    pub fn invalid_fields(fields: Vec<FieldError>) -> Self {
        let names: Vec<&str> = fields.iter().map(|f| f.field.as_str()).collect();
        Error::Validation {
            message: format!("invalid fields: {}", names.join(", ")),
            fields,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation { .. } | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::Conflict(_) | Error::Ordering { .. } => StatusCode::CONFLICT,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_)
            | Error::Internal(_)
            | Error::Mqtt(_)
            | Error::Database(_)
            | Error::Migration(_)
            | Error::Metrics(_)
            | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation { .. } | Error::Json(_) => "VALIDATION_ERROR",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::NotFound(_) => "NOT_FOUND",
            Error::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
            Error::Conflict(_) => "CONFLICT",
            Error::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Error::Ordering {
                kind: OrderingKind::Duplicate,
                ..
            } => "DUPLICATE_READING",
            Error::Ordering {
                kind: OrderingKind::OutOfOrder,
                ..
            } => "OUT_OF_ORDER_READING",
            Error::Config(_) => "CONFIG_ERROR",
            Error::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            _ => "INTERNAL_ERROR",
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Error::Validation { fields, .. } if !fields.is_empty() => Some(json!(fields)),
            Error::Ordering {
                sensor_id,
                timestamp,
                last_timestamp,
                ..
            } => Some(json!({
                "sensor_id": sensor_id,
                "timestamp": timestamp,
                "last_timestamp": last_timestamp,
            })),
            Error::RateLimited { retry_after_secs } => {
                Some(json!({ "retry_after": retry_after_secs }))
            }
            _ => None,
        }
    }
}

impl From<QueryRejection> for Error {
    fn from(rejection: QueryRejection) -> Self {
        Error::validation(rejection.body_text())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let request_id = current_request_id();

        // Server faults keep their cause in the log, not in the body.
        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(request_id = %request_id, code, "Request failed: {}", self);
            "internal server error".to_string()
        } else {
            if status == StatusCode::SERVICE_UNAVAILABLE {
                warn!(request_id = %request_id, code, "{}", self);
            } else {
                debug!(request_id = %request_id, code, "Request rejected: {}", self);
            }
            self.to_string()
        };

        let mut body = json!({
            "code": code,
            "message": message,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "request_id": request_id,
        });
        if let Some(details) = self.details() {
            body["details"] = details;
        }

        let mut response = (status, Json(json!({ "error": body }))).into_response();
        if let Error::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_envelope_carries_request_id_in_scope() {
        let response = REQUEST_ID
            .scope("req-1".to_string(), async {
                Error::NotFound("sensor s-1".to_string()).into_response()
            })
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert_eq!(body["error"]["request_id"], "req-1");
        assert!(body["error"]["timestamp"].is_string());
        assert!(body["error"].get("details").is_none());
    }

    #[tokio::test]
    async fn test_validation_lists_fields() {
        let err = Error::invalid_fields(vec![
            FieldError::new("value", "is required"),
            FieldError::new("unit", "must be a string"),
        ]);
        assert_eq!(err.to_string(), "Validation error: invalid fields: value, unit");

        let body = body_json(err.into_response()).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["details"][1]["field"], "unit");
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let response = Error::RateLimited { retry_after_secs: 7 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
    }

    #[tokio::test]
    async fn test_internal_errors_hide_cause() {
        let body = body_json(Error::Internal("lock poisoned".into()).into_response()).await;
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(body["error"]["message"], "internal server error");
    }

    #[test]
    fn test_ordering_codes_distinguish_duplicates() {
        let ts = Utc::now();
        let dup = Error::Ordering {
            kind: OrderingKind::Duplicate,
            sensor_id: "s".into(),
            timestamp: ts,
            last_timestamp: ts,
        };
        assert_eq!(dup.code(), "DUPLICATE_READING");
        assert_eq!(dup.status(), StatusCode::CONFLICT);
    }
}
