use actix_web::{HttpRequest, HttpResponse, ResponseError, error, http::StatusCode};
use log::error;
use serde::Serialize;

use crate::encode::EncodeError;
use crate::io_struct::ValidationError;
use crate::service::GenerateError;

/// Error body shape shared by every failing endpoint.
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error("{0}")]
    Internal(String),
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<EncodeError> for ApiError {
    fn from(err: EncodeError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Generate(GenerateError::NotReady) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Generate(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let detail = self.to_string();
        HttpResponse::build(self.status_code()).json(ErrorBody { detail: &detail })
    }
}

/// Malformed or oversized JSON bodies answer with the same `{"detail": ...}` shape.
pub fn json_error_handler(err: error::JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    error!("JSON payload error: {}", err);
    match &err {
        error::JsonPayloadError::OverflowKnownLength { length, limit } => ApiError::PayloadTooLarge(
            format!("Payload too large: {} bytes exceeds limit of {} bytes", length, limit),
        )
        .into(),
        error::JsonPayloadError::Overflow { limit } => {
            ApiError::PayloadTooLarge(format!("Payload exceeds limit of {} bytes", limit)).into()
        }
        _ => ApiError::BadRequest(format!("Invalid JSON payload: {}", err)).into(),
    }
}

#[cfg(test)]
mod tests {
    use actix_web::body::to_bytes;

    use super::*;
    use crate::device::DeviceKind;
    use crate::pipeline::PipelineError;

    async fn body_json(err: ApiError) -> serde_json::Value {
        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(ValidationError::TooManySteps).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(GenerateError::NotReady).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(GenerateError::LoadFailed("x".to_string())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let pipeline = GenerateError::Pipeline {
            device: DeviceKind::Cpu,
            source: PipelineError::Image("bad".to_string()),
        };
        assert_eq!(
            ApiError::from(pipeline).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[actix_web::test]
    async fn test_body_carries_detail() {
        let json = body_json(ApiError::from(ValidationError::TooManySteps)).await;
        assert_eq!(json["detail"], "Max steps is 60");

        let json = body_json(ApiError::from(GenerateError::NotReady)).await;
        assert_eq!(json["detail"], "Model is still loading; try again shortly.");
    }

    #[actix_web::test]
    async fn test_json_overflow_is_payload_too_large() {
        let req = actix_web::test::TestRequest::default().to_http_request();
        let cases = [
            (
                error::JsonPayloadError::OverflowKnownLength {
                    length: 4096,
                    limit: 1024,
                },
                "Payload too large: 4096 bytes exceeds limit of 1024 bytes",
            ),
            (
                error::JsonPayloadError::Overflow { limit: 1024 },
                "Payload exceeds limit of 1024 bytes",
            ),
        ];
        for (payload_err, detail) in cases {
            let resp = json_error_handler(payload_err, &req).error_response();
            assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
            let body = to_bytes(resp.into_body()).await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["detail"], detail);
        }

        let resp = json_error_handler(error::JsonPayloadError::ContentType, &req).error_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
