use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failure turning uploaded bytes into the encoded image form, or reading it back.
#[derive(Debug, Error)]
pub enum ImageDecodeError {
    #[error("uploaded file is empty")]
    EmptyFile,

    #[error("file is not a recognised image format")]
    UnrecognizedFormat,

    #[error("value is not a data URL")]
    NotADataUrl,

    #[error("data URL is not base64 encoded")]
    MissingBase64Marker,

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// Failure of a single call to the analysis service.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("request to analysis service failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("analysis service returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("analysis service returned no text")]
    EmptyResponse,

    #[error("analysis service returned malformed JSON: {0}")]
    MalformedResponse(#[from] serde_json::Error),

    #[error("could not read selected image: {0}")]
    Decode(#[from] ImageDecodeError),
}

/// Coarse error tag kept on a failed session. The user only ever sees one
/// message, but the cause stays distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    ImageDecode,
    Service,
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Decode(_) => ErrorKind::ImageDecode,
            _ => ErrorKind::Service,
        }
    }
}

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
