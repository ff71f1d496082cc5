// src/error.rs

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

/// Body returned for every 5xx. The detail only goes to the log.
pub const GENERIC_FAILURE: &str = "Error processing the file.";

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad request input (missing carrier, missing file, unknown carrier).
    #[error("{0}")]
    Validation(String),

    #[error("upload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    /// The workbook could not be read or has no usable data sheet.
    #[error("spreadsheet error: {0}")]
    Parse(String),

    /// The LLM call failed, timed out, or answered with the wrong shape.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<calamine::Error> for PipelineError {
    fn from(err: calamine::Error) -> Self {
        PipelineError::Parse(err.to_string())
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Internal(format!("worker task failed: {err}"))
    }
}

impl ResponseError for PipelineError {
    fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            PipelineError::Validation(_) | PipelineError::PayloadTooLarge { .. } => {
                self.to_string()
            }
            _ => GENERIC_FAILURE.to_string(),
        };
        HttpResponse::build(self.status_code())
            .content_type("text/plain; charset=utf-8")
            .body(body)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
