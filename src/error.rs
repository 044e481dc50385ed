// Error types shared by the model host and the HTTP layer
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranslatorError {
    #[error("candle error: {0}")]
    Candle(#[from] candle::Error),

    #[error("hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("invalid model config: {0}")]
    Config(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("unsupported language code: {0}")]
    UnsupportedLanguage(String),

    #[error("server busy: too many translations waiting")]
    Busy,

    #[error("translation worker failed: {0}")]
    Blocking(String),
}

pub type Result<T> = std::result::Result<T, TranslatorError>;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

// Unsupported languages never reach this path; the handler answers them with a 200 payload.
impl ResponseError for TranslatorError {
    fn status_code(&self) -> StatusCode {
        match self {
            TranslatorError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            TranslatorError::UnsupportedLanguage(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
        })
    }
}
