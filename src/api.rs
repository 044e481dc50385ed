// API routes and handlers
use crate::error::TranslatorError;
use crate::state::TranslationService;
use actix_cors::Cors;
use actix_web::error::InternalError;
use actix_web::{get, post, web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_LENGTH: usize = 512;
const UNSUPPORTED_LANGUAGE: &str = "unsupported language code";

fn default_max_length() -> usize {
    DEFAULT_MAX_LENGTH
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateRequest {
    pub source: String,
    pub target: String,
    pub text: String,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranslateResponse {
    pub source_lang: String,
    pub target_lang: String,
    pub translation: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnsupportedLanguageResponse {
    pub error: String,
    pub supported_languages: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub note: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LanguagesResponse {
    pub languages: Vec<String>,
}

#[get("/")]
pub async fn root() -> impl Responder {
    HttpResponse::Ok().json(StatusResponse {
        status: "ok".to_string(),
        note: "use /languages and POST /translate".to_string(),
    })
}

#[get("/languages")]
pub async fn languages(state: web::Data<TranslationService>) -> impl Responder {
    HttpResponse::Ok().json(LanguagesResponse {
        languages: state.supported_languages().to_vec(),
    })
}

/// Unsupported codes answer 200 with the valid list; only runtime failures use error statuses.
#[post("/translate")]
pub async fn translate(
    state: web::Data<TranslationService>,
    payload: web::Json<TranslateRequest>,
) -> Result<HttpResponse, TranslatorError> {
    let TranslateRequest {
        source,
        target,
        text,
        max_length,
    } = payload.into_inner();

    if !state.is_supported(&source) || !state.is_supported(&target) {
        log::debug!("rejected language pair {source} -> {target}");
        return Ok(HttpResponse::Ok().json(UnsupportedLanguageResponse {
            error: UNSUPPORTED_LANGUAGE.to_string(),
            supported_languages: state.supported_languages().to_vec(),
        }));
    }

    let translation = if text.trim().is_empty() {
        String::new()
    } else {
        log::debug!("translating {} chars {source} -> {target}", text.chars().count());
        state
            .translate(text, source.clone(), target.clone(), max_length)
            .await
            .map_err(|e| {
                log::error!("translation {source} -> {target} failed: {e}");
                e
            })?
    };

    Ok(HttpResponse::Ok().json(TranslateResponse {
        source_lang: source,
        target_lang: target,
        translation,
    }))
}

/// Malformed bodies get a JSON error instead of actix's plain-text default.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let message = err.to_string();
        let response = HttpResponse::UnprocessableEntity().json(serde_json::json!({ "error": message }));
        InternalError::from_response(err, response).into()
    })
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .service(root)
        .service(languages)
        .service(translate);
}

/// Any origin, method and header; credentials allowed.
pub fn cors() -> Cors {
    Cors::permissive()
}
