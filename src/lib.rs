pub mod api;
pub mod config;
pub mod error;
pub mod generation;
pub mod languages;
pub mod models;
pub mod state;

pub use error::{Result, TranslatorError};
pub use models::TranslationModel;
pub use state::{Limits, TranslationService};
