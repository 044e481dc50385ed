// Command line and environment configuration
use crate::models::m2m100::DEFAULT_MODEL_ID;
use crate::state::Limits;
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "translation_server")]
#[command(about = "Asian language translation over HTTP, backed by M2M100")]
pub struct ServerConfig {
    /// Address to bind
    #[arg(long, env = "TRANSLATOR_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind
    #[arg(long, env = "TRANSLATOR_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Hugging Face model id
    #[arg(long, env = "TRANSLATOR_MODEL_ID", default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    /// Model revision (branch, tag or commit)
    #[arg(long, env = "TRANSLATOR_REVISION", default_value = "main")]
    pub revision: String,

    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Run on the CPU even when an accelerator is available
    #[arg(long)]
    pub cpu: bool,

    /// Generations running at the same time
    #[arg(long, env = "TRANSLATOR_MAX_IN_FLIGHT", default_value_t = 1)]
    pub max_in_flight: usize,

    /// Requests allowed to wait for a generation slot before getting 503
    #[arg(long, env = "TRANSLATOR_MAX_QUEUE", default_value_t = 64)]
    pub max_queue: usize,

    /// HTTP worker threads (defaults to the number of CPUs)
    #[arg(long, env = "TRANSLATOR_WORKERS")]
    pub workers: Option<usize>,
}

impl ServerConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            max_in_flight: self.max_in_flight,
            max_queue: self.max_queue,
        }
    }
}
