// Web server entry point
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use translation_server::api;
use translation_server::config::ServerConfig;
use translation_server::models::m2m100::{M2M100Translator, ModelFiles};
use translation_server::models::{device_label, select_device};
use translation_server::state::TranslationService;

fn load_service(config: &ServerConfig) -> anyhow::Result<TranslationService> {
    let device = select_device(config.cpu)?;
    log::info!(
        "loading model {} ({}) on {} ...",
        config.model_id,
        config.revision,
        device_label(&device)
    );
    let files = ModelFiles::from_hub(&config.model_id, &config.revision, config.hf_token.clone())
        .with_context(|| format!("failed to fetch {}", config.model_id))?;
    let translator = M2M100Translator::load(&config.model_id, &files, device.clone())
        .with_context(|| format!("failed to load {}", config.model_id))?;

    let service = TranslationService::new(Arc::new(translator), device_label(&device), config.limits());
    anyhow::ensure!(
        !service.supported_languages().is_empty(),
        "{} supports none of the allowlisted languages",
        config.model_id
    );
    log::info!("loaded, supported languages: {:?}", service.supported_languages());
    Ok(service)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = ServerConfig::parse();

    // loading blocks for a while; failures end the process before binding
    let service = web::Data::new(load_service(&config)?);

    let state = service.clone();
    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(api::cors())
            .wrap(middleware::Logger::default())
            .configure(api::configure)
    });
    if let Some(workers) = config.workers {
        server = server.workers(workers);
    }
    log::info!("listening on {}:{}", config.host, config.port);
    server
        .bind((config.host.as_str(), config.port))?
        .run()
        .await?;

    log::info!("shutting down, releasing model {}", service.model_name());
    drop(service);
    Ok(())
}
