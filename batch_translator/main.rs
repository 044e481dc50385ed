use anyhow::{Context, Result};
use clap::Parser;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use translation_server::api::DEFAULT_MAX_LENGTH;
use translation_server::models::m2m100::{M2M100Translator, ModelFiles, DEFAULT_MODEL_ID};
use translation_server::models::{device_label, select_device, TranslationModel};
use translation_server::state::{Limits, TranslationService};

/// Translates one column of a CSV file offline
#[derive(Parser)]
#[command(name = "batch_translator")]
struct Args {
    /// CSV file with a header row
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    #[arg(short, long)]
    source: String,

    #[arg(short, long)]
    target: String,

    /// Zero-based index of the text column
    #[arg(short, long, default_value_t = 0)]
    column: usize,

    #[arg(short, long, default_value = "translations.csv")]
    output: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MAX_LENGTH)]
    max_length: usize,

    #[arg(long, env = "TRANSLATOR_MODEL_ID", default_value = DEFAULT_MODEL_ID)]
    model_id: String,

    #[arg(long, default_value = "main")]
    revision: String,

    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let sentences = load_column(&args.input, args.column)?;
    log::info!("loaded {} rows from {:?}", sentences.len(), args.input);

    let device = select_device(args.cpu)?;
    let files = ModelFiles::from_hub(&args.model_id, &args.revision, std::env::var("HF_TOKEN").ok())?;
    let translator = Arc::new(M2M100Translator::load(&args.model_id, &files, device.clone())?);
    let service = TranslationService::new(translator.clone(), device_label(&device), Limits::default());
    for code in [&args.source, &args.target] {
        anyhow::ensure!(
            service.is_supported(code),
            "unsupported language code {code}, expected one of {:?}",
            service.supported_languages()
        );
    }
    log::info!("loaded {} on {}", args.model_id, device_label(&device));

    let translations: Vec<String> = sentences
        .par_iter()
        .map(|text| {
            if text.trim().is_empty() {
                return Ok(String::new());
            }
            translator
                .translate(text, &args.source, &args.target, args.max_length)
                .with_context(|| format!("failed to translate {text:?}"))
        })
        .collect::<Result<_>>()?;
    log::info!("translated {} rows", translations.len());

    let mut writer = csv::Writer::from_path(&args.output)?;
    writer.write_record(["text", "translation"])?;
    for (text, translation) in sentences.iter().zip(translations.iter()) {
        writer.write_record([text, translation])?;
    }
    writer.flush()?;
    log::info!("saved {:?}", args.output);
    Ok(())
}

// Reads one column of every record, skipping the header
fn load_column(path: &Path, column: usize) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut texts = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let text = record
            .get(column)
            .with_context(|| format!("row {} has no column {column}", line + 1))?;
        texts.push(text.to_string());
    }
    Ok(texts)
}
