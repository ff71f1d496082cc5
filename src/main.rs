mod charges;
mod config;
mod error;
mod http_api;
mod llm_client;
mod oracle;
mod pipeline;
mod rate_table;
mod spreadsheet;
mod upload;

#[cfg(test)]
mod testing;

use http_api::{AppState, CarrierPolicy};
use llm_client::OpenAiClient;
use oracle::{ChargeOracle, LlmOracle};
use pipeline::{Pipeline, PipelineOptions};
use rate_table::RateTable;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use upload::UploadPolicy;

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("PLD_CONFIG").unwrap_or_else(|_| "pld.toml".to_string());
    let mut cfg = config::Config::load_or_default(&config_path)?;
    cfg.apply_env(|key| std::env::var(key).ok())?;
    let api_key = cfg.api_key()?.to_string();

    let rate_table = RateTable::load(cfg.pipeline.rate_table_path.as_deref().map(Path::new))?;
    let client = OpenAiClient::new(&cfg.llm, &api_key);
    let oracle: Arc<dyn ChargeOracle> = Arc::new(LlmOracle::new(client));

    let upload_dir = PathBuf::from(&cfg.server.upload_dir);
    upload::sweep_stale(&upload_dir)?;

    let state = AppState {
        pipeline: Pipeline::new(
            oracle,
            Arc::new(rate_table),
            PipelineOptions::from(&cfg.pipeline),
        ),
        uploads: UploadPolicy {
            dir: upload_dir,
            max_bytes: cfg.server.max_upload_bytes,
        },
        carrier_policy: CarrierPolicy {
            default_carrier: cfg.pipeline.default_carrier.clone(),
            required: cfg.pipeline.require_carrier,
        },
    };

    info!(
        host = %cfg.server.host,
        port = cfg.server.port,
        model = %cfg.llm.model,
        normalization = ?cfg.pipeline.normalization,
        "Server running"
    );

    http_api::start_server(state, &cfg.server.host, cfg.server.port)?.await?;
    Ok(())
}
