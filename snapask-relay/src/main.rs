use std::sync::Arc;

use clap::Parser;
use snapask_relay::{
    AppState,
    analyzer::GeminiAnalyzer,
    capture::XcapCapturer,
    config::RelayConfig,
    serve,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RelayConfig::parse();
    let listener = match tokio::net::TcpListener::bind(&config.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", config.bind_address, err);
            std::process::exit(1);
        }
    };

    let analyzer = GeminiAnalyzer::new(config.gemini_api_key.clone(), config.gemini_model.clone());
    if !analyzer.has_api_key() {
        warn!("no GEMINI_API_KEY configured; analysis requests will fail");
    }
    let capturer = XcapCapturer::new(config.device_id.clone(), config.max_image_width);

    info!(
        bind_address = %config.bind_address,
        model = %config.gemini_model,
        analysis_timeout_secs = config.analysis_timeout_secs,
        "relay starting"
    );
    let state = AppState::start(
        Arc::new(capturer),
        Arc::new(analyzer),
        config.pipeline_config(),
    );
    if let Err(err) = serve(listener, state).await {
        warn!("relay server exited: {}", err);
    }
}
