use std::time::Duration;

use clap::Parser;

use crate::{analyzer::DEFAULT_GEMINI_MODEL, pipeline::PipelineConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "snapask-relay", about = "Screenshot + vision-question broker")]
pub struct RelayConfig {
    #[arg(long, env = "SNAPASK_BIND", default_value = "0.0.0.0:8765")]
    pub bind_address: String,

    /// Upper bound on a single AI analysis call.
    #[arg(long, env = "SNAPASK_ANALYSIS_TIMEOUT_SECS", default_value_t = 30)]
    pub analysis_timeout_secs: u64,

    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    #[arg(long, env = "GEMINI_MODEL", default_value = DEFAULT_GEMINI_MODEL)]
    pub gemini_model: String,

    /// Name reported with every screenshot.
    #[arg(long, env = "SNAPASK_DEVICE_ID", default_value = "primary-display")]
    pub device_id: String,

    /// Downscale screenshots wider than this before analysis. 0 keeps full size.
    #[arg(long, env = "SNAPASK_MAX_IMAGE_WIDTH")]
    pub max_image_width: Option<u32>,
}

impl RelayConfig {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            analysis_timeout: Duration::from_secs(self.analysis_timeout_secs.max(1)),
        }
    }
}
