use clap::Parser;
use url::Url;

pub const DEFAULT_PROMPT_PREFIX: &str = "use code to solve: ";

#[derive(Parser, Debug, Clone)]
#[command(name = "snapask-overlay", about = "Always-on-top answer overlay for SnapAsk")]
pub struct OverlayConfig {
    #[arg(long, env = "SNAPASK_SERVER_URL", default_value = "ws://127.0.0.1:8765/ws")]
    pub server_url: String,

    /// Prepended to the clipboard text when sending a query.
    #[arg(long, env = "SNAPASK_PROMPT_PREFIX", default_value = DEFAULT_PROMPT_PREFIX)]
    pub prompt_prefix: String,

    /// Name announced to the relay.
    #[arg(long, env = "SNAPASK_OVERLAY_NAME")]
    pub name: Option<String>,
}

impl OverlayConfig {
    pub fn validate(&self) -> Result<Url, String> {
        let url = Url::parse(&self.server_url).map_err(|err| format!("invalid server URL: {err}"))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(format!("server URL must use ws or wss, got `{other}`")),
        }
    }
}
