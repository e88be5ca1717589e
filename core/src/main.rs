/// chatsync console client - main entry point
use chatsync_core::{console, ChatSession, Config, HttpChatApi, SessionContext, WsTransport};
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let token = env::var("CHATSYNC_TOKEN")
        .map_err(|_| anyhow::anyhow!("CHATSYNC_TOKEN is not set; log in and export the token"))?;
    let context = SessionContext::new();
    context.login(token, None);

    let api = Arc::new(HttpChatApi::new(&config.api_base_url, context.clone())?);
    let transport = Arc::new(WsTransport::new(config.ws_url.clone()));
    info!("Connecting to {}", config.ws_url);

    let session = ChatSession::new(config, context, transport, api);
    let me = session
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("Could not start session: {}", e))?;
    info!("Signed in as {} ({})", me.name, me.id);

    let result = tokio::select! {
        result = console::run(&session) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    session.logout();
    info!("Logged out");
    result
}
