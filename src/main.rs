use futures::StreamExt;
use marketlink::{ClientEvent, HttpApi, Session, Settings, WsConnector};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (settings, identity) = Settings::from_env()?;
    info!("Marketlink client starting for {}", identity);

    let api = Arc::new(HttpApi::new(&settings)?);
    let session = Session::new(settings, identity, api, Arc::new(WsConnector));

    let mut events = Box::pin(session.bus().stream());
    let events_handle = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                ClientEvent::Alert { title, body, .. } => info!("{}: {}", title, body),
                other => info!("{:?}", other),
            }
        }
    });

    if let Err(e) = session.start().await {
        error!("Session start incomplete: {}", e);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = events_handle => {
            error!("Event stream finished unexpectedly");
        }
    }

    session.shutdown();
    Ok(())
}
