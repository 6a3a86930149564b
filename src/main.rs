use anyhow::Context;
use crm_sync::bus::Event;
use crm_sync::cache::CacheData;
use crm_sync::{Config, Manager};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("crm-sync starting...");

    let config = Config::from_env()?;
    let manager = Manager::init(config).await?;

    let user = match manager.session().restore().await? {
        Some(user) => user,
        None => {
            let email = std::env::var("CRM_EMAIL")
                .context("no stored session; set CRM_EMAIL and CRM_PASSWORD to log in")?;
            let password = std::env::var("CRM_PASSWORD").context("CRM_PASSWORD is not set")?;
            manager.session().login(&email, &password).await?
        }
    };
    info!("Signed in as {} <{}>", user.name_as_per_nid, user.email);

    manager.start();

    let mut conversations = manager.api().conversations(1, 100, None);
    let mut events = manager.bus().subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            snapshot = conversations.changed() => {
                let Some(snapshot) = snapshot else { break };
                if let Some(page) = snapshot.data.as_deref().and_then(CacheData::as_conversations) {
                    info!(
                        "{} conversations (revision {})",
                        page.leads.len(),
                        snapshot.revision
                    );
                    if let Some(latest) = page.leads.first() {
                        info!(
                            "Latest: {} [{}] seen={}",
                            latest.name, latest.status, latest.messages_seen
                        );
                    }
                } else if let Some(e) = snapshot.error {
                    error!("Conversation list failed: {}", e);
                }
            }
            event = events.recv() => match event {
                Ok(Event::ForcedLogout { reason }) => {
                    error!("Session ended: {}", reason);
                    break;
                }
                Ok(Event::Connection(state)) => info!("Socket {:?}", state),
                Ok(Event::Notification { level, message }) => warn!("{:?}: {}", level, message),
                Err(RecvError::Lagged(n)) => warn!("Skipped {} bus events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    drop(conversations);
    manager.shutdown().await;

    Ok(())
}
