//! Serve command - runs the Corral live server.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use corral::{
    EntityKind, Hub, Record, SystemClock,
    identity::{DiscordConfig, DiscordIdentity, IdentityProvider, NullIdentity},
    net::LiveServer,
    store::InMemory,
};

use crate::cli::ServeArgs;

/// Run the Corral server
pub async fn run(args: &ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("corral=info".parse().unwrap()),
        )
        .init();

    let store = Arc::new(InMemory::new());
    let clock = Arc::new(SystemClock);

    let identity: Arc<dyn IdentityProvider> = match (
        &args.discord_client_id,
        &args.discord_client_secret,
        &args.discord_redirect_uri,
    ) {
        (Some(client_id), Some(client_secret), Some(redirect_uri)) => {
            Arc::new(DiscordIdentity::new(DiscordConfig {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                redirect_uri: redirect_uri.clone(),
            }))
        }
        _ => {
            tracing::info!("discord oauth not configured, only session handshakes available");
            Arc::new(NullIdentity)
        }
    };

    let hub = Hub::builder(store, clock)
        .identity(identity)
        .session_ttl_ms(args.session_ttl_secs * 1000)
        .build();

    if args.seed {
        seed(&hub).await?;
    }

    let mut server = LiveServer::new(hub);
    let addr = format!("{}:{}", args.host, args.port);
    server.start(&addr).await?;

    println!("Corral server ready on ws://{}/live", server.address()?);
    println!("Press Ctrl+C to shutdown");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    server.stop()?;

    println!("Server shut down");
    Ok(())
}

/// Create a demo user, session, and instrument so a fresh in-memory server
/// can be exercised immediately.
async fn seed(hub: &Arc<Hub>) -> Result<(), Box<dyn std::error::Error>> {
    let mut user = Record::new();
    user.set("name", "demo");
    user.set("email", "demo@example.com");
    let user = hub.directory().users().create(user, None).await?;
    let user_id = user.id().expect("store assigns ids").to_string();

    let (token, _session) = hub.directory().issue_session(&user_id).await?;

    if let Some(instruments) = hub.collection(EntityKind::Instrument) {
        let mut instrument = Record::new();
        instrument.set("name", "EUR_USD");
        instrument.set("displayName", "EUR/USD");
        instrument.set("type", "CURRENCY");
        instrument.set("pipLocation", -4);
        instruments.create(instrument, Some(&user_id)).await?;
    }

    println!("Seeded demo user {user_id}");
    println!("Session token: {token}");
    Ok(())
}
