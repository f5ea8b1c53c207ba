//! CLI argument definitions for the Corral binary.

use clap::{Parser, Subcommand};

/// Corral real-time entity synchronization server
#[derive(Parser, Debug)]
#[command(name = "corral")]
#[command(about = "Corral: access-controlled real-time entity synchronization server")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the Corral server
    Serve(ServeArgs),
}

/// Arguments for the serve command
#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3001, env = "CORRAL_PORT")]
    pub port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0", env = "CORRAL_HOST")]
    pub host: String,

    /// Lifetime of issued sessions, in seconds
    #[arg(long, default_value_t = 30 * 24 * 60 * 60, env = "CORRAL_SESSION_TTL_SECS")]
    pub session_ttl_secs: i64,

    /// Discord OAuth client id (enables the discord handshake)
    #[arg(long, env = "CORRAL_DISCORD_CLIENT_ID")]
    pub discord_client_id: Option<String>,

    /// Discord OAuth client secret
    #[arg(long, env = "CORRAL_DISCORD_CLIENT_SECRET")]
    pub discord_client_secret: Option<String>,

    /// Discord OAuth redirect URI
    #[arg(long, env = "CORRAL_DISCORD_REDIRECT_URI")]
    pub discord_redirect_uri: Option<String>,

    /// Seed a demo user, session, and instrument and print the session
    /// token (for local development)
    #[arg(long)]
    pub seed: bool,
}
