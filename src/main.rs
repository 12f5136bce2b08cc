use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

mod connect;
mod serve;

#[derive(Parser)]
#[command(name = "tether", version, about = "Chat with a tool-using model over a WebSocket")]
struct Cli {
    /// Settings file (default: ~/.tether/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server.
    Serve(ServeArgs),
    /// Open an interactive session against a server.
    Connect(ConnectArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long, short)]
    pub port: Option<u16>,
    /// Expose the server through a Cloudflare quick tunnel.
    #[arg(long)]
    pub tunnel: bool,
}

#[derive(Args)]
pub struct ConnectArgs {
    /// Server address, e.g. `localhost:3000` or `https://x.trycloudflare.com`.
    #[arg(default_value = "localhost:3000")]
    pub url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(tether_settings::settings_path);
    let settings = tether_settings::load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;

    match cli.command {
        Command::Serve(args) => serve::run(settings, args).await,
        Command::Connect(args) => connect::run(settings, args).await,
    }
}
