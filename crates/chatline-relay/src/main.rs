use anyhow::Result;
use chatline_relay::config::RelayConfig;
use chatline_relay::server;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "chatline presence and message relay")]
struct Args {
    /// TOML config file. Flags below override its values.
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[arg(long)]
    listen: Option<String>,
    /// Directory for the SQLite directory and message stores.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long, env = "CHATLINE_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,
    #[arg(long, env = "CHATLINE_INTERNAL_SECRET", hide_env_values = true)]
    internal_secret: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay (default).
    Serve,
    /// Print a user token signed with the configured secret.
    Token {
        #[arg(long)]
        user_id: i64,
    },
}

impl Args {
    fn into_config(self) -> Result<(RelayConfig, Command)> {
        let mut config = RelayConfig::load(self.config.as_deref())?;
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = Some(dir);
        }
        if let Some(secret) = self.token_secret {
            config.token_secret = secret;
        }
        if let Some(secret) = self.internal_secret {
            config.internal_secret = Some(secret);
        }
        config.validate()?;
        Ok((config, self.command.unwrap_or(Command::Serve)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatline_relay=info".into()),
        )
        .init();

    let (config, command) = Args::parse().into_config()?;
    match command {
        Command::Serve => server::serve(&config).await,
        Command::Token { user_id } => {
            println!("{}", config.token_signer().issue(user_id)?);
            Ok(())
        }
    }
}
