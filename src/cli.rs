// CLI argument handling
//
// Running with no subcommand starts the gateway. The `config` subcommand
// helps operators inspect the resolved configuration without booting.

use crate::config::Config;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "grokgate",
    version = crate::config::VERSION,
    about = "OpenAI-compatible gateway over a browser-session chat upstream"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect the resolved configuration
    Config {
        /// Print only the config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle CLI subcommands. Returns true when a command was handled and the
/// process should exit instead of starting the server.
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Config { path }) => {
            if path {
                match Config::config_path() {
                    Some(p) => println!("{}", p.display()),
                    None => eprintln!("no config path available"),
                }
                return true;
            }

            match Config::from_env() {
                Ok(mut config) => {
                    // Never print secrets
                    if !config.app.session_secret.is_empty() {
                        config.app.session_secret = "***".to_string();
                    }
                    if !config.app.app_key.is_empty() {
                        config.app.app_key = "***".to_string();
                    }
                    match toml::to_string_pretty(&config) {
                        Ok(rendered) => println!("{rendered}"),
                        Err(e) => eprintln!("failed to render config: {e}"),
                    }
                }
                Err(e) => eprintln!("configuration error: {e:#}"),
            }
            true
        }
        None => false,
    }
}
