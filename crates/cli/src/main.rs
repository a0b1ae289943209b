use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "clawhost")]
#[command(about = "Deployment wrapper for the openclaw gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the wrapper: setup wizard on /setup, everything else proxied to the gateway. This is the default.
    Serve {
        /// Public HTTP port (default: OPENCLAW_PUBLIC_PORT, PORT, or 8080)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Print the gateway token, generating and persisting it on first use.
    Token,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("clawhost {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Token) => {
            if let Err(e) = run_token() {
                log::error!("token failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { port }) => {
            if let Err(e) = run_serve(port).await {
                log::error!("serve failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            if let Err(e) = run_serve(None).await {
                log::error!("serve failed: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

fn run_token() -> anyhow::Result<()> {
    let env = clawhost::config::EnvResolver::from_process_env();
    let config = clawhost::config::resolve(&env)?;
    println!("{}", config.gateway_token);
    Ok(())
}

async fn run_serve(port: Option<u16>) -> anyhow::Result<()> {
    let env = clawhost::config::EnvResolver::from_process_env();
    let mut config = clawhost::config::resolve(&env)?;
    if let Some(p) = port {
        config.listen_port = p;
    }
    let state = clawhost::server::AppState::new(config, &env)?;
    clawhost::server::run_server(state).await
}
