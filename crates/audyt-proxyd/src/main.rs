use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::Rng;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "audyt-proxyd",
    about = "TikTok Audyt secure proxy daemon",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy HTTP server
    Serve {
        /// Port to listen on (default: $PORT or 3001)
        #[arg(long, env = "PORT", default_value = "3001")]
        port: u16,
        /// Host to bind (default: $HOST or 0.0.0.0)
        #[arg(long, env = "HOST", default_value = "0.0.0.0")]
        host: String,
        /// Log level: error, warn, info, debug, verbose (default: $PROXY_LOG_LEVEL or info)
        #[arg(long, env = "PROXY_LOG_LEVEL")]
        log_level: Option<String>,
    },
    /// Print a random 32-byte hex value suitable for SERVER_SECRET
    GenSecret,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal in production.
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or_else(|| Commands::Serve {
        port: std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3001),
        host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        log_level: None,
    });

    match command {
        Commands::Serve {
            port,
            host,
            log_level,
        } => {
            init_tracing(log_level);
            if let Ok(path) = dotenv {
                tracing::debug!(path = %path.display(), "loaded .env");
            }
            cmd_serve(host, port).await
        }
        Commands::GenSecret => {
            cmd_gen_secret();
            Ok(())
        }
    }
}

fn init_tracing(log_level: Option<String>) {
    let raw = log_level
        .or_else(|| std::env::var("PROXY_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".into());
    let level = if raw.eq_ignore_ascii_case("verbose") {
        "debug".to_owned()
    } else {
        raw
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = audyt_proxy::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    audyt_proxy::run(cfg).await
}

fn cmd_gen_secret() {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    println!("{}", hex::encode(bytes));
}
