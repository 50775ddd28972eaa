mod server;

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use relay_console::{
    AdminConsole, ConsoleError,
    api_keys::NewApiKey,
    config::{
        Clock, ConsoleConfig, DEFAULT_MAX_EXPIRES_IN_DAYS, DEFAULT_MAX_REQUESTS_PER_MINUTE,
        DEFAULT_SESSION_TTL_SECS, KeyBounds,
    },
    oauth::OAuthEndpoints,
    poll::Poller,
    rate_limit::{RateLimitOverride, RateLimitSettings},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "relay_console=info,tower_http=info";

#[derive(Debug, Parser)]
#[command(author, version, about = "Admin control plane for the AI relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the admin HTTP API.
    Serve(ServeArgs),
    /// Issue an API key and print its secret once.
    CreateKey(CreateKeyArgs),
    /// Print the account summary periodically until interrupted.
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
struct ConsoleArgs {
    /// SQLite database path for accounts, keys, sessions and request logs.
    #[arg(long, env = "RELAY_DB_PATH", default_value = "relay_console.db")]
    db_path: String,

    /// Lifetime of an authorization link in seconds.
    #[arg(long, env = "RELAY_SESSION_TTL_SECS", default_value_t = DEFAULT_SESSION_TTL_SECS)]
    session_ttl_secs: i64,

    /// Override the provider's OAuth authorize URL.
    #[arg(long, env = "RELAY_AUTHORIZE_ENDPOINT")]
    authorize_endpoint: Option<String>,

    /// Override the provider's OAuth token URL.
    #[arg(long, env = "RELAY_TOKEN_ENDPOINT")]
    token_endpoint: Option<String>,

    /// Highest requests-per-minute an API key may be given.
    #[arg(long, env = "RELAY_MAX_REQUESTS_PER_MINUTE", default_value_t = DEFAULT_MAX_REQUESTS_PER_MINUTE)]
    max_requests_per_minute: u32,

    /// Longest lifetime an API key may be given, in days.
    #[arg(long, env = "RELAY_MAX_EXPIRES_IN_DAYS", default_value_t = DEFAULT_MAX_EXPIRES_IN_DAYS)]
    max_expires_in_days: i64,
}

impl ConsoleArgs {
    fn config(&self) -> Result<ConsoleConfig, ConsoleError> {
        if self.session_ttl_secs <= 0 {
            return Err(ConsoleError::Validation(
                "session-ttl-secs must be positive".to_string(),
            ));
        }
        let endpoints = OAuthEndpoints::claude().with_endpoints(
            self.authorize_endpoint.as_deref(),
            self.token_endpoint.as_deref(),
        )?;

        Ok(ConsoleConfig {
            session_ttl_secs: self.session_ttl_secs,
            key_bounds: KeyBounds {
                max_requests_per_minute: self.max_requests_per_minute,
                max_expires_in_days: self.max_expires_in_days,
            },
            rate_limit_defaults: RateLimitSettings::default(),
            endpoints,
            clock: Clock::system(),
        })
    }

    async fn open(&self) -> Result<AdminConsole, ConsoleError> {
        AdminConsole::open(&self.db_path, self.config()?).await
    }
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[command(flatten)]
    console: ConsoleArgs,

    /// Address to bind the admin API to.
    #[arg(long, env = "RELAY_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to bind the admin API to.
    #[arg(long, env = "RELAY_PORT", default_value_t = 8080)]
    port: u16,

    /// Bearer token required on every admin endpoint.
    #[arg(long, env = "RELAY_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: String,

    /// Directory holding the built console UI (index.html and assets).
    #[arg(long, env = "RELAY_STATIC_DIR")]
    static_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CreateKeyArgs {
    #[command(flatten)]
    console: ConsoleArgs,

    /// Display name of the key.
    #[arg(long)]
    name: String,

    #[arg(long)]
    description: Option<String>,

    /// Days until the key expires.
    #[arg(long, default_value_t = 30)]
    expires_in_days: i64,

    /// Requests per minute; defaults to the stored rate-limit settings.
    #[arg(long)]
    rate_limit: Option<u32>,

    #[arg(long)]
    tokens_per_day: Option<u64>,

    /// Restrict the key to user agents containing one of these values.
    #[arg(long, value_delimiter = ',')]
    allowed_clients: Vec<String>,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[command(flatten)]
    console: ConsoleArgs,

    /// Seconds between summaries.
    #[arg(long, default_value_t = 30)]
    interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve(args) => run_server(args).await,
        Command::CreateKey(args) => create_key(args).await.map_err(Into::into),
        Command::Watch(args) => watch(args).await.map_err(Into::into),
    };

    if let Err(err) = result {
        error!("{err}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let admin_token = args.admin_token.trim().to_string();
    if admin_token.is_empty() {
        return Err(ConsoleError::Validation("admin token must not be empty".to_string()).into());
    }

    let console = args.console.open().await?;
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let state = server::AppState::new(console, admin_token, args.static_dir);

    server::serve(addr, state).await
}

async fn create_key(args: CreateKeyArgs) -> Result<(), ConsoleError> {
    let console = args.console.open().await?;
    let created = console
        .api_keys()
        .create(NewApiKey {
            name: args.name,
            description: args.description,
            rate_limit: RateLimitOverride {
                requests_per_minute: args.rate_limit,
                tokens_per_day: args.tokens_per_day,
            },
            expires_in_days: args.expires_in_days,
            allowed_clients: args.allowed_clients,
            enabled: true,
        })
        .await?;

    println!("id:     {}", created.key.id);
    println!("name:   {}", created.key.name);
    println!("secret: {}", created.secret);
    println!("This secret is shown once; store it now.");
    Ok(())
}

async fn watch(args: WatchArgs) -> Result<(), ConsoleError> {
    let console = args.console.open().await?;
    let period = Duration::from_secs(args.interval_secs.max(1));
    info!(interval_secs = period.as_secs(), "watching account summary");

    let poller = Poller::spawn(period, move || {
        let console = console.clone();
        async move {
            match console.accounts().summary().await {
                Ok(summary) => println!(
                    "accounts total={} active={} disabled={} expired={} rate_limited={} requests={} tokens={}",
                    summary.total,
                    summary.active,
                    summary.disabled,
                    summary.expired,
                    summary.rate_limited,
                    summary.total_requests,
                    summary.total_tokens
                ),
                Err(err) => error!(error = %err, "failed to load account summary"),
            }
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
    poller.stop();
    Ok(())
}
