use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rls_gateway::api::{AppState, OperationRegistry, create_router};
use rls_gateway::cleanup::spawn_cleanup_task;
use rls_gateway::config::resolve_config_path;
use rls_gateway::{ExchangeConfig, GatewayConfig, IdentityConfig, TokenValidator};

/// How long in-use pools get to finish when the server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "rls-gateway")]
#[command(about = "Per-user row-level-security gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        #[command(flatten)]
        config: ConfigArgs,
        /// Bind address, e.g. 0.0.0.0:8080
        #[arg(long, env = "RLS_GATEWAY_BIND", default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Validate a bearer token and print the identity it carries
    ValidateToken {
        #[command(flatten)]
        config: ConfigArgs,
        /// The token (without the `Bearer ` prefix)
        #[arg(env = "RLS_GATEWAY_TOKEN")]
        token: String,
    },
    /// Print the effective configuration (secrets omitted)
    ShowConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Args)]
struct ConfigArgs {
    /// JSON config file (default: RLS_GATEWAY_CONFIG, XDG config dir, ./rls-gateway.json)
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long, env = "RLS_GATEWAY_TENANT_ID")]
    tenant_id: Option<String>,
    #[arg(long, env = "RLS_GATEWAY_CLIENT_ID")]
    client_id: Option<String>,
    #[arg(long, env = "RLS_GATEWAY_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,
    /// Scope requested for the database, e.g. https://db.example.com/.default
    #[arg(long, env = "RLS_GATEWAY_DOWNSTREAM_SCOPE")]
    downstream_scope: Option<String>,
    #[arg(long, env = "RLS_GATEWAY_AUDIENCE")]
    audience: Option<String>,
    #[arg(long, env = "RLS_GATEWAY_LEGACY_AUDIENCE")]
    legacy_audience: Option<String>,
    #[arg(long, env = "SURREALDB_URL")]
    db_url: Option<String>,
    #[arg(long, env = "RLS_GATEWAY_ENFORCE_AUTH")]
    enforce_auth: Option<bool>,
    #[arg(long, env = "RLS_GATEWAY_MAX_USERS")]
    max_concurrent_users: Option<usize>,
    #[arg(long, env = "RLS_GATEWAY_IDLE_TIMEOUT_SECONDS")]
    idle_timeout_seconds: Option<u64>,
}

impl ConfigArgs {
    /// File config (if any) with flag / env overrides applied on top.
    fn load(self) -> Result<GatewayConfig> {
        let path = self.config.clone().or_else(resolve_config_path);

        let mut config = match &path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                GatewayConfig::from_file(path)?
            }
            None => {
                let (Some(tenant_id), Some(client_id), Some(scope)) = (
                    self.tenant_id.clone(),
                    self.client_id.clone(),
                    self.downstream_scope.clone(),
                ) else {
                    anyhow::bail!(
                        "No config file found; --tenant-id, --client-id and --downstream-scope are required"
                    );
                };
                GatewayConfig::new(
                    IdentityConfig::new(tenant_id, client_id),
                    ExchangeConfig::new(scope),
                )
            }
        };

        if let Some(v) = self.tenant_id {
            config.identity.tenant_id = v;
        }
        if let Some(v) = self.client_id {
            config.identity.client_id = v;
        }
        if let Some(v) = self.client_secret {
            config.identity.client_secret = Some(v);
        }
        if let Some(v) = self.downstream_scope {
            config.exchange.downstream_scope = v;
        }
        if let Some(v) = self.audience {
            config.identity.audience = Some(v);
        }
        if let Some(v) = self.legacy_audience {
            config.identity.legacy_audience = Some(v);
        }
        if let Some(v) = self.db_url {
            config.database.url = v;
        }
        if let Some(v) = self.enforce_auth {
            config.enforce_auth = v;
        }
        if let Some(v) = self.max_concurrent_users {
            config.pool.max_concurrent_users = v;
        }
        if let Some(v) = self.idle_timeout_seconds {
            config.pool.idle_timeout_seconds = v;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("rls_gateway=info".parse()?)
                .add_directive("audit=info".parse()?)
                .add_directive("surrealdb=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, bind } => {
            let config = config.load()?;
            if !config.enforce_auth {
                warn!(
                    "Auth enforcement is disabled: requests without a valid token run anonymously outside row-level security"
                );
            }

            let gateway = rls_gateway::create_gateway(&config)?;
            let cleanup = spawn_cleanup_task(
                gateway.pools().clone(),
                gateway.exchange().clone(),
                config.pool.cleanup_interval(),
            );

            let app = create_router(AppState::new(
                gateway.clone(),
                OperationRegistry::with_builtins(),
            ));

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!(
                "Gateway listening on http://{} (database {}, max {} concurrent users)",
                bind, config.database.url, config.pool.max_concurrent_users
            );

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Failed to listen for shutdown signal: {}", e);
                    }
                    info!("Shutdown signal received");
                })
                .await?;

            cleanup.abort();
            let closed = gateway.pools().shutdown(SHUTDOWN_GRACE).await;
            info!("Closed {} connection pools, bye", closed);
        }
        Commands::ValidateToken { config, token } => {
            let config = config.load()?;
            let validator = TokenValidator::new(&config.identity)?;

            match validator.validate(token.trim()).await {
                Ok(identity) => {
                    println!("{}", serde_json::to_string_pretty(&identity.summary())?);
                }
                Err(e) => {
                    println!("Token rejected [{}]: {}", e.code(), e);
                    std::process::exit(1);
                }
            }
        }
        Commands::ShowConfig { config } => {
            let config = config.load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!();
            println!("  JWKS URL:    {}", config.identity.jwks_url());
            println!("  Token URL:   {}", config.token_url());
            println!("  Issuers:     {}", config.identity.accepted_issuers().join(", "));
            println!("  Audiences:   {}", config.identity.accepted_audiences().join(", "));
        }
    }

    Ok(())
}
