//! burrow CLI - self-hosted reverse tunnels
//!
//! `burrow serve` runs the relay; `burrow connect` runs an agent that
//! exposes local services through a relay.

use anyhow::{Context, Result};
use burrow_agent::{Agent, AgentConfig, BackoffConfig};
use burrow_server::{AcmeConfig, OidcConfig, Server, ServerConfig};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// burrow - expose local services through a relay you run yourself
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "burrow - self-hosted reverse tunnels")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Management API bind address
        #[arg(long, env = "BURROW_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
        listen_addr: SocketAddr,

        /// Agent-facing tunnel endpoint bind address
        #[arg(long, env = "BURROW_TUNNEL_ADDR", default_value = "0.0.0.0:8443")]
        tunnel_addr: SocketAddr,

        /// HTTP ingress bind address
        #[arg(long, env = "BURROW_HTTP_ADDR", default_value = "0.0.0.0:80")]
        http_addr: SocketAddr,

        /// HTTPS ingress bind address (requires certificates)
        #[arg(long, env = "BURROW_HTTPS_ADDR")]
        https_addr: Option<SocketAddr>,

        /// Persistence directory
        #[arg(long, env = "BURROW_DATA_DIR", default_value = "./data")]
        data_dir: PathBuf,

        /// Public hostname of this relay
        #[arg(long, env = "BURROW_DOMAIN")]
        domain: Option<String>,

        /// Seconds between liveness pings
        #[arg(long, env = "BURROW_PING_INTERVAL", default_value = "30")]
        ping_interval: u64,

        /// Enable automatic certificate issuance
        #[arg(long, env = "BURROW_ACME")]
        acme: bool,

        /// Contact email for certificate issuance
        #[arg(long, env = "BURROW_ACME_EMAIL")]
        acme_email: Option<String>,

        /// Serve TLS with this certificate chain (PEM)
        #[arg(long, env = "BURROW_TLS_CERT")]
        tls_cert: Option<PathBuf>,

        /// Private key for --tls-cert (PEM)
        #[arg(long, env = "BURROW_TLS_KEY")]
        tls_key: Option<PathBuf>,

        /// OIDC issuer URL for management-UI login
        #[arg(long, env = "BURROW_OIDC_ISSUER")]
        oidc_issuer: Option<String>,

        /// OIDC client id
        #[arg(long, env = "BURROW_OIDC_CLIENT_ID")]
        oidc_client_id: Option<String>,

        /// OIDC client secret
        #[arg(long, env = "BURROW_OIDC_CLIENT_SECRET")]
        oidc_client_secret: Option<String>,

        /// OIDC redirect URL
        #[arg(long, env = "BURROW_OIDC_REDIRECT_URL")]
        oidc_redirect_url: Option<String>,
    },

    /// Connect to a relay as an agent
    Connect {
        /// Relay address (host:port)
        #[arg(long, env = "BURROW_SERVER")]
        server: String,

        /// Tunnel token
        #[arg(long, env = "BURROW_TOKEN")]
        token: String,

        /// Use ws:// instead of wss://
        #[arg(long)]
        plaintext: bool,

        /// Skip relay certificate verification (development only)
        #[arg(long)]
        insecure: bool,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,
    },
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            listen_addr,
            tunnel_addr,
            http_addr,
            https_addr,
            data_dir,
            domain,
            ping_interval,
            acme,
            acme_email,
            tls_cert,
            tls_key,
            oidc_issuer,
            oidc_client_id,
            oidc_client_secret,
            oidc_redirect_url,
        } => {
            let config = ServerConfig {
                listen_addr,
                tunnel_addr,
                http_addr: Some(http_addr),
                https_addr,
                data_dir: data_dir.clone(),
                domain,
                ping_interval: Duration::from_secs(ping_interval),
                acme: AcmeConfig {
                    enabled: acme,
                    email: acme_email,
                },
                oidc: OidcConfig {
                    issuer: oidc_issuer,
                    client_id: oidc_client_id,
                    client_secret: oidc_client_secret,
                    redirect_url: oidc_redirect_url,
                },
            };
            config.validate().context("invalid configuration")?;

            std::fs::create_dir_all(&data_dir).with_context(|| {
                format!("failed to create data directory {}", data_dir.display())
            })?;

            let catalog = Arc::new(
                burrow_catalog::SqlCatalog::open(&data_dir)
                    .await
                    .context("failed to open catalog")?,
            );

            let certs: Option<Arc<dyn burrow_ingress::CertProvider>> =
                match (tls_cert.as_deref(), tls_key.as_deref()) {
                    (Some(cert), Some(key)) => Some(Arc::new(
                        burrow_ingress::StaticCertProvider::from_pem_files(cert, key)
                            .context("failed to load tls certificate")?,
                    )),
                    (None, None) => None,
                    _ => anyhow::bail!("--tls-cert and --tls-key must be given together"),
                };

            let server = Server::start(config, catalog, certs)
                .await
                .context("failed to start relay")?;

            info!("relay running; press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            info!("received Ctrl+C, shutting down");

            server.stop().await;
            Ok(())
        }

        Commands::Connect {
            server,
            token,
            plaintext,
            insecure,
            max_reconnect_attempts,
        } => {
            let mut config = AgentConfig::new(server.clone(), token);
            config.plaintext = plaintext;
            config.insecure = insecure;
            config.backoff = BackoffConfig {
                max_attempts: (max_reconnect_attempts > 0).then_some(max_reconnect_attempts),
                ..BackoffConfig::default()
            };

            info!("connecting to relay at {server}");
            let agent = Agent::new(config);
            let stop = agent.shutdown_token();

            let run = tokio::spawn(async move { agent.run().await });

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received Ctrl+C, shutting down");
                    stop.cancel();
                }
                result = run => {
                    match result {
                        Ok(Ok(())) => info!("agent stopped"),
                        Ok(Err(e)) => {
                            error!("agent failed: {e:#}");
                            return Err(e.into());
                        }
                        Err(e) => {
                            error!("agent task panicked: {e}");
                            return Err(e.into());
                        }
                    }
                }
            }

            Ok(())
        }
    }
}
