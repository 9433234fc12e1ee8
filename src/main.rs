//! Zonelet operator - DNS-management extension for Arbor clusters

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use zonelet::config::Options;
use zonelet::{schema, startup};

/// Zonelet - installs and operates the zone-manager DNS component
#[derive(Parser, Debug)]
#[command(name = "zonelet", version, about, long_about = None)]
struct Cli {
    /// Print the owned CRD manifests as YAML and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    options: Options,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    // This MUST succeed for the operator to talk to the cluster at all.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The operator cannot reach the API server without a working TLS \
             implementation. This may indicate aws-lc-rs was not compiled \
             correctly or another provider was installed first.",
            e
        );
        std::process::exit(1);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML for the owned types
        let manifests = schema::owned_crds()
            .iter()
            .map(|def| serde_yaml::to_string(&def.crd))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{}", manifests.join("---\n"));
        return Ok(());
    }

    let opts = cli.options.complete().map_err(|e| anyhow::anyhow!("{}", e))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(await_termination(shutdown.clone()));

    startup::run(opts, shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))
}

/// Cancel the shutdown token on SIGTERM or Ctrl-C
async fn await_termination(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl-C received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
    shutdown.cancel();
}
