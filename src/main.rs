use clap::Parser;
use gorexy::config::{Config, DEFAULT_CONFIG_FILE};
use gorexy::gateway::Gateway;
use gorexy::paths;
use gorexy::{PKG_NAME, VERSION};
use tracing::{error, info, warn};

/// Reverse proxy gateway that launches the services it fronts
#[derive(Parser, Debug)]
#[command(name = "gorexy", version, about)]
struct Cli {
    /// Base port: HTTP listens here, HTTPS on port + 1
    #[arg(long)]
    port: Option<u16>,

    /// Path to the JSON configuration file
    #[arg(long, env = "CONF", default_value = DEFAULT_CONFIG_FILE)]
    conf: String,
}

/// Flags also accepted with a single dash (`-port 9000`, `-conf=x.json`)
const LONG_FLAGS: &[&str] = &["port", "conf", "help", "version"];

fn with_long_flags<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            let single_dash_long = arg
                .strip_prefix('-')
                .filter(|rest| !rest.starts_with('-'))
                .map(|rest| rest.split('=').next().unwrap_or(rest))
                .map_or(false, |name| LONG_FLAGS.contains(&name));
            if i > 0 && single_dash_long {
                format!("-{}", arg)
            } else {
                arg
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_from(with_long_flags(std::env::args()));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gorexy=info".parse()?),
        )
        .init();

    let config_path = paths::normalize(&cli.conf, true);
    let mut config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    config.apply_port_overrides(std::env::var("PORT").ok().as_deref(), cli.port);

    print_startup_banner(&config);

    let mut gateway = Gateway::prepare(&config)?.start().await?;

    tokio::select! {
        result = wait_for_signal() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signals");
            }
        }
        result = gateway.listeners_stopped() => {
            warn!(result = ?result, "Listeners stopped unexpectedly");
        }
    }

    gateway.shutdown().await;

    info!("Server stopped");
    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on unix
async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        http_port = config.https.serves_http().then(|| config.http_port()),
        https_port = config.https.enabled.then(|| config.http_port().wrapping_add(1)),
        services = config.services.len(),
        mappings = config.mappings.len(),
        parallel = config.parallel,
        silent = config.silent,
        "Server configuration"
    );
}
