use craproxy::config::{Config, HostKind};
use craproxy::host::{DevHost, OrderedHost, StackHost};
use craproxy::{FallbackProxy, PKG_NAME, VERSION};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "craproxy.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("craproxy=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config()?;
    print_startup_banner(&config);

    let addr = listen_addr(&config)?;
    let root = config.static_root(&config.proxy.base_dir);
    let hmr_path = config.server.hmr_path().map(str::to_string);
    let plugin = FallbackProxy::new(config.proxy.clone());

    let server = match config.server.host {
        HostKind::Ordered => {
            let mut host = OrderedHost::new(root, hmr_path);
            install(&plugin, &mut host);
            host.bind(addr).await?
        }
        HostKind::Stack => {
            let mut host = StackHost::new(root, hmr_path);
            install(&plugin, &mut host);
            host.bind(addr).await?
        }
    };

    info!(addr = %server.local_addr(), "Ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    let _ = shutdown_tx.send(true);

    server_task.await??;
    info!("Shutdown complete");
    Ok(())
}

/// Config from the first argument, else `craproxy.toml` if present, else defaults
fn load_config() -> anyhow::Result<Config> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let path = match explicit {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG).exists() => PathBuf::from(DEFAULT_CONFIG),
        None => {
            info!("No configuration file, using defaults");
            return Ok(Config::default());
        }
    };

    let config = Config::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

fn listen_addr(config: &Config) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = config
        .server
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {:?}: {}", config.server.bind, e))?;
    Ok(SocketAddr::new(ip, config.server.port))
}

/// Run the plugin; a fatal misconfiguration ends the process
fn install<H: DevHost>(plugin: &FallbackProxy, host: &mut H) {
    if let Err(e) = plugin.setup(host) {
        // Already reported through the host logger
        std::process::exit(e.exit_code());
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting dev server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        host = ?config.server.host,
        root = %config.server.root.display(),
        hmr_path = config.server.hmr_path(),
        "Server configuration"
    );
    info!(
        manifest = %config.proxy.manifest_path().display(),
        target = config.proxy.target.as_deref(),
        ws = config.proxy.ws,
        secure = config.proxy.secure,
        xfwd = config.proxy.xfwd,
        change_origin = config.proxy.change_origin,
        "Proxy options"
    );
}
