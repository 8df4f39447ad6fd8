mod app;
mod auth;
mod banner;
mod devices;
mod guestbin;
mod handler;
mod registry;
mod server;
mod session;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hatchway_core::config::ServerConfig;

use crate::app::Gateway;
use crate::server::VERSION;

const DEFAULT_CONFIG_PATH: &str = "/etc/hatchway/config.yaml";

fn print_usage() {
    eprintln!("Usage: hatchway [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>   Configuration file (default: {DEFAULT_CONFIG_PATH})");
    eprintln!("  --listen <addr>   Listen address, overrides the config file");
    eprintln!("  --master          Fork one child per connection");
    eprintln!("  --version         Print version and exit");
    eprintln!("  --help            Print this help message");
}

#[derive(Debug, Default, Clone)]
struct Flags {
    config: Option<String>,
    listen: Option<String>,
    master: bool,
}

fn parse_flags(args: &[String]) -> Result<Flags, String> {
    let mut flags = Flags::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                flags.config = Some(
                    iter.next()
                        .ok_or_else(|| "--config requires a path".to_string())?
                        .clone(),
                );
            }
            "--listen" => {
                flags.listen = Some(
                    iter.next()
                        .ok_or_else(|| "--listen requires an address".to_string())?
                        .clone(),
                );
            }
            "--master" => flags.master = true,
            other => return Err(format!("unknown option: {other}")),
        }
    }
    Ok(flags)
}

/// Load the config file and fold the flag overrides in.
fn load_config(flags: &Flags) -> anyhow::Result<(ServerConfig, Option<PathBuf>)> {
    let path = flags
        .config
        .clone()
        .or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            default.exists().then(|| DEFAULT_CONFIG_PATH.to_string())
        })
        .map(PathBuf::from);
    let mut config = match &path {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = &flags.listen {
        config.listen = listen.clone();
    }
    if flags.master {
        config.master = true;
    }
    Ok((config, path))
}

/// Where the host key lives: configured dir, else beside the config file,
/// else the user config dir.
fn hostkey_dir(config: &ServerConfig, config_path: Option<&PathBuf>) -> PathBuf {
    if !config.hostkey_dir.is_empty() {
        return PathBuf::from(shellexpand::tilde(&config.hostkey_dir).into_owned());
    }
    if let Some(path) = config_path {
        if let Some(parent) = path.parent() {
            return parent.to_path_buf();
        }
    }
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hatchway")
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel the gateway's shutdown token on SIGINT/SIGTERM.
fn setup_shutdown_signal(gw: Arc<Gateway>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "cannot register SIGTERM handler");
                let _ = ctrl_c.await;
                gw.shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, initiating shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
        }
        gw.shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Master-mode children find their socket and flags in the environment.
    if let Some((fd, args)) = supervisor::child_handoff() {
        init_tracing();
        let flags = parse_flags(&args).map_err(anyhow::Error::msg)?;
        let (config, config_path) = load_config(&flags)?;
        let key_dir = hostkey_dir(&config, config_path.as_ref());
        let host_key = server::load_or_generate_host_key(&key_dir)?;
        let gw = Gateway::new(config)?;
        setup_shutdown_signal(gw.clone());
        return server::run_single(gw, host_key, fd).await;
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version") {
        println!("hatchway {VERSION}");
        return Ok(());
    }
    if args.iter().any(|a| a == "--help") {
        print_usage();
        return Ok(());
    }
    let flags = match parse_flags(&args) {
        Ok(flags) => flags,
        Err(e) => {
            eprintln!("{e}");
            print_usage();
            std::process::exit(1);
        }
    };

    init_tracing();
    info!("hatchway {VERSION} starting");

    let (config, config_path) = load_config(&flags)?;
    let key_dir = hostkey_dir(&config, config_path.as_ref());
    let host_key = server::load_or_generate_host_key(&key_dir)?;
    let master = config.master;
    let healthcheck = config.healthcheck.clone();
    let gw = Gateway::new(config)?;

    // A dead backend in daemon mode would silently break every login.
    match gw.client().ping().await {
        Ok(()) => info!("instance manager reachable"),
        Err(e) if master => warn!(error = %e, "instance manager unreachable at startup"),
        Err(e) => {
            anyhow::bail!("instance manager unreachable: {e}");
        }
    }

    supervisor::cleanup_stale_devices(&gw).await;

    if !healthcheck.is_empty() {
        match humantime::parse_duration(&healthcheck) {
            Ok(interval) => supervisor::spawn_health_check(gw.clone(), interval),
            Err(e) => warn!(value = %healthcheck, error = %e, "invalid healthcheck interval"),
        }
    }

    setup_shutdown_signal(gw.clone());

    if master {
        supervisor::run_master(gw).await
    } else {
        server::run_daemon(gw, host_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let args = vec![
            "--config".to_string(),
            "/tmp/c.yaml".to_string(),
            "--master".to_string(),
        ];
        let flags = parse_flags(&args).unwrap();
        assert_eq!(flags.config.as_deref(), Some("/tmp/c.yaml"));
        assert!(flags.master);
        assert!(flags.listen.is_none());
    }

    #[test]
    fn rejects_unknown_flags() {
        let args = vec!["--frob".to_string()];
        assert!(parse_flags(&args).is_err());
    }

    #[test]
    fn flag_overrides_win() {
        let flags = Flags {
            config: None,
            listen: Some(":2022".to_string()),
            master: true,
        };
        let (config, _) = load_config(&flags).unwrap();
        assert_eq!(config.listen, ":2022");
        assert!(config.master);
    }
}
