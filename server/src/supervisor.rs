//! Process supervision: master-mode forking, the health-check ticker,
//! and the startup sweep of stale proxy devices.

use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::app::Gateway;
use crate::devices::DEVICE_PREFIX;
use crate::server::listen_addr;

/// Environment variables used for the master → child handoff.
pub const ENV_SOCKET_FD: &str = "HATCHWAY_SOCKET_FD";
pub const ENV_ARGS: &str = "HATCHWAY_ARGS";

/// The fd index the accepted socket is placed at in the child.
const CHILD_FD: i32 = 3;

/// Master mode: accept in the parent, serve each connection in a freshly
/// forked child running the same binary.
///
/// The accepted socket is duplicated onto fd 3 and the child re-runs with
/// `HATCHWAY_SOCKET_FD=3` plus the original flags in `HATCHWAY_ARGS`.
/// Children are independent processes: they survive a parent restart, and
/// the parent only reaps them.
pub async fn run_master(gw: Arc<Gateway>) -> anyhow::Result<()> {
    let addr = listen_addr(&gw.config.listen);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(%addr, "master listening");

    let exe = std::env::current_exe().context("cannot resolve own binary")?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args_env = args.join(" ");

    loop {
        let stream = tokio::select! {
            _ = gw.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "handing connection to child");
                    stream
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let std_stream = match stream.into_std() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot detach accepted socket");
                continue;
            }
        };
        if let Err(e) = std_stream.set_nonblocking(false) {
            warn!(error = %e, "cannot reset socket to blocking");
            continue;
        }
        let fd = std_stream.as_raw_fd();

        let mut command = std::process::Command::new(&exe);
        command
            .env(ENV_SOCKET_FD, CHILD_FD.to_string())
            .env(ENV_ARGS, &args_env)
            .stdin(std::process::Stdio::null());
        // Safety: dup2 is async-signal-safe; the child owns fd 3 after exec.
        unsafe {
            command.pre_exec(move || {
                if libc::dup2(fd, CHILD_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        match command.spawn() {
            Ok(mut child) => {
                // The parent's copy of the socket closes here; the child's
                // dup keeps the connection alive. Reap in the background.
                drop(std_stream);
                tokio::task::spawn_blocking(move || {
                    let _ = child.wait();
                });
            }
            Err(e) => {
                warn!(error = %e, "cannot spawn child");
            }
        }
    }
    Ok(())
}

/// Parse the child-mode handoff out of the environment.
///
/// Returns the inherited fd and the original argument list when this
/// process is a master-mode child.
pub fn child_handoff() -> Option<(i32, Vec<String>)> {
    let fd: i32 = std::env::var(ENV_SOCKET_FD).ok()?.parse().ok()?;
    let args = std::env::var(ENV_ARGS)
        .map(|raw| {
            raw.split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Some((fd, args))
}

/// Periodically re-ping the instance manager and log failures.
pub fn spawn_health_check(gw: Arc<Gateway>, interval: Duration) {
    tokio::spawn(async move {
        let client = gw.client();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval = ?interval, "health check enabled");
        loop {
            tokio::select! {
                _ = gw.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = client.ping().await {
                        warn!(error = %e, "instance manager health check failed");
                    } else {
                        debug!("instance manager healthy");
                    }
                }
            }
        }
    });
}

/// Delete proxy devices left behind by a previous crash.
///
/// Walks every project and removes devices whose names carry our prefix.
/// Failures are logged and never fatal.
pub async fn cleanup_stale_devices(gw: &Gateway) {
    let client = gw.client();
    let projects = match client.list_projects().await {
        Ok(projects) => projects,
        Err(e) => {
            warn!(error = %e, "stale device sweep: cannot list projects");
            return;
        }
    };
    for project in projects {
        let mut client = gw.client();
        client.use_project(&project);
        let instances = match client.list_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(%project, error = %e, "stale device sweep: cannot list instances");
                continue;
            }
        };
        for instance in instances {
            let stale: Vec<String> = instance
                .devices
                .keys()
                .filter(|name| name.starts_with(DEVICE_PREFIX))
                .cloned()
                .collect();
            if stale.is_empty() {
                continue;
            }
            info!(
                %project,
                instance = %instance.name,
                count = stale.len(),
                "removing stale proxy devices"
            );
            match client.get_instance_fresh(&instance.name).await {
                Ok((mut fresh, etag)) => {
                    for name in &stale {
                        fresh.devices.remove(name);
                    }
                    if let Err(e) = client.update_instance(&fresh, etag.as_deref()).await {
                        warn!(instance = %instance.name, error = %e, "stale device removal failed");
                    }
                }
                Err(e) => {
                    warn!(instance = %instance.name, error = %e, "stale device sweep: cannot re-read instance");
                }
            }
        }
    }
}
