//! Interactive shell and exec sessions.
//!
//! One task per `session` channel: validates the login, optionally creates
//! the instance, wires the channel into the exec engine (PTY or plain),
//! handles agent forwarding through a transient socket device, persistent
//! multiplexer sessions, and the welcome banner.

use std::collections::HashMap;
use std::sync::Arc;

use russh::server::{Handle, Msg};
use russh::{Channel, ChannelMsg, CryptoVec};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hatchway_core::command::build_argv;
use hatchway_core::errors::IncusError;
use hatchway_core::incus::exec::{self, ExecOptions};
use hatchway_core::config::ShellPolicy;
use hatchway_core::instance_user::InstanceUser;

use crate::banner::{self, BannerContext};
use crate::session::{commands, exit, fail_channel, finish_channel, LoginFailure, SessionCtx};

/// Everything collected from channel requests before shell/exec.
#[derive(Debug, Default, Clone)]
pub struct ChannelSetup {
    pub env: HashMap<String, String>,
    pub pty: Option<PtyParams>,
    pub agent: bool,
}

#[derive(Debug, Clone)]
pub struct PtyParams {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// Entry point for `shell` and `exec` requests.
pub async fn run(
    ctx: Arc<SessionCtx>,
    channel: Channel<Msg>,
    handle: Handle,
    setup: ChannelSetup,
    raw_command: Option<String>,
    resize_rx: mpsc::Receiver<(u32, u32)>,
) {
    let id = channel.id();

    if let Some(command) = ctx.identity.command {
        commands::run(ctx, channel, handle, command).await;
        return;
    }

    if ctx.identity.create_instance {
        if let Err(failure) = ensure_instance(&ctx, &handle, id).await {
            fail_channel(&handle, id, "shell", &failure).await;
            return;
        }
    }

    let user = match ctx.validate_login().await {
        Ok(user) => user,
        Err(failure) => {
            fail_channel(&handle, id, "shell", &failure).await;
            return;
        }
    };

    let shell = if user.shell.is_empty() {
        "/bin/sh".to_string()
    } else {
        user.shell.clone()
    };

    let mut env: HashMap<String, String> = setup.env.clone();
    env.insert("USER".to_string(), user.user.clone());
    env.insert("HOME".to_string(), user.home_dir.clone());
    env.insert("SHELL".to_string(), shell.clone());
    env.insert("SSH_SESSION".to_string(), ctx.session_id.clone());
    if let Some(pty) = &setup.pty {
        env.insert("TERM".to_string(), pty.term.clone());
    }

    // Agent forwarding: host-side listener bridged to the client, exposed
    // inside the instance through a socket proxy device.
    let mut agent_device = None;
    if setup.agent {
        match start_agent_forward(&ctx, &handle, &user).await {
            Ok((device, sock_path)) => {
                env.insert("SSH_AUTH_SOCK".to_string(), sock_path);
                agent_device = Some(device);
            }
            Err(e) => {
                warn!(session = %ctx.session_id, error = %e, "agent forwarding unavailable");
            }
        }
    }

    let (argv, uid_gid) = build_session_argv(
        ctx.gw.config.shell,
        ctx.peer,
        &user,
        &shell,
        raw_command.as_deref(),
    );

    let (argv, uid_gid) = if ctx.identity.persistent {
        match multiplexer_argv(&ctx, &user).await {
            Ok(argv) => (argv, Some((user.uid, user.gid))),
            Err(failure) => {
                fail_channel(&handle, id, "shell", &failure).await;
                return;
            }
        }
    } else {
        (argv, uid_gid)
    };

    if setup.pty.is_some() && raw_command.is_none() {
        if let Some(template) = &ctx.gw.banner {
            let text = banner::render(
                template,
                &BannerContext {
                    instance_user: &user.user,
                    instance: &ctx.identity.instance,
                    project: &ctx.identity.project,
                    remote: &ctx.identity.remote,
                    hostname: &ctx.gw.hostname,
                },
            );
            let text = text.replace('\n', "\r\n");
            let _ = handle.data(id, CryptoVec::from_slice(text.as_bytes())).await;
        }
    }

    let mut opts = ExecOptions::new(argv);
    opts.env = env;
    opts.cwd = Some(user.home_dir.clone());
    if let Some((uid, gid)) = uid_gid {
        opts.uid = Some(uid);
        opts.gid = Some(gid);
    }
    if let Some(pty) = &setup.pty {
        opts.interactive = true;
        opts.width = pty.cols;
        opts.height = pty.rows;
    }

    info!(
        session = %ctx.session_id,
        instance = %ctx.identity.instance,
        project = %ctx.identity.project,
        user = %user.user,
        key = ctx.identity.public_key.as_deref().unwrap_or("-"),
        pty = opts.interactive,
        "starting session"
    );

    let cancel = ctx.cancel.child_token();
    let (stdin, stdout, stderr) = channel_streams(channel, cancel.clone());

    let result = exec::exec(
        &ctx.client,
        &ctx.identity.instance,
        opts,
        stdin,
        stdout,
        stderr,
        Some(resize_rx),
        cancel.clone(),
    )
    .await;

    cancel.cancel();
    if let Some(device) = agent_device {
        if let Err(e) = device.shutdown().await {
            warn!(session = %ctx.session_id, error = %e, "agent device teardown failed");
        }
        ctx.gw.registry().remove(&device.id);
    }

    match result {
        Ok(code) => {
            debug!(session = %ctx.session_id, code, "session finished");
            finish_channel(&handle, id, code.max(0) as u32).await;
        }
        Err(e) => {
            warn!(session = %ctx.session_id, error = %e, "session failed");
            let failure = LoginFailure {
                message: "session failed".to_string(),
                exit_code: exit::INTERNAL,
            };
            fail_channel(&handle, id, "shell", &failure).await;
        }
    }
}

/// Build the argv for the session per policy and raw command.
///
/// Raw commands run as the instance user; `su`/`login` policies hand the
/// privilege switch to the in-instance tool and therefore exec as root.
fn build_session_argv(
    policy: ShellPolicy,
    peer: Option<std::net::SocketAddr>,
    user: &InstanceUser,
    shell: &str,
    raw: Option<&str>,
) -> (Vec<String>, Option<(u32, u32)>) {
    if let Some(raw) = raw {
        if let Some(argv) = build_argv(raw, shell) {
            return (argv, Some((user.uid, user.gid)));
        }
    }
    match policy {
        ShellPolicy::Su => (
            vec!["su".to_string(), "-".to_string(), user.user.clone()],
            None,
        ),
        ShellPolicy::Login => {
            let host = peer
                .map(|p| p.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            (
                vec![
                    "login".to_string(),
                    "-h".to_string(),
                    host,
                    "-f".to_string(),
                    user.user.clone(),
                ],
                None,
            )
        }
        ShellPolicy::Default => (
            vec![shell.to_string(), "-l".to_string()],
            Some((user.uid, user.gid)),
        ),
    }
}

/// Ensure the multiplexer exists, the named session exists, and return
/// the attach argv.
async fn multiplexer_argv(
    ctx: &SessionCtx,
    user: &InstanceUser,
) -> Result<Vec<String>, LoginFailure> {
    let mux = ctx.gw.config.multiplexer.clone();
    let instance = &ctx.identity.instance;
    let probe = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("command -v {mux}"),
    ];
    let installed = exec::capture(&ctx.client, instance, probe, None)
        .await
        .map(|out| out.exit_code == 0)
        .unwrap_or(false);
    if !installed {
        info!(session = %ctx.session_id, instance, multiplexer = %mux, "installing multiplexer");
        if let Err(e) = ctx.client.install_package(instance, &mux).await {
            return Err(LoginFailure {
                message: format!("cannot install {mux}"),
                exit_code: exit::INTERNAL,
            }
            .logged(&e));
        }
    }

    if mux == "screen" {
        return Ok(vec![
            "screen".to_string(),
            "-d".to_string(),
            "-R".to_string(),
            "hatchway".to_string(),
        ]);
    }

    let uid_gid = Some((user.uid, user.gid));
    let has_session = vec![
        "tmux".to_string(),
        "has-session".to_string(),
        "-t".to_string(),
        "hatchway".to_string(),
    ];
    let exists = exec::capture(&ctx.client, instance, has_session, uid_gid)
        .await
        .map(|out| out.exit_code == 0)
        .unwrap_or(false);
    if !exists {
        let new_session = vec![
            "tmux".to_string(),
            "new-session".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            "hatchway".to_string(),
        ];
        if let Err(e) = exec::capture(&ctx.client, instance, new_session, uid_gid).await {
            return Err(LoginFailure {
                message: "cannot create multiplexer session".to_string(),
                exit_code: exit::INTERNAL,
            }
            .logged(&e));
        }
    }
    Ok(vec![
        "tmux".to_string(),
        "attach-session".to_string(),
        "-t".to_string(),
        "hatchway".to_string(),
    ])
}

impl LoginFailure {
    fn logged(self, e: &dyn std::fmt::Display) -> Self {
        warn!(error = %e, "{}", self.message);
        self
    }
}

/// Create the instance when absent; print a notice when it exists but an
/// ephemeral create was requested.
async fn ensure_instance(
    ctx: &SessionCtx,
    handle: &Handle,
    id: russh::ChannelId,
) -> Result<(), LoginFailure> {
    if !ctx.gw.config.allow_create {
        return Err(LoginFailure {
            message: "instance creation is disabled".to_string(),
            exit_code: exit::INVALID_LOGIN,
        });
    }
    match ctx.client.get_instance(&ctx.identity.instance).await {
        Ok(_) => {
            if ctx.identity.ephemeral_hint {
                let note = format!(
                    "instance {} already exists, ignoring ephemeral request\r\n",
                    ctx.identity.instance
                );
                let _ = handle.data(id, CryptoVec::from_slice(note.as_bytes())).await;
            }
            Ok(())
        }
        Err(IncusError::InstanceNotFound(_)) => {
            let note = format!("creating instance {}...\r\n", ctx.identity.instance);
            let _ = handle.data(id, CryptoVec::from_slice(note.as_bytes())).await;

            let mut spec = ctx.identity.create_spec.clone();
            if ctx.identity.ephemeral_hint && spec.ephemeral.is_none() {
                spec.ephemeral = Some(true);
            }
            let (template, template_image) = match &ctx.gw.create_config {
                Some(config) => (
                    config.merged(&spec.profiles).map_err(|e| LoginFailure {
                        message: format!("create config: {e}"),
                        exit_code: exit::META,
                    })?,
                    config.image.clone(),
                ),
                None => (Default::default(), String::new()),
            };
            ctx.client
                .create_instance(
                    &ctx.identity.instance,
                    &spec,
                    &template,
                    &template_image,
                    Some(&ctx.identity.instance_user),
                )
                .await
                .map_err(|e| LoginFailure {
                    message: format!("instance creation failed: {e}"),
                    exit_code: exit::BACKEND,
                })
        }
        Err(e) => Err(LoginFailure::from_incus(e)),
    }
}

/// Host-side agent listener plus the in-instance socket device.
///
/// Each connection arriving through the device is bridged onto a fresh
/// `auth-agent@openssh.com` channel back to the SSH client.
async fn start_agent_forward(
    ctx: &SessionCtx,
    handle: &Handle,
    user: &InstanceUser,
) -> anyhow::Result<(Arc<crate::devices::ProxyDevice>, String)> {
    let dir = tempfile_dir(&ctx.session_id)?;
    let sock_path = dir.join("agent.sock");
    let listener = tokio::net::UnixListener::bind(&sock_path)?;

    let device = ctx
        .gw
        .devices
        .add_socket(
            &ctx.client,
            &ctx.identity.instance,
            &sock_path,
            user.uid,
            user.gid,
        )
        .await?;
    ctx.adopt_device(device.clone()).await;

    let in_instance = device.target.clone();
    let handle = handle.clone();
    let cancel = ctx.cancel.child_token();
    let session = ctx.session_id.clone();
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, _) = match accepted {
                Ok(pair) => pair,
                Err(_) => break,
            };
            let agent_channel = match handle.channel_open_agent().await {
                Ok(channel) => channel,
                Err(e) => {
                    debug!(session = %session, error = %e, "client refused agent channel");
                    continue;
                }
            };
            tokio::spawn(async move {
                let mut stream = stream;
                let mut chan_stream = agent_channel.into_stream();
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut chan_stream).await;
            });
        }
    });

    Ok((device, in_instance))
}

fn tempfile_dir(session: &str) -> std::io::Result<std::path::PathBuf> {
    use rand::Rng;
    let salt: u32 = rand::thread_rng().gen_range(0..1_000_000);
    let dir = std::env::temp_dir().join(format!("hatchway-agent-{session}-{salt}"));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Split a session channel into engine-facing streams.
///
/// The returned reader yields client stdin; the writers send stdout and
/// stderr frames. A pump task owns the channel and closes the reader on
/// client EOF.
pub fn channel_streams(
    channel: Channel<Msg>,
    cancel: CancellationToken,
) -> (
    tokio::io::ReadHalf<tokio::io::DuplexStream>,
    impl tokio::io::AsyncWrite + Unpin + Send + 'static,
    impl tokio::io::AsyncWrite + Unpin + Send + 'static,
) {
    let stdout = channel.make_writer();
    let stderr = channel.make_writer_ext(Some(1));
    let (host, engine) = tokio::io::duplex(32 * 1024);
    let (engine_r, _engine_w) = tokio::io::split(engine);
    let (_host_r, mut host_w) = tokio::io::split(host);

    tokio::spawn(async move {
        let mut channel = channel;
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = channel.wait() => msg,
            };
            match msg {
                Some(ChannelMsg::Data { data }) => {
                    if host_w.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
        let _ = host_w.shutdown().await;
    });

    (engine_r, stdout, stderr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev_user() -> InstanceUser {
        InstanceUser {
            user: "dev".to_string(),
            uid: 1000,
            gid: 1000,
            home_dir: "/home/dev".to_string(),
            shell: "/bin/bash".to_string(),
            raw: String::new(),
        }
    }

    #[test]
    fn empty_command_default_policy_runs_login_shell() {
        let (argv, uid_gid) =
            build_session_argv(ShellPolicy::Default, None, &dev_user(), "/bin/bash", None);
        assert_eq!(argv, vec!["/bin/bash", "-l"]);
        assert_eq!(uid_gid, Some((1000, 1000)));
    }

    #[test]
    fn su_policy_runs_su_as_root() {
        let (argv, uid_gid) =
            build_session_argv(ShellPolicy::Su, None, &dev_user(), "/bin/bash", None);
        assert_eq!(argv, vec!["su", "-", "dev"]);
        assert_eq!(uid_gid, None);
    }

    #[test]
    fn login_policy_carries_the_peer_host() {
        let peer = "203.0.113.9:50000".parse().ok();
        let (argv, uid_gid) =
            build_session_argv(ShellPolicy::Login, peer, &dev_user(), "/bin/bash", None);
        assert_eq!(argv, vec!["login", "-h", "203.0.113.9", "-f", "dev"]);
        assert_eq!(uid_gid, None);
    }

    #[test]
    fn raw_command_with_metacharacters_is_shell_wrapped() {
        let (argv, uid_gid) = build_session_argv(
            ShellPolicy::Default,
            None,
            &dev_user(),
            "/bin/bash",
            Some("ls | wc -l"),
        );
        assert_eq!(argv, vec!["/bin/bash", "-c", "ls | wc -l"]);
        assert_eq!(uid_gid, Some((1000, 1000)));
    }

    #[test]
    fn plain_raw_command_is_split() {
        let (argv, _) = build_session_argv(
            ShellPolicy::Default,
            None,
            &dev_user(),
            "/bin/bash",
            Some("uname -r"),
        );
        assert_eq!(argv, vec!["uname", "-r"]);
    }

    #[test]
    fn blank_raw_command_falls_back_to_policy() {
        let (argv, _) = build_session_argv(
            ShellPolicy::Default,
            None,
            &dev_user(),
            "/bin/bash",
            Some("   "),
        );
        assert_eq!(argv, vec!["/bin/bash", "-l"]);
    }
}
