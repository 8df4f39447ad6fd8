//! The `sftp` subsystem: runs the embedded SFTP server inside the
//! instance with its stdio wired to the SSH channel.
//!
//! The helper binary is uploaded at most once per instance and version
//! (md5-keyed existence probe backed by the positive file cache).

use std::collections::HashMap;
use std::sync::Arc;

use russh::server::{Handle, Msg};
use russh::Channel;
use tracing::{info, warn};

use hatchway_core::incus::exec::{self, ExecOptions};
use hatchway_core::incus::files;

use crate::guestbin::GuestTool;
use crate::session::{exit, fail_channel, finish_channel, LoginFailure, SessionCtx};

pub async fn run(ctx: Arc<SessionCtx>, channel: Channel<Msg>, handle: Handle) {
    let id = channel.id();

    let user = match ctx.validate_login().await {
        Ok(user) => user,
        Err(failure) => {
            fail_channel(&handle, id, "sftp", &failure).await;
            return;
        }
    };

    let instance = match ctx.client.get_instance(&ctx.identity.instance).await {
        Ok(instance) => instance,
        Err(e) => {
            fail_channel(&handle, id, "sftp", &LoginFailure::from_incus(e)).await;
            return;
        }
    };

    let binary = match ctx.gw.guest.resolve(GuestTool::Sftp, instance.arch()) {
        Ok(binary) => binary,
        Err(e) => {
            warn!(session = %ctx.session_id, error = %e, "no sftp helper for instance");
            let failure = LoginFailure {
                message: format!("unsupported architecture: {}", instance.arch()),
                exit_code: exit::ARCH,
            };
            fail_channel(&handle, id, "sftp", &failure).await;
            return;
        }
    };

    let remote_path = GuestTool::Sftp.remote_path();
    match files::file_exists(&ctx.client, &ctx.identity.instance, remote_path, &binary.md5_hex)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            info!(
                session = %ctx.session_id,
                instance = %ctx.identity.instance,
                arch = %binary.arch,
                path = remote_path,
                "uploading sftp helper"
            );
            if let Err(e) = files::push_file(
                &ctx.client,
                &ctx.identity.instance,
                remote_path,
                binary.bytes.clone(),
                0,
                0,
                0o755,
            )
            .await
            {
                warn!(session = %ctx.session_id, error = %e, "sftp helper upload failed");
                let failure = LoginFailure {
                    message: "cannot install sftp helper".to_string(),
                    exit_code: exit::INTERNAL,
                };
                fail_channel(&handle, id, "sftp", &failure).await;
                return;
            }
        }
        Err(e) => {
            fail_channel(&handle, id, "sftp", &LoginFailure::from_incus(e)).await;
            return;
        }
    }

    let mut argv = vec![
        remote_path.to_string(),
        "-e".to_string(),
        "-d".to_string(),
        user.home_dir.clone(),
    ];
    if ctx.gw.config.chroot_sftp && user.uid != 0 {
        argv.push("-c".to_string());
    }

    let mut env = HashMap::new();
    env.insert("USER".to_string(), user.user.clone());
    env.insert("UID".to_string(), user.uid.to_string());
    env.insert("GID".to_string(), user.gid.to_string());
    env.insert("HOME".to_string(), user.home_dir.clone());
    env.insert("SSH_SESSION".to_string(), ctx.session_id.clone());

    let mut opts = ExecOptions::new(argv);
    opts.env = env;

    info!(
        session = %ctx.session_id,
        instance = %ctx.identity.instance,
        user = %user.user,
        "starting sftp"
    );

    let cancel = ctx.cancel.child_token();
    let (stdin, stdout, stderr) = super::shell::channel_streams(channel, cancel.clone());

    let result = exec::exec(
        &ctx.client,
        &ctx.identity.instance,
        opts,
        stdin,
        stdout,
        stderr,
        None,
        cancel.clone(),
    )
    .await;
    cancel.cancel();

    match result {
        Ok(code) => finish_channel(&handle, id, code.max(0) as u32).await,
        Err(e) => {
            warn!(session = %ctx.session_id, error = %e, "sftp session failed");
            let failure = LoginFailure {
                message: "sftp failed".to_string(),
                exit_code: exit::INTERNAL,
            };
            fail_channel(&handle, id, "sftp", &failure).await;
        }
    }
}
