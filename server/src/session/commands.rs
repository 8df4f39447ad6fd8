//! Pseudo-command sessions selected with a leading `/` in the login:
//! `/shell` (instance-manager REPL), `/explain`, `/remove`.

use std::sync::Arc;

use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use hatchway_core::login::Command;

use crate::session::{exit, fail_channel, finish_channel, LoginFailure, SessionCtx};

pub async fn run(ctx: Arc<SessionCtx>, channel: Channel<Msg>, handle: Handle, command: Command) {
    let id = channel.id();

    // Commands are host-side administration; only root may run them.
    let is_root = ctx.identity.host_user == "root";
    match command {
        Command::Explain => {
            let text = format!("{}\r\n", ctx.identity.explain().replace('\n', "\r\n"));
            let _ = handle.data(id, CryptoVec::from_slice(text.as_bytes())).await;
            finish_channel(&handle, id, 0).await;
        }
        Command::Shell if !is_root => {
            root_only(&handle, id, "shell").await;
        }
        Command::Remove { .. } if !is_root => {
            root_only(&handle, id, "shell").await;
        }
        Command::Shell => repl(ctx, channel, handle).await,
        Command::Remove { force } => remove(ctx, channel, handle, force).await,
    }
}

async fn root_only(handle: &Handle, id: ChannelId, tag: &str) {
    let failure = LoginFailure {
        message: "command requires the root host user".to_string(),
        exit_code: exit::INVALID_LOGIN,
    };
    fail_channel(handle, id, tag, &failure).await;
}

async fn say(handle: &Handle, id: ChannelId, text: &str) {
    let _ = handle.data(id, CryptoVec::from_slice(text.as_bytes())).await;
}

/// Minimal interactive REPL against the local instance manager.
async fn repl(ctx: Arc<SessionCtx>, channel: Channel<Msg>, handle: Handle) {
    let id = channel.id();
    say(
        &handle,
        id,
        "hatchway instance-manager shell; 'help' lists commands\r\n",
    )
    .await;

    let mut reader = BufReader::new(channel.into_stream());
    let mut line = String::new();
    loop {
        say(&handle, id, "hatchway> ").await;
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let mut words = line.split_whitespace();
        match words.next() {
            None => continue,
            Some("exit") | Some("quit") => break,
            Some("help") => {
                say(
                    &handle,
                    id,
                    "commands:\r\n  projects            list projects\r\n  list [project]      list instances\r\n  exit                leave the shell\r\n",
                )
                .await;
            }
            Some("projects") => match ctx.client.list_projects().await {
                Ok(projects) => {
                    for project in projects {
                        say(&handle, id, &format!("{project}\r\n")).await;
                    }
                }
                Err(e) => say(&handle, id, &format!("error: {e}\r\n")).await,
            },
            Some("list") => {
                let mut client = ctx.client.clone();
                if let Some(project) = words.next() {
                    client.use_project(project);
                }
                match client.list_instances().await {
                    Ok(instances) => {
                        for instance in instances {
                            say(
                                &handle,
                                id,
                                &format!("{:<24} {}\r\n", instance.name, instance.status),
                            )
                            .await;
                        }
                    }
                    Err(e) => say(&handle, id, &format!("error: {e}\r\n")).await,
                }
            }
            Some(other) => {
                say(&handle, id, &format!("unknown command: {other}\r\n")).await;
            }
        }
    }
    finish_channel(&handle, id, 0).await;
}

/// Stop and delete an instance, after confirmation unless forced.
async fn remove(ctx: Arc<SessionCtx>, channel: Channel<Msg>, handle: Handle, force: bool) {
    let id = channel.id();
    let instance = ctx.identity.instance.clone();
    let project = ctx.identity.project.clone();

    if !force {
        say(
            &handle,
            id,
            &format!("remove instance {instance}.{project}? [y/N] "),
        )
        .await;
        let mut reader = BufReader::new(channel.into_stream());
        let mut answer = String::new();
        let _ = reader.read_line(&mut answer).await;
        let answer = answer.trim().to_ascii_lowercase();
        if answer != "y" && answer != "yes" {
            say(&handle, id, "aborted\r\n").await;
            finish_channel(&handle, id, 0).await;
            return;
        }
    }

    info!(session = %ctx.session_id, %instance, %project, force, "removing instance");
    if let Err(e) = ctx
        .client
        .update_instance_state(&instance, "stop", force)
        .await
    {
        // Already stopped (or ephemeral and therefore gone) is fine.
        warn!(session = %ctx.session_id, error = %e, "stop before remove failed");
    }
    match ctx.client.delete_instance(&instance).await {
        // Ephemeral instances disappear with the stop.
        Ok(()) | Err(hatchway_core::errors::IncusError::InstanceNotFound(_)) => {
            say(&handle, id, &format!("removed {instance}.{project}\r\n")).await;
            finish_channel(&handle, id, 0).await;
        }
        Err(e) => {
            let failure = LoginFailure::from_incus(e);
            fail_channel(&handle, id, "shell", &failure).await;
        }
    }
}
