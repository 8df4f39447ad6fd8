//! The exec engine: runs a command inside an instance with its streams
//! wired over the operation's multiplexed websockets.
//!
//! Interactive execs get one bidirectional data socket (the PTY) plus a
//! control socket for window-resize frames; non-interactive execs get
//! separate stdin/stdout/stderr sockets. Stream order is preserved per
//! socket; nothing is reordered across streams. stderr is additionally
//! captured into a bounded side buffer so a failing command can be
//! reported with context.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{ExecError, IncusError};
use crate::incus::api::{ExecRequest, Operation};
use crate::incus::{Client, OpWebSocket};

/// Cap on the stderr side buffer.
const STDERR_CAPTURE_LIMIT: usize = 4096;
/// Ceiling for joining stream pumps after the operation finished.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What to run and as whom.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    /// Allocate a PTY (one bidirectional data stream).
    pub interactive: bool,
    pub width: u32,
    pub height: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub cwd: Option<String>,
}

impl ExecOptions {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            env: HashMap::new(),
            interactive: false,
            width: 0,
            height: 0,
            uid: None,
            gid: None,
            cwd: None,
        }
    }
}

/// `window-resize` control frame, wire format of the control socket.
#[derive(Serialize)]
struct ControlMsg {
    command: String,
    args: HashMap<String, String>,
}

impl ControlMsg {
    fn window_resize(width: u32, height: u32) -> Self {
        let mut args = HashMap::new();
        args.insert("width".to_string(), width.to_string());
        args.insert("height".to_string(), height.to_string());
        Self {
            command: "window-resize".to_string(),
            args,
        }
    }
}

/// Run a command in `instance`, pumping the given streams.
///
/// Returns the remote exit code. The cancellation token tears down the
/// control reader and all pumps; it is always safe to cancel after this
/// returns.
pub async fn exec<I, O, E>(
    client: &Client,
    instance: &str,
    opts: ExecOptions,
    stdin: I,
    stdout: O,
    stderr: E,
    resize_rx: Option<mpsc::Receiver<(u32, u32)>>,
    cancel: CancellationToken,
) -> Result<i32, ExecError>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    let request = ExecRequest {
        command: opts.argv.clone(),
        environment: opts.env.clone(),
        interactive: opts.interactive,
        width: opts.width,
        height: opts.height,
        user: opts.uid,
        group: opts.gid,
        cwd: opts.cwd.clone(),
        wait_for_websocket: true,
        record_output: false,
    };

    let op = start_exec(client, instance, &request)
        .await
        .map_err(|e| ExecError::Spawn(e.to_string()))?;

    let secret = |fd: &str| {
        op.websocket_secret(fd)
            .ok_or_else(|| ExecError::Spawn(format!("operation exposes no '{fd}' stream")))
    };

    let ws0 = connect_ws(client, &op.id, &secret("0")?).await?;
    let control = connect_ws(client, &op.id, &secret("control")?).await?;

    let stderr_capture: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    // Input pumps are cancelled the moment the operation completes; output
    // pumps get a bounded window to flush whatever the websockets still
    // hold before the hammer comes down.
    let input_cancel = cancel.child_token();
    let mut in_pumps: Vec<JoinHandle<()>> = Vec::new();
    let mut out_pumps: Vec<JoinHandle<()>> = Vec::new();

    if opts.interactive {
        let (sink, stream) = ws0.split();
        in_pumps.push(tokio::spawn(pump_in(stdin, sink, input_cancel.clone())));
        out_pumps.push(tokio::spawn(pump_out(stream, stdout, None, cancel.clone())));
    } else {
        let ws1 = connect_ws(client, &op.id, &secret("1")?).await?;
        let ws2 = connect_ws(client, &op.id, &secret("2")?).await?;
        let (sink, stream0) = ws0.split();
        in_pumps.push(tokio::spawn(pump_in(stdin, sink, input_cancel.clone())));
        in_pumps.push(tokio::spawn(drain_ws(stream0, input_cancel.clone())));
        let (_, stream1) = ws1.split();
        out_pumps.push(tokio::spawn(pump_out(stream1, stdout, None, cancel.clone())));
        let (_, stream2) = ws2.split();
        out_pumps.push(tokio::spawn(pump_out(
            stream2,
            stderr,
            Some(stderr_capture.clone()),
            cancel.clone(),
        )));
    }

    // Control socket: forward resize events, drain inbound frames.
    let (mut control_sink, control_stream) = control.split();
    let control_cancel = input_cancel.clone();
    in_pumps.push(tokio::spawn(drain_ws(control_stream, input_cancel.clone())));
    if let Some(mut resize_rx) = resize_rx {
        in_pumps.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = control_cancel.cancelled() => break,
                    event = resize_rx.recv() => match event {
                        Some((width, height)) => {
                            let msg = ControlMsg::window_resize(width, height);
                            let text = serde_json::to_string(&msg).unwrap_or_default();
                            if control_sink.send(Message::text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }));
    }

    let waited = client.wait_operation(&op.id).await;

    input_cancel.cancel();
    for pump in out_pumps {
        if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
            warn!(instance, "exec output pump did not drain in time");
            cancel.cancel();
        }
    }
    cancel.cancel();
    for pump in in_pumps {
        let _ = tokio::time::timeout(Duration::from_secs(1), pump).await;
    }

    let captured = {
        let buf = stderr_capture.lock().await;
        String::from_utf8_lossy(&buf).trim().to_string()
    };

    match waited {
        Ok(op) => Ok(op.exit_code().unwrap_or(0)),
        Err(e) if captured.is_empty() => Err(ExecError::Stream(e.to_string())),
        Err(e) => Err(ExecError::Remote {
            exit_code: -1,
            stderr: format!("{e}: {captured}"),
        }),
    }
}

/// Captured output of a one-shot, non-interactive exec.
#[derive(Debug)]
pub struct CapturedOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command with no stdin and collect stdout/stderr.
pub async fn capture(
    client: &Client,
    instance: &str,
    argv: Vec<String>,
    uid_gid: Option<(u32, u32)>,
) -> Result<CapturedOutput, IncusError> {
    let mut opts = ExecOptions::new(argv);
    if let Some((uid, gid)) = uid_gid {
        opts.uid = Some(uid);
        opts.gid = Some(gid);
    }
    let (out_w, mut out_r) = tokio::io::duplex(64 * 1024);
    let (err_w, mut err_r) = tokio::io::duplex(64 * 1024);
    let out_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = out_r.read_to_end(&mut buf).await;
        buf
    });
    let err_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = err_r.read_to_end(&mut buf).await;
        buf
    });

    let code = exec(
        client,
        instance,
        opts,
        tokio::io::empty(),
        out_w,
        err_w,
        None,
        CancellationToken::new(),
    )
    .await
    .map_err(|e| IncusError::Operation(e.to_string()))?;

    let stdout = out_task.await.unwrap_or_default();
    let stderr = err_task.await.unwrap_or_default();
    Ok(CapturedOutput {
        exit_code: code,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}

async fn start_exec(
    client: &Client,
    instance: &str,
    request: &ExecRequest,
) -> Result<Operation, IncusError> {
    let path = format!(
        "/1.0/instances/{}/exec?project={}",
        urlencoding::encode(instance),
        urlencoding::encode(client.project())
    );
    let body = serde_json::to_vec(request).map_err(|e| IncusError::Decode(e.to_string()))?;
    let raw = client
        .transport()
        .request("POST", &path, Some(body.into()), &[])
        .await?;
    let envelope: crate::incus::api::Envelope =
        serde_json::from_slice(&raw.body).map_err(|e| IncusError::Decode(e.to_string()))?;
    if envelope.response_type == "error" {
        return Err(IncusError::Api {
            status: if envelope.error_code != 0 {
                envelope.error_code as u16
            } else {
                raw.status
            },
            message: envelope.error,
        });
    }
    serde_json::from_value(envelope.metadata).map_err(|e| IncusError::Decode(e.to_string()))
}

async fn connect_ws(client: &Client, op_id: &str, secret: &str) -> Result<OpWebSocket, ExecError> {
    let path = format!(
        "/1.0/operations/{}/websocket?secret={}",
        urlencoding::encode(op_id),
        urlencoding::encode(secret)
    );
    client
        .transport()
        .websocket(&path)
        .await
        .map_err(|e| ExecError::Stream(e.to_string()))
}

/// Pump a reader into a websocket sink until EOF, then send the empty
/// text frame the remote interprets as end-of-stream.
async fn pump_in<I>(
    mut stdin: I,
    mut sink: SplitSink<OpWebSocket, Message>,
    cancel: CancellationToken,
) where
    I: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = stdin.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    let _ = sink.send(Message::text(String::new())).await;
                    break;
                }
                Ok(n) => {
                    if sink.send(Message::binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// Pump a websocket stream into a writer until the remote signals EOF.
/// An optional capture buffer mirrors the first few KiB (stderr context).
async fn pump_out<O>(
    mut stream: SplitStream<OpWebSocket>,
    mut out: O,
    capture: Option<Arc<Mutex<Vec<u8>>>>,
    cancel: CancellationToken,
) where
    O: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Binary(data))) => {
                if data.is_empty() {
                    break;
                }
                if let Some(capture) = &capture {
                    let mut buf = capture.lock().await;
                    let room = STDERR_CAPTURE_LIMIT.saturating_sub(buf.len());
                    buf.extend_from_slice(&data[..data.len().min(room)]);
                }
                if out.write_all(&data).await.is_err() {
                    break;
                }
                let _ = out.flush().await;
            }
            Some(Ok(Message::Text(text))) if text.is_empty() => break,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("websocket read ended: {e}");
                break;
            }
        }
    }
    let _ = out.shutdown().await;
}

/// Consume and discard frames (unused read side of stdin, control).
async fn drain_ws(mut stream: SplitStream<OpWebSocket>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_msg_wire_format() {
        let msg = ControlMsg::window_resize(120, 40);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["command"], "window-resize");
        assert_eq!(value["args"]["width"], "120");
        assert_eq!(value["args"]["height"], "40");
    }

    #[test]
    fn exec_options_default_to_non_interactive_root() {
        let opts = ExecOptions::new(vec!["id".to_string()]);
        assert!(!opts.interactive);
        assert_eq!(opts.uid, None);
        assert_eq!(opts.width, 0);
    }
}
