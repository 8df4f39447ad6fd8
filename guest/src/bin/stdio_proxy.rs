//! Bridge a TCP connection to stdin/stdout.
//!
//! Runs inside an instance so the connection originates from the
//! instance's network namespace: `hatchway-stdio-proxy tcp:<host>:<port>`.

use anyhow::Context;
use tokio::net::TcpStream;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let target = std::env::args()
        .nth(1)
        .context("usage: hatchway-stdio-proxy tcp:<host>:<port>")?;
    let addr = target
        .strip_prefix("tcp:")
        .context("only tcp:<host>:<port> targets are supported")?;

    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("cannot connect to {addr}"))?;
    let (mut tcp_read, mut tcp_write) = stream.into_split();

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    // Either direction ending tears the bridge down.
    tokio::select! {
        _ = tokio::io::copy(&mut stdin, &mut tcp_write) => {}
        _ = tokio::io::copy(&mut tcp_read, &mut stdout) => {}
    }
    Ok(())
}
