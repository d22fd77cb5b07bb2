//! Control channel between a running `daemon` and the `status`/`peers`
//! introspection commands of a separate CLI invocation.
//!
//! A tiny line-oriented protocol over a Unix domain socket: the client
//! writes one command word, the daemon writes back the formatted reply and
//! closes the connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::delegate::TerminalDelegate;

/// Serve `STATUS`/`PEERS` queries against `delegate` until the process
/// exits. Spawned as a background task by the `daemon` command.
///
/// # Errors
///
/// Returns an error if the socket path can't be bound (e.g. a stale socket
/// from a previous run still exists and isn't ours to remove).
pub async fn serve(socket_path: &Path, delegate: Arc<TerminalDelegate>) -> anyhow::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(path = %socket_path.display(), "control channel listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let delegate = Arc::clone(&delegate);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &delegate).await {
                tracing::warn!("control channel connection error: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    delegate: &TerminalDelegate,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Some(command) = lines.next_line().await? else {
        return Ok(());
    };

    let reply = match command.trim() {
        "STATUS" => render_status(delegate),
        "PEERS" => render_peers(delegate),
        other => format!("unknown command: {other}\n"),
    };

    write_half.write_all(reply.as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}

fn render_status(delegate: &TerminalDelegate) -> String {
    format!("connected peers: {}\n", delegate.connected_count())
}

fn render_peers(delegate: &TerminalDelegate) -> String {
    let peers = delegate.peer_snapshot();
    if peers.is_empty() {
        return "no peers seen yet\n".to_string();
    }
    let mut out = String::new();
    for (peer_id, info) in peers {
        let fp = info
            .fingerprint
            .map(|f| f.to_hex())
            .unwrap_or_else(|| "unbound".to_string());
        out.push_str(&format!(
            "{}  {}  fingerprint={fp}\n",
            peer_id.to_hex(),
            if info.connected { "connected" } else { "disconnected" },
        ));
    }
    out
}

/// Send `command` to the daemon listening on `socket_path` and return its
/// reply.
///
/// # Errors
///
/// Returns an error if no daemon is listening on `socket_path`, or the
/// connection drops before a reply arrives.
pub async fn query(socket_path: &PathBuf, command: &str) -> anyhow::Result<String> {
    let stream = UnixStream::connect(socket_path).await.map_err(|e| {
        anyhow::anyhow!(
            "couldn't reach daemon at {}: {e} (is `bitchat daemon` running?)",
            socket_path.display()
        )
    })?;
    let (read_half, mut write_half) = stream.into_split();

    write_half.write_all(command.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.shutdown().await?;

    let mut reply = String::new();
    let mut reader = BufReader::new(read_half);
    tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut reply).await?;
    Ok(reply)
}
