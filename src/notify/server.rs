//! Unix Domain Socket receiver speaking the renderer side of the protocol

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use super::protocol::{self, AppEvent, LENGTH_PREFIX_SIZE};

/// Run the notification listener
///
/// Binds `socket_path` and forwards every decoded frame to `tx` until the
/// receiving end of the channel is dropped.
///
/// # Arguments
/// * `socket_path` - Path to the Unix domain socket
/// * `max_payload` - Largest payload accepted from a sender
/// * `tx` - Channel sender for received events
pub async fn run_listener(
    socket_path: &Path,
    max_payload: usize,
    tx: mpsc::Sender<AppEvent>,
) -> Result<()> {
    let listener = bind(socket_path)?;
    serve(listener, max_payload, tx).await
}

/// Bind the socket, replacing a stale one left behind by an earlier run
pub fn bind(socket_path: &Path) -> Result<UnixListener> {
    // Remove existing socket if present
    if socket_path.exists() {
        std::fs::remove_file(socket_path).context("Failed to remove existing socket")?;
    }

    // Ensure parent directory exists
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind to socket: {}", socket_path.display()))?;

    tracing::info!("Notification listener started at: {}", socket_path.display());
    Ok(listener)
}

/// Accept connections on an already bound listener
pub async fn serve(
    listener: UnixListener,
    max_payload: usize,
    tx: mpsc::Sender<AppEvent>,
) -> Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, max_payload, tx).await {
                            tracing::warn!("Error handling connection: {:#}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                }
            },
            _ = tx.closed() => {
                tracing::debug!("Event receiver dropped, stopping listener");
                return Ok(());
            }
        }
    }
}

/// Read frames until the sender hangs up
///
/// Senders keep their connection open across notifications, so one
/// connection carries any number of frames.
async fn handle_connection(
    mut stream: UnixStream,
    max_payload: usize,
    tx: mpsc::Sender<AppEvent>,
) -> Result<()> {
    loop {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!("Sender disconnected");
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to read message length"),
        }

        let len = protocol::decode_length(len_buf, max_payload)?;
        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .context("Failed to read message body")?;

        let event = protocol::decode_payload(&buf)?;
        tracing::debug!("Received {:?}", event);

        if tx.send(event).await.is_err() {
            // listener is shutting down
            return Ok(());
        }
    }
}
