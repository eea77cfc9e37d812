// src/core/endpoint/listener.rs

//! Accepts client connections on the AF_UNIX socket (spec §6) and bridges
//! each one into the single-owner event loop, in the teacher's
//! `connection/handler.rs` per-connection-task style: one task per
//! socket, `Framed` over a custom codec, forwarding parsed commands
//! into a shared channel and callbacks back out.

use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::protocol::ClientCodec;
use crate::core::daemon::InboundClientMessage;
use crate::core::endpoint::{ClientCallback, ClientId};

/// Binds `socket_path` (removing any stale file left by a prior run) and
/// spawns the accept loop. Returns immediately; the accept loop and every
/// per-connection task run in the background.
pub async fn serve(socket_path: impl AsRef<Path>, inbound: mpsc::UnboundedSender<InboundClientMessage>) -> std::io::Result<()> {
    let socket_path = socket_path.as_ref().to_path_buf();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&socket_path)?;

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let inbound = inbound.clone();
                    tokio::spawn(handle_connection(stream, inbound));
                }
                Err(e) => {
                    warn!(error = %e, "client listener accept failed");
                }
            }
        }
    });

    Ok(())
}

async fn handle_connection(stream: UnixStream, inbound: mpsc::UnboundedSender<InboundClientMessage>) {
    let mut framed = Framed::new(stream, ClientCodec);
    let (callback_tx, mut callback_rx) = mpsc::unbounded_channel::<ClientCallback>();
    let (assigned_id_tx, assigned_id_rx) = tokio::sync::oneshot::channel();

    if inbound
        .send(InboundClientMessage::Connected { tx: callback_tx, assigned_id: assigned_id_tx })
        .is_err()
    {
        return;
    }

    let client_id: ClientId = match assigned_id_rx.await {
        Ok(id) => id,
        Err(_) => return,
    };

    loop {
        tokio::select! {
            biased;

            maybe_callback = callback_rx.recv() => {
                match maybe_callback {
                    Some(callback) => {
                        if framed.send(callback).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            maybe_frame = framed.next() => {
                match maybe_frame {
                    Some(Ok(command)) => {
                        let _ = inbound.send(InboundClientMessage::Command { client: client_id, command });
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "client sent a malformed line, dropping connection");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let _ = inbound.send(InboundClientMessage::Disconnected { client: client_id });
}
