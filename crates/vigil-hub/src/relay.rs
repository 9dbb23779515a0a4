use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub socket_path: PathBuf,
    pub queue_capacity: usize,
    pub write_timeout: Duration,
}

#[cfg(not(unix))]
pub async fn run(_config: RelayConfig, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
    let _ = shutdown.changed().await;
    Ok(())
}

/// Broadcast relay over a Unix socket: every valid NDJSON frame received
/// from one connection is forwarded, unmodified, to every other connection.
/// The relay keeps no state and understands nothing about the frames beyond
/// their validity; it stands in for a dumb shared broadcast medium, so all
/// coordination logic stays in the peers. Forwarding is fire-and-forget: a
/// slow receiver's queue overflows and drops, never backpressures a sender.
#[cfg(unix)]
pub async fn run(config: RelayConfig, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use tokio::net::UnixListener;
    use tracing::{info, warn};

    if let Some(parent) = config.socket_path.parent() {
        fs::create_dir_all(parent)?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }

    if config.socket_path.exists() {
        let _ = fs::remove_file(&config.socket_path);
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    let _ = fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600));

    let relay = Arc::new(unix::Relay::new(config.clone()));

    info!(
        event = "relay_start",
        socket = %config.socket_path.display(),
        queue_capacity = config.queue_capacity
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let relay = relay.clone();
                        tokio::spawn(async move {
                            relay.handle_connection(stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "relay_accept_error", error = %err);
                    }
                }
            }
        }
    }

    let _ = fs::remove_file(&config.socket_path);
    info!(event = "relay_stop", socket = %config.socket_path.display());
    Ok(())
}

#[cfg(unix)]
mod unix {
    use super::RelayConfig;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::sync::{mpsc, RwLock};
    use tokio::time::timeout;
    use tracing::{debug, info, warn};
    use vigil_core::wire::{decode_frame, Envelope, DEFAULT_MAX_FRAME_BYTES};

    pub struct Relay {
        config: RelayConfig,
        conn_counter: AtomicU64,
        peers: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    }

    impl Relay {
        pub fn new(config: RelayConfig) -> Self {
            Self {
                config,
                conn_counter: AtomicU64::new(0),
                peers: RwLock::new(HashMap::new()),
            }
        }

        fn next_conn_id(&self) -> String {
            let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
            format!("conn-{id}")
        }

        pub async fn handle_connection(&self, stream: UnixStream) {
            let conn_id = self.next_conn_id();
            let (read_half, mut write_half) = stream.into_split();
            let (outbox_tx, mut outbox_rx) = mpsc::channel::<Vec<u8>>(self.config.queue_capacity);

            self.peers
                .write()
                .await
                .insert(conn_id.clone(), outbox_tx);
            info!(event = "relay_peer_connected", conn_id = %conn_id);

            let write_timeout = self.config.write_timeout;
            let writer_conn = conn_id.clone();
            let writer = tokio::spawn(async move {
                while let Some(frame) = outbox_rx.recv().await {
                    match timeout(write_timeout, write_half.write_all(&frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            debug!(event = "relay_write_failed", conn_id = %writer_conn, error = %err);
                            break;
                        }
                        Err(_) => {
                            debug!(event = "relay_write_timeout", conn_id = %writer_conn);
                            break;
                        }
                    }
                }
            });

            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        // validate only; forward the original bytes verbatim
                        match decode_frame::<Envelope>(line.as_bytes(), DEFAULT_MAX_FRAME_BYTES) {
                            Ok(envelope) => {
                                debug!(
                                    event = "relay_forward",
                                    conn_id = %conn_id,
                                    peer_id = %envelope.peer_id,
                                    kind = envelope.msg.kind()
                                );
                                self.forward(&conn_id, line.as_bytes()).await;
                            }
                            Err(err) => {
                                warn!(event = "relay_frame_invalid", conn_id = %conn_id, error = %err);
                            }
                        }
                    }
                    Err(err) => {
                        debug!(event = "relay_read_failed", conn_id = %conn_id, error = %err);
                        break;
                    }
                }
            }

            self.peers.write().await.remove(&conn_id);
            writer.abort();
            info!(event = "relay_peer_disconnected", conn_id = %conn_id);
        }

        /// Sends a frame to every connection except its origin. `try_send`
        /// keeps the relay lossy instead of slow: a full outbox drops.
        async fn forward(&self, from: &str, frame: &[u8]) {
            let peers = self.peers.read().await;
            for (conn_id, outbox) in peers.iter() {
                if conn_id == from {
                    continue;
                }
                if let Err(err) = outbox.try_send(frame.to_vec()) {
                    debug!(event = "relay_drop", conn_id = %conn_id, reason = %err);
                }
            }
        }
    }
}
