use tokio::sync::broadcast;
use vigil_core::wire::Envelope;

/// Buffered envelopes per subscriber before the oldest are dropped. The
/// medium is at-most-once by contract, so lagging receivers lose messages
/// rather than applying backpressure.
pub const BUS_CAPACITY: usize = 256;

/// The shared broadcast medium connecting all peers of one coordination
/// group. `publish` is fire-and-forget: no acknowledgment, no ordering
/// across peers, no delivery guarantee. The medium may echo a peer's own
/// envelopes back; receivers must drop envelopes carrying their own peer id.
pub trait ChannelBus: Send + Sync {
    fn publish(&self, envelope: Envelope);
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}

/// One in-process coordination group. Every [`LoopbackBus`] joined from the
/// same group sees every publish, its own included.
#[derive(Clone)]
pub struct LoopbackGroup {
    tx: broadcast::Sender<Envelope>,
}

impl LoopbackGroup {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn join(&self) -> LoopbackBus {
        LoopbackBus {
            tx: self.tx.clone(),
        }
    }
}

impl Default for LoopbackGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct LoopbackBus {
    tx: broadcast::Sender<Envelope>,
}

impl ChannelBus for LoopbackBus {
    fn publish(&self, envelope: Envelope) {
        // no receivers is not an error on a broadcast medium
        let _ = self.tx.send(envelope);
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

#[cfg(unix)]
pub use uds::UdsBus;

#[cfg(unix)]
mod uds {
    use super::{ChannelBus, BUS_CAPACITY};
    use std::io;
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::sync::{broadcast, mpsc};
    use tokio::time::timeout;
    use tracing::debug;
    use vigil_core::wire::{decode_frame, encode_frame, Envelope, DEFAULT_MAX_FRAME_BYTES};

    const OUTBOX_CAPACITY: usize = 64;
    const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

    /// ChannelBus over a Unix socket connection to the hub relay daemon.
    /// The relay forwards every frame to all other connections; this client
    /// just moves frames. Any transport error silently ends the connection
    /// (the medium makes no delivery promises anyway).
    pub struct UdsBus {
        outbox: mpsc::Sender<Envelope>,
        fanout: broadcast::Sender<Envelope>,
    }

    impl UdsBus {
        pub async fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
            let stream = UnixStream::connect(path.as_ref()).await?;
            let (read_half, mut write_half) = stream.into_split();
            let (outbox, mut outbox_rx) = mpsc::channel::<Envelope>(OUTBOX_CAPACITY);
            let (fanout, _) = broadcast::channel(BUS_CAPACITY);

            tokio::spawn(async move {
                while let Some(envelope) = outbox_rx.recv().await {
                    let frame = match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
                        Ok(frame) => frame,
                        Err(err) => {
                            debug!(event = "bus_encode_failed", error = %err);
                            continue;
                        }
                    };
                    match timeout(WRITE_TIMEOUT, write_half.write_all(&frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            debug!(event = "bus_write_failed", error = %err);
                            break;
                        }
                        Err(_) => {
                            debug!(event = "bus_write_timeout");
                            break;
                        }
                    }
                }
            });

            let reader_fanout = fanout.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(read_half);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(_) => {
                            match decode_frame::<Envelope>(
                                line.as_bytes(),
                                DEFAULT_MAX_FRAME_BYTES,
                            ) {
                                Ok(envelope) => {
                                    let _ = reader_fanout.send(envelope);
                                }
                                Err(err) => {
                                    debug!(event = "bus_frame_invalid", error = %err);
                                }
                            }
                        }
                        Err(err) => {
                            debug!(event = "bus_read_failed", error = %err);
                            break;
                        }
                    }
                }
            });

            Ok(Self { outbox, fanout })
        }
    }

    impl ChannelBus for UdsBus {
        fn publish(&self, envelope: Envelope) {
            // fire-and-forget: a full outbox or dead connection drops the
            // message, which the medium's contract allows
            let _ = self.outbox.try_send(envelope);
        }

        fn subscribe(&self) -> broadcast::Receiver<Envelope> {
            self.fanout.subscribe()
        }
    }
}
