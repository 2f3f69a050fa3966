//! Task-per-connection dispatcher on the tokio runtime.
//!
//! Every client gets a reader task and a writer task. The registry holds a
//! bounded sender into each writer; a broadcast only enqueues, so a slow
//! peer fills its own queue and is evicted instead of stalling anyone else.

use crate::broadcast::Message;
use crate::config::Config;
use crate::error::RelayError;
use crate::registry::{Peer, SharedRegistry};
use crate::runtime::{is_transient_accept_error, RelayStats};
use crate::session::{label_for, IdAllocator, Inbound, SessionId};
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Registry entry: the queue feeding one client's writer task.
struct ChannelPeer {
    id: SessionId,
    tx: mpsc::Sender<Bytes>,
    /// Signalled when the peer is evicted, to stop its reader.
    closed: Arc<Notify>,
}

impl Peer for ChannelPeer {
    fn id(&self) -> SessionId {
        self.id
    }

    fn deliver(&mut self, line: &Bytes) -> io::Result<()> {
        self.tx.try_send(line.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "outbound queue full")
            }
            mpsc::error::TrySendError::Closed(_) => {
                io::Error::new(io::ErrorKind::BrokenPipe, "writer gone")
            }
        })
    }

    fn close(&mut self) {
        self.closed.notify_one();
    }
}

/// Accept connections forever, spawning reader and writer tasks per client.
pub async fn serve(
    listener: std::net::TcpListener,
    config: Config,
    stats: Arc<RelayStats>,
) -> Result<(), RelayError> {
    listener.set_nonblocking(true).map_err(RelayError::Listener)?;
    let listener = TcpListener::from_std(listener).map_err(RelayError::Listener)?;
    let registry = Arc::new(SharedRegistry::new());
    let ids = IdAllocator::new();

    info!(
        addr = %listener.local_addr().map_err(RelayError::Listener)?,
        max_connections = config.max_connections,
        outbound_queue = config.outbound_queue,
        "Starting tokio dispatcher"
    );

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(ref e) if is_transient_accept_error(e) => continue,
            Err(e) => {
                error!(error = %e, "Accept failed");
                return Err(RelayError::Listener(e));
            }
        };

        let id = ids.next_id();
        let label = label_for(id, Some(peer_addr));
        let (tx, rx) = mpsc::channel(config.outbound_queue);
        let closed = Arc::new(Notify::new());
        let peer = ChannelPeer {
            id,
            tx,
            closed: Arc::clone(&closed),
        };

        stats.session_opened();
        if let Err((_, reason)) = registry.register_bounded(peer, config.max_connections) {
            stats.session_closed();
            stats.connection_rejected();
            match reason {
                None => warn!(session = %label, "Connection limit reached"),
                Some(e) => error!(session = %label, error = %e, "Registration failed"),
            }
            continue;
        }
        info!(session = %label, online = stats.online(), "Client connected");

        let (reader, writer) = stream.into_split();
        tokio::spawn(async move {
            if let Err(e) = write_lines(writer, rx).await {
                debug!(session = %id, error = %e, "Writer stopped");
            }
        });

        let inbound = Inbound::new(id, label, config.max_line_length);
        tokio::spawn(read_session(
            reader,
            inbound,
            closed,
            Arc::clone(&registry),
            Arc::clone(&stats),
            config.read_buffer_size,
        ));
    }
}

/// Drain queued lines onto the socket until every sender is dropped.
async fn write_lines<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(&line).await?;
    }
    writer.shutdown().await
}

/// The CONNECTED loop for one client, then its teardown.
async fn read_session<R>(
    mut reader: R,
    mut inbound: Inbound,
    closed: Arc<Notify>,
    registry: Arc<SharedRegistry<ChannelPeer>>,
    stats: Arc<RelayStats>,
    buffer_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(buffer_size);

    while inbound.is_connected() {
        buffer.clear();
        let read = tokio::select! {
            _ = closed.notified() => break,
            read = reader.read_buf(&mut buffer) => read,
        };

        match read {
            Ok(0) => inbound.begin_close(),
            Ok(_) => {
                let batch = inbound.absorb(&buffer);
                for message in &batch.messages {
                    relay(&registry, &stats, message);
                }
                if let Some(e) = batch.error {
                    debug!(session = %inbound.label(), error = %e, "Session error");
                    break;
                }
            }
            Err(e) => {
                debug!(session = %inbound.label(), error = %e, "Session error");
                break;
            }
        }
    }

    if registry.unregister(inbound.id()) {
        stats.session_closed();
    }
    inbound.mark_closed();
    info!(session = %inbound.label(), "Client disconnected");
}

fn relay(registry: &SharedRegistry<ChannelPeer>, stats: &RelayStats, message: &Message) {
    let report = registry.broadcast(message);
    stats.record_broadcast(message, &report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::bind_listener;
    use crate::testing::{wait_for_online, TestClient};
    use std::net::SocketAddr;
    use std::time::Duration;

    fn start(config: Config) -> (SocketAddr, Arc<RelayStats>) {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 64, true).unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(RelayStats::default());
        let server_stats = Arc::clone(&stats);
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(serve(listener, config, server_stats))
        });
        (addr, stats)
    }

    #[tokio::test]
    async fn test_write_lines_in_order() {
        let mock = tokio_test::io::Builder::new()
            .write(b"client[1]: a\n")
            .write(b"client[1]: b\n")
            .build();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Bytes::from_static(b"client[1]: a\n")).await.unwrap();
        tx.send(Bytes::from_static(b"client[1]: b\n")).await.unwrap();
        drop(tx);

        write_lines(mock, rx).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_is_a_failed_delivery() {
        let (tx, _rx) = mpsc::channel(1);
        let mut peer = ChannelPeer {
            id: SessionId::new(1),
            tx,
            closed: Arc::new(Notify::new()),
        };
        let line = Bytes::from_static(b"x\n");
        peer.deliver(&line).unwrap();
        let err = peer.deliver(&line).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[tokio::test]
    async fn test_reader_relays_and_stops_at_quit() {
        let registry = Arc::new(SharedRegistry::new());
        let stats = Arc::new(RelayStats::default());

        let (tx, mut rx) = mpsc::channel(8);
        registry
            .register(ChannelPeer {
                id: SessionId::new(2),
                tx,
                closed: Arc::new(Notify::new()),
            })
            .unwrap_or_else(|_| panic!("register"));

        let reader = tokio_test::io::Builder::new()
            .read(b"hel")
            .read(b"lo\nquit\nignored\n")
            .build();
        let inbound = Inbound::new(SessionId::new(1), "client[1]".into(), 64);
        read_session(
            reader,
            inbound,
            Arc::new(Notify::new()),
            Arc::clone(&registry),
            Arc::clone(&stats),
            64,
        )
        .await;

        assert_eq!(&rx.recv().await.unwrap()[..], b"client[1]: hello\n");
        assert_eq!(&rx.recv().await.unwrap()[..], b"client[1]: quit\n");
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.messages(), 2);
    }

    #[test]
    fn test_end_to_end_fan_out() {
        let (addr, stats) = start(Config::default());
        let mut a = TestClient::connect(addr);
        let mut b = TestClient::connect(addr);
        let mut c = TestClient::connect(addr);
        wait_for_online(&stats, 3);

        b.send("from b");
        assert_eq!(a.recv(), format!("{}: from b", b.label()));
        assert_eq!(c.recv(), format!("{}: from b", b.label()));

        b.send("quit");
        assert_eq!(a.recv(), format!("{}: quit", b.label()));
        assert_eq!(c.recv(), format!("{}: quit", b.label()));
        b.expect_closed();
        wait_for_online(&stats, 2);

        a.send("");
        assert_eq!(c.recv(), format!("{}: ", a.label()));
        a.expect_silence(Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_dead_peer_evicted_while_others_receive() {
        let registry = Arc::new(SharedRegistry::new());
        let stats = Arc::new(RelayStats::default());

        let (live_tx, mut live_rx) = mpsc::channel(8);
        let (dead_tx, dead_rx) = mpsc::channel(8);
        drop(dead_rx);
        let dead_closed = Arc::new(Notify::new());
        for peer in [
            ChannelPeer {
                id: SessionId::new(2),
                tx: live_tx,
                closed: Arc::new(Notify::new()),
            },
            ChannelPeer {
                id: SessionId::new(3),
                tx: dead_tx,
                closed: Arc::clone(&dead_closed),
            },
        ] {
            stats.session_opened();
            registry.register(peer).unwrap_or_else(|_| panic!("register"));
        }

        let reader = tokio_test::io::Builder::new()
            .read(b"one\n")
            .read(b"two\n")
            .build();
        let inbound = Inbound::new(SessionId::new(1), "client[1]".into(), 64);
        read_session(
            reader,
            inbound,
            Arc::new(Notify::new()),
            Arc::clone(&registry),
            Arc::clone(&stats),
            64,
        )
        .await;

        assert_eq!(&live_rx.recv().await.unwrap()[..], b"client[1]: one\n");
        assert_eq!(&live_rx.recv().await.unwrap()[..], b"client[1]: two\n");
        tokio::time::timeout(Duration::from_secs(1), dead_closed.notified())
            .await
            .expect("evicted reader was not signalled");

        // The dead peer's own teardown finds it already gone.
        assert!(!registry.unregister(SessionId::new(3)));
        assert_eq!(stats.evicted(), 1);
        assert_eq!(stats.online(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_reader_relays_lines_before_invalid_utf8() {
        let registry = Arc::new(SharedRegistry::new());
        let stats = Arc::new(RelayStats::default());

        let (tx, mut rx) = mpsc::channel(8);
        registry
            .register(ChannelPeer {
                id: SessionId::new(2),
                tx,
                closed: Arc::new(Notify::new()),
            })
            .unwrap_or_else(|_| panic!("register"));

        let reader = tokio_test::io::Builder::new()
            .read(b"good\n\xff\nlost\n")
            .build();
        let inbound = Inbound::new(SessionId::new(1), "client[1]".into(), 64);
        read_session(
            reader,
            inbound,
            Arc::new(Notify::new()),
            Arc::clone(&registry),
            Arc::clone(&stats),
            64,
        )
        .await;

        assert_eq!(&rx.recv().await.unwrap()[..], b"client[1]: good\n");
        assert!(rx.try_recv().is_err());
    }
}
