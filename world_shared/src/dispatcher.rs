//! Dispatcher client.
//!
//! Wraps one physical connection to the dispatcher process with logical
//! continuity across reconnects:
//! - A maintain task connects with a fixed retry delay, fires the
//!   delegate's connected callback (`is_reconnect` is false only the first
//!   time), then reads frames until the connection dies.
//! - The current connection handle sits behind an `RwLock`; senders only
//!   ever see a fully-constructed handle or none at all.
//! - Sends from any task are queued to a writer task that batches into a
//!   `BufWriter` and flushes on a timer ("auto-flush") or on `flush()`.
//!
//! In-flight queued frames at the moment of a disconnect are lost; senders
//! that need delivery across reconnects must re-announce at the delegate's
//! connected callback (services do exactly that).

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::packet::{Packet, PacketPool};
use crate::proto::{read_frame, write_frame, MsgType};

/// Fixed delay between (re)connect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Writer flush cadence when no explicit flush is requested.
pub const AUTO_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Receives connection lifecycle events and inbound frames.
///
/// `on_dispatcher_packet` is awaited by the single receive task; a slow
/// delegate (e.g. a full bounded queue) back-pressures the connection
/// instead of dropping messages.
#[async_trait]
pub trait DispatcherDelegate: Send + Sync + 'static {
    async fn on_dispatcher_connected(&self, is_reconnect: bool);
    async fn on_dispatcher_packet(&self, msg_type: MsgType, pkt: Packet);
    async fn on_dispatcher_disconnected(&self);
}

enum WriterCmd {
    Frame(MsgType, Packet),
    Flush,
}

/// A live connection's send queue.
pub struct ConnHandle {
    tx: mpsc::UnboundedSender<WriterCmd>,
}

/// Reconnecting client holding one logical dispatcher connection.
pub struct DispatcherClient {
    addr: String,
    pool: PacketPool,
    current: RwLock<Option<Arc<ConnHandle>>>,
}

impl DispatcherClient {
    pub fn new(addr: &str, pool: PacketPool) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.to_string(),
            pool,
            current: RwLock::new(None),
        })
    }

    /// Spawns the maintain task. Call once.
    pub fn start(self: &Arc<Self>, delegate: Arc<dyn DispatcherDelegate>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.maintain(delegate).await;
        });
    }

    pub fn is_connected(&self) -> bool {
        self.current
            .read()
            .expect("dispatcher conn lock poisoned")
            .is_some()
    }

    /// Blocks until a live connection exists and returns its handle.
    pub async fn assure_connected(&self) -> Arc<ConnHandle> {
        loop {
            let cur = self
                .current
                .read()
                .expect("dispatcher conn lock poisoned")
                .clone();
            if let Some(conn) = cur {
                return conn;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// Queues one frame, waiting for a connection if necessary.
    ///
    /// Ordering holds per caller; cross-caller ordering is not guaranteed.
    pub async fn send(&self, msg_type: MsgType, pkt: Packet) {
        let mut pkt = Some(pkt);
        loop {
            let conn = self.assure_connected().await;
            match conn.tx.send(WriterCmd::Frame(msg_type, pkt.take().expect("packet moved"))) {
                Ok(()) => return,
                Err(mpsc::error::SendError(WriterCmd::Frame(_, p))) => {
                    // Writer died under us; wait for the next connection.
                    pkt = Some(p);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
                Err(_) => return,
            }
        }
    }

    /// Requests an immediate flush of queued frames.
    pub fn flush(&self) {
        let cur = self
            .current
            .read()
            .expect("dispatcher conn lock poisoned")
            .clone();
        if let Some(conn) = cur {
            let _ = conn.tx.send(WriterCmd::Flush);
        }
    }

    /// Checked out of this client's pool; append fields then `send`.
    pub fn new_packet(&self) -> Packet {
        self.pool.get()
    }

    async fn maintain(&self, delegate: Arc<dyn DispatcherDelegate>) {
        let mut connected_before = false;
        loop {
            let stream = match TcpStream::connect(&self.addr).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(addr = %self.addr, error = %e, "dispatcher connect failed, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let (read_half, write_half) = stream.into_split();

            let (tx, rx) = mpsc::unbounded_channel();
            let writer = tokio::spawn(writer_loop(write_half, rx));

            {
                let mut cur = self.current.write().expect("dispatcher conn lock poisoned");
                *cur = Some(Arc::new(ConnHandle { tx }));
            }
            info!(addr = %self.addr, reconnect = connected_before, "dispatcher connected");
            delegate.on_dispatcher_connected(connected_before).await;
            connected_before = true;

            let mut reader = BufReader::new(read_half);
            loop {
                match read_frame(&mut reader, &self.pool).await {
                    Ok((msg_type, pkt)) => delegate.on_dispatcher_packet(msg_type, pkt).await,
                    Err(e) => {
                        warn!(addr = %self.addr, error = %e, "dispatcher read failed");
                        break;
                    }
                }
            }

            {
                let mut cur = self.current.write().expect("dispatcher conn lock poisoned");
                *cur = None;
            }
            writer.abort();
            delegate.on_dispatcher_disconnected().await;
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

async fn writer_loop(write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<WriterCmd>) {
    let mut w = BufWriter::new(write_half);
    let mut flush_tick = tokio::time::interval(AUTO_FLUSH_INTERVAL);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(WriterCmd::Frame(msg_type, pkt)) => {
                    if let Err(e) = write_frame(&mut w, msg_type, pkt).await {
                        warn!(error = %e, "dispatcher write failed");
                        return;
                    }
                }
                Some(WriterCmd::Flush) => {
                    if w.flush().await.is_err() {
                        return;
                    }
                }
                None => {
                    let _ = w.flush().await;
                    return;
                }
            },
            _ = flush_tick.tick() => {
                if w.flush().await.is_err() {
                    return;
                }
            }
        }
    }
}
