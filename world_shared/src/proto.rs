//! Wire protocol: framing and message types.
//!
//! Every connection carries a stream of length-prefixed frames:
//!
//! ```text
//! [u32 LE size][u16 LE msgtype][payload bytes]
//! ```
//!
//! `size` covers the msgtype field plus the payload. Payload layout is
//! positional per message type (see `packet`). An oversized or truncated
//! frame is a fatal protocol error: the caller must close the connection.

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::packet::{Packet, PacketPool};

/// Message type discriminator carried in every frame header.
pub type MsgType = u16;

/// Hard cap on one frame's payload.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

const TYPE_FIELD_LEN: usize = 2;

// ─── Server-to-server control messages ───
pub const MT_INVALID: MsgType = 0;
/// Call a method on an entity (server origin). [entityid][method][args]
pub const MT_CALL_ENTITY_METHOD: MsgType = 1;
/// Call a method on an entity on behalf of a client. [clientid][entityid][method][args]
pub const MT_CALL_ENTITY_METHOD_FROM_CLIENT: MsgType = 2;
/// Create an entity on any game process. [typename]
pub const MT_CREATE_ENTITY_ANYWHERE: MsgType = 3;
/// Load a persisted entity on any game process. [typename][entityid]
pub const MT_LOAD_ENTITY_ANYWHERE: MsgType = 4;
/// Announce a service entity. [entityid][service]
pub const MT_DECLARE_SERVICE: MsgType = 5;
/// Withdraw a service entity. [entityid][service]
pub const MT_UNDECLARE_SERVICE: MsgType = 6;
/// A client connected to a gate. [clientid]
pub const MT_NOTIFY_CLIENT_CONNECTED: MsgType = 7;
/// A client disconnected from its gate. [clientid]
pub const MT_NOTIFY_CLIENT_DISCONNECTED: MsgType = 8;
/// Barrier: every expected server process is connected.
pub const MT_NOTIFY_ALL_SERVERS_CONNECTED: MsgType = 9;

// ─── Gate service range ───
// Everything in [MT_GATE_MSG_START, MT_GATE_MSG_END] is handled by gates.
pub const MT_GATE_MSG_START: MsgType = 1000;
/// Set one filter property for a client. [clientid][key][value]
pub const MT_GATE_SET_CLIENT_FILTER_PROP: MsgType = 1001;
/// Clear one filter property for a client. [clientid][key]
pub const MT_GATE_CLEAR_CLIENT_FILTER_PROP: MsgType = 1002;
/// Broadcast to clients whose filter prop falls in a range.
/// [key][lo][hi][client msgtype][payload...]
pub const MT_GATE_CALL_FILTERED_CLIENTS: MsgType = 1003;

// Sub-range relayed verbatim to one client proxy; first field is always
// the target [clientid].
pub const MT_REDIRECT_TO_CLIENT_START: MsgType = 1100;
/// [clientid][entityid][typename][x][y][z]
pub const MT_CREATE_ENTITY_ON_CLIENT: MsgType = 1101;
/// [clientid][entityid]
pub const MT_DESTROY_ENTITY_ON_CLIENT: MsgType = 1102;
/// [clientid][entityid][path data][value data]
pub const MT_NOTIFY_ATTR_CHANGE_ON_CLIENT: MsgType = 1103;
/// [clientid][entityid][path data][key]
pub const MT_NOTIFY_ATTR_DEL_ON_CLIENT: MsgType = 1104;
/// [clientid][entityid][method][args]
pub const MT_CALL_CLIENT_METHOD: MsgType = 1105;
pub const MT_REDIRECT_TO_CLIENT_END: MsgType = 1199;

pub const MT_GATE_MSG_END: MsgType = 1999;

/// True for messages a gate must relay to a specific client proxy.
pub fn is_redirect_to_client(t: MsgType) -> bool {
    (MT_REDIRECT_TO_CLIENT_START..=MT_REDIRECT_TO_CLIENT_END).contains(&t)
}

/// True for messages addressed to a gate process.
pub fn is_gate_msg(t: MsgType) -> bool {
    (MT_GATE_MSG_START..=MT_GATE_MSG_END).contains(&t)
}

/// Writes one frame. The packet is consumed; its buffer returns to the pool.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg_type: MsgType,
    pkt: Packet,
) -> anyhow::Result<()> {
    let payload = pkt.payload();
    if payload.len() > MAX_PAYLOAD_LEN {
        bail!("frame payload {} exceeds max {}", payload.len(), MAX_PAYLOAD_LEN);
    }
    let size = (TYPE_FIELD_LEN + payload.len()) as u32;
    w.write_all(&size.to_le_bytes()).await.context("write frame size")?;
    w.write_all(&msg_type.to_le_bytes())
        .await
        .context("write frame type")?;
    w.write_all(payload).await.context("write frame payload")?;
    Ok(())
}

/// Reads one frame into a pooled packet positioned at the payload start.
///
/// A frame that is shorter than its type field or longer than
/// `MAX_PAYLOAD_LEN` is a fatal protocol error; the caller must drop the
/// connection.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    pool: &PacketPool,
) -> anyhow::Result<(MsgType, Packet)> {
    let mut size_buf = [0u8; 4];
    r.read_exact(&mut size_buf).await.context("read frame size")?;
    let size = u32::from_le_bytes(size_buf) as usize;
    if size < TYPE_FIELD_LEN {
        bail!("frame size {} shorter than header", size);
    }
    let payload_len = size - TYPE_FIELD_LEN;
    if payload_len > MAX_PAYLOAD_LEN {
        bail!("frame payload {} exceeds max {}", payload_len, MAX_PAYLOAD_LEN);
    }

    let mut type_buf = [0u8; 2];
    r.read_exact(&mut type_buf).await.context("read frame type")?;
    let msg_type = u16::from_le_bytes(type_buf);

    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload).await.context("read frame payload")?;
    Ok((msg_type, pool.get_with_payload(&payload)))
}

/// Framed connection for single-owner use (one task sends and receives).
///
/// Components that need concurrent send/recv split the stream themselves
/// and use `write_frame`/`read_frame` directly.
#[derive(Debug)]
pub struct Conn {
    stream: TcpStream,
}

impl Conn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn send_packet(&mut self, msg_type: MsgType, pkt: Packet) -> anyhow::Result<()> {
        write_frame(&mut self.stream, msg_type, pkt).await
    }

    pub async fn recv_packet(&mut self, pool: &PacketPool) -> anyhow::Result<(MsgType, Packet)> {
        read_frame(&mut self.stream, pool).await
    }

    pub fn peer_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    pub fn into_split(
        self,
    ) -> (
        tokio::net::tcp::OwnedReadHalf,
        tokio::net::tcp::OwnedWriteHalf,
    ) {
        self.stream.into_split()
    }
}
