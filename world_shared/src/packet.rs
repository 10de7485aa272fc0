//! Pooled wire packets.
//!
//! A `Packet` is a mutable byte buffer checked out of a `PacketPool`.
//! Ownership is scope-bound: dropping the packet returns its buffer to the
//! pool, so a send/receive path cannot forget to release or release twice.
//! The pool keeps balanced get/put counters so tests can assert discipline.
//!
//! Fields are appended and read positionally, little-endian, in the exact
//! order defined per message type. There is no self-describing schema; a
//! sender/receiver order mismatch is silent corruption, which is why the
//! round-trip tests cover every field kind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ids::{ClientId, EntityId, ID_LENGTH};

/// Buffers that grew beyond this are dropped instead of pooled.
const MAX_POOLED_CAPACITY: usize = 256 * 1024;

/// Balanced checkout/return counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub gets: u64,
    pub puts: u64,
}

#[derive(Default)]
struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
    gets: AtomicU64,
    puts: AtomicU64,
}

/// Shared pool of packet buffers.
#[derive(Clone, Default)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl PacketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks out an empty packet.
    pub fn get(&self) -> Packet {
        self.inner.gets.fetch_add(1, Ordering::Relaxed);
        let buf = self
            .inner
            .free
            .lock()
            .expect("packet pool poisoned")
            .pop()
            .unwrap_or_default();
        Packet {
            buf,
            read: 0,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Checks out a packet holding the given payload, read cursor at start.
    pub fn get_with_payload(&self, payload: &[u8]) -> Packet {
        let mut pkt = self.get();
        pkt.buf.extend_from_slice(payload);
        pkt
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            gets: self.inner.gets.load(Ordering::Relaxed),
            puts: self.inner.puts.load(Ordering::Relaxed),
        }
    }
}

/// One wire message payload under construction or consumption.
pub struct Packet {
    buf: BytesMut,
    read: usize,
    pool: Arc<PoolInner>,
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.pool.puts.fetch_add(1, Ordering::Relaxed);
        let mut buf = std::mem::take(&mut self.buf);
        if buf.capacity() == 0 || buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();
        if let Ok(mut free) = self.pool.free.lock() {
            free.push(buf);
        }
    }
}

impl Packet {
    /// Full payload written so far.
    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    /// Bytes not yet consumed by the read cursor.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.read..]
    }

    pub fn append_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn append_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn append_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn append_entity_id(&mut self, id: EntityId) {
        self.buf.extend_from_slice(id.as_bytes());
    }

    pub fn append_client_id(&mut self, id: ClientId) {
        self.buf.extend_from_slice(id.as_bytes());
    }

    /// Length-prefixed (u16) UTF-8 string. An oversized field would wrap
    /// the prefix and corrupt the frame, so it is fatal.
    pub fn append_str(&mut self, s: &str) {
        assert!(s.len() <= u16::MAX as usize, "string field too long");
        self.buf.put_u16_le(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Length-prefixed (u32) serde-serialized blob.
    pub fn append_data<T: Serialize>(&mut self, v: &T) -> anyhow::Result<()> {
        let blob = serde_json::to_vec(v).context("serialize packet data")?;
        self.buf.put_u32_le(blob.len() as u32);
        self.buf.extend_from_slice(&blob);
        Ok(())
    }

    /// Raw bytes without a length prefix, for verbatim relay.
    pub fn append_raw(&mut self, raw: &[u8]) {
        self.buf.extend_from_slice(raw);
    }

    fn take(&mut self, n: usize) -> anyhow::Result<&[u8]> {
        if self.buf.len() - self.read < n {
            bail!(
                "packet underflow: want {} bytes, {} left",
                n,
                self.buf.len() - self.read
            );
        }
        let start = self.read;
        self.read += n;
        Ok(&self.buf[start..self.read])
    }

    pub fn read_u16(&mut self) -> anyhow::Result<u16> {
        let mut raw = self.take(2)?;
        Ok(raw.get_u16_le())
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        let mut raw = self.take(4)?;
        Ok(raw.get_u32_le())
    }

    pub fn read_f32(&mut self) -> anyhow::Result<f32> {
        let mut raw = self.take(4)?;
        Ok(raw.get_f32_le())
    }

    pub fn read_entity_id(&mut self) -> anyhow::Result<EntityId> {
        let mut raw = [0u8; ID_LENGTH];
        raw.copy_from_slice(self.take(ID_LENGTH)?);
        Ok(EntityId::from_bytes(raw))
    }

    pub fn read_client_id(&mut self) -> anyhow::Result<ClientId> {
        let mut raw = [0u8; ID_LENGTH];
        raw.copy_from_slice(self.take(ID_LENGTH)?);
        Ok(ClientId::from_bytes(raw))
    }

    pub fn read_str(&mut self) -> anyhow::Result<String> {
        let len = self.read_u16()? as usize;
        let raw = self.take(len)?;
        Ok(std::str::from_utf8(raw)
            .context("string field not UTF-8")?
            .to_string())
    }

    pub fn read_data<T: DeserializeOwned>(&mut self) -> anyhow::Result<T> {
        let len = self.read_u32()? as usize;
        let raw = self.take(len)?;
        serde_json::from_slice(raw).context("deserialize packet data")
    }
}
