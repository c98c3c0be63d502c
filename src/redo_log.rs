//! The redo log: a single-producer/single-consumer ring of op records
//! living in the dedicated `mirage_block_volume_redo_log` LV.
//!
//! On disk: sector 0 holds the producer pointer, sector 1 the consumer
//! pointer, and the ring data region starts at byte 1024. Pointers are
//! absolute byte positions that only ever grow; a position maps into
//! the ring modulo its capacity. Records are `[len][crc][seq, op]` and
//! never wrap: when the contiguous tail is too small the writer drops a
//! zero-length marker and both sides skip to the ring start.
//!
//! Durability order is record bytes, barrier, producer pointer; and
//! after a flush has been performed, barrier, consumer pointer.

use std::collections::VecDeque;
use std::sync::Arc;

use nom::bytes::complete::tag;
use nom::number::complete::{le_u32, le_u64};
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::metadata::op::Op;
use crate::{Error, Result, SECTOR_SIZE};

pub const REDO_MAGIC: &[u8; 8] = b"MLVMREDO";
const REDO_VERSION: u32 = 1;
/// Producer and consumer pointer sectors.
const DATA_START: u64 = 2 * SECTOR_SIZE;
/// `[len u32][crc u32]` precedes every record payload.
const RECORD_HEADER: u64 = 8;

fn emit_pointer(position: u64) -> [u8; 512] {
    let mut buf = [0u8; 512];
    buf[0..8].copy_from_slice(REDO_MAGIC);
    buf[8..12].copy_from_slice(&REDO_VERSION.to_le_bytes());
    buf[12..20].copy_from_slice(&position.to_le_bytes());
    let crc = crc32fast::hash(&buf[0..20]);
    buf[20..24].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn parse_pointer(buf: &[u8]) -> Result<u64> {
    let parsed: nom::IResult<&[u8], (u32, u64, u32)> = (|input| {
        let (input, _) = tag(REDO_MAGIC)(input)?;
        let (input, version) = le_u32(input)?;
        let (input, position) = le_u64(input)?;
        let (input, crc) = le_u32(input)?;
        Ok((input, (version, position, crc)))
    })(buf);
    let (_, (version, position, crc)) =
        parsed.map_err(|_| Error::msg("corrupt redo log pointer"))?;
    if version != REDO_VERSION || crc != crc32fast::hash(&buf[0..20]) {
        return Err(Error::msg("corrupt redo log pointer"));
    }
    Ok(position)
}

pub struct RedoLog {
    dev: Arc<dyn Block>,
    /// Ring data bytes available.
    capacity: u64,
    producer: u64,
    consumer: u64,
    next_seq: u64,
    /// Committed records not yet handed to the flusher, oldest first.
    pending: VecDeque<(u64, Op)>,
}

/// Erase a device with a single sequential pass, then stamp fresh
/// (empty) producer and consumer pointers.
pub fn format(dev: &dyn Block) -> Result<()> {
    let len = dev.get_info().size_bytes();
    let pattern = vec![0u8; 64 * 1024];
    let mut at = 0;
    while at < len {
        let n = pattern.len().min((len - at) as usize);
        dev.write_at(at, &pattern[..n])?;
        at += n as u64;
    }
    dev.write_at(0, &emit_pointer(0))?;
    dev.write_at(SECTOR_SIZE, &emit_pointer(0))?;
    dev.sync()?;
    info!(bytes = len, "erased redo log");
    Ok(())
}

impl RedoLog {
    /// Open an existing journal and scan any committed-but-unflushed
    /// records back into memory, stopping at a torn tail.
    pub fn attach(dev: Arc<dyn Block>) -> Result<RedoLog> {
        let len = dev.get_info().size_bytes();
        if len <= DATA_START {
            return Err(Error::msg("redo log device too small"));
        }
        let mut sector = [0u8; 512];
        dev.read_at(0, &mut sector)?;
        let producer = parse_pointer(&sector)?;
        dev.read_at(SECTOR_SIZE, &mut sector)?;
        let consumer = parse_pointer(&sector)?;
        if consumer > producer || producer - consumer > len - DATA_START {
            return Err(Error::msg("corrupt redo log pointer"));
        }
        let mut log = RedoLog {
            dev,
            capacity: len - DATA_START,
            producer,
            consumer,
            next_seq: 0,
            pending: VecDeque::new(),
        };
        log.scan()?;
        Ok(log)
    }

    fn location(&self, position: u64) -> u64 {
        DATA_START + position % self.capacity
    }

    fn contiguous(&self, position: u64) -> u64 {
        self.capacity - position % self.capacity
    }

    /// Bytes still free in the ring.
    fn free(&self) -> u64 {
        self.capacity - (self.producer - self.consumer)
    }

    fn scan(&mut self) -> Result<()> {
        let mut at = self.consumer;
        while at < self.producer {
            let room = self.contiguous(at);
            if room < RECORD_HEADER {
                at += room;
                continue;
            }
            let mut header = [0u8; 8];
            self.dev.read_at(self.location(at), &mut header)?;
            let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
            let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
            if len == 0 {
                // wrap marker
                at += room;
                continue;
            }
            if RECORD_HEADER + len > room {
                warn!(at, len, "redo record overruns the ring tail, truncating");
                self.producer = at;
                break;
            }
            let mut payload = vec![0u8; len as usize];
            self.dev.read_at(self.location(at) + RECORD_HEADER, &mut payload)?;
            if crc32fast::hash(&payload) != crc {
                warn!(at, "torn redo record, truncating");
                self.producer = at;
                break;
            }
            let (rest, seq) = le_u64::<_, nom::error::Error<&[u8]>>(&payload[..])
                .map_err(|_| Error::msg("bad op record: missing sequence"))?;
            let op = Op::of_bytes(rest)?;
            self.next_seq = seq + 1;
            self.pending.push_back((seq, op));
            at += RECORD_HEADER + len;
        }
        if !self.pending.is_empty() {
            info!(records = self.pending.len(), "redo log has unflushed records");
        }
        Ok(())
    }

    /// Number of committed records waiting for a flush.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Encoded ring footprint of one op, skip bytes not included.
    pub fn record_size(op: &Op) -> u64 {
        let mut payload = Vec::new();
        op.emit(&mut payload);
        RECORD_HEADER + 8 + payload.len() as u64
    }

    /// Whether `bytes` worth of records fit without a flush, counting
    /// the worst-case wrap skip.
    pub fn fits(&self, bytes: u64) -> bool {
        bytes + self.contiguous(self.producer) <= self.free()
            || bytes <= self.free().min(self.contiguous(self.producer))
    }

    /// Append one record. Returns the record's sequence number, which
    /// doubles as the waiter handle: the record is durable in the LVM
    /// metadata areas once a flush covering it completes.
    pub fn push(&mut self, op: &Op) -> Result<u64> {
        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(&self.next_seq.to_le_bytes());
        op.emit(&mut payload);
        let needed = RECORD_HEADER + payload.len() as u64;

        let mut skip = 0;
        if self.contiguous(self.producer) < needed {
            skip = self.contiguous(self.producer);
        }
        if needed + skip > self.free() {
            return Err(Error::msg("redo log full"));
        }
        if skip > 0 {
            if skip >= RECORD_HEADER {
                // wrap marker so the reader skips too
                self.dev.write_at(self.location(self.producer), &[0u8; 8])?;
            }
            self.producer += skip;
        }

        let mut record = Vec::with_capacity(needed as usize);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        record.extend_from_slice(&payload);
        self.dev.write_at(self.location(self.producer), &record)?;
        self.dev.sync()?;
        self.producer += needed;
        self.dev.write_at(0, &emit_pointer(self.producer))?;
        self.dev.sync()?;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back((seq, op.clone()));
        debug!(seq, bytes = needed, "journalled op");
        Ok(seq)
    }

    /// Feed every pending record to `perform` and, on success, discard
    /// the consumed prefix. `perform` is expected to apply the ops to
    /// the in-memory metadata and rewrite the LVM metadata areas.
    pub fn flush<F>(&mut self, perform: F) -> Result<()>
    where
        F: FnOnce(&[Op]) -> Result<()>,
    {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops: Vec<Op> = self.pending.iter().map(|(_, op)| op.clone()).collect();
        perform(&ops)?;
        self.pending.clear();
        self.consumer = self.producer;
        self.dev.write_at(SECTOR_SIZE, &emit_pointer(self.consumer))?;
        self.dev.sync()?;
        debug!(ops = ops.len(), "flushed redo log");
        Ok(())
    }

    /// Startup recovery: same contract as [`flush`], named for intent.
    pub fn replay<F>(&mut self, perform: F) -> Result<usize>
    where
        F: FnOnce(&[Op]) -> Result<()>,
    {
        let n = self.pending.len();
        self.flush(perform)?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlock;
    use crate::lv::Tag;
    use crate::uuid::Uuid;

    fn tiny_log() -> (Arc<MemBlock>, RedoLog) {
        let dev = Arc::new(MemBlock::new(8192));
        format(dev.as_ref()).unwrap();
        let log = RedoLog::attach(dev.clone()).unwrap();
        (dev, log)
    }

    fn some_op(n: u64) -> Op {
        Op::LvReduce { id: Uuid::of_string(&"Q".repeat(32)).unwrap(), new_extent_count: n }
    }

    #[test]
    fn push_then_reattach_replays() {
        let (dev, mut log) = tiny_log();
        assert_eq!(log.push(&some_op(1)).unwrap(), 0);
        assert_eq!(log.push(&some_op(2)).unwrap(), 1);
        drop(log); // crash before any flush

        let mut log = RedoLog::attach(dev).unwrap();
        assert_eq!(log.pending_len(), 2);
        let mut seen = Vec::new();
        log.replay(|ops| {
            seen.extend_from_slice(ops);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![some_op(1), some_op(2)]);
        assert_eq!(log.pending_len(), 0);
    }

    #[test]
    fn flush_advances_the_consumer() {
        let (dev, mut log) = tiny_log();
        log.push(&some_op(1)).unwrap();
        log.flush(|_| Ok(())).unwrap();
        assert_eq!(log.pending_len(), 0);
        // nothing left to replay after a clean flush
        let log = RedoLog::attach(dev).unwrap();
        assert_eq!(log.pending_len(), 0);
    }

    #[test]
    fn failed_flush_keeps_records() {
        let (_, mut log) = tiny_log();
        log.push(&some_op(1)).unwrap();
        assert!(log.flush(|_| Err(Error::msg("pv went away"))).is_err());
        assert_eq!(log.pending_len(), 1);
    }

    #[test]
    fn ring_wraps_and_fills() {
        let (_, mut log) = tiny_log();
        // capacity is 8192 - 1024 bytes; each record is ~64 bytes
        let mut pushed = 0;
        loop {
            match log.push(&some_op(pushed)) {
                Ok(_) => pushed += 1,
                Err(Error::Msg { msg }) => {
                    assert_eq!(msg, "redo log full");
                    break;
                }
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert!(pushed > 50);
        log.flush(|_| Ok(())).unwrap();
        // space is reclaimed, and positions keep growing monotonically
        for i in 0..2 * pushed {
            log.push(&some_op(i)).unwrap();
            log.flush(|_| Ok(())).unwrap();
        }
        assert!(log.producer > log.capacity);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let (dev, mut log) = tiny_log();
        log.push(&some_op(1)).unwrap();
        let keep = log.producer;
        log.push(&some_op(2)).unwrap();
        // corrupt the second record's payload on disk
        let mut b = [0u8; 1];
        dev.read_at(DATA_START + keep + RECORD_HEADER, &mut b).unwrap();
        dev.write_at(DATA_START + keep + RECORD_HEADER, &[b[0] ^ 0xff]).unwrap();

        let log = RedoLog::attach(dev).unwrap();
        assert_eq!(log.pending_len(), 1);
        assert_eq!(log.producer, keep);
    }

    #[test]
    fn tagged_ops_survive_the_wire() {
        let (dev, mut log) = tiny_log();
        let op = Op::LvAddTag {
            id: Uuid::of_string(&"R".repeat(32)).unwrap(),
            tag: Tag::of_string("snap-1").unwrap(),
        };
        log.push(&op).unwrap();
        let log = RedoLog::attach(dev).unwrap();
        assert_eq!(log.pending.back().unwrap().1, op);
    }
}
