//! Metadata mutations as data.
//!
//! `do_op` is pure and idempotent: replaying an already-applied op
//! yields the metadata unchanged, which is what makes redo-log replay
//! safe. `seqno` only moves when an op actually changes something.
//!
//! The wire form is a u32 tag plus length-prefixed fields, parsed with
//! nom; the redo log wraps records in its own length/CRC framing.

use nom::bytes::complete::take;
use nom::error::ParseError;
use nom::multi::count;
use nom::number::complete::{le_i64, le_u32, le_u64};
use nom::IResult;

use crate::allocation::PvName;
use crate::lv::{Lv, LvStatus, Tag};
use crate::segment::{self, LinearSegment, Segment, SegmentKind};
use crate::uuid::Uuid;
use crate::{Error, Result};

use super::Metadata;

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Create a full LV record, segments included.
    LvCreate(Lv),
    /// Append physical segments to an LV.
    LvExpand { id: Uuid, segments: Vec<Segment> },
    /// Truncate an LV to a new extent count.
    LvReduce { id: Uuid, new_extent_count: u64 },
    /// Atomically move segments from one LV to another.
    LvTransfer { src: Uuid, dst: Uuid, segments: Vec<Segment> },
    LvRemove(Uuid),
    LvRename { id: Uuid, new_name: String },
    LvAddTag { id: Uuid, tag: Tag },
    LvRemoveTag { id: Uuid, tag: Tag },
    LvSetStatus { id: Uuid, status: Vec<LvStatus> },
}

fn get<'m>(meta: &'m Metadata, id: &Uuid) -> Result<&'m Lv> {
    meta.lvs.get(id).ok_or_else(|| Error::UnknownLv { name: id.to_string() })
}

fn same_mapping(a: &Segment, b: &Segment) -> bool {
    a.extent_count == b.extent_count && a.kind == b.kind
}

/// Apply one op to a metadata value, producing the next value.
pub fn do_op(meta: &Metadata, op: &Op) -> Result<Metadata> {
    let mut next = meta.clone();
    let changed = apply(&mut next, op)?;
    if changed {
        next.seqno += 1;
        Ok(next)
    } else {
        Ok(meta.clone())
    }
}

fn apply(meta: &mut Metadata, op: &Op) -> Result<bool> {
    match op {
        Op::LvCreate(lv) => {
            if meta.lvs.contains_key(&lv.id) {
                return Ok(false);
            }
            if meta.lv_by_name(&lv.name).is_some() {
                return Err(Error::DuplicateLv { name: lv.name.clone() });
            }
            segment::validate(&lv.segments)?;
            meta.free_space = meta.free_space.sub(&lv.to_allocation())?;
            meta.lvs.insert(lv.id, lv.clone());
            Ok(true)
        }
        Op::LvExpand { id, segments } => {
            let lv = get(meta, id)?;
            let fresh: Vec<Segment> = segments
                .iter()
                .filter(|s| !lv.segments.iter().any(|e| e.start_extent == s.start_extent))
                .cloned()
                .collect();
            if fresh.is_empty() {
                return Ok(false);
            }
            meta.free_space = meta.free_space.sub(&segment::to_allocation(&fresh))?;
            let lv = meta.lvs.get_mut(id).unwrap();
            lv.segments.extend(fresh);
            segment::sort(&mut lv.segments);
            segment::validate(&lv.segments)?;
            Ok(true)
        }
        Op::LvReduce { id, new_extent_count } => {
            let lv = get(meta, id)?;
            if lv.size_extents() == *new_extent_count {
                return Ok(false);
            }
            let reduced = segment::reduce_size_to(&lv.segments, *new_extent_count)?;
            let freed = lv.to_allocation().sub(&segment::to_allocation(&reduced))?;
            meta.free_space = meta.free_space.merge(&freed);
            meta.lvs.get_mut(id).unwrap().segments = reduced;
            Ok(true)
        }
        Op::LvTransfer { src, dst, segments } => {
            get(meta, src)?;
            get(meta, dst)?;
            let mut moved = Vec::new();
            for seg in segments {
                let dst_lv = &meta.lvs[dst];
                if dst_lv.segments.iter().any(|e| same_mapping(e, seg)) {
                    continue; // already transferred
                }
                let src_lv = &meta.lvs[src];
                let at = src_lv
                    .segments
                    .iter()
                    .position(|e| {
                        e.start_extent == seg.start_extent && e.extent_count == seg.extent_count
                    })
                    .ok_or_else(|| Error::msg("segment to transfer is not in the source LV"))?;
                moved.push(meta.lvs.get_mut(src).unwrap().segments.remove(at));
            }
            if moved.is_empty() {
                return Ok(false);
            }
            segment::validate(&meta.lvs[src].segments)?;
            let dst_lv = meta.lvs.get_mut(dst).unwrap();
            let mut at = segment::size_extents(&dst_lv.segments);
            for mut seg in moved {
                seg.start_extent = at;
                at = seg.end_extent();
                dst_lv.segments.push(seg);
            }
            segment::validate(&dst_lv.segments)?;
            Ok(true)
        }
        Op::LvRemove(id) => match meta.lvs.remove(id) {
            None => Ok(false),
            Some(lv) => {
                meta.free_space = meta.free_space.merge(&lv.to_allocation());
                Ok(true)
            }
        },
        Op::LvRename { id, new_name } => {
            let lv = get(meta, id)?;
            if lv.name == *new_name {
                return Ok(false);
            }
            if meta.lv_by_name(new_name).is_some() {
                return Err(Error::DuplicateLv { name: new_name.clone() });
            }
            meta.lvs.get_mut(id).unwrap().name = new_name.clone();
            Ok(true)
        }
        Op::LvAddTag { id, tag } => {
            let lv = get(meta, id)?;
            if lv.has_tag(tag) {
                return Ok(false);
            }
            meta.lvs.get_mut(id).unwrap().tags.push(tag.clone());
            Ok(true)
        }
        Op::LvRemoveTag { id, tag } => {
            let lv = get(meta, id)?;
            if !lv.has_tag(tag) {
                return Ok(false);
            }
            meta.lvs.get_mut(id).unwrap().tags.retain(|t| t != tag);
            Ok(true)
        }
        Op::LvSetStatus { id, status } => {
            let lv = get(meta, id)?;
            if lv.status == *status {
                return Ok(false);
            }
            meta.lvs.get_mut(id).unwrap().status = status.clone();
            Ok(true)
        }
    }
}

// ---- wire form ----

const TAG_LV_CREATE: u32 = 0;
const TAG_LV_EXPAND: u32 = 1;
const TAG_LV_REDUCE: u32 = 2;
const TAG_LV_TRANSFER: u32 = 3;
const TAG_LV_REMOVE: u32 = 4;
const TAG_LV_RENAME: u32 = 5;
const TAG_LV_ADD_TAG: u32 = 6;
const TAG_LV_REMOVE_TAG: u32 = 7;
const TAG_LV_SET_STATUS: u32 = 8;

const KIND_LINEAR: u32 = 0;
const KIND_STRIPED: u32 = 1;

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn put_segment(out: &mut Vec<u8>, seg: &Segment) {
    put_u64(out, seg.start_extent);
    put_u64(out, seg.extent_count);
    match &seg.kind {
        SegmentKind::Linear(l) => {
            put_u32(out, KIND_LINEAR);
            put_string(out, l.pv_name.as_str());
            put_u64(out, l.pv_start_extent);
        }
        SegmentKind::Striped { stripe_size, stripes } => {
            put_u32(out, KIND_STRIPED);
            put_u64(out, *stripe_size);
            put_u32(out, stripes.len() as u32);
            for (pv, off) in stripes {
                put_string(out, pv.as_str());
                put_u64(out, *off);
            }
        }
    }
}

fn put_segments(out: &mut Vec<u8>, segs: &[Segment]) {
    put_u32(out, segs.len() as u32);
    for seg in segs {
        put_segment(out, seg);
    }
}

fn put_status(out: &mut Vec<u8>, status: &[LvStatus]) {
    put_u32(out, status.len() as u32);
    for s in status {
        put_string(out, s.as_str());
    }
}

fn parse_string(input: &[u8]) -> IResult<&[u8], String> {
    let (input, len) = le_u32(input)?;
    let (input, raw) = take(len as usize)(input)?;
    let s = core::str::from_utf8(raw).map_err(|_| {
        nom::Err::Failure(nom::error::Error::from_error_kind(raw, nom::error::ErrorKind::Char))
    })?;
    Ok((input, s.to_owned()))
}

fn fail<'a, T>(input: &'a [u8], res: Result<T>) -> IResult<&'a [u8], T> {
    res.map(|v| (input, v)).map_err(|_| {
        nom::Err::Failure(nom::error::Error::from_error_kind(input, nom::error::ErrorKind::Verify))
    })
}

fn parse_uuid(input: &[u8]) -> IResult<&[u8], Uuid> {
    let (input, raw) = take(32usize)(input)?;
    fail(input, Uuid::of_raw(raw))
}

fn parse_pv_name(input: &[u8]) -> IResult<&[u8], PvName> {
    let (input, s) = parse_string(input)?;
    fail(input, PvName::of_string(&s))
}

fn parse_segment(input: &[u8]) -> IResult<&[u8], Segment> {
    let (input, start_extent) = le_u64(input)?;
    let (input, extent_count) = le_u64(input)?;
    let (input, kind_tag) = le_u32(input)?;
    let (input, kind) = match kind_tag {
        KIND_LINEAR => {
            let (input, pv_name) = parse_pv_name(input)?;
            let (input, pv_start_extent) = le_u64(input)?;
            (input, SegmentKind::Linear(LinearSegment { pv_name, pv_start_extent }))
        }
        KIND_STRIPED => {
            let (input, stripe_size) = le_u64(input)?;
            let (input, n) = le_u32(input)?;
            let (input, stripes) = count(
                |i| {
                    let (i, pv) = parse_pv_name(i)?;
                    let (i, off) = le_u64(i)?;
                    Ok((i, (pv, off)))
                },
                n as usize,
            )(input)?;
            (input, SegmentKind::Striped { stripe_size, stripes })
        }
        _ => {
            return Err(nom::Err::Failure(nom::error::Error::from_error_kind(
                input,
                nom::error::ErrorKind::Switch,
            )))
        }
    };
    Ok((input, Segment { start_extent, extent_count, kind }))
}

fn parse_segments(input: &[u8]) -> IResult<&[u8], Vec<Segment>> {
    let (input, n) = le_u32(input)?;
    count(parse_segment, n as usize)(input)
}

fn parse_status(input: &[u8]) -> IResult<&[u8], Vec<LvStatus>> {
    let (input, n) = le_u32(input)?;
    count(
        |i| {
            let (i, s) = parse_string(i)?;
            fail(i, LvStatus::of_string(&s))
        },
        n as usize,
    )(input)
}

fn parse_tag(input: &[u8]) -> IResult<&[u8], Tag> {
    let (input, s) = parse_string(input)?;
    fail(input, Tag::of_string(&s))
}

impl Op {
    pub fn emit(&self, out: &mut Vec<u8>) {
        match self {
            Op::LvCreate(lv) => {
                put_u32(out, TAG_LV_CREATE);
                out.extend_from_slice(lv.id.as_bytes());
                put_string(out, &lv.name);
                put_u32(out, lv.tags.len() as u32);
                for t in &lv.tags {
                    put_string(out, t.as_str());
                }
                put_status(out, &lv.status);
                put_string(out, &lv.creation_host);
                out.extend_from_slice(&lv.creation_time.to_le_bytes());
                put_segments(out, &lv.segments);
            }
            Op::LvExpand { id, segments } => {
                put_u32(out, TAG_LV_EXPAND);
                out.extend_from_slice(id.as_bytes());
                put_segments(out, segments);
            }
            Op::LvReduce { id, new_extent_count } => {
                put_u32(out, TAG_LV_REDUCE);
                out.extend_from_slice(id.as_bytes());
                put_u64(out, *new_extent_count);
            }
            Op::LvTransfer { src, dst, segments } => {
                put_u32(out, TAG_LV_TRANSFER);
                out.extend_from_slice(src.as_bytes());
                out.extend_from_slice(dst.as_bytes());
                put_segments(out, segments);
            }
            Op::LvRemove(id) => {
                put_u32(out, TAG_LV_REMOVE);
                out.extend_from_slice(id.as_bytes());
            }
            Op::LvRename { id, new_name } => {
                put_u32(out, TAG_LV_RENAME);
                out.extend_from_slice(id.as_bytes());
                put_string(out, new_name);
            }
            Op::LvAddTag { id, tag } => {
                put_u32(out, TAG_LV_ADD_TAG);
                out.extend_from_slice(id.as_bytes());
                put_string(out, tag.as_str());
            }
            Op::LvRemoveTag { id, tag } => {
                put_u32(out, TAG_LV_REMOVE_TAG);
                out.extend_from_slice(id.as_bytes());
                put_string(out, tag.as_str());
            }
            Op::LvSetStatus { id, status } => {
                put_u32(out, TAG_LV_SET_STATUS);
                out.extend_from_slice(id.as_bytes());
                put_status(out, status);
            }
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Op> {
        let (input, op_tag) = le_u32(input)?;
        match op_tag {
            TAG_LV_CREATE => {
                let (input, id) = parse_uuid(input)?;
                let (input, name) = parse_string(input)?;
                let (input, ntags) = le_u32(input)?;
                let (input, tags) = count(parse_tag, ntags as usize)(input)?;
                let (input, status) = parse_status(input)?;
                let (input, creation_host) = parse_string(input)?;
                let (input, creation_time) = le_i64(input)?;
                let (input, segments) = parse_segments(input)?;
                Ok((
                    input,
                    Op::LvCreate(Lv {
                        id,
                        name,
                        tags,
                        status,
                        creation_host,
                        creation_time,
                        segments,
                    }),
                ))
            }
            TAG_LV_EXPAND => {
                let (input, id) = parse_uuid(input)?;
                let (input, segments) = parse_segments(input)?;
                Ok((input, Op::LvExpand { id, segments }))
            }
            TAG_LV_REDUCE => {
                let (input, id) = parse_uuid(input)?;
                let (input, new_extent_count) = le_u64(input)?;
                Ok((input, Op::LvReduce { id, new_extent_count }))
            }
            TAG_LV_TRANSFER => {
                let (input, src) = parse_uuid(input)?;
                let (input, dst) = parse_uuid(input)?;
                let (input, segments) = parse_segments(input)?;
                Ok((input, Op::LvTransfer { src, dst, segments }))
            }
            TAG_LV_REMOVE => {
                let (input, id) = parse_uuid(input)?;
                Ok((input, Op::LvRemove(id)))
            }
            TAG_LV_RENAME => {
                let (input, id) = parse_uuid(input)?;
                let (input, new_name) = parse_string(input)?;
                Ok((input, Op::LvRename { id, new_name }))
            }
            TAG_LV_ADD_TAG => {
                let (input, id) = parse_uuid(input)?;
                let (input, tag) = parse_tag(input)?;
                Ok((input, Op::LvAddTag { id, tag }))
            }
            TAG_LV_REMOVE_TAG => {
                let (input, id) = parse_uuid(input)?;
                let (input, tag) = parse_tag(input)?;
                Ok((input, Op::LvRemoveTag { id, tag }))
            }
            TAG_LV_SET_STATUS => {
                let (input, id) = parse_uuid(input)?;
                let (input, status) = parse_status(input)?;
                Ok((input, Op::LvSetStatus { id, status }))
            }
            _ => Err(nom::Err::Failure(nom::error::Error::from_error_kind(
                input,
                nom::error::ErrorKind::Switch,
            ))),
        }
    }

    /// Decode one op from a buffer, requiring it to be fully consumed.
    pub fn of_bytes(buf: &[u8]) -> Result<Op> {
        match Op::parse(buf) {
            Ok((rest, op)) if rest.is_empty() => Ok(op),
            Ok((rest, _)) => Err(Error::msg(format!(
                "trailing bytes after op record: {}",
                rest.len()
            ))),
            Err(e) => Err(Error::msg(format!("bad op record: {e}"))),
        }
    }
}
