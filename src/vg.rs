//! VG sessions: a set of block devices opened as one volume group.
//!
//! All mutation serializes through a single mutex; readers get a cheap
//! `Arc<Metadata>` snapshot. In journalled mode an `update` returns as
//! soon as its ops are in the redo log; the metadata areas catch up on
//! `sync` or when `flush_interval` has elapsed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use crate::allocation::{Allocation, PvName};
use crate::block::Block;
use crate::config;
use crate::header::Magic;
use crate::lv::{self, Lv, LvStatus, Tag};
use crate::metadata::op::{self, Op};
use crate::metadata::{Metadata, Pv, VgStatus};
use crate::pv;
use crate::redo_log::{self, RedoLog};
use crate::segment;
use crate::uuid::Uuid;
use crate::volume::Volume;
use crate::{Error, Result, DEFAULT_EXTENT_SIZE, REDO_LOG_LV, REDO_LOG_SIZE};

/// Monotonic seconds, injected so the flush cadence is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

pub struct ConnectOpts {
    pub mode: Mode,
    /// Minimum seconds between journal flushes to the metadata areas.
    pub flush_interval: f64,
    pub clock: Arc<dyn Clock>,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        ConnectOpts {
            mode: Mode::ReadOnly,
            flush_interval: 120.0,
            clock: Arc::new(SystemClock::new()),
        }
    }
}

impl ConnectOpts {
    pub fn read_write() -> Self {
        ConnectOpts { mode: Mode::ReadWrite, ..Default::default() }
    }
}

struct Inner {
    metadata: Arc<Metadata>,
    journal: Option<RedoLog>,
    last_flush: f64,
}

pub struct Vg {
    /// In the metadata's `pvs` order.
    devices: Vec<(PvName, Arc<dyn Block>)>,
    mode: Mode,
    flush_interval: f64,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

/// Write the metadata text through to every PV's metadata areas.
fn commit(devices: &[(PvName, Arc<dyn Block>)], meta: &Metadata) -> Result<()> {
    let text = meta.to_text();
    for (name, dev) in devices {
        let phys = pv::read_label(dev.as_ref())?;
        for mda in &phys.mdas {
            pv::write_metadata(dev.as_ref(), mda, &text)
                .map_err(|e| Error::msg(format!("writing metadata to PV {name}: {e}")))?;
        }
    }
    Ok(())
}

/// The journal `perform` contract: re-apply the batch to the in-memory
/// metadata (idempotent), rewrite every PV, swap the snapshot.
fn reapply_and_commit(
    devices: &[(PvName, Arc<dyn Block>)],
    metadata: &mut Arc<Metadata>,
    ops: &[Op],
) -> Result<()> {
    let mut m = (**metadata).clone();
    for o in ops {
        m = op::do_op(&m, o)?;
    }
    commit(devices, &m)?;
    *metadata = Arc::new(m);
    Ok(())
}

fn flush_journal(
    devices: &[(PvName, Arc<dyn Block>)],
    journal: &mut RedoLog,
    metadata: &mut Arc<Metadata>,
) -> Result<()> {
    journal.flush(|ops| reapply_and_commit(devices, metadata, ops))
}

/// Format every device as a PV of a brand new volume group and commit
/// the virgin metadata. With `Magic::Journalled` the redo-log LV is
/// carved out of the fresh free space and erased.
pub fn format(
    name: &str,
    creation_host: &str,
    creation_time: i64,
    magic: Magic,
    devices: &[(PvName, Arc<dyn Block>)],
) -> Result<()> {
    if devices.is_empty() {
        return Err(Error::msg("cannot format a volume group with no devices"));
    }
    if !config::valid_ident(name) {
        return Err(Error::msg(format!("bad VG name {name:?}")));
    }
    let mut pvs = Vec::new();
    for (pv_name, dev) in devices {
        let (phys, pe_start, pe_count) =
            pv::format(dev.as_ref(), pv_name, magic, DEFAULT_EXTENT_SIZE)?;
        pvs.push(Pv {
            id: phys.id(),
            name: pv_name.clone(),
            device: format!("/dev/{pv_name}"),
            pe_start,
            pe_count,
        });
    }
    let free_space = pvs
        .iter()
        .map(Pv::full_extents)
        .fold(Allocation::empty(), |a, b| a.merge(&b));
    let mut meta = Metadata {
        name: name.to_owned(),
        id: Uuid::create(),
        creation_host: creation_host.to_owned(),
        creation_time,
        seqno: 1,
        status: vec![VgStatus::Read, VgStatus::Write, VgStatus::Resizeable],
        extent_size: DEFAULT_EXTENT_SIZE,
        max_lv: 0,
        max_pv: 0,
        pvs,
        lvs: BTreeMap::new(),
        free_space,
    };
    if magic == Magic::Journalled {
        let extents = REDO_LOG_SIZE.div_ceil(meta.extent_bytes());
        let alloc = meta.free_space.find(extents, &meta.pv_order())?;
        let lv = Lv {
            id: Uuid::create(),
            name: REDO_LOG_LV.to_owned(),
            tags: vec![],
            status: vec![LvStatus::Read, LvStatus::Write],
            creation_host: creation_host.to_owned(),
            creation_time,
            segments: segment::linear(0, &alloc),
        };
        meta = op::do_op(&meta, &Op::LvCreate(lv))?;
        let vol = Volume::connect(&meta, devices, REDO_LOG_LV)?;
        redo_log::format(&vol)?;
    }
    commit(devices, &meta)?;
    info!(vg = name, ?magic, "formatted volume group");
    Ok(())
}

/// Open a set of devices as a volume group.
pub fn connect(devices: Vec<Arc<dyn Block>>, opts: ConnectOpts) -> Result<Vg> {
    let mut labelled: Vec<(Arc<dyn Block>, pv::PhysicalVolume)> = Vec::new();
    for dev in devices {
        let phys = pv::read_label(dev.as_ref())?;
        if labelled.iter().any(|(_, p)| p.id() == phys.id()) {
            return Err(Error::msg(format!("duplicate PV {}", phys.id())));
        }
        labelled.push((dev, phys));
    }

    // take the newest readable metadata across all copies
    let mut best: Option<Metadata> = None;
    for (dev, phys) in &labelled {
        for mda in &phys.mdas {
            match pv::read_metadata(dev.as_ref(), mda).and_then(|t| Metadata::of_text(&t)) {
                Ok(meta) => {
                    if best.as_ref().map_or(true, |b| meta.seqno > b.seqno) {
                        best = Some(meta);
                    }
                }
                Err(e) => warn!("skipping metadata copy: {e}"),
            }
        }
    }
    let meta = best.ok_or_else(|| Error::msg("no readable metadata on any PV"))?;

    let mut bound = Vec::new();
    for pv_rec in &meta.pvs {
        let dev = labelled
            .iter()
            .find(|(_, p)| p.id() == pv_rec.id)
            .map(|(d, _)| d.clone())
            .ok_or_else(|| {
                Error::msg(format!("PV {} ({}) has no connected device", pv_rec.name, pv_rec.id))
            })?;
        bound.push((pv_rec.name.clone(), dev));
    }
    let journalled = labelled.iter().any(|(_, p)| p.magic() == Magic::Journalled);

    let now = opts.clock.now();
    let vg = Vg {
        devices: bound,
        mode: opts.mode,
        flush_interval: opts.flush_interval,
        clock: opts.clock,
        inner: Mutex::new(Inner {
            metadata: Arc::new(meta),
            journal: None,
            last_flush: now,
        }),
    };

    if journalled && vg.mode == Mode::ReadWrite {
        let snapshot = vg.metadata_of();
        let vol = Volume::connect(&snapshot, &vg.devices, REDO_LOG_LV)?;
        let mut journal = RedoLog::attach(Arc::new(vol))?;
        let mut guard = vg.inner.lock().unwrap();
        let inner = &mut *guard;
        let replayed =
            journal.replay(|ops| reapply_and_commit(&vg.devices, &mut inner.metadata, ops))?;
        if replayed > 0 {
            info!(vg = %inner.metadata.name, replayed, "replayed redo log");
        }
        inner.journal = Some(journal);
    }
    Ok(vg)
}

impl Vg {
    /// The current metadata snapshot.
    pub fn metadata_of(&self) -> Arc<Metadata> {
        self.inner.lock().unwrap().metadata.clone()
    }

    /// Apply a batch of ops: all of them in order or none. On return
    /// the in-memory state is updated; in journalled mode durability
    /// may lag until [`Vg::sync`].
    pub fn update(&self, ops: &[Op]) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        self.apply_locked(&mut guard, ops)
    }

    fn apply_locked(&self, inner: &mut Inner, ops: &[Op]) -> Result<()> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::msg("volume group opened read-only"));
        }
        let mut m = (*inner.metadata).clone();
        for o in ops {
            m = op::do_op(&m, o)?;
        }
        let Inner { metadata, journal, last_flush } = inner;
        match journal {
            None => {
                commit(&self.devices, &m)?;
                *metadata = Arc::new(m);
            }
            Some(journal) => {
                let need: u64 = ops.iter().map(RedoLog::record_size).sum();
                if !journal.fits(need) {
                    flush_journal(&self.devices, journal, metadata)?;
                    *last_flush = self.clock.now();
                    if !journal.fits(need) {
                        return Err(Error::msg("redo log full"));
                    }
                }
                for o in ops {
                    journal.push(o)?;
                }
                *metadata = Arc::new(m);
                if self.clock.now() - *last_flush >= self.flush_interval {
                    flush_journal(&self.devices, journal, metadata)?;
                    *last_flush = self.clock.now();
                }
            }
        }
        Ok(())
    }

    /// Drain the journal. On success every preceding `update` is
    /// durable in the LVM metadata areas of all PVs.
    pub fn sync(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let Inner { metadata, journal, last_flush } = &mut *guard;
        if let Some(journal) = journal {
            flush_journal(&self.devices, journal, metadata)?;
            *last_flush = self.clock.now();
        }
        Ok(())
    }

    /// Open an LV as a block device. The redo-log LV is reserved.
    pub fn volume(&self, lv_name: &str) -> Result<Volume> {
        if lv_name == REDO_LOG_LV {
            return Err(Error::msg("the redo log LV is not accessible"));
        }
        let snapshot = self.metadata_of();
        Volume::connect(&snapshot, &self.devices, lv_name)
    }

    fn bytes_to_extents(meta: &Metadata, bytes: u64) -> u64 {
        bytes.div_ceil(meta.extent_bytes())
    }

    /// Create an LV of at least `size_bytes`, rounded up to whole
    /// extents, allocated first-fit.
    pub fn create(&self, name: &str, size_bytes: u64) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        lv::validate_name(name)?;
        let meta = guard.metadata.clone();
        if meta.lv_by_name(name).is_some() {
            return Err(Error::DuplicateLv { name: name.to_owned() });
        }
        let extents = Self::bytes_to_extents(&meta, size_bytes);
        let alloc = meta.free_space.find(extents, &meta.pv_order())?;
        let lv = Lv {
            id: Uuid::create(),
            name: name.to_owned(),
            tags: vec![],
            status: vec![LvStatus::Read, LvStatus::Write, LvStatus::Visible],
            creation_host: meta.creation_host.clone(),
            creation_time: meta.creation_time,
            segments: segment::linear(0, &alloc),
        };
        self.apply_locked(&mut guard, &[Op::LvCreate(lv)])
    }

    /// Grow or shrink an LV to `new_size_bytes`, rounded up to whole
    /// extents.
    pub fn resize(&self, name: &str, new_size_bytes: u64) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let meta = guard.metadata.clone();
        let lv = meta
            .lv_by_name(name)
            .ok_or_else(|| Error::UnknownLv { name: name.to_owned() })?;
        let new_extents = Self::bytes_to_extents(&meta, new_size_bytes);
        let current = lv.size_extents();
        let ops = match new_extents.cmp(&current) {
            core::cmp::Ordering::Equal => return Ok(()),
            core::cmp::Ordering::Greater => {
                let alloc = meta.free_space.find(new_extents - current, &meta.pv_order())?;
                vec![Op::LvExpand { id: lv.id, segments: segment::linear(current, &alloc) }]
            }
            core::cmp::Ordering::Less => {
                vec![Op::LvReduce { id: lv.id, new_extent_count: new_extents }]
            }
        };
        self.apply_locked(&mut guard, &ops)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let id = self.lv_id(&guard, name)?;
        self.apply_locked(&mut guard, &[Op::LvRemove(id)])
    }

    pub fn rename(&self, name: &str, new_name: &str) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        lv::validate_name(new_name)?;
        let id = self.lv_id(&guard, name)?;
        self.apply_locked(&mut guard, &[Op::LvRename { id, new_name: new_name.to_owned() }])
    }

    pub fn add_tag(&self, name: &str, tag: Tag) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let id = self.lv_id(&guard, name)?;
        self.apply_locked(&mut guard, &[Op::LvAddTag { id, tag }])
    }

    pub fn remove_tag(&self, name: &str, tag: Tag) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let id = self.lv_id(&guard, name)?;
        self.apply_locked(&mut guard, &[Op::LvRemoveTag { id, tag }])
    }

    pub fn set_status(&self, name: &str, status: Vec<LvStatus>) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let id = self.lv_id(&guard, name)?;
        self.apply_locked(&mut guard, &[Op::LvSetStatus { id, status }])
    }

    fn lv_id(&self, inner: &Inner, name: &str) -> Result<Uuid> {
        inner
            .metadata
            .lv_by_name(name)
            .map(|lv| lv.id)
            .ok_or_else(|| Error::UnknownLv { name: name.to_owned() })
    }
}
