//! Logical volumes as block devices: sector reads and writes translated
//! through the segment map onto the PVs underneath.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::allocation::PvName;
use crate::block::{Block, BlockInfo};
use crate::lv::Lv;
use crate::metadata::Metadata;
use crate::segment::SegmentKind;
use crate::{Error, Result, SECTOR_SIZE};

/// An open LV. Holds the LV record and per-PV geometry from a metadata
/// snapshot plus shared handles to the underlying devices; the VG
/// session retains ownership of the devices themselves.
pub struct Volume {
    lv: Lv,
    /// In sectors, from the snapshot.
    extent_size: u64,
    sector_size: u32,
    /// `pv name -> sector where extent 0 begins`.
    pe_starts: BTreeMap<PvName, u64>,
    devices: BTreeMap<PvName, Arc<dyn Block>>,
    connected: AtomicBool,
}

impl Volume {
    /// Open `lv_name` against a metadata snapshot. All underlying
    /// devices must agree on a sector size.
    pub(crate) fn connect(
        meta: &Metadata,
        devices: &[(PvName, Arc<dyn Block>)],
        lv_name: &str,
    ) -> Result<Volume> {
        let lv = meta
            .lv_by_name(lv_name)
            .ok_or_else(|| Error::UnknownLv { name: lv_name.to_owned() })?;
        let by_name: BTreeMap<PvName, Arc<dyn Block>> =
            devices.iter().map(|(n, d)| (n.clone(), d.clone())).collect();

        let mut sector_size = None;
        let mut pe_starts = BTreeMap::new();
        let mut needed = BTreeMap::new();
        for seg in &lv.segments {
            let pv_names: Vec<&PvName> = match &seg.kind {
                SegmentKind::Linear(l) => vec![&l.pv_name],
                SegmentKind::Striped { stripes, .. } => stripes.iter().map(|(pv, _)| pv).collect(),
            };
            for name in pv_names {
                let dev = by_name
                    .get(name)
                    .ok_or_else(|| Error::msg(format!("PV {name} is not connected")))?;
                let info = dev.get_info();
                match sector_size {
                    None => sector_size = Some(info.sector_size),
                    Some(s) if s != info.sector_size => {
                        return Err(Error::msg(format!(
                            "mismatched sector sizes under LV {lv_name}: {s} vs {}",
                            info.sector_size
                        )))
                    }
                    Some(_) => (),
                }
                let pv = meta
                    .pv_by_name(name)
                    .ok_or_else(|| Error::msg(format!("unknown PV {name}")))?;
                pe_starts.insert(name.clone(), pv.pe_start);
                needed.insert(name.clone(), dev.clone());
            }
        }
        Ok(Volume {
            lv: lv.clone(),
            extent_size: meta.extent_size,
            sector_size: sector_size.unwrap_or(SECTOR_SIZE as u32),
            pe_starts,
            devices: needed,
            connected: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.lv.name
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    fn extent_bytes(&self) -> u64 {
        self.extent_size * SECTOR_SIZE
    }

    /// Translate a byte offset into (device, device byte offset, bytes
    /// usable before the extent boundary).
    fn translate(&self, offset: u64, len: u64) -> Result<(&Arc<dyn Block>, u64, u64)> {
        let extent_bytes = self.extent_bytes();
        let le = offset / extent_bytes;
        let off = offset % extent_bytes;
        let seg = self
            .lv
            .find_extent(le)
            .ok_or_else(|| Error::msg(format!("logical extent {le} is not mapped")))?;
        let linear = match &seg.kind {
            SegmentKind::Linear(l) => l,
            SegmentKind::Striped { .. } => {
                return Err(Error::msg("striped segments are not supported for I/O"))
            }
        };
        let dev = self
            .devices
            .get(&linear.pv_name)
            .ok_or_else(|| Error::msg(format!("unknown PV {}", linear.pv_name)))?;
        let pe_start = self.pe_starts[&linear.pv_name];
        let pe = linear.pv_start_extent + (le - seg.start_extent);
        let dev_offset = pe_start * SECTOR_SIZE + pe * extent_bytes + off;
        let chunk = len.min(extent_bytes - off);
        trace!(le, pe, dev_offset, chunk, "translated");
        Ok((dev, dev_offset, chunk))
    }

    /// Sector-addressed scatter read.
    pub fn read(&self, sector_start: u64, bufs: &mut [&mut [u8]]) -> Result<()> {
        let mut at = sector_start * self.sector_size as u64;
        for buf in bufs {
            self.check_sized(buf.len())?;
            self.read_at(at, buf)?;
            at += buf.len() as u64;
        }
        Ok(())
    }

    /// Sector-addressed gather write.
    pub fn write(&self, sector_start: u64, bufs: &[&[u8]]) -> Result<()> {
        let mut at = sector_start * self.sector_size as u64;
        for buf in bufs {
            self.check_sized(buf.len())?;
            self.write_at(at, buf)?;
            at += buf.len() as u64;
        }
        Ok(())
    }

    fn check_sized(&self, len: usize) -> Result<()> {
        if len % self.sector_size as usize != 0 {
            return Err(Error::msg(format!(
                "buffer of {len} bytes is not a whole number of sectors"
            )));
        }
        Ok(())
    }
}

impl Block for Volume {
    fn get_info(&self) -> BlockInfo {
        BlockInfo {
            read_write: self.lv.is_writable(),
            sector_size: self.sector_size,
            size_sectors: self.lv.size_extents() * self.extent_size,
        }
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_connected()?;
        let mut at = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let want = (buf.len() - done) as u64;
            let (dev, dev_offset, chunk) = self.translate(at, want)?;
            dev.read_at(dev_offset, &mut buf[done..done + chunk as usize])?;
            at += chunk;
            done += chunk as usize;
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_connected()?;
        let mut at = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let want = (buf.len() - done) as u64;
            let (dev, dev_offset, chunk) = self.translate(at, want)?;
            dev.write_at(dev_offset, &buf[done..done + chunk as usize])?;
            at += chunk;
            done += chunk as usize;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.check_connected()?;
        for dev in self.devices.values() {
            dev.sync()?;
        }
        Ok(())
    }
}
