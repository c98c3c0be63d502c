//! Reading and writing physical volumes: the label block at sector 1
//! and the circular metadata text buffer behind each mda header.

use tracing::{debug, trace, warn};

use crate::allocation::PvName;
use crate::block::Block;
use crate::header::{
    self, DiskArea, Magic, MdaHeader, PvHeader, RawLocation, LABEL_SECTOR,
};
use crate::uuid::Uuid;
use crate::{Error, Result, MAX_METADATA_SIZE, MDA_SIZE, MDA_START, SECTOR_SIZE};

/// Everything the binary structures on one PV tell us.
#[derive(Clone, Debug)]
pub struct PhysicalVolume {
    pub header: PvHeader,
    pub mdas: Vec<MdaHeader>,
}

impl PhysicalVolume {
    pub fn id(&self) -> Uuid {
        self.header.id
    }

    /// The layout discriminator recorded in the newest raw location.
    pub fn magic(&self) -> Magic {
        self.mdas
            .first()
            .and_then(|mda| mda.raw_locations.first())
            .map(|loc| loc.magic())
            .unwrap_or(Magic::Lvm)
    }
}

/// Read and verify the label and every advertised mda header.
pub fn read_label(device: &dyn Block) -> Result<PhysicalVolume> {
    let mut sector = [0u8; 512];
    device.read_at(LABEL_SECTOR * SECTOR_SIZE, &mut sector)?;
    let (_, pv_header) = header::parse_label_sector(&sector)?;
    trace!(?pv_header);
    let mut mdas = Vec::new();
    for area in &pv_header.metadata_areas {
        device.read_at(area.offset, &mut sector)?;
        let mda = header::parse_mda_sector(&sector)?;
        trace!(?mda);
        mdas.push(mda);
    }
    Ok(PhysicalVolume { header: pv_header, mdas })
}

pub fn write_label(device: &dyn Block, pv_header: &PvHeader) -> Result<()> {
    let sector = header::emit_label_sector(pv_header);
    device.write_at(LABEL_SECTOR * SECTOR_SIZE, &sector)?;
    device.sync()
}

// the circular text buffer spans [mda.start + 512, mda.start + mda.size)

fn buffer_size(mda: &MdaHeader) -> u64 {
    mda.size - 512
}

fn read_circular(device: &dyn Block, mda: &MdaHeader, offset: u64, size: u64) -> Result<Vec<u8>> {
    let cap = buffer_size(mda);
    if size > cap || offset < 512 || offset >= mda.size {
        return Err(Error::msg("corrupt metadata"));
    }
    let mut out = vec![0u8; size as usize];
    let first = (mda.size - offset).min(size);
    device.read_at(mda.start + offset, &mut out[..first as usize])?;
    if first < size {
        device.read_at(mda.start + 512, &mut out[first as usize..])?;
    }
    Ok(out)
}

fn write_circular(device: &dyn Block, mda: &MdaHeader, offset: u64, data: &[u8]) -> Result<()> {
    let size = data.len() as u64;
    let cap = buffer_size(mda);
    if size > cap || offset < 512 || offset >= mda.size {
        return Err(Error::msg("metadata too large"));
    }
    let first = (mda.size - offset).min(size);
    device.write_at(mda.start + offset, &data[..first as usize])?;
    if first < size {
        device.write_at(mda.start + 512, &data[first as usize..])?;
    }
    Ok(())
}

/// Read the newest metadata text behind `mda`, tolerating one torn
/// write by falling back to the previous raw location.
pub fn read_metadata(device: &dyn Block, mda: &MdaHeader) -> Result<String> {
    let mut tried = false;
    for loc in mda.raw_locations.iter().filter(|l| l.size > 0) {
        tried = true;
        let bytes = read_circular(device, mda, loc.offset, loc.size)?;
        if header::crc32(&bytes) != loc.checksum {
            warn!(offset = loc.offset, "metadata checksum mismatch, trying older copy");
            continue;
        }
        return String::from_utf8(bytes).map_err(|_| Error::msg("corrupt metadata"));
    }
    if tried {
        Err(Error::msg("corrupt metadata"))
    } else {
        Err(Error::msg("no metadata present"))
    }
}

fn align_up(x: u64, to: u64) -> u64 {
    x.div_ceil(to) * to
}

/// Append a fresh metadata text to the circular buffer and publish it
/// in the header, keeping the previous copy as a fallback. Ordering:
/// text bytes, barrier, header.
pub fn write_metadata(device: &dyn Block, mda: &MdaHeader, text: &str) -> Result<MdaHeader> {
    let size = text.len() as u64;
    if size > MAX_METADATA_SIZE || size > buffer_size(mda) {
        return Err(Error::msg("metadata too large"));
    }
    let newest = mda.raw_locations.first();
    let offset = match newest {
        Some(loc) if loc.size > 0 => {
            let next = align_up(loc.offset + loc.size, SECTOR_SIZE);
            // relative offsets live in [512, mda.size)
            512 + (next - 512) % buffer_size(mda)
        }
        _ => 512,
    };
    write_circular(device, mda, offset, text.as_bytes())?;
    device.sync()?;
    let mut locations = vec![RawLocation {
        offset,
        size,
        checksum: header::crc32(text.as_bytes()),
        flags: newest.map(|l| l.flags).unwrap_or(0),
    }];
    locations.extend(mda.raw_locations.iter().filter(|l| l.size > 0).take(1));
    let mda = MdaHeader { start: mda.start, size: mda.size, raw_locations: locations };
    device.write_at(mda.start, &header::emit_mda_sector(&mda))?;
    device.sync()?;
    debug!(start = mda.start, offset, size, "metadata written");
    Ok(mda)
}

/// Stamp a fresh label, PV header and empty metadata area. Returns the
/// new PV identity and its extent geometry `(pe_start, pe_count)` in
/// sectors and extents respectively.
pub fn format(
    device: &dyn Block,
    name: &PvName,
    magic: Magic,
    extent_size: u64,
) -> Result<(PhysicalVolume, u64, u64)> {
    let info = device.get_info();
    let device_size = info.size_sectors * info.sector_size as u64;
    let extent_bytes = extent_size * SECTOR_SIZE;
    let pe_start_bytes = align_up(MDA_START + MDA_SIZE, extent_bytes);
    if device_size < pe_start_bytes + extent_bytes {
        return Err(Error::msg(format!(
            "device {name} too small: {device_size} bytes"
        )));
    }
    let pe_count = (device_size - pe_start_bytes) / extent_bytes;

    let mda = MdaHeader {
        start: MDA_START,
        size: MDA_SIZE,
        // an empty location still records the layout magic
        raw_locations: vec![RawLocation { offset: 512, size: 0, checksum: 0, flags: magic.to_flags() }],
    };
    device.write_at(mda.start, &header::emit_mda_sector(&mda))?;

    let pv_header = PvHeader {
        id: Uuid::create(),
        device_size,
        data_areas: vec![DiskArea { offset: pe_start_bytes, size: 0 }],
        metadata_areas: vec![DiskArea { offset: MDA_START, size: MDA_SIZE }],
    };
    write_label(device, &pv_header)?;
    debug!(%name, id = %pv_header.id, pe_count, "formatted PV");
    Ok((
        PhysicalVolume { header: pv_header, mdas: vec![mda] },
        pe_start_bytes / SECTOR_SIZE,
        pe_count,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlock;
    use crate::DEFAULT_EXTENT_SIZE;

    fn pv(s: &str) -> PvName {
        PvName::of_string(s).unwrap()
    }

    #[test]
    fn format_then_read_label() {
        let dev = MemBlock::new(64 * 1024 * 1024);
        let (pv0, pe_start, pe_count) =
            format(&dev, &pv("a"), Magic::Lvm, DEFAULT_EXTENT_SIZE).unwrap();
        // 4 MiB extents on a 64 MiB device: mda pushes pe_start to 8 MiB
        assert_eq!(pe_start, 16384);
        assert_eq!(pe_count, 14);
        let back = read_label(&dev).unwrap();
        assert_eq!(back.header, pv0.header);
        assert_eq!(back.mdas, pv0.mdas);
        assert_eq!(back.magic(), Magic::Lvm);
    }

    #[test]
    fn blank_device_is_not_a_pv() {
        let dev = MemBlock::new(1024 * 1024);
        assert!(matches!(read_label(&dev), Err(Error::WrongMagic)));
    }

    #[test]
    fn metadata_roundtrip_keeps_previous_copy() {
        let dev = MemBlock::new(64 * 1024 * 1024);
        let (pv0, _, _) = format(&dev, &pv("a"), Magic::Journalled, DEFAULT_EXTENT_SIZE).unwrap();
        let mda = pv0.mdas[0].clone();
        assert!(matches!(read_metadata(&dev, &mda), Err(Error::Msg { .. })));

        let mda = write_metadata(&dev, &mda, "vg0 {\n}\n").unwrap();
        assert_eq!(read_metadata(&dev, &mda).unwrap(), "vg0 {\n}\n");
        assert_eq!(mda.raw_locations[0].magic(), Magic::Journalled);

        let mda2 = write_metadata(&dev, &mda, "vg0 {\nseqno = 2\n}\n").unwrap();
        assert_eq!(read_metadata(&dev, &mda2).unwrap(), "vg0 {\nseqno = 2\n}\n");
        assert_eq!(mda2.raw_locations.len(), 2);
        // the older copy is still intact where the header says it is
        assert_eq!(mda2.raw_locations[1], mda.raw_locations[0]);

        // a torn newest copy falls back to the previous one
        let mut torn = mda2.clone();
        torn.raw_locations[0].checksum ^= 1;
        assert_eq!(read_metadata(&dev, &torn).unwrap(), "vg0 {\n}\n");
    }

    #[test]
    fn oversized_metadata_is_rejected() {
        let dev = MemBlock::new(64 * 1024 * 1024);
        let (pv0, _, _) = format(&dev, &pv("a"), Magic::Lvm, DEFAULT_EXTENT_SIZE).unwrap();
        let text = "x".repeat((MAX_METADATA_SIZE + 1) as usize);
        assert!(matches!(
            write_metadata(&dev, &pv0.mdas[0], &text),
            Err(Error::Msg { .. })
        ));
    }

    #[test]
    fn circular_buffer_wraps() {
        let dev = MemBlock::new(64 * 1024 * 1024);
        let mda = MdaHeader {
            start: 4096,
            size: 2048, // tiny buffer: 1536 bytes of text space
            raw_locations: vec![RawLocation { offset: 512, size: 0, checksum: 0, flags: 0 }],
        };
        let mut mda = mda;
        let a = "a".repeat(1000);
        let b = "b".repeat(1000);
        mda = write_metadata(&dev, &mda, &a).unwrap();
        assert_eq!(read_metadata(&dev, &mda).unwrap(), a);
        mda = write_metadata(&dev, &mda, &b).unwrap();
        // the second text wrapped around the end of the buffer
        assert!(mda.raw_locations[0].offset + 1000 > mda.size);
        assert_eq!(read_metadata(&dev, &mda).unwrap(), b);
    }
}
