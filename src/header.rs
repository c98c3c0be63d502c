//! The binary on-disk structures of a PV: the `LABELONE` label block,
//! the PV header it carries, and the metadata-area header.
//!
//! Offsets and sizes on the wire are in bytes, little-endian.

use nom::bytes::complete::{tag, take};
use nom::error::ParseError;
use nom::multi::many_till;
use nom::number::complete::{le_u32, le_u64};
use nom::IResult;

use crate::uuid::Uuid;
use crate::{Error, Result, SECTOR_SIZE};

pub const LABEL_MAGIC: &[u8; 8] = b"LABELONE";
pub const LABEL_TYPE: &[u8; 8] = b"LVM2 001";
pub const MDA_MAGIC: &[u8; 16] = b" LVM2 x[5A%r0N*>"; // lol
pub const MDA_VERSION: u32 = 1;

/// Which sector of the first four carries the label.
pub const LABEL_SECTOR: u64 = 1;

// LVM seeds its CRC with 0xf597a6cf and skips the final complement; map
// that onto the IEEE hasher by complementing on the way in and out.
const INITIAL_CRC: u32 = 0xf597_a6cf;

pub fn crc32(data: &[u8]) -> u32 {
    crc32_parts(&[data])
}

pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(!INITIAL_CRC);
    for p in parts {
        hasher.update(p);
    }
    !hasher.finalize()
}

/// Volume-group layout discriminator, persisted in the raw-location
/// flags of every metadata area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Magic {
    /// Stock LVM2 on-disk format.
    Lvm,
    /// LVM2 layout plus a dedicated redo-log LV.
    Journalled,
}

const RAW_LOCATION_JOURNALLED: u32 = 0x2;

impl Magic {
    pub fn to_flags(self) -> u32 {
        match self {
            Magic::Lvm => 0,
            Magic::Journalled => RAW_LOCATION_JOURNALLED,
        }
    }

    pub fn of_flags(flags: u32) -> Magic {
        if flags & RAW_LOCATION_JOURNALLED != 0 {
            Magic::Journalled
        } else {
            Magic::Lvm
        }
    }
}

// spec: https://github.com/libyal/libvslvm/blob/main/documentation/Logical%20Volume%20Manager%20(LVM)%20format.asciidoc#2-physical-volume-label

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelHeader {
    pub sector: u64,
    pub crc: u32,
    pub data_offset: u32,
}

impl LabelHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(LABEL_MAGIC)(input)?;
        let (input, sector) = le_u64(input)?;
        let (input, crc) = le_u32(input)?;
        let (input, data_offset) = le_u32(input)?;
        let (input, _) = tag(LABEL_TYPE)(input)?;
        Ok((input, Self { sector, crc, data_offset }))
    }
}

/// A `(offset, size)` descriptor from the zero-terminated data-area and
/// metadata-area lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskArea {
    pub offset: u64,
    pub size: u64,
}

impl DiskArea {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, offset) = le_u64(input)?;
        let (input, size) = le_u64(input)?;
        Ok((input, Self { offset, size }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PvHeader {
    pub id: Uuid,
    pub device_size: u64,
    pub data_areas: Vec<DiskArea>,
    pub metadata_areas: Vec<DiskArea>,
}

impl PvHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, raw_id) = take(32usize)(input)?;
        let id = Uuid::of_raw(raw_id).map_err(|_| {
            nom::Err::Failure(nom::error::Error::from_error_kind(
                raw_id,
                nom::error::ErrorKind::Char,
            ))
        })?;
        let (input, device_size) = le_u64(input)?;
        let (input, (data_areas, _)) = many_till(DiskArea::parse, tag(&[0u8; 16]))(input)?;
        let (input, (metadata_areas, _)) = many_till(DiskArea::parse, tag(&[0u8; 16]))(input)?;
        Ok((input, Self { id, device_size, data_areas, metadata_areas }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawLocation {
    /// Byte offset of the metadata text, relative to the mda start.
    pub offset: u64,
    pub size: u64,
    pub checksum: u32,
    pub flags: u32,
}

impl RawLocation {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, offset) = le_u64(input)?;
        let (input, size) = le_u64(input)?;
        let (input, checksum) = le_u32(input)?;
        let (input, flags) = le_u32(input)?;
        Ok((input, Self { offset, size, checksum, flags }))
    }

    pub fn magic(&self) -> Magic {
        Magic::of_flags(self.flags)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MdaHeader {
    /// Byte offset of this metadata area on the device.
    pub start: u64,
    pub size: u64,
    /// Newest first; at most the two most recent are kept.
    pub raw_locations: Vec<RawLocation>,
}

impl MdaHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], (u32, u32, Self)> {
        let (input, checksum) = le_u32(input)?;
        let (input, _) = tag(MDA_MAGIC)(input)?;
        let (input, version) = le_u32(input)?;
        let (input, start) = le_u64(input)?;
        let (input, size) = le_u64(input)?;
        let (input, (raw_locations, _)) = many_till(RawLocation::parse, tag(&[0u8; 24]))(input)?;
        Ok((input, (checksum, version, Self { start, size, raw_locations })))
    }
}

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

/// Build the 512-byte label sector (label header + PV header).
pub fn emit_label_sector(pvh: &PvHeader) -> [u8; 512] {
    let mut buf = [0u8; 512];
    put(&mut buf, 0, LABEL_MAGIC);
    put(&mut buf, 8, &LABEL_SECTOR.to_le_bytes());
    // crc at 16 patched last
    put(&mut buf, 20, &32u32.to_le_bytes()); // pv header follows the label
    put(&mut buf, 24, LABEL_TYPE);
    let mut at = 32;
    put(&mut buf, at, pvh.id.as_bytes());
    at += 32;
    put(&mut buf, at, &pvh.device_size.to_le_bytes());
    at += 8;
    let zero = DiskArea { offset: 0, size: 0 };
    for area in pvh.data_areas.iter().chain(std::iter::once(&zero)) {
        put(&mut buf, at, &area.offset.to_le_bytes());
        put(&mut buf, at + 8, &area.size.to_le_bytes());
        at += 16;
    }
    for area in pvh.metadata_areas.iter().chain(std::iter::once(&zero)) {
        put(&mut buf, at, &area.offset.to_le_bytes());
        put(&mut buf, at + 8, &area.size.to_le_bytes());
        at += 16;
    }
    let crc = crc32(&buf[20..]);
    put(&mut buf, 16, &crc.to_le_bytes());
    buf
}

/// Parse and verify a label sector.
pub fn parse_label_sector(buf: &[u8]) -> Result<(LabelHeader, PvHeader)> {
    if buf.len() < SECTOR_SIZE as usize || &buf[0..8] != LABEL_MAGIC {
        return Err(Error::WrongMagic);
    }
    let (_, lh) = LabelHeader::parse(buf).map_err(|e| Error::Parse {
        path: "label".to_owned(),
        error: e.to_string(),
    })?;
    if lh.crc != crc32(&buf[20..512]) {
        return Err(Error::msg("corrupt PV label"));
    }
    let (_, pvh) = PvHeader::parse(&buf[lh.data_offset as usize..]).map_err(|e| Error::Parse {
        path: "pv_header".to_owned(),
        error: e.to_string(),
    })?;
    Ok((lh, pvh))
}

/// Build the 512-byte metadata-area header sector.
pub fn emit_mda_sector(mda: &MdaHeader) -> [u8; 512] {
    let mut buf = [0u8; 512];
    // checksum at 0 patched last
    put(&mut buf, 4, MDA_MAGIC);
    put(&mut buf, 20, &MDA_VERSION.to_le_bytes());
    put(&mut buf, 24, &mda.start.to_le_bytes());
    put(&mut buf, 32, &mda.size.to_le_bytes());
    let mut at = 40;
    for loc in &mda.raw_locations {
        put(&mut buf, at, &loc.offset.to_le_bytes());
        put(&mut buf, at + 8, &loc.size.to_le_bytes());
        put(&mut buf, at + 16, &loc.checksum.to_le_bytes());
        put(&mut buf, at + 20, &loc.flags.to_le_bytes());
        at += 24;
    }
    // the zero terminator is already there
    let crc = crc32(&buf[4..]);
    put(&mut buf, 0, &crc.to_le_bytes());
    buf
}

/// Parse and verify a metadata-area header sector.
pub fn parse_mda_sector(buf: &[u8]) -> Result<MdaHeader> {
    if buf.len() < 512 {
        return Err(Error::msg("corrupt metadata"));
    }
    let (_, (checksum, version, mda)) = MdaHeader::parse(buf).map_err(|e| Error::Parse {
        path: "mda_header".to_owned(),
        error: e.to_string(),
    })?;
    if checksum != crc32(&buf[4..512]) {
        return Err(Error::msg("corrupt metadata"));
    }
    if version != MDA_VERSION {
        return Err(Error::msg(format!("unsupported metadata version {version}")));
    }
    Ok(mda)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lvm_crc_of_empty_is_the_seed() {
        assert_eq!(crc32(&[]), INITIAL_CRC);
    }

    #[test]
    fn crc_parts_equals_whole() {
        let data = b"some metadata text, wrapped";
        assert_eq!(crc32(data), crc32_parts(&[&data[..9], &data[9..]]));
    }

    #[test]
    fn label_sector_roundtrip() {
        let pvh = PvHeader {
            id: Uuid::create(),
            device_size: 64 * 1024 * 1024,
            data_areas: vec![DiskArea { offset: 8 * 1024 * 1024, size: 0 }],
            metadata_areas: vec![DiskArea { offset: 4096, size: 4 * 1024 * 1024 }],
        };
        let sector = emit_label_sector(&pvh);
        let (lh, parsed) = parse_label_sector(&sector).unwrap();
        assert_eq!(lh.sector, LABEL_SECTOR);
        assert_eq!(parsed, pvh);
    }

    #[test]
    fn label_sector_crc_is_checked() {
        let pvh = PvHeader {
            id: Uuid::create(),
            device_size: 1024,
            data_areas: vec![],
            metadata_areas: vec![],
        };
        let mut sector = emit_label_sector(&pvh);
        sector[40] ^= 0xff;
        assert!(matches!(parse_label_sector(&sector), Err(Error::Msg { .. })));
        sector[0] = b'X';
        assert!(matches!(parse_label_sector(&sector), Err(Error::WrongMagic)));
    }

    #[test]
    fn mda_sector_roundtrip() {
        let mda = MdaHeader {
            start: 4096,
            size: 4 * 1024 * 1024,
            raw_locations: vec![
                RawLocation {
                    offset: 512,
                    size: 331,
                    checksum: 7,
                    flags: Magic::Journalled.to_flags(),
                },
                RawLocation { offset: 1024, size: 200, checksum: 9, flags: 0 },
            ],
        };
        let sector = emit_mda_sector(&mda);
        let parsed = parse_mda_sector(&sector).unwrap();
        assert_eq!(parsed, mda);
        assert_eq!(parsed.raw_locations[0].magic(), Magic::Journalled);
        assert_eq!(parsed.raw_locations[1].magic(), Magic::Lvm);
    }
}
