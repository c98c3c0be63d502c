//! The volume-group model: an immutable value materialized from the
//! textual metadata and re-emitted byte-compatibly. All mutation goes
//! through [`op::do_op`].

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::allocation::{Allocation, PvName};
use crate::config::{self, Value};
use crate::lv::{self, Lv, LvStatus, Tag};
use crate::segment::{self, LinearSegment, Segment, SegmentKind};
use crate::uuid::Uuid;
use crate::{Error, Result, SECTOR_SIZE};

use self::deserialize::{LvDesc, SegmentDesc, VgDesc};

pub(crate) mod deserialize;
pub mod op;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VgStatus {
    Read,
    Write,
    Resizeable,
    Clustered,
}

impl VgStatus {
    pub fn of_string(s: &str) -> Result<Self> {
        match s {
            "READ" => Ok(VgStatus::Read),
            "WRITE" => Ok(VgStatus::Write),
            "RESIZEABLE" => Ok(VgStatus::Resizeable),
            "CLUSTERED" => Ok(VgStatus::Clustered),
            _ => Err(Error::msg(format!("unknown VG status {s:?}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VgStatus::Read => "READ",
            VgStatus::Write => "WRITE",
            VgStatus::Resizeable => "RESIZEABLE",
            VgStatus::Clustered => "CLUSTERED",
        }
    }
}

/// A physical volume as the textual metadata describes it.
#[derive(Clone, Debug, PartialEq)]
pub struct Pv {
    pub id: Uuid,
    pub name: PvName,
    pub device: String,
    /// Sector where extent 0 begins.
    pub pe_start: u64,
    pub pe_count: u64,
}

impl Pv {
    /// The whole of this PV as an allocation.
    pub fn full_extents(&self) -> Allocation {
        Allocation::create(self.name.clone(), self.pe_count)
    }
}

/// One volume group. Values are immutable: every mutation produces a
/// fresh `Metadata` with a bumped `seqno`.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    pub name: String,
    pub id: Uuid,
    pub creation_host: String,
    pub creation_time: i64,
    pub seqno: u32,
    pub status: Vec<VgStatus>,
    /// In 512-byte sectors.
    pub extent_size: u64,
    pub max_lv: u32,
    pub max_pv: u32,
    pub pvs: Vec<Pv>,
    pub lvs: BTreeMap<Uuid, Lv>,
    pub free_space: Allocation,
}

impl Metadata {
    pub fn extent_bytes(&self) -> u64 {
        self.extent_size * SECTOR_SIZE
    }

    pub fn full_extents(&self) -> Allocation {
        self.pvs
            .iter()
            .map(Pv::full_extents)
            .fold(Allocation::empty(), |acc, a| acc.merge(&a))
    }

    pub fn used_extents(&self) -> Allocation {
        self.lvs
            .values()
            .map(Lv::to_allocation)
            .fold(Allocation::empty(), |acc, a| acc.merge(&a))
    }

    pub fn lv_by_name(&self, name: &str) -> Option<&Lv> {
        self.lvs.values().find(|lv| lv.name == name)
    }

    pub fn pv_by_name(&self, name: &PvName) -> Option<&Pv> {
        self.pvs.iter().find(|pv| &pv.name == name)
    }

    /// Allocation order: PVs as listed in the metadata.
    pub fn pv_order(&self) -> Vec<PvName> {
        self.pvs.iter().map(|pv| pv.name.clone()).collect()
    }

    /// Materialize a volume group from its metadata text, rebuilding
    /// the free-space map from the difference between the PVs' extents
    /// and every LV's allocation.
    pub fn of_text(text: &str) -> Result<Metadata> {
        let tree = config::parse_text(text)?;
        let fields = tree.expect_struct("<toplevel>")?;
        let (vg_name, vg_value) = fields
            .iter()
            .find(|(_, v)| matches!(v, Value::Struct(_)))
            .ok_or_else(|| Error::msg("no volume group block in metadata"))?;
        let creation_host = tree.expect_mapped_string("<toplevel>", "creation_host")?.to_owned();
        let creation_time = tree.expect_mapped_int("<toplevel>", "creation_time")?;

        let desc = VgDesc::deserialize(vg_value).map_err(|e| Error::Parse {
            path: vg_name.clone(),
            error: e.to_string(),
        })?;

        let status = desc
            .status
            .iter()
            .map(|s| VgStatus::of_string(s))
            .collect::<Result<Vec<_>>>()?;

        let mut pvs = Vec::new();
        for (name, pv) in desc.physical_volumes.0 {
            pvs.push(Pv {
                id: pv.id,
                name: PvName::of_string(&name)?,
                device: pv.device,
                pe_start: pv.pe_start,
                pe_count: pv.pe_count,
            });
        }

        let mut lvs = BTreeMap::new();
        for (name, lv) in desc.logical_volumes.0 {
            let lv = build_lv(&name, lv)?;
            if lvs.insert(lv.id, lv).is_some() {
                return Err(Error::msg(format!("duplicate LV id in {vg_name}")));
            }
        }

        let mut meta = Metadata {
            name: vg_name.clone(),
            id: desc.id,
            creation_host,
            creation_time,
            seqno: desc.seqno,
            status,
            extent_size: desc.extent_size,
            max_lv: desc.max_lv,
            max_pv: desc.max_pv,
            pvs,
            lvs,
            free_space: Allocation::empty(),
        };
        meta.free_space = meta.full_extents().sub(&meta.used_extents()).map_err(|_| {
            Error::msg(format!(
                "LVs of {vg_name} are not covered by its physical extents"
            ))
        })?;
        Ok(meta)
    }

    fn to_tree(&self) -> Value {
        let mut vg = Vec::new();
        vg.push(("id".to_owned(), Value::Str(self.id.to_string())));
        vg.push(("seqno".to_owned(), Value::Int(self.seqno as i64)));
        vg.push((
            "status".to_owned(),
            Value::Array(self.status.iter().map(|s| Value::Str(s.as_str().to_owned())).collect()),
        ));
        vg.push(("extent_size".to_owned(), Value::Int(self.extent_size as i64)));
        vg.push(("max_lv".to_owned(), Value::Int(self.max_lv as i64)));
        vg.push(("max_pv".to_owned(), Value::Int(self.max_pv as i64)));

        let pvs = self
            .pvs
            .iter()
            .map(|pv| {
                let fields = vec![
                    ("id".to_owned(), Value::Str(pv.id.to_string())),
                    ("device".to_owned(), Value::Str(pv.device.clone())),
                    (
                        "status".to_owned(),
                        Value::Array(vec![Value::Str("ALLOCATABLE".to_owned())]),
                    ),
                    ("pe_start".to_owned(), Value::Int(pv.pe_start as i64)),
                    ("pe_count".to_owned(), Value::Int(pv.pe_count as i64)),
                ];
                (pv.name.as_str().to_owned(), Value::Struct(fields))
            })
            .collect();
        vg.push(("physical_volumes".to_owned(), Value::Struct(pvs)));

        if !self.lvs.is_empty() {
            let mut by_name: Vec<&Lv> = self.lvs.values().collect();
            by_name.sort_by(|a, b| a.name.cmp(&b.name));
            let lvs = by_name
                .into_iter()
                .map(|lv| (lv.name.clone(), Value::Struct(emit_lv(lv))))
                .collect();
            vg.push(("logical_volumes".to_owned(), Value::Struct(lvs)));
        }

        Value::Struct(vec![(self.name.clone(), Value::Struct(vg))])
    }

    /// Render the metadata text exactly as it is stored on disk.
    pub fn to_text(&self) -> String {
        let tree = match self.to_tree() {
            Value::Struct(fields) => fields,
            _ => unreachable!(),
        };
        let mut out = config::emit_text(&tree);
        out.push_str(&format!(
            "# Generated by MLVM version 0.1: {} {}\n",
            self.creation_host, self.creation_time
        ));
        let trailer = vec![
            ("contents".to_owned(), Value::Str("Text Format Volume Group".to_owned())),
            ("version".to_owned(), Value::Int(1)),
            ("description".to_owned(), Value::Str(String::new())),
            ("creation_host".to_owned(), Value::Str(self.creation_host.clone())),
            ("creation_time".to_owned(), Value::Int(self.creation_time)),
        ];
        out.push_str(&config::emit_text(&trailer));
        out
    }
}

fn build_segment(lv_name: &str, d: &SegmentDesc) -> Result<Segment> {
    if d.r#type != "striped" {
        return Err(Error::msg(format!(
            "unsupported segment type {:?} in LV {lv_name}",
            d.r#type
        )));
    }
    let stripes = d
        .stripes
        .as_ref()
        .ok_or_else(|| Error::msg(format!("segment in LV {lv_name} has no stripes")))?;
    let stripe_count = d.stripe_count.unwrap_or(stripes.0.len() as u64);
    if stripe_count as usize != stripes.0.len() || stripes.0.is_empty() {
        return Err(Error::msg(format!("bad stripe count in LV {lv_name}")));
    }
    let kind = if stripe_count == 1 {
        let (pv, off) = &stripes.0[0];
        SegmentKind::Linear(LinearSegment {
            pv_name: PvName::of_string(pv)?,
            pv_start_extent: *off,
        })
    } else {
        let stripe_size = d.stripe_size.ok_or_else(|| {
            Error::msg(format!("striped segment in LV {lv_name} has no stripe_size"))
        })?;
        SegmentKind::Striped {
            stripe_size,
            stripes: stripes
                .0
                .iter()
                .map(|(pv, off)| Ok((PvName::of_string(pv)?, *off)))
                .collect::<Result<Vec<_>>>()?,
        }
    };
    Ok(Segment { start_extent: d.start_extent, extent_count: d.extent_count, kind })
}

fn build_lv(name: &str, desc: LvDesc) -> Result<Lv> {
    lv::validate_name(name)?;
    let status = desc
        .status
        .iter()
        .map(|s| LvStatus::of_string(s))
        .collect::<Result<Vec<_>>>()?;
    let tags = desc
        .tags
        .iter()
        .map(|t| Tag::of_string(t))
        .collect::<Result<Vec<_>>>()?;
    let mut segments = desc
        .segments
        .0
        .values()
        .map(|d| build_segment(name, d))
        .collect::<Result<Vec<_>>>()?;
    segment::sort(&mut segments);
    segment::validate(&segments)?;
    if segments.len() != desc.segment_count {
        return Err(Error::msg(format!("segment count mismatch in LV {name}")));
    }
    Ok(Lv {
        id: desc.id,
        name: name.to_owned(),
        tags,
        status,
        creation_host: desc.creation_host,
        creation_time: desc.creation_time,
        segments,
    })
}

fn emit_segment(seg: &Segment) -> Vec<(String, Value)> {
    let mut fields = vec![
        ("start_extent".to_owned(), Value::Int(seg.start_extent as i64)),
        ("extent_count".to_owned(), Value::Int(seg.extent_count as i64)),
        ("type".to_owned(), Value::Str("striped".to_owned())),
    ];
    match &seg.kind {
        SegmentKind::Linear(l) => {
            fields.push(("stripe_count".to_owned(), Value::Int(1)));
            fields.push((
                "stripes".to_owned(),
                Value::Array(vec![
                    Value::Str(l.pv_name.as_str().to_owned()),
                    Value::Int(l.pv_start_extent as i64),
                ]),
            ));
        }
        SegmentKind::Striped { stripe_size, stripes } => {
            fields.push(("stripe_count".to_owned(), Value::Int(stripes.len() as i64)));
            fields.push(("stripe_size".to_owned(), Value::Int(*stripe_size as i64)));
            let mut flat = Vec::with_capacity(stripes.len() * 2);
            for (pv, off) in stripes {
                flat.push(Value::Str(pv.as_str().to_owned()));
                flat.push(Value::Int(*off as i64));
            }
            fields.push(("stripes".to_owned(), Value::Array(flat)));
        }
    }
    fields
}

fn emit_lv(lv: &Lv) -> Vec<(String, Value)> {
    let mut fields = vec![
        ("id".to_owned(), Value::Str(lv.id.to_string())),
        (
            "status".to_owned(),
            Value::Array(lv.status.iter().map(|s| Value::Str(s.as_str().to_owned())).collect()),
        ),
    ];
    if !lv.tags.is_empty() {
        fields.push((
            "tags".to_owned(),
            Value::Array(lv.tags.iter().map(|t| Value::Str(t.as_str().to_owned())).collect()),
        ));
    }
    fields.push(("creation_host".to_owned(), Value::Str(lv.creation_host.clone())));
    fields.push(("creation_time".to_owned(), Value::Int(lv.creation_time)));
    fields.push(("segment_count".to_owned(), Value::Int(lv.segments.len() as i64)));
    for (i, seg) in lv.segments.iter().enumerate() {
        fields.push((format!("segment{}", i + 1), Value::Struct(emit_segment(seg))));
    }
    fields
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::allocation::ExtentInterval;

    fn pv_name(s: &str) -> PvName {
        PvName::of_string(s).unwrap()
    }

    fn fixed_uuid(fill: char) -> Uuid {
        Uuid::of_string(&fill.to_string().repeat(32)).unwrap()
    }

    pub(crate) fn sample() -> Metadata {
        let pvs = vec![
            Pv {
                id: fixed_uuid('A'),
                name: pv_name("pv0"),
                device: "/dev/pv0".to_owned(),
                pe_start: 16384,
                pe_count: 14,
            },
            Pv {
                id: fixed_uuid('B'),
                name: pv_name("pv1"),
                device: "/dev/pv1".to_owned(),
                pe_start: 16384,
                pe_count: 14,
            },
        ];
        let lv = Lv {
            id: fixed_uuid('L'),
            name: "v1".to_owned(),
            tags: vec![Tag::of_string("nightly").unwrap()],
            status: vec![LvStatus::Read, LvStatus::Write, LvStatus::Visible],
            creation_host: "host".to_owned(),
            creation_time: 1234,
            segments: vec![Segment::linear(0, 2, pv_name("pv0"), 0)],
        };
        let mut meta = Metadata {
            name: "vg0".to_owned(),
            id: fixed_uuid('G'),
            creation_host: "host".to_owned(),
            creation_time: 1234,
            seqno: 2,
            status: vec![VgStatus::Read, VgStatus::Write, VgStatus::Resizeable],
            extent_size: 8192,
            max_lv: 0,
            max_pv: 0,
            pvs,
            lvs: [(lv.id, lv)].into(),
            free_space: Allocation::empty(),
        };
        meta.free_space = meta.full_extents().sub(&meta.used_extents()).unwrap();
        meta
    }

    #[test]
    fn text_roundtrip() {
        let meta = sample();
        let text = meta.to_text();
        let back = Metadata::of_text(&text).unwrap();
        assert_eq!(back, meta);
        // and the re-emission is byte-identical
        assert_eq!(back.to_text(), text);
    }

    #[test]
    fn free_space_is_rebuilt() {
        let meta = sample();
        let back = Metadata::of_text(&meta.to_text()).unwrap();
        assert_eq!(
            back.free_space,
            Allocation::of_intervals(vec![
                (pv_name("pv0"), ExtentInterval { start: 2, count: 12 }),
                (pv_name("pv1"), ExtentInterval { start: 0, count: 14 }),
            ])
        );
    }

    #[test]
    fn striped_segments_survive_roundtrip() {
        let mut meta = sample();
        let lv = Lv {
            id: Uuid::create(),
            name: "vs".to_owned(),
            tags: vec![],
            status: vec![LvStatus::Read, LvStatus::Visible],
            creation_host: "host".to_owned(),
            creation_time: 5,
            segments: vec![Segment {
                start_extent: 0,
                extent_count: 4,
                kind: SegmentKind::Striped {
                    stripe_size: 16,
                    stripes: vec![(pv_name("pv0"), 4), (pv_name("pv1"), 0)],
                },
            }],
        };
        meta.lvs.insert(lv.id, lv);
        meta.free_space = meta.full_extents().sub(&meta.used_extents()).unwrap();
        let back = Metadata::of_text(&meta.to_text()).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn overcommitted_lvs_are_rejected() {
        let mut meta = sample();
        let lv = Lv {
            id: Uuid::create(),
            name: "vbad".to_owned(),
            tags: vec![],
            status: vec![LvStatus::Read],
            creation_host: "host".to_owned(),
            creation_time: 5,
            // overlaps v1's extents on pv0
            segments: vec![Segment::linear(0, 4, pv_name("pv0"), 0)],
        };
        meta.lvs.insert(lv.id, lv);
        assert!(Metadata::of_text(&meta.to_text()).is_err());
    }
}
