//! Mapping of logical extents onto physical extents.
//!
//! Within one LV the segment list is sorted by `start_extent`, gapless
//! and starting at zero. Striped segments are carried through parse and
//! emission only; I/O is linear-only.

use crate::allocation::{Allocation, ExtentInterval, PvName};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinearSegment {
    pub pv_name: PvName,
    pub pv_start_extent: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Linear(LinearSegment),
    Striped {
        stripe_size: u64,
        stripes: Vec<(PvName, u64)>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub start_extent: u64,
    pub extent_count: u64,
    pub kind: SegmentKind,
}

impl Segment {
    pub fn linear(start_extent: u64, extent_count: u64, pv_name: PvName, pv_start_extent: u64) -> Self {
        Segment {
            start_extent,
            extent_count,
            kind: SegmentKind::Linear(LinearSegment { pv_name, pv_start_extent }),
        }
    }

    pub fn end_extent(&self) -> u64 {
        self.start_extent + self.extent_count
    }

    /// The physical extents this segment occupies.
    pub fn to_allocation(&self) -> Allocation {
        match &self.kind {
            SegmentKind::Linear(l) => Allocation::of_intervals(vec![(
                l.pv_name.clone(),
                ExtentInterval { start: l.pv_start_extent, count: self.extent_count },
            )]),
            SegmentKind::Striped { stripes, .. } => {
                // each stripe holds its share, rounded up
                let n = stripes.len() as u64;
                let per = self.extent_count.div_ceil(n.max(1));
                stripes
                    .iter()
                    .map(|(pv, off)| (pv.clone(), ExtentInterval { start: *off, count: per }))
                    .collect()
            }
        }
    }
}

pub fn sort(segments: &mut [Segment]) {
    segments.sort_by_key(|s| s.start_extent);
}

/// Total logical extents covered by a (sorted, gapless) segment list.
pub fn size_extents(segments: &[Segment]) -> u64 {
    segments.last().map(Segment::end_extent).unwrap_or(0)
}

/// Check the per-LV invariant: sorted, non-overlapping, gapless from 0.
pub fn validate(segments: &[Segment]) -> Result<()> {
    let mut expect = 0u64;
    for s in segments {
        if s.extent_count == 0 {
            return Err(Error::msg("empty segment"));
        }
        if s.start_extent != expect {
            return Err(Error::msg(format!(
                "segment at extent {} leaves a gap or overlap (expected {expect})",
                s.start_extent
            )));
        }
        expect = s.end_extent();
    }
    Ok(())
}

/// The segment containing logical extent `le`, if mapped.
pub fn find_extent(segments: &[Segment], le: u64) -> Option<&Segment> {
    segments
        .binary_search_by(|s| {
            if le < s.start_extent {
                core::cmp::Ordering::Greater
            } else if le >= s.end_extent() {
                core::cmp::Ordering::Less
            } else {
                core::cmp::Ordering::Equal
            }
        })
        .ok()
        .map(|i| &segments[i])
}

/// Union of the physical extents behind every segment.
pub fn to_allocation(segments: &[Segment]) -> Allocation {
    segments
        .iter()
        .map(Segment::to_allocation)
        .fold(Allocation::empty(), |acc, a| acc.merge(&a))
}

/// Truncate a segment list down to `new_count` logical extents,
/// shortening the last retained segment as needed.
pub fn reduce_size_to(segments: &[Segment], new_count: u64) -> Result<Vec<Segment>> {
    if new_count > size_extents(segments) {
        return Err(Error::msg(format!(
            "cannot reduce an LV of {} extents to {new_count}",
            size_extents(segments)
        )));
    }
    let mut out = Vec::new();
    for s in segments {
        if s.start_extent >= new_count {
            break;
        }
        let mut s = s.clone();
        s.extent_count = s.extent_count.min(new_count - s.start_extent);
        out.push(s);
    }
    sort(&mut out);
    Ok(out)
}

/// Turn an allocator result into linear segments beginning at `start_le`.
pub fn linear(start_le: u64, allocation: &Allocation) -> Vec<Segment> {
    let mut at = start_le;
    let mut out = Vec::new();
    for (pv, iv) in allocation.iter() {
        out.push(Segment::linear(at, iv.count, pv.clone(), iv.start));
        at += iv.count;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pv(s: &str) -> PvName {
        PvName::of_string(s).unwrap()
    }

    fn segs() -> Vec<Segment> {
        vec![
            Segment::linear(0, 4, pv("a"), 10),
            Segment::linear(4, 2, pv("b"), 0),
            Segment::linear(6, 3, pv("a"), 20),
        ]
    }

    #[test]
    fn find_extent_hits_the_right_segment() {
        let s = segs();
        assert_eq!(find_extent(&s, 0).unwrap().start_extent, 0);
        assert_eq!(find_extent(&s, 3).unwrap().start_extent, 0);
        assert_eq!(find_extent(&s, 4).unwrap().start_extent, 4);
        assert_eq!(find_extent(&s, 8).unwrap().start_extent, 6);
        assert!(find_extent(&s, 9).is_none());
    }

    #[test]
    fn validate_catches_gaps() {
        let mut s = segs();
        assert!(validate(&s).is_ok());
        s.remove(1);
        assert!(validate(&s).is_err());
    }

    #[test]
    fn reduce_shortens_the_tail() {
        let s = segs();
        let r = reduce_size_to(&s, 5).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r[1].extent_count, 1);
        assert_eq!(size_extents(&r), 5);
        assert!(reduce_size_to(&s, 10).is_err());
        assert_eq!(reduce_size_to(&s, 0).unwrap(), vec![]);
    }

    #[test]
    fn linear_of_allocation_is_gapless() {
        let a = Allocation::of_intervals(vec![
            (pv("a"), ExtentInterval { start: 2, count: 3 }),
            (pv("b"), ExtentInterval { start: 0, count: 2 }),
        ]);
        let s = linear(4, &a);
        assert_eq!(s[0].start_extent, 4);
        assert_eq!(s[1].start_extent, 7);
        assert_eq!(size_extents(&s), 9);
        assert!(validate(&reduce_size_to(&s, 9).unwrap()).is_err()); // starts at 4, not 0
    }

    #[test]
    fn striped_allocation_rounds_up() {
        let s = Segment {
            start_extent: 0,
            extent_count: 5,
            kind: SegmentKind::Striped {
                stripe_size: 16,
                stripes: vec![(pv("a"), 0), (pv("b"), 0)],
            },
        };
        // 5 extents over 2 stripes: 3 per stripe
        assert_eq!(s.to_allocation().size(), 6);
    }

    proptest! {
        #[test]
        fn find_extent_containment(counts in proptest::collection::vec(1u64..8, 1..6), le in 0u64..64) {
            let mut segs = Vec::new();
            let mut at = 0;
            for (i, c) in counts.iter().enumerate() {
                segs.push(Segment::linear(at, *c, pv(if i % 2 == 0 { "a" } else { "b" }), at * 2));
                at += c;
            }
            match find_extent(&segs, le) {
                Some(s) => {
                    prop_assert!(le >= s.start_extent && le < s.end_extent());
                }
                None => prop_assert!(le >= size_extents(&segs)),
            }
        }
    }
}
