//! Free-space accounting: sets of physical extents keyed by PV name.

use core::fmt;

use crate::{Error, Result};

/// The stable key a segment uses to refer to a physical volume.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PvName(String);

impl PvName {
    /// PV names are emitted as bare keys in the metadata text, so they
    /// follow the identifier grammar on top of the length bound.
    pub fn of_string(s: &str) -> Result<Self> {
        if s.len() > 128 || !crate::config::valid_ident(s) {
            return Err(Error::msg(format!("bad PV name {s:?}")));
        }
        Ok(PvName(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PvName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A run of physical extents. `count` is never zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtentInterval {
    pub start: u64,
    pub count: u64,
}

impl ExtentInterval {
    pub fn end(&self) -> u64 {
        self.start + self.count
    }
}

/// An ordered set of extent intervals across PVs, kept canonical: sorted
/// by `(pv, start)`, same-PV intervals disjoint and non-adjacent, no
/// empty intervals.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Allocation(Vec<(PvName, ExtentInterval)>);

fn canonicalize(mut xs: Vec<(PvName, ExtentInterval)>) -> Vec<(PvName, ExtentInterval)> {
    xs.retain(|(_, iv)| iv.count > 0);
    xs.sort_by(|a, b| (&a.0, a.1.start).cmp(&(&b.0, b.1.start)));
    let mut out: Vec<(PvName, ExtentInterval)> = Vec::with_capacity(xs.len());
    for (name, iv) in xs {
        match out.last_mut() {
            Some((last_name, last)) if *last_name == name && iv.start <= last.end() => {
                let end = last.end().max(iv.end());
                last.count = end - last.start;
            }
            _ => out.push((name, iv)),
        }
    }
    out
}

impl Allocation {
    pub fn empty() -> Self {
        Allocation(Vec::new())
    }

    /// The whole of one PV: `[0, pe_count)`.
    pub fn create(name: PvName, pe_count: u64) -> Self {
        if pe_count == 0 {
            return Self::empty();
        }
        Allocation(vec![(name, ExtentInterval { start: 0, count: pe_count })])
    }

    pub fn of_intervals(xs: Vec<(PvName, ExtentInterval)>) -> Self {
        Allocation(canonicalize(xs))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of extents.
    pub fn size(&self) -> u64 {
        self.0.iter().map(|(_, iv)| iv.count).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(PvName, ExtentInterval)> {
        self.0.iter()
    }

    pub fn merge(&self, other: &Allocation) -> Allocation {
        let mut xs = self.0.clone();
        xs.extend(other.0.iter().cloned());
        Allocation(canonicalize(xs))
    }

    /// `self \ other`. `other` must be wholly contained in `self`;
    /// a non-subset argument is a programmer error and fails fast.
    pub fn sub(&self, other: &Allocation) -> Result<Allocation> {
        let mut out: Vec<(PvName, ExtentInterval)> = Vec::new();
        let mut covered = 0u64;
        for (name, iv) in &self.0 {
            let mut pieces = vec![*iv];
            for (oname, oiv) in &other.0 {
                if oname != name {
                    continue;
                }
                let mut next = Vec::with_capacity(pieces.len() + 1);
                for p in pieces {
                    if oiv.end() <= p.start || oiv.start >= p.end() {
                        next.push(p);
                        continue;
                    }
                    let lo = oiv.start.max(p.start);
                    let hi = oiv.end().min(p.end());
                    covered += hi - lo;
                    if lo > p.start {
                        next.push(ExtentInterval { start: p.start, count: lo - p.start });
                    }
                    if hi < p.end() {
                        next.push(ExtentInterval { start: hi, count: p.end() - hi });
                    }
                }
                pieces = next;
            }
            out.extend(pieces.into_iter().map(|p| (name.clone(), p)));
        }
        if covered != other.size() {
            return Err(Error::msg(
                "allocation subtraction of a non-subset".to_owned(),
            ));
        }
        Ok(Allocation(canonicalize(out)))
    }

    /// Whether every extent of `other` is present in `self`.
    pub fn contains(&self, other: &Allocation) -> bool {
        self.sub(other).is_ok()
    }

    fn intervals_of<'a>(&'a self, name: &'a PvName) -> impl Iterator<Item = &'a ExtentInterval> {
        self.0.iter().filter_map(move |(n, iv)| (n == name).then_some(iv))
    }

    /// First-fit allocation of `need` extents, scanning PVs in the order
    /// given (the VG's `pvs` order) and each PV's intervals by ascending
    /// start. Does not mutate `self`.
    pub fn find(&self, need: u64, order: &[PvName]) -> Result<Allocation> {
        let mut chosen = Vec::new();
        let mut remaining = need;
        for name in order {
            for iv in self.intervals_of(name) {
                if remaining == 0 {
                    break;
                }
                let take = iv.count.min(remaining);
                chosen.push((name.clone(), ExtentInterval { start: iv.start, count: take }));
                remaining -= take;
            }
        }
        if remaining > 0 {
            return Err(Error::OnlyThisMuchFree { needed: need, available: self.size() });
        }
        Ok(Allocation(canonicalize(chosen)))
    }
}

impl FromIterator<(PvName, ExtentInterval)> for Allocation {
    fn from_iter<T: IntoIterator<Item = (PvName, ExtentInterval)>>(iter: T) -> Self {
        Allocation(canonicalize(iter.into_iter().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pv(s: &str) -> PvName {
        PvName::of_string(s).unwrap()
    }

    fn iv(start: u64, count: u64) -> ExtentInterval {
        ExtentInterval { start, count }
    }

    #[test]
    fn merge_coalesces_adjacent() {
        let a = Allocation::of_intervals(vec![(pv("a"), iv(0, 4))]);
        let b = Allocation::of_intervals(vec![(pv("a"), iv(4, 4)), (pv("b"), iv(2, 2))]);
        let m = a.merge(&b);
        assert_eq!(
            m,
            Allocation::of_intervals(vec![(pv("a"), iv(0, 8)), (pv("b"), iv(2, 2))])
        );
        assert_eq!(m.size(), 10);
    }

    #[test]
    fn sub_splits_intervals() {
        let a = Allocation::of_intervals(vec![(pv("a"), iv(0, 10))]);
        let b = Allocation::of_intervals(vec![(pv("a"), iv(3, 2))]);
        let d = a.sub(&b).unwrap();
        assert_eq!(
            d,
            Allocation::of_intervals(vec![(pv("a"), iv(0, 3)), (pv("a"), iv(5, 5))])
        );
    }

    #[test]
    fn sub_rejects_non_subset() {
        let a = Allocation::of_intervals(vec![(pv("a"), iv(0, 4))]);
        let b = Allocation::of_intervals(vec![(pv("a"), iv(2, 4))]);
        assert!(a.sub(&b).is_err());
        let c = Allocation::of_intervals(vec![(pv("b"), iv(0, 1))]);
        assert!(a.sub(&c).is_err());
    }

    #[test]
    fn find_first_fit_in_pv_order() {
        let free = Allocation::of_intervals(vec![
            (pv("a"), iv(2, 3)),
            (pv("a"), iv(8, 2)),
            (pv("b"), iv(0, 10)),
        ]);
        let order = [pv("a"), pv("b")];
        let got = free.find(6, &order).unwrap();
        assert_eq!(
            got,
            Allocation::of_intervals(vec![
                (pv("a"), iv(2, 3)),
                (pv("a"), iv(8, 2)),
                (pv("b"), iv(0, 1)),
            ])
        );
        // find does not mutate the free map
        assert_eq!(free.size(), 15);
    }

    #[test]
    fn find_reports_total_free() {
        let free = Allocation::of_intervals(vec![(pv("a"), iv(0, 16)), (pv("b"), iv(0, 16))]);
        let order = [pv("a"), pv("b")];
        match free.find(40, &order) {
            Err(Error::OnlyThisMuchFree { needed: 40, available: 32 }) => (),
            other => panic!("unexpected: {other:?}"),
        }
    }

    fn arb_alloc() -> impl Strategy<Value = Allocation> {
        proptest::collection::vec(
            ("[ab]", 0u64..64, 1u64..8).prop_map(|(n, s, c)| (pv(&n), iv(s, c))),
            0..8,
        )
        .prop_map(Allocation::of_intervals)
    }

    proptest! {
        #[test]
        fn merge_then_sub_is_identity(a in arb_alloc(), b in arb_alloc()) {
            // (a ∪ b) \ b ⊇ a \ b, and sizes are conserved
            let merged = a.merge(&b);
            prop_assert!(merged.size() <= a.size() + b.size());
            let d = merged.sub(&b).unwrap();
            prop_assert_eq!(d.merge(&b), merged);
        }

        #[test]
        fn find_is_a_subset_of_free(free in arb_alloc(), n in 0u64..32) {
            let order = [pv("a"), pv("b")];
            match free.find(n, &order) {
                Ok(chosen) => {
                    prop_assert_eq!(chosen.size(), n);
                    prop_assert!(free.contains(&chosen));
                }
                Err(Error::OnlyThisMuchFree { needed, available }) => {
                    prop_assert_eq!(needed, n);
                    prop_assert_eq!(available, free.size());
                    prop_assert!(available < n);
                }
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
        }
    }
}
