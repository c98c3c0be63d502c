//! Logical volume records.

use core::fmt;

use crate::allocation::Allocation;
use crate::config;
use crate::segment::{self, Segment};
use crate::uuid::Uuid;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LvStatus {
    Read,
    Write,
    Visible,
}

impl LvStatus {
    pub fn of_string(s: &str) -> Result<Self> {
        match s {
            "READ" => Ok(LvStatus::Read),
            "WRITE" => Ok(LvStatus::Write),
            "VISIBLE" => Ok(LvStatus::Visible),
            _ => Err(Error::msg(format!("unknown LV status {s:?}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LvStatus::Read => "READ",
            LvStatus::Write => "WRITE",
            LvStatus::Visible => "VISIBLE",
        }
    }
}

/// A user tag on an LV. `of_string` is the only constructor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag(String);

impl Tag {
    pub fn of_string(s: &str) -> Result<Self> {
        let ok = !s.is_empty()
            && s.len() <= 128
            && s.bytes().all(|b| b.is_ascii_alphanumeric() || b"_+.-".contains(&b));
        if !ok {
            return Err(Error::msg(format!("bad tag {s:?}")));
        }
        Ok(Tag(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// LV names stand as bare keys in the metadata text, so they follow
/// the identifier grammar.
pub fn validate_name(s: &str) -> Result<()> {
    if s.len() > 128 || !config::valid_ident(s) {
        return Err(Error::msg(format!("bad LV name {s:?}")));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
pub struct Lv {
    pub id: Uuid,
    pub name: String,
    pub tags: Vec<Tag>,
    pub status: Vec<LvStatus>,
    pub creation_host: String,
    pub creation_time: i64,
    /// Sorted by `start_extent`, gapless from zero.
    pub segments: Vec<Segment>,
}

impl Lv {
    pub fn size_extents(&self) -> u64 {
        segment::size_extents(&self.segments)
    }

    pub fn to_allocation(&self) -> Allocation {
        segment::to_allocation(&self.segments)
    }

    pub fn find_extent(&self, le: u64) -> Option<&Segment> {
        segment::find_extent(&self.segments, le)
    }

    pub fn is_writable(&self) -> bool {
        self.status.contains(&LvStatus::Write)
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_validated() {
        assert!(Tag::of_string("backup-2024.1_a+b").is_ok());
        assert!(Tag::of_string("").is_err());
        assert!(Tag::of_string("no spaces").is_err());
        assert!(Tag::of_string(&"x".repeat(129)).is_err());
    }

    #[test]
    fn lv_names_are_bare_keys() {
        assert!(validate_name("v1").is_ok());
        assert!(validate_name("_snap").is_ok());
        assert!(validate_name("2lv").is_err());
        assert!(validate_name("a-b").is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn status_roundtrip() {
        for s in [LvStatus::Read, LvStatus::Write, LvStatus::Visible] {
            assert_eq!(LvStatus::of_string(s.as_str()).unwrap(), s);
        }
        assert!(LvStatus::of_string("FANCY").is_err());
    }
}
