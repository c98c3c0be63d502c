//! LVM UUIDs: 32 characters from `[A-Za-z0-9]`, displayed with hyphens
//! in a 6-4-4-4-4-4-6 grouping.

use core::fmt;

use rand::Rng;
use serde::{de, Deserialize, Deserializer};

use crate::{Error, Result};

const ALPHABET: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const GROUPS: [usize; 7] = [6, 4, 4, 4, 4, 4, 6];

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid([u8; 32]);

impl Uuid {
    /// Draw a fresh UUID from OS entropy.
    pub fn create() -> Self {
        let mut rng = rand::rngs::OsRng;
        let mut buf = [0u8; 32];
        for b in buf.iter_mut() {
            *b = ALPHABET[rng.gen_range(0..ALPHABET.len())];
        }
        Uuid(buf)
    }

    /// Accepts both the hyphenated display form and the raw 32-char form.
    pub fn of_string(s: &str) -> Result<Self> {
        let mut buf = [0u8; 32];
        let mut n = 0;
        for b in s.bytes() {
            if b == b'-' {
                continue;
            }
            if !b.is_ascii_alphanumeric() {
                return Err(Error::msg(format!("bad character in UUID {s:?}")));
            }
            if n == 32 {
                return Err(Error::msg(format!("UUID too long: {s:?}")));
            }
            buf[n] = b;
            n += 1;
        }
        if n != 32 {
            return Err(Error::msg(format!("UUID too short: {s:?}")));
        }
        Ok(Uuid(buf))
    }

    /// The raw form stored in the PV label.
    pub(crate) fn of_raw(raw: &[u8]) -> Result<Self> {
        let s = core::str::from_utf8(raw)
            .map_err(|_| Error::msg("UUID is not valid UTF-8"))?;
        Self::of_string(s)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The unhyphenated form.
    pub fn as_str(&self) -> &str {
        // only ever constructed from ASCII alphanumerics
        core::str::from_utf8(&self.0).unwrap()
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut at = 0;
        for (i, width) in GROUPS.iter().enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            f.write_str(&self.as_str()[at..at + width])?;
            at += width;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({self})")
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Uuid::of_string(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let u = Uuid::create();
        assert_eq!(Uuid::of_string(&u.to_string()).unwrap(), u);
        assert_eq!(Uuid::of_string(u.as_str()).unwrap(), u);
    }

    #[test]
    fn display_grouping() {
        let u = Uuid::of_string("abcdefghijklmnopqrstuvwxyz012345").unwrap();
        assert_eq!(u.to_string(), "abcdef-ghij-klmn-opqr-stuv-wxyz-012345");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Uuid::of_string("short").is_err());
        assert!(Uuid::of_string(&"_".repeat(32)).is_err());
        assert!(Uuid::of_string(&"a".repeat(33)).is_err());
    }
}
