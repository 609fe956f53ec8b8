//! 128-bit channel and instance identifiers in the little-endian GUID layout
//! (`data1`, `data2` and `data3` stored little-endian, `data4` as raw bytes).

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[repr(transparent)]
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, Default, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct Guid([u8; 16]);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid GUID string: {0:?}")]
pub struct GuidParseError(pub String);

impl Guid {
    pub const NIL: Guid = Guid([0; 16]);

    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        let a = data1.to_le_bytes();
        let b = data2.to_le_bytes();
        let c = data3.to_le_bytes();
        Guid([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], data4[0], data4[1], data4[2], data4[3],
            data4[4], data4[5], data4[6], data4[7],
        ])
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Guid(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }

    fn data1(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    fn data2(&self) -> u16 {
        u16::from_le_bytes([self.0[4], self.0[5]])
    }

    fn data3(&self) -> u16 {
        u16::from_le_bytes([self.0[6], self.0[7]])
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.0[8..];
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1(),
            self.data2(),
            self.data3(),
            d[0],
            d[1],
            d[2],
            d[3],
            d[4],
            d[5],
            d[6],
            d[7]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Guid {
    type Err = GuidParseError;

    /// Accepts `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`, optionally wrapped in braces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || GuidParseError(s.to_string());
        let trimmed = s
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(s);

        let groups: Vec<&str> = trimmed.split('-').collect();
        if !trimmed.is_ascii()
            || groups.len() != 5
            || groups
                .iter()
                .zip([8, 4, 4, 4, 12])
                .any(|(g, len)| g.len() != len)
        {
            return Err(err());
        }

        let data1 = u32::from_str_radix(groups[0], 16).map_err(|_| err())?;
        let data2 = u16::from_str_radix(groups[1], 16).map_err(|_| err())?;
        let data3 = u16::from_str_radix(groups[2], 16).map_err(|_| err())?;

        let tail = format!("{}{}", groups[3], groups[4]);
        let mut data4 = [0u8; 8];
        for (i, byte) in data4.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&tail[i * 2..i * 2 + 2], 16).map_err(|_| err())?;
        }

        Ok(Guid::new(data1, data2, data3, data4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROLVM: Guid = Guid::new(
        0x2b3c2d10,
        0x7ef5,
        0x4ad8,
        [0xb9, 0x66, 0x34, 0x48, 0xb7, 0x38, 0x6b, 0x3d],
    );

    #[test]
    fn test_display_is_canonical_lowercase() {
        assert_eq!(
            CONTROLVM.to_string(),
            "2b3c2d10-7ef5-4ad8-b966-3448b7386b3d"
        );
    }

    #[test]
    fn test_byte_layout_is_little_endian_groups() {
        let bytes = CONTROLVM.as_bytes();
        assert_eq!(&bytes[..4], &[0x10, 0x2d, 0x3c, 0x2b]);
        assert_eq!(&bytes[4..6], &[0xf5, 0x7e]);
        assert_eq!(&bytes[6..8], &[0xd8, 0x4a]);
        assert_eq!(&bytes[8..], &[0xb9, 0x66, 0x34, 0x48, 0xb7, 0x38, 0x6b, 0x3d]);
    }

    #[test]
    fn test_parse_accepts_braces_and_uppercase() {
        let parsed: Guid = "{2B3C2D10-7EF5-4AD8-B966-3448B7386B3D}".parse().unwrap();
        assert_eq!(parsed, CONTROLVM);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("2b3c2d10-7ef5-4ad8-b966".parse::<Guid>().is_err());
        assert!("2b3c2d10-7ef5-4ad8-b966-3448b7386bzz".parse::<Guid>().is_err());
        assert!("".parse::<Guid>().is_err());
    }

    #[test]
    fn test_nil() {
        assert!(Guid::NIL.is_nil());
        assert!(!CONTROLVM.is_nil());
        assert_eq!(Guid::default(), Guid::NIL);
    }
}
