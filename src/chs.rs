use serde::de::{Deserialize, Deserializer, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeTuple, Serializer};
use std::convert::TryFrom;

/// The highest cylinder a packed CHS address can hold. BIOSes use it as an overflow marker.
pub const MAX_CYLINDER: u16 = 1023;

// packed fields are 8 bits for the head and 6 bits for the sector
const MAX_HEADS: u64 = 256;
const MAX_SECTORS: u64 = 63;

/// A CHS address (cylinder/head/sector) as packed in a legacy partition entry.
///
/// On disk it takes 3 bytes: the head, then the 6-bit sector with the 2 high bits of the
/// cylinder on top, then the 8 low bits of the cylinder.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CHS {
    /// Cylinder (10 bits).
    pub cylinder: u16,
    /// Head (8 bits).
    pub head: u8,
    /// Sector (6 bits). Sectors are numbered from 1, 0 is never a valid sector.
    pub sector: u8,
}

impl CHS {
    /// Creates a CHS address.
    pub fn new(cylinder: u16, head: u8, sector: u8) -> CHS {
        CHS {
            cylinder,
            head,
            sector,
        }
    }

    /// Creates an empty CHS addressing (0/0/0).
    pub fn empty() -> CHS {
        CHS::new(0, 0, 0)
    }

    /// Check if the CHS address is empty
    pub fn is_empty(&self) -> bool {
        self.cylinder == 0 && self.head == 0 && self.sector == 0
    }

    /// Returns `true` if the address holds one of the BIOS sentinel values: cylinder 1023 (the
    /// LBA did not fit) or sector 0 (no address at all).
    pub fn is_sentinel(&self) -> bool {
        self.cylinder == MAX_CYLINDER || self.sector == 0
    }
}

/// Converts a CHS address to LBA for the given geometry.
///
/// Returns `0` for sentinel addresses (see [`CHS::is_sentinel`]) and degenerate geometries;
/// the caller is then expected to fall back on the raw LBA fields. The geometry is clamped to
/// what a packed address can hold, as in [`lba_to_chs`].
pub fn chs_to_lba(chs: CHS, heads: u64, sectors_per_cylinder: u64) -> u64 {
    if chs.is_sentinel() || heads == 0 || sectors_per_cylinder == 0 {
        return 0;
    }
    let heads = heads.min(MAX_HEADS);
    let sectors_per_cylinder = sectors_per_cylinder.min(MAX_SECTORS);

    let c = u64::from(chs.cylinder);
    let h = u64::from(chs.head);
    let s = u64::from(chs.sector);

    // NOTE: In CHS addressing the sector numbers always start at 1, there is no sector 0
    (c * heads + h) * sectors_per_cylinder + s - 1
}

/// Converts an LBA to a CHS address for the given geometry.
///
/// When the cylinder does not fit below the 1023 marker the address saturates to
/// 1023/`heads - 1`/`sectors_per_cylinder`. This is lossy: [`chs_to_lba`] returns `0` for it.
pub fn lba_to_chs(lba: u64, heads: u64, sectors_per_cylinder: u64) -> CHS {
    if heads == 0 || sectors_per_cylinder == 0 {
        return CHS::empty();
    }

    let heads = heads.min(MAX_HEADS);
    let sectors_per_cylinder = sectors_per_cylinder.min(MAX_SECTORS);
    let cylinder = lba / (heads * sectors_per_cylinder);

    if cylinder >= u64::from(MAX_CYLINDER) {
        return CHS {
            cylinder: MAX_CYLINDER,
            head: u8::try_from(heads - 1).unwrap_or(u8::MAX),
            sector: u8::try_from(sectors_per_cylinder).unwrap_or(63),
        };
    }

    CHS {
        cylinder: u16::try_from(cylinder).unwrap_or(MAX_CYLINDER),
        head: u8::try_from((lba / sectors_per_cylinder) % heads).unwrap_or(u8::MAX),
        sector: u8::try_from(lba % sectors_per_cylinder + 1).unwrap_or(63),
    }
}

struct CHSVisitor;

impl<'de> Visitor<'de> for CHSVisitor {
    type Value = CHS;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("CHS addressing")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<CHS, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut bytes = [0u8; 3];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = seq
                .next_element::<u8>()?
                .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
        }

        Ok(CHS {
            cylinder: (u16::from(bytes[1] & 0xc0) << 2) | u16::from(bytes[2]),
            head: bytes[0],
            sector: bytes[1] & 0x3f,
        })
    }
}

impl<'de> Deserialize<'de> for CHS {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_tuple(3, CHSVisitor)
    }
}

impl Serialize for CHS {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let packed = [
            self.head,
            (self.sector & 0x3f) | ((self.cylinder >> 2) as u8 & 0xc0),
            self.cylinder as u8,
        ];

        let mut seq = serializer.serialize_tuple(3)?;
        for x in packed.iter() {
            seq.serialize_element(x)?;
        }
        seq.end()
    }
}
