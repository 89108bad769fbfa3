use lazy_static::lazy_static;
use std::collections::HashMap;

/// Type GUID of an EFI System partition.
pub const EFI_SYSTEM: [u8; 16] = [
    0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e, 0xc9, 0x3b,
];
/// Type GUID of a Microsoft Reserved partition.
pub const MICROSOFT_RESERVED: [u8; 16] = [
    0x16, 0xe3, 0xc9, 0xe3, 0x5c, 0x0b, 0xb8, 0x4d, 0x81, 0x7d, 0xf9, 0x2d, 0xf0, 0x02, 0x15, 0xae,
];
/// Type GUID of a Basic Data partition (FAT, NTFS, exFAT).
pub const BASIC_DATA: [u8; 16] = [
    0xa2, 0xa0, 0xd0, 0xeb, 0xe5, 0xb9, 0x33, 0x44, 0x87, 0xc0, 0x68, 0xb6, 0xb7, 0x26, 0x99, 0xc7,
];
/// Type GUID of a Windows Recovery Environment partition.
pub const WINDOWS_RECOVERY: [u8; 16] = [
    0xa4, 0xbb, 0x94, 0xde, 0xd1, 0x06, 0x40, 0x4d, 0xa1, 0x6a, 0xbf, 0xd5, 0x01, 0x79, 0xd6, 0xac,
];
/// Type GUID of a Linux swap partition.
pub const LINUX_SWAP: [u8; 16] = [
    0x6d, 0xfd, 0x57, 0x06, 0xab, 0xa4, 0xc4, 0x43, 0x84, 0xe5, 0x09, 0x33, 0xc8, 0x4b, 0x4f, 0x4f,
];
/// Type GUID of a Linux filesystem partition.
pub const LINUX_FILESYSTEM: [u8; 16] = [
    0xaf, 0x3d, 0xc6, 0x0f, 0x83, 0x84, 0x72, 0x47, 0x8e, 0x79, 0x3d, 0x69, 0xd8, 0x47, 0x7d, 0xe4,
];

/// Name given to partition types missing from [`TYPE_NAMES`].
pub const UNKNOWN_TYPE: &str = "UNKNOWN";

lazy_static! {
    /// Display names of the well-known partition type GUIDs.
    pub static ref TYPE_NAMES: HashMap<[u8; 16], &'static str> = {
        let mut m = HashMap::new();
        m.insert(EFI_SYSTEM, "EFI System");
        m.insert(MICROSOFT_RESERVED, "Microsoft Reserved");
        m.insert(BASIC_DATA, "Basic Data");
        m.insert(WINDOWS_RECOVERY, "Windows Recovery");
        m.insert(LINUX_SWAP, "Linux Swap");
        m.insert(LINUX_FILESYSTEM, "Linux Ext");
        m
    };
}

/// Name of a partition type GUID, [`UNKNOWN_TYPE`] if it is not well-known.
pub fn type_name(type_guid: &[u8; 16]) -> &'static str {
    TYPE_NAMES.get(type_guid).copied().unwrap_or(UNKNOWN_TYPE)
}

/// Display a UUID stored in the mixed-endian GUID layout: the first three fields are little
/// endian, the last two are stored as is.
pub trait UUID {
    /// Formats the UUID as `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`.
    fn display_uuid(&self) -> String;
}

impl UUID for [u8; 16] {
    fn display_uuid(&self) -> String {
        let mut digits: Vec<_> = self.iter().collect();
        let mut uuid: Vec<String> = Vec::new();
        uuid.extend(digits.drain(..4).rev().map(|x| format!("{:02X}", x)));
        uuid.push("-".to_string());
        uuid.extend(digits.drain(..2).rev().map(|x| format!("{:02X}", x)));
        uuid.push("-".to_string());
        uuid.extend(digits.drain(..2).rev().map(|x| format!("{:02X}", x)));
        uuid.push("-".to_string());
        uuid.extend(digits.drain(..2).map(|x| format!("{:02X}", x)));
        uuid.push("-".to_string());
        uuid.extend(digits.drain(..).map(|x| format!("{:02X}", x)));

        uuid.into_iter().collect()
    }
}
