use crate::registry::FsKind;
use crate::Result;
use bincode::{deserialize, serialize_into};
use serde::{Deserialize, Serialize};

/// Offset of the BIOS Parameter Block in a boot sector.
pub const BPB_OFFSET: usize = 11;
/// Media descriptor of a fixed disc.
pub const MEDIA_FIXED_DISK: u8 = 0xf8;
/// BIOS number of the first hard disc.
pub const BIOS_FIRST_HARD_DISK: u8 = 0x80;
/// Signature of the extended boot block (FAT12/16 and FAT32 alike).
pub const EXTENDED_BOOT_SIGNATURE: u8 = 0x29;
/// Size of the boot sectors written by this crate.
pub const BOOT_SECTOR_SIZE: usize = 512;

const OEM_NAME: [u8; 8] = *b"MSWIN4.1";
const OEM_NAME_RANGE: std::ops::Range<usize> = 3..11;
const FAT_EXTENDED_OFFSET: usize = 36;
const FAT32_EXTENDED_OFFSET: usize = 64;
const FAT_BOOT_CODE_OFFSET: usize = 62;
const FAT32_BOOT_CODE_OFFSET: usize = 90;
const SIGNATURE_OFFSET: usize = 510;

/// The DOS 3.31 BIOS Parameter Block, found at byte 11 of every FAT boot sector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiosParameterBlock {
    /// Bytes per logical sector.
    pub bytes_per_sector: u16,
    /// Logical sectors per cluster.
    pub sectors_per_cluster: u8,
    /// Reserved logical sectors before the first FAT.
    pub reserved_sectors: u16,
    /// Number of FATs.
    pub fat_count: u8,
    /// Number of root directory entries (0 on FAT32).
    pub root_entries: u16,
    /// Total logical sectors when they fit in 16 bits.
    pub total_sectors_16: u16,
    /// Media descriptor.
    pub media_descriptor: u8,
    /// Logical sectors per FAT (0 on FAT32).
    pub sectors_per_fat: u16,
    /// Sectors per track.
    pub sectors_per_track: u16,
    /// Number of heads.
    pub heads: u16,
    /// Sectors preceding the partition.
    pub hidden_sectors: u32,
    /// Total logical sectors.
    pub total_sectors_32: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Fat32Block {
    sectors_per_fat: u32,
    flags: u16,
    version: u16,
    root_cluster: u32,
    fs_info_sector: u16,
    backup_boot_sector: u16,
    reserved: [u8; 12],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExtendedBlock {
    drive_number: u8,
    reserved: u8,
    signature: u8,
    volume_id: u32,
    volume_label: [u8; 11],
    filesystem_type: [u8; 8],
}

/// Builds a FAT boot sector: jump instruction, OEM name, BIOS Parameter Block, extended block
/// for the FAT variant, boot code (truncated to the space left) and the 0x55 0xAA signature.
///
/// The data region is left to the external format operation.
pub fn build_fat_boot_sector(
    kind: &FsKind,
    bpb: &BiosParameterBlock,
    drive_number: u8,
    volume_id: u32,
    boot_code: &[u8],
) -> Result<Vec<u8>> {
    let mut sector = vec![0; BOOT_SECTOR_SIZE];
    let fat32 = *kind == FsKind::Fat32;

    sector[0..3].copy_from_slice(if fat32 {
        &[0xeb, 0x58, 0x90]
    } else {
        &[0xeb, 0x3c, 0x90]
    });
    sector[OEM_NAME_RANGE].copy_from_slice(&OEM_NAME);
    serialize_into(&mut sector[BPB_OFFSET..FAT_EXTENDED_OFFSET], bpb)?;

    let extended = ExtendedBlock {
        drive_number,
        reserved: 0,
        signature: EXTENDED_BOOT_SIGNATURE,
        volume_id,
        volume_label: *b"NO NAME    ",
        filesystem_type: filesystem_type(kind),
    };
    let code_offset = if fat32 {
        let block = Fat32Block {
            root_cluster: 2,
            fs_info_sector: 1,
            backup_boot_sector: 6,
            ..Default::default()
        };
        serialize_into(
            &mut sector[FAT_EXTENDED_OFFSET..FAT32_EXTENDED_OFFSET],
            &block,
        )?;
        serialize_into(
            &mut sector[FAT32_EXTENDED_OFFSET..FAT32_BOOT_CODE_OFFSET],
            &extended,
        )?;
        FAT32_BOOT_CODE_OFFSET
    } else {
        serialize_into(
            &mut sector[FAT_EXTENDED_OFFSET..FAT_BOOT_CODE_OFFSET],
            &extended,
        )?;
        FAT_BOOT_CODE_OFFSET
    };

    let len = boot_code.len().min(SIGNATURE_OFFSET - code_offset);
    sector[code_offset..code_offset + len].copy_from_slice(&boot_code[..len]);
    sector[SIGNATURE_OFFSET] = 0x55;
    sector[SIGNATURE_OFFSET + 1] = 0xaa;

    Ok(sector)
}

fn filesystem_type(kind: &FsKind) -> [u8; 8] {
    match kind {
        FsKind::Fat12 => *b"FAT12   ",
        FsKind::Fat16 => *b"FAT16   ",
        FsKind::Fat32 => *b"FAT32   ",
        FsKind::Other(_) => *b"FAT     ",
    }
}

/// Reads the BIOS Parameter Block of a boot sector.
pub fn read_bpb(sector: &[u8]) -> Result<BiosParameterBlock> {
    Ok(deserialize(sector.get(BPB_OFFSET..).unwrap_or(&[]))?)
}

fn trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

/// The OEM name of a boot sector (bytes 3 to 10), without its padding.
pub fn sniff_oem_name(sector: &[u8]) -> Option<String> {
    let name = trimmed(sector.get(OEM_NAME_RANGE)?);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Sniffs the filesystem of a boot sector and its volume label, dispatching on the first byte
/// of the OEM name.
///
/// NTFS and exFAT keep their label outside of the boot sector; the filesystem name is
/// returned in its place.
pub fn sniff_label(sector: &[u8]) -> Option<(FsKind, String)> {
    if sector.len() < BOOT_SECTOR_SIZE || sector[SIGNATURE_OFFSET..] != [0x55, 0xaa][..] {
        return None;
    }

    match sector[3] {
        b'N' => Some((FsKind::Other("NTFS".to_string()), "NTFS".to_string())),
        b'E' => Some((FsKind::Other("EXFAT".to_string()), "EXFAT".to_string())),
        _ => {
            let (kind, offset) = if sector[FAT32_EXTENDED_OFFSET + 2] == EXTENDED_BOOT_SIGNATURE
                && &sector[82..87] == b"FAT32"
            {
                (FsKind::Fat32, FAT32_EXTENDED_OFFSET)
            } else if sector[FAT_EXTENDED_OFFSET + 2] == EXTENDED_BOOT_SIGNATURE {
                match &sector[54..59] {
                    b"FAT12" => (FsKind::Fat12, FAT_EXTENDED_OFFSET),
                    _ => (FsKind::Fat16, FAT_EXTENDED_OFFSET),
                }
            } else {
                return None;
            };
            let label = trimmed(&sector[offset + 7..offset + 18]);

            Some((kind, label))
        }
    }
}
