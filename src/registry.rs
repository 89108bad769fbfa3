use crate::boot_sector::{self, BiosParameterBlock, BIOS_FIRST_HARD_DISK, MEDIA_FIXED_DISK};
use crate::disc::{BlockDevice, SectorDisc};
use crate::partition_table::{PartitionSlot, SlotKind};
use crate::{Error, Result};
use log::debug;
use std::convert::TryFrom;
use std::fmt;
use std::io;

/// Legacy partition type shared by filesystems that have no code of their own. The filesystem
/// is told apart by the OEM name of its boot sector.
pub const CUSTOM_PARTITION_TYPE: u8 = 0x7f;

/// Name given to partitions that no registered filesystem recognizes.
pub const UNKNOWN_FILESYSTEM: &str = "UNKNOWN";

/// The external operation that formats the data region of a partition once its boot sector
/// has been written.
pub trait Formatter {
    /// Formats `size` sectors starting at `start` on disc `disc` with the filesystem `fs_name`.
    fn format_drive(&self, disc: u32, start: u64, size: u64, fs_name: &str) -> io::Result<()>;
}

/// A [`Formatter`] that leaves the data region untouched.
#[derive(Debug, Copy, Clone, Default)]
pub struct NoFormat;

impl Formatter for NoFormat {
    fn format_drive(&self, _disc: u32, _start: u64, _size: u64, _fs_name: &str) -> io::Result<()> {
        Ok(())
    }
}

/// The filesystem held by a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FsKind {
    /// FAT with 12-bit cluster numbers.
    Fat12,
    /// FAT with 16-bit cluster numbers.
    Fat16,
    /// FAT with 32-bit cluster numbers.
    Fat32,
    /// Any other filesystem, by name.
    Other(String),
}

impl FsKind {
    /// Parses a filesystem name (case-insensitive for the FAT variants).
    pub fn from_name(name: &str) -> FsKind {
        match name.to_ascii_uppercase().as_str() {
            "FAT12" => FsKind::Fat12,
            "FAT16" => FsKind::Fat16,
            "FAT32" => FsKind::Fat32,
            _ => FsKind::Other(name.to_string()),
        }
    }

    /// The name of the filesystem.
    pub fn name(&self) -> &str {
        match self {
            FsKind::Fat12 => "FAT12",
            FsKind::Fat16 => "FAT16",
            FsKind::Fat32 => "FAT32",
            FsKind::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A used partition and the filesystem it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemLeaf {
    /// First sector (LBA, absolute).
    pub start: u64,
    /// Number of sectors.
    pub size: u64,
    /// The filesystem.
    pub kind: FsKind,
    /// The legacy partition type code.
    pub type_code: u8,
    /// The OS drive mounted on this partition, if any.
    pub drive: Option<usize>,
    /// `false` for the generic leaf built when no factory recognized the partition.
    pub formattable: bool,
}

impl FilesystemLeaf {
    /// The generic leaf of a partition that no registered filesystem recognizes.
    pub fn generic(start: u64, size: u64, type_code: u8, name: &str) -> FilesystemLeaf {
        FilesystemLeaf {
            start,
            size,
            kind: FsKind::Other(name.to_string()),
            type_code,
            drive: None,
            formattable: false,
        }
    }

    /// The name of the filesystem.
    pub fn name(&self) -> &str {
        self.kind.name()
    }

    /// The slot occupied by the partition.
    pub fn slot(&self) -> PartitionSlot {
        let kind = if self.formattable {
            SlotKind::Filesystem(self.kind.clone())
        } else {
            SlotKind::LegacyLeaf
        };

        PartitionSlot::new(self.start, self.size, kind)
    }
}

/// What a factory needs to know to build the boot sector of a new partition.
#[derive(Debug, Clone)]
pub struct BootSectorParams<'a> {
    /// Index of the disc.
    pub disc_index: u32,
    /// Size of a sector in bytes.
    pub bytes_per_sector: u64,
    /// Sectors per track.
    pub sectors_per_cylinder: u64,
    /// Number of heads.
    pub heads: u64,
    /// First sector of the partition.
    pub start: u64,
    /// Number of sectors of the partition.
    pub size: u64,
    /// Serial number of the new volume.
    pub volume_id: u32,
    /// Boot code to place after the parameter blocks.
    pub boot_code: &'a [u8],
}

/// Opens and creates the partitions of one filesystem.
pub trait FilesystemFactory {
    /// The filesystem name used to look the factory up (e.g. `"FAT32"`).
    fn name(&self) -> &str;

    /// The legacy partition type written for new partitions.
    fn type_code(&self) -> u8;

    /// Returns `true` if partitions of this legacy type belong to this filesystem.
    fn accepts(&self, type_code: u8) -> bool {
        type_code == self.type_code()
    }

    /// Builds the leaf of an existing partition.
    fn open(&self, start: u64, size: u64, type_code: u8) -> FilesystemLeaf {
        FilesystemLeaf {
            start,
            size,
            kind: FsKind::from_name(self.name()),
            type_code,
            drive: None,
            formattable: true,
        }
    }

    /// Builds the boot sector of a new partition (one sector).
    fn create(&self, params: &BootSectorParams) -> Result<Vec<u8>>;

    /// Formats the data region through the external format operation.
    fn format(
        &self,
        formatter: &dyn Formatter,
        disc: u32,
        start: u64,
        size: u64,
    ) -> Result<()> {
        formatter
            .format_drive(disc, start, size, self.name())
            .map_err(|err| Error::FormatFailed(self.name().to_string(), err))
    }
}

fn fat_bpb(kind: &FsKind, params: &BootSectorParams) -> BiosParameterBlock {
    let fat32 = *kind == FsKind::Fat32;
    let sectors_per_cluster = match params.size {
        x if x < 32_768 => 4,
        x if x < 524_288 => 8,
        x if x < 16_777_216 => 16,
        _ => 64,
    };

    BiosParameterBlock {
        bytes_per_sector: u16::try_from(params.bytes_per_sector).unwrap_or(u16::MAX),
        sectors_per_cluster,
        reserved_sectors: if fat32 { 32 } else { 1 },
        fat_count: 2,
        root_entries: if fat32 { 0 } else { 512 },
        total_sectors_16: 0,
        media_descriptor: MEDIA_FIXED_DISK,
        sectors_per_fat: 0,
        sectors_per_track: u16::try_from(params.sectors_per_cylinder).unwrap_or(u16::MAX),
        heads: u16::try_from(params.heads).unwrap_or(u16::MAX),
        hidden_sectors: u32::try_from(params.start).unwrap_or(u32::MAX),
        total_sectors_32: u32::try_from(params.size.saturating_sub(1)).unwrap_or(u32::MAX),
    }
}

fn fat_boot_sector(kind: FsKind, params: &BootSectorParams) -> Result<Vec<u8>> {
    let bpb = fat_bpb(&kind, params);
    let drive_number = BIOS_FIRST_HARD_DISK.wrapping_add(params.disc_index as u8);
    let mut sector = boot_sector::build_fat_boot_sector(
        &kind,
        &bpb,
        drive_number,
        params.volume_id,
        params.boot_code,
    )?;
    // large sectors keep the boot sector at the start, zero padded
    sector.resize(sector.len().max(params.bytes_per_sector as usize), 0);

    Ok(sector)
}

/// FAT12 (legacy types 0x01 and hidden 0x11).
#[derive(Debug, Copy, Clone, Default)]
pub struct Fat12;

impl FilesystemFactory for Fat12 {
    fn name(&self) -> &str {
        "FAT12"
    }

    fn type_code(&self) -> u8 {
        0x01
    }

    fn accepts(&self, type_code: u8) -> bool {
        matches!(type_code, 0x01 | 0x11)
    }

    fn create(&self, params: &BootSectorParams) -> Result<Vec<u8>> {
        fat_boot_sector(FsKind::Fat12, params)
    }
}

/// FAT16 (legacy types 0x04, 0x06, 0x0E and their hidden variants).
#[derive(Debug, Copy, Clone, Default)]
pub struct Fat16;

impl FilesystemFactory for Fat16 {
    fn name(&self) -> &str {
        "FAT16"
    }

    fn type_code(&self) -> u8 {
        0x06
    }

    fn accepts(&self, type_code: u8) -> bool {
        matches!(type_code, 0x04 | 0x06 | 0x0e | 0x14 | 0x16 | 0x1e)
    }

    fn create(&self, params: &BootSectorParams) -> Result<Vec<u8>> {
        fat_boot_sector(FsKind::Fat16, params)
    }
}

/// FAT32 (legacy types 0x0B, 0x0C and their hidden variants).
#[derive(Debug, Copy, Clone, Default)]
pub struct Fat32;

impl FilesystemFactory for Fat32 {
    fn name(&self) -> &str {
        "FAT32"
    }

    fn type_code(&self) -> u8 {
        0x0c
    }

    fn accepts(&self, type_code: u8) -> bool {
        matches!(type_code, 0x0b | 0x0c | 0x1b | 0x1c)
    }

    fn create(&self, params: &BootSectorParams) -> Result<Vec<u8>> {
        fat_boot_sector(FsKind::Fat32, params)
    }
}

/// The filesystem factories known to the partition engines, with the external format operation
/// they delegate to.
///
/// The registry is built once and passed by reference to the operations that need it. When
/// several factories match, the first registered wins.
///
/// # Examples
///
/// ```
/// use discman::registry::{FilesystemRegistry, NoFormat};
///
/// let registry = FilesystemRegistry::with_fat(Box::new(NoFormat));
/// assert_eq!(registry.find_by_type(0x0c, None).map(|x| x.name()), Some("FAT32"));
/// assert!(registry.find_by_name("EXT4").is_none());
/// ```
pub struct FilesystemRegistry {
    factories: Vec<Box<dyn FilesystemFactory>>,
    formatter: Box<dyn Formatter>,
}

impl fmt::Debug for FilesystemRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|x| x.name()))
            .finish()
    }
}

impl FilesystemRegistry {
    /// Creates an empty registry.
    pub fn new(formatter: Box<dyn Formatter>) -> FilesystemRegistry {
        FilesystemRegistry {
            factories: Vec::new(),
            formatter,
        }
    }

    /// Creates a registry with the FAT12, FAT16 and FAT32 factories.
    pub fn with_fat(formatter: Box<dyn Formatter>) -> FilesystemRegistry {
        let mut registry = FilesystemRegistry::new(formatter);
        registry.register(Box::new(Fat12));
        registry.register(Box::new(Fat16));
        registry.register(Box::new(Fat32));
        registry
    }

    /// Adds a factory.
    pub fn register(&mut self, factory: Box<dyn FilesystemFactory>) {
        debug!("registering filesystem {}", factory.name());
        self.factories.push(factory);
    }

    /// Removes the factories registered under `name` and returns how many were removed.
    pub fn unregister(&mut self, name: &str) -> usize {
        let before = self.factories.len();
        self.factories.retain(|x| x.name() != name);
        before - self.factories.len()
    }

    /// Finds the factory of a legacy partition type, disambiguated by filesystem name if given.
    pub fn find_by_type(&self, type_code: u8, name: Option<&str>) -> Option<&dyn FilesystemFactory> {
        self.factories
            .iter()
            .find(|x| x.accepts(type_code) && name.map_or(true, |name| x.name() == name))
            .map(|x| x.as_ref())
    }

    /// Finds a factory by its exact name.
    pub fn find_by_name(&self, name: &str) -> Option<&dyn FilesystemFactory> {
        self.factories
            .iter()
            .find(|x| x.name() == name)
            .map(|x| x.as_ref())
    }

    /// Builds the leaf of an existing partition.
    ///
    /// Partitions of the [custom type](CUSTOM_PARTITION_TYPE) are matched by the OEM name of
    /// their boot sector. A partition that no factory accepts gets a generic, unformattable leaf.
    pub fn parse<D: BlockDevice>(
        &self,
        disc: &mut SectorDisc<D>,
        type_code: u8,
        start: u64,
        size: u64,
    ) -> Result<FilesystemLeaf> {
        let name = if type_code == CUSTOM_PARTITION_TYPE {
            boot_sector::sniff_oem_name(&disc.read_sector(start)?)
        } else {
            None
        };

        let mut leaf = match self.find_by_type(type_code, name.as_deref()) {
            Some(factory) => factory.open(start, size, type_code),
            None => {
                debug!(
                    "no filesystem for type {:#04x} at sector {}",
                    type_code, start
                );
                FilesystemLeaf::generic(
                    start,
                    size,
                    type_code,
                    name.as_deref().unwrap_or(UNKNOWN_FILESYSTEM),
                )
            }
        };
        leaf.drive = disc.get_drive(start, size);

        Ok(leaf)
    }

    /// Writes the boot sector of a new `fs_name` partition and formats it.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::UnknownFilesystem`] (before any write) if no factory has this name,
    /// and with [`Error::FormatFailed`] if the external format operation fails. The boot sector
    /// is left on disc in the latter case.
    pub fn format<D: BlockDevice>(
        &self,
        disc: &mut SectorDisc<D>,
        fs_name: &str,
        start: u64,
        size: u64,
        boot_code: &[u8],
    ) -> Result<FilesystemLeaf> {
        let factory = self
            .find_by_name(fs_name)
            .ok_or_else(|| Error::UnknownFilesystem(fs_name.to_string()))?;

        let uuid = disc.create_uuid();
        let params = BootSectorParams {
            disc_index: disc.index(),
            bytes_per_sector: disc.bytes_per_sector(),
            sectors_per_cylinder: disc.sectors_per_cylinder(),
            heads: disc.heads(),
            start,
            size,
            volume_id: u32::from_le_bytes([uuid[0], uuid[1], uuid[2], uuid[3]]),
            boot_code,
        };
        let sector = factory.create(&params)?;
        debug!("writing {} boot sector at {}", fs_name, start);
        disc.write(start, &sector)?;
        factory.format(self.formatter.as_ref(), disc.index(), start, size)?;

        let mut leaf = factory.open(start, size, factory.type_code());
        leaf.drive = disc.get_drive(start, size);

        Ok(leaf)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disc::testing::MemoryDevice;
    use crate::disc::DriveLocation;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct MyFs;

    impl FilesystemFactory for MyFs {
        fn name(&self) -> &str {
            "MYFS"
        }

        fn type_code(&self) -> u8 {
            CUSTOM_PARTITION_TYPE
        }

        fn create(&self, params: &BootSectorParams) -> Result<Vec<u8>> {
            let mut sector = vec![0; params.bytes_per_sector as usize];
            sector[3..11].copy_from_slice(b"MYFS    ");
            Ok(sector)
        }
    }

    #[derive(Default, Clone)]
    struct Recorder(Rc<RefCell<Vec<(u32, u64, u64, String)>>>);

    impl Formatter for Recorder {
        fn format_drive(&self, disc: u32, start: u64, size: u64, fs_name: &str) -> io::Result<()> {
            self.0
                .borrow_mut()
                .push((disc, start, size, fs_name.to_string()));
            Ok(())
        }
    }

    struct Broken;

    impl Formatter for Broken {
        fn format_drive(&self, _: u32, _: u64, _: u64, _: &str) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "device busy"))
        }
    }

    fn disc() -> SectorDisc<MemoryDevice> {
        SectorDisc::define(MemoryDevice::new(100_000, 16, 63), 1)
    }

    #[test]
    fn lookup_by_type_code() {
        let registry = FilesystemRegistry::with_fat(Box::new(NoFormat));
        assert_eq!(registry.find_by_type(0x11, None).map(|x| x.name()), Some("FAT12"));
        assert_eq!(registry.find_by_type(0x0e, None).map(|x| x.name()), Some("FAT16"));
        assert_eq!(registry.find_by_type(0x1b, None).map(|x| x.name()), Some("FAT32"));
        assert!(registry.find_by_type(0x0c, Some("FAT16")).is_none());
        assert!(registry.find_by_type(0x83, None).is_none());
    }

    #[test]
    fn unknown_type_gives_generic_leaf() {
        let registry = FilesystemRegistry::with_fat(Box::new(NoFormat));
        let mut disc = disc();
        let leaf = registry.parse(&mut disc, 0x83, 2048, 4096).unwrap();
        assert!(!leaf.formattable);
        assert_eq!(leaf.name(), UNKNOWN_FILESYSTEM);
        assert_eq!(leaf.slot().kind, SlotKind::LegacyLeaf);

        let leaf = registry.parse(&mut disc, 0x06, 2048, 4096).unwrap();
        assert!(leaf.formattable);
        assert_eq!(leaf.slot().kind, SlotKind::Filesystem(FsKind::Fat16));
    }

    #[test]
    fn custom_type_is_told_apart_by_oem_name() {
        let mut registry = FilesystemRegistry::with_fat(Box::new(NoFormat));
        registry.register(Box::new(MyFs));
        let mut disc = disc();

        let leaf = registry.format(&mut disc, "MYFS", 4096, 1000, &[]).unwrap();
        assert_eq!(leaf.type_code, CUSTOM_PARTITION_TYPE);

        let leaf = registry
            .parse(&mut disc, CUSTOM_PARTITION_TYPE, 4096, 1000)
            .unwrap();
        assert!(leaf.formattable);
        assert_eq!(leaf.kind, FsKind::Other("MYFS".to_string()));

        assert_eq!(registry.unregister("MYFS"), 1);
        let leaf = registry
            .parse(&mut disc, CUSTOM_PARTITION_TYPE, 4096, 1000)
            .unwrap();
        assert!(!leaf.formattable);
        assert_eq!(leaf.name(), "MYFS");
    }

    #[test]
    fn format_writes_boot_sector_then_delegates() {
        let recorder = Recorder::default();
        let registry = FilesystemRegistry::with_fat(Box::new(recorder.clone()));
        let mut device = MemoryDevice::new(100_000, 16, 63);
        device.drives = vec![DriveLocation {
            disc: 1,
            start: 63,
            size: 20_000,
        }];
        let mut disc = SectorDisc::define(device, 1);

        let leaf = registry.format(&mut disc, "FAT16", 63, 20_000, &[]).unwrap();
        assert_eq!(leaf.type_code, 0x06);
        assert_eq!(leaf.drive, Some(0));
        assert_eq!(
            *recorder.0.borrow(),
            vec![(1, 63, 20_000, "FAT16".to_string())]
        );

        let sector = disc.read_sector(63).unwrap();
        let bpb = boot_sector::read_bpb(&sector).unwrap();
        assert_eq!(bpb.bytes_per_sector, 512);
        assert_eq!(bpb.media_descriptor, 0xf8);
        assert_eq!(bpb.sectors_per_track, 63);
        assert_eq!(bpb.heads, 16);
        assert_eq!(bpb.total_sectors_32, 19_999);
        // BIOS drive number of the second disc
        assert_eq!(sector[36], 0x81);
        assert_eq!(&sector[510..], &[0x55, 0xaa]);
    }

    #[test]
    fn format_errors() {
        let registry = FilesystemRegistry::with_fat(Box::new(NoFormat));
        let mut disc = disc();
        assert!(matches!(
            registry.format(&mut disc, "EXT4", 63, 1000, &[]),
            Err(Error::UnknownFilesystem(name)) if name == "EXT4"
        ));
        assert_eq!(disc.device().writes, 0);

        let registry = FilesystemRegistry::with_fat(Box::new(Broken));
        assert!(matches!(
            registry.format(&mut disc, "FAT32", 63, 1000, &[]),
            Err(Error::FormatFailed(name, _)) if name == "FAT32"
        ));
    }
}
