use crate::boot_sector;
use crate::chs::CHS;
use crate::disc::{BlockDevice, SectorDisc, GPT_PROTECTIVE_TYPE};
use crate::legacy::{MBRPartitionEntry, ENTRY_SIZE, SIGNATURE_OFFSET, TABLE_OFFSET};
use crate::partition_table::{PartitionSlot, PartitionTable, SlotKind};
use crate::registry::{FilesystemRegistry, FsKind};
use crate::uuid::{self, UUID};
use crate::{Error, Result};
use bincode::{deserialize, deserialize_from, serialize, serialize_into};
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, warn};
use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::io::Read;

/// Signature of a GPT header.
pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
/// The only supported GPT revision (1.0).
pub const GPT_REVISION: [u8; 4] = [0x00, 0x00, 0x01, 0x00];
/// Size in bytes of a GPT header.
pub const GPT_HEADER_SIZE: u32 = 92;
/// Size in bytes of a partition entry.
pub const PARTITION_ENTRY_SIZE: u32 = 128;
/// Number of partition entries of a new GPT.
pub const DEFAULT_PARTITION_ENTRIES: u32 = 128;
/// Largest partition entry array accepted when reading a GPT.
pub const MAX_PARTITION_ENTRIES: u32 = 16384;

const MIN_SECTOR_SIZE: u64 = 512;

fn crc32(data: &[u8]) -> u32 {
    Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(data)
}

/// A GUID Partition Table header as described on
/// [Wikipedia's page](https://en.wikipedia.org/wiki/GUID_Partition_Table#Partition_table_header_(LBA_1)).
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct GPTHeader {
    /// GPT signature (must be "EFI PART").
    pub signature: [u8; 8],
    /// GPT revision (must be 00 00 01 00).
    pub revision: [u8; 4],
    /// GPT header size (must be 92).
    pub header_size: u32,
    /// CRC32 checksum of the header.
    pub crc32_checksum: u32,
    /// Reserved bytes of the header.
    pub reserved: [u8; 4],
    /// Location (in sectors) of this header.
    pub primary_lba: u64,
    /// Location (in sectors) of the other copy of the header.
    pub backup_lba: u64,
    /// Location (in sectors) of the first usable sector.
    pub first_usable_lba: u64,
    /// Location (in sectors) of the last usable sector.
    pub last_usable_lba: u64,
    /// 16 bytes representing the UUID of the GPT.
    pub disk_guid: [u8; 16],
    /// Location (in sectors) of the partition entries array.
    pub partition_entry_lba: u64,
    /// Number of partition entries in the array.
    pub number_of_partition_entries: u32,
    /// Size (in bytes) of a partition entry.
    pub size_of_partition_entry: u32,
    /// CRC32 checksum of the partition array.
    pub partition_entry_array_crc32: u32,
}

impl GPTHeader {
    fn blank() -> GPTHeader {
        GPTHeader {
            signature: GPT_SIGNATURE,
            revision: GPT_REVISION,
            header_size: GPT_HEADER_SIZE,
            crc32_checksum: 0,
            reserved: [0; 4],
            primary_lba: 0,
            backup_lba: 0,
            first_usable_lba: 0,
            last_usable_lba: 0,
            disk_guid: [0; 16],
            partition_entry_lba: 0,
            number_of_partition_entries: 0,
            size_of_partition_entry: PARTITION_ENTRY_SIZE,
            partition_entry_array_crc32: 0,
        }
    }

    /// Makes a new primary header for a disc of `total_sectors` sectors, keeping `reserved`
    /// sectors unused after the partition entry array. Nothing is written.
    pub fn new(
        total_sectors: u64,
        bytes_per_sector: u64,
        reserved: u64,
        disk_guid: [u8; 16],
    ) -> Result<GPTHeader> {
        let mut header = GPTHeader::blank();
        header.number_of_partition_entries = DEFAULT_PARTITION_ENTRIES;
        header.disk_guid = disk_guid;
        let array_sectors = header.partition_array_sectors(bytes_per_sector)?;

        // MBR, both headers and both arrays, plus at least one usable sector
        if total_sectors < 3 + 2 * array_sectors + reserved {
            return Err(Error::NoSpaceLeft);
        }
        header.primary_lba = 1;
        header.backup_lba = total_sectors - 1;
        header.partition_entry_lba = 2;
        header.first_usable_lba = 2 + array_sectors + reserved;
        header.last_usable_lba = total_sectors - 2 - array_sectors;

        Ok(header)
    }

    /// Attempt to read a GPT header from a reader.
    ///
    /// The signature, revision, header size and CRC32 checksum are checked.
    pub fn read_from<R: ?Sized>(mut reader: &mut R) -> Result<GPTHeader>
    where
        R: Read,
    {
        let gpt: GPTHeader = deserialize_from(&mut reader)?;

        if gpt.signature != GPT_SIGNATURE {
            return Err(Error::InvalidSignature);
        }

        if gpt.revision != GPT_REVISION {
            return Err(Error::InvalidRevision);
        }

        if gpt.header_size != GPT_HEADER_SIZE {
            return Err(Error::InvalidHeaderSize);
        }

        let sum = gpt.generate_crc32_checksum()?;
        if gpt.crc32_checksum != sum {
            return Err(Error::InvalidChecksum(gpt.crc32_checksum, sum));
        }

        Ok(gpt)
    }

    /// Generate the CRC32 checksum of the partition header only.
    pub fn generate_crc32_checksum(&self) -> Result<u32> {
        let mut clone = self.clone();
        clone.crc32_checksum = 0;
        let data = serialize(&clone)?;

        Ok(crc32(&data))
    }

    /// Update the CRC32 checksum of this header.
    pub fn update_crc32_checksum(&mut self) -> Result<()> {
        self.crc32_checksum = self.generate_crc32_checksum()?;

        Ok(())
    }

    /// Generate the CRC32 checksum of the partition entry array.
    pub fn generate_partition_entry_array_crc32(
        &self,
        partitions: &[GPTPartitionEntry],
    ) -> Result<u32> {
        let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        let mut digest = crc.digest();
        for x in partitions {
            digest.update(&serialize(&x)?);
        }

        Ok(digest.finalize())
    }

    /// Update the CRC32 checksum of the partition entry array.
    pub fn update_partition_entry_array_crc32(
        &mut self,
        partitions: &[GPTPartitionEntry],
    ) -> Result<()> {
        self.partition_entry_array_crc32 = self.generate_partition_entry_array_crc32(partitions)?;

        Ok(())
    }

    /// Number of sectors taken by the partition entry array.
    pub fn partition_array_sectors(&self, bytes_per_sector: u64) -> Result<u64> {
        if bytes_per_sector == 0 {
            return Err(Error::InvalidGeometry);
        }
        let bytes =
            u64::from(self.number_of_partition_entries) * u64::from(self.size_of_partition_entry);

        Ok((bytes + bytes_per_sector - 1) / bytes_per_sector)
    }

    /// Returns `true` if the `GPTHeader` is a primary copy (the header is located at the beginning
    /// of the disk).
    pub fn is_primary(&self) -> bool {
        self.primary_lba == 1
    }

    /// Returns `true` if the `GPTHeader` is a backup copy (the header is located at the end of the
    /// disk).
    ///
    /// Note that when the header is a backup copy, the `primary_lba` is the LBA of the backup copy
    /// and the `backup_lba` is the LBA of the primary copy.
    pub fn is_backup(&self) -> bool {
        !self.is_primary()
    }

    /// Builds the other copy of this header: locations swapped, partition entry array right
    /// after the first sector or right after the last usable sector, CRC32 recomputed.
    pub fn mirror(&self, disk_guid: [u8; 16]) -> Result<GPTHeader> {
        let mut other = self.clone();
        other.primary_lba = self.backup_lba;
        other.backup_lba = self.primary_lba;
        other.partition_entry_lba = if other.is_primary() {
            2
        } else {
            self.last_usable_lba + 1
        };
        other.disk_guid = disk_guid;
        other.update_crc32_checksum()?;

        Ok(other)
    }
}

/// A wrapper type for `String` that represents a partition's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionName(String);

impl PartitionName {
    /// Extracts a string slice containing the entire `PartitionName`.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartitionName {
    fn from(value: &str) -> PartitionName {
        PartitionName(value.to_string())
    }
}

struct UTF16LEVisitor;

impl<'de> Visitor<'de> for UTF16LEVisitor {
    type Value = PartitionName;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("36 UTF-16LE code units (72 bytes)")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<PartitionName, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut v = Vec::new();
        let mut end = false;
        loop {
            match seq.next_element()? {
                Some(0) => end = true,
                Some(x) if !end => v.push(x),
                Some(_) => {}
                None => break,
            }
        }

        Ok(PartitionName(String::from_utf16_lossy(&v)))
    }
}

impl<'de> Deserialize<'de> for PartitionName {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_tuple(36, UTF16LEVisitor)
    }
}

impl Serialize for PartitionName {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = self.0.encode_utf16();
        let mut seq = serializer.serialize_tuple(36)?;
        for x in s.chain([0].iter().cycle().cloned()).take(36) {
            seq.serialize_element(&x)?;
        }
        seq.end()
    }
}

/// A GPT partition's entry in the partition array.
///
/// An entry whose `starting_lba` is 0 is unused.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct GPTPartitionEntry {
    /// 16 bytes representing the UUID of the partition's type.
    pub partition_type_guid: [u8; 16],
    /// 16 bytes representing the UUID of the partition.
    pub unique_partition_guid: [u8; 16],
    /// The position (in sectors) of the first sector (used) of the partition.
    pub starting_lba: u64,
    /// The position (in sectors) of the last sector (used) of the partition.
    pub ending_lba: u64,
    /// The attribute bits.
    pub attribute_bits: u64,
    /// The partition name.
    pub partition_name: PartitionName,
}

impl GPTPartitionEntry {
    /// Creates an empty partition entry
    pub fn empty() -> GPTPartitionEntry {
        GPTPartitionEntry {
            partition_type_guid: [0; 16],
            unique_partition_guid: [0; 16],
            starting_lba: 0,
            ending_lba: 0,
            attribute_bits: 0,
            partition_name: "".into(),
        }
    }

    /// Returns `true` if the partition entry is not used (`starting_lba == 0`)
    pub fn is_unused(&self) -> bool {
        self.starting_lba == 0
    }

    /// Returns `true` if the partition entry is used (`starting_lba != 0`)
    pub fn is_used(&self) -> bool {
        !self.is_unused()
    }

    /// Returns the number of sectors in the partition.
    pub fn size(&self) -> u64 {
        self.ending_lba.saturating_sub(self.starting_lba) + 1
    }
}

/// A used GPT entry, decoded for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GPTPartition {
    /// Where the partition lies and what it holds.
    pub slot: PartitionSlot,
    /// The type UUID in its textual form.
    pub type_guid: String,
    /// The well-known name of the type.
    pub type_name: &'static str,
    /// The UUID of the partition in its textual form.
    pub unique_guid: String,
    /// The partition name.
    pub name: String,
    /// The volume label found in the boot sector (Microsoft types only).
    pub label: Option<String>,
}

/// What a filesystem name means for a new GPT partition: its type and the filesystem to create
/// in it, if any.
fn partition_kind(fs_name: &str) -> Option<([u8; 16], Option<&'static str>)> {
    Some(match fs_name {
        "EFI" => (uuid::EFI_SYSTEM, Some("FAT32")),
        "FAT12" => (uuid::BASIC_DATA, Some("FAT12")),
        "FAT16" => (uuid::BASIC_DATA, Some("FAT16")),
        "FAT32" => (uuid::BASIC_DATA, Some("FAT32")),
        "NTFS" => (uuid::BASIC_DATA, Some("NTFS")),
        "EXFAT" => (uuid::BASIC_DATA, Some("EXFAT")),
        "MSR" => (uuid::MICROSOFT_RESERVED, None),
        "RECOVERY" => (uuid::WINDOWS_RECOVERY, None),
        "SWAP" => (uuid::LINUX_SWAP, None),
        "EXT4" => (uuid::LINUX_FILESYSTEM, None),
        _ => return None,
    })
}

/// A GUID partition table with both copies of its header.
///
/// Entries are kept sorted by first sector with unused entries trailing. Reading never writes:
/// a broken copy of the header is rebuilt in memory and only reaches the disc on
/// [`write`](GPT::write).
///
/// # Examples
///
/// ```
/// use discman::{FilesystemRegistry, SectorDisc, StreamDevice, GPT};
///
/// let data = vec![0; 10_000 * 512];
/// let device = StreamDevice::new(std::io::Cursor::new(data), 512, 16, 63);
/// let mut disc = SectorDisc::define(device, 0);
/// let registry = FilesystemRegistry::with_fat(Box::new(discman::registry::NoFormat));
///
/// let mut gpt = GPT::new();
/// gpt.write(&mut disc, 0).expect("could not write the GPT");
/// gpt.add(&mut disc, &registry, "EXT4", 2048, &[])
///     .expect("could not add the partition");
/// gpt.write(&mut disc, 0).expect("could not write the GPT");
///
/// let gpt = GPT::read(&mut disc).expect("could not read the GPT");
/// assert_eq!(gpt.partitions()[0].type_name, "Linux Ext");
/// assert_eq!(gpt.partitions()[0].slot.start, 34);
/// ```
#[derive(Debug, Clone)]
pub struct GPT {
    primary: GPTHeader,
    backup: GPTHeader,
    entries: Vec<GPTPartitionEntry>,
    partitions: Vec<GPTPartition>,
    table: PartitionTable,
}

impl Default for GPT {
    fn default() -> GPT {
        GPT::new()
    }
}

impl GPT {
    /// Creates an uninitialised GPT. The headers and entries are made on the first
    /// [`write`](GPT::write) (or [`add`](GPT::add)).
    pub fn new() -> GPT {
        GPT {
            primary: GPTHeader::blank(),
            backup: GPTHeader::blank(),
            entries: Vec::new(),
            partitions: Vec::new(),
            table: PartitionTable::with_capacity(0),
        }
    }

    /// Returns `true` once the headers and the entry array exist.
    pub fn is_initialized(&self) -> bool {
        !self.entries.is_empty()
    }

    /// The header located at sector 1.
    pub fn header(&self) -> &GPTHeader {
        &self.primary
    }

    /// The header located at the last sector.
    pub fn backup_header(&self) -> &GPTHeader {
        &self.backup
    }

    /// All the entries, used ones first.
    pub fn entries(&self) -> &[GPTPartitionEntry] {
        &self.entries
    }

    /// The used entries, decoded.
    pub fn partitions(&self) -> &[GPTPartition] {
        &self.partitions
    }

    /// The sorted layout of the usable sectors with the free regions.
    pub fn partition_table(&self) -> &PartitionTable {
        &self.table
    }

    /// Reads the header at `lba` and its partition entry array.
    pub fn read_gpt<D: BlockDevice>(
        disc: &mut SectorDisc<D>,
        lba: u64,
    ) -> Result<(GPTHeader, Vec<GPTPartitionEntry>)> {
        let sector = disc.read_sector(lba)?;
        let header = GPTHeader::read_from(&mut sector.as_slice())?;

        if header.size_of_partition_entry != PARTITION_ENTRY_SIZE {
            return Err(Error::InvalidEntrySize(header.size_of_partition_entry));
        }
        let sectors = header.partition_array_sectors(disc.bytes_per_sector())?;
        let fits = header
            .partition_entry_lba
            .checked_add(sectors)
            .map_or(false, |end| end <= disc.total_sectors());
        if header.number_of_partition_entries > MAX_PARTITION_ENTRIES || !fits {
            return Err(Error::InvalidPartitionEntryArray(
                header.partition_entry_lba,
                header.number_of_partition_entries,
            ));
        }
        let bytes = header.number_of_partition_entries as usize * PARTITION_ENTRY_SIZE as usize;
        let mut data = vec![0; sectors as usize * disc.bytes_per_sector() as usize];
        disc.read(header.partition_entry_lba, &mut data)?;

        let sum = crc32(&data[..bytes]);
        if header.partition_entry_array_crc32 != sum {
            return Err(Error::InvalidPartitionEntryArrayChecksum(
                header.partition_entry_array_crc32,
                sum,
            ));
        }
        let entries = data[..bytes]
            .chunks(PARTITION_ENTRY_SIZE as usize)
            .map(deserialize)
            .collect::<bincode::Result<Vec<GPTPartitionEntry>>>()?;

        Ok((header, entries))
    }

    /// Reads the GPT of a disc from its primary header, or from its backup header when the
    /// primary one is unusable. A broken copy, or one that does not point back to the copy it
    /// was found from, is rebuilt in memory with a new disc UUID.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ReadError`] when neither copy is usable.
    pub fn read<D: BlockDevice>(disc: &mut SectorDisc<D>) -> Result<GPT> {
        let last = disc.total_sectors().saturating_sub(1);
        let (header, mut entries) = match Self::read_gpt(disc, 1) {
            Ok(x) => x,
            Err(primary_err) => {
                warn!("primary GPT header unusable ({}), trying the backup", primary_err);
                Self::read_gpt(disc, last).map_err(|backup_err| {
                    Error::ReadError(Box::new(primary_err), Box::new(backup_err))
                })?
            }
        };

        let other = match Self::read_gpt(disc, header.backup_lba) {
            Ok((other, _))
                if other.primary_lba == header.backup_lba
                    && other.backup_lba == header.primary_lba =>
            {
                other
            }
            Ok((other, _)) => {
                warn!(
                    "GPT header at sector {} points to sector {}, rebuilding it",
                    header.backup_lba, other.backup_lba
                );
                header.mirror(disc.create_uuid())?
            }
            Err(err) => {
                warn!(
                    "GPT header at sector {} unusable ({}), rebuilding it",
                    header.backup_lba, err
                );
                header.mirror(disc.create_uuid())?
            }
        };
        let (primary, backup) = if header.is_primary() {
            (header, other)
        } else {
            (other, header)
        };

        sort_entries(&mut entries);
        let partitions = entries
            .iter()
            .filter(|x| x.is_used())
            .map(|x| materialize(disc, x))
            .collect();

        let mut gpt = GPT {
            primary,
            backup,
            entries,
            partitions,
            table: PartitionTable::with_capacity(0),
        };
        gpt.rebuild_table()?;

        Ok(gpt)
    }

    /// Makes both headers and an empty entry array in memory, keeping `reserved` sectors unused
    /// after the primary entry array.
    pub fn init<D: BlockDevice>(&mut self, disc: &mut SectorDisc<D>, reserved: u64) -> Result<()> {
        if !disc.is_valid() {
            return Err(Error::InvalidGeometry);
        }
        let disk_guid = disc.create_uuid();
        let primary = GPTHeader::new(
            disc.total_sectors(),
            disc.bytes_per_sector(),
            reserved,
            disk_guid,
        )?;
        self.backup = primary.mirror(disk_guid)?;
        self.primary = primary;
        self.entries = vec![GPTPartitionEntry::empty(); DEFAULT_PARTITION_ENTRIES as usize];
        self.partitions.clear();
        debug!(
            "new GPT: usable sectors {}..={}",
            self.primary.first_usable_lba, self.primary.last_usable_lba
        );

        self.rebuild_table()
    }

    fn rebuild_table(&mut self) -> Result<()> {
        let mut table = PartitionTable::with_capacity(self.entries.len() * 2 + 1);
        for partition in self.partitions.iter() {
            table.push(partition.slot.clone())?;
        }
        if self.is_initialized() {
            table.add_free(self.primary.first_usable_lba, self.primary.last_usable_lba + 1)?;
        }
        self.table = table;

        Ok(())
    }

    /// Writes both headers and both entry arrays, with fresh CRC32 checksums. An uninitialised
    /// GPT is initialised first (see [`init`](GPT::init)). A protective MBR is written last if
    /// sector 0 does not hold one yet.
    ///
    /// The sectors are written one after the other, the primary copy first.
    pub fn write<D: BlockDevice>(&mut self, disc: &mut SectorDisc<D>, reserved: u64) -> Result<()> {
        if disc.bytes_per_sector() < MIN_SECTOR_SIZE {
            return Err(Error::InvalidGeometry);
        }
        if !self.is_initialized() {
            self.init(disc, reserved)?;
        }

        let bps = disc.bytes_per_sector() as usize;
        let mut array = Vec::with_capacity(self.entries.len() * PARTITION_ENTRY_SIZE as usize);
        for entry in self.entries.iter() {
            serialize_into(&mut array, entry)?;
        }
        array.resize((array.len() + bps - 1) / bps * bps, 0);

        for header in vec![&mut self.primary, &mut self.backup] {
            header.update_partition_entry_array_crc32(&self.entries)?;
            header.update_crc32_checksum()?;
            let mut sector = serialize(&*header)?;
            sector.resize(bps, 0);
            debug!("writing GPT header at sector {}", header.primary_lba);
            disc.write(header.primary_lba, &sector)?;
            disc.write(header.partition_entry_lba, &array)?;
        }

        if !disc.is_gpt()? {
            write_protective_mbr(disc)?;
        }

        Ok(())
    }

    /// Finds the first sector of the first free region of at least `needed` sectors, scanning
    /// the sorted entries from the first usable sector.
    pub fn get_free_lba(&self, needed: u64) -> Option<u64> {
        if needed == 0 || !self.is_initialized() {
            return None;
        }

        let mut next = self.primary.first_usable_lba;
        for entry in self.entries.iter().filter(|x| x.is_used()) {
            if entry.starting_lba > next && entry.starting_lba - next >= needed {
                return Some(next);
            }
            next = next.max(entry.ending_lba + 1);
        }

        let end = self.primary.last_usable_lba + 1;
        if end > next && end - next >= needed {
            Some(next)
        } else {
            None
        }
    }

    /// Inserts an entry at its sorted position, shifting the following entries down.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::TableFull`] when the last entry is already used.
    pub fn insert_entry(&mut self, entry: GPTPartitionEntry) -> Result<usize> {
        if self.entries.last().map_or(true, |x| x.is_used()) {
            return Err(Error::TableFull);
        }
        let index = self
            .entries
            .iter()
            .position(|x| x.is_unused() || x.starting_lba > entry.starting_lba)
            .ok_or(Error::TableFull)?;

        self.entries.pop();
        self.entries.insert(index, entry);

        Ok(index)
    }

    /// Creates a partition of `size` sectors in the first free region that fits. `fs_name`
    /// selects the partition type; FAT, NTFS and exFAT partitions (and `"EFI"`, formatted as
    /// FAT32) get a boot sector and are formatted through `registry`.
    ///
    /// Only the in-memory table changes; call [`write`](GPT::write) to commit it.
    pub fn add<D: BlockDevice>(
        &mut self,
        disc: &mut SectorDisc<D>,
        registry: &FilesystemRegistry,
        fs_name: &str,
        size: u64,
        boot_code: &[u8],
    ) -> Result<GPTPartition> {
        let (type_guid, format) =
            partition_kind(fs_name).ok_or_else(|| Error::UnknownFilesystem(fs_name.to_string()))?;
        if !self.is_initialized() {
            self.init(disc, 0)?;
        }
        let start = self.get_free_lba(size).ok_or(Error::NoSpaceLeft)?;

        let entry = GPTPartitionEntry {
            partition_type_guid: type_guid,
            unique_partition_guid: disc.create_uuid(),
            starting_lba: start,
            ending_lba: start + size - 1,
            attribute_bits: 0,
            partition_name: fs_name.into(),
        };
        let index = self.insert_entry(entry)?;

        if let Some(format) = format {
            if let Err(err) = registry.format(disc, format, start, size, boot_code) {
                self.entries.remove(index);
                self.entries.push(GPTPartitionEntry::empty());
                return Err(err);
            }
        }
        debug!("new {} partition at {} ({} sectors)", fs_name, start, size);

        let partition = materialize(disc, &self.entries[index]);
        self.partitions.insert(index, partition.clone());
        self.rebuild_table()?;

        Ok(partition)
    }

    /// Removes the partition starting at `lba`, shifting the following entries up.
    ///
    /// Only the in-memory table changes; call [`write`](GPT::write) to commit it.
    pub fn remove(&mut self, lba: u64) -> Result<()> {
        let index = self
            .entries
            .iter()
            .position(|x| x.is_used() && x.starting_lba == lba)
            .ok_or(Error::PartitionNotFound)?;

        self.entries.remove(index);
        self.entries.push(GPTPartitionEntry::empty());
        if index < self.partitions.len() {
            self.partitions.remove(index);
        }
        debug!("removed partition at {}", lba);

        self.rebuild_table()
    }

    /// Finds the partition where the given sector resides.
    pub fn find_at_sector(&self, sector: u64) -> Option<&GPTPartition> {
        self.partitions
            .iter()
            .find(|x| x.slot.contains_sector(sector))
    }
}

/// Sorts by first sector with unused entries last, swapping adjacent entries until nothing
/// moves. Entries starting at the same sector keep their order.
fn sort_entries(entries: &mut [GPTPartitionEntry]) {
    let out_of_order = |a: &GPTPartitionEntry, b: &GPTPartitionEntry| match (
        a.is_unused(),
        b.is_unused(),
    ) {
        (true, false) => true,
        (false, false) => a.starting_lba > b.starting_lba,
        _ => false,
    };

    let mut swapped = true;
    while swapped {
        swapped = false;
        for i in 1..entries.len() {
            if out_of_order(&entries[i - 1], &entries[i]) {
                entries.swap(i - 1, i);
                swapped = true;
            }
        }
    }
}

fn materialize<D: BlockDevice>(disc: &mut SectorDisc<D>, entry: &GPTPartitionEntry) -> GPTPartition {
    let type_name = uuid::type_name(&entry.partition_type_guid);
    let microsoft = [uuid::EFI_SYSTEM, uuid::BASIC_DATA, uuid::WINDOWS_RECOVERY]
        .contains(&entry.partition_type_guid);

    let sniffed = if microsoft {
        match disc.read_sector(entry.starting_lba) {
            Ok(sector) => boot_sector::sniff_label(&sector),
            Err(err) => {
                debug!(
                    "could not read the boot sector at {}: {}",
                    entry.starting_lba, err
                );
                None
            }
        }
    } else {
        None
    };
    let (kind, label) = match sniffed {
        Some((kind, label)) => (kind, Some(label)),
        None => (FsKind::Other(type_name.to_string()), None),
    };

    GPTPartition {
        slot: PartitionSlot::new(entry.starting_lba, entry.size(), SlotKind::Filesystem(kind)),
        type_guid: entry.partition_type_guid.display_uuid(),
        type_name,
        unique_guid: entry.unique_partition_guid.display_uuid(),
        name: entry.partition_name.to_string(),
        label,
    }
}

/// Writes an MBR whose first entry (type 0xEE) covers the whole disc, keeping the boot code
/// already in sector 0.
fn write_protective_mbr<D: BlockDevice>(disc: &mut SectorDisc<D>) -> Result<()> {
    let mut sector = disc.read_sector(0)?;
    let entry = MBRPartitionEntry {
        boot: 0,
        first_chs: CHS::new(0, 0, 2),
        sys: GPT_PROTECTIVE_TYPE,
        last_chs: CHS::new(1023, 255, 63),
        starting_lba: 1,
        sectors: u32::try_from(disc.total_sectors().saturating_sub(1)).unwrap_or(u32::MAX),
    };

    for x in sector[TABLE_OFFSET..SIGNATURE_OFFSET].iter_mut() {
        *x = 0;
    }
    serialize_into(&mut sector[TABLE_OFFSET..TABLE_OFFSET + ENTRY_SIZE], &entry)?;
    sector[SIGNATURE_OFFSET] = 0x55;
    sector[SIGNATURE_OFFSET + 1] = 0xaa;
    debug!("writing protective MBR");

    disc.write(0, &sector)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disc::testing::MemoryDevice;
    use crate::registry::NoFormat;
    use std::io;

    struct Broken;

    impl crate::registry::Formatter for Broken {
        fn format_drive(&self, _: u32, _: u64, _: u64, _: &str) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "device busy"))
        }
    }

    fn blank(sectors: u64) -> SectorDisc<MemoryDevice> {
        SectorDisc::define(MemoryDevice::new(sectors, 16, 63), 0)
    }

    fn entry(start: u64, end: u64) -> GPTPartitionEntry {
        GPTPartitionEntry {
            partition_type_guid: uuid::LINUX_FILESYSTEM,
            unique_partition_guid: [start as u8; 16],
            starting_lba: start,
            ending_lba: end,
            attribute_bits: 0,
            partition_name: "test".into(),
        }
    }

    #[test]
    fn header_layout() {
        let header = GPTHeader::new(100_000, 512, 0, [7; 16]).unwrap();
        let data = serialize(&header).unwrap();
        assert_eq!(data.len(), 92);
        assert_eq!(&data[0..8], b"EFI PART");
        assert_eq!(header.first_usable_lba, 34);
        assert_eq!(header.last_usable_lba, 100_000 - 34);

        let backup = header.mirror([7; 16]).unwrap();
        assert_eq!(backup.primary_lba, 99_999);
        assert_eq!(backup.backup_lba, 1);
        assert_eq!(backup.partition_entry_lba, 100_000 - 33);

        assert!(matches!(
            GPTHeader::new(60, 512, 0, [0; 16]),
            Err(Error::NoSpaceLeft)
        ));
    }

    #[test]
    fn partition_name_is_utf16() {
        let mut e = entry(34, 100);
        e.partition_name = "Données".into();
        let data = serialize(&e).unwrap();
        assert_eq!(data.len(), 128);
        assert_eq!(&data[56..60], &[b'D', 0, b'o', 0]);
        let back: GPTPartitionEntry = deserialize(&data).unwrap();
        assert_eq!(back.partition_name.as_str(), "Données");
    }

    #[test]
    fn checksums_match_what_is_on_disc() {
        let mut disc = blank(10_000);
        let registry = FilesystemRegistry::with_fat(Box::new(NoFormat));
        let mut gpt = GPT::new();
        gpt.add(&mut disc, &registry, "SWAP", 1000, &[]).unwrap();
        gpt.write(&mut disc, 0).unwrap();

        for &lba in &[1, 9_999] {
            let (header, entries) = GPT::read_gpt(&mut disc, lba).unwrap();
            assert_eq!(header.crc32_checksum, header.generate_crc32_checksum().unwrap());
            assert_eq!(
                header.partition_entry_array_crc32,
                header.generate_partition_entry_array_crc32(&entries).unwrap()
            );
            assert_eq!(entries.len(), 128);
        }

        // a single bit flipped in the backup entry array
        let mut sector = disc.read_sector(10_000 - 33).unwrap();
        sector[40] ^= 1;
        disc.write(10_000 - 33, &sector).unwrap();
        assert!(matches!(
            GPT::read_gpt(&mut disc, 9_999),
            Err(Error::InvalidPartitionEntryArrayChecksum(..))
        ));
    }

    #[test]
    fn entry_size_is_checked() {
        let mut disc = blank(10_000);
        let mut gpt = GPT::new();
        gpt.write(&mut disc, 0).unwrap();

        let mut header = gpt.header().clone();
        header.size_of_partition_entry = 256;
        header.update_crc32_checksum().unwrap();
        let mut sector = serialize(&header).unwrap();
        sector.resize(512, 0);
        disc.write(1, &sector).unwrap();
        assert!(matches!(
            GPT::read_gpt(&mut disc, 1),
            Err(Error::InvalidEntrySize(256))
        ));
    }

    #[test]
    fn entries_are_sorted_on_read() {
        let mut disc = blank(100_000);
        let mut gpt = GPT::new();
        gpt.init(&mut disc, 0).unwrap();
        gpt.entries[1] = entry(5000, 5999);
        gpt.entries[3] = entry(100, 199);
        gpt.entries[4] = entry(2000, 2999);
        gpt.write(&mut disc, 0).unwrap();

        let gpt = GPT::read(&mut disc).unwrap();
        let starts = gpt
            .entries()
            .iter()
            .map(|x| x.starting_lba)
            .collect::<Vec<_>>();
        assert_eq!(&starts[..4], &[100, 2000, 5000, 0]);
        assert!(starts[3..].iter().all(|x| *x == 0));
        assert_eq!(
            gpt.partitions()
                .iter()
                .map(|x| x.slot.start)
                .collect::<Vec<_>>(),
            vec![100, 2000, 5000]
        );
        assert_eq!(gpt.find_at_sector(2500).map(|x| x.slot.start), Some(2000));
        assert_eq!(gpt.find_at_sector(3500), None);
    }

    #[test]
    fn backup_is_used_when_primary_is_corrupted() {
        let mut disc = blank(100_000);
        let mut gpt = GPT::new();
        gpt.write(&mut disc, 0).unwrap();
        let backup_guid = gpt.backup_header().disk_guid;

        let mut sector = disc.read_sector(1).unwrap();
        sector[60] ^= 0x10;
        disc.write(1, &sector).unwrap();
        let writes = disc.device().writes;

        let mut gpt = GPT::read(&mut disc).unwrap();
        assert_eq!(disc.device().writes, writes);
        assert_eq!(gpt.backup_header().disk_guid, backup_guid);
        let primary = gpt.header().clone();
        assert_ne!(primary.disk_guid, backup_guid);
        assert_eq!(primary.primary_lba, 1);
        assert_eq!(primary.backup_lba, 99_999);
        assert_eq!(primary.partition_entry_lba, 2);
        assert!(matches!(
            GPT::read_gpt(&mut disc, 1),
            Err(Error::InvalidChecksum(..))
        ));

        gpt.write(&mut disc, 0).unwrap();
        let (header, _) = GPT::read_gpt(&mut disc, 1).unwrap();
        assert_eq!(header, *gpt.header());
    }

    #[test]
    fn oversized_entry_array_falls_back_on_backup() {
        let mut disc = blank(100_000);
        let mut gpt = GPT::new();
        gpt.write(&mut disc, 0).unwrap();
        let backup_guid = gpt.backup_header().disk_guid;

        let mut header = gpt.header().clone();
        header.number_of_partition_entries = u32::MAX;
        header.update_crc32_checksum().unwrap();
        let mut sector = serialize(&header).unwrap();
        sector.resize(512, 0);
        disc.write(1, &sector).unwrap();
        assert!(matches!(
            GPT::read_gpt(&mut disc, 1),
            Err(Error::InvalidPartitionEntryArray(2, u32::MAX))
        ));

        let gpt = GPT::read(&mut disc).unwrap();
        assert_eq!(gpt.backup_header().disk_guid, backup_guid);
        assert_eq!(gpt.header().number_of_partition_entries, DEFAULT_PARTITION_ENTRIES);
        assert_eq!(gpt.entries().len(), DEFAULT_PARTITION_ENTRIES as usize);

        // an array running past the end of the disc
        header.number_of_partition_entries = DEFAULT_PARTITION_ENTRIES;
        header.partition_entry_lba = 99_990;
        header.update_crc32_checksum().unwrap();
        let mut sector = serialize(&header).unwrap();
        sector.resize(512, 0);
        disc.write(1, &sector).unwrap();
        assert!(matches!(
            GPT::read_gpt(&mut disc, 1),
            Err(Error::InvalidPartitionEntryArray(99_990, _))
        ));
    }

    #[test]
    fn stale_backup_is_rebuilt() {
        let mut disc = blank(100_000);
        let mut gpt = GPT::new();
        gpt.write(&mut disc, 0).unwrap();
        let primary = gpt.header().clone();

        let mut stale = gpt.backup_header().clone();
        stale.backup_lba = 5;
        stale.first_usable_lba = 4000;
        stale.update_crc32_checksum().unwrap();
        let mut sector = serialize(&stale).unwrap();
        sector.resize(512, 0);
        disc.write(99_999, &sector).unwrap();
        assert!(GPT::read_gpt(&mut disc, 99_999).is_ok());

        let mut gpt = GPT::read(&mut disc).unwrap();
        assert_eq!(*gpt.header(), primary);
        let backup = gpt.backup_header().clone();
        assert_eq!(backup.primary_lba, 99_999);
        assert_eq!(backup.backup_lba, 1);
        assert_eq!(backup.first_usable_lba, primary.first_usable_lba);
        assert_eq!(backup.partition_entry_lba, 100_000 - 33);
        assert_ne!(backup.disk_guid, primary.disk_guid);

        gpt.write(&mut disc, 0).unwrap();
        let (header, _) = GPT::read_gpt(&mut disc, 99_999).unwrap();
        assert_eq!(header.backup_lba, 1);
        assert_eq!(header.first_usable_lba, 34);
    }

    #[test]
    fn both_headers_broken() {
        let mut disc = blank(10_000);
        assert!(matches!(
            GPT::read(&mut disc),
            Err(Error::ReadError(a, b))
                if matches!(*a, Error::InvalidSignature) && matches!(*b, Error::InvalidSignature)
        ));
    }

    #[test]
    fn free_lba_after_previous_partition() {
        let mut disc = blank(9034);
        let mut gpt = GPT::new();
        gpt.init(&mut disc, 0).unwrap();
        assert_eq!(gpt.header().last_usable_lba, 9000);
        gpt.insert_entry(entry(2000, 3000)).unwrap();
        gpt.insert_entry(entry(34, 1000)).unwrap();

        assert_eq!(gpt.get_free_lba(100), Some(1001));
        assert_eq!(gpt.get_free_lba(999), Some(1001));
        assert_eq!(gpt.get_free_lba(1000), Some(3001));
        assert_eq!(gpt.get_free_lba(6000), Some(3001));
        assert_eq!(gpt.get_free_lba(6001), None);
    }

    #[test]
    fn reserved_sectors_move_first_usable() {
        let mut disc = blank(10_000);
        let mut gpt = GPT::new();
        gpt.write(&mut disc, 2014).unwrap();
        assert_eq!(gpt.header().first_usable_lba, 2048);
        assert!(disc.is_gpt().unwrap());
        assert_eq!(
            gpt.partition_table().free_slots().next().map(|x| x.start),
            Some(2048)
        );

        let mbr = disc.read_sector(0).unwrap();
        assert_eq!(&mbr[446..462], &[
            0x00, 0x00, 0x02, 0x00, 0xee, 0xff, 0xff, 0xff, 0x01, 0x00, 0x00, 0x00, 0x0f, 0x27,
            0x00, 0x00
        ]);
        assert_eq!(&mbr[510..], &[0x55, 0xaa]);
    }

    #[test]
    fn add_and_remove() {
        let mut disc = blank(100_000);
        let registry = FilesystemRegistry::with_fat(Box::new(NoFormat));
        let mut gpt = GPT::new();

        let efi = gpt.add(&mut disc, &registry, "EFI", 2048, &[]).unwrap();
        assert_eq!(efi.slot.start, 34);
        assert_eq!(efi.type_name, "EFI System");
        assert_eq!(efi.slot.kind, SlotKind::Filesystem(FsKind::Fat32));
        assert_eq!(efi.label.as_deref(), Some("NO NAME"));
        let data = gpt.add(&mut disc, &registry, "FAT16", 4096, &[]).unwrap();
        assert_eq!(data.slot.start, 34 + 2048);
        assert_eq!(data.type_guid, "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7");
        let msr = gpt.add(&mut disc, &registry, "MSR", 100, &[]).unwrap();
        assert_eq!(msr.label, None);
        assert_eq!(gpt.partition_table().part_count(), 3);

        gpt.remove(34 + 2048).unwrap();
        assert_eq!(gpt.entries()[1].starting_lba, 34 + 2048 + 4096);
        assert!(gpt.entries()[2].is_unused());
        assert!(matches!(gpt.remove(34 + 2048), Err(Error::PartitionNotFound)));
        assert_eq!(gpt.get_free_lba(4096), Some(34 + 2048));

        assert!(matches!(
            gpt.add(&mut disc, &registry, "HFS+", 100, &[]),
            Err(Error::UnknownFilesystem(_))
        ));
        assert!(matches!(
            gpt.add(&mut disc, &registry, "EXT4", 1_000_000, &[]),
            Err(Error::NoSpaceLeft)
        ));
    }

    #[test]
    fn failed_format_leaves_no_entry() {
        let mut disc = blank(100_000);
        let registry = FilesystemRegistry::with_fat(Box::new(Broken));
        let mut gpt = GPT::new();
        assert!(matches!(
            gpt.add(&mut disc, &registry, "FAT32", 4096, &[]),
            Err(Error::FormatFailed(..))
        ));
        assert!(gpt.entries().iter().all(|x| x.is_unused()));
        assert!(gpt.partitions().is_empty());
    }

    #[test]
    fn entry_array_is_bounded() {
        let mut disc = blank(100_000);
        let registry = FilesystemRegistry::with_fat(Box::new(NoFormat));
        let mut gpt = GPT::new();
        for _ in 0..DEFAULT_PARTITION_ENTRIES {
            gpt.add(&mut disc, &registry, "MSR", 10, &[]).unwrap();
        }
        assert!(matches!(
            gpt.add(&mut disc, &registry, "MSR", 10, &[]),
            Err(Error::TableFull)
        ));
    }
}
