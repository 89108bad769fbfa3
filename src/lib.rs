//! A library that discovers, allocates and frees partitions on sector-addressable discs.
//!
//! Two partition schemes are supported side by side:
//!
//!  *  the legacy MBR with chained Extended Boot Records (see [`MBR`]), modelled as a tree of
//!     4-entry tables;
//!  *  the GUID partition table with its redundant headers (see [`GPT`]).
//!
//! Both sit on top of a [`SectorDisc`] and expose their layout as a [`PartitionTable`] where
//! unallocated space is materialized as free slots.
//!
//! # Examples
//!
//! Creating a FAT32 partition on an empty disc image:
//!
//! ```
//! use discman::{FilesystemRegistry, Partitioning, SectorDisc, StreamDevice};
//!
//! let data = vec![0; 20_000 * 512];
//! let device = StreamDevice::new(std::io::Cursor::new(data), 512, 16, 63);
//! let mut disc = SectorDisc::define(device, 0);
//! let registry = FilesystemRegistry::with_fat(Box::new(discman::registry::NoFormat));
//!
//! let mut partitioning = Partitioning::read(&mut disc, &registry)
//!     .expect("could not read the partition table");
//! let slot = partitioning
//!     .add(&mut disc, &registry, "FAT32", 4096, &[])
//!     .expect("could not add the partition");
//!
//! // NOTE: the first track is kept for the MBR
//! assert_eq!(slot.start, 63);
//! assert_eq!(slot.size, 4096);
//! ```
//!
//! Listing the partitions of a disc:
//!
//! ```
//! # use discman::{FilesystemRegistry, Partitioning, SectorDisc, StreamDevice};
//! # let data = vec![0; 10_000 * 512];
//! # let device = StreamDevice::new(std::io::Cursor::new(data), 512, 16, 63);
//! # let mut disc = SectorDisc::define(device, 0);
//! # let registry = FilesystemRegistry::with_fat(Box::new(discman::registry::NoFormat));
//! let partitioning = Partitioning::read(&mut disc, &registry)
//!     .expect("could not read the partition table");
//!
//! for slot in partitioning.partition_table().expect("invalid layout").iter() {
//!     println!("{:?}: start = {}, size = {} sectors", slot.kind, slot.start, slot.size);
//! }
//! ```

#![deny(missing_docs)]

use log::warn;
use std::io;
use thiserror::Error;

/// Packed cylinder/head/sector addressing.
pub mod chs;
/// FAT boot sectors and BIOS Parameter Blocks.
pub mod boot_sector;
/// Sector-addressable discs and the device interface behind them.
pub mod disc;
/// GUID partition tables.
pub mod gpt;
/// Legacy MBR/EBR partition tables.
pub mod legacy;
/// Sorted partition layouts with materialized free space.
pub mod partition_table;
/// Filesystem factories keyed by partition type.
pub mod registry;
/// UUID formatting and well-known partition types.
pub mod uuid;

/// Linux specific helpers
#[cfg(target_os = "linux")]
pub mod linux;

pub use crate::chs::CHS;
pub use crate::disc::{BlockDevice, DriveLocation, Geometry, SectorDisc, StreamDevice};
pub use crate::gpt::{GPTHeader, GPTPartition, GPTPartitionEntry, PartitionName, GPT};
pub use crate::legacy::{MBRPartitionEntry, NodeId, MBR};
pub use crate::partition_table::{PartitionSlot, PartitionTable, SlotKind};
pub use crate::registry::{FilesystemLeaf, FilesystemRegistry, Formatter, FsKind};

/// An error that can be produced while reading, writing or managing partitions.
#[derive(Debug, Error)]
pub enum Error {
    /// Derialization errors.
    #[error("deserialization failed")]
    Deserialize(#[from] bincode::Error),
    /// I/O errors.
    #[error("generic I/O error")]
    Io(#[from] io::Error),
    /// The device could not report a usable geometry. The disc stays invalid for good.
    #[error("invalid disc geometry")]
    InvalidGeometry,
    /// The device transferred fewer sectors than requested.
    #[error("short transfer at sector {0} ({1} != {2} sectors)")]
    ShortTransfer(u64, usize, usize),
    /// An error that occurs when the signature of the GPT isn't what would be expected ("EFI
    /// PART").
    #[error("invalid signature")]
    InvalidSignature,
    /// An error that occurs when the revision of the GPT isn't what would be expected (00 00 01
    /// 00).
    #[error("invalid revision")]
    InvalidRevision,
    /// An error that occurs when the header's size (in bytes) isn't what would be expected (92).
    #[error("invalid header size")]
    InvalidHeaderSize,
    /// An error that occurs when the size of a partition entry isn't 128 bytes.
    #[error("invalid partition entry size: {0}")]
    InvalidEntrySize(u32),
    /// An error that occurs when the partition entry array is too large or does not fit on the
    /// disc.
    #[error("invalid partition entry array at sector {0} ({1} entries)")]
    InvalidPartitionEntryArray(u64, u32),
    /// An error that occurs when the CRC32 checksum of the header doesn't match the expected
    /// checksum for the actual header.
    #[error("corrupted CRC32 checksum ({0} != {1})")]
    InvalidChecksum(u32, u32),
    /// An error that occurs when the CRC32 checksum of the partition entries array doesn't match
    /// the expected checksum for the actual partition entries array.
    #[error("corrupted partition entry array CRC32 checksum ({0} != {1})")]
    InvalidPartitionEntryArrayChecksum(u32, u32),
    /// An error that occurs when reading a GPT did not succeeded.
    ///
    /// The first argument is the error that occurred when trying to read the primary header.
    /// The second argument is the error that occurred when trying to read the backup header.
    #[error("could not read primary header ({0}) nor backup header ({1})")]
    ReadError(Box<Error>, Box<Error>),
    /// An error that occurs when there is not enough space left on the disc to continue.
    #[error("no space left")]
    NoSpaceLeft,
    /// An error that occurs when a region does not fit in the table it is given to.
    #[error("region {0}+{1} is outside of the table")]
    OutOfBounds(u64, u64),
    /// An error that occurs when a bounded table cannot take another entry.
    #[error("partition table is full")]
    TableFull,
    /// An operation that required to find a partition, was unable to find that partition.
    #[error("partition not found")]
    PartitionNotFound,
    /// An extended boot record points outside of its parent or loops back on itself.
    #[error("inconsistent extended boot record at sector {0}")]
    InconsistentEbr(u64),
    /// No filesystem is registered under this name.
    #[error("unknown filesystem: {0}")]
    UnknownFilesystem(String),
    /// The external format operation failed.
    #[error("could not format {0}: {1}")]
    FormatFailed(String, io::Error),
}

/// The result of reading, writing or managing partitions.
pub type Result<T> = std::result::Result<T, Error>;

/// The partitioning of a disc, whichever scheme it uses.
#[derive(Debug, Clone)]
pub enum Partitioning {
    /// A legacy MBR with its chain of extended boot records.
    Legacy(MBR),
    /// A GUID partition table.
    Gpt(GPT),
}

impl Partitioning {
    /// Reads the partitioning of a disc. A disc with a protective MBR is read as a GPT, anything
    /// else (including a blank disc) is read as a legacy MBR.
    ///
    /// A disc flagged as GPT where neither header copy is valid is read as an uninitialised
    /// [`GPT`] with an empty layout.
    pub fn read<D: BlockDevice>(
        disc: &mut SectorDisc<D>,
        registry: &FilesystemRegistry,
    ) -> Result<Partitioning> {
        if disc.is_gpt()? {
            match GPT::read(disc) {
                Ok(gpt) => Ok(Partitioning::Gpt(gpt)),
                Err(err @ Error::ReadError(..)) => {
                    warn!("{}, the disc is left unpartitioned", err);
                    Ok(Partitioning::Gpt(GPT::new()))
                }
                Err(err) => Err(err),
            }
        } else {
            let mut mbr = MBR::new(disc);
            mbr.process(disc, registry)?;
            Ok(Partitioning::Legacy(mbr))
        }
    }

    /// Returns `true` if the disc uses a GUID partition table.
    pub fn is_gpt(&self) -> bool {
        matches!(self, Partitioning::Gpt(_))
    }

    /// Builds the sorted layout of the disc with its free regions.
    pub fn partition_table(&self) -> Result<PartitionTable> {
        match self {
            Partitioning::Legacy(mbr) => mbr.partition_table(),
            Partitioning::Gpt(gpt) => Ok(gpt.partition_table().clone()),
        }
    }

    /// Number of partitions holding a filesystem (free regions and extended tables excluded).
    pub fn part_count(&self) -> usize {
        match self {
            Partitioning::Legacy(mbr) => mbr.leaves().count(),
            Partitioning::Gpt(gpt) => gpt.partitions().len(),
        }
    }

    /// Creates and formats a partition of `size` sectors in the first free region that fits.
    ///
    /// On a GPT the tables are written to disc right away.
    pub fn add<D: BlockDevice>(
        &mut self,
        disc: &mut SectorDisc<D>,
        registry: &FilesystemRegistry,
        fs_name: &str,
        size: u64,
        boot_code: &[u8],
    ) -> Result<PartitionSlot> {
        match self {
            Partitioning::Legacy(mbr) => {
                let leaf = mbr.add(disc, registry, fs_name, size, boot_code)?;
                Ok(leaf.slot())
            }
            Partitioning::Gpt(gpt) => {
                let partition = gpt.add(disc, registry, fs_name, size, boot_code)?;
                gpt.write(disc, 0)?;
                Ok(partition.slot)
            }
        }
    }

    /// Frees the partition starting at `start`.
    ///
    /// On a GPT the tables are written to disc right away.
    pub fn remove<D: BlockDevice>(&mut self, disc: &mut SectorDisc<D>, start: u64) -> Result<()> {
        match self {
            Partitioning::Legacy(mbr) => mbr.remove(disc, start),
            Partitioning::Gpt(gpt) => {
                gpt.remove(start)?;
                gpt.write(disc, 0)
            }
        }
    }
}
