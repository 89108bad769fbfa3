use crate::chs::{self, CHS};
use crate::{Error, Result};
use log::{trace, warn};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Number of OS drive mappings scanned by [`SectorDisc::get_drive`].
pub const MAX_DRIVES: usize = 25;

/// Partition type of the protective MBR entry that marks a GPT disc.
pub const GPT_PROTECTIVE_TYPE: u8 = 0xee;

const FIRST_ENTRY_TYPE_OFFSET: usize = 0x1be + 4;

/// Geometry of a disc as reported by its device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Geometry {
    /// Size of a sector in bytes.
    pub bytes_per_sector: u64,
    /// Number of addressable sectors.
    pub total_sectors: u64,
    /// Sectors per track, used for CHS addressing.
    pub sectors_per_cylinder: u64,
    /// Number of heads, used for CHS addressing.
    pub heads: u64,
}

/// Where an OS drive is mounted: which disc and which sector range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DriveLocation {
    /// Index of the disc holding the drive.
    pub disc: u32,
    /// First sector of the drive.
    pub start: u64,
    /// Number of sectors of the drive.
    pub size: u64,
}

/// The raw block-I/O interface behind a [`SectorDisc`].
///
/// Transfers are expressed in whole sectors: `buf.len()` is always a multiple of the sector
/// size and the returned count is the number of sectors actually transferred.
pub trait BlockDevice {
    /// Queries the geometry of a disc. `None` means the query failed.
    fn define_geometry(&mut self, disc: u32) -> Option<Geometry>;

    /// Reads sectors starting at `lba` into `buf`.
    fn read_sectors(&mut self, disc: u32, lba: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes sectors starting at `lba` from `buf`.
    fn write_sectors(&mut self, disc: u32, lba: u64, buf: &[u8]) -> io::Result<usize>;

    /// Returns `true` if the disc has no pending operation.
    fn is_idle(&mut self, _disc: u32) -> bool {
        true
    }

    /// Generates a new random UUID in on-disk byte order.
    fn create_uuid(&mut self) -> [u8; 16];

    /// Returns where the OS drive `drive` is mounted, if it is.
    fn drive_location(&self, _drive: usize) -> Option<DriveLocation> {
        None
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn define_geometry(&mut self, disc: u32) -> Option<Geometry> {
        (**self).define_geometry(disc)
    }

    fn read_sectors(&mut self, disc: u32, lba: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_sectors(disc, lba, buf)
    }

    fn write_sectors(&mut self, disc: u32, lba: u64, buf: &[u8]) -> io::Result<usize> {
        (**self).write_sectors(disc, lba, buf)
    }

    fn is_idle(&mut self, disc: u32) -> bool {
        (**self).is_idle(disc)
    }

    fn create_uuid(&mut self) -> [u8; 16] {
        (**self).create_uuid()
    }

    fn drive_location(&self, drive: usize) -> Option<DriveLocation> {
        (**self).drive_location(drive)
    }
}

/// A disc addressed by sectors, with its geometry queried once at definition.
///
/// A disc whose geometry could not be queried (or reported 0 bytes per sector) is invalid for
/// good: every I/O on it fails with [`Error::InvalidGeometry`] without reaching the device.
///
/// Nothing here serializes concurrent access; callers must not mutate the tables of the same
/// disc from several places at once.
#[derive(Debug)]
pub struct SectorDisc<D> {
    index: u32,
    bytes_per_sector: u64,
    total_sectors: u64,
    sectors_per_cylinder: u64,
    heads: u64,
    valid: bool,
    device: D,
}

impl<D: BlockDevice> SectorDisc<D> {
    /// Defines the disc `index` of `device` by querying its geometry.
    pub fn define(mut device: D, index: u32) -> SectorDisc<D> {
        match device.define_geometry(index) {
            Some(geometry) if geometry.bytes_per_sector > 0 => SectorDisc {
                index,
                bytes_per_sector: geometry.bytes_per_sector,
                total_sectors: geometry.total_sectors,
                sectors_per_cylinder: geometry.sectors_per_cylinder,
                heads: geometry.heads,
                valid: true,
                device,
            },
            _ => {
                warn!("disc {}: geometry query failed", index);
                SectorDisc {
                    index,
                    bytes_per_sector: 0,
                    total_sectors: 0,
                    sectors_per_cylinder: 0,
                    heads: 0,
                    valid: false,
                    device,
                }
            }
        }
    }

    /// Returns `false` if the geometry query failed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Index of the disc on its device.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Size of a sector in bytes.
    pub fn bytes_per_sector(&self) -> u64 {
        self.bytes_per_sector
    }

    /// Number of addressable sectors.
    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Sectors per track.
    pub fn sectors_per_cylinder(&self) -> u64 {
        self.sectors_per_cylinder
    }

    /// Number of heads.
    pub fn heads(&self) -> u64 {
        self.heads
    }

    /// The geometry the disc was defined with.
    pub fn geometry(&self) -> Geometry {
        Geometry {
            bytes_per_sector: self.bytes_per_sector,
            total_sectors: self.total_sectors,
            sectors_per_cylinder: self.sectors_per_cylinder,
            heads: self.heads,
        }
    }

    /// Gets a reference to the underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Gets a mutable reference to the underlying device.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Unwraps the underlying device.
    pub fn into_inner(self) -> D {
        self.device
    }

    fn sectors_in(&self, len: usize) -> Result<usize> {
        if !self.valid {
            return Err(Error::InvalidGeometry);
        }
        let bps = self.bytes_per_sector as usize;
        if len % bps != 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer of {} bytes is not made of whole sectors", len),
            )));
        }

        Ok(len / bps)
    }

    /// Reads `buf.len() / bytes_per_sector` sectors starting at `sector`.
    pub fn read(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.sectors_in(buf.len())?;
        trace!("disc {}: read {} sector(s) at {}", self.index, n, sector);
        let count = self.device.read_sectors(self.index, sector, buf)?;
        if count != n {
            return Err(Error::ShortTransfer(sector, count, n));
        }

        Ok(())
    }

    /// Writes `buf.len() / bytes_per_sector` sectors starting at `sector`.
    pub fn write(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        let n = self.sectors_in(buf.len())?;
        trace!("disc {}: write {} sector(s) at {}", self.index, n, sector);
        let count = self.device.write_sectors(self.index, sector, buf)?;
        if count != n {
            return Err(Error::ShortTransfer(sector, count, n));
        }

        Ok(())
    }

    /// Reads a single sector into a freshly allocated buffer.
    pub fn read_sector(&mut self, sector: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0; self.bytes_per_sector as usize];
        self.read(sector, &mut buf)?;

        Ok(buf)
    }

    /// Returns `true` if the device reports no pending operation on this disc.
    pub fn is_idle(&mut self) -> bool {
        self.valid && self.device.is_idle(self.index)
    }

    /// Generates a new UUID through the device.
    pub fn create_uuid(&mut self) -> [u8; 16] {
        self.device.create_uuid()
    }

    /// Returns `true` if sector 0 holds a protective MBR (first entry of type 0xEE).
    pub fn is_gpt(&mut self) -> Result<bool> {
        let sector = self.read_sector(0)?;

        Ok(sector.get(FIRST_ENTRY_TYPE_OFFSET) == Some(&GPT_PROTECTIVE_TYPE))
    }

    /// Converts a CHS address to LBA with this disc's geometry. `0` means invalid.
    pub fn chs_to_lba(&self, chs: CHS) -> u64 {
        chs::chs_to_lba(chs, self.heads, self.sectors_per_cylinder)
    }

    /// Converts an LBA to a CHS address with this disc's geometry, saturating at cylinder 1023.
    pub fn lba_to_chs(&self, lba: u64) -> CHS {
        chs::lba_to_chs(lba, self.heads, self.sectors_per_cylinder)
    }

    /// Finds the OS drive mounted exactly on the sector range `start`..`start + size` of this
    /// disc.
    pub fn get_drive(&self, start: u64, size: u64) -> Option<usize> {
        (0..MAX_DRIVES).find(|&drive| {
            self.device.drive_location(drive)
                == Some(DriveLocation {
                    disc: self.index,
                    start,
                    size,
                })
        })
    }
}

/// A [`BlockDevice`] over any seekable stream: a disc image, a block device opened as a file or
/// an in-memory cursor.
///
/// The stream holds a single disc; the CHS geometry is given by the caller since a stream has
/// none.
///
/// # Examples
///
/// ```
/// use discman::{SectorDisc, StreamDevice};
///
/// let data = vec![0; 100 * 512];
/// let device = StreamDevice::new(std::io::Cursor::new(data), 512, 255, 63);
/// let disc = SectorDisc::define(device, 0);
///
/// assert!(disc.is_valid());
/// assert_eq!(disc.total_sectors(), 100);
/// ```
#[derive(Debug)]
pub struct StreamDevice<T> {
    inner: T,
    bytes_per_sector: u64,
    heads: u64,
    sectors_per_cylinder: u64,
    drives: Vec<DriveLocation>,
}

impl<T> StreamDevice<T>
where
    T: Read + Write + Seek,
{
    /// Wraps `inner` with the given sector size and CHS geometry.
    pub fn new(inner: T, bytes_per_sector: u64, heads: u64, sectors_per_cylinder: u64) -> Self {
        StreamDevice {
            inner,
            bytes_per_sector,
            heads,
            sectors_per_cylinder,
            drives: Vec::new(),
        }
    }

    /// Sets the OS drive mappings (drive index = position in the vector).
    pub fn with_drives(mut self, drives: Vec<DriveLocation>) -> Self {
        self.drives = drives;
        self
    }

    /// Gets a reference to the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Gets a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Unwraps the underlying stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> BlockDevice for StreamDevice<T>
where
    T: Read + Write + Seek,
{
    fn define_geometry(&mut self, _disc: u32) -> Option<Geometry> {
        if self.bytes_per_sector == 0 {
            return None;
        }
        let len = self.inner.seek(SeekFrom::End(0)).ok()?;

        Some(Geometry {
            bytes_per_sector: self.bytes_per_sector,
            total_sectors: len / self.bytes_per_sector,
            sectors_per_cylinder: self.sectors_per_cylinder,
            heads: self.heads,
        })
    }

    fn read_sectors(&mut self, _disc: u32, lba: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .seek(SeekFrom::Start(lba * self.bytes_per_sector))?;
        self.inner.read_exact(buf)?;

        Ok(buf.len() / self.bytes_per_sector as usize)
    }

    fn write_sectors(&mut self, _disc: u32, lba: u64, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .seek(SeekFrom::Start(lba * self.bytes_per_sector))?;
        self.inner.write_all(buf)?;

        Ok(buf.len() / self.bytes_per_sector as usize)
    }

    fn create_uuid(&mut self) -> [u8; 16] {
        let mut uuid: [u8; 16] = rand::random();
        // version 4 (random) in the byte-swapped third field, RFC 4122 variant
        uuid[7] = (uuid[7] & 0x0f) | 0x40;
        uuid[8] = (uuid[8] & 0x3f) | 0x80;
        uuid
    }

    fn drive_location(&self, drive: usize) -> Option<DriveLocation> {
        self.drives.get(drive).copied()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// A sparse in-memory disc of 512-byte sectors that counts the writes it receives.
    pub struct MemoryDevice {
        pub geometry: Option<Geometry>,
        pub sectors: HashMap<u64, Vec<u8>>,
        pub writes: usize,
        pub drives: Vec<DriveLocation>,
        next_uuid: u8,
    }

    impl MemoryDevice {
        pub fn new(total_sectors: u64, heads: u64, sectors_per_cylinder: u64) -> MemoryDevice {
            MemoryDevice {
                geometry: Some(Geometry {
                    bytes_per_sector: 512,
                    total_sectors,
                    sectors_per_cylinder,
                    heads,
                }),
                sectors: HashMap::new(),
                writes: 0,
                drives: Vec::new(),
                next_uuid: 0,
            }
        }
    }

    impl BlockDevice for MemoryDevice {
        fn define_geometry(&mut self, _disc: u32) -> Option<Geometry> {
            self.geometry
        }

        fn read_sectors(&mut self, _disc: u32, lba: u64, buf: &mut [u8]) -> io::Result<usize> {
            for (i, chunk) in buf.chunks_mut(512).enumerate() {
                match self.sectors.get(&(lba + i as u64)) {
                    Some(data) => chunk.copy_from_slice(data),
                    None => chunk.iter_mut().for_each(|x| *x = 0),
                }
            }

            Ok(buf.len() / 512)
        }

        fn write_sectors(&mut self, _disc: u32, lba: u64, buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            for (i, chunk) in buf.chunks(512).enumerate() {
                self.sectors.insert(lba + i as u64, chunk.to_vec());
            }

            Ok(buf.len() / 512)
        }

        fn create_uuid(&mut self) -> [u8; 16] {
            self.next_uuid += 1;
            [self.next_uuid; 16]
        }

        fn drive_location(&self, drive: usize) -> Option<DriveLocation> {
            self.drives.get(drive).copied()
        }
    }
}
