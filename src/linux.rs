use crate::disc::{SectorDisc, StreamDevice};
use log::debug;
use std::fs;
use std::io;
use std::os::linux::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use thiserror::Error;

mod ioctl {
    use nix::{ioctl_none, ioctl_read_bad};

    ioctl_read_bad!(blksszget, 0x1268, u64);
    ioctl_none!(blkrrpart, 0x12, 95);
}

const S_IFMT: u32 = 0o170_000;
const S_IFBLK: u32 = 0o60_000;

/// Sector size assumed for disc images.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// A disc opened from a block device or a disc image.
pub type FileDisc = SectorDisc<StreamDevice<fs::File>>;

/// An error that can happen while opening a disc or talking to the kernel about it
#[derive(Debug, Error)]
pub enum BlockError {
    /// The device could not be opened or its metadata could not be retrieved
    #[error("could not access the device: {0}")]
    Io(#[from] io::Error),
    /// The kernel refused to reload the partition table
    #[error("failed to reload partition table of device: {0}")]
    RereadTable(nix::Error),
    /// The kernel could not report the logical sector size
    #[error("failed to get the sector size of device: {0}")]
    GetSectorSize(nix::Error),
    /// An ioctl call returned a non-zero value
    #[error("invalid return value of ioctl ({0} != 0)")]
    InvalidReturnValue(i32),
    /// The device geometry could not be queried
    #[error("the device has no usable geometry")]
    InvalidGeometry,
}

fn is_block_device(file: &fs::File) -> io::Result<bool> {
    Ok(file.metadata()?.st_mode() & S_IFMT == S_IFBLK)
}

/// Logical sector size reported by the kernel, `None` for anything but a block device.
pub fn sector_size(file: &fs::File) -> Result<Option<u64>, BlockError> {
    if !is_block_device(file)? {
        return Ok(None);
    }

    let mut size = 0;
    match unsafe { ioctl::blksszget(file.as_raw_fd(), &mut size) } {
        Err(err) => Err(BlockError::GetSectorSize(err)),
        Ok(0) => Ok(Some(size)),
        Ok(r) => Err(BlockError::InvalidReturnValue(r)),
    }
}

/// Opens a block device or a disc image as disc `index`.
///
/// Without an explicit `bytes_per_sector`, block devices use the size reported by the kernel
/// and images use [`DEFAULT_SECTOR_SIZE`].
pub fn open_disc<P: AsRef<Path>>(
    path: P,
    index: u32,
    bytes_per_sector: Option<u64>,
    heads: u64,
    sectors_per_cylinder: u64,
) -> Result<FileDisc, BlockError> {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path.as_ref())?;
    let bytes_per_sector = match bytes_per_sector {
        Some(x) => x,
        None => sector_size(&file)?.unwrap_or(DEFAULT_SECTOR_SIZE),
    };
    debug!(
        "opening {} with {} bytes per sector",
        path.as_ref().display(),
        bytes_per_sector
    );

    let device = StreamDevice::new(file, bytes_per_sector, heads, sectors_per_cylinder);
    let disc = SectorDisc::define(device, index);
    if !disc.is_valid() {
        return Err(BlockError::InvalidGeometry);
    }

    Ok(disc)
}

/// Asks the kernel to reload the partition table of the disc. Images are left alone.
pub fn reread_partition_table(disc: &FileDisc) -> Result<(), BlockError> {
    let file = disc.device().get_ref();
    if !is_block_device(file)? {
        debug!("not a block device, the partition table is not reloaded");
        return Ok(());
    }

    match unsafe { ioctl::blkrrpart(file.as_raw_fd()) } {
        Err(err) => Err(BlockError::RereadTable(err)),
        Ok(0) => Ok(()),
        Ok(r) => Err(BlockError::InvalidReturnValue(r)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn image(name: &str, sectors: u64) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("discman-{}-{}", std::process::id(), name));
        let file = fs::File::create(&path).unwrap();
        file.set_len(sectors * DEFAULT_SECTOR_SIZE).unwrap();
        path
    }

    #[test]
    fn open_an_image() {
        let path = image("open", 100);
        let disc = open_disc(&path, 0, None, 16, 63).unwrap();
        assert_eq!(disc.bytes_per_sector(), 512);
        assert_eq!(disc.total_sectors(), 100);
        assert_eq!(sector_size(disc.device().get_ref()).unwrap(), None);
        reread_partition_table(&disc).unwrap();

        let disc = open_disc(&path, 0, Some(4096), 16, 63).unwrap();
        assert_eq!(disc.total_sectors(), 12);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn zero_sector_size_is_rejected() {
        let path = image("zero", 10);
        assert!(matches!(
            open_disc(&path, 0, Some(0), 16, 63),
            Err(BlockError::InvalidGeometry)
        ));
        fs::remove_file(&path).unwrap();
    }
}
