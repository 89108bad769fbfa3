use clap::{ArgEnum, Parser, Subcommand};
use std::path::PathBuf;

#[derive(ArgEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[clap(rename_all = "verbatim")]
pub enum Column {
    Device,
    Start,
    End,
    Sectors,
    Size,
    Type,
    GUID,
    Name,
}

#[derive(Parser, Debug)]
#[clap(version, about)]
pub struct Opt {
    /// device or disc image to open
    #[clap(name = "DEVICE", parse(from_os_str))]
    pub device: PathBuf,

    /// sector size (asked to the kernel for block devices, 512 otherwise)
    #[clap(short = 'b', long = "sector-size")]
    pub sector_size: Option<u64>,

    /// number of heads used for CHS addressing
    #[clap(long = "heads", default_value = "255")]
    pub heads: u64,

    /// number of sectors per track used for CHS addressing
    #[clap(long = "sectors-per-track", default_value = "63")]
    pub sectors_per_track: u64,

    /// output columns
    #[clap(
        short = 'o',
        long = "output",
        arg_enum,
        default_value = "Device,Start,End,Sectors,Size,Type,GUID,Name",
        use_value_delimiter = true
    )]
    pub columns: Vec<Column>,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// display partitions and free space (default)
    List,

    /// create and format a partition in the first free region that fits
    Add {
        /// filesystem (FAT12, FAT16, FAT32; on GPT also EFI, MSR, RECOVERY, SWAP, EXT4)
        #[clap(name = "FILESYSTEM")]
        fs: String,

        /// size in sectors
        #[clap(name = "SIZE")]
        size: u64,

        /// file holding the boot code to put in the boot sector
        #[clap(long = "boot-code", parse(from_os_str))]
        boot_code: Option<PathBuf>,
    },

    /// delete the partition starting at the given sector
    Delete {
        /// first sector of the partition
        #[clap(name = "START")]
        start: u64,
    },

    /// write a new empty GPT and its protective MBR
    InitGpt {
        /// sectors to keep unused after the partition entry array
        #[clap(long = "reserved", default_value = "0")]
        reserved: u64,

        /// overwrite an existing GPT
        #[clap(short = 'f', long = "force")]
        force: bool,
    },
}
