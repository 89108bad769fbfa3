use crate::display_bytes::DisplayBytes;
use crate::error::*;
use crate::opt::{Column, Command, Opt};
use crate::table::Table;
use ansi_term::Style;
use discman::registry::{FilesystemRegistry, Formatter};
use discman::uuid::UUID;
use discman::{BlockDevice, Partitioning, PartitionSlot, SectorDisc, SlotKind, StreamDevice, GPT};
use log::{debug, info, warn};
use std::fs;
use std::io;

pub type Disc = SectorDisc<StreamDevice<fs::File>>;

/// Leaves the data region untouched: only the boot sector of a new partition is written.
pub struct BootSectorOnly;

impl Formatter for BootSectorOnly {
    fn format_drive(&self, disc: u32, start: u64, size: u64, fs_name: &str) -> io::Result<()> {
        warn!(
            "{} partition at {} on disc {} ({} sectors): data region left as is",
            fs_name, start, disc, size
        );
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub fn open_disc(opt: &Opt) -> Result<Disc> {
    Ok(discman::linux::open_disc(
        &opt.device,
        0,
        opt.sector_size,
        opt.heads,
        opt.sectors_per_track,
    )?)
}

#[cfg(not(target_os = "linux"))]
pub fn open_disc(opt: &Opt) -> Result<Disc> {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&opt.device)?;
    let device = StreamDevice::new(
        file,
        opt.sector_size.unwrap_or(512),
        opt.heads,
        opt.sectors_per_track,
    );
    let disc = SectorDisc::define(device, 0);
    if !disc.is_valid() {
        return Err("the device has no usable geometry".into());
    }

    Ok(disc)
}

#[cfg(target_os = "linux")]
fn reload(disc: &Disc) {
    if let Err(err) = discman::linux::reread_partition_table(disc) {
        warn!("{}", err);
    }
}

#[cfg(not(target_os = "linux"))]
fn reload(_disc: &Disc) {}

pub fn execute(opt: &Opt) -> Result<()> {
    let mut disc = open_disc(opt)?;
    let registry = FilesystemRegistry::with_fat(Box::new(BootSectorOnly));
    debug!("registry: {:?}", registry);

    match &opt.command {
        None | Some(Command::List) => {
            let partitioning = Partitioning::read(&mut disc, &registry)?;
            print(opt, &disc, &partitioning)?;
        }
        Some(Command::Add {
            fs: fs_name,
            size,
            boot_code,
        }) => {
            let boot_code = match boot_code {
                Some(path) => fs::read(path)?,
                None => Vec::new(),
            };
            let mut partitioning = Partitioning::read(&mut disc, &registry)?;
            let slot = partitioning.add(&mut disc, &registry, fs_name, *size, &boot_code)?;
            info!("created {} partition at {}", fs_name, slot.start);
            println!(
                "Created a {} partition at sector {} ({} sectors, {}).",
                fs_name,
                slot.start,
                slot.size,
                DisplayBytes::new(slot.size * disc.bytes_per_sector())
            );
            reload(&disc);
        }
        Some(Command::Delete { start }) => {
            let mut partitioning = Partitioning::read(&mut disc, &registry)?;
            partitioning.remove(&mut disc, *start)?;
            println!("Deleted the partition at sector {}.", start);
            reload(&disc);
        }
        Some(Command::InitGpt { reserved, force }) => {
            if disc.is_gpt()? && !force {
                return Err("a GPT already exists on the device (use --force to replace it)".into());
            }
            let mut gpt = GPT::new();
            gpt.write(&mut disc, *reserved)?;
            println!(
                "GPT created: usable sectors {}-{}.",
                gpt.header().first_usable_lba,
                gpt.header().last_usable_lba
            );
            reload(&disc);
        }
    }

    Ok(())
}

struct Row {
    device: String,
    kind: String,
    guid: String,
    name: String,
}

fn describe(partitioning: &Partitioning, slot: &PartitionSlot) -> Row {
    let mut row = Row {
        device: String::new(),
        kind: String::new(),
        guid: String::new(),
        name: String::new(),
    };

    match (&slot.kind, partitioning) {
        (SlotKind::Free, _) => row.kind = "Free space".to_string(),
        (SlotKind::LegacyTable, _) => row.kind = "Extended".to_string(),
        (_, Partitioning::Gpt(gpt)) => {
            if let Some(p) = gpt.partitions().iter().find(|x| x.slot.start == slot.start) {
                row.kind = p.type_name.to_string();
                row.guid = p.unique_guid.clone();
                row.name = match &p.label {
                    Some(label) => format!("{} [{}]", p.name, label),
                    None => p.name.clone(),
                };
            }
        }
        (_, Partitioning::Legacy(mbr)) => {
            if let Some(leaf) = mbr.leaves().find(|x| x.start == slot.start) {
                row.kind = format!("{} ({:#04x})", leaf.name(), leaf.type_code);
                if let Some(drive) = leaf.drive {
                    row.name = format!("drive {}", drive);
                }
            }
        }
    }

    row
}

pub fn print<D: BlockDevice>(
    opt: &Opt,
    disc: &SectorDisc<D>,
    partitioning: &Partitioning,
) -> Result<()> {
    let path = opt.device.display().to_string();
    let bps = disc.bytes_per_sector();
    let layout = partitioning.partition_table()?;

    println!("Sector size: {} bytes", bps);
    println!(
        "Disk size: {} ({} sectors)",
        DisplayBytes::new(disc.total_sectors() * bps),
        disc.total_sectors()
    );
    println!(
        "Geometry: {} heads, {} sectors per track",
        disc.heads(),
        disc.sectors_per_cylinder()
    );
    match partitioning {
        Partitioning::Gpt(gpt) => {
            println!("Disklabel type: gpt");
            println!(
                "Usable sectors: {}-{}",
                gpt.header().first_usable_lba,
                gpt.header().last_usable_lba
            );
            println!("Disk identifier: {}", gpt.header().disk_guid.display_uuid());
        }
        Partitioning::Legacy(_) => println!("Disklabel type: dos"),
    }
    println!();

    let mut table = Table::new();
    for column in opt.columns.iter() {
        match column {
            Column::Device => table.add_cell("Device"),
            Column::Start => table.add_cell_rtl("Start"),
            Column::End => table.add_cell_rtl("End"),
            Column::Sectors => table.add_cell_rtl("Sectors"),
            Column::Size => table.add_cell_rtl("Size"),
            Column::Type => table.add_cell("Type"),
            Column::GUID => table.add_cell("GUID"),
            Column::Name => table.add_cell("Name"),
        }
    }

    let mut number = 0;
    for slot in layout.iter() {
        let mut row = describe(partitioning, slot);
        let style = if slot.is_partition() {
            number += 1;
            row.device = format!("{}{}", path, number);
            Style::new()
        } else {
            Style::new().dimmed()
        };

        table.add_row(style);
        for column in opt.columns.iter() {
            match column {
                Column::Device => table.add_cell(&row.device),
                Column::Start => table.add_cell_rtl(&slot.start.to_string()),
                Column::End => table.add_cell_rtl(&(slot.end() - 1).to_string()),
                Column::Sectors => table.add_cell_rtl(&slot.size.to_string()),
                Column::Size => {
                    table.add_cell_rtl(&DisplayBytes::new_padded(slot.size * bps).to_string())
                }
                Column::Type => table.add_cell(&row.kind),
                Column::GUID => table.add_cell(&row.guid),
                Column::Name => table.add_cell(&row.name),
            }
        }
    }
    print!("{}", table);

    Ok(())
}
