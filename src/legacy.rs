use crate::chs::{self, CHS, MAX_CYLINDER};
use crate::disc::{BlockDevice, SectorDisc};
use crate::partition_table::{PartitionSlot, PartitionTable, SlotKind};
use crate::registry::{FilesystemLeaf, FilesystemRegistry};
use crate::{Error, Result};
use bincode::{deserialize, serialize_into};
use log::debug;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::num::TryFromIntError;

/// Offset of the first partition entry in a table sector.
pub const TABLE_OFFSET: usize = 0x1be;
/// Size of a partition entry.
pub const ENTRY_SIZE: usize = 16;
/// Offset of the 0x55 0xAA boot signature in a table sector.
pub const SIGNATURE_OFFSET: usize = 0x1fe;
/// Partition type of a nested table addressed through CHS.
pub const EXTENDED: u8 = 0x05;
/// Partition type of a nested table that lies (partly) beyond the CHS limit.
pub const EXTENDED_LBA: u8 = 0x0f;
/// Boot flag of an active partition.
pub const ACTIVE: u8 = 0x80;
/// Maximum nesting of extended boot records.
pub const MAX_DEPTH: usize = 64;

const MIN_TABLE_SECTOR_SIZE: usize = 512;
const TABLE_CAPACITY: usize = 128;

/// A 16-byte partition entry of an MBR or EBR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MBRPartitionEntry {
    /// Boot flag (0x80 for the active partition).
    pub boot: u8,
    /// CHS address of the first sector.
    pub first_chs: CHS,
    /// Partition type.
    pub sys: u8,
    /// CHS address of the last sector.
    pub last_chs: CHS,
    /// First sector, relative to the start of the table holding the entry.
    pub starting_lba: u32,
    /// Number of sectors.
    pub sectors: u32,
}

impl MBRPartitionEntry {
    /// Creates an unused entry.
    pub fn empty() -> MBRPartitionEntry {
        MBRPartitionEntry {
            boot: 0,
            first_chs: CHS::empty(),
            sys: 0,
            last_chs: CHS::empty(),
            starting_lba: 0,
            sectors: 0,
        }
    }

    /// Returns `true` if the partition type is 0.
    pub fn is_unused(&self) -> bool {
        self.sys == 0
    }

    /// Returns `true` if the entry points to a nested table.
    pub fn is_extended(&self) -> bool {
        self.sys == EXTENDED || self.sys == EXTENDED_LBA
    }

    /// Returns `true` if the boot flag is set.
    pub fn is_active(&self) -> bool {
        self.boot & ACTIVE != 0
    }
}

/// Index of a node in the arena of an [`MBR`].
pub type NodeId = usize;

/// What a slot of a legacy table holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// An unused entry.
    Empty,
    /// A table with its 4 entries: the MBR itself or an extended boot record.
    Table {
        /// The nodes of the 4 entries, in entry order.
        children: [NodeId; 4],
    },
    /// A partition.
    Filesystem(FilesystemLeaf),
}

/// A node of the legacy partition tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// First sector (absolute). For a table this is the sector holding the entries.
    pub start: u64,
    /// Number of sectors.
    pub size: u64,
    /// Partition type.
    pub sys: u8,
    /// Boot flag.
    pub active: bool,
    /// The table holding this node, `None` for the root.
    pub parent: Option<NodeId>,
    /// Which of the 4 entries of the parent this node is.
    pub index: usize,
    /// What the node holds.
    pub kind: NodeKind,
}

impl Node {
    fn empty(parent: Option<NodeId>, index: usize) -> Node {
        Node {
            start: 0,
            size: 0,
            sys: 0,
            active: false,
            parent,
            index,
            kind: NodeKind::Empty,
        }
    }

    /// The first sector after the node.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// Returns `true` if the node is an unused entry.
    pub fn is_empty(&self) -> bool {
        self.kind == NodeKind::Empty
    }

    /// Returns `true` if the node is a table.
    pub fn is_table(&self) -> bool {
        matches!(self.kind, NodeKind::Table { .. })
    }
}

/// A legacy MBR and its chain of extended boot records, modelled as a tree of 4-entry tables.
///
/// The nodes live in an arena; parents are referred to by [`NodeId`]. The tree is rebuilt from
/// disc by [`process`](MBR::process) and kept in sync with the disc by every allocation.
///
/// Updates spanning several sectors (a new partition inside a nested table, the growth of the
/// tables enclosing it) are written one sector at a time. Sectors that nothing points to yet
/// are written first, but an interruption can still leave a table entry out of date.
///
/// # Examples
///
/// ```
/// use discman::{FilesystemRegistry, SectorDisc, StreamDevice, MBR};
///
/// let data = vec![0; 50_000 * 512];
/// let device = StreamDevice::new(std::io::Cursor::new(data), 512, 16, 63);
/// let mut disc = SectorDisc::define(device, 0);
/// let registry = FilesystemRegistry::with_fat(Box::new(discman::registry::NoFormat));
///
/// let mut mbr = MBR::new(&disc);
/// mbr.process(&mut disc, &registry).expect("could not read the MBR");
/// for _ in 0..3 {
///     mbr.add(&mut disc, &registry, "FAT16", 4096, &[])
///         .expect("could not add the partition");
/// }
///
/// // the third partition lives in an extended boot record
/// let root = mbr.root();
/// let ebr = mbr.node(mbr.children(root).unwrap()[2]);
/// assert_eq!(ebr.sys, discman::legacy::EXTENDED);
/// assert_eq!(mbr.leaves().count(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct MBR {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    root: NodeId,
    total_sectors: u64,
    sectors_per_cylinder: u64,
    heads: u64,
}

impl MBR {
    /// Creates an empty tree with the geometry of `disc`. Nothing is read or written.
    pub fn new<D: BlockDevice>(disc: &SectorDisc<D>) -> MBR {
        let mut mbr = MBR {
            nodes: Vec::new(),
            free: Vec::new(),
            root: 0,
            total_sectors: disc.total_sectors(),
            sectors_per_cylinder: disc.sectors_per_cylinder(),
            heads: disc.heads(),
        };
        mbr.reset();
        mbr
    }

    fn reset(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = self.alloc(Node::empty(None, 0));
        self.make_table(self.root, 0, self.total_sectors, 0);
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn make_table(&mut self, id: NodeId, start: u64, size: u64, sys: u8) {
        let mut children = [0; 4];
        for (i, child) in children.iter_mut().enumerate() {
            *child = self.alloc(Node::empty(Some(id), i));
        }

        let node = &mut self.nodes[id];
        node.start = start;
        node.size = size;
        node.sys = sys;
        node.kind = NodeKind::Table { children };
    }

    /// Turns a node back into an unused entry, giving its descendants back to the arena.
    fn release(&mut self, id: NodeId) {
        let kind = std::mem::replace(&mut self.nodes[id].kind, NodeKind::Empty);
        if let NodeKind::Table { children } = kind {
            for &child in children.iter() {
                self.release(child);
                self.free.push(child);
            }
        }

        let node = &mut self.nodes[id];
        node.start = 0;
        node.size = 0;
        node.sys = 0;
        node.active = false;
    }

    /// The root table (the MBR itself).
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Gets a node.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not given by this tree.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// The 4 entries of a table, `None` if the node is not a table.
    pub fn children(&self, id: NodeId) -> Option<[NodeId; 4]> {
        match self.nodes.get(id).map(|x| &x.kind) {
            Some(NodeKind::Table { children }) => Some(*children),
            _ => None,
        }
    }

    /// The filesystem of a node, `None` if the node is not a partition.
    pub fn leaf(&self, id: NodeId) -> Option<&FilesystemLeaf> {
        match self.nodes.get(id).map(|x| &x.kind) {
            Some(NodeKind::Filesystem(leaf)) => Some(leaf),
            _ => None,
        }
    }

    /// Iterates over the partitions in table order (depth first).
    pub fn leaves(&self) -> impl Iterator<Item = &FilesystemLeaf> + '_ {
        self.walk().into_iter().filter_map(move |id| self.leaf(id))
    }

    fn walk(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            out.push(id);
            if let NodeKind::Table { children } = &self.nodes[id].kind {
                stack.extend(children.iter().rev());
            }
        }

        out
    }

    fn table_children(&self, id: NodeId) -> Result<[NodeId; 4]> {
        self.children(id).ok_or(Error::PartitionNotFound)
    }

    fn lba_to_chs(&self, lba: u64) -> CHS {
        chs::lba_to_chs(lba, self.heads, self.sectors_per_cylinder)
    }

    fn chs_to_lba(&self, chs: CHS) -> u64 {
        chs::chs_to_lba(chs, self.heads, self.sectors_per_cylinder)
    }

    /// Absolute start and size of an entry. The CHS addresses are used when both are valid,
    /// the raw fields otherwise.
    fn decode(&self, owner_start: u64, entry: &MBRPartitionEntry) -> (u64, u64) {
        let first = self.chs_to_lba(entry.first_chs);
        let last = self.chs_to_lba(entry.last_chs);

        if first != 0 && last >= first {
            (first, last - first + 1)
        } else {
            (
                owner_start + u64::from(entry.starting_lba),
                u64::from(entry.sectors),
            )
        }
    }

    fn table_sector<D: BlockDevice>(disc: &mut SectorDisc<D>, sector: u64) -> Result<Vec<u8>> {
        let data = disc.read_sector(sector)?;
        if data.len() < MIN_TABLE_SECTOR_SIZE {
            return Err(Error::InvalidGeometry);
        }

        Ok(data)
    }

    /// Rebuilds the tree from the MBR of `disc` and every extended boot record it leads to.
    /// Partitions are resolved through `registry`.
    ///
    /// A table sector without the 0x55 0xAA signature is read as an empty table.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InconsistentEbr`] when a nested table does not start strictly inside
    /// its parent, overflows it or nests deeper than [`MAX_DEPTH`].
    pub fn process<D: BlockDevice>(
        &mut self,
        disc: &mut SectorDisc<D>,
        registry: &FilesystemRegistry,
    ) -> Result<()> {
        self.reset();
        let root = self.root;
        self.process_table(disc, registry, root, 0)
    }

    fn process_table<D: BlockDevice>(
        &mut self,
        disc: &mut SectorDisc<D>,
        registry: &FilesystemRegistry,
        table: NodeId,
        depth: usize,
    ) -> Result<()> {
        let (start, end) = {
            let node = &self.nodes[table];
            (node.start, node.end())
        };
        if depth > MAX_DEPTH {
            return Err(Error::InconsistentEbr(start));
        }

        let sector = Self::table_sector(disc, start)?;
        if sector[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2] != [0x55, 0xaa] {
            debug!("no partition table at sector {}", start);
            return Ok(());
        }

        let children = self.table_children(table)?;
        for (i, &child) in children.iter().enumerate() {
            let offset = TABLE_OFFSET + i * ENTRY_SIZE;
            let entry: MBRPartitionEntry = deserialize(&sector[offset..offset + ENTRY_SIZE])?;
            if entry.is_unused() {
                continue;
            }

            let (child_start, child_size) = self.decode(start, &entry);
            if entry.is_extended() {
                if child_start <= start || child_start + child_size > end {
                    return Err(Error::InconsistentEbr(child_start));
                }
                debug!(
                    "extended boot record at {} ({} sectors)",
                    child_start, child_size
                );
                self.make_table(child, child_start, child_size, entry.sys);
                self.nodes[child].active = entry.is_active();
                self.process_table(disc, registry, child, depth + 1)?;
            } else {
                let leaf = registry.parse(disc, entry.sys, child_start, child_size)?;
                let node = &mut self.nodes[child];
                node.start = child_start;
                node.size = child_size;
                node.sys = entry.sys;
                node.active = entry.is_active();
                node.kind = NodeKind::Filesystem(leaf);
            }
        }

        Ok(())
    }

    /// Builds the sorted layout of the disc: partitions, the sectors of the extended boot
    /// records and the free regions between them. The first track is kept for the MBR.
    pub fn partition_table(&self) -> Result<PartitionTable> {
        let mut table = PartitionTable::with_capacity(TABLE_CAPACITY);
        for id in self.walk() {
            let node = &self.nodes[id];
            match &node.kind {
                NodeKind::Filesystem(leaf) => table.push(leaf.slot())?,
                NodeKind::Table { .. } if id != self.root => {
                    table.push(PartitionSlot::new(node.start, 1, SlotKind::LegacyTable))?
                }
                _ => {}
            }
        }
        table.add_free(self.sectors_per_cylinder.max(1), self.total_sectors)?;

        Ok(table)
    }

    /// Creates and formats a `fs_name` partition of `size` sectors in the first free region
    /// that fits, active if it lands on the first entry of the MBR.
    pub fn add<D: BlockDevice>(
        &mut self,
        disc: &mut SectorDisc<D>,
        registry: &FilesystemRegistry,
        fs_name: &str,
        size: u64,
        boot_code: &[u8],
    ) -> Result<FilesystemLeaf> {
        let free = self
            .partition_table()?
            .find_free(size)
            .cloned()
            .ok_or(Error::NoSpaceLeft)?;
        let root = self.root;
        let id = self.insert_fs(disc, registry, root, fs_name, &free, size, true, boot_code)?;

        self.leaf(id).cloned().ok_or(Error::PartitionNotFound)
    }

    /// Creates a `fs_name` partition of `size` sectors at the start of the free region `free`,
    /// somewhere under the table `table`, and returns its node.
    ///
    /// The partition goes into a nested table when `free` lies inside one (or follows the last
    /// one and `table` has no unused entry left); otherwise, when 2 entries or fewer are unused
    /// and `free` has a sector to spare, a new extended boot record is created at `free.start`
    /// for it; otherwise it takes the first unused entry. Tables are grown to enclose the new
    /// partition.
    ///
    /// # Errors
    ///
    /// Nothing is written when `free` is not inside the range of `table`
    /// ([`Error::OutOfBounds`]), too small ([`Error::NoSpaceLeft`]) or when the filesystem is
    /// unknown. Later failures leave the sectors already written in place.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_fs<D: BlockDevice>(
        &mut self,
        disc: &mut SectorDisc<D>,
        registry: &FilesystemRegistry,
        table: NodeId,
        fs_name: &str,
        free: &PartitionSlot,
        size: u64,
        active: bool,
        boot_code: &[u8],
    ) -> Result<NodeId> {
        let children = self.table_children(table)?;
        let (table_start, table_end) = {
            let node = &self.nodes[table];
            (node.start, node.end())
        };

        if free.start <= table_start || free.end() > table_end {
            return Err(Error::OutOfBounds(free.start, free.size));
        }
        if size == 0 || size > free.size {
            return Err(Error::NoSpaceLeft);
        }
        // entries hold 32-bit sector numbers
        if u32::try_from(free.start + size).is_err() {
            return Err(Error::OutOfBounds(free.start, size));
        }
        if registry.find_by_name(fs_name).is_none() {
            return Err(Error::UnknownFilesystem(fs_name.to_string()));
        }
        if (disc.bytes_per_sector() as usize) < MIN_TABLE_SECTOR_SIZE {
            return Err(Error::InvalidGeometry);
        }

        let empty = children
            .iter()
            .copied()
            .filter(|&x| self.nodes[x].is_empty())
            .collect::<Vec<_>>();
        let inside = children.iter().copied().find(|&x| {
            let node = &self.nodes[x];
            node.is_table() && node.start < free.start && free.start < node.end()
        });
        let target = match inside {
            Some(x) => Some(x),
            None if empty.is_empty() => self.trailing_table(&children, free.start),
            None => None,
        };

        if let Some(child) = target {
            let child_start = self.nodes[child].start;
            let old_size = self.nodes[child].size;
            let limit = free.end().min(table_end);
            self.nodes[child].size = old_size.max(limit - child_start);

            let inner = PartitionSlot::free(free.start, limit - free.start);
            return match self.insert_fs(disc, registry, child, fs_name, &inner, size, false, boot_code)
            {
                Ok(id) => {
                    let fitted = old_size.max(self.fitted_size(child));
                    self.nodes[child].size = fitted;
                    if fitted != old_size {
                        debug!(
                            "growing table at {} to {} sectors",
                            child_start, fitted
                        );
                        self.write_to_table(disc, table, child)?;
                    }
                    Ok(id)
                }
                Err(err) => {
                    self.nodes[child].size = old_size;
                    Err(err)
                }
            };
        }

        // a region with no room for the record sector takes a plain entry instead
        if !empty.is_empty() && empty.len() <= 2 && free.size > size {
            let child = empty[0];

            // the new record is written before anything points to it
            let mut ebr = vec![0; disc.bytes_per_sector() as usize];
            ebr[SIGNATURE_OFFSET] = 0x55;
            ebr[SIGNATURE_OFFSET + 1] = 0xaa;
            disc.write(free.start, &ebr)?;

            let sys = if self.lba_to_chs(free.start + size).cylinder >= MAX_CYLINDER {
                EXTENDED_LBA
            } else {
                EXTENDED
            };
            debug!("new extended boot record at {}", free.start);
            self.make_table(child, free.start, size + 1, sys);

            let inner = PartitionSlot::free(free.start + 1, size);
            return match self.insert_fs(disc, registry, child, fs_name, &inner, size, false, boot_code)
            {
                Ok(id) => {
                    self.write_to_table(disc, table, child)?;
                    Ok(id)
                }
                Err(err) => {
                    self.release(child);
                    Err(err)
                }
            };
        }

        let child = *empty.first().ok_or(Error::TableFull)?;
        let leaf = registry.format(disc, fs_name, free.start, size, boot_code)?;
        {
            let node = &mut self.nodes[child];
            node.start = free.start;
            node.size = size;
            node.sys = leaf.type_code;
            node.active = active && node.index == 0;
            node.kind = NodeKind::Filesystem(leaf);
        }

        match self.write_to_table(disc, table, child) {
            Ok(()) => Ok(child),
            Err(err) => {
                self.release(child);
                Err(err)
            }
        }
    }

    /// The last nested table ending at or before `sector` with nothing used between its end
    /// and `sector`.
    fn trailing_table(&self, children: &[NodeId; 4], sector: u64) -> Option<NodeId> {
        let table = children
            .iter()
            .copied()
            .filter(|&x| self.nodes[x].is_table() && self.nodes[x].end() <= sector)
            .max_by_key(|&x| self.nodes[x].start)?;
        let end = self.nodes[table].end();

        let blocked = children.iter().any(|&x| {
            let node = &self.nodes[x];
            !node.is_empty() && node.start >= end && node.start <= sector
        });
        if blocked {
            None
        } else {
            Some(table)
        }
    }

    /// Size of a table once shrunk to its last used entry (at least its own sector).
    fn fitted_size(&self, table: NodeId) -> u64 {
        let start = self.nodes[table].start;
        let end = self
            .children(table)
            .iter()
            .flat_map(|x| x.iter())
            .map(|&x| &self.nodes[x])
            .filter(|x| !x.is_empty())
            .map(|x| x.end())
            .max()
            .unwrap_or(0);

        end.max(start + 1) - start
    }

    /// Writes the entry of `child` to the sector of its table `owner`.
    fn write_to_table<D: BlockDevice>(
        &self,
        disc: &mut SectorDisc<D>,
        owner: NodeId,
        child: NodeId,
    ) -> Result<()> {
        let owner_start = self.nodes[owner].start;
        let node = &self.nodes[child];
        let out_of_bounds = |_: TryFromIntError| Error::OutOfBounds(node.start, node.size);
        let entry = MBRPartitionEntry {
            boot: if node.active { ACTIVE } else { 0 },
            first_chs: self.lba_to_chs(node.start),
            sys: node.sys,
            last_chs: self.lba_to_chs(node.end().saturating_sub(1)),
            starting_lba: u32::try_from(node.start - owner_start).map_err(out_of_bounds)?,
            sectors: u32::try_from(node.size).map_err(out_of_bounds)?,
        };

        let mut sector = Self::table_sector(disc, owner_start)?;
        let offset = TABLE_OFFSET + node.index * ENTRY_SIZE;
        serialize_into(&mut sector[offset..offset + ENTRY_SIZE], &entry)?;
        sector[SIGNATURE_OFFSET] = 0x55;
        sector[SIGNATURE_OFFSET + 1] = 0xaa;
        debug!(
            "table {}: entry {} = type {:#04x} at {} ({} sectors)",
            owner_start, node.index, node.sys, node.start, node.size
        );

        disc.write(owner_start, &sector)
    }

    /// Zeroes the entry `index` in the sector of its table `owner`.
    fn delete_from_table<D: BlockDevice>(
        &self,
        disc: &mut SectorDisc<D>,
        owner: NodeId,
        index: usize,
    ) -> Result<()> {
        let owner_start = self.nodes[owner].start;
        let mut sector = Self::table_sector(disc, owner_start)?;
        let offset = TABLE_OFFSET + index * ENTRY_SIZE;
        for x in sector[offset..offset + ENTRY_SIZE].iter_mut() {
            *x = 0;
        }
        debug!("table {}: entry {} cleared", owner_start, index);

        disc.write(owner_start, &sector)
    }

    /// Frees the entry `index` of the table `table`.
    ///
    /// A nested table shrinks when the freed entry was its last one, and is itself freed from
    /// its parent once none of its entries is used.
    pub fn free_entry<D: BlockDevice>(
        &mut self,
        disc: &mut SectorDisc<D>,
        table: NodeId,
        index: usize,
    ) -> Result<()> {
        let children = self.table_children(table)?;
        let child = *children.get(index).ok_or(Error::PartitionNotFound)?;
        let freed_end = self.nodes[child].end();

        self.release(child);
        self.delete_from_table(disc, table, index)?;

        let (parent, own_index, start) = match &self.nodes[table] {
            Node {
                parent: Some(parent),
                index,
                start,
                ..
            } => (*parent, *index, *start),
            _ => return Ok(()),
        };
        if children.iter().all(|&x| self.nodes[x].is_empty()) {
            debug!("collapsing extended boot record at {}", start);
            return self.free_entry(disc, parent, own_index);
        }

        self.shrink(disc, table, freed_end)
    }

    fn shrink<D: BlockDevice>(
        &mut self,
        disc: &mut SectorDisc<D>,
        table: NodeId,
        freed_end: u64,
    ) -> Result<()> {
        let parent = match self.nodes[table].parent {
            Some(x) => x,
            None => return Ok(()),
        };
        if self.nodes[table].end() != freed_end {
            return Ok(());
        }
        let fitted = self.fitted_size(table);
        if fitted == self.nodes[table].size {
            return Ok(());
        }

        self.nodes[table].size = fitted;
        self.write_to_table(disc, parent, table)?;
        self.shrink(disc, parent, freed_end)
    }

    /// Frees the partition starting at `start`.
    pub fn remove<D: BlockDevice>(&mut self, disc: &mut SectorDisc<D>, start: u64) -> Result<()> {
        let id = self
            .walk()
            .into_iter()
            .find(|&x| self.leaf(x).map_or(false, |leaf| leaf.start == start))
            .ok_or(Error::PartitionNotFound)?;
        let node = &self.nodes[id];
        let parent = node.parent.ok_or(Error::PartitionNotFound)?;
        let index = node.index;

        self.free_entry(disc, parent, index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disc::testing::MemoryDevice;
    use crate::registry::{FsKind, NoFormat};

    fn setup(sectors: u64) -> (SectorDisc<MemoryDevice>, FilesystemRegistry, MBR) {
        let disc = SectorDisc::define(MemoryDevice::new(sectors, 16, 63), 0);
        let registry = FilesystemRegistry::with_fat(Box::new(NoFormat));
        let mbr = MBR::new(&disc);
        (disc, registry, mbr)
    }

    fn entry(disc: &mut SectorDisc<MemoryDevice>, table: u64, i: usize) -> MBRPartitionEntry {
        let sector = disc.read_sector(table).unwrap();
        deserialize(&sector[TABLE_OFFSET + i * ENTRY_SIZE..]).unwrap()
    }

    fn free_layout(table: &PartitionTable) -> Vec<(u64, u64)> {
        table.free_slots().map(|x| (x.start, x.size)).collect()
    }

    #[test]
    fn entry_layout() {
        let entry = MBRPartitionEntry {
            boot: ACTIVE,
            first_chs: CHS::new(0, 1, 1),
            sys: 0x0c,
            last_chs: CHS::new(0x2a5, 15, 63),
            starting_lba: 63,
            sectors: 0x0102_0304,
        };
        let data = bincode::serialize(&entry).unwrap();
        assert_eq!(
            data,
            vec![0x80, 1, 1, 0, 0x0c, 15, 0x80 | 63, 0xa5, 63, 0, 0, 0, 4, 3, 2, 1]
        );
        assert_eq!(deserialize::<MBRPartitionEntry>(&data).unwrap(), entry);
    }

    #[test]
    fn nested_tables_grow_on_demand() {
        let (mut disc, registry, mut mbr) = setup(100_000);
        mbr.process(&mut disc, &registry).unwrap();
        let mut starts = Vec::new();
        for _ in 0..6 {
            starts.push(mbr.add(&mut disc, &registry, "FAT16", 2000, &[]).unwrap().start);
        }
        assert_eq!(starts, vec![63, 2063, 4064, 6065, 8065, 10066]);

        let first = entry(&mut disc, 0, 0);
        assert!(first.is_active());
        assert_eq!(first.sys, 0x06);
        assert!(!entry(&mut disc, 0, 1).is_active());
        let third = entry(&mut disc, 0, 2);
        assert_eq!(third.sys, EXTENDED);
        assert_eq!((third.starting_lba, third.sectors), (4063, 2001));
        let fourth = entry(&mut disc, 0, 3);
        assert_eq!((fourth.starting_lba, fourth.sectors), (6064, 6002));
        // entries of nested tables are relative to their own table
        let nested = entry(&mut disc, 6064, 2);
        assert_eq!((nested.starting_lba, nested.sectors), (4001, 2001));
        assert!(!entry(&mut disc, 4063, 0).is_active());

        let mut again = MBR::new(&disc);
        again.process(&mut disc, &registry).unwrap();
        assert_eq!(
            again.leaves().map(|x| x.start).collect::<Vec<_>>(),
            starts
        );
        assert_eq!(again.partition_table().unwrap(), mbr.partition_table().unwrap());
        assert!(again
            .leaves()
            .all(|x| x.slot().kind == SlotKind::Filesystem(FsKind::Fat16) && x.size == 2000));
    }

    #[test]
    fn free_collapses_empty_tables() {
        let (mut disc, registry, mut mbr) = setup(100_000);
        mbr.process(&mut disc, &registry).unwrap();
        let blank = mbr.partition_table().unwrap();
        for _ in 0..6 {
            mbr.add(&mut disc, &registry, "FAT16", 2000, &[]).unwrap();
        }

        mbr.remove(&mut disc, 63).unwrap();
        mbr.remove(&mut disc, 8065).unwrap();
        mbr.remove(&mut disc, 10066).unwrap();
        // the trailing nested table is gone, its parent shrinks back
        let fourth = entry(&mut disc, 0, 3);
        assert_eq!((fourth.starting_lba, fourth.sectors), (6064, 2001));
        assert!(entry(&mut disc, 6064, 2).is_unused());

        mbr.remove(&mut disc, 2063).unwrap();
        mbr.remove(&mut disc, 6065).unwrap();
        mbr.remove(&mut disc, 4064).unwrap();
        assert!(matches!(
            mbr.remove(&mut disc, 4064),
            Err(Error::PartitionNotFound)
        ));

        for i in 0..4 {
            assert_eq!(entry(&mut disc, 0, i), MBRPartitionEntry::empty());
        }
        assert_eq!(mbr.partition_table().unwrap(), blank);
        mbr.process(&mut disc, &registry).unwrap();
        assert_eq!(mbr.leaves().count(), 0);
        assert_eq!(mbr.partition_table().unwrap(), blank);
    }

    #[test]
    fn insert_then_free_restores_layout() {
        let (mut disc, registry, mut mbr) = setup(100_000);
        mbr.process(&mut disc, &registry).unwrap();

        for _ in 0..3 {
            let before = mbr.partition_table().unwrap();
            let leaf = mbr.add(&mut disc, &registry, "FAT12", 3000, &[]).unwrap();
            assert_eq!(mbr.partition_table().unwrap().part_count(), before.part_count() + 1);
            mbr.remove(&mut disc, leaf.start).unwrap();
            let after = mbr.partition_table().unwrap();
            assert_eq!(after.part_count(), before.part_count());
            assert_eq!(free_layout(&after), free_layout(&before));

            // keep the partition for the next round
            mbr.add(&mut disc, &registry, "FAT12", 3000, &[]).unwrap();
        }
        // the third round went through a new extended boot record
        let children = mbr.children(mbr.root()).unwrap();
        assert!(mbr.node(children[2]).is_table());
    }

    #[test]
    fn exact_fit_takes_a_plain_entry() {
        let (mut disc, registry, mut mbr) = setup(100_000);
        mbr.process(&mut disc, &registry).unwrap();
        for _ in 0..3 {
            mbr.add(&mut disc, &registry, "FAT16", 2000, &[]).unwrap();
        }
        mbr.remove(&mut disc, 63).unwrap();
        assert_eq!(
            free_layout(&mbr.partition_table().unwrap()),
            vec![(63, 2000), (6064, 93936)]
        );

        let leaf = mbr.add(&mut disc, &registry, "FAT16", 2000, &[]).unwrap();
        assert_eq!((leaf.start, leaf.size), (63, 2000));
        let first = entry(&mut disc, 0, 0);
        assert_eq!(first.sys, 0x06);
        assert!(first.is_active());
        assert_eq!((first.starting_lba, first.sectors), (63, 2000));
        assert_eq!(
            free_layout(&mbr.partition_table().unwrap()),
            vec![(6064, 93936)]
        );

        let mut again = MBR::new(&disc);
        again.process(&mut disc, &registry).unwrap();
        assert_eq!(again.partition_table().unwrap(), mbr.partition_table().unwrap());
    }

    #[test]
    fn out_of_bounds_insert_writes_nothing() {
        let (mut disc, registry, mut mbr) = setup(100_000);
        mbr.process(&mut disc, &registry).unwrap();
        let root = mbr.root();

        for free in &[
            PartitionSlot::free(99_000, 2000),
            PartitionSlot::free(0, 5000),
            PartitionSlot::free(200_000, 5000),
        ] {
            assert!(matches!(
                mbr.insert_fs(&mut disc, &registry, root, "FAT16", free, 1000, true, &[]),
                Err(Error::OutOfBounds(..))
            ));
        }
        assert_eq!(disc.device().writes, 0);

        for _ in 0..3 {
            mbr.add(&mut disc, &registry, "FAT16", 2000, &[]).unwrap();
        }
        let writes = disc.device().writes;
        let nested = mbr.children(root).unwrap()[2];
        assert!(matches!(
            mbr.insert_fs(
                &mut disc,
                &registry,
                nested,
                "FAT16",
                &PartitionSlot::free(50_000, 1000),
                1000,
                false,
                &[]
            ),
            Err(Error::OutOfBounds(..))
        ));
        assert!(matches!(
            mbr.insert_fs(
                &mut disc,
                &registry,
                root,
                "FAT16",
                &PartitionSlot::free(50_000, 1000),
                1001,
                false,
                &[]
            ),
            Err(Error::NoSpaceLeft)
        ));
        assert!(matches!(
            mbr.insert_fs(
                &mut disc,
                &registry,
                root,
                "EXT4",
                &PartitionSlot::free(50_000, 1000),
                1000,
                false,
                &[]
            ),
            Err(Error::UnknownFilesystem(_))
        ));
        assert_eq!(disc.device().writes, writes);
    }

    #[test]
    fn raw_fields_beyond_chs_limit() {
        let (mut disc, registry, mut mbr) = setup(4_000_000);
        mbr.process(&mut disc, &registry).unwrap();
        for _ in 0..3 {
            mbr.add(&mut disc, &registry, "FAT32", 1_100_000, &[])
                .unwrap();
        }

        let third = entry(&mut disc, 0, 2);
        assert_eq!(third.sys, EXTENDED_LBA);
        assert_eq!(third.first_chs, CHS::new(1023, 15, 63));

        let mut again = MBR::new(&disc);
        again.process(&mut disc, &registry).unwrap();
        assert_eq!(
            again
                .leaves()
                .map(|x| (x.start, x.size))
                .collect::<Vec<_>>(),
            vec![
                (63, 1_100_000),
                (1_100_063, 1_100_000),
                (2_200_064, 1_100_000)
            ]
        );
    }

    #[test]
    fn sentinel_chs_falls_back_on_raw_fields() {
        let (mut disc, registry, mut mbr) = setup(4_000_000);
        let mut sector = vec![0; 512];
        let entry = MBRPartitionEntry {
            boot: 0,
            first_chs: CHS::new(1023, 255, 63),
            sys: 0x0b,
            last_chs: CHS::new(1023, 255, 63),
            starting_lba: 2_000_000,
            sectors: 100_000,
        };
        serialize_into(&mut sector[TABLE_OFFSET + ENTRY_SIZE..], &entry).unwrap();
        sector[510] = 0x55;
        sector[511] = 0xaa;
        disc.write(0, &sector).unwrap();

        mbr.process(&mut disc, &registry).unwrap();
        let leaves = mbr.leaves().collect::<Vec<_>>();
        assert_eq!(leaves.len(), 1);
        assert_eq!((leaves[0].start, leaves[0].size), (2_000_000, 100_000));
        assert_eq!(leaves[0].kind, FsKind::Fat32);
        assert_eq!(mbr.node(mbr.children(mbr.root()).unwrap()[1]).sys, 0x0b);
    }

    #[test]
    fn unsigned_sector_is_an_empty_table() {
        let (mut disc, registry, mut mbr) = setup(10_000);
        let mut sector = vec![0; 512];
        sector[TABLE_OFFSET + 4] = 0x06;
        disc.write(0, &sector).unwrap();
        mbr.process(&mut disc, &registry).unwrap();
        assert_eq!(mbr.leaves().count(), 0);
    }

    #[test]
    fn looping_chain_is_rejected() {
        let (mut disc, registry, mut mbr) = setup(10_000);
        let mut sector = vec![0; 512];
        let mut ebr = MBRPartitionEntry::empty();
        ebr.sys = EXTENDED;
        ebr.starting_lba = 100;
        ebr.sectors = 1000;
        serialize_into(&mut sector[TABLE_OFFSET..], &ebr).unwrap();
        sector[510] = 0x55;
        sector[511] = 0xaa;
        disc.write(0, &sector).unwrap();

        // the record at 100 points back to itself
        ebr.starting_lba = 0;
        let mut nested = vec![0; 512];
        serialize_into(&mut nested[TABLE_OFFSET..], &ebr).unwrap();
        nested[510] = 0x55;
        nested[511] = 0xaa;
        disc.write(100, &nested).unwrap();

        assert!(matches!(
            mbr.process(&mut disc, &registry),
            Err(Error::InconsistentEbr(100))
        ));
    }
}
