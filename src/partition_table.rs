use crate::registry::FsKind;
use crate::{Error, Result};
use std::ops::Index;

/// Gaps smaller than this (in sectors) are never exposed as free slots.
pub const MIN_FREE_SECTORS: u64 = 1024;

/// What occupies a [`PartitionSlot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
    /// Unallocated space.
    Free,
    /// A used legacy entry that no registered filesystem recognizes.
    LegacyLeaf,
    /// The sector holding a nested legacy table (an extended boot record).
    LegacyTable,
    /// A partition holding a known filesystem.
    Filesystem(FsKind),
}

/// A contiguous range of sectors on a disc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSlot {
    /// First sector (LBA).
    pub start: u64,
    /// Number of sectors.
    pub size: u64,
    /// What the range holds.
    pub kind: SlotKind,
}

impl PartitionSlot {
    /// Creates a slot.
    pub fn new(start: u64, size: u64, kind: SlotKind) -> PartitionSlot {
        PartitionSlot { start, size, kind }
    }

    /// Creates a free slot.
    pub fn free(start: u64, size: u64) -> PartitionSlot {
        PartitionSlot::new(start, size, SlotKind::Free)
    }

    /// The first sector after the slot.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// Returns `true` if the slot is unallocated space.
    pub fn is_free(&self) -> bool {
        self.kind == SlotKind::Free
    }

    /// Returns `true` if the slot is a partition (not free space, not a nested table).
    pub fn is_partition(&self) -> bool {
        matches!(self.kind, SlotKind::LegacyLeaf | SlotKind::Filesystem(_))
    }

    /// Returns `true` if `other` lies entirely within this slot.
    pub fn contains(&self, other: &PartitionSlot) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    /// Returns `true` if `sector` lies within this slot.
    pub fn contains_sector(&self, sector: u64) -> bool {
        sector >= self.start && sector < self.end()
    }
}

/// A bounded list of slots sorted by starting sector.
///
/// Once [`add_free`](PartitionTable::add_free) has run, every range between the first usable
/// sector and the end of the disc belongs to exactly one slot, except gaps smaller than
/// [`MIN_FREE_SECTORS`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    slots: Vec<PartitionSlot>,
    capacity: usize,
}

impl PartitionTable {
    /// Creates an empty table that can hold up to `capacity` slots.
    pub fn with_capacity(capacity: usize) -> PartitionTable {
        PartitionTable {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a slot. The table is not sorted afterwards.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::TableFull`] when the table already holds `capacity` slots.
    pub fn push(&mut self, slot: PartitionSlot) -> Result<()> {
        if self.slots.len() >= self.capacity {
            return Err(Error::TableFull);
        }
        self.slots.push(slot);

        Ok(())
    }

    /// Sorts the slots by starting sector. The sort is stable: slots starting at the same sector
    /// keep their insertion order.
    pub fn sort(&mut self) {
        // insertion sort, the table is small and nearly sorted most of the time
        for i in 1..self.slots.len() {
            let mut j = i;
            while j > 0 && self.slots[j - 1].start > self.slots[j].start {
                self.slots.swap(j - 1, j);
                j -= 1;
            }
        }
    }

    /// Sorts the table then materializes free slots in every gap of at least
    /// [`MIN_FREE_SECTORS`] sectors between `first_usable` and `end` (exclusive). Free slots left
    /// by a previous call are dropped first. The table is left as is when it fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use discman::{PartitionSlot, PartitionTable, SlotKind};
    ///
    /// let mut table = PartitionTable::with_capacity(8);
    /// table.push(PartitionSlot::new(5000, 1000, SlotKind::LegacyLeaf)).unwrap();
    /// table.push(PartitionSlot::new(2048, 2000, SlotKind::LegacyLeaf)).unwrap();
    /// table.add_free(63, 10000).unwrap();
    ///
    /// // NOTE: the 952 sectors between both partitions are too small to be listed
    /// assert_eq!(
    ///     table.free_slots().map(|x| (x.start, x.size)).collect::<Vec<_>>(),
    ///     vec![(63, 1985), (6000, 4000)]
    /// );
    /// ```
    pub fn add_free(&mut self, first_usable: u64, end: u64) -> Result<()> {
        let mut used = PartitionTable {
            slots: self.slots.iter().filter(|x| !x.is_free()).cloned().collect(),
            capacity: self.capacity,
        };
        used.sort();

        let mut table = PartitionTable::with_capacity(self.capacity);
        let mut next = first_usable;
        for slot in used.slots {
            if slot.start > next && slot.start - next >= MIN_FREE_SECTORS {
                table.push(PartitionSlot::free(next, slot.start - next))?;
            }
            next = next.max(slot.end());
            table.push(slot)?;
        }
        if end > next && end - next >= MIN_FREE_SECTORS {
            table.push(PartitionSlot::free(next, end - next))?;
        }
        *self = table;

        Ok(())
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the table holds no slot.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maximum number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of partitions (free slots and nested tables excluded).
    pub fn part_count(&self) -> usize {
        self.slots.iter().filter(|x| x.is_partition()).count()
    }

    /// Iterates over the slots.
    pub fn iter(&self) -> impl Iterator<Item = &PartitionSlot> {
        self.slots.iter()
    }

    /// Iterates over the free slots.
    pub fn free_slots(&self) -> impl Iterator<Item = &PartitionSlot> {
        self.slots.iter().filter(|x| x.is_free())
    }

    /// Finds the first free slot of at least `size` sectors.
    pub fn find_free(&self, size: u64) -> Option<&PartitionSlot> {
        self.free_slots().find(|x| x.size >= size)
    }

    /// Finds the partition where the given sector resides.
    pub fn find_at_sector(&self, sector: u64) -> Option<&PartitionSlot> {
        self.slots
            .iter()
            .find(|x| x.is_partition() && x.contains_sector(sector))
    }
}

impl Index<usize> for PartitionTable {
    type Output = PartitionSlot;

    fn index(&self, i: usize) -> &PartitionSlot {
        &self.slots[i]
    }
}
