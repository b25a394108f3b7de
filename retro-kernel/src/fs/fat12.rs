//! FAT12 on any [`Volume`].
//!
//! The whole first FAT copy is cached in memory at mount and written back to
//! every copy on sync; file data always goes straight to the volume. Write
//! operations (create, rename, mkdir, delete) are scoped to the root
//! directory; lookups and reads work at any depth.

use crate::fs::volume::{Volume, VolumeError};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

pub mod boot_sector;
pub mod dir_entry;
pub mod fat_entry;

pub use boot_sector::{BootSector, Error as BootSectorError};
pub use dir_entry::{decode_83, encode_83, encode_label, Attributes, DirEntry, NameError, SlotKind};
pub use fat_entry::FatEntry;

pub const SECTOR_SIZE: usize = 512;

/// FAT12 can index at most 4084 clusters; anything larger is FAT16 territory.
pub const MAX_CLUSTERS: usize = 4084;

#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash)]
pub struct Cluster(pub u16);

impl Cluster {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub(super) trait SliceExt {
    fn array<const N: usize>(&self, offset: usize) -> [u8; N];
    fn copy_from_array<const N: usize>(&mut self, offset: usize, array: [u8; N]);
}

impl SliceExt for [u8] {
    fn array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut ret = [0; N];
        ret.copy_from_slice(&self[offset..offset + N]);
        ret
    }

    fn copy_from_array<const N: usize>(&mut self, offset: usize, array: [u8; N]) {
        self[offset..offset + N].copy_from_slice(&array);
    }
}

/// Errors that occur during FAT12 operations.
#[derive(PartialEq, Eq, Debug)]
pub enum Error {
    Volume(VolumeError),
    BootSector(BootSectorError),
    Name(NameError),
    BadPath,
    NotFound,
    Exists,
    NotADirectory,
    IsADirectory,
    NotEmpty,
    /// No free cluster or no free directory slot.
    NoSpace,
    /// FAT chain or directory structure violates an invariant.
    Corrupt(&'static str),
    /// Correct request, but this driver does not implement it.
    Unsupported(&'static str),
}

impl From<VolumeError> for Error {
    fn from(e: VolumeError) -> Self {
        Self::Volume(e)
    }
}

impl From<BootSectorError> for Error {
    fn from(e: BootSectorError) -> Self {
        Self::BootSector(e)
    }
}

impl From<NameError> for Error {
    fn from(e: NameError) -> Self {
        Self::Name(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Volume(e) => write!(f, "{}", e),
            Error::BootSector(e) => write!(f, "{}", e),
            Error::Name(e) => write!(f, "{}", e),
            Error::BadPath => write!(f, "bad path"),
            Error::NotFound => write!(f, "not found"),
            Error::Exists => write!(f, "already exists"),
            Error::NotADirectory => write!(f, "not a directory"),
            Error::IsADirectory => write!(f, "is a directory"),
            Error::NotEmpty => write!(f, "directory not empty"),
            Error::NoSpace => write!(f, "no space left"),
            Error::Corrupt(s) => write!(f, "filesystem corrupt: {}", s),
            Error::Unsupported(s) => write!(f, "unsupported: {}", s),
        }
    }
}

/// A directory's identity: the fixed root area or a cluster chain.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum DirRef {
    Root,
    Sub(Cluster),
}

/// Where a 32-byte directory slot lives on disk.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct DirLocation {
    pub sector: usize,
    pub offset: usize,
}

/// Walks a directory slot by slot. Obtained from [`FileSystem::dir_cursor`];
/// advanced with the filesystem because every step may read a sector.
#[derive(Debug, Clone)]
pub struct DirCursor {
    dir: DirRef,
    sector: usize,
    entry: usize,
    cluster: Cluster,
    sectors_into_cluster: usize,
    finished: bool,
}

/// An open file: a private copy of the directory entry plus chain position.
/// `flush_file` writes the entry copy back when dirty.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct FileHandle {
    entry: DirEntry,
    location: DirLocation,
    pos: u32,
    cluster: u16,
    cluster_byte: u32,
    dirty: bool,
}

impl FileHandle {
    pub fn size(&self) -> u32 {
        self.entry.file_size
    }

    pub fn pos(&self) -> u32 {
        self.pos
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn entry(&self) -> &DirEntry {
        &self.entry
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct FsStats {
    pub total_clusters: usize,
    pub free_clusters: usize,
    pub cluster_size: usize,
}

#[derive(Debug)]
pub struct FileSystem<V> {
    volume: V,
    bs: BootSector,
    fat: Vec<u8>,
    fat_dirty: bool,
    scratch: [u8; SECTOR_SIZE],
}

impl<V: Volume> FileSystem<V> {
    /// Read and validate the boot sector, then cache the first FAT copy.
    pub fn mount(mut volume: V) -> Result<Self, Error> {
        let mut buf = [0u8; SECTOR_SIZE];
        volume.read(0, &mut buf)?;
        let bs = BootSector::try_from(&buf[..])?;

        if volume.sector_count() < bs.total_sectors() {
            Err(BootSectorError::Broken("TotSec (volume smaller)"))?;
        }

        let mut fat = vec![0u8; bs.fat_size() * SECTOR_SIZE];
        for i in 0..bs.fat_size() {
            volume.read(
                bs.fat_start() + i,
                &mut fat[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
            )?;
        }

        Ok(Self {
            volume,
            bs,
            fat,
            fat_dirty: false,
            scratch: [0; SECTOR_SIZE],
        })
    }

    /// Flush the FAT cache and give the volume back.
    pub fn unmount(mut self) -> Result<V, Error> {
        self.sync()?;
        Ok(self.volume)
    }

    pub fn boot_sector(&self) -> &BootSector {
        &self.bs
    }

    pub fn volume_mut(&mut self) -> &mut V {
        &mut self.volume
    }

    /// Write the cached FAT to every copy. The dirty flag clears only after
    /// all copies are on the medium, FAT metadata committing last.
    pub fn sync(&mut self) -> Result<(), Error> {
        if self.fat_dirty {
            for copy in 0..self.bs.fat_count() {
                for i in 0..self.bs.fat_size() {
                    let sector = self.bs.fat_start() + copy * self.bs.fat_size() + i;
                    self.volume
                        .write(sector, &self.fat[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])?;
                }
            }
            self.fat_dirty = false;
        }
        self.volume.sync()?;
        Ok(())
    }

    pub fn stats(&self) -> FsStats {
        let total = self.bs.total_clusters();
        let free = (2..2 + total)
            .filter(|n| fat_entry::read(&self.fat, Cluster(*n as u16)) == fat_entry::FREE)
            .count();
        FsStats {
            total_clusters: total,
            free_clusters: free,
            cluster_size: self.bs.cluster_size_bytes(),
        }
    }

    // ---- FAT chain management ----

    pub fn fat_entry(&self, cluster: Cluster) -> FatEntry {
        fat_entry::read(&self.fat, cluster).into()
    }

    fn set_fat_entry(&mut self, cluster: Cluster, entry: FatEntry) {
        fat_entry::write(&mut self.fat, cluster, entry.into());
        self.fat_dirty = true;
    }

    /// Next cluster in the chain, `None` at end-of-chain.
    fn next_in_chain(&self, cluster: Cluster) -> Result<Option<Cluster>, Error> {
        if !self.bs.is_cluster_in_range(cluster) {
            Err(Error::Corrupt("cluster out of range"))?;
        }
        match self.fat_entry(cluster) {
            FatEntry::Chained(next) if self.bs.is_cluster_in_range(next) => Ok(Some(next)),
            FatEntry::Chained(_) => Err(Error::Corrupt("chain leaves the data area")),
            FatEntry::EndOfChain => Ok(None),
            FatEntry::Free | FatEntry::Reserved | FatEntry::Bad => {
                Err(Error::Corrupt("chain hits a non-data entry"))
            }
        }
    }

    /// First-fit scan from cluster 2. The winner is marked end-of-chain.
    pub fn alloc_cluster(&mut self) -> Option<Cluster> {
        let total = self.bs.total_clusters();
        for n in 2..2 + total {
            let cluster = Cluster(n as u16);
            if fat_entry::read(&self.fat, cluster) == fat_entry::FREE {
                self.set_fat_entry(cluster, FatEntry::EndOfChain);
                return Some(cluster);
            }
        }
        None
    }

    /// Hang a fresh cluster off `tail`.
    fn extend_chain(&mut self, tail: Cluster) -> Option<Cluster> {
        let new = self.alloc_cluster()?;
        self.set_fat_entry(tail, FatEntry::Chained(new));
        Some(new)
    }

    /// Zero every slot from `start` to the end-of-chain marker.
    pub fn free_chain(&mut self, start: Cluster) -> Result<(), Error> {
        let mut cluster = start;
        loop {
            let next = self.next_in_chain(cluster)?;
            self.set_fat_entry(cluster, FatEntry::Free);
            match next {
                Some(n) => cluster = n,
                None => return Ok(()),
            }
        }
    }

    // ---- directory iteration ----

    pub fn dir_cursor(&self, dir: DirRef) -> DirCursor {
        let (sector, cluster) = match dir {
            DirRef::Root => (self.bs.root_start(), Cluster(0)),
            DirRef::Sub(c) => (self.bs.cluster_to_lba(c), c),
        };
        DirCursor {
            dir,
            sector,
            entry: 0,
            cluster,
            sectors_into_cluster: 0,
            finished: false,
        }
    }

    /// Next raw slot, deleted and terminal slots included. `None` only when
    /// the directory area itself is exhausted.
    fn cursor_next_raw(
        &mut self,
        cur: &mut DirCursor,
    ) -> Result<Option<(DirLocation, [u8; dir_entry::ENTRY_SIZE])>, Error> {
        if cur.finished {
            return Ok(None);
        }

        self.volume.read(cur.sector, &mut self.scratch)?;
        let offset = cur.entry * dir_entry::ENTRY_SIZE;
        let location = DirLocation {
            sector: cur.sector,
            offset,
        };
        let raw = self.scratch.array::<{ dir_entry::ENTRY_SIZE }>(offset);

        cur.entry += 1;
        if cur.entry == dir_entry::ENTRIES_PER_SECTOR {
            cur.entry = 0;
            match cur.dir {
                DirRef::Root => {
                    cur.sector += 1;
                    if cur.sector == self.bs.root_start() + self.bs.root_sectors() {
                        cur.finished = true;
                    }
                }
                DirRef::Sub(_) => {
                    cur.sectors_into_cluster += 1;
                    if cur.sectors_into_cluster == self.bs.cluster_size_sectors() {
                        match self.next_in_chain(cur.cluster)? {
                            Some(next) => {
                                cur.cluster = next;
                                cur.sector = self.bs.cluster_to_lba(next);
                                cur.sectors_into_cluster = 0;
                            }
                            None => cur.finished = true,
                        }
                    } else {
                        cur.sector += 1;
                    }
                }
            }
        }

        Ok(Some((location, raw)))
    }

    /// Next live entry: skips deleted slots, long-filename fragments and the
    /// volume label; terminates at the end marker.
    pub fn cursor_next(
        &mut self,
        cur: &mut DirCursor,
    ) -> Result<Option<(DirLocation, DirEntry)>, Error> {
        while let Some((location, raw)) = self.cursor_next_raw(cur)? {
            match DirEntry::classify(&raw) {
                SlotKind::End => {
                    cur.finished = true;
                    return Ok(None);
                }
                SlotKind::Deleted | SlotKind::LongName | SlotKind::VolumeLabel => continue,
                SlotKind::Live => return Ok(Some((location, DirEntry::from_raw(&raw)))),
            }
        }
        Ok(None)
    }

    /// The `index`-th live entry of `dir`, dot entries included.
    pub fn dir_entry_at(
        &mut self,
        dir: DirRef,
        index: usize,
    ) -> Result<Option<DirEntry>, Error> {
        let mut cur = self.dir_cursor(dir);
        for _ in 0..index {
            if self.cursor_next(&mut cur)?.is_none() {
                return Ok(None);
            }
        }
        Ok(self.cursor_next(&mut cur)?.map(|(_, e)| e))
    }

    fn find_in_dir(
        &mut self,
        dir: DirRef,
        name: &[u8; 11],
    ) -> Result<Option<(DirLocation, DirEntry)>, Error> {
        let mut cur = self.dir_cursor(dir);
        while let Some((location, entry)) = self.cursor_next(&mut cur)? {
            if entry.name == *name {
                return Ok(Some((location, entry)));
            }
        }
        Ok(None)
    }

    /// First reusable slot (deleted or terminal).
    fn find_free_slot(&mut self, dir: DirRef) -> Result<Option<DirLocation>, Error> {
        let mut cur = self.dir_cursor(dir);
        while let Some((location, raw)) = self.cursor_next_raw(&mut cur)? {
            match DirEntry::classify(&raw) {
                SlotKind::End | SlotKind::Deleted => return Ok(Some(location)),
                _ => continue,
            }
        }
        Ok(None)
    }

    // ---- path resolution ----

    fn components(path: &str) -> impl Iterator<Item = &str> {
        path.split('/').filter(|c| !c.is_empty())
    }

    /// Walk `path` from the root. `/` resolves to the root itself.
    pub fn resolve(&mut self, path: &str) -> Result<Option<(DirLocation, DirEntry)>, Error> {
        if path.is_empty() {
            Err(Error::BadPath)?;
        }
        let mut dir = DirRef::Root;
        let mut found = None;
        let mut components = Self::components(path).peekable();
        if components.peek().is_none() {
            return Ok(None); // the root directory itself
        }
        while let Some(component) = components.next() {
            let name = encode_83(component)?;
            let (location, entry) = self
                .find_in_dir(dir, &name)?
                .ok_or(Error::NotFound)?;
            if components.peek().is_some() {
                if !entry.is_directory() {
                    Err(Error::NotADirectory)?;
                }
                let cluster = entry.start_cluster().ok_or(Error::Corrupt("dir without cluster"))?;
                dir = DirRef::Sub(cluster);
            }
            found = Some((location, entry));
        }
        Ok(found)
    }

    /// Resolve `path` to a directory reference.
    pub fn resolve_dir(&mut self, path: &str) -> Result<DirRef, Error> {
        match self.resolve(path)? {
            None => Ok(DirRef::Root),
            Some((_, entry)) => {
                if !entry.is_directory() {
                    Err(Error::NotADirectory)?;
                }
                let cluster = entry
                    .start_cluster()
                    .ok_or(Error::Corrupt("dir without cluster"))?;
                Ok(DirRef::Sub(cluster))
            }
        }
    }

    /// Split a path into its parent and final component, requiring the
    /// parent to be the root. Writes below subdirectories are deferred.
    fn root_component(path: &str) -> Result<&str, Error> {
        let mut components = Self::components(path);
        let name = components.next().ok_or(Error::BadPath)?;
        if components.next().is_some() {
            Err(Error::Unsupported("writes below the root directory"))?;
        }
        Ok(name)
    }

    // ---- file I/O ----

    pub fn open(&mut self, path: &str) -> Result<FileHandle, Error> {
        let (location, entry) = self.resolve(path)?.ok_or(Error::IsADirectory)?;
        if entry.is_directory() {
            Err(Error::IsADirectory)?;
        }
        Ok(FileHandle {
            entry,
            location,
            pos: 0,
            cluster: entry.cluster,
            cluster_byte: 0,
            dirty: false,
        })
    }

    /// Read from the current position, never past the file size.
    pub fn read_file(&mut self, h: &mut FileHandle, buf: &mut [u8]) -> Result<usize, Error> {
        let cluster_bytes = self.bs.cluster_size_bytes() as u32;
        let mut done = 0;

        while done < buf.len() && h.pos < h.entry.file_size {
            if h.cluster == 0 {
                Err(Error::Corrupt("data before first cluster"))?;
            }
            if h.cluster_byte == cluster_bytes {
                match self.next_in_chain(Cluster(h.cluster))? {
                    Some(next) => {
                        h.cluster = next.0;
                        h.cluster_byte = 0;
                    }
                    None => break,
                }
            }

            let sector = self.bs.cluster_to_lba(Cluster(h.cluster))
                + h.cluster_byte as usize / SECTOR_SIZE;
            let in_sector = h.cluster_byte as usize % SECTOR_SIZE;
            let n = (SECTOR_SIZE - in_sector)
                .min(buf.len() - done)
                .min((h.entry.file_size - h.pos) as usize)
                .min((cluster_bytes - h.cluster_byte) as usize);

            self.volume.read(sector, &mut self.scratch)?;
            buf[done..done + n].copy_from_slice(&self.scratch[in_sector..in_sector + n]);

            done += n;
            h.pos += n as u32;
            h.cluster_byte += n as u32;
        }
        Ok(done)
    }

    /// Write at the current position, extending the chain as needed. Returns
    /// the bytes actually written; allocation failure yields a short count.
    pub fn write_file(&mut self, h: &mut FileHandle, buf: &[u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        if h.entry.cluster == 0 {
            let first = match self.alloc_cluster() {
                Some(c) => c,
                None => return Ok(0),
            };
            h.entry.cluster = first.0;
            h.cluster = first.0;
            h.cluster_byte = 0;
            h.dirty = true;
        }

        let cluster_bytes = self.bs.cluster_size_bytes() as u32;
        let mut done = 0;

        while done < buf.len() {
            if h.cluster_byte == cluster_bytes {
                let next = match self.next_in_chain(Cluster(h.cluster))? {
                    Some(next) => next,
                    None => match self.extend_chain(Cluster(h.cluster)) {
                        Some(next) => next,
                        None => break, // volume full: partial write
                    },
                };
                h.cluster = next.0;
                h.cluster_byte = 0;
            }

            let sector = self.bs.cluster_to_lba(Cluster(h.cluster))
                + h.cluster_byte as usize / SECTOR_SIZE;
            let in_sector = h.cluster_byte as usize % SECTOR_SIZE;
            let n = (SECTOR_SIZE - in_sector).min(buf.len() - done);

            if n == SECTOR_SIZE {
                self.scratch.copy_from_slice(&buf[done..done + n]);
            } else {
                // Partial sector: read-modify-write.
                self.volume.read(sector, &mut self.scratch)?;
                self.scratch[in_sector..in_sector + n].copy_from_slice(&buf[done..done + n]);
            }
            self.volume.write(sector, &self.scratch)?;

            done += n;
            h.pos += n as u32;
            h.cluster_byte += n as u32;
            if h.pos > h.entry.file_size {
                h.entry.file_size = h.pos;
                h.dirty = true;
            }
        }
        Ok(done)
    }

    /// Reposition, clamped to the file size. The chain is re-walked from the
    /// start so the handle's cluster always stays reachable.
    pub fn seek_file(&mut self, h: &mut FileHandle, pos: u32) -> Result<u32, Error> {
        let pos = pos.min(h.entry.file_size);
        let cluster_bytes = self.bs.cluster_size_bytes() as u32;

        if h.entry.cluster == 0 {
            h.pos = pos;
            h.cluster = 0;
            h.cluster_byte = pos;
            return Ok(pos);
        }

        let mut cluster = Cluster(h.entry.cluster);
        let mut remaining = pos;
        while remaining >= cluster_bytes {
            match self.next_in_chain(cluster)? {
                Some(next) => {
                    cluster = next;
                    remaining -= cluster_bytes;
                }
                None => break, // position right at the end of the tail cluster
            }
        }
        h.pos = pos;
        h.cluster = cluster.0;
        h.cluster_byte = remaining;
        Ok(pos)
    }

    /// Shrink to `len`, freeing the tail of the chain. Growing is done by
    /// writing, not truncating; a larger `len` leaves the file untouched.
    pub fn truncate_file(&mut self, h: &mut FileHandle, len: u32) -> Result<(), Error> {
        if len >= h.entry.file_size {
            return Ok(());
        }
        let cluster_bytes = self.bs.cluster_size_bytes() as u32;

        if len == 0 {
            if let Some(start) = h.entry.start_cluster() {
                self.free_chain(start)?;
            }
            h.entry.cluster = 0;
        } else {
            let keep = (len + cluster_bytes - 1) / cluster_bytes;
            let mut tail = Cluster(h.entry.cluster);
            for _ in 1..keep {
                tail = self
                    .next_in_chain(tail)?
                    .ok_or(Error::Corrupt("chain shorter than file size"))?;
            }
            let rest = self.next_in_chain(tail)?;
            self.set_fat_entry(tail, FatEntry::EndOfChain);
            if let Some(rest) = rest {
                self.free_chain(rest)?;
            }
        }

        h.entry.file_size = len;
        h.dirty = true;
        if h.pos > len {
            self.seek_file(h, len)?;
        }
        Ok(())
    }

    /// Write the handle's directory-entry copy back and sync the FAT.
    pub fn flush_file(&mut self, h: &mut FileHandle) -> Result<(), Error> {
        if h.dirty {
            self.write_dir_entry_at(h.location, h.entry.to_raw())?;
            h.dirty = false;
        }
        self.sync()
    }

    fn write_dir_entry_at(
        &mut self,
        location: DirLocation,
        raw: [u8; dir_entry::ENTRY_SIZE],
    ) -> Result<(), Error> {
        self.volume.read(location.sector, &mut self.scratch)?;
        self.scratch
            .copy_from_array(location.offset, raw);
        self.volume.write(location.sector, &self.scratch)?;
        Ok(())
    }

    // ---- namespace operations (root directory only) ----

    /// Create an empty file. Fails if the name is already present.
    pub fn create(&mut self, path: &str) -> Result<(), Error> {
        let name = encode_83(Self::root_component(path)?)?;
        if self.find_in_dir(DirRef::Root, &name)?.is_some() {
            Err(Error::Exists)?;
        }
        let slot = self
            .find_free_slot(DirRef::Root)?
            .ok_or(Error::NoSpace)?;
        self.write_dir_entry_at(slot, DirEntry::new_file(name).to_raw())?;
        self.sync()
    }

    /// Remove a file: free its chain, then tombstone the entry.
    pub fn unlink(&mut self, path: &str) -> Result<(), Error> {
        let name = encode_83(Self::root_component(path)?)?;
        let (location, entry) = self
            .find_in_dir(DirRef::Root, &name)?
            .ok_or(Error::NotFound)?;
        if entry.is_directory() {
            Err(Error::IsADirectory)?;
        }
        if let Some(start) = entry.start_cluster() {
            self.free_chain(start)?;
        }
        self.tombstone(location)?;
        self.sync()
    }

    fn tombstone(&mut self, location: DirLocation) -> Result<(), Error> {
        self.volume.read(location.sector, &mut self.scratch)?;
        self.scratch[location.offset] = dir_entry::MARKER_DELETED;
        self.volume.write(location.sector, &self.scratch)?;
        Ok(())
    }

    /// Rename in place: only the name bytes of the entry change.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), Error> {
        let old_name = encode_83(Self::root_component(old_path)?)?;
        let new_name = encode_83(Self::root_component(new_path)?)?;
        if self.find_in_dir(DirRef::Root, &new_name)?.is_some() {
            Err(Error::Exists)?;
        }
        let (location, mut entry) = self
            .find_in_dir(DirRef::Root, &old_name)?
            .ok_or(Error::NotFound)?;
        entry.name = new_name;
        self.write_dir_entry_at(location, entry.to_raw())?;
        self.sync()
    }

    /// Create a directory with its `.` and `..` entries.
    pub fn mkdir(&mut self, path: &str) -> Result<(), Error> {
        let name = encode_83(Self::root_component(path)?)?;
        if self.find_in_dir(DirRef::Root, &name)?.is_some() {
            Err(Error::Exists)?;
        }
        let slot = self
            .find_free_slot(DirRef::Root)?
            .ok_or(Error::NoSpace)?;
        let cluster = self.alloc_cluster().ok_or(Error::NoSpace)?;

        // Body: dot entries in the first sector, zeros after.
        let dot = DirEntry::new_directory(*b".          ", cluster);
        let dotdot = DirEntry::new_directory(*b"..         ", Cluster(0)); // 0 = root
        self.scratch = [0; SECTOR_SIZE];
        self.scratch.copy_from_array(0, dot.to_raw());
        self.scratch.copy_from_array(32, dotdot.to_raw());
        let first = self.bs.cluster_to_lba(cluster);
        self.volume.write(first, &self.scratch)?;
        self.scratch = [0; SECTOR_SIZE];
        for i in 1..self.bs.cluster_size_sectors() {
            self.volume.write(first + i, &self.scratch)?;
        }

        self.write_dir_entry_at(slot, DirEntry::new_directory(name, cluster).to_raw())?;
        self.sync()
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<(), Error> {
        let name = encode_83(Self::root_component(path)?)?;
        let (location, entry) = self
            .find_in_dir(DirRef::Root, &name)?
            .ok_or(Error::NotFound)?;
        if !entry.is_directory() {
            Err(Error::NotADirectory)?;
        }
        let cluster = entry
            .start_cluster()
            .ok_or(Error::Corrupt("dir without cluster"))?;

        let mut cur = self.dir_cursor(DirRef::Sub(cluster));
        while let Some((_, e)) = self.cursor_next(&mut cur)? {
            if e.name != *b".          " && e.name != *b"..         " {
                Err(Error::NotEmpty)?;
            }
        }

        self.free_chain(cluster)?;
        self.tombstone(location)?;
        self.sync()
    }

    /// The volume label: the root's label entry when present, the BPB field
    /// otherwise.
    pub fn label(&mut self) -> Result<[u8; 11], Error> {
        let mut cur = self.dir_cursor(DirRef::Root);
        while let Some((_, raw)) = self.cursor_next_raw(&mut cur)? {
            match DirEntry::classify(&raw) {
                SlotKind::End => break,
                SlotKind::VolumeLabel => return Ok(raw.array::<11>(0)),
                _ => continue,
            }
        }
        Ok(self.bs.volume_label())
    }

    /// Lay down a fresh FAT12 filesystem on `volume`.
    pub fn format(volume: &mut V, volume_id: u32, label: [u8; 11]) -> Result<(), Error> {
        let bs = BootSector::for_format(volume.sector_count(), volume_id, label);
        volume.write(0, &bs.to_bytes())?;

        let mut sector = [0u8; SECTOR_SIZE];
        for copy in 0..bs.fat_count() {
            for i in 0..bs.fat_size() {
                sector = [0; SECTOR_SIZE];
                if i == 0 {
                    // Reserved slots: FAT[0] echoes the media byte, FAT[1] is
                    // a permanent end-of-chain.
                    fat_entry::write(&mut sector, Cluster(0), bs.media() as u16 | 0xf00);
                    fat_entry::write(&mut sector, Cluster(1), fat_entry::EOC);
                }
                volume.write(bs.fat_start() + copy * bs.fat_size() + i, &sector)?;
            }
        }

        for i in 0..bs.root_sectors() {
            sector = [0; SECTOR_SIZE];
            if i == 0 {
                sector.copy_from_array(0, DirEntry::new_volume_label(label).to_raw());
            }
            volume.write(bs.root_start() + i, &sector)?;
        }

        volume.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ramdisk::RamDisk;

    fn formatted_disk(sectors: usize) -> RamDisk {
        let mut disk = RamDisk::new(sectors);
        FileSystem::format(&mut disk, 0x1980_0101, *b"RETROFUTURE").unwrap();
        disk
    }

    fn fresh(sectors: usize) -> FileSystem<RamDisk> {
        FileSystem::mount(formatted_disk(sectors)).unwrap()
    }

    #[test]
    fn format_writes_the_canonical_layout() {
        let mut disk = formatted_disk(2880);

        let mut boot = [0u8; SECTOR_SIZE];
        disk.read(0, &mut boot).unwrap();
        assert_eq!(boot[510..512], [0x55, 0xaa]);

        // FAT[0] = media | 0xF00, FAT[1] = 0xFFF.
        let mut fat = [0u8; SECTOR_SIZE];
        disk.read(1, &mut fat).unwrap();
        assert_eq!(fat[0], 0xf0);
        assert_eq!(fat[1], 0xff);
        assert_eq!(fat[2], 0xff);

        // Volume label first in the root directory.
        let bs = BootSector::try_from(&boot[..]).unwrap();
        let mut root = [0u8; SECTOR_SIZE];
        disk.read(bs.root_start(), &mut root).unwrap();
        assert_eq!(&root[0..11], b"RETROFUTURE");
        assert_eq!(root[11], 0x08);
    }

    #[test]
    fn mount_rejects_an_unformatted_volume() {
        let err = FileSystem::mount(RamDisk::new(64)).unwrap_err();
        assert_eq!(err, Error::BootSector(BootSectorError::SignatureMismatch));
    }

    #[test]
    fn create_write_reopen_read() {
        let mut fs = fresh(2880);
        fs.create("/FOO.TXT").unwrap();
        let mut h = fs.open("/FOO.TXT").unwrap();
        assert_eq!(fs.write_file(&mut h, b"HELLO").unwrap(), 5);
        fs.flush_file(&mut h).unwrap();

        let mut h = fs.open("/FOO.TXT").unwrap();
        assert_eq!(h.size(), 5);
        let mut buf = [0u8; 32];
        assert_eq!(fs.read_file(&mut h, &mut buf).unwrap(), 5);
        assert_eq!(&buf[0..5], b"HELLO");
        // A second read is at EOF.
        assert_eq!(fs.read_file(&mut h, &mut buf).unwrap(), 0);
    }

    #[test]
    fn create_rejects_duplicates_and_open_rejects_missing() {
        let mut fs = fresh(2880);
        fs.create("/FOO.TXT").unwrap();
        assert_eq!(fs.create("/foo.txt").unwrap_err(), Error::Exists);
        assert_eq!(fs.open("/BAR.TXT").unwrap_err(), Error::NotFound);
    }

    #[test]
    fn writes_below_root_are_refused() {
        let mut fs = fresh(2880);
        fs.mkdir("/SUB").unwrap();
        assert_eq!(
            fs.create("/SUB/FILE.TXT").unwrap_err(),
            Error::Unsupported("writes below the root directory")
        );
    }

    #[test]
    fn allocator_hands_out_every_cluster_once() {
        // 1 boot + 2x1 FAT + 14 root + 200 data sectors = 200 clusters.
        let mut fs = fresh(217);
        assert_eq!(fs.stats().total_clusters, 200);

        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..200 {
            let c = fs.alloc_cluster().unwrap();
            assert!((2..202).contains(&c.index()));
            assert!(seen.insert(c.index()));
        }
        assert_eq!(fs.alloc_cluster(), None);
    }

    #[test]
    fn freed_clusters_read_back_as_zero() {
        let mut fs = fresh(2880);
        let c = fs.alloc_cluster().unwrap();
        assert_eq!(fs.fat_entry(c), FatEntry::EndOfChain);
        fs.free_chain(c).unwrap();
        assert_eq!(fs.fat_entry(c), FatEntry::Free);
        assert_eq!(fat_entry::read(&fs.fat, c), 0);
    }

    #[test]
    fn multi_cluster_files_round_trip() {
        let mut fs = fresh(2880);
        let data: Vec<u8> = (0..1500u32).map(|i| (i * 7) as u8).collect();

        fs.create("/BIG.BIN").unwrap();
        let mut h = fs.open("/BIG.BIN").unwrap();
        assert_eq!(fs.write_file(&mut h, &data).unwrap(), 1500);
        fs.flush_file(&mut h).unwrap();

        // 1500 bytes on 512-byte clusters = a chain of 3.
        let start = h.entry().start_cluster().unwrap();
        let second = match fs.fat_entry(start) {
            FatEntry::Chained(c) => c,
            e => panic!("expected chain, got {:?}", e),
        };
        let third = match fs.fat_entry(second) {
            FatEntry::Chained(c) => c,
            e => panic!("expected chain, got {:?}", e),
        };
        assert_eq!(fs.fat_entry(third), FatEntry::EndOfChain);

        let mut h = fs.open("/BIG.BIN").unwrap();
        let mut back = vec![0u8; 2000];
        assert_eq!(fs.read_file(&mut h, &mut back).unwrap(), 1500);
        assert_eq!(&back[0..1500], &data[..]);
    }

    #[test]
    fn partial_sector_writes_preserve_surroundings() {
        let mut fs = fresh(2880);
        fs.create("/RMW.TXT").unwrap();
        let mut h = fs.open("/RMW.TXT").unwrap();
        fs.write_file(&mut h, b"HELLO WORLD").unwrap();
        fs.seek_file(&mut h, 6).unwrap();
        fs.write_file(&mut h, b"RETRO").unwrap();
        fs.flush_file(&mut h).unwrap();

        let mut h = fs.open("/RMW.TXT").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(fs.read_file(&mut h, &mut buf).unwrap(), 11);
        assert_eq!(&buf[0..11], b"HELLO RETRO");
    }

    #[test]
    fn seek_clamps_to_the_file_size() {
        let mut fs = fresh(2880);
        fs.create("/S.TXT").unwrap();
        let mut h = fs.open("/S.TXT").unwrap();
        fs.write_file(&mut h, b"0123456789").unwrap();
        assert_eq!(fs.seek_file(&mut h, 100).unwrap(), 10);
        assert_eq!(fs.seek_file(&mut h, 4).unwrap(), 4);
        let mut buf = [0u8; 16];
        assert_eq!(fs.read_file(&mut h, &mut buf).unwrap(), 6);
        assert_eq!(&buf[0..6], b"456789");
    }

    #[test]
    fn appending_at_a_cluster_boundary_extends_the_chain() {
        let mut fs = fresh(2880);
        fs.create("/APP.BIN").unwrap();
        let mut h = fs.open("/APP.BIN").unwrap();
        fs.write_file(&mut h, &[0xaa; 512]).unwrap();
        fs.flush_file(&mut h).unwrap();

        let mut h = fs.open("/APP.BIN").unwrap();
        fs.seek_file(&mut h, 512).unwrap();
        fs.write_file(&mut h, &[0xbb; 10]).unwrap();
        fs.flush_file(&mut h).unwrap();

        let mut h = fs.open("/APP.BIN").unwrap();
        assert_eq!(h.size(), 522);
        let mut buf = vec![0u8; 1024];
        assert_eq!(fs.read_file(&mut h, &mut buf).unwrap(), 522);
        assert_eq!(buf[511], 0xaa);
        assert_eq!(buf[512], 0xbb);
    }

    #[test]
    fn a_full_volume_yields_a_partial_write() {
        let mut fs = fresh(217); // 200 clusters = 102400 data bytes
        fs.create("/FILL.BIN").unwrap();
        let mut h = fs.open("/FILL.BIN").unwrap();
        let data = vec![0x5a; 110_000];
        let written = fs.write_file(&mut h, &data).unwrap();
        assert_eq!(written, 200 * 512);
        assert_eq!(fs.stats().free_clusters, 0);
    }

    #[test]
    fn rename_changes_exactly_the_name() {
        let mut fs = fresh(2880);
        fs.create("/OLD.TXT").unwrap();
        let mut h = fs.open("/OLD.TXT").unwrap();
        fs.write_file(&mut h, b"payload").unwrap();
        fs.flush_file(&mut h).unwrap();

        fs.rename("/OLD.TXT", "/NEW.TXT").unwrap();
        assert_eq!(fs.open("/OLD.TXT").unwrap_err(), Error::NotFound);
        let mut h = fs.open("/NEW.TXT").unwrap();
        assert_eq!(h.size(), 7);
        let mut buf = [0u8; 8];
        fs.read_file(&mut h, &mut buf).unwrap();
        assert_eq!(&buf[0..7], b"payload");

        fs.create("/THIRD.TXT").unwrap();
        assert_eq!(
            fs.rename("/THIRD.TXT", "/NEW.TXT").unwrap_err(),
            Error::Exists
        );
    }

    #[test]
    fn unlink_returns_the_clusters() {
        let mut fs = fresh(2880);
        let free_before = fs.stats().free_clusters;

        fs.create("/GONE.BIN").unwrap();
        let mut h = fs.open("/GONE.BIN").unwrap();
        fs.write_file(&mut h, &[1; 1500]).unwrap();
        fs.flush_file(&mut h).unwrap();
        assert_eq!(fs.stats().free_clusters, free_before - 3);

        fs.unlink("/GONE.BIN").unwrap();
        assert_eq!(fs.stats().free_clusters, free_before);
        assert_eq!(fs.open("/GONE.BIN").unwrap_err(), Error::NotFound);
    }

    #[test]
    fn unlink_refuses_directories() {
        let mut fs = fresh(2880);
        fs.mkdir("/D").unwrap();
        assert_eq!(fs.unlink("/D").unwrap_err(), Error::IsADirectory);
        assert_eq!(fs.rmdir("/D"), Ok(()));
    }

    #[test]
    fn mkdir_writes_dot_entries() {
        let mut fs = fresh(2880);
        fs.mkdir("/SUB").unwrap();

        let cluster = match fs.resolve_dir("/SUB").unwrap() {
            DirRef::Sub(c) => c,
            DirRef::Root => panic!("expected subdirectory"),
        };
        let lba = fs.boot_sector().cluster_to_lba(cluster);
        let mut sector = [0u8; SECTOR_SIZE];
        fs.volume_mut().read(lba, &mut sector).unwrap();

        let dot = DirEntry::from_raw(&sector.array::<32>(0));
        let dotdot = DirEntry::from_raw(&sector.array::<32>(32));
        assert_eq!(&dot.name, b".          ");
        assert_eq!(dot.cluster, cluster.0);
        assert!(dot.is_directory());
        assert_eq!(&dotdot.name, b"..         ");
        assert_eq!(dotdot.cluster, 0);
        assert!(dotdot.is_directory());
    }

    /// Plant a live file entry inside `dir` (slot 2, after the dot entries),
    /// bypassing the root-only write path.
    fn plant_file(fs: &mut FileSystem<RamDisk>, dir: Cluster, name: &str, data: &[u8]) {
        let cluster = fs.alloc_cluster().unwrap();
        let lba = fs.boot_sector().cluster_to_lba(cluster);
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..data.len()].copy_from_slice(data);
        fs.volume_mut().write(lba, &sector).unwrap();

        let mut entry = DirEntry::new_file(encode_83(name).unwrap());
        entry.cluster = cluster.0;
        entry.file_size = data.len() as u32;

        let dir_lba = fs.boot_sector().cluster_to_lba(dir);
        let mut dsec = [0u8; SECTOR_SIZE];
        fs.volume_mut().read(dir_lba, &mut dsec).unwrap();
        dsec[64..96].copy_from_slice(&entry.to_raw());
        fs.volume_mut().write(dir_lba, &dsec).unwrap();
    }

    #[test]
    fn files_in_subdirectories_resolve_and_read() {
        let mut fs = fresh(2880);
        fs.mkdir("/SUB").unwrap();
        let dir = match fs.resolve_dir("/SUB").unwrap() {
            DirRef::Sub(c) => c,
            DirRef::Root => unreachable!(),
        };
        plant_file(&mut fs, dir, "DATA.BIN", b"DATA");

        let mut h = fs.open("/SUB/DATA.BIN").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.read_file(&mut h, &mut buf).unwrap(), 4);
        assert_eq!(&buf[0..4], b"DATA");

        // A file used as a path component is refused.
        assert_eq!(
            fs.open("/SUB/DATA.BIN/X.Y").unwrap_err(),
            Error::NotADirectory
        );
    }

    #[test]
    fn rmdir_refuses_a_non_empty_directory() {
        let mut fs = fresh(2880);
        fs.mkdir("/SUB").unwrap();
        let dir = match fs.resolve_dir("/SUB").unwrap() {
            DirRef::Sub(c) => c,
            DirRef::Root => unreachable!(),
        };
        plant_file(&mut fs, dir, "KEEP.ME", b"x");
        assert_eq!(fs.rmdir("/SUB").unwrap_err(), Error::NotEmpty);
    }

    #[test]
    fn truncate_frees_the_tail() {
        let mut fs = fresh(2880);
        let free_before = fs.stats().free_clusters;
        fs.create("/T.BIN").unwrap();
        let mut h = fs.open("/T.BIN").unwrap();
        fs.write_file(&mut h, &[7; 1500]).unwrap();
        fs.truncate_file(&mut h, 500).unwrap();
        fs.flush_file(&mut h).unwrap();

        assert_eq!(h.size(), 500);
        assert_eq!(fs.stats().free_clusters, free_before - 1);

        let mut h = fs.open("/T.BIN").unwrap();
        let mut buf = vec![0u8; 600];
        assert_eq!(fs.read_file(&mut h, &mut buf).unwrap(), 500);

        fs.truncate_file(&mut h, 0).unwrap();
        fs.flush_file(&mut h).unwrap();
        assert_eq!(fs.stats().free_clusters, free_before);
    }

    #[test]
    fn label_prefers_the_root_entry() {
        let mut fs = fresh(2880);
        assert_eq!(&fs.label().unwrap(), b"RETROFUTURE");
    }

    #[test]
    fn statfs_tracks_usage() {
        let mut fs = fresh(2880);
        let stats = fs.stats();
        assert_eq!(stats.total_clusters, stats.free_clusters);
        assert_eq!(stats.cluster_size, 512);

        fs.create("/A.BIN").unwrap();
        let mut h = fs.open("/A.BIN").unwrap();
        fs.write_file(&mut h, &[0; 100]).unwrap();
        fs.flush_file(&mut h).unwrap();
        assert_eq!(fs.stats().free_clusters, stats.total_clusters - 1);
    }

    #[test]
    fn directory_listing_skips_label_and_deleted() {
        let mut fs = fresh(2880);
        fs.create("/A.TXT").unwrap();
        fs.create("/B.TXT").unwrap();
        fs.create("/C.TXT").unwrap();
        fs.unlink("/B.TXT").unwrap();

        let mut names = Vec::new();
        let mut cur = fs.dir_cursor(DirRef::Root);
        while let Some((_, e)) = fs.cursor_next(&mut cur).unwrap() {
            names.push(decode_83(&e.name).as_str().to_string());
        }
        assert_eq!(names, ["A.TXT", "C.TXT"]);

        // Deleted slots are reused by the next create.
        fs.create("/D.TXT").unwrap();
        let mut names = Vec::new();
        let mut cur = fs.dir_cursor(DirRef::Root);
        while let Some((_, e)) = fs.cursor_next(&mut cur).unwrap() {
            names.push(decode_83(&e.name).as_str().to_string());
        }
        assert_eq!(names, ["A.TXT", "D.TXT", "C.TXT"]);
    }

    #[test]
    fn unmount_flushes_the_fat() {
        let mut fs = fresh(2880);
        fs.create("/X.BIN").unwrap();
        let mut h = fs.open("/X.BIN").unwrap();
        fs.write_file(&mut h, &[1; 700]).unwrap();
        fs.flush_file(&mut h).unwrap();
        let disk = fs.unmount().unwrap();

        let mut fs = FileSystem::mount(disk).unwrap();
        let mut h = fs.open("/X.BIN").unwrap();
        assert_eq!(h.size(), 700);
        let mut buf = vec![0u8; 1024];
        assert_eq!(fs.read_file(&mut h, &mut buf).unwrap(), 700);
    }
}
