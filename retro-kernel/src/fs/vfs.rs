//! The virtual filesystem: a mount table plus per-open-handle state,
//! unifying every mounted filesystem behind path-addressed operations.
//!
//! Paths are normalized against the caller's working directory, matched
//! against the mount table by longest prefix, and dispatched to the matched
//! filesystem with the remainder of the path. Handle slots come from fixed
//! pools searched with a rotating index, so a freshly closed slot is not
//! immediately handed out again — a diagnostic nicety, not a correctness
//! requirement.

use crate::fs::fat12::{self, FileSystem as Fat12};
use crate::fs::path;
use crate::fs::volume::BlockDevice;
use alloc::string::String;
use core::fmt;

pub const MOUNT_CAP: usize = 4;
pub const OPEN_FILE_CAP: usize = 16;
pub const OPEN_DIR_CAP: usize = 8;

#[derive(PartialEq, Eq, Debug)]
pub enum Error {
    Fat(fat12::Error),
    /// No mount covers the path (the root mount is missing).
    NoMount,
    MountTableFull,
    AlreadyMounted,
    NotMounted,
    /// The root mount never unmounts.
    Busy,
    HandleTableFull,
    BadHandle,
    ReadOnly,
    NotWritable,
    CrossMount,
}

impl From<fat12::Error> for Error {
    fn from(e: fat12::Error) -> Self {
        Self::Fat(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Fat(e) => write!(f, "{}", e),
            Error::NoMount => write!(f, "no filesystem mounted"),
            Error::MountTableFull => write!(f, "mount table full"),
            Error::AlreadyMounted => write!(f, "already mounted"),
            Error::NotMounted => write!(f, "not mounted"),
            Error::Busy => write!(f, "mount busy"),
            Error::HandleTableFull => write!(f, "too many open handles"),
            Error::BadHandle => write!(f, "bad handle"),
            Error::ReadOnly => write!(f, "read-only filesystem"),
            Error::NotWritable => write!(f, "handle not open for writing"),
            Error::CrossMount => write!(f, "paths are on different mounts"),
        }
    }
}

/// The filesystems the VFS can drive, enumerated at the registration
/// boundary.
pub enum FileSystemKind {
    Fat12(Fat12<BlockDevice>),
}

impl FileSystemKind {
    fn fat(&mut self) -> &mut Fat12<BlockDevice> {
        match self {
            FileSystemKind::Fat12(fs) => fs,
        }
    }
}

struct Mount {
    path: heapless::String<64>,
    fs: FileSystemKind,
    readonly: bool,
}

/// File handle: pool slot in the low byte, generation above it so a stale
/// handle is detected instead of hitting a recycled slot.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub struct Fd(u32);

impl Fd {
    fn new(slot: usize, generation: u32) -> Self {
        Self((generation << 8) | slot as u32)
    }

    fn slot(self) -> usize {
        (self.0 & 0xff) as usize
    }

    fn generation(self) -> u32 {
        self.0 >> 8
    }
}

/// Directory handle, same encoding as [`Fd`].
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub struct Dd(u32);

impl Dd {
    fn new(slot: usize, generation: u32) -> Self {
        Self((generation << 8) | slot as u32)
    }

    fn slot(self) -> usize {
        (self.0 & 0xff) as usize
    }

    fn generation(self) -> u32 {
        self.0 >> 8
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
        }
    }

    pub fn write() -> Self {
        Self {
            read: true,
            write: true,
            create: false,
        }
    }

    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Whence {
    Set,
    Cur,
    End,
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct FileInfo {
    pub name: heapless::String<12>,
    pub size: u32,
    pub directory: bool,
}

struct OpenFile {
    mount: usize,
    handle: fat12::FileHandle,
    generation: u32,
    writable: bool,
}

struct OpenDir {
    mount: usize,
    dir: fat12::DirRef,
    index: usize,
    generation: u32,
}

pub struct Vfs {
    mounts: [Option<Mount>; MOUNT_CAP],
    files: [Option<OpenFile>; OPEN_FILE_CAP],
    dirs: [Option<OpenDir>; OPEN_DIR_CAP],
    next_file: usize,
    next_dir: usize,
    generation: u32,
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            mounts: core::array::from_fn(|_| None),
            files: core::array::from_fn(|_| None),
            dirs: core::array::from_fn(|_| None),
            next_file: 0,
            next_dir: 0,
            generation: 1,
        }
    }

    fn bump_generation(&mut self) -> u32 {
        self.generation = self.generation.wrapping_add(1).max(1);
        self.generation
    }

    // ---- mount table ----

    /// Mount `device` at `mount_path` (an absolute path). The filesystem on
    /// the device is probed now; a bad volume refuses the mount.
    pub fn mount(
        &mut self,
        mount_path: &str,
        device: BlockDevice,
        readonly: bool,
    ) -> Result<(), Error> {
        let normalized = path::normalize(mount_path, "/");
        if self
            .mounts
            .iter()
            .flatten()
            .any(|m| m.path.as_str() == normalized)
        {
            Err(Error::AlreadyMounted)?;
        }
        let slot = self
            .mounts
            .iter()
            .position(|m| m.is_none())
            .ok_or(Error::MountTableFull)?;

        let fs = Fat12::mount(device)?;
        let mut mount_path: heapless::String<64> = heapless::String::new();
        let _ = mount_path.push_str(&normalized);
        self.mounts[slot] = Some(Mount {
            path: mount_path,
            fs: FileSystemKind::Fat12(fs),
            readonly,
        });
        log::info!("vfs: mounted {}", normalized);
        Ok(())
    }

    /// Unmount and return the underlying device. Every open handle on the
    /// mount is closed (dirty files flushed first). The root mount refuses.
    pub fn unmount(&mut self, mount_path: &str) -> Result<BlockDevice, Error> {
        let normalized = path::normalize(mount_path, "/");
        if normalized == "/" {
            Err(Error::Busy)?;
        }
        let slot = self
            .mounts
            .iter()
            .position(|m| m.as_ref().is_some_and(|m| m.path.as_str() == normalized))
            .ok_or(Error::NotMounted)?;

        for i in 0..OPEN_FILE_CAP {
            if self.files[i].as_ref().is_some_and(|f| f.mount == slot) {
                let mut open = self.files[i].take().unwrap();
                let mount = self.mounts[slot].as_mut().unwrap();
                let _ = mount.fs.fat().flush_file(&mut open.handle);
            }
        }
        for i in 0..OPEN_DIR_CAP {
            if self.dirs[i].as_ref().is_some_and(|d| d.mount == slot) {
                self.dirs[i] = None;
            }
        }

        let mount = self.mounts[slot].take().unwrap();
        let device = match mount.fs {
            FileSystemKind::Fat12(fs) => fs.unmount()?,
        };
        log::info!("vfs: unmounted {}", normalized);
        Ok(device)
    }

    /// Flush every mounted filesystem.
    pub fn sync_all(&mut self) -> Result<(), Error> {
        for mount in self.mounts.iter_mut().flatten() {
            mount.fs.fat().sync()?;
        }
        Ok(())
    }

    pub fn mount_points(&self) -> impl Iterator<Item = &str> {
        self.mounts.iter().flatten().map(|m| m.path.as_str())
    }

    /// Longest-prefix match; returns the mount slot and the path remainder
    /// (always starting with `/`).
    fn mount_for(&self, normalized: &str) -> Result<(usize, String), Error> {
        let mut best: Option<(usize, usize)> = None;
        for (i, mount) in self.mounts.iter().enumerate() {
            let Some(mount) = mount else { continue };
            let mp = mount.path.as_str();
            let matches = if mp == "/" {
                Some(0)
            } else if normalized == mp {
                Some(mp.len())
            } else if normalized.starts_with(mp)
                && normalized.as_bytes().get(mp.len()) == Some(&b'/')
            {
                Some(mp.len())
            } else {
                None
            };
            if let Some(len) = matches {
                if best.map_or(true, |(_, l)| len > l) {
                    best = Some((i, len));
                }
            }
        }
        let (slot, len) = best.ok_or(Error::NoMount)?;
        let rest = &normalized[len..];
        let rel = if rest.is_empty() {
            String::from("/")
        } else {
            String::from(rest)
        };
        Ok((slot, rel))
    }

    fn mount_mut(&mut self, slot: usize) -> &mut Mount {
        self.mounts[slot].as_mut().unwrap()
    }

    // ---- files ----

    pub fn open(&mut self, p: &str, cwd: &str, options: OpenOptions) -> Result<Fd, Error> {
        let normalized = path::normalize(p, cwd);
        let (slot, rel) = self.mount_for(&normalized)?;
        let mount = self.mount_mut(slot);
        if (options.write || options.create) && mount.readonly {
            Err(Error::ReadOnly)?;
        }

        let fs = mount.fs.fat();
        if options.create && matches!(fs.open(&rel), Err(fat12::Error::NotFound)) {
            fs.create(&rel)?;
        }
        let handle = fs.open(&rel)?;

        let file_slot = self.take_file_slot()?;
        let generation = self.bump_generation();
        self.files[file_slot] = Some(OpenFile {
            mount: slot,
            handle,
            generation,
            writable: options.write,
        });
        Ok(Fd::new(file_slot, generation))
    }

    fn take_file_slot(&mut self) -> Result<usize, Error> {
        for i in 0..OPEN_FILE_CAP {
            let slot = (self.next_file + i) % OPEN_FILE_CAP;
            if self.files[slot].is_none() {
                self.next_file = (slot + 1) % OPEN_FILE_CAP;
                return Ok(slot);
            }
        }
        Err(Error::HandleTableFull)
    }

    fn file(&mut self, fd: Fd) -> Result<&mut OpenFile, Error> {
        let slot = fd.slot();
        if slot >= OPEN_FILE_CAP {
            Err(Error::BadHandle)?;
        }
        match self.files[slot] {
            Some(ref mut f) if f.generation == fd.generation() => Ok(f),
            _ => Err(Error::BadHandle),
        }
    }

    pub fn close(&mut self, fd: Fd) -> Result<(), Error> {
        self.file(fd)?;
        let mut open = self.files[fd.slot()].take().unwrap();
        let mount = self.mounts[open.mount].as_mut().unwrap();
        mount.fs.fat().flush_file(&mut open.handle)?;
        Ok(())
    }

    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, Error> {
        let open = self.file(fd)?;
        let mount_slot = open.mount;
        // Split the borrows: take the handle out while the filesystem works.
        let mut handle = open.handle.clone();
        let n = self
            .mount_mut(mount_slot)
            .fs
            .fat()
            .read_file(&mut handle, buf)?;
        self.file(fd)?.handle = handle;
        Ok(n)
    }

    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize, Error> {
        let open = self.file(fd)?;
        if !open.writable {
            Err(Error::NotWritable)?;
        }
        let mount_slot = open.mount;
        if self.mounts[mount_slot].as_ref().unwrap().readonly {
            Err(Error::ReadOnly)?;
        }
        let mut handle = self.file(fd)?.handle.clone();
        let n = self
            .mount_mut(mount_slot)
            .fs
            .fat()
            .write_file(&mut handle, buf)?;
        self.file(fd)?.handle = handle;
        Ok(n)
    }

    /// SET/CUR/END seek, clamped at zero (and by the filesystem at the file
    /// size).
    pub fn seek(&mut self, fd: Fd, whence: Whence, offset: i32) -> Result<u32, Error> {
        let open = self.file(fd)?;
        let base = match whence {
            Whence::Set => 0i64,
            Whence::Cur => open.handle.pos() as i64,
            Whence::End => open.handle.size() as i64,
        };
        let target = (base + offset as i64).max(0) as u32;
        let mount_slot = open.mount;
        let mut handle = self.file(fd)?.handle.clone();
        let pos = self
            .mount_mut(mount_slot)
            .fs
            .fat()
            .seek_file(&mut handle, target)?;
        self.file(fd)?.handle = handle;
        Ok(pos)
    }

    pub fn truncate(&mut self, fd: Fd, len: u32) -> Result<(), Error> {
        let open = self.file(fd)?;
        if !open.writable {
            Err(Error::NotWritable)?;
        }
        let mount_slot = open.mount;
        let mut handle = self.file(fd)?.handle.clone();
        self.mount_mut(mount_slot)
            .fs
            .fat()
            .truncate_file(&mut handle, len)?;
        self.file(fd)?.handle = handle;
        Ok(())
    }

    pub fn file_size(&mut self, fd: Fd) -> Result<u32, Error> {
        Ok(self.file(fd)?.handle.size())
    }

    // ---- namespace ----

    pub fn stat(&mut self, p: &str, cwd: &str) -> Result<FileInfo, Error> {
        let normalized = path::normalize(p, cwd);
        let (slot, rel) = self.mount_for(&normalized)?;
        let fs = self.mount_mut(slot).fs.fat();
        match fs.resolve(&rel)? {
            None => {
                let mut name: heapless::String<12> = heapless::String::new();
                let _ = name.push('/');
                Ok(FileInfo {
                    name,
                    size: 0,
                    directory: true,
                })
            }
            Some((_, entry)) => Ok(FileInfo {
                name: fat12::decode_83(&entry.name),
                size: entry.file_size,
                directory: entry.is_directory(),
            }),
        }
    }

    /// Existence probe: `stat` without the copy-out.
    pub fn lookup(&mut self, p: &str, cwd: &str) -> bool {
        self.stat(p, cwd).is_ok()
    }

    fn writable_fs(&mut self, normalized: &str) -> Result<(&mut Mount, String), Error> {
        let (slot, rel) = self.mount_for(normalized)?;
        let mount = self.mount_mut(slot);
        if mount.readonly {
            Err(Error::ReadOnly)?;
        }
        Ok((self.mounts[slot].as_mut().unwrap(), rel))
    }

    pub fn create(&mut self, p: &str, cwd: &str) -> Result<(), Error> {
        let normalized = path::normalize(p, cwd);
        let (mount, rel) = self.writable_fs(&normalized)?;
        mount.fs.fat().create(&rel)?;
        Ok(())
    }

    pub fn unlink(&mut self, p: &str, cwd: &str) -> Result<(), Error> {
        let normalized = path::normalize(p, cwd);
        let (mount, rel) = self.writable_fs(&normalized)?;
        mount.fs.fat().unlink(&rel)?;
        Ok(())
    }

    pub fn rename(&mut self, old: &str, new: &str, cwd: &str) -> Result<(), Error> {
        let old_n = path::normalize(old, cwd);
        let new_n = path::normalize(new, cwd);
        let (old_slot, old_rel) = self.mount_for(&old_n)?;
        let (new_slot, new_rel) = self.mount_for(&new_n)?;
        if old_slot != new_slot {
            Err(Error::CrossMount)?;
        }
        let mount = self.mount_mut(old_slot);
        if mount.readonly {
            Err(Error::ReadOnly)?;
        }
        mount.fs.fat().rename(&old_rel, &new_rel)?;
        Ok(())
    }

    pub fn mkdir(&mut self, p: &str, cwd: &str) -> Result<(), Error> {
        let normalized = path::normalize(p, cwd);
        let (mount, rel) = self.writable_fs(&normalized)?;
        mount.fs.fat().mkdir(&rel)?;
        Ok(())
    }

    pub fn rmdir(&mut self, p: &str, cwd: &str) -> Result<(), Error> {
        let normalized = path::normalize(p, cwd);
        let (mount, rel) = self.writable_fs(&normalized)?;
        mount.fs.fat().rmdir(&rel)?;
        Ok(())
    }

    pub fn statfs(&mut self, p: &str, cwd: &str) -> Result<fat12::FsStats, Error> {
        let normalized = path::normalize(p, cwd);
        let (slot, _) = self.mount_for(&normalized)?;
        Ok(self.mount_mut(slot).fs.fat().stats())
    }

    pub fn label(&mut self, p: &str, cwd: &str) -> Result<[u8; 11], Error> {
        let normalized = path::normalize(p, cwd);
        let (slot, _) = self.mount_for(&normalized)?;
        Ok(self.mount_mut(slot).fs.fat().label()?)
    }

    // ---- directories ----

    pub fn opendir(&mut self, p: &str, cwd: &str) -> Result<Dd, Error> {
        let normalized = path::normalize(p, cwd);
        let (slot, rel) = self.mount_for(&normalized)?;
        let dir = self.mount_mut(slot).fs.fat().resolve_dir(&rel)?;

        let dir_slot = self.take_dir_slot()?;
        let generation = self.bump_generation();
        self.dirs[dir_slot] = Some(OpenDir {
            mount: slot,
            dir,
            index: 0,
            generation,
        });
        Ok(Dd::new(dir_slot, generation))
    }

    fn take_dir_slot(&mut self) -> Result<usize, Error> {
        for i in 0..OPEN_DIR_CAP {
            let slot = (self.next_dir + i) % OPEN_DIR_CAP;
            if self.dirs[slot].is_none() {
                self.next_dir = (slot + 1) % OPEN_DIR_CAP;
                return Ok(slot);
            }
        }
        Err(Error::HandleTableFull)
    }

    fn dir(&mut self, dd: Dd) -> Result<&mut OpenDir, Error> {
        let slot = dd.slot();
        if slot >= OPEN_DIR_CAP {
            Err(Error::BadHandle)?;
        }
        match self.dirs[slot] {
            Some(ref mut d) if d.generation == dd.generation() => Ok(d),
            _ => Err(Error::BadHandle),
        }
    }

    pub fn readdir(&mut self, dd: Dd) -> Result<Option<FileInfo>, Error> {
        let open = self.dir(dd)?;
        let (mount_slot, dir, index) = (open.mount, open.dir, open.index);
        let entry = self
            .mount_mut(mount_slot)
            .fs
            .fat()
            .dir_entry_at(dir, index)?;
        match entry {
            Some(entry) => {
                self.dir(dd)?.index += 1;
                Ok(Some(FileInfo {
                    name: fat12::decode_83(&entry.name),
                    size: entry.file_size,
                    directory: entry.is_directory(),
                }))
            }
            None => Ok(None),
        }
    }

    pub fn rewinddir(&mut self, dd: Dd) -> Result<(), Error> {
        self.dir(dd)?.index = 0;
        Ok(())
    }

    pub fn closedir(&mut self, dd: Dd) -> Result<(), Error> {
        self.dir(dd)?;
        self.dirs[dd.slot()] = None;
        Ok(())
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ramdisk::RamDisk;

    fn formatted(sectors: usize, label: &str) -> BlockDevice {
        let mut disk = RamDisk::new(sectors);
        Fat12::format(&mut disk, 7, fat12::encode_label(label)).unwrap();
        BlockDevice::Ram(disk)
    }

    fn vfs_with_root() -> Vfs {
        let mut vfs = Vfs::new();
        vfs.mount("/", formatted(2880, "ROOT"), false).unwrap();
        vfs
    }

    #[test]
    fn open_create_write_read_through_the_vfs() {
        let mut vfs = vfs_with_root();
        let fd = vfs.open("/HELLO.TXT", "/", OpenOptions::create()).unwrap();
        assert_eq!(vfs.write(fd, b"HELLO").unwrap(), 5);
        vfs.close(fd).unwrap();

        let fd = vfs.open("/HELLO.TXT", "/", OpenOptions::read_only()).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(vfs.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf[0..5], b"HELLO");
        assert_eq!(vfs.file_size(fd).unwrap(), 5);
        vfs.close(fd).unwrap();
    }

    #[test]
    fn longest_prefix_wins() {
        let mut vfs = vfs_with_root();
        vfs.mount("/fd0", formatted(2880, "FLOPPY"), false).unwrap();

        let fd = vfs.open("/fd0/ON.FD", "/", OpenOptions::create()).unwrap();
        vfs.write(fd, b"floppy side").unwrap();
        vfs.close(fd).unwrap();

        // Visible on the floppy mount, absent from the root mount.
        assert_eq!(&vfs.label("/fd0", "/").unwrap(), b"FLOPPY     ");
        assert_eq!(&vfs.label("/", "/").unwrap(), b"ROOT       ");
        assert!(vfs.stat("/fd0/ON.FD", "/").is_ok());
        assert_eq!(
            vfs.stat("/ON.FD", "/").unwrap_err(),
            Error::Fat(fat12::Error::NotFound)
        );
        // A sibling path must not match the /fd0 mount.
        assert_eq!(
            vfs.stat("/fd0x", "/").unwrap_err(),
            Error::Fat(fat12::Error::NotFound)
        );
    }

    #[test]
    fn relative_paths_resolve_against_the_cwd() {
        let mut vfs = vfs_with_root();
        vfs.mkdir("/DIR", "/").unwrap();
        let fd = vfs.open("/DIR.TXT", "/", OpenOptions::create()).unwrap();
        vfs.close(fd).unwrap();

        // cwd-relative and parent-relative forms.
        assert!(vfs.stat("DIR.TXT", "/").is_ok());
        assert!(vfs.stat("../DIR.TXT", "/DIR").is_ok());
        assert!(vfs.stat(".", "/DIR").unwrap().directory);
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut vfs = vfs_with_root();
        let fd = vfs.open("/A.TXT", "/", OpenOptions::create()).unwrap();
        vfs.close(fd).unwrap();
        assert_eq!(vfs.close(fd).unwrap_err(), Error::BadHandle);
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(fd, &mut buf).unwrap_err(), Error::BadHandle);
    }

    #[test]
    fn slots_rotate_instead_of_reusing_immediately() {
        let mut vfs = vfs_with_root();
        let fd1 = vfs.open("/A.TXT", "/", OpenOptions::create()).unwrap();
        vfs.close(fd1).unwrap();
        let fd2 = vfs.open("/B.TXT", "/", OpenOptions::create()).unwrap();
        assert_ne!(fd1.slot(), fd2.slot());
        vfs.close(fd2).unwrap();
    }

    #[test]
    fn the_file_pool_is_bounded() {
        let mut vfs = vfs_with_root();
        let fd = vfs.open("/F.TXT", "/", OpenOptions::create()).unwrap();
        vfs.close(fd).unwrap();

        let fds: Vec<Fd> = (0..OPEN_FILE_CAP)
            .map(|_| vfs.open("/F.TXT", "/", OpenOptions::read_only()).unwrap())
            .collect();
        assert_eq!(
            vfs.open("/F.TXT", "/", OpenOptions::read_only()).unwrap_err(),
            Error::HandleTableFull
        );
        for fd in fds {
            vfs.close(fd).unwrap();
        }
    }

    #[test]
    fn readonly_mounts_refuse_mutation() {
        let mut vfs = Vfs::new();
        vfs.mount("/", formatted(2880, "RO"), true).unwrap();
        assert_eq!(
            vfs.open("/X.TXT", "/", OpenOptions::create()).unwrap_err(),
            Error::ReadOnly
        );
        assert_eq!(vfs.mkdir("/D", "/").unwrap_err(), Error::ReadOnly);
        assert_eq!(vfs.unlink("/X.TXT", "/").unwrap_err(), Error::ReadOnly);
    }

    #[test]
    fn write_requires_a_writable_handle() {
        let mut vfs = vfs_with_root();
        let fd = vfs.open("/W.TXT", "/", OpenOptions::create()).unwrap();
        vfs.close(fd).unwrap();
        let fd = vfs.open("/W.TXT", "/", OpenOptions::read_only()).unwrap();
        assert_eq!(vfs.write(fd, b"x").unwrap_err(), Error::NotWritable);
        vfs.close(fd).unwrap();
    }

    #[test]
    fn seek_whence_math() {
        let mut vfs = vfs_with_root();
        let fd = vfs.open("/S.TXT", "/", OpenOptions::create()).unwrap();
        vfs.write(fd, b"0123456789").unwrap();
        assert_eq!(vfs.seek(fd, Whence::Set, 2).unwrap(), 2);
        assert_eq!(vfs.seek(fd, Whence::Cur, 3).unwrap(), 5);
        assert_eq!(vfs.seek(fd, Whence::End, -4).unwrap(), 6);
        // Negative results clamp to zero.
        assert_eq!(vfs.seek(fd, Whence::Set, -10).unwrap(), 0);
        vfs.close(fd).unwrap();
    }

    #[test]
    fn readdir_lists_and_rewinds() {
        let mut vfs = vfs_with_root();
        for name in ["/A.TXT", "/B.TXT"] {
            let fd = vfs.open(name, "/", OpenOptions::create()).unwrap();
            vfs.close(fd).unwrap();
        }
        vfs.mkdir("/SUB", "/").unwrap();

        let dd = vfs.opendir("/", "/").unwrap();
        let mut names = Vec::new();
        while let Some(info) = vfs.readdir(dd).unwrap() {
            names.push((info.name.as_str().to_string(), info.directory));
        }
        assert_eq!(
            names,
            [
                ("A.TXT".to_string(), false),
                ("B.TXT".to_string(), false),
                ("SUB".to_string(), true)
            ]
        );

        vfs.rewinddir(dd).unwrap();
        assert_eq!(vfs.readdir(dd).unwrap().unwrap().name.as_str(), "A.TXT");
        vfs.closedir(dd).unwrap();
        assert_eq!(vfs.readdir(dd).unwrap_err(), Error::BadHandle);
    }

    #[test]
    fn unmount_closes_handles_and_flushes() {
        let mut vfs = vfs_with_root();
        vfs.mount("/fd0", formatted(2880, "FLOPPY"), false).unwrap();

        let fd = vfs.open("/fd0/LATE.TXT", "/", OpenOptions::create()).unwrap();
        vfs.write(fd, b"not closed by the caller").unwrap();

        let device = vfs.unmount("/fd0").unwrap();
        assert_eq!(vfs.read(fd, &mut [0u8; 4]).unwrap_err(), Error::BadHandle);

        // The flush happened: remounting sees the data.
        vfs.mount("/fd0", device, false).unwrap();
        let fd = vfs.open("/fd0/LATE.TXT", "/", OpenOptions::read_only()).unwrap();
        assert_eq!(vfs.file_size(fd).unwrap(), 24);
        vfs.close(fd).unwrap();
    }

    #[test]
    fn the_root_mount_never_unmounts() {
        let mut vfs = vfs_with_root();
        assert_eq!(vfs.unmount("/").unwrap_err(), Error::Busy);
    }

    #[test]
    fn mount_table_limits() {
        let mut vfs = vfs_with_root();
        assert_eq!(
            vfs.mount("/", formatted(64, "DUP"), false).unwrap_err(),
            Error::AlreadyMounted
        );
        for i in 0..MOUNT_CAP - 1 {
            let mut p = String::from("/m");
            p.push(char::from(b'0' + i as u8));
            vfs.mount(&p, formatted(2880, "X"), false).unwrap();
        }
        assert_eq!(
            vfs.mount("/extra", formatted(2880, "X"), false).unwrap_err(),
            Error::MountTableFull
        );
    }

    #[test]
    fn statfs_reaches_the_right_mount() {
        let mut vfs = vfs_with_root();
        vfs.mount("/small", formatted(217, "SMALL"), false).unwrap();
        assert_eq!(vfs.statfs("/small/x", "/").unwrap().total_clusters, 200);
        assert!(vfs.statfs("/", "/").unwrap().total_clusters > 2000);
    }
}
