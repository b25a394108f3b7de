//! PIO ATA driver for the two legacy IDE channels (four drives).
//!
//! Probing and transfers follow the classic polled protocol: select the
//! drive, give the electronics 400ns to settle (four alt-status reads), poll
//! BSY/DRQ with a bounded spin, move data 16 bits at a time. Transfers report
//! how many sectors actually completed, so callers see partial progress
//! instead of silent corruption.

use crate::fs::volume::VolumeError;
use crate::x86;
use bit_field::BitField;
use bitflags::bitflags;
use core::fmt;
use spin::Mutex;

pub const DRIVE_COUNT: usize = 4;
pub const SECTOR_SIZE: usize = 512;

/// Bounded spin for BSY/DRQ waits.
const SPIN_BUDGET: usize = 100_000;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xe7;
const CMD_IDENTIFY: u8 = 0xec;
const CMD_IDENTIFY_PACKET: u8 = 0xa1;

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    pub struct Status: u8 {
        const ERR = 1 << 0;
        const DRQ = 1 << 3;
        const SRV = 1 << 4;
        const DF = 1 << 5;
        const RDY = 1 << 6;
        const BSY = 1 << 7;
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum DriveKind {
    None,
    Ata,
    Atapi,
    Unknown,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
enum WaitError {
    Timeout,
    Fault,
}

/// Model/serial/capacity fields decoded from a raw identify block.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct IdentifyInfo {
    pub model: heapless::String<40>,
    pub serial: heapless::String<20>,
    pub sectors28: u32,
    pub sectors48: u64,
    pub lba48: bool,
}

/// ATA identify strings store two characters per word, high byte first.
fn identify_string<const N: usize>(words: &[u16]) -> heapless::String<N> {
    let mut s: heapless::String<N> = heapless::String::new();
    for word in words {
        for byte in [(word >> 8) as u8, *word as u8] {
            let c = if (0x20..0x7f).contains(&byte) {
                byte as char
            } else {
                ' '
            };
            let _ = s.push(c);
        }
    }
    while s.ends_with(' ') {
        s.pop();
    }
    s
}

pub fn parse_identify(words: &[u16; 256]) -> IdentifyInfo {
    let sectors28 = (words[60] as u32) | ((words[61] as u32) << 16);
    let sectors48 = (words[100] as u64)
        | ((words[101] as u64) << 16)
        | ((words[102] as u64) << 32)
        | ((words[103] as u64) << 48);
    IdentifyInfo {
        model: identify_string::<40>(&words[27..47]),
        serial: identify_string::<20>(&words[10..20]),
        sectors28,
        sectors48,
        lba48: words[83].get_bit(10),
    }
}

pub struct Drive {
    io_base: u16,
    ctrl_base: u16,
    slave: bool,
    present: bool,
    kind: DriveKind,
    info: Option<IdentifyInfo>,
    identify_raw: [u16; 256],
}

impl Drive {
    const fn new(io_base: u16, ctrl_base: u16, slave: bool) -> Self {
        Self {
            io_base,
            ctrl_base,
            slave,
            present: false,
            kind: DriveKind::None,
            info: None,
            identify_raw: [0; 256],
        }
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn kind(&self) -> DriveKind {
        self.kind
    }

    pub fn info(&self) -> Option<&IdentifyInfo> {
        self.info.as_ref()
    }

    /// 28-bit addressable capacity in sectors; 0 when absent.
    pub fn sector_count(&self) -> usize {
        self.info.as_ref().map_or(0, |i| i.sectors28 as usize)
    }

    fn status(&self) -> Status {
        Status::from_bits_truncate(x86::inb(self.io_base + 7))
    }

    /// Four alt-status reads ≈ 400ns settle time.
    fn delay400(&self) {
        for _ in 0..4 {
            x86::inb(self.ctrl_base);
        }
    }

    fn select(&self, lba_bits: u8, lba_mode: bool) {
        let mut value = 0xa0u8;
        if self.slave {
            value |= 0x10;
        }
        if lba_mode {
            value |= 0x40 | (lba_bits & 0x0f);
        }
        x86::outb(self.io_base + 6, value);
        self.delay400();
    }

    fn wait_not_busy(&self) -> Result<Status, WaitError> {
        for _ in 0..SPIN_BUDGET {
            let status = self.status();
            if !status.contains(Status::BSY) {
                return Ok(status);
            }
        }
        Err(WaitError::Timeout)
    }

    fn wait_drq(&self) -> Result<(), WaitError> {
        for _ in 0..SPIN_BUDGET {
            let status = self.status();
            if status.intersects(Status::ERR | Status::DF) {
                return Err(WaitError::Fault);
            }
            if !status.contains(Status::BSY) && status.contains(Status::DRQ) {
                return Ok(());
            }
        }
        Err(WaitError::Timeout)
    }

    /// Probe this position. Fills in kind/capacity/strings when something
    /// answers; otherwise the drive stays absent.
    pub fn identify(&mut self) {
        self.present = false;
        self.kind = DriveKind::None;
        self.info = None;

        self.select(0, false);
        x86::outb(self.io_base + 2, 0);
        x86::outb(self.io_base + 3, 0);
        x86::outb(self.io_base + 4, 0);
        x86::outb(self.io_base + 5, 0);
        x86::outb(self.io_base + 7, CMD_IDENTIFY);

        if self.status().is_empty() {
            return; // floating bus, nothing here
        }
        if self.wait_not_busy().is_err() {
            return;
        }

        let mid = x86::inb(self.io_base + 4);
        let high = x86::inb(self.io_base + 5);
        match (mid, high) {
            (0x00, 0x00) => self.kind = DriveKind::Ata,
            (0x14, 0xeb) => {
                self.kind = DriveKind::Atapi;
                x86::outb(self.io_base + 7, CMD_IDENTIFY_PACKET);
            }
            _ => {
                self.kind = DriveKind::Unknown;
                return;
            }
        }

        if self.wait_drq().is_err() {
            return;
        }
        for word in self.identify_raw.iter_mut() {
            *word = x86::inw(self.io_base);
        }

        self.info = Some(parse_identify(&self.identify_raw));
        self.present = true;
    }

    fn setup_transfer(&self, lba: u32, count: usize) -> usize {
        let count = count.clamp(1, 256);
        self.select((lba >> 24) as u8, true);
        x86::outb(self.io_base + 2, count as u8); // 256 wraps to 0 on purpose
        x86::outb(self.io_base + 3, lba as u8);
        x86::outb(self.io_base + 4, (lba >> 8) as u8);
        x86::outb(self.io_base + 5, (lba >> 16) as u8);
        count
    }

    /// Read `count` sectors at 28-bit `lba`. A count of 0 means 1. Returns
    /// the number of sectors that made it into `buf`.
    pub fn read28(&self, lba: u32, count: usize, buf: &mut [u8]) -> usize {
        if !self.present {
            return 0;
        }
        let count = self.setup_transfer(lba, count);
        debug_assert!(buf.len() >= count * SECTOR_SIZE);
        x86::outb(self.io_base + 7, CMD_READ_SECTORS);

        for sector in 0..count {
            if self.wait_drq().is_err() {
                return sector;
            }
            let base = sector * SECTOR_SIZE;
            for i in 0..SECTOR_SIZE / 2 {
                let word = x86::inw(self.io_base);
                buf[base + i * 2] = word as u8;
                buf[base + i * 2 + 1] = (word >> 8) as u8;
            }
            self.delay400();
        }
        count
    }

    /// Write mirrors read (command 0x30), then flushes the drive cache.
    pub fn write28(&self, lba: u32, count: usize, buf: &[u8]) -> usize {
        if !self.present {
            return 0;
        }
        let count = self.setup_transfer(lba, count);
        debug_assert!(buf.len() >= count * SECTOR_SIZE);
        x86::outb(self.io_base + 7, CMD_WRITE_SECTORS);

        for sector in 0..count {
            if self.wait_drq().is_err() {
                return sector;
            }
            let base = sector * SECTOR_SIZE;
            for i in 0..SECTOR_SIZE / 2 {
                let word =
                    (buf[base + i * 2] as u16) | ((buf[base + i * 2 + 1] as u16) << 8);
                x86::outw(self.io_base, word);
            }
            self.delay400();
        }

        x86::outb(self.io_base + 7, CMD_CACHE_FLUSH);
        let _ = self.wait_not_busy();
        count
    }

    pub fn flush(&self) -> Result<(), VolumeError> {
        if !self.present {
            Err(VolumeError::NotPresent)?;
        }
        x86::outb(self.io_base + 7, CMD_CACHE_FLUSH);
        self.wait_not_busy()
            .map(|_| ())
            .map_err(|_| VolumeError::Timeout)
    }
}

impl fmt::Display for Drive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.info, self.kind) {
            (Some(info), DriveKind::Ata) => write!(
                f,
                "{} ({} MiB{})",
                info.model.as_str(),
                info.sectors28 as u64 * SECTOR_SIZE as u64 / (1024 * 1024),
                if info.lba48 { ", LBA48" } else { "" }
            ),
            (Some(info), _) => write!(f, "{} (ATAPI)", info.model.as_str()),
            (None, _) => write!(f, "not present"),
        }
    }
}

static DRIVES: Mutex<[Drive; DRIVE_COUNT]> = Mutex::new([
    Drive::new(0x1f0, 0x3f6, false),
    Drive::new(0x1f0, 0x3f6, true),
    Drive::new(0x170, 0x376, false),
    Drive::new(0x170, 0x376, true),
]);

pub fn drives() -> &'static Mutex<[Drive; DRIVE_COUNT]> {
    &DRIVES
}

/// Probe all four positions once. Safe to call before interrupts are enabled;
/// everything is polled.
pub fn initialize() {
    let mut drives = DRIVES.lock();
    for (i, drive) in drives.iter_mut().enumerate() {
        drive.identify();
        if drive.is_present() {
            log::info!("ata{}: {}", i, drive);
        }
    }
}

pub fn sector_count(index: usize) -> usize {
    DRIVES.lock()[index].sector_count()
}

/// Single-sector adapter for the volume layer.
pub fn read(index: usize, sector: usize, buf: &mut [u8]) -> Result<(), VolumeError> {
    let drives = DRIVES.lock();
    let drive = &drives[index];
    if !drive.is_present() {
        Err(VolumeError::NotPresent)?;
    }
    if sector >= drive.sector_count() {
        Err(VolumeError::OutOfRange)?;
    }
    match drive.read28(sector as u32, 1, buf) {
        1 => Ok(()),
        _ => Err(VolumeError::Io),
    }
}

pub fn write(index: usize, sector: usize, buf: &[u8]) -> Result<(), VolumeError> {
    let drives = DRIVES.lock();
    let drive = &drives[index];
    if !drive.is_present() {
        Err(VolumeError::NotPresent)?;
    }
    if sector >= drive.sector_count() {
        Err(VolumeError::OutOfRange)?;
    }
    match drive.write28(sector as u32, 1, buf) {
        1 => Ok(()),
        _ => Err(VolumeError::Io),
    }
}

pub fn sync(index: usize) -> Result<(), VolumeError> {
    DRIVES.lock()[index].flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canned_identify() -> [u16; 256] {
        let mut words = [0u16; 256];
        // "RETRO DISK 1" padded to 40 chars, two bytes per word, swapped.
        let model = b"RETRO DISK 1                            ";
        for (i, pair) in model.chunks(2).enumerate() {
            words[27 + i] = ((pair[0] as u16) << 8) | pair[1] as u16;
        }
        let serial = b"SN0042              ";
        for (i, pair) in serial.chunks(2).enumerate() {
            words[10 + i] = ((pair[0] as u16) << 8) | pair[1] as u16;
        }
        words[60] = 0x5678; // 28-bit count low
        words[61] = 0x0012; // 28-bit count high
        words[83] = 1 << 10; // LBA48 supported
        words[100] = 0x1000;
        words[101] = 0x0002;
        words
    }

    #[test]
    fn identify_strings_are_swapped_and_trimmed() {
        let info = parse_identify(&canned_identify());
        assert_eq!(info.model.as_str(), "RETRO DISK 1");
        assert_eq!(info.serial.as_str(), "SN0042");
    }

    #[test]
    fn identify_capacities() {
        let info = parse_identify(&canned_identify());
        assert_eq!(info.sectors28, 0x0012_5678);
        assert_eq!(info.sectors48, 0x0002_1000);
        assert!(info.lba48);
    }

    #[test]
    fn size28_never_exceeds_size48_on_lba48_drives() {
        let mut words = canned_identify();
        words[100] = 0x5678;
        words[101] = 0x0012;
        let info = parse_identify(&words);
        assert!(info.sectors28 as u64 <= info.sectors48);
    }

    #[test]
    fn non_printable_identify_bytes_become_spaces() {
        let mut words = [0u16; 256];
        words[27] = 0x0041; // NUL then 'A'
        let info = parse_identify(&words);
        assert_eq!(info.model.as_str(), " A");
    }
}
