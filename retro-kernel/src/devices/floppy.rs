//! Polled-PIO floppy driver for a 1.44M drive 0.
//!
//! The controller is registered with the block layer at boot but no hardware
//! is touched until the first transfer: registration happens before
//! interrupts are enabled, and the 82077 runs here in non-DMA polled mode so
//! probing would be the only IRQ-sensitive step. The first read/write runs
//! reset + recalibrate and latches the outcome either way.

use crate::fs::volume::VolumeError;
use crate::x86;
use spin::Mutex;

pub const SECTOR_SIZE: usize = 512;
pub const CYLINDERS: usize = 80;
pub const HEADS: usize = 2;
pub const SECTORS_PER_TRACK: usize = 18;
pub const SECTOR_COUNT: usize = CYLINDERS * HEADS * SECTORS_PER_TRACK;

const DOR: u16 = 0x3f2;
const MSR: u16 = 0x3f4;
const FIFO: u16 = 0x3f5;
const CCR: u16 = 0x3f7;

const MSR_RQM: u8 = 0x80;
const MSR_DIO: u8 = 0x40;
const MSR_NDMA: u8 = 0x20;

const CMD_SPECIFY: u8 = 0x03;
const CMD_RECALIBRATE: u8 = 0x07;
const CMD_SENSE_INTERRUPT: u8 = 0x08;
const CMD_SEEK: u8 = 0x0f;
const CMD_READ_DATA: u8 = 0xe6; // MT | MFM | SK | READ
const CMD_WRITE_DATA: u8 = 0xc5; // MT | MFM | WRITE

const SPIN_BUDGET: usize = 100_000;

/// Split a flat sector index into the 1.44M CHS triple (sector is 1-based).
pub fn lba_to_chs(lba: usize) -> (u8, u8, u8) {
    let cylinder = lba / (HEADS * SECTORS_PER_TRACK);
    let head = (lba / SECTORS_PER_TRACK) % HEADS;
    let sector = lba % SECTORS_PER_TRACK + 1;
    (cylinder as u8, head as u8, sector as u8)
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
enum Probe {
    Unprobed,
    Present,
    Absent,
}

struct Controller {
    probe: Probe,
    motor_on: bool,
}

static CONTROLLER: Mutex<Controller> = Mutex::new(Controller {
    probe: Probe::Unprobed,
    motor_on: false,
});

/// Announce the device without touching the FDC.
pub fn register() {
    log::info!("fd0: 1.44M ({} sectors), deferred probe", SECTOR_COUNT);
}

impl Controller {
    fn wait_rqm(&self, want_dio: bool) -> Result<(), VolumeError> {
        for _ in 0..SPIN_BUDGET {
            let msr = x86::inb(MSR);
            if msr & MSR_RQM != 0 {
                if ((msr & MSR_DIO) != 0) == want_dio {
                    return Ok(());
                }
                Err(VolumeError::Io)?;
            }
        }
        Err(VolumeError::Timeout)
    }

    fn send(&self, byte: u8) -> Result<(), VolumeError> {
        self.wait_rqm(false)?;
        x86::outb(FIFO, byte);
        Ok(())
    }

    fn receive(&self) -> Result<u8, VolumeError> {
        self.wait_rqm(true)?;
        Ok(x86::inb(FIFO))
    }

    fn sense_interrupt(&self) -> Result<(u8, u8), VolumeError> {
        self.send(CMD_SENSE_INTERRUPT)?;
        Ok((self.receive()?, self.receive()?))
    }

    fn motor(&mut self, on: bool) {
        // DOR: motor A | DMA gate off (polled) | not-reset | drive 0
        let value = if on { 0x14 } else { 0x04 };
        x86::outb(DOR, value);
        if on && !self.motor_on {
            // Spin-up time; the controller ignores commands issued earlier.
            for _ in 0..50_000 {
                x86::io_wait();
            }
        }
        self.motor_on = on;
    }

    fn recalibrate(&self) -> Result<(), VolumeError> {
        self.send(CMD_RECALIBRATE)?;
        self.send(0)?; // drive 0
        let (st0, _cyl) = self.sense_interrupt()?;
        if st0 & 0xc0 != 0 {
            Err(VolumeError::Io)?;
        }
        Ok(())
    }

    fn seek(&self, cylinder: u8, head: u8) -> Result<(), VolumeError> {
        self.send(CMD_SEEK)?;
        self.send(head << 2)?;
        self.send(cylinder)?;
        let (st0, arrived) = self.sense_interrupt()?;
        if st0 & 0xc0 != 0 || arrived != cylinder {
            Err(VolumeError::Io)?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), VolumeError> {
        x86::outb(DOR, 0x00);
        x86::io_wait();
        x86::outb(DOR, 0x0c);
        for _ in 0..4 {
            self.sense_interrupt()?;
        }
        x86::outb(CCR, 0x00); // 500 kbps
        self.send(CMD_SPECIFY)?;
        self.send(0xdf)?; // SRT 3ms, HUT 240ms
        self.send(0x03)?; // HLT 16ms, non-DMA
        Ok(())
    }

    fn ensure_ready(&mut self) -> Result<(), VolumeError> {
        match self.probe {
            Probe::Present => Ok(()),
            Probe::Absent => Err(VolumeError::NotPresent),
            Probe::Unprobed => {
                self.motor(true);
                let outcome = self.reset().and_then(|_| self.recalibrate());
                self.probe = match outcome {
                    Ok(()) => Probe::Present,
                    Err(_) => {
                        self.motor(false);
                        Probe::Absent
                    }
                };
                log::info!("fd0: probe {:?}", self.probe);
                outcome
            }
        }
    }

    fn transfer(&mut self, lba: usize, buf_in: Option<&[u8]>, buf_out: Option<&mut [u8]>) -> Result<(), VolumeError> {
        self.ensure_ready()?;
        self.motor(true);

        let (cylinder, head, sector) = lba_to_chs(lba);
        self.seek(cylinder, head)?;

        let command = if buf_in.is_some() {
            CMD_WRITE_DATA
        } else {
            CMD_READ_DATA
        };
        self.send(command)?;
        self.send((head << 2) | 0)?;
        self.send(cylinder)?;
        self.send(head)?;
        self.send(sector)?;
        self.send(2)?; // 512-byte sectors
        self.send(SECTORS_PER_TRACK as u8)?;
        self.send(0x1b)?; // GAP1
        self.send(0xff)?;

        // Execution phase: one byte per RQM in non-DMA mode.
        match (buf_in, buf_out) {
            (Some(data), None) => {
                for byte in data.iter().take(SECTOR_SIZE) {
                    self.wait_rqm(false)?;
                    if x86::inb(MSR) & MSR_NDMA == 0 {
                        break;
                    }
                    x86::outb(FIFO, *byte);
                }
            }
            (None, Some(data)) => {
                for byte in data.iter_mut().take(SECTOR_SIZE) {
                    self.wait_rqm(true)?;
                    *byte = x86::inb(FIFO);
                    if x86::inb(MSR) & MSR_NDMA == 0 {
                        break;
                    }
                }
            }
            _ => unreachable!(),
        }

        // Result phase: ST0 ST1 ST2 C H R N.
        let st0 = self.receive()?;
        for _ in 0..6 {
            self.receive()?;
        }
        if st0 & 0xc0 != 0 {
            Err(VolumeError::Io)?;
        }
        Ok(())
    }
}

pub fn read(sector: usize, buf: &mut [u8]) -> Result<(), VolumeError> {
    if sector >= SECTOR_COUNT || buf.len() < SECTOR_SIZE {
        Err(VolumeError::OutOfRange)?;
    }
    CONTROLLER.lock().transfer(sector, None, Some(buf))
}

pub fn write(sector: usize, buf: &[u8]) -> Result<(), VolumeError> {
    if sector >= SECTOR_COUNT || buf.len() < SECTOR_SIZE {
        Err(VolumeError::OutOfRange)?;
    }
    CONTROLLER.lock().transfer(sector, Some(buf), None)
}

/// `count` sectors starting at `lba`; returns how many completed.
pub fn read_sectors(lba: usize, count: usize, buf: &mut [u8]) -> usize {
    let count = count.max(1);
    for i in 0..count {
        let slice = &mut buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
        if read(lba + i, slice).is_err() {
            return i;
        }
    }
    count
}

pub fn write_sectors(lba: usize, count: usize, buf: &[u8]) -> usize {
    let count = count.max(1);
    for i in 0..count {
        let slice = &buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
        if write(lba + i, slice).is_err() {
            return i;
        }
    }
    count
}

pub fn motor_off() {
    CONTROLLER.lock().motor(false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chs_translation() {
        assert_eq!(lba_to_chs(0), (0, 0, 1));
        assert_eq!(lba_to_chs(17), (0, 0, 18));
        assert_eq!(lba_to_chs(18), (0, 1, 1));
        assert_eq!(lba_to_chs(35), (0, 1, 18));
        assert_eq!(lba_to_chs(36), (1, 0, 1));
        assert_eq!(lba_to_chs(SECTOR_COUNT - 1), (79, 1, 18));
    }
}
