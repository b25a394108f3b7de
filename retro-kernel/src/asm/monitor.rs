//! Interactive machine-language monitor: a single-instruction REPL around
//! the assembler.
//!
//! Each plain line is assembled at the monitor's current PC and the bytes are
//! copied into target memory through a [`MemSink`], so the shell decides what
//! "memory" means (raw RAM on hardware, a buffer under test). Sigil commands
//! are never assembled.

use super::{lexer, Assembler};
use core::fmt::Write;

/// Destination for assembled bytes.
pub trait MemSink {
    fn write(&mut self, addr: u32, bytes: &[u8]) -> bool;
}

/// Copies straight into physical memory. Only meaningful on the machine
/// itself.
pub struct RawMemory;

impl MemSink for RawMemory {
    #[cfg(target_arch = "x86")]
    fn write(&mut self, addr: u32, bytes: &[u8]) -> bool {
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        true
    }

    #[cfg(not(target_arch = "x86"))]
    fn write(&mut self, _addr: u32, _bytes: &[u8]) -> bool {
        false
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Reply {
    /// `.` — leave the monitor.
    Exit,
    Nothing,
    Text(heapless::String<128>),
}

fn text(args: core::fmt::Arguments) -> Reply {
    let mut s: heapless::String<128> = heapless::String::new();
    let _ = s.write_fmt(args);
    Reply::Text(s)
}

pub struct Monitor {
    start: u32,
    pc: u32,
    bytes_written: u32,
}

impl Monitor {
    pub fn new(origin: u32) -> Self {
        Self {
            start: origin,
            pc: origin,
            bytes_written: 0,
        }
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn handle_line(&mut self, line: &str, sink: &mut dyn MemSink) -> Reply {
        let line = line.trim();
        match line.chars().next() {
            None => Reply::Nothing,
            Some('.') if line == "." => Reply::Exit,
            Some('=') => text(format_args!(
                "pc={:08X} start={:08X} bytes={}",
                self.pc, self.start, self.bytes_written
            )),
            Some('?') => text(format_args!(
                "<instr> assemble at pc | . exit | = status | @ <addr> set pc | # run from start"
            )),
            Some('@') => match lexer::parse_number(line[1..].trim()) {
                Some(addr) if addr >= 0 => {
                    self.pc = addr as u32;
                    if self.bytes_written == 0 {
                        self.start = self.pc;
                    }
                    text(format_args!("pc={:08X}", self.pc))
                }
                _ => text(format_args!("bad address")),
            },
            Some('#') => self.run(),
            Some(_) => self.assemble_line(line, sink),
        }
    }

    fn assemble_line(&mut self, line: &str, sink: &mut dyn MemSink) -> Reply {
        let mut asm = Assembler::with_capacity(self.pc, 64);
        if let Err(e) = asm.assemble(line) {
            return text(format_args!("{}", e));
        }
        let bytes = asm.output();
        if bytes.is_empty() {
            return Reply::Nothing;
        }
        if !sink.write(self.pc, bytes) {
            return text(format_args!("memory write failed at {:08X}", self.pc));
        }

        let mut s: heapless::String<128> = heapless::String::new();
        let _ = write!(s, "{:08X}:", self.pc);
        for b in bytes {
            let _ = write!(s, " {:02X}", b);
        }
        self.pc += bytes.len() as u32;
        self.bytes_written += bytes.len() as u32;
        Reply::Text(s)
    }

    #[cfg(target_arch = "x86")]
    fn run(&self) -> Reply {
        if self.bytes_written == 0 {
            return text(format_args!("nothing to run"));
        }
        let entry: extern "C" fn() = unsafe { core::mem::transmute(self.start as usize) };
        entry();
        text(format_args!("returned from {:08X}", self.start))
    }

    #[cfg(not(target_arch = "x86"))]
    fn run(&self) -> Reply {
        text(format_args!("run is only available on hardware"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A 64KiB window standing in for target RAM.
    struct TestRam {
        base: u32,
        data: Vec<u8>,
    }

    impl TestRam {
        fn new(base: u32) -> Self {
            Self {
                base,
                data: vec![0; 0x10000],
            }
        }
    }

    impl MemSink for TestRam {
        fn write(&mut self, addr: u32, bytes: &[u8]) -> bool {
            let offset = (addr - self.base) as usize;
            if offset + bytes.len() > self.data.len() {
                return false;
            }
            self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
            true
        }
    }

    #[test]
    fn instructions_land_in_memory_and_advance_the_pc() {
        let mut ram = TestRam::new(0x8000);
        let mut mon = Monitor::new(0x8000);

        let reply = mon.handle_line("mov eax, 0x12345678", &mut ram);
        match reply {
            Reply::Text(s) => assert_eq!(s.as_str(), "00008000: B8 78 56 34 12"),
            r => panic!("unexpected reply {:?}", r),
        }
        assert_eq!(mon.pc(), 0x8005);
        assert_eq!(&ram.data[0..5], &[0xb8, 0x78, 0x56, 0x34, 0x12]);

        mon.handle_line("inc eax", &mut ram);
        assert_eq!(mon.pc(), 0x8006);
        assert_eq!(ram.data[5], 0x40);
    }

    #[test]
    fn sigils_are_not_assembled() {
        let mut ram = TestRam::new(0);
        let mut mon = Monitor::new(0);

        assert_eq!(mon.handle_line(".", &mut ram), Reply::Exit);
        assert_eq!(mon.handle_line("", &mut ram), Reply::Nothing);
        match mon.handle_line("=", &mut ram) {
            Reply::Text(s) => assert_eq!(s.as_str(), "pc=00000000 start=00000000 bytes=0"),
            r => panic!("unexpected reply {:?}", r),
        }
        assert!(matches!(mon.handle_line("?", &mut ram), Reply::Text(_)));
    }

    #[test]
    fn relocation_moves_the_pc() {
        let mut ram = TestRam::new(0);
        let mut mon = Monitor::new(0);
        mon.handle_line("@ 0x1000", &mut ram);
        assert_eq!(mon.pc(), 0x1000);
        // Nothing written yet, so the run address follows.
        assert_eq!(mon.start(), 0x1000);

        mon.handle_line("nop", &mut ram);
        mon.handle_line("@ 0x2000", &mut ram);
        assert_eq!(mon.pc(), 0x2000);
        assert_eq!(mon.start(), 0x1000);
    }

    #[test]
    fn errors_leave_the_pc_unchanged() {
        let mut ram = TestRam::new(0);
        let mut mon = Monitor::new(0);
        let reply = mon.handle_line("frobnicate eax", &mut ram);
        match reply {
            Reply::Text(s) => assert!(s.as_str().contains("unknown mnemonic")),
            r => panic!("unexpected reply {:?}", r),
        }
        assert_eq!(mon.pc(), 0);
    }

    #[test]
    fn run_reports_unavailable_on_hosted_builds() {
        let mut ram = TestRam::new(0);
        let mut mon = Monitor::new(0);
        mon.handle_line("nop", &mut ram);
        match mon.handle_line("#", &mut ram) {
            Reply::Text(s) => assert!(s.as_str().contains("only available on hardware")),
            r => panic!("unexpected reply {:?}", r),
        }
    }
}
