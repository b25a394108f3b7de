//! The interactive shell: one line in, one exit code out.
//!
//! Command parsing stays deliberately simple (whitespace-split words); the
//! interesting machinery lives in the subsystems this module dispatches
//! into. Exit codes follow the convention 0 = success, 1 = usage error or
//! command failure, 127 = command not found.

use crate::asm::monitor::{MemSink, RawMemory};
use crate::asm::{lexer, Assembler};
use crate::console::Console;
use crate::devices::ramdisk::RamDisk;
use crate::event;
use crate::fs::fat12::{self, FileSystem as Fat12};
use crate::fs::vfs::{OpenOptions, Vfs, Whence};
use crate::fs::volume::{BlockDevice, Volume};
use crate::phys_memory;
use crate::x86;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use retro_common::boot_info::BootInfo;

const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_NOT_FOUND: u8 = 127;

pub struct Shell {
    vfs: Vfs,
    cwd: String,
    labels: Vec<(String, u32)>,
}

fn report<E: fmt::Display>(result: Result<(), E>) -> u8 {
    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            kprintln!("error: {}", e);
            EXIT_FAILURE
        }
    }
}

fn usage(text: &str) -> u8 {
    kprintln!("usage: {}", text);
    EXIT_FAILURE
}

fn parse_u32(s: &str) -> Option<u32> {
    lexer::parse_number(s).filter(|n| (0..=u32::MAX as i64).contains(n)).map(|n| n as u32)
}

/// `fd0`, `ata0`..`ata3`, or `rd<sectors>` for a fresh RAM disk.
fn parse_device(name: &str) -> Option<BlockDevice> {
    match name {
        "fd0" => Some(BlockDevice::Floppy),
        "ata0" => Some(BlockDevice::Ata(0)),
        "ata1" => Some(BlockDevice::Ata(1)),
        "ata2" => Some(BlockDevice::Ata(2)),
        "ata3" => Some(BlockDevice::Ata(3)),
        _ => {
            let sectors = name.strip_prefix("rd")?.parse().ok()?;
            Some(BlockDevice::Ram(RamDisk::new(sectors)))
        }
    }
}

fn volume_id_seed() -> u32 {
    #[cfg(target_arch = "x86")]
    {
        crate::devices::pit::entropy32()
    }
    #[cfg(not(target_arch = "x86"))]
    {
        0x1980_0101
    }
}

impl Shell {
    pub fn new(vfs: Vfs) -> Self {
        Self {
            vfs,
            cwd: String::from("/"),
            labels: Vec::new(),
        }
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn vfs_mut(&mut self) -> &mut Vfs {
        &mut self.vfs
    }

    /// Execute one command line.
    pub fn dispatch(&mut self, line: &str) -> u8 {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return EXIT_OK;
        };
        let args: Vec<&str> = words.collect();

        match command {
            "help" => {
                kprintln!("files:   ls cat cd pwd mkdir touch write del rmdir mv hexdump");
                kprintln!("volumes: mount umount eject format fsinfo sync");
                kprintln!("asm:     asm asm2mem asmlabels asmhelp monitor");
                kprintln!("system:  meminfo events peek poke run reboot");
                EXIT_OK
            }
            "pwd" => {
                kprintln!("{}", self.cwd);
                EXIT_OK
            }
            "cd" => self.cmd_cd(&args),
            "ls" => self.cmd_ls(&args),
            "cat" => self.cmd_cat(&args),
            "touch" => match &args[..] {
                [path] => report(self.vfs.create(path, &self.cwd)),
                _ => usage("touch <path>"),
            },
            "write" => self.cmd_write(line, &args),
            "del" => match &args[..] {
                [path] => report(self.vfs.unlink(path, &self.cwd)),
                _ => usage("del <path>"),
            },
            "mkdir" => match &args[..] {
                [path] => report(self.vfs.mkdir(path, &self.cwd)),
                _ => usage("mkdir <path>"),
            },
            "rmdir" => match &args[..] {
                [path] => report(self.vfs.rmdir(path, &self.cwd)),
                _ => usage("rmdir <path>"),
            },
            "mv" => match &args[..] {
                [old, new] => report(self.vfs.rename(old, new, &self.cwd)),
                _ => usage("mv <old> <new>"),
            },
            "mount" => self.cmd_mount(&args),
            "umount" => match &args[..] {
                [path] => report(self.vfs.unmount(path).map(|_| ())),
                _ => usage("umount <path>"),
            },
            "eject" => self.cmd_eject(&args),
            "format" => self.cmd_format(&args),
            "fsinfo" => self.cmd_fsinfo(&args),
            "sync" => report(self.vfs.sync_all()),
            "hexdump" => self.cmd_hexdump(&args),
            "asm" => self.cmd_asm(&args),
            "asm2mem" => self.cmd_asm2mem(&args),
            "asmlabels" => {
                for (name, addr) in &self.labels {
                    kprintln!("{:08X} {}", addr, name);
                }
                EXIT_OK
            }
            "asmhelp" => {
                kprintln!("two-pass i386 assembler");
                kprintln!("  numbers: 255 0xFF 0b1111 0377 0FFh  chars: 'A' '\\n'");
                kprintln!("  $ = here, $$ = origin, .name = local label");
                kprintln!("  pseudo: ORG DB DW DD TIMES EQU");
                EXIT_OK
            }
            "monitor" => self.cmd_monitor(&args),
            "meminfo" => {
                let mm = phys_memory::manager().lock();
                kprintln!(
                    "total {} KiB, free {} KiB, kernel {} KiB, {} regions",
                    mm.total_bytes() / 1024,
                    mm.free_bytes() / 1024,
                    mm.kernel_bytes() / 1024,
                    mm.region_count()
                );
                for region in mm.regions() {
                    kprintln!(
                        "  {:#010x}..{:#010x} {:?} {}",
                        region.base(),
                        region.end(),
                        region.flags(),
                        region.owner()
                    );
                }
                EXIT_OK
            }
            "events" => {
                kprintln!("{} events fired from IRQ context", event::events_fired());
                EXIT_OK
            }
            "peek" => self.cmd_peek(&args),
            "poke" => self.cmd_poke(&args),
            "run" => self.cmd_run(&args),
            "reboot" => {
                let _ = self.vfs.sync_all();
                x86::reboot()
            }
            _ => {
                kprintln!("{}: command not found", command);
                EXIT_NOT_FOUND
            }
        }
    }

    fn cmd_cd(&mut self, args: &[&str]) -> u8 {
        let target = match args {
            [] => "/",
            [path] => *path,
            _ => return usage("cd [path]"),
        };
        match self.vfs.stat(target, &self.cwd) {
            Ok(info) if info.directory => {
                self.cwd = crate::fs::path::normalize(target, &self.cwd);
                EXIT_OK
            }
            Ok(_) => {
                kprintln!("cd: not a directory");
                EXIT_FAILURE
            }
            Err(e) => {
                kprintln!("cd: {}", e);
                EXIT_FAILURE
            }
        }
    }

    fn cmd_ls(&mut self, args: &[&str]) -> u8 {
        let path = match args {
            [] => ".",
            [path] => *path,
            _ => return usage("ls [path]"),
        };
        let dd = match self.vfs.opendir(path, &self.cwd) {
            Ok(dd) => dd,
            Err(e) => {
                kprintln!("ls: {}", e);
                return EXIT_FAILURE;
            }
        };
        loop {
            match self.vfs.readdir(dd) {
                Ok(Some(info)) => {
                    if info.directory {
                        kprintln!("{:>8}  {}/", "<dir>", info.name);
                    } else {
                        kprintln!("{:>8}  {}", info.size, info.name);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    kprintln!("ls: {}", e);
                    let _ = self.vfs.closedir(dd);
                    return EXIT_FAILURE;
                }
            }
        }
        let _ = self.vfs.closedir(dd);
        EXIT_OK
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, crate::fs::vfs::Error> {
        let fd = self.vfs.open(path, &self.cwd, OpenOptions::read_only())?;
        let mut data = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = match self.vfs.read(fd, &mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let _ = self.vfs.close(fd);
                    return Err(e);
                }
            };
            data.extend_from_slice(&chunk[..n]);
        }
        self.vfs.close(fd)?;
        Ok(data)
    }

    fn cmd_cat(&mut self, args: &[&str]) -> u8 {
        let [path] = args else { return usage("cat <path>") };
        match self.read_file(path) {
            Ok(data) => {
                for chunk in data.split_inclusive(|b| *b == b'\n') {
                    kprint!("{}", core::str::from_utf8(chunk).unwrap_or("<binary>"));
                }
                kprintln!();
                EXIT_OK
            }
            Err(e) => {
                kprintln!("cat: {}", e);
                EXIT_FAILURE
            }
        }
    }

    /// `write <path> <text…>` replaces the file's contents.
    fn cmd_write(&mut self, line: &str, args: &[&str]) -> u8 {
        if args.len() < 2 {
            return usage("write <path> <text>");
        }
        let path = args[0];
        // `args` are subslices of `line`, so the path token's position is its
        // byte offset; the text is everything after that token.
        let after_path = path.as_ptr() as usize - line.as_ptr() as usize + path.len();
        let text = line[after_path..].trim_start();

        let write_all = |vfs: &mut Vfs, cwd: &str| -> Result<(), crate::fs::vfs::Error> {
            let fd = vfs.open(path, cwd, OpenOptions::create())?;
            let result = (|| {
                vfs.truncate(fd, 0)?;
                vfs.seek(fd, Whence::Set, 0)?;
                let mut data = text.as_bytes();
                while !data.is_empty() {
                    let n = vfs.write(fd, data)?;
                    if n == 0 {
                        break;
                    }
                    data = &data[n..];
                }
                Ok(())
            })();
            vfs.close(fd)?;
            result
        };
        let cwd = self.cwd.clone();
        report(write_all(&mut self.vfs, &cwd))
    }

    fn cmd_mount(&mut self, args: &[&str]) -> u8 {
        let (device_name, path, readonly) = match args {
            [device, path] => (device, path, false),
            [device, path, ro] if *ro == "ro" => (device, path, true),
            _ => return usage("mount <device> <path> [ro]"),
        };
        let Some(device) = parse_device(device_name) else {
            kprintln!("mount: unknown device {}", device_name);
            return EXIT_FAILURE;
        };
        report(self.vfs.mount(path, device, readonly))
    }

    fn cmd_eject(&mut self, args: &[&str]) -> u8 {
        let [path] = args else { return usage("eject <path>") };
        match self.vfs.unmount(path) {
            Ok(mut device) => report(device.eject()),
            Err(e) => {
                kprintln!("eject: {}", e);
                EXIT_FAILURE
            }
        }
    }

    fn cmd_format(&mut self, args: &[&str]) -> u8 {
        let (device_name, label) = match args {
            [device] => (device, "NO NAME"),
            [device, label] => (device, *label),
            _ => return usage("format <device> [label]"),
        };
        let Some(mut device) = parse_device(device_name) else {
            kprintln!("format: unknown device {}", device_name);
            return EXIT_FAILURE;
        };
        report(Fat12::format(
            &mut device,
            volume_id_seed(),
            fat12::encode_label(label),
        ))
    }

    fn cmd_fsinfo(&mut self, args: &[&str]) -> u8 {
        let path = match args {
            [] => ".",
            [path] => *path,
            _ => return usage("fsinfo [path]"),
        };
        let stats = match self.vfs.statfs(path, &self.cwd) {
            Ok(stats) => stats,
            Err(e) => {
                kprintln!("fsinfo: {}", e);
                return EXIT_FAILURE;
            }
        };
        let label = self.vfs.label(path, &self.cwd).unwrap_or(*b"???????????");
        kprintln!(
            "label {:?}, {} of {} clusters free, {} bytes per cluster",
            core::str::from_utf8(&label).unwrap_or("?").trim_end(),
            stats.free_clusters,
            stats.total_clusters,
            stats.cluster_size
        );
        EXIT_OK
    }

    fn cmd_hexdump(&mut self, args: &[&str]) -> u8 {
        let [path] = args else { return usage("hexdump <path>") };
        match self.read_file(path) {
            Ok(data) => {
                dump_bytes(0, &data);
                EXIT_OK
            }
            Err(e) => {
                kprintln!("hexdump: {}", e);
                EXIT_FAILURE
            }
        }
    }

    /// `asm <path>` assembles a source file and shows the encoding.
    fn cmd_asm(&mut self, args: &[&str]) -> u8 {
        let (path, org) = match args {
            [path] => (path, 0),
            [path, org] => match parse_u32(org) {
                Some(org) => (path, org),
                None => return usage("asm <path> [org]"),
            },
            _ => return usage("asm <path> [org]"),
        };
        let source = match self.read_file(path) {
            Ok(data) => data,
            Err(e) => {
                kprintln!("asm: {}", e);
                return EXIT_FAILURE;
            }
        };
        let Ok(source) = core::str::from_utf8(&source) else {
            kprintln!("asm: source is not text");
            return EXIT_FAILURE;
        };

        let mut asm = Assembler::with_capacity(org, 16 * 1024);
        match asm.assemble(source) {
            Ok(()) => {
                kprintln!(
                    "{} bytes, {} instructions",
                    asm.output().len(),
                    asm.instruction_count()
                );
                dump_bytes(asm.org(), asm.output());
                self.labels = asm
                    .labels()
                    .map(|(name, addr)| (String::from(name), addr))
                    .collect();
                EXIT_OK
            }
            Err(e) => {
                kprintln!("asm: {}", e);
                EXIT_FAILURE
            }
        }
    }

    /// `asm2mem <path> <addr>` assembles straight into RAM.
    fn cmd_asm2mem(&mut self, args: &[&str]) -> u8 {
        let [path, addr] = args else {
            return usage("asm2mem <path> <addr>");
        };
        let Some(addr) = parse_u32(addr) else {
            return usage("asm2mem <path> <addr>");
        };
        let source = match self.read_file(path) {
            Ok(data) => data,
            Err(e) => {
                kprintln!("asm2mem: {}", e);
                return EXIT_FAILURE;
            }
        };
        let Ok(source) = core::str::from_utf8(&source) else {
            kprintln!("asm2mem: source is not text");
            return EXIT_FAILURE;
        };

        let mut asm = Assembler::with_capacity(addr, 16 * 1024);
        match asm.assemble(source) {
            Ok(()) => {
                if RawMemory.write(addr, asm.output()) {
                    kprintln!("{} bytes at {:08X}", asm.output().len(), addr);
                    EXIT_OK
                } else {
                    kprintln!("asm2mem: memory writes need hardware");
                    EXIT_FAILURE
                }
            }
            Err(e) => {
                kprintln!("asm2mem: {}", e);
                EXIT_FAILURE
            }
        }
    }

    fn cmd_monitor(&mut self, args: &[&str]) -> u8 {
        let origin = match args {
            [] => 0x0010_0000, // scratch space above the kernel image
            [org] => match parse_u32(org) {
                Some(org) => org,
                None => return usage("monitor [org]"),
            },
            _ => return usage("monitor [org]"),
        };
        #[cfg(target_arch = "x86")]
        {
            monitor_repl(origin);
            EXIT_OK
        }
        #[cfg(not(target_arch = "x86"))]
        {
            let _ = origin;
            kprintln!("monitor: needs hardware input");
            EXIT_FAILURE
        }
    }

    fn cmd_peek(&mut self, args: &[&str]) -> u8 {
        let (addr, count) = match args {
            [addr] => (parse_u32(addr), Some(16)),
            [addr, count] => (parse_u32(addr), parse_u32(count)),
            _ => return usage("peek <addr> [count]"),
        };
        let (Some(addr), Some(count)) = (addr, count) else {
            return usage("peek <addr> [count]");
        };
        #[cfg(target_arch = "x86")]
        {
            let bytes =
                unsafe { core::slice::from_raw_parts(addr as *const u8, count as usize) };
            dump_bytes(addr, bytes);
            EXIT_OK
        }
        #[cfg(not(target_arch = "x86"))]
        {
            let _ = (addr, count);
            kprintln!("peek: needs hardware");
            EXIT_FAILURE
        }
    }

    fn cmd_poke(&mut self, args: &[&str]) -> u8 {
        if args.len() < 2 {
            return usage("poke <addr> <byte…>");
        }
        let Some(addr) = parse_u32(args[0]) else {
            return usage("poke <addr> <byte…>");
        };
        let mut bytes = Vec::new();
        for arg in &args[1..] {
            match lexer::parse_number(arg) {
                Some(b @ 0..=255) => bytes.push(b as u8),
                _ => return usage("poke <addr> <byte…>"),
            }
        }
        if RawMemory.write(addr, &bytes) {
            EXIT_OK
        } else {
            kprintln!("poke: needs hardware");
            EXIT_FAILURE
        }
    }

    fn cmd_run(&mut self, args: &[&str]) -> u8 {
        let [addr] = args else { return usage("run <addr>") };
        let Some(addr) = parse_u32(addr) else {
            return usage("run <addr>");
        };
        #[cfg(target_arch = "x86")]
        {
            let entry: extern "C" fn() = unsafe { core::mem::transmute(addr as usize) };
            entry();
            EXIT_OK
        }
        #[cfg(not(target_arch = "x86"))]
        {
            let _ = addr;
            kprintln!("run: needs hardware");
            EXIT_FAILURE
        }
    }
}

fn dump_bytes(base: u32, data: &[u8]) {
    for (row, chunk) in data.chunks(16).enumerate() {
        kprint!("{:08X}: ", base as usize + row * 16);
        for b in chunk {
            kprint!("{:02X} ", b);
        }
        kprintln!();
    }
}

#[cfg(target_arch = "x86")]
fn monitor_repl(origin: u32) {
    use crate::asm::monitor::{Monitor, Reply};

    let mut console = Console::new();
    let mut monitor = Monitor::new(origin);
    let mut line: heapless::String<128> = heapless::String::new();
    kprintln!("monitor at {:08X}; ? for help, . to exit", origin);

    loop {
        kprint!("* ");
        console.read_line(&mut line);
        match monitor.handle_line(&line, &mut RawMemory) {
            Reply::Exit => return,
            Reply::Nothing => {}
            Reply::Text(text) => kprintln!("{}", text),
        }
    }
}

/// Mount a root volume and loop on the keyboard forever.
pub fn run(_boot_info: &BootInfo) -> ! {
    let mut vfs = Vfs::new();

    // Prefer the first ATA drive; fall back to a formatted RAM disk so the
    // shell always has a working root.
    let root = BlockDevice::Ata(0);
    if vfs.mount("/", root, false).is_err() {
        let mut ram = RamDisk::new(2880);
        let _ = Fat12::format(&mut ram, volume_id_seed(), fat12::encode_label("RETROFUTURE"));
        let _ = vfs.mount("/", BlockDevice::Ram(ram), false);
    }

    let mut shell = Shell::new(vfs);
    let mut console = Console::new();
    let mut line: heapless::String<128> = heapless::String::new();

    kprintln!("retrofuture shell; try `help`");
    loop {
        kprint!("{} $ ", shell.cwd());
        console.read_line(&mut line);
        let status = shell.dispatch(&line);
        if status != 0 {
            kprintln!("[exit {}]", status);
        }
    }
}
