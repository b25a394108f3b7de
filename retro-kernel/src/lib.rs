//! RETROFUTURE kernel: a freestanding i386 kernel for Pentium-class hardware.
//!
//! The stage-2 loader drops us into protected mode and calls [`kernel_main`]
//! with a pointer to the boot-info record. Everything below runs on a single
//! CPU with no paging and no task switching; interrupts are the only source
//! of concurrency.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod print;

pub mod allocator;
pub mod asm;
pub mod console;
pub mod devices;
pub mod event;
pub mod fs;
pub mod interrupts;
pub mod list;
pub mod logger;
pub mod phys_memory;
pub mod shell;
pub mod x86;

#[cfg(target_arch = "x86")]
use phys_memory::RegionFlags;
#[cfg(target_arch = "x86")]
use retro_common::boot_info::BootInfo;

/// Linker-provided bounds of the kernel image and the bump heap window.
/// Only meaningful on a real boot; tests never touch these.
#[cfg(target_arch = "x86")]
extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
    static __heap_start: u8;
    static __heap_end: u8;
    static __stack_top: u8;
}

/// Kernel entry. The loader passes a [`BootInfo`] pointer in accordance with
/// the handoff contract in `retro-common`; a wrong magic halts the CPU before
/// any hardware is touched.
#[cfg(target_arch = "x86")]
#[no_mangle]
pub extern "C" fn kernel_main(boot_info: &BootInfo) -> ! {
    if !boot_info.magic_matches() {
        loop {
            x86::hlt();
        }
    }

    devices::serial::initialize();
    logger::initialize();
    log::info!("retrofuture {}", env!("CARGO_PKG_VERSION"));

    unsafe { interrupts::init() };

    let (kernel_range, heap_range, stack_top) = unsafe {
        (
            (
                &__kernel_start as *const u8 as usize,
                &__kernel_end as *const u8 as usize,
            ),
            (
                &__heap_start as *const u8 as usize,
                &__heap_end as *const u8 as usize,
            ),
            &__stack_top as *const u8 as usize,
        )
    };

    {
        let mut mm = phys_memory::manager().lock();
        mm.init();
        mm.add_region(
            kernel_range.0 as u64,
            (kernel_range.1 - kernel_range.0) as u64,
            RegionFlags::KERNEL,
            "kernel",
        );
        mm.add_region(
            (stack_top - 0x4000) as u64,
            0x4000,
            RegionFlags::KERNEL | RegionFlags::STACK,
            "stack",
        );
        mm.add_region(
            heap_range.0 as u64,
            (heap_range.1 - heap_range.0) as u64,
            RegionFlags::KERNEL | RegionFlags::HEAP,
            "heap",
        );
        mm.parse_map(&boot_info.memory_map);
        log::info!(
            "memory: {} KiB total, {} KiB free",
            mm.total_bytes() / 1024,
            mm.free_bytes() / 1024
        );
    }

    allocator::initialize(heap_range.0, heap_range.1);

    console::initialize();
    devices::ata::initialize();
    devices::floppy::register();

    interrupts::pic_enable_irq(interrupts::IRQ_KBD);
    x86::sti();

    shell::run(boot_info)
}

#[cfg(all(not(test), target_arch = "x86"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("{}", info);

    x86::cli();
    loop {
        x86::hlt();
    }
}
