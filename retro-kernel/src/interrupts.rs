//! IDT construction, 8259 PIC management and IRQ dispatch.
//!
//! All 256 vectors route through assembly stubs that normalise the stack into
//! an [`InterruptFrame`] (a synthetic zero error code is pushed for vectors
//! the CPU does not supply one for) and call [`isr_dispatch`]. Exceptions are
//! terminal; IRQs are demuxed through a 16-slot handler table and always
//! acknowledged so a missing handler cannot wedge the PIC.

use crate::x86;
use bit_field::BitField;
use spin::Mutex;

pub const EXCEPTION_VECTORS: usize = 32;
pub const IRQ_VECTOR_OFFSET: u8 = 32;
pub const IRQ_LINES: usize = 16;

pub const IRQ_PIT: u8 = 0;
pub const IRQ_KBD: u8 = 1;
pub const IRQ_CASCADE: u8 = 2;
pub const IRQ_FDC: u8 = 6;
pub const IRQ_ATA_PRIMARY: u8 = 14;
pub const IRQ_ATA_SECONDARY: u8 = 15;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xa0;
const PIC2_DATA: u16 = 0xa1;

const PIC_EOI: u8 = 0x20;
const OCW3_READ_ISR: u8 = 0x0b;

/// Saved machine state as laid out by the entry stubs, lowest address first.
#[repr(C)]
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vec: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

/// An 8-byte 32-bit interrupt gate.
#[repr(C)]
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct GateDescriptor {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

const KERNEL_CS: u16 = 0x08;

impl GateDescriptor {
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    /// Present, DPL 0, 32-bit interrupt gate (type_attr 0x8E) targeting the
    /// kernel code segment.
    pub fn interrupt_gate(offset: u32) -> Self {
        let mut type_attr = 0u8;
        type_attr.set_bits(0..4, 0b1110); // 32-bit interrupt gate
        type_attr.set_bits(5..7, 0); // DPL 0
        type_attr.set_bit(7, true); // present
        Self {
            offset_low: offset.get_bits(0..16) as u16,
            selector: KERNEL_CS,
            zero: 0,
            type_attr,
            offset_high: offset.get_bits(16..32) as u16,
        }
    }

    pub fn offset(&self) -> u32 {
        (self.offset_low as u32) | ((self.offset_high as u32) << 16)
    }

    pub fn is_present(&self) -> bool {
        self.type_attr.get_bit(7)
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<GateDescriptor>(), 8);
static_assertions::const_assert_eq!(core::mem::size_of::<IdtPointer>(), 6);

pub type IrqHandler = fn();

static IRQ_HANDLERS: Mutex<[Option<IrqHandler>; IRQ_LINES]> = Mutex::new([None; IRQ_LINES]);

/// Install `handler` on IRQ line `n`, replacing any previous one. There is at
/// most one handler per line.
pub fn irq_register(n: u8, handler: IrqHandler) {
    x86::without_interrupts(|| {
        IRQ_HANDLERS.lock()[n as usize % IRQ_LINES] = Some(handler);
    });
}

pub fn irq_unregister(n: u8) {
    x86::without_interrupts(|| {
        IRQ_HANDLERS.lock()[n as usize % IRQ_LINES] = None;
    });
}

pub fn interrupts_enable() {
    x86::sti();
}

pub fn interrupts_disable() {
    x86::cli();
}

/// Unmask IRQ `n`. Unmasking a slave line also unmasks the cascade.
pub fn pic_enable_irq(n: u8) {
    let (port, bit) = if n < 8 {
        (PIC1_DATA, n)
    } else {
        pic_enable_irq(IRQ_CASCADE);
        (PIC2_DATA, n - 8)
    };
    let mask = x86::inb(port);
    x86::outb(port, mask & !(1 << bit));
}

pub fn pic_disable_irq(n: u8) {
    let (port, bit) = if n < 8 {
        (PIC1_DATA, n)
    } else {
        (PIC2_DATA, n - 8)
    };
    let mask = x86::inb(port);
    x86::outb(port, mask | (1 << bit));
}

/// Acknowledge IRQ `n`: slave first when it was involved, then always the
/// master.
pub fn pic_eoi(n: u8) {
    if n >= 8 {
        x86::outb(PIC2_CMD, PIC_EOI);
    }
    x86::outb(PIC1_CMD, PIC_EOI);
}

/// What to do with a level-7/15 interrupt given the in-service register of
/// the PIC that raised it.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SpuriousAction {
    Genuine,
    /// Spurious IRQ7: no EOI at all.
    IgnoreSilently,
    /// Spurious IRQ15: the master saw the cascade, so it still needs an EOI.
    IgnoreEoiMaster,
}

pub fn classify_spurious(n: u8, isr: u8) -> SpuriousAction {
    let in_service = match n {
        7 => isr.get_bit(7),
        15 => isr.get_bit(7),
        _ => return SpuriousAction::Genuine,
    };
    if in_service {
        SpuriousAction::Genuine
    } else if n == 7 {
        SpuriousAction::IgnoreSilently
    } else {
        SpuriousAction::IgnoreEoiMaster
    }
}

fn read_isr(slave: bool) -> u8 {
    let cmd = if slave { PIC2_CMD } else { PIC1_CMD };
    x86::outb(cmd, OCW3_READ_ISR);
    x86::inb(cmd)
}

/// Remap the PIC pair to vectors 32..48 and mask every line.
unsafe fn pic_remap() {
    x86::outb(PIC1_CMD, 0x11); // ICW1: edge-triggered, cascade, ICW4 needed
    x86::io_wait();
    x86::outb(PIC2_CMD, 0x11);
    x86::io_wait();
    x86::outb(PIC1_DATA, IRQ_VECTOR_OFFSET); // ICW2: vector offsets
    x86::io_wait();
    x86::outb(PIC2_DATA, IRQ_VECTOR_OFFSET + 8);
    x86::io_wait();
    x86::outb(PIC1_DATA, 0x04); // ICW3: slave on line 2
    x86::io_wait();
    x86::outb(PIC2_DATA, 0x02);
    x86::io_wait();
    x86::outb(PIC1_DATA, 0x01); // ICW4: 8086 mode
    x86::io_wait();
    x86::outb(PIC2_DATA, 0x01);
    x86::io_wait();
    x86::outb(PIC1_DATA, 0xff);
    x86::outb(PIC2_DATA, 0xff);
}

pub fn exception_name(vec: u32) -> &'static str {
    match vec {
        0 => "divide error",
        1 => "debug",
        2 => "NMI",
        3 => "breakpoint",
        4 => "overflow",
        5 => "bound range",
        6 => "invalid opcode",
        7 => "device not available",
        8 => "double fault",
        9 => "coprocessor overrun",
        10 => "invalid TSS",
        11 => "segment not present",
        12 => "stack fault",
        13 => "general protection",
        14 => "page fault",
        16 => "x87 FP",
        17 => "alignment check",
        18 => "machine check",
        19 => "SIMD FP",
        _ => "reserved",
    }
}

/// Terminal: dump the frame and halt with interrupts off.
fn exception_handler(frame: &InterruptFrame) -> ! {
    log::error!(
        "EXCEPTION {}: {} (err={:#x})",
        frame.vec,
        exception_name(frame.vec),
        frame.err
    );
    log::error!(
        "  eip={:#010x} cs={:#06x} eflags={:#010x}",
        frame.eip,
        frame.cs,
        frame.eflags
    );
    log::error!(
        "  eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
        frame.eax,
        frame.ebx,
        frame.ecx,
        frame.edx
    );
    log::error!(
        "  esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
        frame.esi,
        frame.edi,
        frame.ebp,
        frame.esp
    );

    x86::cli();
    loop {
        x86::hlt();
    }
}

fn irq_handler(frame: &InterruptFrame) {
    let n = (frame.vec - IRQ_VECTOR_OFFSET as u32) as u8;

    if n == 7 || n == 15 {
        match classify_spurious(n, read_isr(n == 15)) {
            SpuriousAction::Genuine => {}
            SpuriousAction::IgnoreSilently => return,
            SpuriousAction::IgnoreEoiMaster => {
                x86::outb(PIC1_CMD, PIC_EOI);
                return;
            }
        }
    }

    let handler = IRQ_HANDLERS.lock()[n as usize];
    if let Some(handler) = handler {
        handler();
    } else {
        log::trace!("unhandled IRQ {}", n);
    }
    // EOI unconditionally so an unclaimed line cannot wedge the PIC.
    pic_eoi(n);
}

/// Common entry from the assembly stubs.
#[no_mangle]
extern "C" fn isr_dispatch(frame: &InterruptFrame) {
    if frame.vec < EXCEPTION_VECTORS as u32 {
        exception_handler(frame);
    }
    irq_handler(frame);
}

#[cfg(target_arch = "x86")]
mod stubs {
    // 48 entry stubs. Vectors 8, 10..=14 and 17 already carry a CPU-pushed
    // error code; every other stub pushes a synthetic zero so the frame
    // layout is uniform. The stub table is consumed by `init`.
    core::arch::global_asm!(
        r#"
        .macro stub_noerr n
        vector_stub_\n:
            push 0
            push \n
            jmp isr_common
        .endm
        .macro stub_err n
        vector_stub_\n:
            push \n
            jmp isr_common
        .endm

        .section .text
        stub_noerr 0
        stub_noerr 1
        stub_noerr 2
        stub_noerr 3
        stub_noerr 4
        stub_noerr 5
        stub_noerr 6
        stub_noerr 7
        stub_err 8
        stub_noerr 9
        stub_err 10
        stub_err 11
        stub_err 12
        stub_err 13
        stub_err 14
        stub_noerr 15
        stub_noerr 16
        stub_err 17
        stub_noerr 18
        stub_noerr 19
        stub_noerr 20
        stub_noerr 21
        stub_noerr 22
        stub_noerr 23
        stub_noerr 24
        stub_noerr 25
        stub_noerr 26
        stub_noerr 27
        stub_noerr 28
        stub_noerr 29
        stub_noerr 30
        stub_noerr 31
        stub_noerr 32
        stub_noerr 33
        stub_noerr 34
        stub_noerr 35
        stub_noerr 36
        stub_noerr 37
        stub_noerr 38
        stub_noerr 39
        stub_noerr 40
        stub_noerr 41
        stub_noerr 42
        stub_noerr 43
        stub_noerr 44
        stub_noerr 45
        stub_noerr 46
        stub_noerr 47

        isr_common:
            pushad
            push ds
            push es
            push fs
            push gs
            mov ax, 0x10
            mov ds, ax
            mov es, ax
            mov fs, ax
            mov gs, ax
            push esp
            call isr_dispatch
            add esp, 4
            pop gs
            pop fs
            pop es
            pop ds
            popad
            add esp, 8
            iretd

        .section .rodata
        .global ISR_STUB_TABLE
        .p2align 2
        ISR_STUB_TABLE:
            .long vector_stub_0, vector_stub_1, vector_stub_2, vector_stub_3
            .long vector_stub_4, vector_stub_5, vector_stub_6, vector_stub_7
            .long vector_stub_8, vector_stub_9, vector_stub_10, vector_stub_11
            .long vector_stub_12, vector_stub_13, vector_stub_14, vector_stub_15
            .long vector_stub_16, vector_stub_17, vector_stub_18, vector_stub_19
            .long vector_stub_20, vector_stub_21, vector_stub_22, vector_stub_23
            .long vector_stub_24, vector_stub_25, vector_stub_26, vector_stub_27
            .long vector_stub_28, vector_stub_29, vector_stub_30, vector_stub_31
            .long vector_stub_32, vector_stub_33, vector_stub_34, vector_stub_35
            .long vector_stub_36, vector_stub_37, vector_stub_38, vector_stub_39
            .long vector_stub_40, vector_stub_41, vector_stub_42, vector_stub_43
            .long vector_stub_44, vector_stub_45, vector_stub_46, vector_stub_47
        "#
    );

    extern "C" {
        pub static ISR_STUB_TABLE: [u32; 48];
    }
}

#[cfg(target_arch = "x86")]
static mut IDT: [GateDescriptor; 256] = [GateDescriptor::missing(); 256];

/// Build the IDT, remap the PIC pair and load the IDTR. All IRQ lines stay
/// masked until drivers opt in via [`pic_enable_irq`].
///
/// # Safety
/// Must be called exactly once, with interrupts disabled, before any IRQ line
/// is unmasked.
#[cfg(target_arch = "x86")]
pub unsafe fn init() {
    use core::ptr::{addr_of, addr_of_mut};

    let idt = &mut *addr_of_mut!(IDT);
    for (v, stub) in stubs::ISR_STUB_TABLE.iter().enumerate() {
        idt[v] = GateDescriptor::interrupt_gate(*stub);
    }

    let pointer = IdtPointer {
        limit: (core::mem::size_of::<GateDescriptor>() * 256 - 1) as u16,
        base: addr_of!(IDT) as u32,
    };
    x86::lidt(&pointer as *const IdtPointer as *const u8);

    pic_remap();
}

#[cfg(not(target_arch = "x86"))]
pub unsafe fn init() {
    unimplemented!("the IDT can only be installed on an i386 target")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_descriptor_encoding() {
        let gate = GateDescriptor::interrupt_gate(0xdead_beef);
        assert_eq!(gate.offset_low, 0xbeef);
        assert_eq!(gate.offset_high, 0xdead);
        assert_eq!(gate.selector, 0x08);
        assert_eq!(gate.zero, 0);
        assert_eq!(gate.type_attr, 0x8e);
        assert_eq!(gate.offset(), 0xdead_beef);
        assert!(gate.is_present());
        assert!(!GateDescriptor::missing().is_present());
    }

    #[test]
    fn spurious_classification() {
        // Bit 7 of the ISR is the in-service bit for line 7/15 on its PIC.
        assert_eq!(classify_spurious(7, 0x80), SpuriousAction::Genuine);
        assert_eq!(classify_spurious(7, 0x00), SpuriousAction::IgnoreSilently);
        assert_eq!(classify_spurious(15, 0x00), SpuriousAction::IgnoreEoiMaster);
        assert_eq!(classify_spurious(15, 0x80), SpuriousAction::Genuine);
        assert_eq!(classify_spurious(1, 0x00), SpuriousAction::Genuine);
    }

    #[test]
    fn exception_names_cover_the_architectural_set() {
        assert_eq!(exception_name(0), "divide error");
        assert_eq!(exception_name(13), "general protection");
        assert_eq!(exception_name(14), "page fault");
        assert_eq!(exception_name(15), "reserved");
    }
}
