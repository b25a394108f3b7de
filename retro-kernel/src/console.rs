//! Keyboard input plumbing.
//!
//! The IRQ1 handler pushes raw scancodes into a fixed queue and fires the
//! keyboard event chain; the foreground drains the queue and decodes it into
//! [`Input`] values. The queue is the only data shared with interrupt
//! context: the IRQ side produces, the foreground consumes, and a byte
//! arriving while the queue is full is dropped.

use crate::event;
use crate::interrupts;
use crate::x86;
use heapless::mpmc::MpMcQueue;
use spin::Mutex;

mod kbd;

const PS2_DATA_PORT: u16 = 0x60;

static SCANCODES: MpMcQueue<u8, 64> = MpMcQueue::new();

static KEYBOARD_EVENTS: Mutex<event::Chain> = Mutex::new(event::Chain::new());

#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub enum Input {
    Char(char),
    Ctrl(char),
    Home,
    End,
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
}

fn kbd_irq() {
    let scancode = x86::inb(PS2_DATA_PORT);
    // Failure of enqueuing is ignored: a full queue drops the byte.
    let _ = SCANCODES.enqueue(scancode);

    let mut e = event::Event::new(PS2_DATA_PORT as usize, scancode as usize, event::kind::KEYBOARD_SCANCODE);
    KEYBOARD_EVENTS.lock().fire_from_irq(&mut e);
}

/// Hook the IRQ1 line. The caller unmasks it when ready.
pub fn initialize() {
    interrupts::irq_register(interrupts::IRQ_KBD, kbd_irq);
}

/// Subscribe to raw scancode events. Handlers run in IRQ context and must be
/// short.
pub fn subscribe_scancodes(handler: event::Handler) -> Result<(), event::ChainError> {
    x86::without_interrupts(|| KEYBOARD_EVENTS.lock().subscribe(handler))
}

pub fn unsubscribe_scancodes(handler: event::Handler) -> Result<(), event::ChainError> {
    x86::without_interrupts(|| KEYBOARD_EVENTS.lock().unsubscribe(handler))
}

/// Foreground side: scancode decoding and line input.
pub struct Console {
    decoder: kbd::Decoder,
}

impl Console {
    pub fn new() -> Self {
        Self {
            decoder: kbd::Decoder::new(),
        }
    }

    pub fn try_getchar(&mut self) -> Option<Input> {
        while let Some(scancode) = SCANCODES.dequeue() {
            if let Some(input) = self.decoder.add(scancode) {
                return Some(input);
            }
        }
        None
    }

    /// Block until a key decodes, halting between interrupts. This is the
    /// kernel's only suspension point.
    pub fn getchar(&mut self) -> Input {
        loop {
            if let Some(input) = self.try_getchar() {
                return input;
            }
            x86::hlt();
        }
    }

    /// Cooked line input with backspace handling, echoed through the kernel
    /// writer.
    pub fn read_line<const N: usize>(&mut self, buf: &mut heapless::String<N>) {
        buf.clear();
        loop {
            match self.getchar() {
                Input::Char('\n') => {
                    kprintln!();
                    return;
                }
                Input::Char('\x08') | Input::Char('\x7f') => {
                    if buf.pop().is_some() {
                        kprint!("\x08 \x08");
                    }
                }
                Input::Char(c) if (' '..='~').contains(&c) => {
                    if buf.push(c).is_ok() {
                        kprint!("{}", c);
                    }
                }
                _ => {}
            }
        }
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}
