//! Event chains: small ordered pub/sub lists wiring the kernel together.
//!
//! A chain holds up to [`CHAIN_CAP`] handler callbacks in subscription order.
//! Firing walks the chain until a handler claims the event by setting
//! `handled`. Chains are not re-entrant and must not be mutated from inside a
//! running `fire`.

use core::sync::atomic::{AtomicUsize, Ordering};
use derive_new::new;
use heapless::Vec;

pub const CHAIN_CAP: usize = 8;

/// Well-known event type tags.
pub mod kind {
    pub const KEYBOARD_SCANCODE: u32 = 1;
    pub const MEM_ALLOC: u32 = 2;
    pub const MEM_FREE: u32 = 3;
    pub const MEM_OOM: u32 = 4;
    pub const DISK_ATTACHED: u32 = 5;
}

/// Number of events fired from IRQ context since boot. Written only on the
/// IRQ side, read only from the foreground.
static EVENTS_FIRED: AtomicUsize = AtomicUsize::new(0);

pub fn events_fired() -> usize {
    EVENTS_FIRED.load(Ordering::Relaxed)
}

/// A single event, stack-allocated per fire. `source` and `data` carry
/// context as raw addresses so events stay plain data.
#[derive(PartialEq, Eq, Debug, Clone, Copy, new)]
pub struct Event {
    pub source: usize,
    pub data: usize,
    pub kind: u32,
    #[new(default)]
    pub handled: bool,
}

pub type Handler = fn(&mut Event);

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ChainError {
    Full,
    NotSubscribed,
}

/// Fixed-capacity ordered list of handlers.
#[derive(Debug, Clone, Default)]
pub struct Chain {
    handlers: Vec<Handler, CHAIN_CAP>,
}

impl Chain {
    pub const fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Append `handler`. Duplicates are not rejected; they fire once per
    /// subscription.
    pub fn subscribe(&mut self, handler: Handler) -> Result<(), ChainError> {
        self.handlers.push(handler).map_err(|_| ChainError::Full)
    }

    /// Remove the first subscription of `handler`, shifting the tail down to
    /// close the gap.
    pub fn unsubscribe(&mut self, handler: Handler) -> Result<(), ChainError> {
        let index = self
            .handlers
            .iter()
            .position(|h| *h == handler)
            .ok_or(ChainError::NotSubscribed)?;
        for i in index..self.handlers.len() - 1 {
            self.handlers[i] = self.handlers[i + 1];
        }
        self.handlers.pop();
        Ok(())
    }

    /// Dispatch `event` to the handlers in subscription order, stopping as
    /// soon as one sets `handled`.
    pub fn fire(&self, event: &mut Event) {
        event.handled = false;
        for handler in self.handlers.iter() {
            if event.handled {
                break;
            }
            handler(event);
        }
    }

    /// `fire` for IRQ context; bumps the global fired-from-IRQ counter.
    pub fn fire_from_irq(&self, event: &mut Event) {
        EVENTS_FIRED.fetch_add(1, Ordering::Relaxed);
        self.fire(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TRACE: AtomicUsize = AtomicUsize::new(0);

    fn record_a(_e: &mut Event) {
        TRACE.fetch_or(0b01, Ordering::SeqCst);
        assert_eq!(TRACE.load(Ordering::SeqCst) & 0b10, 0, "a must run before b");
    }

    fn record_b(_e: &mut Event) {
        TRACE.fetch_or(0b10, Ordering::SeqCst);
    }

    fn claim(e: &mut Event) {
        e.handled = true;
    }

    fn never(_e: &mut Event) {
        panic!("must not run after the event was claimed");
    }

    #[test]
    fn handlers_fire_in_subscription_order() {
        TRACE.store(0, Ordering::SeqCst);
        let mut chain = Chain::new();
        chain.subscribe(record_a).unwrap();
        chain.subscribe(record_b).unwrap();
        let mut e = Event::new(0, 0, kind::KEYBOARD_SCANCODE);
        chain.fire(&mut e);
        assert_eq!(TRACE.load(Ordering::SeqCst), 0b11);
        assert!(!e.handled);
    }

    #[test]
    fn handled_short_circuits() {
        let mut chain = Chain::new();
        chain.subscribe(claim).unwrap();
        chain.subscribe(never).unwrap();
        let mut e = Event::new(0, 0, 0);
        chain.fire(&mut e);
        assert!(e.handled);
    }

    #[test]
    fn unsubscribe_then_resubscribe_moves_to_tail() {
        let mut chain = Chain::new();
        chain.subscribe(record_a).unwrap();
        chain.subscribe(record_b).unwrap();
        chain.unsubscribe(record_a).unwrap();
        chain.subscribe(record_a).unwrap();
        assert_eq!(chain.handlers[0], record_b as Handler);
        assert_eq!(chain.handlers[1], record_a as Handler);
    }

    #[test]
    fn unsubscribe_unknown_fails() {
        let mut chain = Chain::new();
        chain.subscribe(record_a).unwrap();
        assert_eq!(chain.unsubscribe(record_b), Err(ChainError::NotSubscribed));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut chain = Chain::new();
        for _ in 0..CHAIN_CAP {
            chain.subscribe(record_b).unwrap();
        }
        assert_eq!(chain.subscribe(record_b), Err(ChainError::Full));
    }

    #[test]
    fn refiring_resets_handled() {
        let mut chain = Chain::new();
        chain.subscribe(claim).unwrap();
        let mut e = Event::new(0, 0, 0);
        chain.fire(&mut e);
        assert!(e.handled);
        let empty = Chain::new();
        empty.fire(&mut e);
        assert!(!e.handled);
    }
}
