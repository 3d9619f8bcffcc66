//! Opaque 64-bit handle identity (spec §3 Handle/Serial, §4.15, §9).
//!
//! A `Serial` packs `{owning-thread-id: 16, generation: 48}`. Every
//! long-lived user-visible object (connection, stream, alarm) stores the
//! `Serial` it was allocated with; a `Handle` carrying a `Serial` is valid
//! only while the object's stored `Serial` still equals it. Generation `0`
//! is the cleared/empty sentinel and is never handed out to a live object,
//! which is how `Serial::is_empty` can double as "object destroyed".
//!
//! This scheme is the Rust-native reading of the generational-index pattern
//! from `original_source/src/core/serial.h` (`qrpc::Serial`), adapted so the
//! "generation" field plays the role the C++ source split across a 32-bit
//! timestamp and 31-bit object index: here it is simply an ever-increasing
//! per-thread counter, which is sufficient to detect staleness and is what
//! `slotmap`'s own versioning already gives us per-slab (see `qrpc-core`'s
//! `slab` module, which stores a `Serial` alongside each `slotmap` key).

use std::sync::atomic::{AtomicU64, Ordering};

const THREAD_ID_BITS: u32 = 16;
const GENERATION_MASK: u64 = (1u64 << (64 - THREAD_ID_BITS)) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub const EMPTY: Generation = Generation(0);

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Serial(u64);

impl Serial {
    pub const EMPTY: Serial = Serial(0);

    pub fn encode(thread_id: ThreadId, generation: Generation) -> Self {
        debug_assert!(generation.0 <= GENERATION_MASK, "generation overflowed 48 bits");
        Serial(((thread_id.0 as u64) << (64 - THREAD_ID_BITS)) | (generation.0 & GENERATION_MASK))
    }

    pub fn thread_id(self) -> ThreadId {
        ThreadId((self.0 >> (64 - THREAD_ID_BITS)) as u16)
    }

    pub fn generation(self) -> Generation {
        Generation(self.0 & GENERATION_MASK)
    }

    pub fn is_empty(self) -> bool {
        self.generation().is_empty()
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn dump(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl std::fmt::Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dump())
    }
}

/// Per-thread monotonic generation allocator (spec §3 "Serial generation
/// rules": allocated atomically per owning thread; never reused while an
/// object with that serial is alive).
pub struct GenerationAllocator {
    thread_id: ThreadId,
    next: AtomicU64,
}

impl GenerationAllocator {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            // start at 1: 0 is the cleared/empty sentinel.
            next: AtomicU64::new(1),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn allocate(&self) -> Serial {
        let gen = self.next.fetch_add(1, Ordering::Relaxed);
        Serial::encode(self.thread_id, Generation(gen & GENERATION_MASK))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_thread_id_and_generation() {
        let s = Serial::encode(ThreadId(7), Generation(42));
        assert_eq!(s.thread_id(), ThreadId(7));
        assert_eq!(s.generation().value(), 42);
    }

    #[test]
    fn empty_serial_has_zero_generation() {
        assert!(Serial::EMPTY.is_empty());
        assert!(!Serial::encode(ThreadId(0), Generation(1)).is_empty());
    }

    #[test]
    fn allocator_never_hands_out_empty_generation() {
        let alloc = GenerationAllocator::new(ThreadId(3));
        for _ in 0..1000 {
            let s = alloc.allocate();
            assert!(!s.is_empty());
            assert_eq!(s.thread_id(), ThreadId(3));
        }
    }

    #[test]
    fn allocator_is_monotonic_and_unique() {
        let alloc = GenerationAllocator::new(ThreadId(1));
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_ne!(a, b);
        assert!(a.generation().value() < b.generation().value());
    }

    #[test]
    fn validity_is_equality_of_stored_and_handle_serial() {
        // For all handles h: valid(h) <=> object_at(h.pointer).serial == h.serial
        let alloc = GenerationAllocator::new(ThreadId(2));
        let stored = alloc.allocate();
        let handle_serial_same = stored;
        let handle_serial_stale = alloc.allocate();
        assert_eq!(stored, handle_serial_same);
        assert_ne!(stored, handle_serial_stale);
    }
}
