//! Generational handle slab (spec §4.15 Serial/handle identity, §9 "Opaque
//! handles with manual validity").
//!
//! Every long-lived, user-visible object (connection, stream, producer,
//! consumer, alarm) lives in a `Slab<K, V>` keyed by a `slotmap` generational
//! index, and is additionally tagged with a `Serial` carrying the owning
//! worker's thread id. A `Handle<K>` bundles both: the slotmap key gives
//! O(1) generational lookup within one worker's slab, and the `Serial`
//! continues to carry the cross-thread ownership tag a handle needs to be
//! meaningfully compared or logged outside that worker (spec §8: "for all
//! handles h, valid(h) <=> object_at(h.pointer).serial == h.serial").

use qrpc_protocol::serial::GenerationAllocator;
use qrpc_protocol::{Serial, ThreadId};
use slotmap::{Key, SlotMap};

#[derive(Debug)]
pub struct Handle<K> {
    key: K,
    serial: Serial,
}

// Manual impls: `K: Copy` is all slotmap keys guarantee, and we don't want
// to require `V: Clone`/`Eq` just to derive these on `Handle<K>`.
impl<K: Copy> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K: Copy> Copy for Handle<K> {}
impl<K: PartialEq> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.serial == other.serial
    }
}
impl<K: Eq> Eq for Handle<K> {}

impl<K> Handle<K> {
    pub fn serial(&self) -> Serial {
        self.serial
    }
}

pub struct Slab<K: Key, V> {
    alloc: GenerationAllocator,
    entries: SlotMap<K, (Serial, V)>,
}

impl<K: Key, V> Slab<K, V> {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            alloc: GenerationAllocator::new(thread_id),
            entries: SlotMap::with_key(),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.alloc.thread_id()
    }

    pub fn insert(&mut self, value: V) -> Handle<K> {
        let serial = self.alloc.allocate();
        let key = self.entries.insert((serial, value));
        Handle { key, serial }
    }

    pub fn get(&self, handle: Handle<K>) -> Option<&V> {
        match self.entries.get(handle.key) {
            Some((serial, value)) if *serial == handle.serial => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<K>) -> Option<&mut V> {
        match self.entries.get_mut(handle.key) {
            Some((serial, value)) if *serial == handle.serial => Some(value),
            _ => None,
        }
    }

    /// `true` iff the handle's serial still matches the stored object's —
    /// a stale pointer whose serial was cleared on destruction compares
    /// unequal and is safely ignored rather than dereferenced.
    pub fn is_valid(&self, handle: Handle<K>) -> bool {
        self.get(handle).is_some()
    }

    /// Removes and returns the object, clearing its serial (spec §3 "on
    /// object destruction the stored serial is cleared").
    pub fn remove(&mut self, handle: Handle<K>) -> Option<V> {
        match self.entries.get(handle.key) {
            Some((serial, _)) if *serial == handle.serial => {
                self.entries.remove(handle.key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.entries.iter().map(|(k, (_, v))| (k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut V)> {
        self.entries.iter_mut().map(|(k, (_, v))| (k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::new_key_type;

    new_key_type! { struct TestKey; }

    #[test]
    fn handle_is_valid_until_removed() {
        let mut slab: Slab<TestKey, &'static str> = Slab::new(ThreadId(0));
        let h = slab.insert("alive");
        assert!(slab.is_valid(h));
        assert_eq!(*slab.get(h).unwrap(), "alive");

        slab.remove(h);
        assert!(!slab.is_valid(h));
        assert!(slab.get(h).is_none());
    }

    #[test]
    fn reused_slot_gets_fresh_serial_and_old_handle_stays_stale() {
        let mut slab: Slab<TestKey, u32> = Slab::new(ThreadId(1));
        let first = slab.insert(1);
        slab.remove(first);
        let second = slab.insert(2);

        assert!(!slab.is_valid(first));
        assert!(slab.is_valid(second));
        assert_ne!(first.serial(), second.serial());
    }

    #[test]
    fn handle_serial_carries_owning_thread_id() {
        let mut slab: Slab<TestKey, u32> = Slab::new(ThreadId(9));
        let h = slab.insert(7);
        assert_eq!(h.serial().thread_id(), ThreadId(9));
    }
}
