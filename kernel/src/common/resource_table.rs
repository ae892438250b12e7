use core::fmt;

use hashbrown::HashMap;
use log::trace;

use crate::allocator::identifier_allocator::IdentifierAllocator;

/// A generation-checked reference into a `ResourceTable`.
///
/// The slot index is reused after a removal but the generation is not, so a
/// handle kept past the removal of its entry never resolves again.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the handle into one register. Generations start at 1, so no
    /// live handle packs to 0.
    pub fn as_raw(&self) -> u64 {
        (self.generation as u64) << 32 | self.index as u64
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self)
    }
}

struct Slot<T> {
    generation: u32,
    data: T,
}

/// Since the allocation of process ids, file descriptors etc follows the
/// same algorithm: an id -> resource map plus a pool of free ids.
///
/// The table carries no lock of its own, the owner guards it.
pub struct ResourceTable<T> {
    active_slots: HashMap<usize, Slot<T>>,
    // last generation handed out for every index ever used
    generations: Vec<u32>,
    free_slots: IdentifierAllocator,
    // debug
    name: &'static str,
}

impl<T> ResourceTable<T> {
    pub fn new(capacity: usize, name: &'static str) -> Self {
        Self {
            active_slots: HashMap::with_capacity(capacity),
            generations: Vec::with_capacity(capacity),
            free_slots: IdentifierAllocator::new(capacity),
            name,
        }
    }

    /// Reserves a slot and fills it with what `make` builds for the new handle.
    pub fn insert_with(&mut self, make: impl FnOnce(Handle) -> T) -> Handle {
        let index = self.free_slots.allocate();
        if index >= self.generations.len() {
            self.generations.resize(index + 1, 0);
        }
        let generation = self.generations[index].wrapping_add(1).max(1);
        self.generations[index] = generation;

        let handle = Handle {
            index: index as u32,
            generation,
        };
        let slot = Slot {
            generation,
            data: make(handle),
        };
        if self.active_slots.insert(index, slot).is_some() {
            panic!("{}Table::insert: id collision, id: {}", self.name, handle);
        }
        trace!("{}Table::insert: reserved {}", self.name, handle);
        handle
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.active_slots.get(&handle.index()) {
            Some(slot) if slot.generation == handle.generation => Some(&slot.data),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.active_slots.get_mut(&handle.index()) {
            Some(slot) if slot.generation == handle.generation => Some(&mut slot.data),
            _ => None,
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        let slot = self.active_slots.remove(&handle.index())?;
        self.free_slots.deallocate(handle.index());
        trace!("{}Table::remove: released {}", self.name, handle);
        Some(slot.data)
    }

    pub fn len(&self) -> usize {
        self.active_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active_slots.is_empty()
    }

    /// Live handles in index order
    pub fn handles(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self
            .active_slots
            .iter()
            .map(|(index, slot)| Handle {
                index: *index as u32,
                generation: slot.generation,
            })
            .collect();
        handles.sort();
        handles
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.active_slots.iter().map(|(index, slot)| {
            (
                Handle {
                    index: *index as u32,
                    generation: slot.generation,
                },
                &slot.data,
            )
        })
    }
}
