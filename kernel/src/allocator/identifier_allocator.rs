use std::collections::BTreeSet;

/// Hands out the lowest free identifier, so a freed id is reused as early
/// as possible. The id space doubles whenever it runs dry.
pub struct IdentifierAllocator {
    free_ids: BTreeSet<usize>,
    capacity: usize,
}

impl IdentifierAllocator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            free_ids: (0..capacity).collect(),
            capacity,
        }
    }

    pub fn allocate(&mut self) -> usize {
        if let Some(id) = self.free_ids.pop_first() {
            return id;
        }
        let id = self.capacity;
        self.free_ids.extend(self.capacity + 1..self.capacity * 2);
        self.capacity *= 2;
        id
    }

    pub fn deallocate(&mut self, id: usize) {
        if id >= self.capacity || !self.free_ids.insert(id) {
            panic!("IdentifierAllocator::deallocate: id {} deallocated twice!", id);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_id_first_and_growth() {
        let mut ids = IdentifierAllocator::new(2);
        assert_eq!(ids.allocate(), 0);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 2);
        assert_eq!(ids.capacity(), 4);
        ids.deallocate(0);
        assert_eq!(ids.allocate(), 0);
        assert_eq!(ids.allocate(), 3);
    }

    #[test]
    #[should_panic(expected = "deallocated twice")]
    fn double_free_panics() {
        let mut ids = IdentifierAllocator::new(4);
        let id = ids.allocate();
        ids.deallocate(id);
        ids.deallocate(id);
    }
}
