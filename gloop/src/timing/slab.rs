//! Fixed-capacity generational slab holding the wheel's timer nodes.

pub(super) struct Node<T> {
    pub payload: T,
    pub deadline: u64,
    pub prev: Option<u32>,
    pub next: Option<u32>,
}

enum Entry<T> {
    Occupied { generation: u32, node: Node<T> },
    Free { generation: u32, next: Option<u32> },
}

pub(super) struct Slab<T> {
    entries: Vec<Entry<T>>,
    free: Option<u32>,
    len: usize,
}

impl<T> Slab<T> {
    pub fn with_capacity(capacity: u32) -> Self {
        let entries = (0..capacity)
            .map(|i| Entry::Free {
                generation: 0,
                next: (i + 1 < capacity).then_some(i + 1),
            })
            .collect();
        Self {
            entries,
            free: (capacity > 0).then_some(0),
            len: 0,
        }
    }

    /// Stores `node`, returning its index and generation, or gives it back when full.
    pub fn insert(&mut self, node: Node<T>) -> Result<(u32, u32), Node<T>> {
        let Some(index) = self.free else {
            return Err(node);
        };
        let entry = &mut self.entries[index as usize];
        let Entry::Free { generation, next } = *entry else {
            return Err(node);
        };
        self.free = next;
        *entry = Entry::Occupied { generation, node };
        self.len += 1;
        Ok((index, generation))
    }

    /// Removes the node at `index`; the generation bump invalidates old handles.
    pub fn remove(&mut self, index: u32) -> Option<Node<T>> {
        let entry = self.entries.get_mut(index as usize)?;
        let generation = match entry {
            Entry::Occupied { generation, .. } => generation.wrapping_add(1),
            Entry::Free { .. } => return None,
        };
        let old = std::mem::replace(
            entry,
            Entry::Free {
                generation,
                next: self.free,
            },
        );
        self.free = Some(index);
        self.len -= 1;
        match old {
            Entry::Occupied { node, .. } => Some(node),
            Entry::Free { .. } => None,
        }
    }

    pub fn get(&self, index: u32) -> Option<&Node<T>> {
        match self.entries.get(index as usize)? {
            Entry::Occupied { node, .. } => Some(node),
            Entry::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Node<T>> {
        match self.entries.get_mut(index as usize)? {
            Entry::Occupied { node, .. } => Some(node),
            Entry::Free { .. } => None,
        }
    }

    /// Generation of an occupied entry.
    pub fn generation(&self, index: u32) -> Option<u32> {
        match self.entries.get(index as usize)? {
            Entry::Occupied { generation, .. } => Some(*generation),
            Entry::Free { .. } => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }
}
