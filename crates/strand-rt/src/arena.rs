// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Generation-checked slot map.
//!
//! Backs task handles and pending-operation keys. A removed slot bumps its
//! generation, so an index held past removal never resolves to whatever
//! reuses the slot.

use std::fmt;

/// Slot index plus the generation it was issued under.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Index {
    slot: u32,
    generation: u32,
}

impl Index {
    /// Pack into a single word (slot in the high half).
    pub fn to_bits(self) -> u64 {
        (u64::from(self.slot) << 32) | u64::from(self.generation)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            slot: (bits >> 32) as u32,
            generation: bits as u32,
        }
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> Index {
        self.len += 1;
        if let Some(free) = self.free_head {
            let slot = &mut self.slots[free as usize];
            let (next_free, generation) = match *slot {
                Slot::Vacant {
                    next_free,
                    generation,
                } => (next_free, generation),
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            self.free_head = next_free;
            *slot = Slot::Occupied { value, generation };
            return Index {
                slot: free,
                generation,
            };
        }

        let slot = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            value,
            generation: 0,
        });
        Index {
            slot,
            generation: 0,
        }
    }

    pub fn get(&self, index: Index) -> Option<&T> {
        match self.slots.get(index.slot as usize)? {
            Slot::Occupied { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: Index) -> Option<&mut T> {
        match self.slots.get_mut(index.slot as usize)? {
            Slot::Occupied { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    pub fn remove(&mut self, index: Index) -> Option<T> {
        let slot = self.slots.get_mut(index.slot as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == index.generation => {
                let vacant = Slot::Vacant {
                    next_free: self.free_head,
                    generation: generation.wrapping_add(1),
                };
                let Slot::Occupied { value, .. } = std::mem::replace(slot, vacant) else {
                    unreachable!()
                };
                self.free_head = Some(index.slot);
                self.len -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    /// Remove every occupied value, invalidating all outstanding indices.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for slot in 0..self.slots.len() {
            let generation = match &self.slots[slot] {
                Slot::Occupied { generation, .. } => *generation,
                Slot::Vacant { .. } => continue,
            };
            let index = Index {
                slot: slot as u32,
                generation,
            };
            if let Some(value) = self.remove(index) {
                out.push(value);
            }
        }
        out
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}
