use std::fmt;
use std::marker::PhantomData;

/// Opaque reference into a [`HandleTable`], tagged with the kind of object
/// it names.
///
/// A handle stays valid until its entry is removed; removal bumps the slot's
/// generation, so a stale handle never aliases a later entry in the same slot.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Slot<V> {
    generation: u32,
    value: Option<V>,
}

/// Slot table of `V` values addressed by generation-checked `Handle<K>`s.
pub struct HandleTable<K, V = K> {
    slots: Vec<Slot<V>>,
    free: Vec<u32>,
    len: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<K, V> Default for HandleTable<K, V> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _kind: PhantomData,
        }
    }
}

impl<K, V> HandleTable<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: V) -> Handle<K> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
                _kind: PhantomData,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle {
            index,
            generation: 0,
            _kind: PhantomData,
        }
    }

    pub fn get(&self, handle: Handle<K>) -> Option<&V> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn contains(&self, handle: Handle<K>) -> bool {
        self.get(handle).is_some()
    }

    /// Remove the entry, invalidating `handle` and every copy of it.
    pub fn remove(&mut self, handle: Handle<K>) -> Option<V> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    /// Remove every entry matching `pred`, returning the removed values.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&V) -> bool) -> Vec<V> {
        let mut removed = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.as_ref().is_some_and(&mut pred) {
                if let Some(value) = slot.value.take() {
                    removed.push(value);
                }
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                self.len -= 1;
            }
        }
        removed
    }

    /// Live entries with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<K>, &V)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    Handle {
                        index: index as u32,
                        generation: slot.generation,
                        _kind: PhantomData,
                    },
                    value,
                )
            })
        })
    }

    /// Remove everything; all outstanding handles become stale.
    pub fn drain(&mut self) -> Vec<V> {
        self.remove_where(|_| true)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut table: HandleTable<&str> = HandleTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        assert_ne!(a, b);
        assert_eq!(table.get(a), Some(&"a"));
        assert_eq!(table.len(), 2);

        assert_eq!(table.remove(a), Some("a"));
        assert_eq!(table.get(a), None);
        assert_eq!(table.remove(a), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reused_slot_rejects_stale_handle() {
        let mut table: HandleTable<i32> = HandleTable::new();
        let old = table.insert(1);
        table.remove(old);
        let new = table.insert(2);

        assert_eq!(new.index(), old.index());
        assert_eq!(new.generation(), old.generation() + 1);
        assert_eq!(table.get(old), None);
        assert_eq!(table.get(new), Some(&2));
        assert_eq!(table.remove(old), None);
        assert!(table.contains(new));
    }

    #[test]
    fn remove_where_and_drain() {
        let mut table: HandleTable<i32> = HandleTable::new();
        let handles: Vec<_> = (0..5).map(|i| table.insert(i)).collect();

        let mut odd = table.remove_where(|v| v % 2 == 1);
        odd.sort();
        assert_eq!(odd, vec![1, 3]);
        assert!(!table.contains(handles[1]));
        assert!(table.contains(handles[2]));

        let live: Vec<_> = table.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(live, vec![(handles[0], 0), (handles[2], 2), (handles[4], 4)]);

        assert_eq!(table.drain().len(), 3);
        assert!(table.is_empty());
        assert!(handles.iter().all(|h| !table.contains(*h)));
    }
}
