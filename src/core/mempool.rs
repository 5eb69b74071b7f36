//!
//! Thread safe typed memory pool backed by a preallocated slab and a lockless
//! free list. This avoids doing memory allocations in the hot path.
//!
//! Borrowed elements are accounted for and validated upon dropping the pool.

use std::{marker::PhantomData, mem::MaybeUninit, ptr::NonNull};

use crossbeam::queue::ArrayQueue;

/// Pointer to a pool slot. Raw element pointers travel between cores through
/// rings, the pool hands ownership of the pointee along with the pointer.
struct Slot<T>(NonNull<T>);

unsafe impl<T> Send for Slot<T> {}

pub struct MemPool<T: Sized> {
    name: String,
    capacity: u64,
    free: ArrayQueue<Slot<T>>,
    slab: *mut [MaybeUninit<T>],
    element_type: PhantomData<T>,
}

unsafe impl<T: Sized> Send for MemPool<T> {}
unsafe impl<T: Sized> Sync for MemPool<T> {}

impl<T: Sized> MemPool<T> {
    /// Create memory pool with given name and size.
    pub fn create(name: &str, size: u64) -> Option<Self> {
        if size == 0 {
            error!("Failed to create empty memory pool '{}'", name);
            return None;
        }

        let mut slab = std::iter::repeat_with(MaybeUninit::uninit)
            .take(size as usize)
            .collect::<Vec<MaybeUninit<T>>>()
            .into_boxed_slice();

        let free = ArrayQueue::new(size as usize);
        for element in slab.iter_mut() {
            let ptr = element.as_mut_ptr();
            free.push(Slot(unsafe { NonNull::new_unchecked(ptr) }))
                .ok()
                .expect("free list sized to the slab");
        }

        info!(
            "Memory pool '{}' with {} elements ({} bytes size) successfully created",
            name,
            size,
            std::mem::size_of::<T>()
        );

        Some(Self {
            name: String::from(name),
            capacity: size,
            free,
            slab: Box::into_raw(slab),
            element_type: PhantomData,
        })
    }

    /// Get a free element from the pool and initialize it with the target
    /// object. Returns `None` when the pool is exhausted.
    pub fn get(&self, val: T) -> Option<NonNull<T>> {
        let slot = self.free.pop()?;
        unsafe {
            slot.0.as_ptr().write(val);
        }
        Some(slot.0)
    }

    /// Return an element to the pool. The element must have been handed out
    /// by [`MemPool::get`] on this pool.
    pub fn put(&self, ptr: NonNull<T>) {
        unsafe {
            std::ptr::drop_in_place(ptr.as_ptr());
        }
        self.free
            .push(Slot(ptr))
            .ok()
            .expect("returned more elements than were borrowed");
    }

    /// Return a batch of consumed elements at once.
    pub fn put_bulk(&self, ptrs: &[NonNull<T>]) {
        for ptr in ptrs {
            self.put(*ptr);
        }
    }

    /// number of free elements left
    pub fn count(&self) -> u64 {
        self.free.len() as u64
    }
}

impl<T: Sized> Drop for MemPool<T> {
    fn drop(&mut self) {
        let available = self.count();
        debug!(
            "Dropping memory pool '{}', elements placement (t/u/f): {}/{}/{}",
            self.name,
            self.capacity,
            self.capacity - available,
            available
        );
        assert_eq!(available, self.capacity);
        unsafe {
            drop(Box::from_raw(self.slab));
        }
        info!(
            "Memory pool '{}' with {} elements successfully freed",
            self.name, self.capacity
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaust_and_reuse() {
        let pool = MemPool::<u64>::create("ut_pool", 4).unwrap();

        let mut taken = Vec::new();
        for i in 0 .. 4 {
            taken.push(pool.get(i).unwrap());
        }
        assert_eq!(pool.count(), 0);
        assert!(pool.get(99).is_none());

        let ptr = taken.pop().unwrap();
        assert_eq!(unsafe { *ptr.as_ref() }, 3);
        pool.put(ptr);
        assert_eq!(pool.count(), 1);
        let again = pool.get(99).unwrap();
        assert_eq!(unsafe { *again.as_ref() }, 99);
        assert_eq!(pool.count(), 0);

        // all elements must be back before the pool may be dropped
        pool.put(again);
        pool.put_bulk(&taken);
        assert_eq!(pool.count(), 4);
    }
}
