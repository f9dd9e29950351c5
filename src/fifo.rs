use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// BOUNDED SPSC FIFO
//
// The inter-stage queue of the rtmon pipeline: a fixed-size ring buffer
// with exactly one producer (the dispatcher, or the previous stage's
// worker) and exactly one consumer (the stage's worker). Cursors are
// free-running, so the full ring capacity is usable.
//
//   channel<T>(size) -> (Producer<T>, Consumer<T>) - size must be a power
//       of two; the queue holds up to `size` entries
//   Producer.push(T) -> Result<(), T> - Err returns the value when full
//   Consumer.pop() -> Option<T>
//   len() - entries currently queued (approximate from the other side)
//
// push/pop never block and never spuriously fail: overflow policy (log and
// drop) belongs to the caller. Entries still queued when both ends are gone
// are dropped with the ring.

struct Inner<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
    // read: next slot to pop; write: next slot to push; both free-running
    read: AtomicUsize,
    write: AtomicUsize
}

// The UnsafeCell slots are only touched by the single producer (before the
// write cursor release) and the single consumer (before the read cursor
// release), never concurrently on the same slot.
unsafe impl<T: Send> Sync for Inner<T> {}

pub struct Producer<T> {
    inner: Arc<Inner<T>>
}

pub struct Consumer<T> {
    inner: Arc<Inner<T>>
}

pub fn channel<T: Send>(size: usize) -> (Producer<T>, Consumer<T>) {
    assert!(size.is_power_of_two(), "fifo size must be a power of two");
    let inner = Arc::new(Inner {
        slots: (0..size).map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>().into_boxed_slice(),
        mask: size - 1,
        read: AtomicUsize::new(0),
        write: AtomicUsize::new(0)
    });
    (Producer { inner: inner.clone() }, Consumer { inner })
}

impl<T: Send> Producer<T> {

    pub fn push(&self, value: T) -> Result<(), T> {
        let inner = &*self.inner;
        let write = inner.write.load(Ordering::Relaxed);
        let read = inner.read.load(Ordering::Acquire);
        if write.wrapping_sub(read) > inner.mask {
            return Err(value);
        }
        unsafe { *inner.slots[write & inner.mask].get() = Some(value); }
        inner.write.store(write.wrapping_add(1), Ordering::Release);
        Ok(())
    }

}

impl<T: Send> Consumer<T> {

    pub fn pop(&self) -> Option<T> {
        let inner = &*self.inner;
        let read = inner.read.load(Ordering::Relaxed);
        let write = inner.write.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let value = unsafe { (*inner.slots[read & inner.mask].get()).take() };
        inner.read.store(read.wrapping_add(1), Ordering::Release);
        value
    }

    // True once the producer side is gone; with an empty ring this is the
    // consumer's signal that no more entries can ever arrive.
    pub fn disconnected(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    pub fn len(&self) -> usize {
        let inner = &*self.inner;
        inner.write.load(Ordering::Relaxed)
            .wrapping_sub(inner.read.load(Ordering::Relaxed))
    }

}

unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send> Send for Consumer<T> {}
