use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

/// Single-writer/single-reader triple buffer.
///
/// Exchanges the most recent value of `T` between exactly one writer thread
/// and exactly one reader thread. Neither side ever blocks on the other and
/// the reader can never observe a partially-written value: the writer always
/// works on a slot the reader is not holding, and the reader always pins the
/// most recently published slot.
///
/// Three fixed slots are managed by index. A small mutex guards only the
/// cursor indices; it is never held while a payload is being read or
/// written, so a slow copy on one side cannot stall the other.
///
/// # Safety
///
/// Slot payloads live in `UnsafeCell`s. This is safe because:
/// - the writer and reader handles are not `Clone`, so there is one of each
/// - `begin()`/`read()` take `&mut self` and the guards borrow the handle,
///   so each side has at most one slot claimed at a time
/// - the cursor bookkeeping guarantees the two claimed slots are distinct
struct Slots<T> {
    slots: [UnsafeCell<T>; 3],
    cursors: Mutex<Cursors>,
}

unsafe impl<T: Send> Send for Slots<T> {}
unsafe impl<T: Send> Sync for Slots<T> {}

struct Cursors {
    last_written: usize,
    read_at: Option<usize>,
    write_at: Option<usize>,
}

fn lock_cursors<T>(slots: &Slots<T>) -> std::sync::MutexGuard<'_, Cursors> {
    // A poisoned cursor mutex only ever means a panic between two index
    // assignments; the indices themselves are always consistent.
    slots.cursors.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Writing half. Obtained from [`triple_buffer`].
pub struct TripleWriter<T> {
    shared: Arc<Slots<T>>,
}

/// Reading half. Obtained from [`triple_buffer`].
pub struct TripleReader<T> {
    shared: Arc<Slots<T>>,
}

/// Create a triple buffer seeded with `initial` in every slot, so a read
/// that happens before the first write still sees a complete value.
pub fn triple_buffer<T: Clone>(initial: T) -> (TripleWriter<T>, TripleReader<T>) {
    let shared = Arc::new(Slots {
        slots: [
            UnsafeCell::new(initial.clone()),
            UnsafeCell::new(initial.clone()),
            UnsafeCell::new(initial),
        ],
        cursors: Mutex::new(Cursors {
            last_written: 0,
            read_at: None,
            write_at: None,
        }),
    });
    (
        TripleWriter {
            shared: shared.clone(),
        },
        TripleReader { shared },
    )
}

impl<T> TripleWriter<T> {
    /// Claim a free slot for writing. The returned guard derefs to the slot
    /// contents; dropping it publishes the slot as the latest complete
    /// write.
    pub fn begin(&mut self) -> WriteGuard<'_, T> {
        let index = {
            let mut cursors = lock_cursors(&self.shared);
            let mut index = (cursors.last_written + 1) % 3;
            // Never take the slot an in-flight read is holding.
            if cursors.read_at == Some(index) {
                index = (index + 1) % 3;
            }
            cursors.write_at = Some(index);
            index
        };
        WriteGuard {
            shared: &self.shared,
            index,
        }
    }

    /// Write a complete value and publish it.
    pub fn publish(&mut self, value: T) {
        *self.begin() = value;
    }
}

impl<T> TripleReader<T> {
    /// Pin the most recently published slot. The returned guard derefs to
    /// the value of the last complete write (or the initial value if nothing
    /// has been published yet); dropping it releases the pin so the writer
    /// may rotate through the slot again.
    pub fn read(&mut self) -> ReadGuard<'_, T> {
        let index = {
            let mut cursors = lock_cursors(&self.shared);
            let index = cursors.last_written;
            cursors.read_at = Some(index);
            index
        };
        ReadGuard {
            shared: &self.shared,
            index,
        }
    }
}

impl<T: Clone> TripleReader<T> {
    /// Copy out the latest complete value.
    pub fn latest(&mut self) -> T {
        self.read().clone()
    }
}

pub struct WriteGuard<'a, T> {
    shared: &'a Slots<T>,
    index: usize,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.shared.slots[self.index].get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.shared.slots[self.index].get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut cursors = lock_cursors(self.shared);
        cursors.last_written = self.index;
        cursors.write_at = None;
    }
}

pub struct ReadGuard<'a, T> {
    shared: &'a Slots<T>,
    index: usize,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.shared.slots[self.index].get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut cursors = lock_cursors(self.shared);
        cursors.read_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn read_before_any_write_sees_initial() {
        let (_writer, mut reader) = triple_buffer(7u32);
        assert_eq!(*reader.read(), 7);
    }

    #[test]
    fn reader_sees_latest_published_value() {
        let (mut writer, mut reader) = triple_buffer(0u32);
        writer.publish(1);
        writer.publish(2);
        assert_eq!(*reader.read(), 2);
        writer.publish(3);
        assert_eq!(reader.latest(), 3);
    }

    #[test]
    fn in_flight_write_is_invisible_until_published() {
        let (mut writer, mut reader) = triple_buffer(10u32);
        writer.publish(11);
        let mut guard = writer.begin();
        *guard = 99;
        // Not yet published; a read pins the previous complete write.
        assert_eq!(*reader.read(), 11);
        drop(guard);
        assert_eq!(*reader.read(), 99);
    }

    #[test]
    fn writer_skips_slot_held_by_reader() {
        let (mut writer, mut reader) = triple_buffer(0u32);
        writer.publish(1);
        let read = reader.read();
        // Two writes while the read is pinned; neither may land on its slot.
        writer.publish(2);
        writer.publish(3);
        assert_eq!(*read, 1);
        drop(read);
        assert_eq!(*reader.read(), 3);
    }

    #[test]
    fn concurrent_writer_and_reader_never_tear() {
        // Payload where a torn read is detectable: all lanes must agree.
        let (mut writer, mut reader) = triple_buffer([0u64; 8]);

        let writer_thread = thread::spawn(move || {
            for i in 1..=20_000u64 {
                writer.publish([i; 8]);
            }
        });

        let reader_thread = thread::spawn(move || {
            let mut last = 0u64;
            for _ in 0..20_000 {
                let snapshot = *reader.read();
                for lane in &snapshot[1..] {
                    assert_eq!(*lane, snapshot[0], "torn read: {:?}", snapshot);
                }
                // Published values only ever move forward.
                assert!(snapshot[0] >= last);
                last = snapshot[0];
            }
        });

        writer_thread.join().unwrap();
        reader_thread.join().unwrap();
    }

    #[test]
    fn slow_reader_does_not_block_writer() {
        let (mut writer, mut reader) = triple_buffer(0u32);
        let guard = reader.read();
        let writer_thread = thread::spawn(move || {
            for i in 0..1000 {
                writer.publish(i);
            }
        });
        thread::sleep(Duration::from_millis(10));
        writer_thread.join().unwrap();
        drop(guard);
        assert_eq!(*reader.read(), 999);
    }
}
