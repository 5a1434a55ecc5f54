//! Shared image buffer and acquisition completion signal.
//!
//! During a buffered shot the acquisition thread is the only writer of the
//! [`ImageBuffer`]; the worker reads it once the thread has signalled
//! completion through [`Completion`]. Frames are stored strictly in
//! acquisition order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::sdk::Image;

/// Append-only, thread-safe list of acquired images.
#[derive(Clone, Default)]
pub struct ImageBuffer {
    images: Arc<Mutex<Vec<Image>>>,
}

impl ImageBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one image.
    pub fn push(&self, image: Image) {
        self.images.lock().push(image);
    }

    /// Append several images.
    pub fn extend<I: IntoIterator<Item = Image>>(&self, images: I) {
        self.images.lock().extend(images);
    }

    /// Number of images held.
    pub fn len(&self) -> usize {
        self.images.lock().len()
    }

    /// Whether no image has been appended.
    pub fn is_empty(&self) -> bool {
        self.images.lock().is_empty()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<Image> {
        self.images.lock().clone()
    }

    /// Move the contents out, leaving the buffer empty.
    pub fn take(&self) -> Vec<Image> {
        std::mem::take(&mut *self.images.lock())
    }
}

impl std::fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBuffer").field("len", &self.len()).finish()
    }
}

/// One-shot completion cell: set once by the producer, awaited by the consumer.
pub struct Completion<T> {
    value: Mutex<Option<T>>,
    done: Condvar,
}

impl<T> Completion<T> {
    /// Completion that has not fired yet.
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    /// Publish the value and wake every waiter.
    pub fn complete(&self, value: T) {
        let mut guard = self.value.lock();
        *guard = Some(value);
        self.done.notify_all();
    }

    /// Whether a value has been published.
    pub fn is_complete(&self) -> bool {
        self.value.lock().is_some()
    }

    /// Block until completed or `timeout` elapses. Returns whether completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.value.lock();
        if guard.is_some() {
            return true;
        }
        // Condvar wakeups may be spurious; wait_while_for re-checks the predicate.
        self.done
            .wait_while_for(&mut guard, |value| value.is_none(), timeout);
        guard.is_some()
    }

    /// Remove the value, if completed.
    pub fn take(&self) -> Option<T> {
        self.value.lock().take()
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;
    use std::thread;

    fn image(value: u16) -> Image {
        ArrayD::from_elem(vec![2, 2], value)
    }

    #[test]
    fn test_buffer_preserves_order_across_threads() {
        let buffer = ImageBuffer::new();
        let writer = buffer.clone();

        let handle = thread::spawn(move || {
            for i in 0..10 {
                writer.push(image(i));
            }
        });
        handle.join().unwrap();

        let images = buffer.take();
        assert_eq!(images.len(), 10);
        for (i, img) in images.iter().enumerate() {
            assert_eq!(img[[0, 0]], i as u16);
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_completion_wakes_waiter() {
        let completion = Arc::new(Completion::<usize>::new());
        let producer = completion.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.complete(7);
        });

        assert!(completion.wait_timeout(Duration::from_secs(5)));
        assert_eq!(completion.take(), Some(7));
        handle.join().unwrap();
    }

    #[test]
    fn test_completion_times_out() {
        let completion = Completion::<()>::new();
        assert!(!completion.wait_timeout(Duration::from_millis(10)));
        assert!(!completion.is_complete());
    }
}
