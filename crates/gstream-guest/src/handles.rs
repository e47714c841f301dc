//! Guest-side handle table.
//!
//! The guest never dereferences a boxed handle; it only remembers what type
//! the handle is and, for ordered handles, the next sequence number to stamp
//! on commands against it. The table is shared between every encoder thread
//! of the process.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use gstream_protocol::handle::{BoxedHandle, HandleTag, NULL_HANDLE};

struct Entry {
    tag: HandleTag,
    /// Next sequence number for ordered handles; draws start at 1.
    next_seq: Arc<AtomicU32>,
}

#[derive(Default)]
pub struct GuestHandles {
    map: DashMap<BoxedHandle, Entry>,
}

impl GuestHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, boxed: BoxedHandle, tag: HandleTag) {
        if boxed == NULL_HANDLE {
            return;
        }
        self.map.insert(
            boxed,
            Entry {
                tag,
                next_seq: Arc::new(AtomicU32::new(1)),
            },
        );
    }

    pub fn remove(&self, boxed: BoxedHandle) {
        self.map.remove(&boxed);
    }

    pub fn tag(&self, boxed: BoxedHandle) -> Option<HandleTag> {
        self.map.get(&boxed).map(|e| e.tag)
    }

    /// Draw the next sequence number for an ordered handle. Unknown or
    /// unordered handles draw 0, which the host treats as "no ordering".
    pub fn draw_seq(&self, boxed: BoxedHandle) -> u32 {
        match self.map.get(&boxed) {
            Some(entry) if entry.tag.is_ordered() => {
                entry.next_seq.fetch_add(1, Ordering::Relaxed)
            }
            _ => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_handles_draw_increasing_sequences() {
        let handles = GuestHandles::new();
        handles.insert(10, HandleTag::Device);
        assert_eq!(handles.draw_seq(10), 1);
        assert_eq!(handles.draw_seq(10), 2);
        assert_eq!(handles.draw_seq(10), 3);
    }

    #[test]
    fn unordered_and_unknown_handles_draw_zero() {
        let handles = GuestHandles::new();
        handles.insert(11, HandleTag::Buffer);
        assert_eq!(handles.draw_seq(11), 0);
        assert_eq!(handles.draw_seq(999), 0);
    }

    #[test]
    fn draws_are_unique_across_threads() {
        let handles = Arc::new(GuestHandles::new());
        handles.insert(12, HandleTag::Queue);

        let mut threads = vec![];
        for _ in 0..4 {
            let handles = Arc::clone(&handles);
            threads.push(std::thread::spawn(move || {
                (0..100).map(|_| handles.draw_seq(12)).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u32> = threads
            .into_iter()
            .flat_map(|t| t.join().expect("draw thread panicked"))
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
    }
}
