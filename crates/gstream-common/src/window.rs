//! The address-space window: one shared page-aligned region per session.
//!
//! The host carves its large host-visible allocations out of this window and
//! direct-maps them; the guest turns a window offset into a pointer that
//! aliases the host driver's mapping, so `map_memory` costs no copy.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

const PAGE_SIZE: usize = 4096;

pub struct AddressSpaceWindow {
    base: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// Accessors hand out raw offsets; all concurrent use goes through the
// suballocator, which never hands the same range to two owners.
unsafe impl Send for AddressSpaceWindow {}
unsafe impl Sync for AddressSpaceWindow {}

impl AddressSpaceWindow {
    /// Allocate a zeroed window of `size` bytes, page-aligned.
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .expect("window size overflows layout");
        // SAFETY: layout has non-zero size and valid alignment.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { base, size, layout }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Pointer to `offset` bytes into the window.
    ///
    /// # Safety
    /// `offset` must be within the window and the caller must own the
    /// suballocated range it points into.
    pub unsafe fn ptr_at(&self, offset: u64) -> *mut u8 {
        debug_assert!((offset as usize) < self.size);
        unsafe { self.base.as_ptr().add(offset as usize) }
    }

    /// Copy bytes out of the window (host-side readback).
    ///
    /// # Safety
    /// The `offset..offset + buf.len()` range must be owned by the caller.
    pub unsafe fn read_at(&self, offset: u64, buf: &mut [u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr_at(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Copy bytes into the window.
    ///
    /// # Safety
    /// The `offset..offset + bytes.len()` range must be owned by the caller.
    pub unsafe fn write_at(&self, offset: u64, bytes: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr_at(offset), bytes.len());
        }
    }
}

impl Drop for AddressSpaceWindow {
    fn drop(&mut self) {
        // SAFETY: base was allocated with this layout and is not aliased
        // once the window owner drops.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_starts_zeroed_and_round_trips() {
        let window = AddressSpaceWindow::new(2 * PAGE_SIZE);
        let mut buf = [0xAAu8; 16];
        unsafe { window.read_at(PAGE_SIZE as u64, &mut buf) };
        assert_eq!(buf, [0u8; 16]);

        unsafe { window.write_at(64, &[1, 2, 3, 4]) };
        let mut out = [0u8; 4];
        unsafe { window.read_at(64, &mut out) };
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn guest_pointer_aliases_window() {
        let window = AddressSpaceWindow::new(PAGE_SIZE);
        let p = unsafe { window.ptr_at(128) };
        unsafe { *p = 0x5A };
        let mut out = [0u8; 1];
        unsafe { window.read_at(128, &mut out) };
        assert_eq!(out[0], 0x5A);
    }
}
