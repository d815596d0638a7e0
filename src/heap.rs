//! Handle-based storage for heap-resident integer arrays.
//!
//! Frames never hold an array directly; they hold an `i32` handle issued
//! by [`Heap::allocate`] and resolve it on every access. All arrays live
//! in one owned table for the life of the process: there is no free or
//! compaction operation, and any frame holding a handle aliases the same
//! underlying array.

/// The heap's handle table. Handles are indices into the table, issued in
/// allocation order starting at 0 and stable forever after.
#[derive(Debug, Default)]
pub struct Heap {
    arrays: Vec<Vec<i32>>,
}

impl Heap {
    /// Creates an empty heap with no live handles.
    pub fn new() -> Self {
        Self { arrays: Vec::new() }
    }

    /// Stores `values` as a new array and returns its handle.
    pub fn allocate(&mut self, values: Vec<i32>) -> i32 {
        let handle = self.arrays.len() as i32;
        self.arrays.push(values);
        handle
    }

    /// Resolves a handle to its array, or `None` if the handle was never
    /// issued by this heap.
    pub fn array(&self, handle: i32) -> Option<&Vec<i32>> {
        usize::try_from(handle)
            .ok()
            .and_then(|index| self.arrays.get(index))
    }

    /// Resolves a handle to its array for mutation.
    pub fn array_mut(&mut self, handle: i32) -> Option<&mut Vec<i32>> {
        usize::try_from(handle)
            .ok()
            .and_then(|index| self.arrays.get_mut(index))
    }
}
