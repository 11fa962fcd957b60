//! Bump planning over a caller-owned arena.
//!
//! Tensors are laid out back to back in declaration order and never freed
//! during a session. Only byte ranges are handed out; the interpreter keeps
//! the arena borrow and slices it on demand.

use std::ops::Range;

use anyhow::{ensure, Context, Result};

pub(crate) struct BumpPlanner {
    base: usize,
    capacity: usize,
    offset: usize,
}

impl BumpPlanner {
    pub(crate) fn new(arena: &[u8]) -> Self {
        Self {
            base: arena.as_ptr() as usize,
            capacity: arena.len(),
            offset: 0,
        }
    }

    /// Reserves `len` bytes whose absolute address is a multiple of `align`.
    pub(crate) fn alloc(&mut self, len: usize, align: usize) -> Result<Range<usize>> {
        let misalign = (self.base + self.offset) % align;
        let padding = if misalign == 0 { 0 } else { align - misalign };
        let start = self.offset + padding;
        let end = start.checked_add(len).context("tensor size overflows usize")?;
        ensure!(
            end <= self.capacity,
            "arena exhausted: requested {len} bytes, {} remaining of {}",
            self.remaining(),
            self.capacity
        );
        self.offset = end;
        Ok(start..end)
    }

    #[inline(always)]
    pub(crate) fn used(&self) -> usize {
        self.offset
    }

    #[inline(always)]
    pub(crate) fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.offset)
    }
}
