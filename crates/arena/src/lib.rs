//! Per-run bump arena.
//!
//! One inference run allocates all of its parse scratch (JSON strings,
//! response segments, truncated tool results) out of a single [`Arena`] and
//! frees it en masse when the run ends.  Allocation goes through `&self` so
//! parse results can borrow from the arena while it is alive; `reset`,
//! `savepoint` and `restore` need `&mut self` and therefore cannot invalidate
//! outstanding borrows.
//!
//! The arena is a chain of fixed-capacity blocks (64 KiB by default).  A
//! block's backing buffer never grows or moves after creation, which is the
//! invariant that makes handing out references through `&self` sound.

use std::cell::RefCell;

pub mod text;

/// Errors produced by the arena itself.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArenaError {
    /// The host allocator refused to give us a new block.
    #[error("arena out of memory (requested {requested} bytes)")]
    OutOfMemory { requested: usize },
}

/// Cursor snapshot returned by [`Arena::savepoint`].
///
/// Only valid for the block that was current when it was taken.  Restoring a
/// savepoint after allocation has moved on to a later block is unsupported:
/// the blocks allocated in between are not reclaimed and a debug build will
/// assert.  Callers that need to roll back across blocks should use a fresh
/// arena per scope instead.
#[derive(Debug, Clone, Copy)]
pub struct Savepoint {
    block: usize,
    len: usize,
}

/// Word-backed block so every allocation start is 8-byte aligned.  The `Vec`
/// is only ever used as raw capacity: `len()` stays 0 and `used` tracks the
/// bump cursor in bytes.
struct Block {
    storage: Vec<u64>,
    cap: usize,
    used: usize,
}

impl Block {
    fn with_capacity(cap_bytes: usize) -> Result<Self, ArenaError> {
        let words = cap_bytes.div_ceil(8);
        let mut storage: Vec<u64> = Vec::new();
        storage
            .try_reserve_exact(words)
            .map_err(|_| ArenaError::OutOfMemory {
                requested: cap_bytes,
            })?;
        Ok(Self {
            storage,
            cap: words * 8,
            used: 0,
        })
    }

    fn remaining(&self) -> usize {
        self.cap - self.used
    }
}

struct Blocks {
    list: Vec<Block>,
}

/// Bump allocator with block chain.  Not `Sync`: a run owns its arena and
/// never shares it across threads without external synchronization.
pub struct Arena {
    blocks: RefCell<Blocks>,
    block_size: usize,
}

impl Arena {
    /// Default block capacity.
    pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

    pub fn new() -> Self {
        Self::with_block_size(Self::DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            blocks: RefCell::new(Blocks { list: Vec::new() }),
            block_size: block_size.max(8),
        }
    }

    /// Allocates `n` bytes, 8-byte aligned and zero-initialized.
    ///
    /// A new block of `max(n, block_size)` bytes is chained on when the
    /// current block cannot satisfy the request.
    pub fn alloc(&self, n: usize) -> Result<&mut [u8], ArenaError> {
        let mut blocks = self.blocks.borrow_mut();

        let needs_new = match blocks.list.last() {
            Some(block) => block.remaining() < n,
            None => true,
        };
        if needs_new {
            let cap = n.max(self.block_size);
            let block = Block::with_capacity(cap)?;
            blocks.list.push(block);
        }

        let block = blocks.list.last_mut().unwrap();
        let offset = block.used;
        // Keep the cursor 8-byte aligned for the next allocation.
        block.used += n.div_ceil(8) * 8;

        // SAFETY: `offset + n <= cap` (checked above), the buffer was
        // reserved up front and is never grown or moved, bump regions are
        // disjoint, and zeroing below initializes the bytes before a
        // reference to them exists.  The returned lifetime is tied to
        // `&self`, and mutation of the block list (`reset`/`restore`) takes
        // `&mut self`, so the region stays valid for the borrow.
        unsafe {
            let base = block.storage.as_mut_ptr() as *mut u8;
            let ptr = base.add(offset);
            std::ptr::write_bytes(ptr, 0, n);
            Ok(std::slice::from_raw_parts_mut(ptr, n))
        }
    }

    /// `alloc` with an explicit zero-fill guarantee.
    pub fn alloc_zeroed(&self, n: usize) -> Result<&mut [u8], ArenaError> {
        self.alloc(n)
    }

    /// Copies `bytes` into the arena.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> Result<&[u8], ArenaError> {
        let dst = self.alloc(bytes.len())?;
        dst.copy_from_slice(bytes);
        Ok(dst)
    }

    /// Duplicates `s` into the arena.
    ///
    /// The backing store is NUL-terminated for FFI interop; the returned
    /// `&str` excludes the terminator.
    pub fn alloc_str(&self, s: &str) -> Result<&str, ArenaError> {
        let dst = self.alloc(s.len() + 1)?;
        dst[..s.len()].copy_from_slice(s.as_bytes());
        dst[s.len()] = 0;
        // SAFETY: the first `s.len()` bytes are a verbatim copy of a `&str`.
        Ok(unsafe { std::str::from_utf8_unchecked(&dst[..s.len()]) })
    }

    /// Frees every block past the first and rewinds the first block's
    /// cursor, retaining its capacity for the next run.
    pub fn reset(&mut self) {
        let blocks = self.blocks.get_mut();
        blocks.list.truncate(1);
        if let Some(first) = blocks.list.first_mut() {
            first.used = 0;
        }
    }

    /// Records the cursor of the current block.  See [`Savepoint`] for the
    /// single-block restriction.
    pub fn savepoint(&self) -> Savepoint {
        let blocks = self.blocks.borrow();
        match blocks.list.last() {
            Some(block) => Savepoint {
                block: blocks.list.len() - 1,
                len: block.used,
            },
            None => Savepoint { block: 0, len: 0 },
        }
    }

    /// Rewinds the current block's cursor to `sp`.
    pub fn restore(&mut self, sp: Savepoint) {
        let blocks = self.blocks.get_mut();
        if blocks.list.is_empty() {
            return;
        }
        let current = blocks.list.len() - 1;
        debug_assert_eq!(
            sp.block, current,
            "savepoint crossed a block boundary; this is unsupported"
        );
        if sp.block == current {
            blocks.list[current].used = sp.len;
        }
    }

    /// Total bytes handed out (including alignment padding).
    pub fn allocated_bytes(&self) -> usize {
        self.blocks.borrow().list.iter().map(|b| b.used).sum()
    }

    /// Number of blocks in the chain.
    pub fn block_count(&self) -> usize {
        self.blocks.borrow().list.len()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
