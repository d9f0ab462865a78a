//! Staging buffers and output size estimates for caller-supplied data.
//!
//! Small inputs are copied into an inline fixed-size buffer, larger ones into
//! a heap buffer. Either way the copy is wiped when it drops. The threshold and
//! the estimate padding are runtime knobs; neither ever changes results.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use zeroize::{Zeroize, Zeroizing};

/// Largest input ever staged inline.
pub const MAX_INLINE_STAGING: usize = 4096;

pub const DEFAULT_MAX_STACK_ALLOC_ITEM_SIZE: usize = 2048;

/// Upper bound for the safety padding knob (1 MiB).
pub const MAX_SAFETY_PADDING: usize = 1024 * 1024;

/// Fixed JSON overhead of a data row record, excluding the partition id.
const RECORD_OVERHEAD: usize = 185;
/// Sealed-data and key overhead before base64 expansion.
const CIPHER_OVERHEAD: usize = 48;
const BASE64_EXPANSION: f64 = 1.34;

fn clamp(value: i64, max: usize) -> usize {
    usize::try_from(value.max(0)).map_or(max, |v| v.min(max))
}

/// Runtime-tunable staging threshold and estimate padding.
#[derive(Debug)]
pub struct BufferSizing {
    max_inline: AtomicUsize,
    safety_padding: AtomicUsize,
}

impl Default for BufferSizing {
    fn default() -> Self {
        Self {
            max_inline: AtomicUsize::new(DEFAULT_MAX_STACK_ALLOC_ITEM_SIZE),
            safety_padding: AtomicUsize::new(0),
        }
    }
}

impl BufferSizing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the inline staging threshold, clamped to `0..=MAX_INLINE_STAGING`.
    /// Returns the value in effect. Zero stages everything on the heap.
    pub fn set_max_stack_alloc_item_size(&self, size: i64) -> usize {
        let size = clamp(size, MAX_INLINE_STAGING);
        self.max_inline.store(size, Ordering::Relaxed);
        size
    }

    /// Sets the estimate padding, clamped to `0..=MAX_SAFETY_PADDING`.
    /// Returns the value in effect.
    pub fn set_safety_padding_overhead(&self, padding: i64) -> usize {
        let padding = clamp(padding, MAX_SAFETY_PADDING);
        self.safety_padding.store(padding, Ordering::Relaxed);
        padding
    }

    pub fn max_stack_alloc_item_size(&self) -> usize {
        self.max_inline.load(Ordering::Relaxed)
    }

    pub fn safety_padding_overhead(&self) -> usize {
        self.safety_padding.load(Ordering::Relaxed)
    }

    /// Copies `data` into a staging buffer.
    pub fn stage(&self, data: &[u8]) -> StagingBuffer {
        if data.len() < self.max_stack_alloc_item_size() {
            let mut buf = [0u8; MAX_INLINE_STAGING];
            buf[..data.len()].copy_from_slice(data);
            StagingBuffer::Inline {
                buf,
                len: data.len(),
            }
        } else {
            StagingBuffer::Heap(Zeroizing::new(data.to_vec()))
        }
    }

    /// Upper estimate of the JSON-encoded record size for `data_len` bytes of
    /// plaintext in a partition whose id is `partition_len` bytes.
    pub fn estimate_output_size(&self, data_len: usize, partition_len: usize) -> usize {
        let body = ((data_len + CIPHER_OVERHEAD) as f64 * BASE64_EXPANSION) as usize;
        RECORD_OVERHEAD + partition_len + body + self.safety_padding_overhead()
    }
}

/// A wiped-on-drop copy of caller input.
pub enum StagingBuffer {
    Inline {
        buf: [u8; MAX_INLINE_STAGING],
        len: usize,
    },
    Heap(Zeroizing<Vec<u8>>),
}

impl StagingBuffer {
    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }
}

impl Deref for StagingBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Inline { buf, len } => &buf[..*len],
            Self::Heap(bytes) => bytes.as_slice(),
        }
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        if let Self::Inline { buf, len } = self {
            buf[..*len].zeroize();
        }
    }
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("inline", &self.is_inline())
            .field("len", &self.len())
            .finish()
    }
}
