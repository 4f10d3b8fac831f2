//! Ring allocation for per-draw vertex and index data.

use crate::error::GsError;
use crate::hal::MapMode;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0 but need not be a power of two; vertex strides
/// rarely are.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value.div_ceil(alignment).saturating_mul(alignment)
}

/// A region handed out by [`StreamBuffer::allocate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamAllocation {
    /// Byte offset of the region.
    pub offset: u32,
    /// Byte length of the region.
    pub size: u32,
    /// First element index, `offset / stride`.
    pub base_index: u32,
    /// Wrap generation the region belongs to.
    pub generation: u64,
    pub mode: MapMode,
}

impl StreamAllocation {
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// Cursor over a fixed-size native buffer that is refilled front to back.
///
/// A region never straddles the end of the buffer. When a request does not
/// fit after the cursor, the allocator restarts at offset zero, bumps its
/// generation and reports [`MapMode::Discard`] so the backend orphans the
/// storage pending GPU reads still use.
#[derive(Clone, Debug)]
pub struct StreamBuffer {
    what: &'static str,
    capacity: u32,
    cursor: u32,
    generation: u64,
}

impl StreamBuffer {
    pub fn new(what: &'static str, capacity: u32) -> Self {
        Self {
            what,
            capacity,
            cursor: 0,
            generation: 0,
        }
    }

    pub fn what(&self) -> &'static str {
        self.what
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Next free byte.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Number of wraps so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn allocate(&mut self, stride: u32, count: u32) -> Result<StreamAllocation, GsError> {
        assert!(stride > 0, "{} allocation with zero stride", self.what);

        let size = u64::from(stride) * u64::from(count);
        let capacity = u64::from(self.capacity);
        if size > capacity {
            return Err(GsError::CapacityExceeded {
                what: self.what,
                requested: size,
                capacity,
            });
        }

        let mut offset = align_up(u64::from(self.cursor), u64::from(stride));
        let mut mode = MapMode::NoOverwrite;
        if offset + size > capacity {
            offset = 0;
            mode = MapMode::Discard;
            self.generation += 1;
        }

        // Both fit in u32: size <= capacity and offset + size <= capacity.
        let offset = offset as u32;
        let size = size as u32;
        self.cursor = offset + size;

        Ok(StreamAllocation {
            offset,
            size,
            base_index: offset / stride,
            generation: self.generation,
            mode,
        })
    }
}

/// Most quads one 16-bit indexed draw can address.
pub const MAX_QUADS_PER_DRAW: usize = (u16::MAX as usize + 1) / 4;

/// Index pattern drawing `quads` four-vertex quads as two triangles each.
///
/// `quads` must not exceed [`MAX_QUADS_PER_DRAW`].
pub fn expansion_indices(quads: usize) -> Vec<u16> {
    debug_assert!(quads <= MAX_QUADS_PER_DRAW, "{quads} quads overflow 16-bit indices");
    let mut indices = Vec::with_capacity(quads * 6);
    for quad in 0..quads {
        let base = (quad * 4) as u16;
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 1, base + 2, base + 3]);
    }
    indices
}

/// Number of quads whose expansion indices fit in `bytes`.
pub fn expansion_quads_for_size(bytes: u32) -> usize {
    bytes as usize / (6 * std::mem::size_of::<u16>())
}

/// Triangle-strip indices joining `rects` quads with degenerate triangles.
///
/// Each quad after the first repeats its first vertex and every quad repeats
/// its last, which yields `6n - 1` indices for `n` quads without needing
/// primitive restart. `rects` must not exceed [`MAX_QUADS_PER_DRAW`].
pub fn multi_rect_strip_indices(rects: usize) -> Vec<u16> {
    debug_assert!(rects <= MAX_QUADS_PER_DRAW, "{rects} rects overflow 16-bit indices");
    let mut indices = Vec::with_capacity((rects * 6).saturating_sub(1));
    for rect in 0..rects {
        let vstart = (rect * 4) as u16;
        if rect > 0 {
            indices.push(vstart);
        }
        indices.extend_from_slice(&[vstart, vstart + 1, vstart + 2, vstart + 3, vstart + 3]);
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn consecutive_allocations_do_not_overlap() {
        let mut stream = StreamBuffer::new("vertex stream", 1024);
        let a = stream.allocate(32, 4).unwrap();
        let b = stream.allocate(32, 8).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(a.mode, MapMode::NoOverwrite);
        assert!(a.end() <= b.offset);
        assert_eq!(b.base_index, 4);
    }

    #[test]
    fn cursor_is_aligned_to_stride() {
        let mut stream = StreamBuffer::new("vertex stream", 1024);
        stream.allocate(2, 3).unwrap();
        let alloc = stream.allocate(32, 1).unwrap();
        assert_eq!(alloc.offset, 32);
        assert_eq!(alloc.base_index, 1);
        assert_eq!(stream.cursor(), 64);
    }

    #[test]
    fn overflow_restarts_at_zero_with_discard() {
        let mut stream = StreamBuffer::new("vertex stream", 256);
        stream.allocate(32, 6).unwrap();
        let wrapped = stream.allocate(32, 4).unwrap();
        assert_eq!(wrapped.offset, 0);
        assert_eq!(wrapped.mode, MapMode::Discard);
        assert_eq!(wrapped.generation, 1);
        assert_eq!(stream.generation(), 1);

        let next = stream.allocate(32, 1).unwrap();
        assert_eq!(next.offset, 128);
        assert_eq!(next.generation, 1);
    }

    #[test]
    fn exact_fit_does_not_wrap() {
        let mut stream = StreamBuffer::new("index stream", 64);
        stream.allocate(2, 16).unwrap();
        let alloc = stream.allocate(2, 16).unwrap();
        assert_eq!(alloc.offset, 32);
        assert_eq!(alloc.mode, MapMode::NoOverwrite);
        assert_eq!(alloc.end(), 64);
    }

    #[test]
    fn requests_larger_than_capacity_fail() {
        let mut stream = StreamBuffer::new("index stream", 64);
        let err = stream.allocate(2, 33).unwrap_err();
        assert!(matches!(
            err,
            GsError::CapacityExceeded {
                requested: 66,
                capacity: 64,
                ..
            }
        ));
        assert_eq!(stream.cursor(), 0);
    }

    #[test]
    fn regions_always_fit_inside_the_buffer() {
        let mut stream = StreamBuffer::new("vertex stream", 1000);
        for (stride, count) in [(24, 7), (32, 30), (12, 50), (32, 1), (28, 35), (36, 27)] {
            let alloc = stream.allocate(stride, count).unwrap();
            assert!(alloc.end() <= 1000);
            assert_eq!(alloc.offset % stride, 0);
        }
    }

    #[test]
    fn expansion_pattern() {
        assert_eq!(expansion_indices(2), vec![0, 1, 2, 1, 2, 3, 4, 5, 6, 5, 6, 7]);
        assert_eq!(expansion_quads_for_size(crate::config::EXPAND_INDEX_BUFFER_SIZE), 16383);
    }

    #[test]
    fn largest_batch_reaches_the_last_16_bit_index() {
        assert_eq!(multi_rect_strip_indices(MAX_QUADS_PER_DRAW).last(), Some(&u16::MAX));
        assert_eq!(expansion_indices(MAX_QUADS_PER_DRAW).last(), Some(&u16::MAX));
    }

    #[test]
    fn multi_rect_strip_pattern() {
        assert_eq!(multi_rect_strip_indices(1), vec![0, 1, 2, 3, 3]);
        assert_eq!(
            multi_rect_strip_indices(2),
            vec![0, 1, 2, 3, 3, 4, 4, 5, 6, 7, 7]
        );
        assert_eq!(multi_rect_strip_indices(3).len(), 3 * 6 - 1);
    }
}
