//! # Linear Streams and Indirect Heaps
//!
//! CPU-side views of command and state memory. A [`LinearStream`] is written
//! front to back; its bytes mirror the backing allocation.

use alloc::vec;
use alloc::vec::Vec;

use ignis_core::{Error, GpuAddr, Result};
use ignis_mem::AllocationRef;

use crate::surface_state::SurfaceStateHeap;

// =============================================================================
// LINEAR STREAM
// =============================================================================

/// Append-only command buffer
#[derive(Debug, Default)]
pub struct LinearStream {
    allocation: Option<AllocationRef>,
    buffer: Vec<u8>,
    used: usize,
}

impl LinearStream {
    /// Create a stream over an allocation
    pub fn new(allocation: AllocationRef) -> Self {
        let size = allocation.size().as_usize();
        Self {
            allocation: Some(allocation),
            buffer: vec![0; size],
            used: 0,
        }
    }

    /// Backing allocation
    pub fn allocation(&self) -> Option<&AllocationRef> {
        self.allocation.as_ref()
    }

    /// GPU address of the first byte
    pub fn gpu_base(&self) -> GpuAddr {
        self.allocation
            .as_ref()
            .map_or(GpuAddr::null(), |a| a.gpu_addr())
    }

    /// GPU address of a byte offset
    pub fn gpu_address_at(&self, offset: usize) -> GpuAddr {
        self.gpu_base() + offset as u64
    }

    /// Bytes written so far
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total size
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes still free
    pub fn available(&self) -> usize {
        self.buffer.len() - self.used
    }

    /// Reserve `size` bytes at the write offset
    pub fn get_space(&mut self, size: usize) -> Result<&mut [u8]> {
        if size > self.available() {
            return Err(Error::CommandBufferFull);
        }
        let start = self.used;
        self.used += size;
        Ok(&mut self.buffer[start..start + size])
    }

    /// Append little-endian dwords
    pub fn write_dwords(&mut self, dwords: &[u32]) -> Result<()> {
        let space = self.get_space(dwords.len() * 4)?;
        for (chunk, dword) in space.chunks_exact_mut(4).zip(dwords) {
            chunk.copy_from_slice(&dword.to_le_bytes());
        }
        Ok(())
    }

    /// Overwrite already written bytes
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset.checked_add(bytes.len()).ok_or(Error::BufferOverflow)?;
        if end > self.used {
            return Err(Error::BufferOverflow);
        }
        self.buffer[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Written bytes
    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..self.used]
    }

    /// Written bytes in `[start, end)`
    pub fn bytes_range(&self, start: usize, end: usize) -> Result<&[u8]> {
        if start > end || end > self.used {
            return Err(Error::BufferOverflow);
        }
        Ok(&self.buffer[start..end])
    }

    /// Move the write offset back (drop everything after `offset`)
    pub fn rewind(&mut self, offset: usize) {
        if offset < self.used {
            self.buffer[offset..self.used].fill(0);
            self.used = offset;
        }
    }

    /// Whole buffer, including the unwritten tail
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

// =============================================================================
// INDIRECT HEAP
// =============================================================================

/// Indirect heap kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// Dynamic state (samplers, interface descriptors)
    DynamicState,
    /// Indirect object data (cross-thread data)
    IndirectObject,
    /// Surface state (binding tables, RENDER_SURFACE_STATE)
    SurfaceState,
}

/// State heap referenced through STATE_BASE_ADDRESS
#[derive(Debug)]
pub struct IndirectHeap {
    heap_type: HeapType,
    stream: LinearStream,
}

impl IndirectHeap {
    /// Create a heap over an allocation
    pub fn new(heap_type: HeapType, allocation: AllocationRef) -> Self {
        Self {
            heap_type,
            stream: LinearStream::new(allocation),
        }
    }

    /// Heap type
    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    /// Base address programmed in STATE_BASE_ADDRESS
    pub fn base_address(&self) -> GpuAddr {
        self.stream.gpu_base()
    }

    /// Backing allocation
    pub fn allocation(&self) -> Option<&AllocationRef> {
        self.stream.allocation()
    }

    /// Bytes consumed
    pub fn used(&self) -> usize {
        self.stream.used()
    }

    /// Total size
    pub fn capacity(&self) -> usize {
        self.stream.capacity()
    }

    /// Reserve `size` bytes aligned to `alignment`, returning the heap offset
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<usize> {
        let aligned = (self.stream.used() + alignment - 1) & !(alignment - 1);
        let padding = aligned - self.stream.used();
        self.stream.get_space(padding + size)?;
        Ok(aligned)
    }

    /// Descriptor view over the whole heap
    pub fn surface_state_heap(&mut self) -> SurfaceStateHeap<'_> {
        let base = self.stream.gpu_base();
        SurfaceStateHeap::new(base, self.stream.as_mut_slice())
    }
}
