//! # Surface State Descriptors
//!
//! RENDER_SURFACE_STATE encoding into and out of a surface-state heap.
//!
//! Descriptors are plain values; the heap is plain bytes. Layout of the
//! 16 dwords:
//!
//! ```text
//! dw0   [31:29] surface type
//! dw2   [6:0]   width        [29:16] height
//! dw3   [31:0]  surface pitch
//! dw4   [10:0]  depth
//! dw8   [31:0]  base address low
//! dw9   [31:0]  base address high
//! ```

use bytemuck::{Pod, Zeroable};
use ignis_core::{Error, GpuAddr, Result};

/// Size of one encoded descriptor
pub const RENDER_SURFACE_STATE_SIZE: usize = core::mem::size_of::<RenderSurfaceState>();

// =============================================================================
// SURFACE TYPE
// =============================================================================

/// RENDER_SURFACE_STATE surface type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceType {
    /// Linear buffer
    Buffer,
    /// Per-thread scratch
    Scratch,
    /// Null surface
    Null,
}

impl SurfaceType {
    const fn encode(self) -> u32 {
        match self {
            Self::Buffer => 4,
            Self::Scratch => 6,
            Self::Null => 7,
        }
    }

    fn decode(raw: u32) -> Result<Self> {
        match raw {
            4 => Ok(Self::Buffer),
            6 => Ok(Self::Scratch),
            7 => Ok(Self::Null),
            _ => Err(Error::InvalidCommand),
        }
    }
}

// =============================================================================
// RAW LAYOUT
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RenderSurfaceState {
    dwords: [u32; 16],
}

// =============================================================================
// DESCRIPTOR
// =============================================================================

/// Decoded surface-state descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceStateDescriptor {
    /// Surface type
    pub surface_type: SurfaceType,
    /// Base GPU address
    pub base_address: GpuAddr,
    /// Width field (bits 0..7 of the buffer length)
    pub width: u32,
    /// Height field (bits 7..21 of the buffer length)
    pub height: u32,
    /// Depth field (bits 21..32 of the buffer length)
    pub depth: u32,
    /// Surface pitch
    pub pitch: u32,
}

impl SurfaceStateDescriptor {
    /// Scratch descriptor spanning `length + 1` threads of `pitch` bytes
    pub fn scratch(base_address: GpuAddr, length: u32, pitch: u32) -> Self {
        Self {
            surface_type: SurfaceType::Scratch,
            base_address,
            width: length & 0x7F,
            height: (length >> 7) & 0x3FFF,
            depth: (length >> 21) & 0x7FF,
            pitch,
        }
    }

    /// Null descriptor
    pub fn null() -> Self {
        Self {
            surface_type: SurfaceType::Null,
            base_address: GpuAddr::null(),
            width: 0,
            height: 0,
            depth: 0,
            pitch: 0,
        }
    }

    /// Buffer length recombined from width, height and depth
    pub fn length(&self) -> u32 {
        self.width | (self.height << 7) | (self.depth << 21)
    }

    fn to_raw(self) -> RenderSurfaceState {
        let mut raw = RenderSurfaceState::zeroed();
        raw.dwords[0] = self.surface_type.encode() << 29;
        raw.dwords[2] = (self.width & 0x7F) | ((self.height & 0x3FFF) << 16);
        raw.dwords[3] = self.pitch;
        raw.dwords[4] = self.depth & 0x7FF;
        raw.dwords[8] = self.base_address.raw() as u32;
        raw.dwords[9] = (self.base_address.raw() >> 32) as u32;
        raw
    }

    fn from_raw(raw: &RenderSurfaceState) -> Result<Self> {
        Ok(Self {
            surface_type: SurfaceType::decode(raw.dwords[0] >> 29)?,
            base_address: GpuAddr::new(raw.dwords[8] as u64 | ((raw.dwords[9] as u64) << 32)),
            width: raw.dwords[2] & 0x7F,
            height: (raw.dwords[2] >> 16) & 0x3FFF,
            depth: raw.dwords[4] & 0x7FF,
            pitch: raw.dwords[3],
        })
    }

    /// Encode at `offset` of `heap`
    pub fn encode_into(&self, heap: &mut [u8], offset: usize) -> Result<()> {
        let end = offset
            .checked_add(RENDER_SURFACE_STATE_SIZE)
            .ok_or(Error::BufferOverflow)?;
        let slot = heap.get_mut(offset..end).ok_or(Error::BufferOverflow)?;
        slot.copy_from_slice(bytemuck::bytes_of(&self.to_raw()));
        Ok(())
    }

    /// Decode the descriptor at `offset` of `heap`
    pub fn decode(heap: &[u8], offset: usize) -> Result<Self> {
        let end = offset
            .checked_add(RENDER_SURFACE_STATE_SIZE)
            .ok_or(Error::BufferOverflow)?;
        let slot = heap.get(offset..end).ok_or(Error::BufferOverflow)?;
        let raw: RenderSurfaceState = bytemuck::pod_read_unaligned(slot);
        Self::from_raw(&raw)
    }
}

// =============================================================================
// SURFACE STATE HEAP
// =============================================================================

/// Writable surface-state heap identified by its GPU base address
#[derive(Debug)]
pub struct SurfaceStateHeap<'a> {
    base: GpuAddr,
    bytes: &'a mut [u8],
}

impl<'a> SurfaceStateHeap<'a> {
    /// Wrap heap memory
    pub fn new(base: GpuAddr, bytes: &'a mut [u8]) -> Self {
        Self { base, bytes }
    }

    /// GPU base address
    pub fn base(&self) -> GpuAddr {
        self.base
    }

    /// Heap size in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the heap has no memory
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Write a descriptor
    pub fn write(&mut self, offset: usize, descriptor: &SurfaceStateDescriptor) -> Result<()> {
        descriptor.encode_into(self.bytes, offset)
    }

    /// Read a descriptor
    pub fn read(&self, offset: usize) -> Result<SurfaceStateDescriptor> {
        SurfaceStateDescriptor::decode(self.bytes, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_descriptor_size() {
        assert_eq!(RENDER_SURFACE_STATE_SIZE, 64);
    }

    #[test]
    fn test_scratch_length_split() {
        let descriptor = SurfaceStateDescriptor::scratch(GpuAddr::new(0x1000), 1023, 0x40);
        assert_eq!(descriptor.width, 1023 & 0x7F);
        assert_eq!(descriptor.height, 1023 >> 7);
        assert_eq!(descriptor.depth, 0);
        assert_eq!(descriptor.length(), 1023);

        let large = SurfaceStateDescriptor::scratch(GpuAddr::null(), (1 << 21) + 5, 0);
        assert_eq!(large.depth, 1);
        assert_eq!(large.length(), (1 << 21) + 5);
    }

    #[test]
    fn test_heap_encoding_is_positional() {
        let mut bytes = vec![0u8; 256];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x8000), &mut bytes);
        let descriptor =
            SurfaceStateDescriptor::scratch(GpuAddr::new(0x1_2345_6000), 2047, 0x1000);

        heap.write(128, &descriptor).unwrap();
        assert_eq!(heap.read(128).unwrap(), descriptor);
        assert_eq!(heap.read(128).unwrap().base_address.raw(), 0x1_2345_6000);

        // untouched slots still decode as zeroed, which is not a valid type
        assert_eq!(heap.read(0).unwrap_err(), Error::InvalidCommand);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut bytes = vec![0u8; 100];
        let mut heap = SurfaceStateHeap::new(GpuAddr::null(), &mut bytes);
        assert_eq!(
            heap.write(64, &SurfaceStateDescriptor::null()).unwrap_err(),
            Error::BufferOverflow
        );
        assert!(heap.write(0, &SurfaceStateDescriptor::null()).is_ok());
        assert_eq!(heap.read(0).unwrap(), SurfaceStateDescriptor::null());
    }
}
