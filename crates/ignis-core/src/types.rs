//! # IGNIS Core Types
//!
//! Strongly typed addresses, sizes, handles and fence values.

use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, Sub};

// =============================================================================
// FENCES
// =============================================================================

/// Per-context completion counter assigned to every submission
pub type TaskCount = u64;

/// Backend-specific fence value returned by a submission (monitored fence)
pub type FlushStamp = u64;

/// Identifier of an engine context
pub type ContextId = u32;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// An address in the GPU's virtual address space; never dereferenced by the
/// CPU.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Align up to boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<GpuAddr> for GpuAddr {
    type Output = u64;

    fn sub(self, rhs: GpuAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// BYTE SIZE
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero bytes
    pub const ZERO: Self = Self(0);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from kilobytes
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from megabytes
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get bytes as usize
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Align up to boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 && self.0 % (1024 * 1024) == 0 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Typed opaque handle
///
/// The type parameter only exists to keep handles of different objects apart.
pub struct Handle<T> {
    raw: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create from a raw value
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Get raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.raw
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.raw)
    }
}

// =============================================================================
// DEVICE BITFIELD
// =============================================================================

/// Set of GPU tiles (sub-devices) of one root device
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct DeviceBitfield(u32);

impl DeviceBitfield {
    /// Create from a raw tile mask
    #[inline]
    pub const fn new(mask: u32) -> Self {
        Self(mask)
    }

    /// Bitfield covering the first `count` tiles
    #[inline]
    pub const fn all_tiles(count: u32) -> Self {
        if count >= 32 {
            Self(u32::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    /// Raw tile mask
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Number of tiles in the set
    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Check if a tile is part of the set
    #[inline]
    pub const fn contains(self, tile: u32) -> bool {
        tile < 32 && self.0 & (1 << tile) != 0
    }

    /// Check if more than one tile is present
    #[inline]
    pub const fn is_multi_tile(self) -> bool {
        self.count() > 1
    }
}

impl fmt::Debug for DeviceBitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceBitfield({:#b})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_addr_align() {
        let addr = GpuAddr::new(0x1001);
        assert_eq!(addr.align_up(0x1000).raw(), 0x2000);
        assert!(GpuAddr::new(0x2000).is_aligned(0x1000));
        assert_eq!(GpuAddr::new(0x3000) - GpuAddr::new(0x1000), 0x2000);
    }

    #[test]
    fn test_byte_size() {
        assert_eq!(ByteSize::from_kib(4).as_bytes(), 4096);
        assert_eq!(ByteSize::from_bytes(65).align_up(64).as_bytes(), 128);
    }

    #[test]
    fn test_device_bitfield() {
        let single = DeviceBitfield::new(0b10);
        assert_eq!(single.count(), 1);
        assert!(!single.is_multi_tile());
        assert!(single.contains(1));

        let pair = DeviceBitfield::all_tiles(2);
        assert_eq!(pair.raw(), 0b11);
        assert!(pair.is_multi_tile());
    }

    #[test]
    fn test_handle_ordering() {
        let a: Handle<u8> = Handle::from_raw(1);
        let b: Handle<u8> = Handle::from_raw(2);
        assert!(a < b);
        assert_eq!(a, Handle::from_raw(1));
    }
}
