//! Implementation of the Memory System for the kernel.

pub mod arena;
pub mod buddy;
pub mod heap;
pub mod list;
pub mod supplier;

use crate::unit::{self, KIB};
use core::fmt;
use displaydoc_lite::displaydoc;

/// The size of a single physical frame.
///
/// This is also the order-0 size inside the buddy allocator.
pub const FRAME_SIZE: usize = 4 * KIB;

/// Result for every memory allocation operation.
pub type Result<T, E = Error> = core::result::Result<T, E>;

displaydoc! {
    /// Any error that can happen while allocating or deallocating memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Error {
        /// tried to allocate zero bytes.
        ZeroSize,
        /// alignment is not a power of two or exceeds the maximum alignment.
        InvalidAlignment,
        /// tried to allocate an order that exceeded the maximum order.
        OrderTooLarge,
        /// the allocator configuration is inconsistent.
        InvalidConfig,
        /// tried to allocate, but there was no free memory left.
        NoMemoryAvailable,
        /// the frame does not belong to this allocator or is already free.
        InvalidFrame,
        /// the pointer was not allocated by this heap or is already free.
        InvalidPointer,
        /// a page supplier returned a region that is not properly aligned.
        MisalignedRegion,
    }
}

impl Error {
    /// Returns `true` if this error was caused by running out of memory.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::NoMemoryAvailable)
    }

    /// Returns `true` if this error was caused by an invalid argument,
    /// in which case the allocator state was left untouched.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Error::ZeroSize | Error::InvalidAlignment | Error::OrderTooLarge | Error::InvalidConfig
        )
    }
}

/// Statistics for a memory allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocStats {
    /// The name of the allocator that collected these stats.
    pub name: &'static str,
    /// The number of bytes that are currently handed out.
    pub allocated: usize,
    /// The number of bytes that are left for allocation.
    pub free: usize,
    /// The total number of bytes that this allocator manages.
    pub total: usize,
}

impl AllocStats {
    /// Create a new [`AllocStats`] instance for the given allocator name.
    pub const fn with_name(name: &'static str) -> Self {
        Self {
            name,
            allocated: 0,
            free: 0,
            total: 0,
        }
    }
}

impl fmt::Display for AllocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        self.name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f, "\nAllocated: {}", unit::bytes(self.allocated))?;
        writeln!(f, "Free: {}", unit::bytes(self.free))?;
        writeln!(f, "Total: {}", unit::bytes(self.total))?;
        self.name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f)?;
        Ok(())
    }
}

/// Aligns the given `addr` upwards to `align`.
///
/// Returns `None` if the result would overflow.
/// `align` must be a power of two.
pub fn align_up(addr: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(addr.checked_add(align - 1)? & !(align - 1))
}

/// Aligns the given `addr` downwards to `align`.
///
/// `align` must be a power of two.
pub fn align_down(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(32, 16), Some(32));
        assert_eq!(align_up(usize::MAX, 16), None);
        assert_eq!(align_down(4097, FRAME_SIZE), FRAME_SIZE);
    }

    #[test]
    fn error_classes() {
        assert!(Error::NoMemoryAvailable.is_out_of_memory());
        assert!(Error::ZeroSize.is_invalid_argument());
        assert!(Error::InvalidAlignment.is_invalid_argument());
        assert!(!Error::InvalidPointer.is_invalid_argument());
        assert!(Error::NoMemoryAvailable
            .to_string()
            .contains("there was no free memory left"));
    }

    #[test]
    fn stats_display() {
        let stats = AllocStats {
            name: "Test",
            allocated: 4 * KIB,
            free: 512,
            total: 4 * KIB + 512,
        };
        let out = stats.to_string();
        assert!(out.starts_with("Test\n~~~~\n"));
        assert!(out.contains("Allocated: 4.00 KiB"));
        assert!(out.contains("Free: 512 B"));
    }
}
