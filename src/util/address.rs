use bytemuck::NoUninit;

use std::fmt;
use std::num::NonZeroUsize;
use std::ops::{Add, AddAssign, Sub};

/// size in bytes
pub type ByteSize = usize;

/// Address represents an arbitrary heap address.  This is designed to do
/// address arithmetic mostly in a safe way, and to mark the operations that
/// materialize references as unsafe.  The type is zero overhead, memory wise
/// and time wise.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Address(usize);

impl Address {
    /// The null address.
    pub const ZERO: Address = Address(0);

    /// Build an address from a raw pointer.
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    /// Build an address from a mutable raw pointer.
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// # Safety
    /// The caller asserts the usize is a valid address.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_aligned_to(self, align: usize) -> bool {
        self.0 % align == 0
    }

    pub fn align_up(self, align: usize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address((self.0 + align - 1) & !(align - 1))
    }

    /// # Safety
    /// The caller asserts the address points to a valid, aligned `T`.
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        debug_assert!(!self.is_zero());
        &*(self.0 as *const T)
    }

    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(self.0 >= other.0, "for (addr_a - addr_b), a needs to be larger than b");
        self.0 - other.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A reference to a collectable cell.  Never null; the address points at the
/// cell's header.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq)]
pub struct ObjectReference(NonZeroUsize);

impl ObjectReference {
    /// Convert an address to an object reference.  Returns `None` for the
    /// null address.
    pub fn from_address(addr: Address) -> Option<ObjectReference> {
        NonZeroUsize::new(addr.as_usize()).map(ObjectReference)
    }

    /// # Safety
    /// The address must be non-zero and point at a cell header.
    pub unsafe fn from_address_unchecked(addr: Address) -> ObjectReference {
        debug_assert!(!addr.is_zero());
        ObjectReference(NonZeroUsize::new_unchecked(addr.as_usize()))
    }

    /// Convert a raw word (e.g. one read out of an object slot) back to an
    /// object reference.  Returns `None` for zero.
    pub fn from_raw(raw: usize) -> Option<ObjectReference> {
        NonZeroUsize::new(raw).map(ObjectReference)
    }

    pub fn to_address(self) -> Address {
        Address(self.0.get())
    }

    pub fn to_raw(self) -> usize {
        self.0.get()
    }

    /// The cell's header.  Every object reference produced by a
    /// [`crate::space::MarkedSpace`] points at a live header.
    pub fn header(&self) -> &crate::space::CellHeader {
        unsafe { self.to_address().as_ref() }
    }

    /// The first byte of the cell's payload.
    pub fn payload(self) -> Address {
        self.to_address() + crate::space::CELL_HEADER_SIZE
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}
