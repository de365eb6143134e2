//! Registered byte buffers.
//!
//! A [`Buffer`] is a contiguous range of memory registered with a device for local write,
//! remote read and remote write. It comes in three flavors:
//!
//! 1. **Allocated** (`Buffer::new`): page-aligned, zeroed memory owned and registered by
//!    the buffer. Dropping it deregisters and frees.
//! 2. **Carved** (`Buffer::from_registered`): a window into a [`RegisteredMemory`] slab,
//!    sharing the slab's keys. It owns neither memory nor registration and keeps the slab
//!    alive.
//! 3. **External** (`Buffer::from_raw_parts`): caller-owned memory registered by the
//!    buffer. Dropping it deregisters but does not free.
//!
//! Buffers must not move while the device may access them; all three flavors keep the
//! bytes behind a raw pointer that never changes outside of `resize`.
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use anyhow::anyhow;

use crate::config::PAGE_SIZE;
use crate::context::Context;
use crate::device::Device;
use crate::error::Error;
use crate::error::RegionSide;
use crate::error::Result;
use crate::primitives::AccessFlags;
use crate::primitives::MemoryRegistration;
use crate::region::Region;
use crate::region::RegionKind;
use crate::region::check_range;

/// Page-aligned, zero-initialized heap memory.
#[derive(Debug)]
struct PageAllocation {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl PageAllocation {
    fn zeroed(size: u64) -> Result<Self> {
        let length = usize::try_from(size)
            .map_err(|_| anyhow!("Cannot allocate {} bytes on this platform", size))?;
        let layout = Layout::from_size_align(length.max(1), PAGE_SIZE)
            .map_err(|e| anyhow!("Cannot align buffer of {} bytes: {}", size, e))?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| anyhow!("Cannot allocate and align buffer of {} bytes", size))?;
        Ok(Self { ptr, layout })
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for PageAllocation {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Registers `[ptr, ptr + size)` with `device`.
///
/// # Safety
///
/// The memory must stay valid until the registration is released.
unsafe fn register(
    device: &Arc<dyn Device>,
    ptr: *mut u8,
    size: u64,
    access: AccessFlags,
) -> Result<MemoryRegistration> {
    let length = usize::try_from(size).map_err(|_| Error::TransferTooLarge(size))?;
    // SAFETY: guaranteed by the caller.
    unsafe { device.register_memory(ptr as u64, length, access) }
}

/// A registered slab that buffers can be carved out of.
///
/// # Safety
///
/// `RegisteredMemory` hands out raw pointers into its memory; the device and the buffers
/// carved from it may access the bytes concurrently with the application.
#[derive(Debug)]
pub struct RegisteredMemory {
    device: Arc<dyn Device>,
    ptr: *mut u8,
    size: u64,
    registration: MemoryRegistration,
    // Dropped after the registration is released in `Drop`.
    _allocation: Option<PageAllocation>,
}

// SAFETY: the raw pointer refers to memory owned by this struct or pinned by the caller
// of `from_raw_parts`; concurrent access is arbitrated by the RDMA operations themselves.
unsafe impl Send for RegisteredMemory {}

// SAFETY: see `Send`; the struct exposes no interior mutation of its own fields.
unsafe impl Sync for RegisteredMemory {}

impl RegisteredMemory {
    /// Allocates and registers `size` zeroed, page-aligned bytes.
    pub fn new(context: &Context, size: u64) -> Result<Arc<Self>> {
        let allocation = PageAllocation::zeroed(size)?;
        let device = context.device().clone();
        // SAFETY: the allocation is owned by the returned value and outlives the registration.
        let registration =
            unsafe { register(&device, allocation.as_ptr(), size, AccessFlags::buffer())? };
        Ok(Arc::new(Self {
            device,
            ptr: allocation.as_ptr(),
            size,
            registration,
            _allocation: Some(allocation),
        }))
    }

    /// Registers memory owned by the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `size` bytes that stay valid and unmoved for the lifetime of the
    /// returned value and of every buffer carved from it.
    pub unsafe fn from_raw_parts(context: &Context, ptr: *mut u8, size: u64) -> Result<Arc<Self>> {
        let device = context.device().clone();
        // SAFETY: guaranteed by the caller.
        let registration = unsafe { register(&device, ptr, size, AccessFlags::buffer())? };
        Ok(Arc::new(Self {
            device,
            ptr,
            size,
            registration,
            _allocation: None,
        }))
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn registration(&self) -> MemoryRegistration {
        self.registration
    }
}

impl Drop for RegisteredMemory {
    fn drop(&mut self) {
        self.device.deregister_memory(&self.registration);
    }
}

/// A registered, contiguous byte range usable as the local side of any operation.
#[derive(Debug)]
pub struct Buffer {
    device: Arc<dyn Device>,
    ptr: *mut u8,
    size: u64,
    registration: MemoryRegistration,
    owns_registration: bool,
    allocation: Option<PageAllocation>,
    _parent: Option<Arc<RegisteredMemory>>,
}

// SAFETY: the pointer refers to memory owned by the buffer, by its parent slab, or pinned
// by the caller of `from_raw_parts`. Data races with the device are inherent to RDMA and
// are ordered by completions.
unsafe impl Send for Buffer {}

// SAFETY: shared references only read the fields; the bytes themselves are exposed through
// `&mut self` or raw pointers.
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocates and registers `size` zeroed, page-aligned bytes.
    pub fn new(context: &Context, size: u64) -> Result<Self> {
        Self::allocate(context.device().clone(), size)
    }

    pub(crate) fn allocate(device: Arc<dyn Device>, size: u64) -> Result<Self> {
        let allocation = PageAllocation::zeroed(size)?;
        // SAFETY: the allocation is owned by the buffer and outlives the registration.
        let registration =
            unsafe { register(&device, allocation.as_ptr(), size, AccessFlags::buffer())? };
        Ok(Self {
            device,
            ptr: allocation.as_ptr(),
            size,
            registration,
            owns_registration: true,
            allocation: Some(allocation),
            _parent: None,
        })
    }

    /// A buffer over `size` bytes of `memory` starting at `offset`, using its keys.
    pub fn from_registered(memory: &Arc<RegisteredMemory>, offset: u64, size: u64) -> Result<Self> {
        check_range(RegionSide::Local, memory.size, offset, size)?;
        Ok(Self {
            device: memory.device.clone(),
            // SAFETY: offset + size lies within the slab.
            ptr: unsafe { memory.ptr.add(offset as usize) },
            size,
            registration: memory.registration,
            owns_registration: false,
            allocation: None,
            _parent: Some(memory.clone()),
        })
    }

    /// Registers memory owned by the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `size` bytes that stay valid and unmoved for the lifetime of the
    /// buffer.
    pub unsafe fn from_raw_parts(context: &Context, ptr: *mut u8, size: u64) -> Result<Self> {
        let device = context.device().clone();
        // SAFETY: guaranteed by the caller.
        let registration = unsafe { register(&device, ptr, size, AccessFlags::buffer())? };
        Ok(Self {
            device,
            ptr,
            size,
            registration,
            owns_registration: true,
            allocation: None,
            _parent: None,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Returns the bytes of the buffer.
    ///
    /// Bytes written by the device are only guaranteed visible after the operation that
    /// wrote them has completed.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for size bytes for the lifetime of the buffer.
        unsafe { std::slice::from_raw_parts(self.ptr, self.size as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for size bytes for the lifetime of the buffer.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size as usize) }
    }

    /// Whether the buffer frees its memory on drop.
    pub fn is_memory_allocated(&self) -> bool {
        self.allocation.is_some()
    }

    /// Whether the buffer deregisters its memory on drop.
    pub fn is_memory_registered(&self) -> bool {
        self.owns_registration
    }

    /// Grows or shrinks the buffer, re-registering it.
    ///
    /// Allocated buffers move to a fresh allocation holding the first `min(old, new)`
    /// bytes; external buffers can only shrink in place. Fails with
    /// [`Error::NotRegistrationOwner`] for buffers carved from a [`RegisteredMemory`].
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        if !self.owns_registration {
            return Err(Error::NotRegistrationOwner);
        }
        if self.allocation.is_none() {
            if new_size > self.size {
                return Err(Error::Other(anyhow!(
                    "Cannot grow caller-owned memory from {} to {} bytes without new memory",
                    self.size,
                    new_size
                )));
            }
            // SAFETY: the new range is a prefix of the memory already pinned by the caller.
            return unsafe { self.reregister(self.ptr, new_size) };
        }
        let allocation = PageAllocation::zeroed(new_size)?;
        // SAFETY: both ranges are valid for at least min(old, new) bytes and do not overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr,
                allocation.as_ptr(),
                self.size.min(new_size) as usize,
            );
        }
        // SAFETY: the allocation is moved into the buffer below.
        unsafe { self.reregister(allocation.as_ptr(), new_size)? };
        self.allocation = Some(allocation);
        Ok(())
    }

    /// Moves the buffer onto caller-owned memory of `new_size` bytes, copying the first
    /// `min(old, new)` bytes when the address changes.
    ///
    /// Passing the current address re-registers in place. An allocated buffer keeps its
    /// allocation in that case and cannot grow past it.
    ///
    /// # Safety
    ///
    /// `new_ptr` must point to `new_size` bytes that stay valid and unmoved for the
    /// lifetime of the buffer, and must not overlap the current memory unless it is the
    /// same address.
    pub unsafe fn resize_with_memory(&mut self, new_ptr: *mut u8, new_size: u64) -> Result<()> {
        if !self.owns_registration {
            return Err(Error::NotRegistrationOwner);
        }
        if new_ptr == self.ptr {
            if let Some(allocation) = &self.allocation {
                let capacity = allocation.layout.size() as u64;
                if new_size > capacity {
                    return Err(Error::Other(anyhow!(
                        "Cannot grow allocated buffer of {} bytes to {} bytes in place",
                        capacity,
                        new_size
                    )));
                }
            }
            // SAFETY: the range lies in the buffer's own allocation or is guaranteed by
            // the caller.
            return unsafe { self.reregister(new_ptr, new_size) };
        }

        // SAFETY: guaranteed by the caller.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr, new_ptr, self.size.min(new_size) as usize);
            self.reregister(new_ptr, new_size)?;
        }
        self.allocation = None;
        Ok(())
    }

    /// Registers the new range and releases the old registration. The caller replaces
    /// the allocation afterwards, if the memory moved.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `size` bytes for the lifetime of the buffer.
    unsafe fn reregister(&mut self, ptr: *mut u8, size: u64) -> Result<()> {
        // SAFETY: guaranteed by the caller.
        let registration = unsafe { register(&self.device, ptr, size, AccessFlags::buffer())? };
        self.device.deregister_memory(&self.registration);
        tracing::debug!(
            "re-registered buffer from {} to {} bytes at 0x{:x}",
            self.size,
            size,
            ptr as u64
        );
        self.registration = registration;
        self.ptr = ptr;
        self.size = size;
        Ok(())
    }
}

impl Region for Buffer {
    fn kind(&self) -> RegionKind {
        RegionKind::Buffer
    }

    fn size_in_bytes(&self) -> u64 {
        self.size
    }

    fn address(&self) -> u64 {
        self.ptr as u64
    }

    fn local_key(&self) -> u32 {
        self.registration.local_key
    }

    fn remote_key(&self) -> u32 {
        self.registration.remote_key
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.owns_registration {
            self.device.deregister_memory(&self.registration);
        }
        // The allocation, if any, is freed when the field drops.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft_device::SoftFabric;

    fn device() -> Arc<dyn Device> {
        SoftFabric::new().open_device("buffer_test")
    }

    #[test]
    fn test_allocated_buffer_is_zeroed_and_aligned() {
        let buffer = Buffer::allocate(device(), 4096 * 3).unwrap();
        assert_eq!(buffer.size_in_bytes(), 4096 * 3);
        assert_eq!(buffer.address() % PAGE_SIZE as u64, 0);
        assert!(buffer.as_slice().iter().all(|byte| *byte == 0));
        assert!(buffer.is_memory_allocated());
        assert!(buffer.is_memory_registered());
        assert_eq!(buffer.kind(), RegionKind::Buffer);
    }

    #[test]
    fn test_create_token_range() {
        let buffer = Buffer::allocate(device(), 1024).unwrap();
        let token = buffer.create_token_range(100, 200).unwrap();
        assert_eq!(token.address(), buffer.address() + 100);
        assert_eq!(token.remaining_size_in_bytes(0), 200);
        assert_eq!(token.remote_key(), buffer.remote_key());

        let tail = buffer.create_token_from(1000).unwrap();
        assert_eq!(tail.size_in_bytes(), 24);
        assert!(buffer.create_token_range(1000, 25).is_err());
        assert!(buffer.create_token_from(2000).is_err());
    }

    #[test]
    fn test_resize_keeps_prefix() {
        let mut buffer = Buffer::allocate(device(), 16).unwrap();
        buffer.as_mut_slice().copy_from_slice(&[5u8; 16]);
        let old_key = buffer.local_key();

        buffer.resize(64).unwrap();
        assert_eq!(buffer.size_in_bytes(), 64);
        assert_eq!(&buffer.as_slice()[..16], &[5u8; 16]);
        assert!(buffer.as_slice()[16..].iter().all(|byte| *byte == 0));
        assert_ne!(buffer.local_key(), old_key);

        buffer.resize(8).unwrap();
        assert_eq!(buffer.as_slice(), &[5u8; 8]);
    }

    #[test]
    fn test_resize_in_place_keeps_allocation() {
        let mut buffer = Buffer::allocate(device(), 8192).unwrap();
        buffer.as_mut_slice().fill(3);
        let ptr = buffer.as_ptr();
        let old_key = buffer.local_key();

        // SAFETY: the buffer's own allocation backs the range.
        unsafe { buffer.resize_with_memory(ptr, 8192).unwrap() };
        assert!(buffer.is_memory_allocated());
        assert_eq!(buffer.as_ptr(), ptr);
        assert_ne!(buffer.local_key(), old_key);
        assert!(buffer.as_slice().iter().all(|byte| *byte == 3));

        // SAFETY: as above.
        unsafe { buffer.resize_with_memory(ptr, 4096).unwrap() };
        assert_eq!(buffer.size_in_bytes(), 4096);
        // SAFETY: as above.
        unsafe { buffer.resize_with_memory(ptr, 8192).unwrap() };
        assert_eq!(buffer.size_in_bytes(), 8192);
        assert!(buffer.as_slice().iter().all(|byte| *byte == 3));

        let key = buffer.local_key();
        // SAFETY: rejected before any access past the allocation.
        assert!(unsafe { buffer.resize_with_memory(ptr, 8193) }.is_err());
        assert_eq!(buffer.local_key(), key);
        assert_eq!(buffer.size_in_bytes(), 8192);
    }

    #[test]
    fn test_resize_onto_new_memory_releases_allocation() {
        let mut buffer = Buffer::allocate(device(), 64).unwrap();
        buffer.as_mut_slice().fill(4);
        let mut target = vec![0u8; 32];

        // SAFETY: `target` outlives the buffer and does not overlap it.
        unsafe { buffer.resize_with_memory(target.as_mut_ptr(), 32).unwrap() };
        assert!(!buffer.is_memory_allocated());
        assert_eq!(buffer.as_ptr(), target.as_mut_ptr());
        assert!(buffer.as_slice().iter().all(|byte| *byte == 4));
        drop(buffer);
    }

    #[test]
    fn test_carved_buffers_share_keys() {
        let device = device();
        let allocation = PageAllocation::zeroed(8192).unwrap();
        // SAFETY: the allocation outlives the registration.
        let registration = unsafe {
            register(&device, allocation.as_ptr(), 8192, AccessFlags::buffer()).unwrap()
        };
        let memory = Arc::new(RegisteredMemory {
            device,
            ptr: allocation.as_ptr(),
            size: 8192,
            registration,
            _allocation: Some(allocation),
        });

        let mut first = Buffer::from_registered(&memory, 0, 4096).unwrap();
        let second = Buffer::from_registered(&memory, 4096, 4096).unwrap();
        assert_eq!(first.local_key(), second.local_key());
        assert_eq!(second.address(), memory.as_ptr() as u64 + 4096);
        assert!(!first.is_memory_allocated());
        assert!(!first.is_memory_registered());
        assert!(Buffer::from_registered(&memory, 4096, 4097).is_err());
        assert!(matches!(
            first.resize(1024),
            Err(Error::NotRegistrationOwner)
        ));
    }
}
