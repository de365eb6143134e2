use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::context::Context;
use crate::device::Device;
use crate::error::Result;
use crate::primitives::AccessFlags;
use crate::primitives::MemoryRegistration;
use crate::region::Region;
use crate::region::RegionKind;

/// An 8-byte region that remote peers may target with compare-and-swap and fetch-and-add.
///
/// Also serves as the destination for the previous value returned by those operations.
#[derive(Debug)]
pub struct Atomic {
    device: Arc<dyn Device>,
    value: Box<AtomicU64>,
    registration: MemoryRegistration,
}

impl Atomic {
    pub fn new(context: &Context) -> Result<Self> {
        Self::register(context.device().clone())
    }

    pub(crate) fn register(device: Arc<dyn Device>) -> Result<Self> {
        let value = Box::new(AtomicU64::new(0));
        // SAFETY: the boxed value never moves and outlives the registration, which is
        // released in `Drop`.
        let registration = unsafe {
            device.register_memory(
                value.as_ptr() as u64,
                std::mem::size_of::<u64>(),
                AccessFlags::all(),
            )?
        };
        Ok(Self {
            device,
            value,
            registration,
        })
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Overwrites the local value. Not atomic with respect to remote operations in flight.
    pub fn set_value_non_atomic(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }
}

impl Region for Atomic {
    fn kind(&self) -> RegionKind {
        RegionKind::Atomic
    }

    fn size_in_bytes(&self) -> u64 {
        std::mem::size_of::<u64>() as u64
    }

    fn address(&self) -> u64 {
        self.value.as_ptr() as u64
    }

    fn local_key(&self) -> u32 {
        self.registration.local_key
    }

    fn remote_key(&self) -> u32 {
        self.registration.remote_key
    }
}

impl Drop for Atomic {
    fn drop(&mut self) {
        self.device.deregister_memory(&self.registration);
    }
}
