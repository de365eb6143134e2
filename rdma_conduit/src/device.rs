//! The provider seam between the control plane and an RDMA device.
//!
//! [`Device`] exposes exactly the operations the control plane needs from hardware:
//! queue creation, memory registration, queue pair state transitions, posting work
//! and polling completions. Two providers implement it:
//!
//! - `IbverbsDevice` (feature `ibverbs`) drives libibverbs.
//! - [`crate::SoftDevice`] emulates a reliable-connected NIC in process.
//!
//! Resources are referenced through the integer handles in [`crate::primitives`]; a
//! provider owns the native objects behind them and releases whatever is left when
//! it is dropped.
use std::fmt::Debug;
use std::sync::Arc;

use crate::config::ContextConfig;
use crate::config::Provider;
use crate::error::Result;
use crate::primitives::AccessFlags;
use crate::primitives::CompletionQueueHandle;
use crate::primitives::DeviceAttributes;
use crate::primitives::MemoryRegistration;
use crate::primitives::QueuePairHandle;
use crate::primitives::QueuePairInit;
use crate::primitives::QueuePairTransition;
use crate::primitives::ReceiveWorkRequest;
use crate::primitives::SendWorkRequest;
use crate::primitives::SharedReceiveQueueHandle;
use crate::primitives::WorkCompletion;
use crate::soft_device::SoftFabric;

pub trait Device: Send + Sync + Debug {
    /// Name of the device, i.e. 'mlx5_0'.
    fn name(&self) -> &str;

    /// LID of the configured port; peers address this device by it.
    fn local_device_id(&self) -> u16;

    fn attributes(&self) -> DeviceAttributes;

    fn create_completion_queue(&self, entries: u32) -> Result<CompletionQueueHandle>;

    fn destroy_completion_queue(&self, queue: CompletionQueueHandle);

    fn create_shared_receive_queue(
        &self,
        entries: u32,
        max_sge: u32,
    ) -> Result<SharedReceiveQueueHandle>;

    fn destroy_shared_receive_queue(&self, queue: SharedReceiveQueueHandle);

    /// Registers `length` bytes at `address` for DMA.
    ///
    /// # Safety
    ///
    /// The memory must stay valid and unmoved until `deregister_memory` is called with
    /// the returned registration.
    unsafe fn register_memory(
        &self,
        address: u64,
        length: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegistration>;

    fn deregister_memory(&self, registration: &MemoryRegistration);

    fn create_queue_pair(&self, init: &QueuePairInit) -> Result<QueuePairHandle>;

    fn modify_queue_pair(
        &self,
        queue_pair: QueuePairHandle,
        transition: &QueuePairTransition,
    ) -> Result<()>;

    fn destroy_queue_pair(&self, queue_pair: QueuePairHandle);

    /// Posts one work request to the send queue of `queue_pair`.
    fn post_send(&self, queue_pair: QueuePairHandle, request: &SendWorkRequest) -> Result<()>;

    /// Posts one receive to a shared receive queue.
    fn post_receive(
        &self,
        queue: SharedReceiveQueueHandle,
        request: &ReceiveWorkRequest,
    ) -> Result<()>;

    /// Performs a single poll of the completion queue.
    ///
    /// This does not perform any timing or retry logic; callers decide how to spin.
    fn poll_completion(&self, queue: CompletionQueueHandle) -> Result<Option<WorkCompletion>>;
}

/// Opens the device selected by `config`.
///
/// The software provider opens a device on the process-wide [`SoftFabric::global`], so
/// every context opened this way can reach every other.
pub fn open_device(config: &ContextConfig) -> Result<Arc<dyn Device>> {
    match config.provider {
        Provider::Software => {
            let name = config
                .device_name
                .clone()
                .unwrap_or_else(|| format!("soft_{}", config.device_index));
            let device: Arc<dyn Device> = SoftFabric::global().open_device(&name);
            Ok(device)
        }
        #[cfg(feature = "ibverbs")]
        Provider::Ibverbs => {
            let device: Arc<dyn Device> =
                Arc::new(crate::ibverbs_device::IbverbsDevice::open(config)?);
            Ok(device)
        }
        #[cfg(not(feature = "ibverbs"))]
        Provider::Ibverbs => Err(crate::error::Error::NoDevice(Some(
            "ibverbs (crate built without the `ibverbs` feature)".to_string(),
        ))),
    }
}
