//! # Context
//!
//! A [`Context`] owns the per-device state every queue pair on that device shares:
//!
//! 1. **Completion queues**: one for sends, one for receives.
//! 2. **Shared receive queue**: receive buffers posted through the context serve incoming
//!    messages on any of its queue pairs.
//! 3. **Queue pair registry**: queue pair numbers mapped to weak handles, used to report
//!    which connection a receive arrived on.
//! 4. **Pending requests**: request tokens waiting for a completion, keyed by the
//!    work request id they were posted with.
//!
//! Progress is cooperative. Completions are only drained by
//! [`Context::poll_send_completion_queue`], [`Context::receive`] and the request token
//! methods built on them; there is no background thread.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::atomic::Atomic;
use crate::buffer::Buffer;
use crate::config::ContextConfig;
use crate::config::QueueLimits;
use crate::device::Device;
use crate::device::open_device;
use crate::error::Error;
use crate::error::Result;
use crate::primitives::CompletionOpcode;
use crate::primitives::CompletionQueueHandle;
use crate::primitives::CompletionStatus;
use crate::primitives::DeviceAttributes;
use crate::primitives::ReceiveWorkRequest;
use crate::primitives::ScatterGatherElement;
use crate::primitives::SharedReceiveQueueHandle;
use crate::queue_pair::QueuePair;
use crate::region::Region;
use crate::request_token::RequestState;
use crate::request_token::RequestToken;

/// A message or immediate-data write drained from the receive completion queue.
///
/// Failed receives are reported here too: the consumed buffer is handed back with the
/// error `status` so the caller can post it again.
#[derive(Debug)]
pub struct ReceiveElement {
    /// The posted buffer holding the message. `None` for RDMA writes with immediate,
    /// whose consumed receive buffer is posted again automatically.
    pub buffer: Option<Arc<Buffer>>,
    pub status: CompletionStatus,
    pub bytes_written: u32,
    pub immediate_value: Option<u32>,
    pub queue_pair_number: u32,
    /// The receiving queue pair, if it is still alive.
    pub queue_pair: Option<Arc<QueuePair>>,
}

pub struct Context {
    device: Arc<dyn Device>,
    config: ContextConfig,
    attributes: DeviceAttributes,
    limits: QueueLimits,
    send_completion_queue: CompletionQueueHandle,
    receive_completion_queue: CompletionQueueHandle,
    shared_receive_queue: SharedReceiveQueueHandle,
    queue_pairs: Mutex<HashMap<u32, Weak<QueuePair>>>,
    pending_requests: Mutex<HashMap<u64, Arc<RequestState>>>,
    posted_buffers: Mutex<HashMap<u64, Arc<Buffer>>>,
    next_work_request_id: AtomicU64,
    default_atomic: Atomic,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device.name())
            .field("local_device_id", &self.device.local_device_id())
            .field("limits", &self.limits)
            .field("queue_pairs", &lock(&self.queue_pairs).len())
            .field("pending_requests", &lock(&self.pending_requests).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Context {
    /// Opens the device selected by `config` and creates the shared queues.
    pub fn new(config: ContextConfig) -> Result<Arc<Self>> {
        let device = open_device(&config)?;
        Self::with_device(device, config)
    }

    /// Creates the shared queues on an already opened device.
    pub fn with_device(device: Arc<dyn Device>, config: ContextConfig) -> Result<Arc<Self>> {
        let attributes = device.attributes();
        let limits = config.limits(&attributes);
        tracing::info!(
            "Using RDMA device: {} (lid {})",
            device.name(),
            device.local_device_id()
        );
        tracing::debug!("device attributes for {}:\n{}", device.name(), attributes);

        let send_completion_queue = device.create_completion_queue(limits.completion_queue_length)?;
        let receive_completion_queue =
            match device.create_completion_queue(limits.completion_queue_length) {
                Ok(queue) => queue,
                Err(e) => {
                    device.destroy_completion_queue(send_completion_queue);
                    return Err(e);
                }
            };
        let shared_receive_queue = match device.create_shared_receive_queue(
            limits.shared_receive_queue_length,
            limits.max_scatter_gather_elements,
        ) {
            Ok(queue) => queue,
            Err(e) => {
                device.destroy_completion_queue(receive_completion_queue);
                device.destroy_completion_queue(send_completion_queue);
                return Err(e);
            }
        };
        let default_atomic = match Atomic::register(device.clone()) {
            Ok(atomic) => atomic,
            Err(e) => {
                device.destroy_shared_receive_queue(shared_receive_queue);
                device.destroy_completion_queue(receive_completion_queue);
                device.destroy_completion_queue(send_completion_queue);
                return Err(e);
            }
        };

        Ok(Arc::new(Self {
            device,
            config,
            attributes,
            limits,
            send_completion_queue,
            receive_completion_queue,
            shared_receive_queue,
            queue_pairs: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            posted_buffers: Mutex::new(HashMap::new()),
            // Zero marks work requests nobody waits for.
            next_work_request_id: AtomicU64::new(1),
            default_atomic,
        }))
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn device_attributes(&self) -> DeviceAttributes {
        self.attributes
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    pub fn local_device_id(&self) -> u16 {
        self.device.local_device_id()
    }

    /// Atomic region used as the previous-value sink when an atomic operation is given none.
    pub fn default_atomic(&self) -> &Atomic {
        &self.default_atomic
    }

    pub fn create_request_token(self: &Arc<Self>) -> RequestToken {
        RequestToken::new(self)
    }

    pub(crate) fn send_completion_queue(&self) -> CompletionQueueHandle {
        self.send_completion_queue
    }

    pub(crate) fn receive_completion_queue(&self) -> CompletionQueueHandle {
        self.receive_completion_queue
    }

    pub(crate) fn shared_receive_queue(&self) -> SharedReceiveQueueHandle {
        self.shared_receive_queue
    }

    fn allocate_work_request_id(&self) -> u64 {
        let id = self.next_work_request_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.next_work_request_id.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    /// Makes `buffer` available for one incoming message or immediate-data write.
    ///
    /// The context holds the buffer until it is returned in a [`ReceiveElement`].
    pub fn post_receive_buffer(&self, buffer: Arc<Buffer>) -> Result<()> {
        let length = buffer.size_in_bytes();
        let length = u32::try_from(length).map_err(|_| Error::TransferTooLarge(length))?;
        let wr_id = self.allocate_work_request_id();
        let request = ReceiveWorkRequest {
            wr_id,
            sg_list: vec![ScatterGatherElement {
                address: buffer.address(),
                length,
                local_key: buffer.local_key(),
            }],
        };

        lock(&self.posted_buffers).insert(wr_id, buffer);
        if let Err(e) = self
            .device
            .post_receive(self.shared_receive_queue, &request)
        {
            lock(&self.posted_buffers).remove(&wr_id);
            return Err(e);
        }
        Ok(())
    }

    /// Number of buffers posted and not yet returned by `receive`.
    pub fn posted_receive_buffers(&self) -> usize {
        lock(&self.posted_buffers).len()
    }

    /// Drains at most one event from the receive completion queue.
    ///
    /// Returns `None` when no message has arrived. Never fails: every drained event,
    /// successful or not, comes back as a [`ReceiveElement`].
    pub fn receive(&self) -> Option<ReceiveElement> {
        let completion = match self.device.poll_completion(self.receive_completion_queue) {
            Ok(Some(completion)) => completion,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("failed to poll receive completion queue: {}", e);
                return None;
            }
        };
        let mut buffer = lock(&self.posted_buffers).remove(&completion.wr_id);
        if !completion.status.is_success() {
            tracing::warn!(
                "receive on queue pair {} failed: {}",
                completion.qp_num,
                completion.status
            );
        } else if completion.opcode == CompletionOpcode::ReceiveWithImmediate {
            if let Some(consumed) = buffer.take() {
                if let Err(e) = self.post_receive_buffer(consumed.clone()) {
                    tracing::warn!("failed to re-post receive buffer: {}", e);
                    buffer = Some(consumed);
                }
            }
        }

        Some(ReceiveElement {
            buffer,
            status: completion.status,
            bytes_written: completion.byte_len,
            immediate_value: completion.imm_data,
            queue_pair_number: completion.qp_num,
            queue_pair: self.queue_pair(completion.qp_num),
        })
    }

    /// Drains at most one event from the send completion queue and resolves the request
    /// token it belongs to. Returns whether an event was drained.
    pub fn poll_send_completion_queue(&self) -> bool {
        let completion = match self.device.poll_completion(self.send_completion_queue) {
            Ok(Some(completion)) => completion,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!("failed to poll send completion queue: {}", e);
                return false;
            }
        };
        if !completion.status.is_success() {
            tracing::warn!(
                "work request {} on queue pair {} completed with {}",
                completion.wr_id,
                completion.qp_num,
                completion.status
            );
        }
        if completion.wr_id != 0 {
            if let Some(state) = lock(&self.pending_requests).remove(&completion.wr_id) {
                state.complete(completion.status);
            }
        }
        true
    }

    /// Registers a pending request and returns the work request id to post it with.
    pub(crate) fn track_request(&self, state: Arc<RequestState>) -> u64 {
        let wr_id = self.allocate_work_request_id();
        lock(&self.pending_requests).insert(wr_id, state);
        wr_id
    }

    pub(crate) fn forget_request(&self, wr_id: u64) {
        lock(&self.pending_requests).remove(&wr_id);
    }

    /// Number of request tokens waiting for a completion.
    pub fn outstanding_requests(&self) -> usize {
        lock(&self.pending_requests).len()
    }

    /// Adds `queue_pair` to the registry used to attribute receives.
    pub fn register_queue_pair(&self, queue_pair: &Arc<QueuePair>) {
        lock(&self.queue_pairs).insert(queue_pair.queue_pair_number(), Arc::downgrade(queue_pair));
    }

    pub(crate) fn unregister_queue_pair(&self, number: u32) {
        lock(&self.queue_pairs).remove(&number);
    }

    pub fn queue_pair(&self, number: u32) -> Option<Arc<QueuePair>> {
        lock(&self.queue_pairs).get(&number).and_then(Weak::upgrade)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let posted = lock(&self.posted_buffers).len();
        if posted > 0 {
            tracing::debug!("releasing {} posted receive buffers", posted);
        }
        self.device
            .destroy_shared_receive_queue(self.shared_receive_queue);
        self.device
            .destroy_completion_queue(self.receive_completion_queue);
        self.device.destroy_completion_queue(self.send_completion_queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft_device::SoftFabric;

    fn context() -> Arc<Context> {
        Context::with_device(
            SoftFabric::new().open_device("context_test"),
            ContextConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_limits_follow_device() {
        let context = context();
        let limits = context.limits();
        assert_eq!(limits.completion_queue_length, 4096);
        assert_eq!(limits.shared_receive_queue_length, 16383);
        assert_eq!(limits.max_scatter_gather_elements, 4);
        assert_ne!(context.local_device_id(), 0);
    }

    #[test]
    fn test_nothing_to_poll() {
        let context = context();
        assert!(!context.poll_send_completion_queue());
        assert!(context.receive().is_none());
        assert_eq!(context.outstanding_requests(), 0);
    }

    #[test]
    fn test_post_receive_buffer_is_held() {
        let context = context();
        let buffer = Arc::new(Buffer::new(&context, 128).unwrap());
        context.post_receive_buffer(buffer.clone()).unwrap();
        assert_eq!(context.posted_receive_buffers(), 1);
        assert_eq!(Arc::strong_count(&buffer), 2);
    }

    #[test]
    fn test_default_atomic() {
        let context = context();
        assert_eq!(context.default_atomic().value(), 0);
        assert_eq!(context.default_atomic().size_in_bytes(), 8);
    }

    #[test]
    fn test_work_request_ids_skip_zero() {
        let context = context();
        let first = context.allocate_work_request_id();
        let second = context.allocate_work_request_id();
        assert_ne!(first, 0);
        assert!(second > first);
    }

    #[test]
    fn test_context_from_config() {
        let config = ContextConfig {
            provider: crate::config::Provider::Software,
            device_name: Some("context_from_config".to_string()),
            ..Default::default()
        };
        let context = Context::new(config).unwrap();
        assert_eq!(context.device().name(), "context_from_config");
        assert_eq!(context.config().port_num, 1);
    }
}
