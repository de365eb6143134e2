//! # Software RDMA provider
//!
//! `SoftFabric` emulates a set of reliable-connected RDMA NICs inside one process. Every
//! [`SoftDevice`] opened on a fabric gets its own LID and can reach every other device on
//! the same fabric by (LID, queue pair number), exactly as a peer learned through the
//! handshake would be reached on an InfiniBand subnet.
//!
//! The emulation executes each work request synchronously while it is posted:
//!
//! 1. **Memory keys**: local scatter-gather elements are checked against the local key's
//!    registration, remote ranges against the remote key's registration and access flags.
//!    Violations produce `LocalProtectionError` / `RemoteAccessError` completions and move
//!    the queue pair to the error state; later posts complete as `WorkRequestFlushed`.
//! 2. **Shared receive queues**: sends and writes with immediate consume one posted
//!    receive of the destination queue pair's SRQ. When none is posted the message waits
//!    (receiver-not-ready with unlimited retries) and the sender's completion is deferred
//!    until a receive is posted. Work requests posted behind a waiting message queue up
//!    on the sending queue pair and execute in order once it is delivered.
//! 3. **Atomics**: compare-and-swap and fetch-and-add execute on the remote 8 bytes as a
//!    sequentially consistent `AtomicU64` operation and write the previous value into
//!    the local element.
//!
//! Completions land in per-device completion queues and are drained by
//! [`Device::poll_completion`], so the control plane observes the same asynchronous
//! model it does on hardware.
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::device::Device;
use crate::error::Error;
use crate::error::Result;
use crate::primitives::AccessFlags;
use crate::primitives::CompletionOpcode;
use crate::primitives::CompletionQueueHandle;
use crate::primitives::CompletionStatus;
use crate::primitives::DeviceAttributes;
use crate::primitives::MemoryRegistration;
use crate::primitives::QueuePairHandle;
use crate::primitives::QueuePairInit;
use crate::primitives::QueuePairTransition;
use crate::primitives::ReceiveWorkRequest;
use crate::primitives::ScatterGatherElement;
use crate::primitives::SendWorkRequest;
use crate::primitives::SharedReceiveQueueHandle;
use crate::primitives::WorkCompletion;
use crate::primitives::WorkRequestOpcode;

/// Attributes reported by software devices unless overridden.
pub const DEFAULT_SOFT_ATTRIBUTES: DeviceAttributes = DeviceAttributes {
    max_qp_wr: 16384,
    max_srq_wr: 16384,
    max_sge: 32,
    max_cqe: 65536,
};

/// A set of software devices that can reach one another.
#[derive(Clone, Default)]
pub struct SoftFabric {
    state: Arc<Mutex<FabricState>>,
}

impl std::fmt::Debug for SoftFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftFabric")
            .field("devices", &self.lock().devices.len())
            .finish()
    }
}

impl SoftFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fabric shared by every context opened through `ContextConfig`.
    pub fn global() -> &'static SoftFabric {
        static GLOBAL: OnceLock<SoftFabric> = OnceLock::new();
        GLOBAL.get_or_init(SoftFabric::new)
    }

    pub fn open_device(&self, name: &str) -> Arc<SoftDevice> {
        self.open_device_with(name, DEFAULT_SOFT_ATTRIBUTES)
    }

    pub fn open_device_with(&self, name: &str, attributes: DeviceAttributes) -> Arc<SoftDevice> {
        let mut state = self.lock();
        state.next_device_id = state.next_device_id.wrapping_add(1).max(1);
        while state.devices.contains_key(&state.next_device_id) {
            state.next_device_id = state.next_device_id.wrapping_add(1).max(1);
        }
        let id = state.next_device_id;
        state.devices.insert(id, DeviceState::default());
        tracing::info!("opened software RDMA device {} with lid {}", name, id);

        Arc::new(SoftDevice {
            fabric: self.clone(),
            id,
            name: name.to_string(),
            attributes,
        })
    }

    fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One emulated NIC on a [`SoftFabric`].
#[derive(Debug)]
pub struct SoftDevice {
    fabric: SoftFabric,
    id: u16,
    name: String,
    attributes: DeviceAttributes,
}

impl Drop for SoftDevice {
    fn drop(&mut self) {
        self.fabric.lock().devices.remove(&self.id);
    }
}

#[derive(Debug, Default)]
struct FabricState {
    next_device_id: u16,
    devices: HashMap<u16, DeviceState>,
}

#[derive(Debug, Default)]
struct DeviceState {
    next_handle: usize,
    next_key: u32,
    next_queue_pair_number: u32,
    memory: HashMap<u32, MemoryEntry>,
    completion_queues: HashMap<usize, CompletionQueue>,
    shared_receive_queues: HashMap<usize, SharedReceiveQueue>,
    queue_pairs: HashMap<u32, SoftQueuePair>,
}

impl DeviceState {
    fn allocate_handle(&mut self) -> usize {
        self.next_handle += 1;
        self.next_handle
    }

    /// Returns the registration covering `[address, address + length)` under `key`.
    fn registration(&self, key: u32, address: u64, length: u64) -> Option<&MemoryEntry> {
        let entry = self.memory.get(&key)?;
        let end = address.checked_add(length)?;
        (address >= entry.address && end <= entry.address + entry.length).then_some(entry)
    }
}

#[derive(Debug)]
struct MemoryEntry {
    address: u64,
    length: u64,
    access: AccessFlags,
}

#[derive(Debug)]
struct CompletionQueue {
    capacity: u32,
    entries: VecDeque<WorkCompletion>,
}

#[derive(Debug)]
struct SharedReceiveQueue {
    capacity: u32,
    max_sge: u32,
    posted: VecDeque<ReceiveWorkRequest>,
    waiting: VecDeque<InboundMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SoftQueuePairState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

#[derive(Debug)]
struct SoftQueuePair {
    init: QueuePairInit,
    state: SoftQueuePairState,
    access: AccessFlags,
    remote: Option<(u16, u32)>,
    /// Set while a message from this queue pair waits for a receive.
    blocked: bool,
    backlog: VecDeque<SendWorkRequest>,
}

impl SoftQueuePair {
    fn can_receive(&self) -> bool {
        matches!(
            self.state,
            SoftQueuePairState::ReadyToReceive | SoftQueuePairState::ReadyToSend
        )
    }
}

/// A message waiting for a receive on the destination's shared receive queue.
#[derive(Debug)]
struct InboundMessage {
    destination: u32,
    payload: InboundPayload,
    immediate: Option<u32>,
    sender: SenderCompletion,
}

#[derive(Debug)]
enum InboundPayload {
    /// Bytes of a two-sided send, copied out of the sender's buffer at post time.
    Data(Vec<u8>),
    /// Notification of an RDMA write with immediate whose data is already placed.
    WriteNotification(u32),
}

impl InboundPayload {
    fn len(&self) -> u32 {
        match self {
            InboundPayload::Data(data) => data.len() as u32,
            InboundPayload::WriteNotification(len) => *len,
        }
    }
}

/// Where the sender's completion goes once a message is consumed.
#[derive(Debug, Clone, Copy)]
struct SenderCompletion {
    device: u16,
    completion_queue: usize,
    queue_pair: u32,
    wr_id: u64,
    opcode: CompletionOpcode,
    signaled: bool,
}

/// Result of executing a work request.
enum Execution {
    Completed,
    /// The message was consumed and the sender's completion already reported.
    Delivered,
    /// Waiting for the peer to post a receive; the sender completes on delivery.
    Waiting,
}

impl FabricState {
    fn device(&self, id: u16) -> Result<&DeviceState> {
        self.devices
            .get(&id)
            .ok_or_else(|| Error::device("device lookup", format!("device {} is closed", id)))
    }

    fn device_mut(&mut self, id: u16) -> Result<&mut DeviceState> {
        self.devices
            .get_mut(&id)
            .ok_or_else(|| Error::device("device lookup", format!("device {} is closed", id)))
    }

    fn push_completion(&mut self, device: u16, queue: usize, completion: WorkCompletion) {
        let Some(queue) = self
            .devices
            .get_mut(&device)
            .and_then(|device| device.completion_queues.get_mut(&queue))
        else {
            return;
        };
        if queue.entries.len() >= queue.capacity as usize {
            tracing::warn!(
                "completion queue overrun on device {}: {} entries",
                device,
                queue.entries.len()
            );
        }
        queue.entries.push_back(completion);
    }

    fn complete_sender(&mut self, sender: SenderCompletion, status: CompletionStatus) {
        if status.is_success() && !sender.signaled {
            return;
        }
        self.push_completion(
            sender.device,
            sender.completion_queue,
            WorkCompletion {
                wr_id: sender.wr_id,
                status,
                opcode: sender.opcode,
                byte_len: 0,
                imm_data: None,
                qp_num: sender.queue_pair,
            },
        );
        if !status.is_success() {
            if let Some(queue_pair) = self
                .devices
                .get_mut(&sender.device)
                .and_then(|device| device.queue_pairs.get_mut(&sender.queue_pair))
            {
                queue_pair.state = SoftQueuePairState::Error;
            }
        }
    }

    fn post_send(&mut self, device_id: u16, number: u32, request: &SendWorkRequest) -> Result<()> {
        let device = self.device_mut(device_id)?;
        let queue_pair = device.queue_pairs.get_mut(&number).ok_or_else(|| {
            Error::device("post_send", format!("unknown queue pair {}", number))
        })?;
        if request.sg_list.len() > queue_pair.init.max_send_sge as usize {
            return Err(Error::device(
                "post_send",
                format!(
                    "{} scatter-gather elements exceed the queue pair limit of {}",
                    request.sg_list.len(),
                    queue_pair.init.max_send_sge
                ),
            ));
        }
        match queue_pair.state {
            SoftQueuePairState::ReadyToSend | SoftQueuePairState::Error => {}
            state => {
                return Err(Error::device(
                    "post_send",
                    format!("queue pair {} is in state {:?}", number, state),
                ));
            }
        }
        if queue_pair.blocked {
            queue_pair.backlog.push_back(request.clone());
            return Ok(());
        }
        self.run(device_id, number, request);
        Ok(())
    }

    /// Executes one work request on a queue pair with nothing queued ahead of it.
    fn run(&mut self, device_id: u16, number: u32, request: &SendWorkRequest) {
        let Some(queue_pair) = self
            .devices
            .get(&device_id)
            .and_then(|device| device.queue_pairs.get(&number))
        else {
            return;
        };
        let sender = SenderCompletion {
            device: device_id,
            completion_queue: queue_pair.init.send_completion_queue.0,
            queue_pair: number,
            wr_id: request.wr_id,
            opcode: CompletionOpcode::from(&request.opcode),
            signaled: request.flags.signaled,
        };
        let remote = queue_pair.remote;
        if queue_pair.state == SoftQueuePairState::Error {
            self.complete_sender(sender, CompletionStatus::WorkRequestFlushed);
            return;
        }

        match self.execute(device_id, remote, request, sender) {
            Ok(Execution::Completed) => self.complete_sender(sender, CompletionStatus::Success),
            Ok(Execution::Delivered) => {}
            Ok(Execution::Waiting) => {
                if let Some(queue_pair) = self
                    .devices
                    .get_mut(&device_id)
                    .and_then(|device| device.queue_pairs.get_mut(&number))
                {
                    queue_pair.blocked = true;
                }
            }
            Err(status) => {
                tracing::debug!(
                    "work request {} on queue pair {} failed: {}",
                    request.wr_id,
                    number,
                    status
                );
                self.complete_sender(sender, status);
            }
        }
    }

    /// Unblocks a queue pair whose waiting message was delivered or failed and runs the
    /// requests queued behind it until one has to wait again.
    fn resume(&mut self, device_id: u16, number: u32) {
        let mut first = true;
        loop {
            let Some(queue_pair) = self
                .devices
                .get_mut(&device_id)
                .and_then(|device| device.queue_pairs.get_mut(&number))
            else {
                return;
            };
            if first {
                queue_pair.blocked = false;
                first = false;
            }
            if queue_pair.blocked {
                return;
            }
            let Some(request) = queue_pair.backlog.pop_front() else {
                return;
            };
            self.run(device_id, number, &request);
        }
    }

    fn execute(
        &mut self,
        device_id: u16,
        remote: Option<(u16, u32)>,
        request: &SendWorkRequest,
        sender: SenderCompletion,
    ) -> std::result::Result<Execution, CompletionStatus> {
        let local = self
            .devices
            .get(&device_id)
            .ok_or(CompletionStatus::LocalProtectionError)?;
        let writes_locally = matches!(
            request.opcode,
            WorkRequestOpcode::Read
                | WorkRequestOpcode::CompareAndSwap { .. }
                | WorkRequestOpcode::FetchAndAdd { .. }
        );
        for sge in &request.sg_list {
            let entry = local
                .registration(sge.local_key, sge.address, u64::from(sge.length))
                .ok_or(CompletionStatus::LocalProtectionError)?;
            if writes_locally && !entry.access.contains(AccessFlags::LOCAL_WRITE) {
                return Err(CompletionStatus::LocalProtectionError);
            }
        }

        let (remote_device, remote_number) = remote.ok_or(CompletionStatus::RetryExceeded)?;
        let peer = self
            .devices
            .get(&remote_device)
            .and_then(|device| device.queue_pairs.get(&remote_number))
            .ok_or(CompletionStatus::RetryExceeded)?;
        if !peer.can_receive() || peer.remote != Some((device_id, sender.queue_pair)) {
            return Err(CompletionStatus::RetryExceeded);
        }
        let peer_access = peer.access;

        match request.opcode {
            WorkRequestOpcode::Send | WorkRequestOpcode::SendWithImmediate(_) => {
                // SAFETY: every element was validated against a live registration above.
                let data = unsafe { gather(&request.sg_list) };
                Ok(self.deliver(
                    remote_device,
                    InboundMessage {
                        destination: remote_number,
                        payload: InboundPayload::Data(data),
                        immediate: request.opcode.immediate(),
                        sender,
                    },
                ))
            }
            WorkRequestOpcode::Write | WorkRequestOpcode::WriteWithImmediate(_) => {
                let length = request.total_length();
                let target = self.remote_range(
                    remote_device,
                    request,
                    length,
                    peer_access,
                    AccessFlags::REMOTE_WRITE,
                )?;
                // SAFETY: local elements and the remote range were validated against live
                // registrations; the gathered copy makes overlapping loopback ranges safe.
                unsafe {
                    let data = gather(&request.sg_list);
                    std::ptr::copy_nonoverlapping(data.as_ptr(), target as *mut u8, data.len());
                }
                match request.opcode.immediate() {
                    Some(immediate) => Ok(self.deliver(
                        remote_device,
                        InboundMessage {
                            destination: remote_number,
                            payload: InboundPayload::WriteNotification(length as u32),
                            immediate: Some(immediate),
                            sender,
                        },
                    )),
                    None => Ok(Execution::Completed),
                }
            }
            WorkRequestOpcode::Read => {
                let length = request.total_length();
                let source = self.remote_range(
                    remote_device,
                    request,
                    length,
                    peer_access,
                    AccessFlags::REMOTE_READ,
                )?;
                // SAFETY: both sides were validated against live registrations.
                unsafe {
                    let data = std::slice::from_raw_parts(source as *const u8, length as usize)
                        .to_vec();
                    scatter(&request.sg_list, &data);
                }
                Ok(Execution::Completed)
            }
            WorkRequestOpcode::CompareAndSwap { .. } | WorkRequestOpcode::FetchAndAdd { .. } => {
                let [result] = request.sg_list.as_slice() else {
                    return Err(CompletionStatus::LocalLengthError);
                };
                if result.length != 8 {
                    return Err(CompletionStatus::LocalLengthError);
                }
                let target = self.remote_range(
                    remote_device,
                    request,
                    8,
                    peer_access,
                    AccessFlags::REMOTE_ATOMIC,
                )?;
                if target % 8 != 0 {
                    return Err(CompletionStatus::RemoteInvalidRequest);
                }
                // SAFETY: the target is an aligned, registered 8-byte range and the result
                // element is a registered, locally writable 8-byte range.
                unsafe {
                    let cell = &*(target as *const AtomicU64);
                    let previous = match request.opcode {
                        WorkRequestOpcode::CompareAndSwap { compare, swap } => {
                            match cell.compare_exchange(
                                compare,
                                swap,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            ) {
                                Ok(value) | Err(value) => value,
                            }
                        }
                        WorkRequestOpcode::FetchAndAdd { add } => {
                            cell.fetch_add(add, Ordering::SeqCst)
                        }
                        _ => unreachable!("checked by the outer match"),
                    };
                    std::ptr::write_unaligned(result.address as *mut u64, previous);
                }
                Ok(Execution::Completed)
            }
        }
    }

    /// Validates the remote range of a one-sided request and returns its address.
    fn remote_range(
        &self,
        remote_device: u16,
        request: &SendWorkRequest,
        length: u64,
        peer_access: AccessFlags,
        required: AccessFlags,
    ) -> std::result::Result<u64, CompletionStatus> {
        let remote = request
            .remote
            .ok_or(CompletionStatus::RemoteInvalidRequest)?;
        let entry = self
            .devices
            .get(&remote_device)
            .and_then(|device| device.registration(remote.remote_key, remote.address, length))
            .ok_or(CompletionStatus::RemoteAccessError)?;
        if !entry.access.contains(required) || !peer_access.contains(required) {
            return Err(CompletionStatus::RemoteAccessError);
        }
        Ok(remote.address)
    }

    /// Hands a message to the destination's shared receive queue, consuming a posted
    /// receive when one is available.
    fn deliver(&mut self, device_id: u16, message: InboundMessage) -> Execution {
        let Some(srq) = self.shared_receive_queue_of(device_id, message.destination) else {
            self.complete_sender(message.sender, CompletionStatus::RetryExceeded);
            return Execution::Delivered;
        };
        let receive = self
            .devices
            .get_mut(&device_id)
            .and_then(|device| device.shared_receive_queues.get_mut(&srq))
            .and_then(|queue| queue.posted.pop_front());
        match receive {
            Some(receive) => {
                self.consume(device_id, receive, message);
                Execution::Delivered
            }
            None => {
                if let Some(queue) = self
                    .devices
                    .get_mut(&device_id)
                    .and_then(|device| device.shared_receive_queues.get_mut(&srq))
                {
                    queue.waiting.push_back(message);
                }
                Execution::Waiting
            }
        }
    }

    fn shared_receive_queue_of(&self, device_id: u16, queue_pair: u32) -> Option<usize> {
        self.devices
            .get(&device_id)?
            .queue_pairs
            .get(&queue_pair)
            .map(|queue_pair| queue_pair.init.shared_receive_queue.0)
    }

    /// Completes `message` into `receive` and reports both sides.
    fn consume(&mut self, device_id: u16, receive: ReceiveWorkRequest, message: InboundMessage) {
        let Some(receive_queue) = self
            .devices
            .get(&device_id)
            .and_then(|device| device.queue_pairs.get(&message.destination))
            .map(|queue_pair| queue_pair.init.receive_completion_queue.0)
        else {
            self.complete_sender(message.sender, CompletionStatus::RetryExceeded);
            return;
        };

        let length = message.payload.len();
        let (status, opcode) = match &message.payload {
            InboundPayload::Data(data) => {
                if u64::from(length) > receive.capacity() {
                    (CompletionStatus::LocalLengthError, CompletionOpcode::Receive)
                } else {
                    // SAFETY: receive elements were validated against live registrations
                    // when the receive was posted.
                    unsafe { scatter(&receive.sg_list, data) };
                    (CompletionStatus::Success, CompletionOpcode::Receive)
                }
            }
            InboundPayload::WriteNotification(_) => (
                CompletionStatus::Success,
                CompletionOpcode::ReceiveWithImmediate,
            ),
        };

        self.push_completion(
            device_id,
            receive_queue,
            WorkCompletion {
                wr_id: receive.wr_id,
                status,
                opcode,
                byte_len: if status.is_success() { length } else { 0 },
                imm_data: message.immediate,
                qp_num: message.destination,
            },
        );
        let sender_status = if status.is_success() {
            CompletionStatus::Success
        } else {
            CompletionStatus::RemoteInvalidRequest
        };
        self.complete_sender(message.sender, sender_status);
    }

    fn post_receive(
        &mut self,
        device_id: u16,
        queue: SharedReceiveQueueHandle,
        request: &ReceiveWorkRequest,
    ) -> Result<()> {
        let device = self.device(device_id)?;
        let srq = device.shared_receive_queues.get(&queue.0).ok_or_else(|| {
            Error::device("post_srq_recv", format!("unknown shared receive queue {}", queue.0))
        })?;
        if request.sg_list.len() > srq.max_sge as usize {
            return Err(Error::device(
                "post_srq_recv",
                format!(
                    "{} scatter-gather elements exceed the limit of {}",
                    request.sg_list.len(),
                    srq.max_sge
                ),
            ));
        }
        for sge in &request.sg_list {
            let valid = device
                .registration(sge.local_key, sge.address, u64::from(sge.length))
                .is_some_and(|entry| entry.access.contains(AccessFlags::LOCAL_WRITE));
            if !valid {
                return Err(Error::device(
                    "post_srq_recv",
                    format!("element at 0x{:x} is not registered for local write", sge.address),
                ));
            }
        }

        loop {
            let srq = self
                .device_mut(device_id)?
                .shared_receive_queues
                .get_mut(&queue.0)
                .ok_or_else(|| Error::device("post_srq_recv", "shared receive queue destroyed"))?;
            let Some(message) = srq.waiting.pop_front() else {
                if srq.posted.len() >= srq.capacity as usize {
                    return Err(Error::device("post_srq_recv", "shared receive queue is full"));
                }
                srq.posted.push_back(request.clone());
                return Ok(());
            };
            let sender = message.sender;
            let destination_alive = self
                .device(device_id)?
                .queue_pairs
                .get(&message.destination)
                .is_some_and(SoftQueuePair::can_receive);
            if destination_alive {
                self.consume(device_id, request.clone(), message);
                self.resume(sender.device, sender.queue_pair);
                return Ok(());
            }
            self.complete_sender(sender, CompletionStatus::RetryExceeded);
            self.resume(sender.device, sender.queue_pair);
        }
    }
}

/// Copies the bytes described by `sg_list` into one contiguous vector.
///
/// # Safety
///
/// Every element must describe readable memory.
unsafe fn gather(sg_list: &[ScatterGatherElement]) -> Vec<u8> {
    let mut data = Vec::with_capacity(sg_list.iter().map(|sge| sge.length as usize).sum());
    for sge in sg_list {
        // SAFETY: guaranteed by the caller.
        let bytes =
            unsafe { std::slice::from_raw_parts(sge.address as *const u8, sge.length as usize) };
        data.extend_from_slice(bytes);
    }
    data
}

/// Spreads `data` over the elements of `sg_list` in order.
///
/// # Safety
///
/// Every element must describe writable memory that does not overlap `data`.
unsafe fn scatter(sg_list: &[ScatterGatherElement], data: &[u8]) {
    let mut remaining = data;
    for sge in sg_list {
        if remaining.is_empty() {
            break;
        }
        let count = remaining.len().min(sge.length as usize);
        // SAFETY: guaranteed by the caller.
        unsafe {
            std::ptr::copy_nonoverlapping(remaining.as_ptr(), sge.address as *mut u8, count);
        }
        remaining = &remaining[count..];
    }
}

impl Device for SoftDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn local_device_id(&self) -> u16 {
        self.id
    }

    fn attributes(&self) -> DeviceAttributes {
        self.attributes
    }

    fn create_completion_queue(&self, entries: u32) -> Result<CompletionQueueHandle> {
        if entries == 0 || entries > self.attributes.max_cqe {
            return Err(Error::device(
                "ibv_create_cq",
                format!("invalid completion queue length {}", entries),
            ));
        }
        let mut fabric = self.fabric.lock();
        let device = fabric.device_mut(self.id)?;
        let handle = device.allocate_handle();
        device.completion_queues.insert(
            handle,
            CompletionQueue {
                capacity: entries,
                entries: VecDeque::new(),
            },
        );
        Ok(CompletionQueueHandle(handle))
    }

    fn destroy_completion_queue(&self, queue: CompletionQueueHandle) {
        if let Some(device) = self.fabric.lock().devices.get_mut(&self.id) {
            device.completion_queues.remove(&queue.0);
        }
    }

    fn create_shared_receive_queue(
        &self,
        entries: u32,
        max_sge: u32,
    ) -> Result<SharedReceiveQueueHandle> {
        if entries == 0 || entries > self.attributes.max_srq_wr {
            return Err(Error::device(
                "ibv_create_srq",
                format!("invalid shared receive queue length {}", entries),
            ));
        }
        let mut fabric = self.fabric.lock();
        let device = fabric.device_mut(self.id)?;
        let handle = device.allocate_handle();
        device.shared_receive_queues.insert(
            handle,
            SharedReceiveQueue {
                capacity: entries,
                max_sge: max_sge.max(1),
                posted: VecDeque::new(),
                waiting: VecDeque::new(),
            },
        );
        Ok(SharedReceiveQueueHandle(handle))
    }

    fn destroy_shared_receive_queue(&self, queue: SharedReceiveQueueHandle) {
        if let Some(device) = self.fabric.lock().devices.get_mut(&self.id) {
            device.shared_receive_queues.remove(&queue.0);
        }
    }

    unsafe fn register_memory(
        &self,
        address: u64,
        length: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegistration> {
        if address == 0 {
            return Err(Error::device("ibv_reg_mr", "null address"));
        }
        let mut fabric = self.fabric.lock();
        let device = fabric.device_mut(self.id)?;
        device.next_key = device.next_key.wrapping_add(1).max(1);
        while device.memory.contains_key(&device.next_key) {
            device.next_key = device.next_key.wrapping_add(1).max(1);
        }
        let key = device.next_key;
        device.memory.insert(
            key,
            MemoryEntry {
                address,
                length: length as u64,
                access,
            },
        );
        Ok(MemoryRegistration {
            handle: key as usize,
            local_key: key,
            remote_key: key,
        })
    }

    fn deregister_memory(&self, registration: &MemoryRegistration) {
        if let Some(device) = self.fabric.lock().devices.get_mut(&self.id) {
            device.memory.remove(&registration.local_key);
        }
    }

    fn create_queue_pair(&self, init: &QueuePairInit) -> Result<QueuePairHandle> {
        let mut fabric = self.fabric.lock();
        let device = fabric.device_mut(self.id)?;
        if !device
            .completion_queues
            .contains_key(&init.send_completion_queue.0)
            || !device
                .completion_queues
                .contains_key(&init.receive_completion_queue.0)
            || !device
                .shared_receive_queues
                .contains_key(&init.shared_receive_queue.0)
        {
            return Err(Error::device("ibv_create_qp", "unknown queue handle"));
        }
        // Queue pair numbers are 24 bits wide.
        device.next_queue_pair_number = (device.next_queue_pair_number + 1) & 0xffffff;
        if device.next_queue_pair_number == 0 {
            device.next_queue_pair_number = 1;
        }
        let number = device.next_queue_pair_number;
        device.queue_pairs.insert(
            number,
            SoftQueuePair {
                init: *init,
                state: SoftQueuePairState::Reset,
                access: AccessFlags::default(),
                remote: None,
                blocked: false,
                backlog: VecDeque::new(),
            },
        );
        Ok(QueuePairHandle {
            handle: number as usize,
            number,
        })
    }

    fn modify_queue_pair(
        &self,
        queue_pair: QueuePairHandle,
        transition: &QueuePairTransition,
    ) -> Result<()> {
        let mut fabric = self.fabric.lock();
        let device = fabric.device_mut(self.id)?;
        let entry = device
            .queue_pairs
            .get_mut(&queue_pair.number)
            .ok_or_else(|| Error::device("ibv_modify_qp", "unknown queue pair"))?;
        match (entry.state, transition) {
            (SoftQueuePairState::Reset, QueuePairTransition::Init { access, .. }) => {
                entry.access = *access;
                entry.state = SoftQueuePairState::Init;
            }
            (
                SoftQueuePairState::Init,
                QueuePairTransition::ReadyToReceive {
                    remote_device_id,
                    remote_queue_pair_number,
                    ..
                },
            ) => {
                entry.remote = Some((*remote_device_id, *remote_queue_pair_number));
                entry.state = SoftQueuePairState::ReadyToReceive;
            }
            (SoftQueuePairState::ReadyToReceive, QueuePairTransition::ReadyToSend { .. }) => {
                entry.state = SoftQueuePairState::ReadyToSend;
            }
            (state, transition) => {
                return Err(Error::device(
                    "ibv_modify_qp",
                    format!("invalid transition {:?} from {:?}", transition, state),
                ));
            }
        }
        Ok(())
    }

    fn destroy_queue_pair(&self, queue_pair: QueuePairHandle) {
        if let Some(device) = self.fabric.lock().devices.get_mut(&self.id) {
            device.queue_pairs.remove(&queue_pair.number);
        }
    }

    fn post_send(&self, queue_pair: QueuePairHandle, request: &SendWorkRequest) -> Result<()> {
        self.fabric
            .lock()
            .post_send(self.id, queue_pair.number, request)
    }

    fn post_receive(
        &self,
        queue: SharedReceiveQueueHandle,
        request: &ReceiveWorkRequest,
    ) -> Result<()> {
        self.fabric.lock().post_receive(self.id, queue, request)
    }

    fn poll_completion(&self, queue: CompletionQueueHandle) -> Result<Option<WorkCompletion>> {
        let mut fabric = self.fabric.lock();
        let device = fabric.device_mut(self.id)?;
        let queue = device.completion_queues.get_mut(&queue.0).ok_or_else(|| {
            Error::device("ibv_poll_cq", format!("unknown completion queue {}", queue.0))
        })?;
        Ok(queue.entries.pop_front())
    }
}
