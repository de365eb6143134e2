//! Device-neutral data structures exchanged with an RDMA provider.
//!
//! Primitives:
//! - `DeviceAttributes`: capabilities of an opened device (work request limits, SGE limits, CQ size).
//! - `AccessFlags`: what local and remote peers may do with a registered memory region.
//! - `OperationFlags`: per-operation modifiers (fenced, signaled, inlined).
//! - `SendWorkRequest` / `ReceiveWorkRequest`: descriptions of work handed to the device.
//! - `WorkCompletion`: a completion drained from a completion queue.
//! - `QueuePairTransition`: the attributes of one step of the INIT -> RTR -> RTS state machine.
//!
//! Handles to provider resources are plain integers. Providers translate these structures
//! into their native representation (for example `ffi::ibv_send_wr`) only at the boundary.
use std::fmt;
use std::ops::BitOr;

use serde::Deserialize;
use serde::Serialize;

/// Capabilities reported by a device, used to size queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttributes {
    pub max_qp_wr: u32,
    pub max_srq_wr: u32,
    pub max_sge: u32,
    pub max_cqe: u32,
}

impl fmt::Display for DeviceAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\tMax QP WRs: {}", self.max_qp_wr)?;
        writeln!(f, "\tMax SRQ WRs: {}", self.max_srq_wr)?;
        writeln!(f, "\tMax SGE: {}", self.max_sge)?;
        writeln!(f, "\tMax CQEs: {}", self.max_cqe)?;
        Ok(())
    }
}

/// Access rights granted when registering memory. Bit values match `ibv_access_flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const LOCAL_WRITE: AccessFlags = AccessFlags(1);
    pub const REMOTE_WRITE: AccessFlags = AccessFlags(1 << 1);
    pub const REMOTE_READ: AccessFlags = AccessFlags(1 << 2);
    pub const REMOTE_ATOMIC: AccessFlags = AccessFlags(1 << 3);

    /// Rights given to plain buffers.
    pub fn buffer() -> Self {
        Self::LOCAL_WRITE | Self::REMOTE_WRITE | Self::REMOTE_READ
    }

    /// Rights given to atomic regions and to queue pairs.
    pub fn all() -> Self {
        Self::buffer() | Self::REMOTE_ATOMIC
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

/// Modifiers applied to a single posted operation.
///
/// * `fenced` - wait for all prior reads and atomics on the queue pair before executing
/// * `signaled` - generate a completion; forced on whenever a request token is attached
/// * `inlined` - copy the payload into the work request instead of reading it by DMA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationFlags {
    pub fenced: bool,
    pub signaled: bool,
    pub inlined: bool,
}

impl OperationFlags {
    pub fn fenced(mut self) -> Self {
        self.fenced = true;
        self
    }

    pub fn signaled(mut self) -> Self {
        self.signaled = true;
        self
    }

    pub fn inlined(mut self) -> Self {
        self.inlined = true;
        self
    }
}

/// Path MTU negotiated when moving a queue pair to ready-to-receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathMtu {
    Mtu256,
    Mtu512,
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl PathMtu {
    pub fn bytes(&self) -> u32 {
        match self {
            PathMtu::Mtu256 => 256,
            PathMtu::Mtu512 => 512,
            PathMtu::Mtu1024 => 1024,
            PathMtu::Mtu2048 => 2048,
            PathMtu::Mtu4096 => 4096,
        }
    }

    pub fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            256 => Some(PathMtu::Mtu256),
            512 => Some(PathMtu::Mtu512),
            1024 => Some(PathMtu::Mtu1024),
            2048 => Some(PathMtu::Mtu2048),
            4096 => Some(PathMtu::Mtu4096),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionQueueHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedReceiveQueueHandle(pub usize);

/// A provider queue pair together with the number peers use to address it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueuePairHandle {
    pub handle: usize,
    pub number: u32,
}

/// Keys returned by memory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegistration {
    pub handle: usize,
    pub local_key: u32,
    pub remote_key: u32,
}

/// Capacities and queues a new queue pair is bound to.
#[derive(Debug, Clone, Copy)]
pub struct QueuePairInit {
    pub send_completion_queue: CompletionQueueHandle,
    pub receive_completion_queue: CompletionQueueHandle,
    pub shared_receive_queue: SharedReceiveQueueHandle,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// One step of the reliable-connected queue pair state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePairTransition {
    Init {
        port_num: u8,
        pkey_index: u16,
        access: AccessFlags,
    },
    ReadyToReceive {
        port_num: u8,
        path_mtu: PathMtu,
        remote_device_id: u16,
        remote_queue_pair_number: u32,
        remote_sequence_number: u32,
        max_dest_rd_atomic: u8,
        min_rnr_timer: u8,
    },
    ReadyToSend {
        sequence_number: u32,
        timeout: u8,
        retry_count: u8,
        rnr_retry: u8,
        max_rd_atomic: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterGatherElement {
    pub address: u64,
    pub length: u32,
    pub local_key: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddress {
    pub address: u64,
    pub remote_key: u32,
}

/// Operation carried by a send work request. Immediate values are host order here;
/// providers convert to network order on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkRequestOpcode {
    Send,
    SendWithImmediate(u32),
    Write,
    WriteWithImmediate(u32),
    Read,
    CompareAndSwap { compare: u64, swap: u64 },
    FetchAndAdd { add: u64 },
}

impl WorkRequestOpcode {
    pub fn immediate(&self) -> Option<u32> {
        match self {
            WorkRequestOpcode::SendWithImmediate(value)
            | WorkRequestOpcode::WriteWithImmediate(value) => Some(*value),
            _ => None,
        }
    }

    /// Whether the operation targets remote memory rather than a posted receive.
    pub fn is_one_sided(&self) -> bool {
        !matches!(
            self,
            WorkRequestOpcode::Send | WorkRequestOpcode::SendWithImmediate(_)
        )
    }
}

/// A request posted to the send queue of a queue pair.
///
/// A `wr_id` of zero marks a request no one is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWorkRequest {
    pub wr_id: u64,
    pub opcode: WorkRequestOpcode,
    pub sg_list: Vec<ScatterGatherElement>,
    pub remote: Option<RemoteAddress>,
    pub flags: OperationFlags,
}

impl SendWorkRequest {
    pub fn total_length(&self) -> u64 {
        self.sg_list.iter().map(|sge| u64::from(sge.length)).sum()
    }
}

/// A request posted to a shared receive queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveWorkRequest {
    pub wr_id: u64,
    pub sg_list: Vec<ScatterGatherElement>,
}

impl ReceiveWorkRequest {
    pub fn capacity(&self) -> u64 {
        self.sg_list.iter().map(|sge| u64::from(sge.length)).sum()
    }
}

/// Outcome reported by a work completion. Mirrors the `ibv_wc_status` values this
/// crate distinguishes; everything else is kept as its raw code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    WorkRequestFlushed,
    RemoteInvalidRequest,
    RemoteAccessError,
    RemoteOperationError,
    RetryExceeded,
    ReceiverNotReadyRetryExceeded,
    Other(u32),
}

impl CompletionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionStatus::Success)
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Success => write!(f, "success"),
            CompletionStatus::LocalLengthError => write!(f, "local length error"),
            CompletionStatus::LocalProtectionError => write!(f, "local protection error"),
            CompletionStatus::WorkRequestFlushed => write!(f, "work request flushed"),
            CompletionStatus::RemoteInvalidRequest => write!(f, "remote invalid request"),
            CompletionStatus::RemoteAccessError => write!(f, "remote access error"),
            CompletionStatus::RemoteOperationError => write!(f, "remote operation error"),
            CompletionStatus::RetryExceeded => write!(f, "transport retry counter exceeded"),
            CompletionStatus::ReceiverNotReadyRetryExceeded => {
                write!(f, "RNR retry counter exceeded")
            }
            CompletionStatus::Other(code) => write!(f, "status {}", code),
        }
    }
}

/// Kind of work a completion reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionOpcode {
    Send,
    Write,
    Read,
    CompareAndSwap,
    FetchAndAdd,
    Receive,
    ReceiveWithImmediate,
}

impl From<&WorkRequestOpcode> for CompletionOpcode {
    fn from(opcode: &WorkRequestOpcode) -> Self {
        match opcode {
            WorkRequestOpcode::Send | WorkRequestOpcode::SendWithImmediate(_) => {
                CompletionOpcode::Send
            }
            WorkRequestOpcode::Write | WorkRequestOpcode::WriteWithImmediate(_) => {
                CompletionOpcode::Write
            }
            WorkRequestOpcode::Read => CompletionOpcode::Read,
            WorkRequestOpcode::CompareAndSwap { .. } => CompletionOpcode::CompareAndSwap,
            WorkRequestOpcode::FetchAndAdd { .. } => CompletionOpcode::FetchAndAdd,
        }
    }
}

/// A work completion drained from a completion queue.
///
/// # Fields
///
/// * `wr_id` - Work Request ID the operation was posted with
/// * `status` - Whether the operation succeeded
/// * `opcode` - Type of operation that completed
/// * `byte_len` - Bytes received; only meaningful for receive completions
/// * `imm_data` - Immediate value in host order, if the sender attached one
/// * `qp_num` - Number of the local queue pair the completion belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: CompletionStatus,
    pub opcode: CompletionOpcode,
    pub byte_len: u32,
    pub imm_data: Option<u32>,
    pub qp_num: u32,
}

impl WorkCompletion {
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    pub fn is_valid(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_flags() {
        let buffer = AccessFlags::buffer();
        assert!(buffer.contains(AccessFlags::LOCAL_WRITE));
        assert!(buffer.contains(AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE));
        assert!(!buffer.contains(AccessFlags::REMOTE_ATOMIC));
        assert!(AccessFlags::all().contains(AccessFlags::REMOTE_ATOMIC));
        assert_eq!(AccessFlags::all().bits(), 0b1111);
    }

    #[test]
    fn test_operation_flags_builder() {
        let flags = OperationFlags::default().fenced().inlined();
        assert!(flags.fenced);
        assert!(flags.inlined);
        assert!(!flags.signaled);
    }

    #[test]
    fn test_path_mtu_conversion() {
        assert_eq!(PathMtu::Mtu4096.bytes(), 4096);
        assert_eq!(PathMtu::from_bytes(1024), Some(PathMtu::Mtu1024));
        assert_eq!(PathMtu::from_bytes(1000), None);
    }

    #[test]
    fn test_work_request_helpers() {
        let request = SendWorkRequest {
            wr_id: 7,
            opcode: WorkRequestOpcode::WriteWithImmediate(42),
            sg_list: vec![
                ScatterGatherElement {
                    address: 0x1000,
                    length: 16,
                    local_key: 1,
                },
                ScatterGatherElement {
                    address: 0x2000,
                    length: 48,
                    local_key: 1,
                },
            ],
            remote: None,
            flags: OperationFlags::default(),
        };
        assert_eq!(request.total_length(), 64);
        assert_eq!(request.opcode.immediate(), Some(42));
        assert!(request.opcode.is_one_sided());
        assert!(!WorkRequestOpcode::SendWithImmediate(1).is_one_sided());
        assert_eq!(
            CompletionOpcode::from(&request.opcode),
            CompletionOpcode::Write
        );
    }

    #[test]
    fn test_work_completion() {
        let wc = WorkCompletion {
            wr_id: 42,
            status: CompletionStatus::Success,
            opcode: CompletionOpcode::Read,
            byte_len: 0,
            imm_data: None,
            qp_num: 3,
        };
        assert_eq!(wc.wr_id(), 42);
        assert!(wc.is_valid());

        let failed = WorkCompletion {
            status: CompletionStatus::RemoteAccessError,
            ..wc
        };
        assert!(!failed.is_valid());
        assert_eq!(failed.status.to_string(), "remote access error");
    }
}
