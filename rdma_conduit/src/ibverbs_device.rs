//! # libibverbs provider
//!
//! [`IbverbsDevice`] drives a real RDMA NIC through the libibverbs FFI. It opens the
//! device, allocates one protection domain and creates every other object inside it.
//!
//! Native objects are handed across the [`Device`] seam as pointers cast to `usize`.
//! Objects still alive when the device is dropped are destroyed in dependency order
//! (queue pairs, shared receive queues, completion queues, memory regions) before the
//! protection domain is released and the device closed.
use std::collections::HashSet;
use std::ffi::CStr;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::config::ContextConfig;
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

/// Returns the names of all RDMA devices in the system.
///
/// Returns an empty vector if no devices are found or if the device list could not be read.
pub fn list_devices() -> Vec<String> {
    let mut names = Vec::new();
    // SAFETY: the list is only read between get and free.
    unsafe {
        let mut num_devices = 0i32;
        let devices = ffi::ibv_get_device_list(&mut num_devices);
        if devices.is_null() {
            return names;
        }
        for i in 0..num_devices {
            let device = *devices.add(i as usize);
            if device.is_null() {
                continue;
            }
            names.push(
                CStr::from_ptr(ffi::ibv_get_device_name(device))
                    .to_string_lossy()
                    .into_owned(),
            );
        }
        ffi::ibv_free_device_list(devices);
    }
    names
}

#[derive(Debug, Default)]
struct LiveResources {
    completion_queues: HashSet<usize>,
    shared_receive_queues: HashSet<usize>,
    queue_pairs: HashSet<usize>,
    memory_regions: HashSet<usize>,
}

#[derive(Debug)]
pub struct IbverbsDevice {
    name: String,
    context: *mut ffi::ibv_context,
    protection_domain: *mut ffi::ibv_pd,
    local_device_id: u16,
    attributes: DeviceAttributes,
    live: Mutex<LiveResources>,
}

// SAFETY: libibverbs objects may be used from any thread; the driver serializes access
// to each queue internally.
unsafe impl Send for IbverbsDevice {}

// SAFETY: see `Send`.
unsafe impl Sync for IbverbsDevice {}

fn to_ibv_access(access: AccessFlags) -> i32 {
    let mut flags = 0u32;
    if access.contains(AccessFlags::LOCAL_WRITE) {
        flags |= ffi::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0;
    }
    if access.contains(AccessFlags::REMOTE_WRITE) {
        flags |= ffi::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
    }
    if access.contains(AccessFlags::REMOTE_READ) {
        flags |= ffi::ibv_access_flags::IBV_ACCESS_REMOTE_READ.0;
    }
    if access.contains(AccessFlags::REMOTE_ATOMIC) {
        flags |= ffi::ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC.0;
    }
    flags as i32
}

fn to_ibv_mtu(mtu: crate::primitives::PathMtu) -> ffi::ibv_mtu {
    use crate::primitives::PathMtu;
    match mtu {
        PathMtu::Mtu256 => ffi::IBV_MTU_256,
        PathMtu::Mtu512 => ffi::IBV_MTU_512,
        PathMtu::Mtu1024 => ffi::IBV_MTU_1024,
        PathMtu::Mtu2048 => ffi::IBV_MTU_2048,
        PathMtu::Mtu4096 => ffi::IBV_MTU_4096,
    }
}

fn to_completion_status(status: ffi::ibv_wc_status::Type) -> CompletionStatus {
    match status {
        ffi::ibv_wc_status::IBV_WC_SUCCESS => CompletionStatus::Success,
        ffi::ibv_wc_status::IBV_WC_LOC_LEN_ERR => CompletionStatus::LocalLengthError,
        ffi::ibv_wc_status::IBV_WC_LOC_PROT_ERR => CompletionStatus::LocalProtectionError,
        ffi::ibv_wc_status::IBV_WC_WR_FLUSH_ERR => CompletionStatus::WorkRequestFlushed,
        ffi::ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => CompletionStatus::RemoteInvalidRequest,
        ffi::ibv_wc_status::IBV_WC_REM_ACCESS_ERR => CompletionStatus::RemoteAccessError,
        ffi::ibv_wc_status::IBV_WC_REM_OP_ERR => CompletionStatus::RemoteOperationError,
        ffi::ibv_wc_status::IBV_WC_RETRY_EXC_ERR => CompletionStatus::RetryExceeded,
        ffi::ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => {
            CompletionStatus::ReceiverNotReadyRetryExceeded
        }
        other => CompletionStatus::Other(other as u32),
    }
}

fn to_completion_opcode(opcode: ffi::ibv_wc_opcode::Type) -> CompletionOpcode {
    match opcode {
        ffi::ibv_wc_opcode::IBV_WC_RDMA_WRITE => CompletionOpcode::Write,
        ffi::ibv_wc_opcode::IBV_WC_RDMA_READ => CompletionOpcode::Read,
        ffi::ibv_wc_opcode::IBV_WC_COMP_SWAP => CompletionOpcode::CompareAndSwap,
        ffi::ibv_wc_opcode::IBV_WC_FETCH_ADD => CompletionOpcode::FetchAndAdd,
        ffi::ibv_wc_opcode::IBV_WC_RECV => CompletionOpcode::Receive,
        ffi::ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => CompletionOpcode::ReceiveWithImmediate,
        _ => CompletionOpcode::Send,
    }
}

fn to_ibv_sges(sg_list: &[ScatterGatherElement]) -> Vec<ffi::ibv_sge> {
    sg_list
        .iter()
        .map(|sge| ffi::ibv_sge {
            addr: sge.address,
            length: sge.length,
            lkey: sge.local_key,
        })
        .collect()
}

impl IbverbsDevice {
    /// Opens the device named by `config.device_name`, or the one at
    /// `config.device_index` in the system's device list.
    pub fn open(config: &ContextConfig) -> Result<IbverbsDevice> {
        // SAFETY:
        // This function contains unsafe code that:
        // - Interacts with the Rdma device through FFI calls
        // - Frees every object it created when a later step fails
        unsafe {
            let mut num_devices = 0i32;
            let devices = ffi::ibv_get_device_list(&mut num_devices);
            if devices.is_null() || num_devices == 0 {
                if !devices.is_null() {
                    ffi::ibv_free_device_list(devices);
                }
                return Err(Error::NoDevice(config.device_name.clone()));
            }

            let mut selected = None;
            for i in 0..num_devices {
                let device = *devices.add(i as usize);
                if device.is_null() {
                    continue;
                }
                let name = CStr::from_ptr(ffi::ibv_get_device_name(device))
                    .to_string_lossy()
                    .into_owned();
                let matches = match &config.device_name {
                    Some(wanted) => *wanted == name,
                    None => i as usize == config.device_index,
                };
                if matches {
                    selected = Some((device, name));
                    break;
                }
            }
            let Some((device, name)) = selected else {
                ffi::ibv_free_device_list(devices);
                return Err(Error::NoDevice(Some(
                    config
                        .device_name
                        .clone()
                        .unwrap_or_else(|| format!("#{}", config.device_index)),
                )));
            };

            let context = ffi::ibv_open_device(device);
            ffi::ibv_free_device_list(devices);
            if context.is_null() {
                return Err(Error::last_os_error("ibv_open_device"));
            }

            let mut device_attr = ffi::ibv_device_attr::default();
            if ffi::ibv_query_device(context, &mut device_attr) != 0 {
                let error = Error::last_os_error("ibv_query_device");
                ffi::ibv_close_device(context);
                return Err(error);
            }

            let mut port_attr = ffi::ibv_port_attr::default();
            let errno = ffi::ibv_query_port(
                context,
                config.port_num,
                &mut port_attr as *mut ffi::ibv_port_attr as *mut _,
            );
            if errno != 0 {
                let error = Error::last_os_error("ibv_query_port");
                ffi::ibv_close_device(context);
                return Err(error);
            }

            let protection_domain = ffi::ibv_alloc_pd(context);
            if protection_domain.is_null() {
                let error = Error::last_os_error("ibv_alloc_pd");
                ffi::ibv_close_device(context);
                return Err(error);
            }

            tracing::info!(
                "opened RDMA device {} port {} (lid {})",
                name,
                config.port_num,
                port_attr.lid
            );
            Ok(IbverbsDevice {
                name,
                context,
                protection_domain,
                local_device_id: port_attr.lid,
                attributes: DeviceAttributes {
                    max_qp_wr: device_attr.max_qp_wr.max(0) as u32,
                    max_srq_wr: device_attr.max_srq_wr.max(0) as u32,
                    max_sge: device_attr.max_sge.max(0) as u32,
                    max_cqe: device_attr.max_cqe.max(0) as u32,
                },
                live: Mutex::new(LiveResources::default()),
            })
        }
    }

    fn live(&self) -> MutexGuard<'_, LiveResources> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn modify(
        &self,
        queue_pair: QueuePairHandle,
        mut attr: ffi::ibv_qp_attr,
        mask: ffi::ibv_qp_attr_mask,
    ) -> Result<()> {
        // SAFETY: the handle refers to a live queue pair created by this device.
        let errno = unsafe {
            ffi::ibv_modify_qp(
                queue_pair.handle as *mut ffi::ibv_qp,
                &mut attr,
                mask.0 as i32,
            )
        };
        if errno != 0 {
            return Err(Error::last_os_error("ibv_modify_qp"));
        }
        Ok(())
    }
}

impl Device for IbverbsDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn local_device_id(&self) -> u16 {
        self.local_device_id
    }

    fn attributes(&self) -> DeviceAttributes {
        self.attributes
    }

    fn create_completion_queue(&self, entries: u32) -> Result<CompletionQueueHandle> {
        // SAFETY: the context is open for the lifetime of the device.
        let cq = unsafe {
            ffi::ibv_create_cq(
                self.context,
                entries as i32,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                0,
            )
        };
        if cq.is_null() {
            return Err(Error::last_os_error("ibv_create_cq"));
        }
        self.live().completion_queues.insert(cq as usize);
        Ok(CompletionQueueHandle(cq as usize))
    }

    fn destroy_completion_queue(&self, queue: CompletionQueueHandle) {
        if self.live().completion_queues.remove(&queue.0) {
            // SAFETY: the queue was created by this device and is no longer referenced.
            unsafe { ffi::ibv_destroy_cq(queue.0 as *mut ffi::ibv_cq) };
        }
    }

    fn create_shared_receive_queue(
        &self,
        entries: u32,
        max_sge: u32,
    ) -> Result<SharedReceiveQueueHandle> {
        let mut init_attr = ffi::ibv_srq_init_attr {
            srq_context: std::ptr::null_mut(),
            attr: ffi::ibv_srq_attr {
                max_wr: entries,
                max_sge,
                srq_limit: 0,
            },
        };
        // SAFETY: the protection domain is live for the lifetime of the device.
        let srq = unsafe { ffi::ibv_create_srq(self.protection_domain, &mut init_attr) };
        if srq.is_null() {
            return Err(Error::last_os_error("ibv_create_srq"));
        }
        self.live().shared_receive_queues.insert(srq as usize);
        Ok(SharedReceiveQueueHandle(srq as usize))
    }

    fn destroy_shared_receive_queue(&self, queue: SharedReceiveQueueHandle) {
        if self.live().shared_receive_queues.remove(&queue.0) {
            // SAFETY: the queue was created by this device and is no longer referenced.
            unsafe { ffi::ibv_destroy_srq(queue.0 as *mut ffi::ibv_srq) };
        }
    }

    unsafe fn register_memory(
        &self,
        address: u64,
        length: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegistration> {
        // SAFETY: the caller keeps the memory valid until deregistration.
        let mr = unsafe {
            ffi::ibv_reg_mr(
                self.protection_domain,
                address as *mut _,
                length,
                to_ibv_access(access),
            )
        };
        if mr.is_null() {
            return Err(Error::last_os_error("ibv_reg_mr"));
        }
        self.live().memory_regions.insert(mr as usize);
        // SAFETY: mr was just returned non-null by ibv_reg_mr.
        let (local_key, remote_key) = unsafe { ((*mr).lkey, (*mr).rkey) };
        Ok(MemoryRegistration {
            handle: mr as usize,
            local_key,
            remote_key,
        })
    }

    fn deregister_memory(&self, registration: &MemoryRegistration) {
        if self.live().memory_regions.remove(&registration.handle) {
            // SAFETY: the region was registered by this device.
            unsafe { ffi::ibv_dereg_mr(registration.handle as *mut ffi::ibv_mr) };
        }
    }

    fn create_queue_pair(&self, init: &QueuePairInit) -> Result<QueuePairHandle> {
        let mut qp_init_attr = ffi::ibv_qp_init_attr {
            qp_context: std::ptr::null::<std::os::raw::c_void>() as *mut _,
            send_cq: init.send_completion_queue.0 as *mut ffi::ibv_cq,
            recv_cq: init.receive_completion_queue.0 as *mut ffi::ibv_cq,
            srq: init.shared_receive_queue.0 as *mut ffi::ibv_srq,
            cap: ffi::ibv_qp_cap {
                max_send_wr: init.max_send_wr,
                max_recv_wr: init.max_recv_wr,
                max_send_sge: init.max_send_sge,
                max_recv_sge: init.max_recv_sge,
                max_inline_data: 0,
            },
            qp_type: ffi::ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 0,
        };
        // SAFETY: the queues referenced by `init` were created by this device.
        let qp = unsafe { ffi::ibv_create_qp(self.protection_domain, &mut qp_init_attr) };
        if qp.is_null() {
            return Err(Error::last_os_error("ibv_create_qp"));
        }
        self.live().queue_pairs.insert(qp as usize);
        Ok(QueuePairHandle {
            handle: qp as usize,
            // SAFETY: qp was just returned non-null by ibv_create_qp.
            number: unsafe { (*qp).qp_num },
        })
    }

    fn modify_queue_pair(
        &self,
        queue_pair: QueuePairHandle,
        transition: &QueuePairTransition,
    ) -> Result<()> {
        match *transition {
            QueuePairTransition::Init {
                port_num,
                pkey_index,
                access,
            } => {
                let attr = ffi::ibv_qp_attr {
                    qp_state: ffi::ibv_qp_state::IBV_QPS_INIT,
                    qp_access_flags: to_ibv_access(access) as u32,
                    pkey_index,
                    port_num,
                    ..Default::default()
                };
                let mask = ffi::ibv_qp_attr_mask::IBV_QP_STATE
                    | ffi::ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ffi::ibv_qp_attr_mask::IBV_QP_PORT
                    | ffi::ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
                self.modify(queue_pair, attr, mask)
            }
            QueuePairTransition::ReadyToReceive {
                port_num,
                path_mtu,
                remote_device_id,
                remote_queue_pair_number,
                remote_sequence_number,
                max_dest_rd_atomic,
                min_rnr_timer,
            } => {
                // LID-based routing, e.g. for Infiniband.
                let attr = ffi::ibv_qp_attr {
                    qp_state: ffi::ibv_qp_state::IBV_QPS_RTR,
                    path_mtu: to_ibv_mtu(path_mtu),
                    dest_qp_num: remote_queue_pair_number,
                    rq_psn: remote_sequence_number,
                    max_dest_rd_atomic,
                    min_rnr_timer,
                    ah_attr: ffi::ibv_ah_attr {
                        dlid: remote_device_id,
                        sl: 0,
                        src_path_bits: 0,
                        is_global: 0,
                        port_num,
                        grh: Default::default(),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                let mask = ffi::ibv_qp_attr_mask::IBV_QP_STATE
                    | ffi::ibv_qp_attr_mask::IBV_QP_AV
                    | ffi::ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ffi::ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ffi::ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ffi::ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ffi::ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
                self.modify(queue_pair, attr, mask)
            }
            QueuePairTransition::ReadyToSend {
                sequence_number,
                timeout,
                retry_count,
                rnr_retry,
                max_rd_atomic,
            } => {
                let attr = ffi::ibv_qp_attr {
                    qp_state: ffi::ibv_qp_state::IBV_QPS_RTS,
                    sq_psn: sequence_number,
                    max_rd_atomic,
                    retry_cnt: retry_count,
                    rnr_retry,
                    timeout,
                    ..Default::default()
                };
                let mask = ffi::ibv_qp_attr_mask::IBV_QP_STATE
                    | ffi::ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ffi::ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ffi::ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ffi::ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ffi::ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
                self.modify(queue_pair, attr, mask)
            }
        }
    }

    fn destroy_queue_pair(&self, queue_pair: QueuePairHandle) {
        if self.live().queue_pairs.remove(&queue_pair.handle) {
            // SAFETY: the queue pair was created by this device.
            unsafe { ffi::ibv_destroy_qp(queue_pair.handle as *mut ffi::ibv_qp) };
        }
    }

    fn post_send(&self, queue_pair: QueuePairHandle, request: &SendWorkRequest) -> Result<()> {
        let mut sges = to_ibv_sges(&request.sg_list);
        let mut send_flags = 0u32;
        if request.flags.signaled {
            send_flags |= ffi::ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        if request.flags.fenced {
            send_flags |= ffi::ibv_send_flags::IBV_SEND_FENCE.0;
        }
        if request.flags.inlined {
            send_flags |= ffi::ibv_send_flags::IBV_SEND_INLINE.0;
        }
        let opcode = match request.opcode {
            WorkRequestOpcode::Send => ffi::ibv_wr_opcode::IBV_WR_SEND,
            WorkRequestOpcode::SendWithImmediate(_) => ffi::ibv_wr_opcode::IBV_WR_SEND_WITH_IMM,
            WorkRequestOpcode::Write => ffi::ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            WorkRequestOpcode::WriteWithImmediate(_) => {
                ffi::ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM
            }
            WorkRequestOpcode::Read => ffi::ibv_wr_opcode::IBV_WR_RDMA_READ,
            WorkRequestOpcode::CompareAndSwap { .. } => {
                ffi::ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP
            }
            WorkRequestOpcode::FetchAndAdd { .. } => ffi::ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD,
        };

        // SAFETY: Interacts with RDMA device through FFI calls. The scatter-gather list
        // outlives the call and the driver copies the request before returning.
        unsafe {
            let mut send_wr = ffi::ibv_send_wr {
                wr_id: request.wr_id,
                next: std::ptr::null_mut(),
                sg_list: sges.as_mut_ptr(),
                num_sge: sges.len() as i32,
                opcode,
                send_flags,
                wr: Default::default(),
                qp_type: Default::default(),
                __bindgen_anon_1: Default::default(),
                __bindgen_anon_2: Default::default(),
            };
            if let Some(immediate) = request.opcode.immediate() {
                // Immediate data travels in network byte order.
                send_wr.__bindgen_anon_1.imm_data = immediate.to_be();
            }
            if let Some(remote) = request.remote {
                match request.opcode {
                    WorkRequestOpcode::CompareAndSwap { compare, swap } => {
                        send_wr.wr.atomic.remote_addr = remote.address;
                        send_wr.wr.atomic.rkey = remote.remote_key;
                        send_wr.wr.atomic.compare_add = compare;
                        send_wr.wr.atomic.swap = swap;
                    }
                    WorkRequestOpcode::FetchAndAdd { add } => {
                        send_wr.wr.atomic.remote_addr = remote.address;
                        send_wr.wr.atomic.rkey = remote.remote_key;
                        send_wr.wr.atomic.compare_add = add;
                    }
                    _ => {
                        send_wr.wr.rdma.remote_addr = remote.address;
                        send_wr.wr.rdma.rkey = remote.remote_key;
                    }
                }
            }

            let qp = queue_pair.handle as *mut ffi::ibv_qp;
            let mut bad_send_wr: *mut ffi::ibv_send_wr = std::ptr::null_mut();
            let ops = &mut (*self.context).ops;
            let Some(post_send) = ops.post_send.as_mut() else {
                return Err(Error::device("ibv_post_send", "driver has no post_send"));
            };
            let errno = post_send(qp, &mut send_wr as *mut _, &mut bad_send_wr);
            if errno != 0 {
                return Err(Error::Device {
                    operation: "ibv_post_send",
                    source: std::io::Error::from_raw_os_error(errno),
                });
            }
        }
        Ok(())
    }

    fn post_receive(
        &self,
        queue: SharedReceiveQueueHandle,
        request: &ReceiveWorkRequest,
    ) -> Result<()> {
        let mut sges = to_ibv_sges(&request.sg_list);
        // SAFETY: Interacts with RDMA device through FFI calls; the receive elements were
        // registered with this device by the caller.
        unsafe {
            let mut recv_wr = ffi::ibv_recv_wr {
                wr_id: request.wr_id,
                next: std::ptr::null_mut(),
                sg_list: sges.as_mut_ptr(),
                num_sge: sges.len() as i32,
            };
            let srq = queue.0 as *mut ffi::ibv_srq;
            let mut bad_recv_wr: *mut ffi::ibv_recv_wr = std::ptr::null_mut();
            let ops = &mut (*self.context).ops;
            let Some(post_srq_recv) = ops.post_srq_recv.as_mut() else {
                return Err(Error::device("ibv_post_srq_recv", "driver has no post_srq_recv"));
            };
            let errno = post_srq_recv(srq, &mut recv_wr as *mut _, &mut bad_recv_wr);
            if errno != 0 {
                return Err(Error::Device {
                    operation: "ibv_post_srq_recv",
                    source: std::io::Error::from_raw_os_error(errno),
                });
            }
        }
        Ok(())
    }

    fn poll_completion(&self, queue: CompletionQueueHandle) -> Result<Option<WorkCompletion>> {
        // SAFETY: Interacts with RDMA device through FFI calls
        unsafe {
            let mut wc = std::mem::MaybeUninit::<ffi::ibv_wc>::zeroed().assume_init();
            let ops = &mut (*self.context).ops;
            let Some(poll_cq) = ops.poll_cq.as_mut() else {
                return Err(Error::device("ibv_poll_cq", "driver has no poll_cq"));
            };
            let ret = poll_cq(queue.0 as *mut ffi::ibv_cq, 1, &mut wc);
            if ret < 0 {
                return Err(Error::last_os_error("ibv_poll_cq"));
            }
            if ret == 0 {
                return Ok(None);
            }

            let status = to_completion_status(wc.status);
            if let Some((status, vendor_err)) = wc.error() {
                tracing::debug!(
                    "work completion {} failed with status {:?}, vendor error {}",
                    wc.wr_id,
                    status,
                    vendor_err
                );
            }
            Ok(Some(WorkCompletion {
                wr_id: wc.wr_id,
                status,
                opcode: to_completion_opcode(wc.opcode),
                byte_len: wc.byte_len,
                imm_data: wc.imm_data().map(u32::from_be),
                qp_num: wc.qp_num,
            }))
        }
    }
}

impl Drop for IbverbsDevice {
    fn drop(&mut self) {
        let live = std::mem::take(&mut *self.live());
        // SAFETY:
        // This requires calling ibverbs APIs for proper clean up
        // of ibverbs constructs, children before parents.
        unsafe {
            for qp in live.queue_pairs {
                ffi::ibv_destroy_qp(qp as *mut ffi::ibv_qp);
            }
            for srq in live.shared_receive_queues {
                ffi::ibv_destroy_srq(srq as *mut ffi::ibv_srq);
            }
            for cq in live.completion_queues {
                ffi::ibv_destroy_cq(cq as *mut ffi::ibv_cq);
            }
            for mr in live.memory_regions {
                ffi::ibv_dereg_mr(mr as *mut ffi::ibv_mr);
            }
            if !self.protection_domain.is_null() {
                ffi::ibv_dealloc_pd(self.protection_domain);
            }
            if !self.context.is_null() {
                ffi::ibv_close_device(self.context);
            }
        }
    }
}
