//! # Queue Pair
//!
//! A [`QueuePair`] is one endpoint of a reliable-connected link. It is created in INIT and
//! moves to ready-to-receive and then ready-to-send in a single call to
//! [`QueuePair::activate`], once the peer's device id, queue pair number and sequence
//! number are known. There is no way back.
//!
//! Every data-transfer operation comes in a whole-buffer form and a `*_with` form taking
//! [`TransferOptions`]. All of them validate their arguments before anything is posted:
//!
//! 1. the queue pair must be ready-to-send,
//! 2. the transfer must lie within the local and remote ranges,
//! 3. a single work request carries at most `u32::MAX` bytes and at most the context's
//!    scatter-gather element limit.
//!
//! Passing a [`RequestToken`] resets it, tags it with the local region and forces the
//! operation to be signaled. Without a token the operation is fire-and-forget: its
//! completion, if any, is discarded. Unsignaled operations still occupy send queue slots
//! until a later signaled one completes, so callers issuing many of them in a row must
//! signal one periodically.
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use anyhow::anyhow;

use crate::atomic::Atomic;
use crate::buffer::Buffer;
use crate::context::Context;
use crate::error::Error;
use crate::error::RegionSide;
use crate::error::Result;
use crate::primitives::AccessFlags;
use crate::primitives::OperationFlags;
use crate::primitives::QueuePairHandle;
use crate::primitives::QueuePairInit;
use crate::primitives::QueuePairTransition;
use crate::primitives::RemoteAddress;
use crate::primitives::ScatterGatherElement;
use crate::primitives::SendWorkRequest;
use crate::primitives::WorkRequestOpcode;
use crate::region::Region;
use crate::region::RegionKind;
use crate::region::RegionToken;
use crate::region::check_range;
use crate::request_token::RequestToken;

/// Connection state of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueuePairState {
    Init,
    ReadyToReceive,
    ReadyToSend,
}

impl std::fmt::Display for QueuePairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueuePairState::Init => write!(f, "INIT"),
            QueuePairState::ReadyToReceive => write!(f, "RTR"),
            QueuePairState::ReadyToSend => write!(f, "RTS"),
        }
    }
}

/// Offsets, size and modifiers of a single operation.
///
/// # Fields
///
/// * `local_offset` - Offset into the local buffer.
/// * `remote_offset` - Offset into the remote region; ignored by sends.
/// * `size` - Bytes to transfer; `None` means the rest of the local buffer.
/// * `flags` - Fence, signal and inline modifiers.
/// * `immediate` - Immediate value delivered to the peer's receive queue; sends and
///   writes only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub local_offset: u64,
    pub remote_offset: u64,
    pub size: Option<u64>,
    pub flags: OperationFlags,
    pub immediate: Option<u32>,
}

impl TransferOptions {
    pub fn with_local_offset(mut self, offset: u64) -> Self {
        self.local_offset = offset;
        self
    }

    pub fn with_remote_offset(mut self, offset: u64) -> Self {
        self.remote_offset = offset;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_flags(mut self, flags: OperationFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_immediate(mut self, immediate: u32) -> Self {
        self.immediate = Some(immediate);
        self
    }
}

/// A range of a local buffer, one element of a gathered write.
#[derive(Debug, Clone, Copy)]
pub struct LocalSlice<'a> {
    pub buffer: &'a Buffer,
    pub offset: u64,
    pub size: u64,
}

impl<'a> LocalSlice<'a> {
    pub fn new(buffer: &'a Buffer, offset: u64, size: u64) -> Self {
        Self {
            buffer,
            offset,
            size,
        }
    }

    pub fn whole(buffer: &'a Buffer) -> Self {
        Self::new(buffer, 0, buffer.size_in_bytes())
    }
}

impl<'a> From<&'a Buffer> for LocalSlice<'a> {
    fn from(buffer: &'a Buffer) -> Self {
        Self::whole(buffer)
    }
}

pub struct QueuePair {
    context: Arc<Context>,
    handle: QueuePairHandle,
    sequence_number: u32,
    state: Mutex<QueuePairState>,
    remote_user_data: OnceLock<Vec<u8>>,
}

impl std::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("local_device_id", &self.local_device_id())
            .field("queue_pair_number", &self.handle.number)
            .field("sequence_number", &self.sequence_number)
            .field("state", &self.state())
            .finish()
    }
}

fn transfer_length(size: u64) -> Result<u32> {
    u32::try_from(size).map_err(|_| Error::TransferTooLarge(size))
}

impl QueuePair {
    /// Creates a queue pair on `context` and moves it to INIT.
    ///
    /// The queue pair is bound to the context's completion queues and shared receive
    /// queue, and registered with the context under its number.
    pub fn new(context: &Arc<Context>) -> Result<Arc<Self>> {
        let limits = context.limits();
        let init = QueuePairInit {
            send_completion_queue: context.send_completion_queue(),
            receive_completion_queue: context.receive_completion_queue(),
            shared_receive_queue: context.shared_receive_queue(),
            max_send_wr: limits.completion_queue_length,
            max_recv_wr: limits.completion_queue_length,
            max_send_sge: limits.max_scatter_gather_elements,
            max_recv_sge: limits.max_scatter_gather_elements,
        };
        let device = context.device();
        let handle = device.create_queue_pair(&init)?;

        let config = context.config();
        let transition = QueuePairTransition::Init {
            port_num: config.port_num,
            pkey_index: config.pkey_index,
            access: AccessFlags::all(),
        };
        if let Err(e) = device.modify_queue_pair(handle, &transition) {
            device.destroy_queue_pair(handle);
            return Err(e);
        }

        // Sequence numbers are 24 bits wide.
        let sequence_number = rand::random::<u32>() & 0xffffff;
        let queue_pair = Arc::new(Self {
            context: context.clone(),
            handle,
            sequence_number,
            state: Mutex::new(QueuePairState::Init),
            remote_user_data: OnceLock::new(),
        });
        context.register_queue_pair(&queue_pair);
        tracing::debug!(
            "created queue pair {} (psn {}) on {}",
            handle.number,
            sequence_number,
            device.name()
        );
        Ok(queue_pair)
    }

    /// Connects to a remote queue pair.
    ///
    /// This performs the INIT -> RTR -> RTS transitions.
    ///
    /// # Arguments
    ///
    /// * `remote_device_id` - LID of the peer's device
    /// * `remote_queue_pair_number` - The peer's queue pair number
    /// * `remote_sequence_number` - The peer's initial packet sequence number
    pub fn activate(
        &self,
        remote_device_id: u16,
        remote_queue_pair_number: u32,
        remote_sequence_number: u32,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != QueuePairState::Init {
            return Err(Error::AlreadyActivated {
                queue_pair_number: self.handle.number,
                state: *state,
            });
        }
        let config = self.context.config();
        let device = self.context.device();

        device.modify_queue_pair(
            self.handle,
            &QueuePairTransition::ReadyToReceive {
                port_num: config.port_num,
                path_mtu: config.path_mtu,
                remote_device_id,
                remote_queue_pair_number,
                remote_sequence_number,
                max_dest_rd_atomic: config.max_dest_rd_atomic,
                min_rnr_timer: config.min_rnr_timer,
            },
        )?;
        *state = QueuePairState::ReadyToReceive;

        device.modify_queue_pair(
            self.handle,
            &QueuePairTransition::ReadyToSend {
                sequence_number: self.sequence_number,
                timeout: config.qp_timeout,
                retry_count: config.retry_cnt,
                rnr_retry: config.rnr_retry,
                max_rd_atomic: config.max_rd_atomic,
            },
        )?;
        *state = QueuePairState::ReadyToSend;

        tracing::debug!(
            "queue pair {} paired with {}:{}",
            self.handle.number,
            remote_device_id,
            remote_queue_pair_number
        );
        Ok(())
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn local_device_id(&self) -> u16 {
        self.context.local_device_id()
    }

    pub fn queue_pair_number(&self) -> u32 {
        self.handle.number
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    pub fn state(&self) -> QueuePairState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// User data the peer attached to the handshake; empty before pairing.
    pub fn user_data(&self) -> &[u8] {
        self.remote_user_data
            .get()
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Records the peer's handshake payload. Only the first call has an effect.
    pub(crate) fn set_remote_user_data(&self, data: Vec<u8>) {
        let _ = self.remote_user_data.set(data);
    }

    fn check_activated(&self) -> Result<()> {
        match self.state() {
            QueuePairState::ReadyToSend => Ok(()),
            state => Err(Error::NotActivated {
                queue_pair_number: self.handle.number,
                state,
            }),
        }
    }

    /// Validates `[offset, offset + size)` of `buffer` and describes it as one element.
    fn local_element(
        buffer: &Buffer,
        offset: u64,
        size: u64,
    ) -> Result<(ScatterGatherElement, RegionToken)> {
        check_range(RegionSide::Local, buffer.size_in_bytes(), offset, size)?;
        let length = transfer_length(size)?;
        let region = buffer.create_token_range(offset, size)?;
        Ok((
            ScatterGatherElement {
                address: region.address(),
                length,
                local_key: region.local_key(),
            },
            region,
        ))
    }

    /// Posts a validated work request, attaching `token` when given.
    fn post(
        &self,
        opcode: WorkRequestOpcode,
        sg_list: Vec<ScatterGatherElement>,
        remote: Option<RemoteAddress>,
        mut flags: OperationFlags,
        region: RegionToken,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        let wr_id = match token {
            Some(token) => {
                let state = token.begin(region, opcode.immediate());
                flags.signaled = true;
                self.context.track_request(state)
            }
            None => 0,
        };
        let request = SendWorkRequest {
            wr_id,
            opcode,
            sg_list,
            remote,
            flags,
        };
        tracing::debug!(
            "posting {:?} of {} bytes on queue pair {} (wr_id {})",
            request.opcode,
            request.total_length(),
            self.handle.number,
            wr_id
        );
        if let Err(e) = self.context.device().post_send(self.handle, &request) {
            if wr_id != 0 {
                self.context.forget_request(wr_id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Sends the whole buffer to the peer's receive queue.
    pub fn send(&self, buffer: &Buffer, token: Option<&mut RequestToken>) -> Result<()> {
        self.send_with(buffer, TransferOptions::default(), token)
    }

    /// Sends the whole buffer together with an immediate value.
    pub fn send_with_immediate(
        &self,
        buffer: &Buffer,
        immediate: u32,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.send_with(
            buffer,
            TransferOptions::default().with_immediate(immediate),
            token,
        )
    }

    /// Sends `options.size` bytes starting at `options.local_offset`.
    pub fn send_with(
        &self,
        buffer: &Buffer,
        options: TransferOptions,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.check_activated()?;
        let size = options
            .size
            .unwrap_or_else(|| buffer.remaining_size_in_bytes(options.local_offset));
        let (element, region) = Self::local_element(buffer, options.local_offset, size)?;
        let opcode = match options.immediate {
            Some(immediate) => WorkRequestOpcode::SendWithImmediate(immediate),
            None => WorkRequestOpcode::Send,
        };
        self.post(opcode, vec![element], None, options.flags, region, token)
    }

    /// Writes the whole buffer to the start of `remote`.
    pub fn write(
        &self,
        buffer: &Buffer,
        remote: &RegionToken,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.write_with(buffer, remote, TransferOptions::default(), token)
    }

    /// Writes the whole buffer and notifies the peer's receive queue with `immediate`.
    pub fn write_with_immediate(
        &self,
        buffer: &Buffer,
        remote: &RegionToken,
        immediate: u32,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.write_with(
            buffer,
            remote,
            TransferOptions::default().with_immediate(immediate),
            token,
        )
    }

    pub fn write_with(
        &self,
        buffer: &Buffer,
        remote: &RegionToken,
        options: TransferOptions,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.check_activated()?;
        let size = options
            .size
            .unwrap_or_else(|| buffer.remaining_size_in_bytes(options.local_offset));
        let (element, region) = Self::local_element(buffer, options.local_offset, size)?;
        check_range(
            RegionSide::Remote,
            remote.size_in_bytes(),
            options.remote_offset,
            size,
        )?;
        let opcode = match options.immediate {
            Some(immediate) => WorkRequestOpcode::WriteWithImmediate(immediate),
            None => WorkRequestOpcode::Write,
        };
        self.post(
            opcode,
            vec![element],
            Some(RemoteAddress {
                address: remote.address_with_offset(options.remote_offset),
                remote_key: remote.remote_key(),
            }),
            options.flags,
            region,
            token,
        )
    }

    /// Gathers `slices` into one contiguous write at the start of `remote`.
    pub fn multi_write(
        &self,
        slices: &[LocalSlice<'_>],
        remote: &RegionToken,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.multi_write_with(slices, remote, TransferOptions::default(), token)
    }

    pub fn multi_write_with_immediate(
        &self,
        slices: &[LocalSlice<'_>],
        remote: &RegionToken,
        immediate: u32,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.multi_write_with(
            slices,
            remote,
            TransferOptions::default().with_immediate(immediate),
            token,
        )
    }

    /// Gathered write. Only `remote_offset`, `flags` and `immediate` of `options` apply;
    /// each slice carries its own offset and size.
    pub fn multi_write_with(
        &self,
        slices: &[LocalSlice<'_>],
        remote: &RegionToken,
        options: TransferOptions,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.check_activated()?;
        let supported = self.context.limits().max_scatter_gather_elements;
        if slices.is_empty() || slices.len() > supported as usize {
            return Err(Error::TooManyElements {
                requested: slices.len(),
                supported,
            });
        }

        let mut sg_list = Vec::with_capacity(slices.len());
        let mut region = None;
        let mut total: u64 = 0;
        for slice in slices {
            let (element, slice_region) =
                Self::local_element(slice.buffer, slice.offset, slice.size)?;
            total = total
                .checked_add(slice.size)
                .ok_or(Error::TransferTooLarge(u64::MAX))?;
            region.get_or_insert(slice_region);
            sg_list.push(element);
        }
        transfer_length(total)?;
        check_range(
            RegionSide::Remote,
            remote.size_in_bytes(),
            options.remote_offset,
            total,
        )?;
        let Some(region) = region else {
            return Err(Error::Other(anyhow!("gathered write without elements")));
        };

        let opcode = match options.immediate {
            Some(immediate) => WorkRequestOpcode::WriteWithImmediate(immediate),
            None => WorkRequestOpcode::Write,
        };
        self.post(
            opcode,
            sg_list,
            Some(RemoteAddress {
                address: remote.address_with_offset(options.remote_offset),
                remote_key: remote.remote_key(),
            }),
            options.flags,
            region,
            token,
        )
    }

    /// Reads from the start of `remote` into the whole buffer.
    pub fn read(
        &self,
        buffer: &Buffer,
        remote: &RegionToken,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.read_with(buffer, remote, TransferOptions::default(), token)
    }

    pub fn read_with(
        &self,
        buffer: &Buffer,
        remote: &RegionToken,
        options: TransferOptions,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.check_activated()?;
        if options.immediate.is_some() {
            return Err(Error::Other(anyhow!("reads cannot carry immediate data")));
        }
        let size = options
            .size
            .unwrap_or_else(|| buffer.remaining_size_in_bytes(options.local_offset));
        let (element, region) = Self::local_element(buffer, options.local_offset, size)?;
        check_range(
            RegionSide::Remote,
            remote.size_in_bytes(),
            options.remote_offset,
            size,
        )?;
        self.post(
            WorkRequestOpcode::Read,
            vec![element],
            Some(RemoteAddress {
                address: remote.address_with_offset(options.remote_offset),
                remote_key: remote.remote_key(),
            }),
            options.flags,
            region,
            token,
        )
    }

    /// Atomically replaces the remote value with `swap` if it equals `compare`.
    ///
    /// The previous remote value lands in the context's default atomic.
    pub fn compare_and_swap(
        &self,
        remote: &RegionToken,
        compare: u64,
        swap: u64,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.compare_and_swap_into(
            self.context.default_atomic(),
            remote,
            compare,
            swap,
            OperationFlags::default(),
            token,
        )
    }

    /// Compare-and-swap writing the previous remote value into `previous`.
    ///
    /// # Arguments
    ///
    /// * `previous` - 8-byte local region receiving the value found remotely
    /// * `remote` - Token of a remote [`Atomic`]
    /// * `compare` - Value the remote must hold for the swap to happen
    /// * `swap` - Replacement value
    pub fn compare_and_swap_into(
        &self,
        previous: &dyn Region,
        remote: &RegionToken,
        compare: u64,
        swap: u64,
        flags: OperationFlags,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.atomic(
            WorkRequestOpcode::CompareAndSwap { compare, swap },
            previous,
            remote,
            flags,
            token,
        )
    }

    /// Atomically adds `add` to the remote value.
    ///
    /// The previous remote value lands in the context's default atomic.
    pub fn fetch_and_add(
        &self,
        remote: &RegionToken,
        add: u64,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.fetch_and_add_into(
            self.context.default_atomic(),
            remote,
            add,
            OperationFlags::default(),
            token,
        )
    }

    pub fn fetch_and_add_into(
        &self,
        previous: &dyn Region,
        remote: &RegionToken,
        add: u64,
        flags: OperationFlags,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.atomic(
            WorkRequestOpcode::FetchAndAdd { add },
            previous,
            remote,
            flags,
            token,
        )
    }

    fn atomic(
        &self,
        opcode: WorkRequestOpcode,
        previous: &dyn Region,
        remote: &RegionToken,
        flags: OperationFlags,
        token: Option<&mut RequestToken>,
    ) -> Result<()> {
        self.check_activated()?;
        const WIDTH: u64 = std::mem::size_of::<u64>() as u64;
        if remote.kind() != RegionKind::Atomic {
            return Err(Error::InvalidAtomicTarget("a remote region of kind Atomic"));
        }
        check_range(RegionSide::Remote, remote.size_in_bytes(), 0, WIDTH)?;
        if previous.size_in_bytes() != WIDTH {
            return Err(Error::InvalidAtomicTarget("an 8-byte previous-value region"));
        }
        let region = previous.create_token();
        self.post(
            opcode,
            vec![ScatterGatherElement {
                address: region.address(),
                length: WIDTH as u32,
                local_key: region.local_key(),
            }],
            Some(RemoteAddress {
                address: remote.address(),
                remote_key: remote.remote_key(),
            }),
            flags,
            region,
            token,
        )
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        self.context.unregister_queue_pair(self.handle.number);
        self.context.device().destroy_queue_pair(self.handle);
        tracing::debug!("destroyed queue pair {}", self.handle.number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::primitives::CompletionStatus;
    use crate::soft_device::SoftFabric;

    fn context() -> Arc<Context> {
        Context::with_device(
            SoftFabric::new().open_device("queue_pair_test"),
            ContextConfig::default(),
        )
        .unwrap()
    }

    fn loopback(context: &Arc<Context>) -> Arc<QueuePair> {
        let queue_pair = QueuePair::new(context).unwrap();
        queue_pair
            .activate(
                queue_pair.local_device_id(),
                queue_pair.queue_pair_number(),
                queue_pair.sequence_number(),
            )
            .unwrap();
        queue_pair
    }

    fn filled(context: &Context, size: u64) -> Buffer {
        let mut buffer = Buffer::new(context, size).unwrap();
        for (i, byte) in buffer.as_mut_slice().iter_mut().enumerate() {
            *byte = (i % 251) as u8 + 1;
        }
        buffer
    }

    #[test]
    fn test_new_queue_pair() {
        let context = context();
        let queue_pair = QueuePair::new(&context).unwrap();
        assert_eq!(queue_pair.state(), QueuePairState::Init);
        assert!(queue_pair.sequence_number() <= 0xffffff);
        assert!(queue_pair.user_data().is_empty());
        assert!(Arc::ptr_eq(
            &context.queue_pair(queue_pair.queue_pair_number()).unwrap(),
            &queue_pair
        ));
    }

    #[test]
    fn test_drop_unregisters() {
        let context = context();
        let number = QueuePair::new(&context).unwrap().queue_pair_number();
        assert!(context.queue_pair(number).is_none());
    }

    #[test]
    fn test_activate_once() {
        let context = context();
        let queue_pair = loopback(&context);
        assert_eq!(queue_pair.state(), QueuePairState::ReadyToSend);
        assert!(matches!(
            queue_pair.activate(1, 1, 1),
            Err(Error::AlreadyActivated { .. })
        ));
    }

    #[test]
    fn test_operations_require_activation() {
        let context = context();
        let queue_pair = QueuePair::new(&context).unwrap();
        let buffer = Buffer::new(&context, 64).unwrap();
        let remote = buffer.create_token();
        let mut token = RequestToken::new(&context);

        assert!(matches!(
            queue_pair.write(&buffer, &remote, Some(&mut token)),
            Err(Error::NotActivated {
                state: QueuePairState::Init,
                ..
            })
        ));
        assert!(queue_pair.send(&buffer, None).is_err());
        assert!(queue_pair.read(&buffer, &remote, None).is_err());
        assert!(
            queue_pair
                .fetch_and_add(&context.default_atomic().create_token(), 1, None)
                .is_err()
        );
        assert!(token.region().is_none());
        assert_eq!(context.outstanding_requests(), 0);
    }

    #[test]
    fn test_loopback_write() {
        let context = context();
        let queue_pair = loopback(&context);
        for size in [1u64, 64, 4096, 1 << 20] {
            let source = filled(&context, size);
            let destination = Buffer::new(&context, size).unwrap();
            let mut token = RequestToken::new(&context);
            queue_pair
                .write(&source, &destination.create_token(), Some(&mut token))
                .unwrap();
            token.wait_until_completed();
            assert!(token.was_successful());
            assert_eq!(source.as_slice(), destination.as_slice());
            assert_eq!(token.region(), Some(source.create_token()));
        }
        assert_eq!(context.outstanding_requests(), 0);
    }

    #[test]
    fn test_write_with_offsets() {
        let context = context();
        let queue_pair = loopback(&context);
        let source = filled(&context, 256);
        let destination = Buffer::new(&context, 256).unwrap();
        let mut token = RequestToken::new(&context);
        let options = TransferOptions::default()
            .with_local_offset(16)
            .with_remote_offset(128)
            .with_size(32);
        queue_pair
            .write_with(&source, &destination.create_token(), options, Some(&mut token))
            .unwrap();
        token.wait_until_completed();
        assert!(token.was_successful());
        assert_eq!(&destination.as_slice()[128..160], &source.as_slice()[16..48]);
        assert!(destination.as_slice()[..128].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn test_out_of_bounds_posts_nothing() {
        let context = context();
        let queue_pair = loopback(&context);
        let source = Buffer::new(&context, 128).unwrap();
        let destination = Buffer::new(&context, 64).unwrap();
        let mut token = RequestToken::new(&context);

        let result = queue_pair.write(&source, &destination.create_token(), Some(&mut token));
        assert!(matches!(
            result,
            Err(Error::OutOfBounds {
                side: RegionSide::Remote,
                requested: 128,
                available: 64,
                ..
            })
        ));
        let options = TransferOptions::default().with_local_offset(100).with_size(64);
        assert!(matches!(
            queue_pair.send_with(&source, options, None),
            Err(Error::OutOfBounds {
                side: RegionSide::Local,
                ..
            })
        ));
        assert!(token.region().is_none());
        assert!(!queue_pair.context().poll_send_completion_queue());
    }

    #[test]
    fn test_loopback_read() {
        let context = context();
        let queue_pair = loopback(&context);
        let source = filled(&context, 4096);
        let destination = Buffer::new(&context, 1024).unwrap();
        let mut token = RequestToken::new(&context);
        let options = TransferOptions::default().with_remote_offset(1024);
        queue_pair
            .read_with(&destination, &source.create_token(), options, Some(&mut token))
            .unwrap();
        token.wait_until_completed();
        assert!(token.was_successful());
        assert_eq!(destination.as_slice(), &source.as_slice()[1024..2048]);
    }

    #[test]
    fn test_multi_write_gathers() {
        let context = context();
        let queue_pair = loopback(&context);
        let first = filled(&context, 64);
        let second = filled(&context, 64);
        let destination = Buffer::new(&context, 96).unwrap();
        let mut token = RequestToken::new(&context);
        queue_pair
            .multi_write(
                &[LocalSlice::new(&first, 0, 32), LocalSlice::new(&second, 32, 32)],
                &destination.create_token(),
                Some(&mut token),
            )
            .unwrap();
        token.wait_until_completed();
        assert!(token.was_successful());
        assert_eq!(&destination.as_slice()[..32], &first.as_slice()[..32]);
        assert_eq!(&destination.as_slice()[32..64], &second.as_slice()[32..]);
    }

    #[test]
    fn test_multi_write_element_limit() {
        let context = context();
        let queue_pair = loopback(&context);
        let buffer = Buffer::new(&context, 64).unwrap();
        let destination = Buffer::new(&context, 1024).unwrap();
        let supported = context.limits().max_scatter_gather_elements;
        let slices = vec![LocalSlice::whole(&buffer); supported as usize + 1];
        assert!(matches!(
            queue_pair.multi_write(&slices, &destination.create_token(), None),
            Err(Error::TooManyElements { .. })
        ));
        assert!(matches!(
            queue_pair.multi_write(&[], &destination.create_token(), None),
            Err(Error::TooManyElements { requested: 0, .. })
        ));
    }

    #[test]
    fn test_fetch_and_add() {
        let context = context();
        let queue_pair = loopback(&context);
        let target = Atomic::new(&context).unwrap();
        let previous = Atomic::new(&context).unwrap();
        target.set_value_non_atomic(40);

        let mut token = RequestToken::new(&context);
        queue_pair
            .fetch_and_add_into(
                &previous,
                &target.create_token(),
                2,
                OperationFlags::default(),
                Some(&mut token),
            )
            .unwrap();
        token.wait_until_completed();
        assert!(token.was_successful());
        assert_eq!(target.value(), 42);
        assert_eq!(previous.value(), 40);
    }

    #[test]
    fn test_compare_and_swap() {
        let context = context();
        let queue_pair = loopback(&context);
        let target = Atomic::new(&context).unwrap();
        target.set_value_non_atomic(7);

        let mut token = RequestToken::new(&context);
        queue_pair
            .compare_and_swap(&target.create_token(), 7, 9, Some(&mut token))
            .unwrap();
        token.wait_until_completed();
        assert!(token.was_successful());
        assert_eq!(target.value(), 9);
        assert_eq!(context.default_atomic().value(), 7);

        queue_pair
            .compare_and_swap(&target.create_token(), 7, 11, Some(&mut token))
            .unwrap();
        token.wait_until_completed();
        assert_eq!(target.value(), 9);
        assert_eq!(context.default_atomic().value(), 9);
    }

    #[test]
    fn test_atomic_requires_atomic_target() {
        let context = context();
        let queue_pair = loopback(&context);
        let buffer = Buffer::new(&context, 8).unwrap();
        assert!(matches!(
            queue_pair.fetch_and_add(&buffer.create_token(), 1, None),
            Err(Error::InvalidAtomicTarget(_))
        ));
        let target = Atomic::new(&context).unwrap();
        let wide = Buffer::new(&context, 16).unwrap();
        assert!(matches!(
            queue_pair.fetch_and_add_into(
                &wide,
                &target.create_token(),
                1,
                OperationFlags::default(),
                None
            ),
            Err(Error::InvalidAtomicTarget(_))
        ));
    }

    #[test]
    fn test_send_and_receive_with_immediate() {
        let context = context();
        let queue_pair = loopback(&context);
        let receive_buffer = Arc::new(Buffer::new(&context, 128).unwrap());
        context.post_receive_buffer(receive_buffer.clone()).unwrap();

        let message = filled(&context, 100);
        let mut token = RequestToken::new(&context);
        queue_pair
            .send_with_immediate(&message, 0xabcd, Some(&mut token))
            .unwrap();
        token.wait_until_completed();
        assert!(token.was_successful());
        assert_eq!(token.immediate_value(), Some(0xabcd));

        let element = context.receive().unwrap();
        assert_eq!(element.bytes_written, 100);
        assert_eq!(element.immediate_value, Some(0xabcd));
        assert_eq!(element.queue_pair_number, queue_pair.queue_pair_number());
        assert!(Arc::ptr_eq(element.queue_pair.as_ref().unwrap(), &queue_pair));
        let buffer = element.buffer.unwrap();
        assert!(Arc::ptr_eq(&buffer, &receive_buffer));
        assert_eq!(&buffer.as_slice()[..100], message.as_slice());
        assert_eq!(context.posted_receive_buffers(), 0);
    }

    #[test]
    fn test_write_with_immediate_reposts_receive_buffer() {
        let context = context();
        let queue_pair = loopback(&context);
        context
            .post_receive_buffer(Arc::new(Buffer::new(&context, 16).unwrap()))
            .unwrap();

        let source = filled(&context, 64);
        let destination = Buffer::new(&context, 64).unwrap();
        queue_pair
            .write_with_immediate(&source, &destination.create_token(), 5, None)
            .unwrap();

        let element = context.receive().unwrap();
        assert!(element.buffer.is_none());
        assert_eq!(element.immediate_value, Some(5));
        assert_eq!(element.bytes_written, 64);
        assert_eq!(context.posted_receive_buffers(), 1);
        assert_eq!(source.as_slice(), destination.as_slice());
    }

    #[test]
    fn test_failed_receive_returns_buffer() {
        let context = context();
        let queue_pair = loopback(&context);
        let small = Arc::new(Buffer::new(&context, 16).unwrap());
        context.post_receive_buffer(small.clone()).unwrap();

        let message = filled(&context, 100);
        let mut token = RequestToken::new(&context);
        queue_pair.send(&message, Some(&mut token)).unwrap();
        token.wait_until_completed();
        assert!(!token.was_successful());

        let element = context.receive().unwrap();
        assert_eq!(element.status, CompletionStatus::LocalLengthError);
        assert_eq!(element.queue_pair_number, queue_pair.queue_pair_number());
        assert!(Arc::ptr_eq(element.buffer.as_ref().unwrap(), &small));
        assert_eq!(context.posted_receive_buffers(), 0);

        // The caller can put the buffer back into service.
        context.post_receive_buffer(element.buffer.unwrap()).unwrap();
        assert_eq!(context.posted_receive_buffers(), 1);
    }

    #[test]
    fn test_fenced_write_waits_for_earlier_send() {
        let context = context();
        let queue_pair = loopback(&context);
        let message = filled(&context, 8);
        let mut source = Buffer::new(&context, 8).unwrap();
        source.as_mut_slice().fill(9);
        let target = Buffer::new(&context, 8).unwrap();

        let mut send = RequestToken::new(&context);
        let mut write = RequestToken::new(&context);
        queue_pair.send(&message, Some(&mut send)).unwrap();
        queue_pair
            .write_with(
                &source,
                &target.create_token(),
                TransferOptions::default().with_flags(OperationFlags::default().fenced()),
                Some(&mut write),
            )
            .unwrap();
        assert!(!write.check_if_completed());
        assert!(!send.check_if_completed());
        assert!(target.as_slice().iter().all(|byte| *byte == 0));

        context
            .post_receive_buffer(Arc::new(Buffer::new(&context, 8).unwrap()))
            .unwrap();
        write.wait_until_completed();
        assert!(send.check_if_completed());
        assert!(send.was_successful() && write.was_successful());
        assert_eq!(target.as_slice(), source.as_slice());
        assert_eq!(
            context.receive().unwrap().buffer.unwrap().as_slice(),
            message.as_slice()
        );
    }

    #[test]
    fn test_stale_region_fails_asynchronously() {
        let context = context();
        let queue_pair = loopback(&context);
        let source = Buffer::new(&context, 64).unwrap();
        let stale = Buffer::new(&context, 64).unwrap().create_token();

        let mut token = RequestToken::new(&context);
        queue_pair.write(&source, &stale, Some(&mut token)).unwrap();
        token.wait_until_completed();
        assert!(!token.was_successful());
        assert_eq!(token.status(), Some(CompletionStatus::RemoteAccessError));

        let destination = Buffer::new(&context, 64).unwrap();
        queue_pair
            .write(&source, &destination.create_token(), Some(&mut token))
            .unwrap();
        token.wait_until_completed();
        assert_eq!(token.status(), Some(CompletionStatus::WorkRequestFlushed));
    }

    #[test]
    fn test_fire_and_forget_is_not_tracked() {
        let context = context();
        let queue_pair = loopback(&context);
        let source = filled(&context, 32);
        let destination = Buffer::new(&context, 32).unwrap();
        queue_pair
            .write(&source, &destination.create_token(), None)
            .unwrap();
        assert_eq!(context.outstanding_requests(), 0);
        assert_eq!(source.as_slice(), destination.as_slice());
    }
}
