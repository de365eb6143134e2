//! Configuration for opening a [`crate::Context`].
//!
//! `ContextConfig` carries the device selection, the queue pair attributes used while
//! walking the INIT -> RTR -> RTS state machine, and optional queue sizes. Queue sizes left
//! as `None` are derived from the attributes the device reports, see [`QueueLimits`].
use std::str::FromStr;

use anyhow::Context as _;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::primitives::DeviceAttributes;
use crate::primitives::PathMtu;

/// Alignment of every buffer this crate allocates.
pub const PAGE_SIZE: usize = 4096;

/// Exclusive upper bound on the user payload a peer may attach to the connection
/// handshake.
pub const MAX_CONNECTION_USER_DATA_SIZE: usize = 1024;

/// Network interface whose address is logged when a factory binds.
pub const DEFAULT_NETWORK_INTERFACE: &str = "ib0";

const ENV_PREFIX: &str = "RDMA_CONDUIT_";

/// Which device provider a context is opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provider {
    /// libibverbs; requires the `ibverbs` feature.
    Ibverbs,
    /// The in-process software fabric.
    Software,
}

impl Default for Provider {
    fn default() -> Self {
        if cfg!(feature = "ibverbs") {
            Provider::Ibverbs
        } else {
            Provider::Software
        }
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ibverbs" | "verbs" => Ok(Provider::Ibverbs),
            "software" | "soft" => Ok(Provider::Software),
            other => anyhow::bail!("unknown provider '{}'", other),
        }
    }
}

/// Represents the configuration for a device context.
///
/// # Fields
///
/// * `provider` - The device provider to open.
/// * `device_index` - Index into the provider's device list, used when `device_name` is unset.
/// * `device_name` - Name of the device to open, i.e. 'mlx5_0'.
/// * `port_num` - The port number on the RDMA device.
/// * `completion_queue_length` - Entries in each of the send and receive completion queues.
/// * `shared_receive_queue_length` - Entries in the shared receive queue.
/// * `max_scatter_gather_elements` - Upper bound on elements in one work request.
/// * `path_mtu` - The path MTU (Maximum Transmission Unit) for connections.
/// * `retry_cnt` - The number of retry attempts for a connection request.
/// * `rnr_retry` - The number of retry attempts for a receiver not ready (RNR) condition.
/// * `qp_timeout` - The timeout for a queue pair operation.
/// * `min_rnr_timer` - The minimum RNR timer value.
/// * `max_dest_rd_atomic` - The maximum number of outstanding RDMA read operations at the destination.
/// * `max_rd_atomic` - The maximum number of outstanding RDMA read operations at the initiator.
/// * `pkey_index` - The partition key index.
/// * `network_interface` - Interface whose IPv4 address is reported when binding a factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub provider: Provider,
    pub device_index: usize,
    pub device_name: Option<String>,
    pub port_num: u8,
    pub completion_queue_length: Option<u32>,
    pub shared_receive_queue_length: Option<u32>,
    pub max_scatter_gather_elements: Option<u32>,
    pub path_mtu: PathMtu,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub qp_timeout: u8,
    pub min_rnr_timer: u8,
    pub max_dest_rd_atomic: u8,
    pub max_rd_atomic: u8,
    pub pkey_index: u16,
    pub network_interface: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            device_index: 0,
            device_name: None,
            port_num: 1,
            completion_queue_length: None,
            shared_receive_queue_length: None,
            max_scatter_gather_elements: None,
            path_mtu: PathMtu::Mtu4096,
            retry_cnt: 7,
            rnr_retry: 7,
            qp_timeout: 14, // 4.096 μs * 2^14 = ~67 ms
            min_rnr_timer: 12,
            max_dest_rd_atomic: 1,
            max_rd_atomic: 1,
            pkey_index: 0,
            network_interface: DEFAULT_NETWORK_INTERFACE.to_string(),
        }
    }
}

impl std::fmt::Display for ContextConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ContextConfig {{ provider: {:?}, device: {}, port_num: {}, completion_queue_length: {:?}, shared_receive_queue_length: {:?}, max_scatter_gather_elements: {:?}, path_mtu: {:?}, retry_cnt: {}, rnr_retry: {}, qp_timeout: {}, min_rnr_timer: {}, max_dest_rd_atomic: {}, max_rd_atomic: {}, pkey_index: {}, network_interface: {} }}",
            self.provider,
            self.device_name
                .clone()
                .unwrap_or_else(|| format!("#{}", self.device_index)),
            self.port_num,
            self.completion_queue_length,
            self.shared_receive_queue_length,
            self.max_scatter_gather_elements,
            self.path_mtu,
            self.retry_cnt,
            self.rnr_retry,
            self.qp_timeout,
            self.min_rnr_timer,
            self.max_dest_rd_atomic,
            self.max_rd_atomic,
            self.pkey_index,
            self.network_interface,
        )
    }
}

impl ContextConfig {
    /// Default configuration overlaid with `RDMA_CONDUIT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up by variable name, e.g. `RDMA_CONDUIT_PORT`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(value) = var("PROVIDER") {
            self.provider = value.parse()?;
        }
        if let Some(value) = var("DEVICE_INDEX") {
            self.device_index = parse_var("DEVICE_INDEX", &value)?;
        }
        if let Some(value) = var("DEVICE_NAME") {
            self.device_name = Some(value);
        }
        if let Some(value) = var("PORT") {
            self.port_num = parse_var("PORT", &value)?;
        }
        if let Some(value) = var("CQ_LENGTH") {
            self.completion_queue_length = Some(parse_var("CQ_LENGTH", &value)?);
        }
        if let Some(value) = var("SRQ_LENGTH") {
            self.shared_receive_queue_length = Some(parse_var("SRQ_LENGTH", &value)?);
        }
        if let Some(value) = var("MAX_SGE") {
            self.max_scatter_gather_elements = Some(parse_var("MAX_SGE", &value)?);
        }
        if let Some(value) = var("PATH_MTU") {
            let bytes: u32 = parse_var("PATH_MTU", &value)?;
            self.path_mtu = PathMtu::from_bytes(bytes)
                .with_context(|| format!("invalid path MTU {}", bytes))?;
        }
        if let Some(value) = var("INTERFACE") {
            self.network_interface = value;
        }
        Ok(self)
    }

    /// Resolves queue sizes against what the device supports.
    pub fn limits(&self, attributes: &DeviceAttributes) -> QueueLimits {
        QueueLimits {
            completion_queue_length: self
                .completion_queue_length
                .unwrap_or(attributes.max_qp_wr / 4)
                .max(1),
            shared_receive_queue_length: self
                .shared_receive_queue_length
                .unwrap_or(attributes.max_srq_wr.saturating_sub(1))
                .max(1),
            max_scatter_gather_elements: self
                .max_scatter_gather_elements
                .unwrap_or(attributes.max_sge / 8)
                .max(1),
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(value
        .parse::<T>()
        .with_context(|| format!("invalid value '{}' for {}{}", value, ENV_PREFIX, name))?)
}

/// Queue sizes a context was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLimits {
    pub completion_queue_length: u32,
    pub shared_receive_queue_length: u32,
    pub max_scatter_gather_elements: u32,
}
