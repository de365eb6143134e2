//! Control plane for reliable-connected RDMA: connection bootstrap, memory registration,
//! one-sided and two-sided operations, and completion tracking.
//!
//! A [`Context`] wraps one device. [`QueuePairFactory`] connects a [`QueuePair`] to a peer
//! over TCP, [`Buffer`] and [`Atomic`] are registered memory, and [`RegionToken`]s name
//! remote memory. Operations optionally carry a [`RequestToken`] that resolves when the
//! device reports completion.
//!
//! Without the `ibverbs` feature every context runs on the in-process [`SoftFabric`].

mod address;
mod atomic;
mod buffer;
mod config;
mod context;
mod device;
mod error;
mod handshake;
#[cfg(feature = "ibverbs")]
mod ibverbs_device;
pub mod logging;
mod primitives;
mod queue_pair;
mod queue_pair_factory;
mod region;
mod request_token;
mod soft_device;

pub use address::*;
pub use atomic::*;
pub use buffer::*;
pub use config::*;
pub use context::*;
pub use device::*;
pub use error::*;
pub use handshake::*;
#[cfg(feature = "ibverbs")]
pub use ibverbs_device::*;
pub use primitives::*;
pub use queue_pair::*;
pub use queue_pair_factory::*;
pub use region::*;
pub use request_token::RequestToken;
pub use soft_device::*;
