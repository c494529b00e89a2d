//! # Device Handles and Topology
//!
//! Everything between the engine and the devices under test.
//!
//! - [`DeviceHandle`] wraps one [`bridge_traits::DeviceControl`] with its role
//!   and run bookkeeping; [`AbsentDevice`] stands in for empty roles
//! - [`TopologyResolver`] turns DUT identifiers into handles
//! - [`Topology`] links Sender, Repeater and Slave and tears them down
//! - [`loopback`] provides the `local` SoftPlayer with fault injection

pub mod error;
pub mod handle;
pub mod loopback;
pub mod resolver;
pub mod topology;

pub use error::{DeviceError, Result};
pub use handle::{AbsentDevice, DeviceHandle, Observation};
pub use loopback::{FaultKind, LoopbackDevice, LoopbackNetwork};
pub use resolver::TopologyResolver;
pub use topology::{DroppedDevice, Topology};
