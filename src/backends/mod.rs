//! Compile backends, in routing priority order.

pub mod container;
#[cfg(feature = "http-compilation")]
pub mod hosted;
pub mod in_process;
#[cfg(feature = "http-compilation")]
pub mod remote;

pub use container::ContainerBackend;
#[cfg(feature = "http-compilation")]
pub use hosted::HostedApiBackend;
pub use in_process::InProcessBackend;
#[cfg(feature = "http-compilation")]
pub use remote::RemoteServerBackend;
