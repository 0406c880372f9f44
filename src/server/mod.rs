//! TCP command server.
//!
//! Remote clients send text requests naming a device, a method and its
//! arguments; the server forwards them to the matching [`AsyncDevice`]
//! and writes the result back once the device worker produces it.
//!
//! # Architecture
//!
//! ```text
//! CommandServer (accept loop)
//!     └── ClientConn (one task per connection)
//!             ├── read loop:  request → protocol::Request → AsyncDevice::call
//!             └── write task: ◄── replies from result handlers
//! ```
//!
//! [`AsyncDevice`]: crate::device::AsyncDevice

mod client_conn;
pub mod command_server;
pub mod protocol;
pub mod registry;

pub use command_server::CommandServer;
pub use protocol::{Reply, Request};
pub use registry::DeviceRegistry;
