pub mod connection;
pub mod dispatch;
pub mod registry;

pub use connection::stream_endpoint;
pub use dispatch::{DispatchMode, MessageHandler};
pub use registry::ConnectionRegistry;
