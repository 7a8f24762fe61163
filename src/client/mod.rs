pub mod session;
pub mod sink;
pub mod transport;

pub use session::{DrainPolicy, SessionState, StreamingSession};
pub use sink::{CollectingSink, LoggingSink, ResponseSink, TranscriptSink};
pub use transport::{Endpoint, StreamConnector, WebSocketConnector};
