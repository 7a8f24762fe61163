//! # Duplex Protocol Layer
//!
//! Transport-independent pieces of the streaming protocol: frame and message
//! types, fragment reassembly, and control-frame decisions. Nothing in here
//! touches a socket; the server connection task feeds it events and carries
//! out what it decides.

pub mod control;
pub mod frame;
pub mod reassembler;
