//! # Frame Reassembly
//!
//! Turns the per-connection sequence of frame events into complete logical
//! messages, following the fragmentation rules of RFC 6455 section 5.4.
//!
//! ## Rules:
//! - A non-final data frame opens (or extends) a fragment run of its kind.
//! - A final data frame closes the open run of its kind and emits one message;
//!   with no run open it is a complete message on its own.
//! - Only one kind of run may be open at a time. A data frame of the other
//!   kind while a run is open is a protocol error, and both buffers are dropped.
//! - Close, disconnect and unknown frames drop any partial buffers and are
//!   handed on to the control-frame handler.
//!
//! Each connection task owns exactly one `Reassembler`, so the buffers are
//! never shared and need no locking.

use bytes::{Bytes, BytesMut};
use tracing::{debug, info};

use crate::error::ProtocolError;
use crate::protocol::frame::{CloseInfo, ConnectionId, FrameEvent, LogicalMessage, MessageKind};

/// Control events passed through the reassembler untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Ping(Bytes),
    Pong(Bytes),
    Close(CloseInfo),
    Disconnect,
    Unknown(String),
}

/// Result of feeding one frame event to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A logical message is complete
    Message(LogicalMessage),
    /// A fragment was buffered; nothing to emit yet
    Pending,
    /// A control event for the control-frame handler
    Control(ControlFrame),
}

/// Fragment accumulation state for one connection.
#[derive(Debug)]
pub struct Reassembler {
    connection: ConnectionId,

    /// `Some` while a text run is open, even if every fragment so far was empty
    text: Option<BytesMut>,

    /// `Some` while a binary run is open
    binary: Option<BytesMut>,

    /// Optional cap on the aggregate size of one logical message
    max_message_bytes: Option<usize>,
}

impl Reassembler {
    pub fn new(connection: ConnectionId, max_message_bytes: Option<usize>) -> Self {
        Self {
            connection,
            text: None,
            binary: None,
            max_message_bytes,
        }
    }

    /// Feed one frame event.
    ///
    /// Never blocks. On `Err` the partial buffers have already been dropped and
    /// the connection is expected to be torn down.
    pub fn on_frame(&mut self, event: FrameEvent) -> Result<FrameOutcome, ProtocolError> {
        match event {
            FrameEvent::TextData { payload, is_final } => {
                self.on_data(MessageKind::Text, payload, is_final)
            }
            FrameEvent::BinaryData { payload, is_final } => {
                self.on_data(MessageKind::Binary, payload, is_final)
            }
            FrameEvent::Ping(payload) => Ok(FrameOutcome::Control(ControlFrame::Ping(payload))),
            FrameEvent::Pong(payload) => Ok(FrameOutcome::Control(ControlFrame::Pong(payload))),
            FrameEvent::Close(info) => {
                self.reset();
                Ok(FrameOutcome::Control(ControlFrame::Close(info)))
            }
            FrameEvent::Disconnect => {
                self.reset();
                Ok(FrameOutcome::Control(ControlFrame::Disconnect))
            }
            FrameEvent::Unknown(kind) => {
                self.reset();
                Ok(FrameOutcome::Control(ControlFrame::Unknown(kind)))
            }
        }
    }

    /// Kind of the fragment run currently open, if any.
    pub fn open_run(&self) -> Option<MessageKind> {
        if self.text.is_some() {
            Some(MessageKind::Text)
        } else if self.binary.is_some() {
            Some(MessageKind::Binary)
        } else {
            None
        }
    }

    /// Bytes currently held across both buffers.
    pub fn buffered_len(&self) -> usize {
        self.text.as_ref().map_or(0, |b| b.len()) + self.binary.as_ref().map_or(0, |b| b.len())
    }

    /// Drop any partial buffers.
    pub fn reset(&mut self) {
        if self.open_run().is_some() {
            debug!(
                connection = %self.connection,
                dropped_bytes = self.buffered_len(),
                "Dropping partial fragment buffers"
            );
        }
        self.text = None;
        self.binary = None;
    }

    fn on_data(
        &mut self,
        kind: MessageKind,
        payload: Bytes,
        is_final: bool,
    ) -> Result<FrameOutcome, ProtocolError> {
        if self.buffer(other(kind)).is_some() {
            self.reset();
            return Err(ProtocolError::MixedFragments);
        }

        let buffered = self.buffer(kind).as_ref().map_or(0, |b| b.len());
        let attempted = buffered + payload.len();
        if let Some(limit) = self.max_message_bytes {
            if attempted > limit {
                self.reset();
                return Err(ProtocolError::MessageTooLarge { limit, attempted });
            }
        }

        if !is_final {
            self.buffer(kind)
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(&payload);
            debug!(
                connection = %self.connection,
                kind = %kind,
                fragment_bytes = payload.len(),
                buffered_bytes = attempted,
                "Buffered fragment"
            );
            return Ok(FrameOutcome::Pending);
        }

        let complete = match self.buffer(kind).take() {
            Some(mut run) => {
                run.extend_from_slice(&payload);
                info!(
                    connection = %self.connection,
                    kind = %kind,
                    total_bytes = run.len(),
                    "Reassembled fragmented message"
                );
                run.freeze()
            }
            None => payload,
        };

        let message = match kind {
            MessageKind::Text => String::from_utf8(complete.to_vec())
                .map(LogicalMessage::Text)
                .map_err(|_| ProtocolError::InvalidUtf8)?,
            MessageKind::Binary => LogicalMessage::Binary(complete),
        };
        Ok(FrameOutcome::Message(message))
    }

    fn buffer(&mut self, kind: MessageKind) -> &mut Option<BytesMut> {
        match kind {
            MessageKind::Text => &mut self.text,
            MessageKind::Binary => &mut self.binary,
        }
    }
}

fn other(kind: MessageKind) -> MessageKind {
    match kind {
        MessageKind::Text => MessageKind::Binary,
        MessageKind::Binary => MessageKind::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::CloseCode;

    fn reassembler() -> Reassembler {
        Reassembler::new(ConnectionId::new(), None)
    }

    fn feed(r: &mut Reassembler, events: Vec<FrameEvent>) -> Vec<Result<FrameOutcome, ProtocolError>> {
        events.into_iter().map(|e| r.on_frame(e)).collect()
    }

    #[test]
    fn test_single_final_frame_is_complete_message() {
        let mut r = reassembler();
        let outcome = r.on_frame(FrameEvent::text("hello")).unwrap();
        assert_eq!(outcome, FrameOutcome::Message(LogicalMessage::Text("hello".to_string())));

        let outcome = r.on_frame(FrameEvent::binary(vec![1u8, 2, 3])).unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Message(LogicalMessage::Binary(Bytes::from_static(&[1, 2, 3])))
        );
    }

    #[test]
    fn test_fragmented_text_concatenates_in_order() {
        let mut r = reassembler();
        let results = feed(
            &mut r,
            vec![
                FrameEvent::text_fragment("ab"),
                FrameEvent::text_fragment("cd"),
                FrameEvent::text("ef"),
            ],
        );

        assert_eq!(results[0], Ok(FrameOutcome::Pending));
        assert_eq!(results[1], Ok(FrameOutcome::Pending));
        assert_eq!(
            results[2],
            Ok(FrameOutcome::Message(LogicalMessage::Text("abcdef".to_string())))
        );
        assert_eq!(r.open_run(), None);
        assert_eq!(r.buffered_len(), 0);
    }

    #[test]
    fn test_fragmented_binary_emits_exactly_once() {
        let mut r = reassembler();
        let results = feed(
            &mut r,
            vec![
                FrameEvent::binary_fragment(vec![0u8, 1]),
                FrameEvent::binary_fragment(Vec::<u8>::new()),
                FrameEvent::binary(vec![2u8]),
            ],
        );

        let messages: Vec<_> = results
            .into_iter()
            .filter_map(|r| match r {
                Ok(FrameOutcome::Message(m)) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec![LogicalMessage::Binary(Bytes::from_static(&[0, 1, 2]))]);
    }

    #[test]
    fn test_empty_fragment_still_opens_run() {
        let mut r = reassembler();
        assert_eq!(r.on_frame(FrameEvent::text_fragment("")), Ok(FrameOutcome::Pending));
        assert_eq!(r.open_run(), Some(MessageKind::Text));

        // A binary fragment now interleaves with the open (empty) text run.
        assert_eq!(
            r.on_frame(FrameEvent::binary_fragment(vec![9u8])),
            Err(ProtocolError::MixedFragments)
        );
    }

    #[test]
    fn test_interleaved_fragments_are_protocol_error() {
        let mut r = reassembler();
        let results = feed(
            &mut r,
            vec![
                FrameEvent::text_fragment("partial"),
                FrameEvent::binary_fragment(vec![1u8]),
            ],
        );

        assert_eq!(results[0], Ok(FrameOutcome::Pending));
        assert_eq!(results[1], Err(ProtocolError::MixedFragments));
        assert!(!results.iter().any(|r| matches!(r, Ok(FrameOutcome::Message(_)))));
        assert_eq!(r.open_run(), None);
    }

    #[test]
    fn test_final_frame_of_other_kind_during_run_is_protocol_error() {
        let mut r = reassembler();
        r.on_frame(FrameEvent::binary_fragment(vec![1u8])).unwrap();
        assert_eq!(r.on_frame(FrameEvent::text("x")), Err(ProtocolError::MixedFragments));
    }

    #[test]
    fn test_utf8_split_across_fragments() {
        let mut r = reassembler();
        let snowman = "☃".as_bytes();
        r.on_frame(FrameEvent::text_fragment(snowman[..1].to_vec())).unwrap();
        let outcome = r.on_frame(FrameEvent::text(snowman[1..].to_vec())).unwrap();
        assert_eq!(outcome, FrameOutcome::Message(LogicalMessage::Text("☃".to_string())));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut r = reassembler();
        assert_eq!(
            r.on_frame(FrameEvent::text(vec![0xffu8, 0xfe])),
            Err(ProtocolError::InvalidUtf8)
        );
    }

    #[test]
    fn test_size_cap_fails_fast() {
        let mut r = Reassembler::new(ConnectionId::new(), Some(4));
        assert_eq!(r.on_frame(FrameEvent::binary_fragment(vec![0u8; 3])), Ok(FrameOutcome::Pending));
        assert_eq!(
            r.on_frame(FrameEvent::binary_fragment(vec![0u8; 2])),
            Err(ProtocolError::MessageTooLarge { limit: 4, attempted: 5 })
        );
        assert_eq!(r.buffered_len(), 0);

        // Exactly at the cap is fine.
        assert!(matches!(
            r.on_frame(FrameEvent::binary(vec![0u8; 4])),
            Ok(FrameOutcome::Message(_))
        ));
    }

    #[test]
    fn test_close_and_disconnect_clear_buffers() {
        let mut r = reassembler();
        r.on_frame(FrameEvent::text_fragment("half")).unwrap();
        let outcome = r
            .on_frame(FrameEvent::Close(CloseInfo::new(CloseCode::NORMAL, "bye")))
            .unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Control(ControlFrame::Close(CloseInfo::new(CloseCode::NORMAL, "bye")))
        );
        assert_eq!(r.open_run(), None);

        r.on_frame(FrameEvent::binary_fragment(vec![1u8])).unwrap();
        assert_eq!(
            r.on_frame(FrameEvent::Disconnect),
            Ok(FrameOutcome::Control(ControlFrame::Disconnect))
        );
        assert_eq!(r.buffered_len(), 0);
    }

    #[test]
    fn test_ping_does_not_disturb_open_run() {
        let mut r = reassembler();
        r.on_frame(FrameEvent::text_fragment("a")).unwrap();
        assert_eq!(
            r.on_frame(FrameEvent::Ping(Bytes::from_static(b"hb"))),
            Ok(FrameOutcome::Control(ControlFrame::Ping(Bytes::from_static(b"hb"))))
        );
        assert_eq!(
            r.on_frame(FrameEvent::text("b")),
            Ok(FrameOutcome::Message(LogicalMessage::Text("ab".to_string())))
        );
    }
}
