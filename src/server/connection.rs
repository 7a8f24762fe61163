//! # WebSocket Connection Task
//!
//! One actor per accepted WebSocket connection on
//! `/invocations-bidirectional-stream`. The actor is the connection's inbound
//! task: it converts raw transport frames into frame events, runs them through
//! its private `Reassembler`, hands complete messages to the dispatch strategy,
//! and carries out control-frame decisions.
//!
//! ## Outbound path:
//! Replies reach the actor through the registry. The registry holds a
//! `ConnectionSink` that pushes the frame onto an unbounded channel and pokes
//! the actor with a `Flush` message; the actor drains the channel in order and
//! writes each frame. Teardown drains the channel one last time before the
//! close frame goes out, so replies already produced are never cut off.
//!
//! ## Lifecycle:
//! `started` registers the connection and starts the heartbeat. Close,
//! disconnect, protocol errors and heartbeat timeouts all end in `teardown`,
//! which is safe to reach more than once.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use bytes::Bytes;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::ProtocolError;
use crate::protocol::control::{ControlAction, ControlHandler};
use crate::protocol::frame::{
    CloseCode, CloseInfo, ConnectionId, FrameEvent, MessageKind, OutboundFrame,
};
use crate::protocol::reassembler::{FrameOutcome, Reassembler};
use crate::server::registry::{OutboundSink, SinkClosed};
use crate::state::AppState;

/// Wake-up for the actor: frames are waiting on its outbound channel.
#[derive(Message)]
#[rtype(result = "()")]
struct Flush;

/// The registry's handle on one connection's write side.
pub struct ConnectionSink {
    frames: mpsc::UnboundedSender<OutboundFrame>,
    notify: Recipient<Flush>,
}

impl OutboundSink for ConnectionSink {
    fn deliver(&self, frame: OutboundFrame) -> Result<(), SinkClosed> {
        self.frames.send(frame).map_err(|_| SinkClosed)?;
        self.notify.do_send(Flush);
        Ok(())
    }
}

pub struct DuplexConnection {
    id: ConnectionId,
    state: AppState,
    reassembler: Reassembler,
    control: ControlHandler,

    /// Kind of the continuation run the transport is currently delivering
    continuation: Option<MessageKind>,

    outbound: Option<mpsc::UnboundedReceiver<OutboundFrame>>,
    last_heartbeat: Instant,
    torn_down: bool,
}

impl DuplexConnection {
    pub fn new(state: AppState) -> Self {
        let id = ConnectionId::new();
        let max_message_bytes = state.config.server.max_message_bytes;
        Self {
            id,
            state,
            reassembler: Reassembler::new(id, max_message_bytes),
            control: ControlHandler::new(id),
            continuation: None,
            outbound: None,
            last_heartbeat: Instant::now(),
            torn_down: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn on_frame(&mut self, event: FrameEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match self.reassembler.on_frame(event) {
            Ok(FrameOutcome::Message(message)) => {
                debug!(
                    connection = %self.id,
                    kind = %message.kind(),
                    bytes = message.len(),
                    "Dispatching message"
                );
                self.state.record_message_dispatched();
                self.state
                    .handler
                    .on_message(self.id, message, &self.state.registry);
            }
            Ok(FrameOutcome::Pending) => {}
            Ok(FrameOutcome::Control(frame)) => {
                let action = self.control.handle(frame);
                self.execute(action, ctx);
            }
            Err(err) => self.fail(err, ctx),
        }
    }

    fn fail(&mut self, err: ProtocolError, ctx: &mut ws::WebsocketContext<Self>) {
        self.state.record_protocol_error();
        self.reassembler.reset();
        let action = self.control.protocol_failure(&err);
        self.execute(action, ctx);
    }

    fn execute(&mut self, action: ControlAction, ctx: &mut ws::WebsocketContext<Self>) {
        match action {
            ControlAction::Ignore => {}
            ControlAction::Pong(payload) => ctx.pong(&payload),
            ControlAction::Close(ack) => {
                self.flush_outbound(ctx);
                if let Some(info) = ack {
                    debug!(connection = %self.id, code = info.code.0, "Sending close frame");
                    ctx.close(Some(close_reason(info)));
                }
                self.teardown(ctx);
            }
            ControlAction::Teardown => self.teardown(ctx),
        }
    }

    /// Write every frame already queued for this connection.
    fn flush_outbound(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(outbound) = self.outbound.as_mut() else {
            return;
        };
        while let Ok(frame) = outbound.try_recv() {
            match frame {
                OutboundFrame::Text(text) => ctx.text(text),
                OutboundFrame::Binary(data) => ctx.binary(data),
                OutboundFrame::Pong(payload) => ctx.pong(&payload),
                OutboundFrame::Close(info) => {
                    if let ControlAction::Close(Some(info)) = self.control.local_close(info) {
                        ctx.close(Some(close_reason(info)));
                    }
                }
            }
        }
    }

    fn teardown(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.torn_down {
            self.torn_down = true;
            self.reassembler.reset();
            self.state.registry.remove(self.id);
            self.outbound = None;
        }
        ctx.stop();
    }
}

impl Actor for DuplexConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (frames, outbound) = mpsc::unbounded_channel();
        self.outbound = Some(outbound);
        self.state.registry.add(
            self.id,
            ConnectionSink {
                frames,
                notify: ctx.address().recipient(),
            },
        );
        self.state.record_connection_opened();
        info!(connection = %self.id, "WebSocket connection started");

        let interval = self.state.config.server.heartbeat_interval();
        let timeout = self.state.config.server.client_timeout();
        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(connection = %act.id, "Heartbeat timeout, closing connection");
                let action = act
                    .control
                    .local_close(CloseInfo::new(CloseCode::AWAY, "heartbeat timeout"));
                act.execute(action, ctx);
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if !self.torn_down {
            self.torn_down = true;
            self.reassembler.reset();
            self.state.registry.remove(self.id);
        }
        self.state.record_connection_closed();
        match self.control.peer_close() {
            Some(info) => info!(
                connection = %self.id,
                code = info.code.0,
                reason = %info.reason,
                "WebSocket connection stopped"
            ),
            None => info!(connection = %self.id, "WebSocket connection stopped"),
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DuplexConnection {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        if self.torn_down {
            return;
        }

        let event = match msg {
            Ok(message) => {
                self.last_heartbeat = Instant::now();
                match to_frame_event(&mut self.continuation, message) {
                    Ok(Some(event)) => event,
                    Ok(None) => return,
                    Err(err) => return self.fail(err, ctx),
                }
            }
            Err(err) => {
                error!(connection = %self.id, error = %err, "WebSocket transport error");
                FrameEvent::Disconnect
            }
        };

        self.on_frame(event, ctx);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        if !self.torn_down {
            self.on_frame(FrameEvent::Disconnect, ctx);
        }
    }
}

impl Handler<Flush> for DuplexConnection {
    type Result = ();

    fn handle(&mut self, _msg: Flush, ctx: &mut Self::Context) {
        self.flush_outbound(ctx);
    }
}

/// Map one transport message to a frame event.
///
/// `continuation` tracks the kind of the run the transport is in the middle
/// of, since its continuation frames do not repeat it. `Ok(None)` means the
/// message carries nothing for the relay.
pub fn to_frame_event(
    continuation: &mut Option<MessageKind>,
    message: ws::Message,
) -> Result<Option<FrameEvent>, ProtocolError> {
    let event = match message {
        ws::Message::Text(text) => FrameEvent::TextData {
            payload: Bytes::copy_from_slice(text.as_bytes()),
            is_final: true,
        },
        ws::Message::Binary(data) => FrameEvent::BinaryData {
            payload: data,
            is_final: true,
        },
        ws::Message::Continuation(item) => match item {
            actix_http::ws::Item::FirstText(data) => {
                *continuation = Some(MessageKind::Text);
                data_event(MessageKind::Text, data, false)
            }
            actix_http::ws::Item::FirstBinary(data) => {
                *continuation = Some(MessageKind::Binary);
                data_event(MessageKind::Binary, data, false)
            }
            actix_http::ws::Item::Continue(data) => match *continuation {
                Some(kind) => data_event(kind, data, false),
                None => return Err(ProtocolError::UnexpectedContinuation),
            },
            actix_http::ws::Item::Last(data) => match continuation.take() {
                Some(kind) => data_event(kind, data, true),
                None => return Err(ProtocolError::UnexpectedContinuation),
            },
        },
        ws::Message::Ping(data) => FrameEvent::Ping(data),
        ws::Message::Pong(data) => FrameEvent::Pong(data),
        ws::Message::Close(reason) => FrameEvent::Close(match reason {
            Some(reason) => CloseInfo::new(
                CloseCode(u16::from(reason.code)),
                reason.description.unwrap_or_default(),
            ),
            None => CloseInfo::normal(),
        }),
        ws::Message::Nop => return Ok(None),
    };
    Ok(Some(event))
}

fn data_event(kind: MessageKind, payload: Bytes, is_final: bool) -> FrameEvent {
    match kind {
        MessageKind::Text => FrameEvent::TextData { payload, is_final },
        MessageKind::Binary => FrameEvent::BinaryData { payload, is_final },
    }
}

fn close_reason(info: CloseInfo) -> ws::CloseReason {
    ws::CloseReason {
        code: ws::CloseCode::from(info.code.0),
        description: if info.reason.is_empty() {
            None
        } else {
            Some(info.reason)
        },
    }
}

/// WebSocket upgrade for `/invocations-bidirectional-stream`.
pub async fn stream_endpoint(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        query = %req.query_string(),
        "New WebSocket connection request"
    );

    let connection = DuplexConnection::new(state.get_ref().clone());
    ws::WsResponseBuilder::new(connection, &req, stream)
        .frame_size(state.config.server.max_frame_bytes)
        .start()
}
