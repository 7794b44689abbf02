//! WebSocket client layered on the secure stream (L1).
//!
//! Drives the HTTP upgrade, then frame assembly. Control frames are
//! handled here (pong replies, close codes); complete data messages are
//! handed up to the gateway layer.

pub mod frame;
pub mod handshake;

use bytes::Buf;
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::WsError;
use crate::stream::{SecureStream, StreamActivity};
use frame::{Frame, OpCode};

pub const UPGRADE_TIMEOUT_SECS: u64 = 10;

/// Idle seconds before the framer sends its own keepalive ping,
/// independent of the gateway heartbeat.
const KEEPALIVE_IDLE_SECS: u64 = 20;

/// Close code reported when the peer's close frame carries no payload.
const CLOSE_NO_STATUS: u16 = 1005;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    /// Sending/receiving HTTP headers prior to protocol switch.
    HttpHeaders,
    /// Upgraded and exchanging frames.
    Connected,
}

/// A completed inbound unit surfaced to the layer above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    /// The upgrade handshake completed.
    Upgraded,
    Text(String),
    Binary(Vec<u8>),
    /// The peer sent a close frame with this code.
    Closed(u16),
}

/// Reassembles frames into complete messages.
///
/// Control frames may interleave between the fragments of a data message
/// and must not disturb the fragment buffer.
#[derive(Default)]
struct MessageAssembler {
    fragment_opcode: Option<OpCode>,
    fragments: Vec<u8>,
}

/// What the assembler wants done with one inbound frame.
enum Assembled {
    /// Nothing yet; the frame extended a fragmented message.
    Pending,
    /// A complete data message.
    Message(WsEvent),
    /// A ping arrived; reply with a pong carrying this payload.
    ReplyPong(Vec<u8>),
    /// The peer closed with this code.
    Closed(u16),
}

impl MessageAssembler {
    fn push(&mut self, frame: Frame) -> Result<Assembled, WsError> {
        match frame.opcode {
            OpCode::Ping => Ok(Assembled::ReplyPong(frame.payload)),
            OpCode::Pong => Ok(Assembled::Pending),
            OpCode::Close => {
                let code = if frame.payload.len() >= 2 {
                    u16::from_be_bytes([frame.payload[0], frame.payload[1]])
                } else {
                    CLOSE_NO_STATUS
                };
                Ok(Assembled::Closed(code))
            }
            OpCode::Text | OpCode::Binary => {
                if self.fragment_opcode.is_some() {
                    return Err(WsError::Frame(
                        "data frame interleaved inside a fragmented message".into(),
                    ));
                }
                if frame.fin {
                    return Ok(Assembled::Message(data_event(frame.opcode, frame.payload)?));
                }
                self.fragment_opcode = Some(frame.opcode);
                self.fragments = frame.payload;
                Ok(Assembled::Pending)
            }
            OpCode::Continuation => {
                let Some(opcode) = self.fragment_opcode else {
                    return Err(WsError::Frame(
                        "continuation without a preceding data frame".into(),
                    ));
                };
                self.fragments.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.fragment_opcode = None;
                    let payload = std::mem::take(&mut self.fragments);
                    return Ok(Assembled::Message(data_event(opcode, payload)?));
                }
                Ok(Assembled::Pending)
            }
        }
    }
}

fn data_event(opcode: OpCode, payload: Vec<u8>) -> Result<WsEvent, WsError> {
    match opcode {
        OpCode::Text => String::from_utf8(payload)
            .map(WsEvent::Text)
            .map_err(|_| WsError::Frame("text frame is not utf-8".into())),
        OpCode::Binary => Ok(WsEvent::Binary(payload)),
        _ => Err(WsError::Frame("not a data opcode".into())),
    }
}

pub struct WsClient {
    stream: SecureStream,
    state: WsState,
    key: String,
    assembler: MessageAssembler,
    idle_secs: u64,
    handshake_secs: u64,
}

impl WsClient {
    /// Open the TLS stream and send the upgrade request. The response is
    /// consumed through [`Self::handle_buffer`] like any other inbound data.
    pub async fn connect(
        host: &str,
        port: u16,
        path: &str,
        tls: Arc<ClientConfig>,
        wake: Arc<Notify>,
    ) -> Result<Self, WsError> {
        let mut stream = SecureStream::connect(host, port, tls, wake).await?;
        let key = handshake::nonce();
        stream.write(handshake::upgrade_request(host, path, &key).as_bytes());

        Ok(Self {
            stream,
            state: WsState::HttpHeaders,
            key,
            assembler: MessageAssembler::default(),
            idle_secs: 0,
            handshake_secs: 0,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state == WsState::Connected
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        self.stream.wake_handle()
    }

    pub fn bytes_in(&self) -> u64 {
        self.stream.bytes_in()
    }

    pub fn bytes_out(&self) -> u64 {
        self.stream.bytes_out()
    }

    /// Queue a masked text frame. Only valid once upgraded.
    pub fn send_text(&mut self, payload: &str) {
        self.send_frame(OpCode::Text, payload.as_bytes());
    }

    pub fn send_frame(&mut self, opcode: OpCode, payload: &[u8]) {
        if self.state != WsState::Connected {
            tracing::warn!("dropping {opcode:?} frame queued before upgrade completed");
            return;
        }
        let encoded = Frame::encode(opcode, payload, frame::mask_key());
        self.stream.write(&encoded);
    }

    /// Wait for socket readiness, the one-second tick, or a wake.
    pub async fn drive(&mut self) -> Result<StreamActivity, WsError> {
        let activity = self.stream.drive().await?;
        if activity == StreamActivity::Data {
            self.idle_secs = 0;
        }
        Ok(activity)
    }

    /// Consume as much of the inbound buffer as forms one complete event.
    ///
    /// Call repeatedly after [`Self::drive`] reports data until it returns
    /// `Ok(None)`. Pings are answered here without surfacing.
    pub fn handle_buffer(&mut self) -> Result<Option<WsEvent>, WsError> {
        loop {
            match self.state {
                WsState::HttpHeaders => {
                    let buf = self.stream.read_buf_mut();
                    match handshake::parse_upgrade_response(buf.as_ref(), &self.key)? {
                        Some(consumed) => {
                            buf.advance(consumed);
                            self.state = WsState::Connected;
                            tracing::debug!("websocket upgrade complete");
                            return Ok(Some(WsEvent::Upgraded));
                        }
                        None => return Ok(None),
                    }
                }
                WsState::Connected => {
                    let buf = self.stream.read_buf_mut();
                    let Some((frame, consumed)) = Frame::decode(buf.as_ref())? else {
                        return Ok(None);
                    };
                    buf.advance(consumed);

                    match self.assembler.push(frame)? {
                        Assembled::Pending => {}
                        Assembled::ReplyPong(payload) => {
                            self.send_frame(OpCode::Pong, &payload);
                        }
                        Assembled::Message(event) => return Ok(Some(event)),
                        Assembled::Closed(code) => return Ok(Some(WsEvent::Closed(code))),
                    }
                }
            }
        }
    }

    /// One-second housekeeping: upgrade deadline and idle keepalive.
    pub fn on_second(&mut self) -> Result<(), WsError> {
        match self.state {
            WsState::HttpHeaders => {
                self.handshake_secs += 1;
                if self.handshake_secs >= UPGRADE_TIMEOUT_SECS {
                    return Err(WsError::UpgradeTimeout(UPGRADE_TIMEOUT_SECS));
                }
            }
            WsState::Connected => {
                self.idle_secs += 1;
                if self.idle_secs >= KEEPALIVE_IDLE_SECS {
                    self.idle_secs = 0;
                    self.send_frame(OpCode::Ping, b"");
                }
            }
        }
        Ok(())
    }

    /// Send a close frame and shut the TLS stream down.
    pub async fn close(&mut self, code: u16) {
        if self.state == WsState::Connected {
            self.send_frame(OpCode::Close, &code.to_be_bytes());
        }
        self.stream.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(opcode: OpCode, fin: bool, payload: &[u8]) -> Frame {
        Frame {
            opcode,
            fin,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn single_text_frame_completes_immediately() {
        let mut asm = MessageAssembler::default();
        match asm.push(data(OpCode::Text, true, b"{\"op\":11}")).unwrap() {
            Assembled::Message(WsEvent::Text(s)) => assert_eq!(s, "{\"op\":11}"),
            _ => panic!("expected a complete text message"),
        }
    }

    #[test]
    fn control_frames_do_not_disturb_fragments() {
        let mut asm = MessageAssembler::default();
        assert!(matches!(
            asm.push(data(OpCode::Text, false, b"hel")).unwrap(),
            Assembled::Pending
        ));
        // Ping interleaves mid-message and must be answered.
        assert!(matches!(
            asm.push(data(OpCode::Ping, true, b"k")).unwrap(),
            Assembled::ReplyPong(p) if p == b"k"
        ));
        match asm.push(data(OpCode::Continuation, true, b"lo")).unwrap() {
            Assembled::Message(WsEvent::Text(s)) => assert_eq!(s, "hello"),
            _ => panic!("expected reassembled message"),
        }
    }

    #[test]
    fn close_frame_surfaces_big_endian_code() {
        let mut asm = MessageAssembler::default();
        let payload = 4000u16.to_be_bytes();
        assert!(matches!(
            asm.push(data(OpCode::Close, true, &payload)).unwrap(),
            Assembled::Closed(4000)
        ));
    }

    #[test]
    fn close_without_payload_reports_no_status() {
        let mut asm = MessageAssembler::default();
        assert!(matches!(
            asm.push(data(OpCode::Close, true, b"")).unwrap(),
            Assembled::Closed(CLOSE_NO_STATUS)
        ));
    }

    #[test]
    fn continuation_without_start_is_an_error() {
        let mut asm = MessageAssembler::default();
        assert!(asm.push(data(OpCode::Continuation, true, b"x")).is_err());
    }

    #[test]
    fn new_data_frame_inside_fragmented_message_is_an_error() {
        let mut asm = MessageAssembler::default();
        let _ = asm.push(data(OpCode::Binary, false, b"a"));
        assert!(asm.push(data(OpCode::Binary, true, b"b")).is_err());
    }

    #[test]
    fn binary_fragments_reassemble() {
        let mut asm = MessageAssembler::default();
        let _ = asm.push(data(OpCode::Binary, false, &[1, 2]));
        let _ = asm.push(data(OpCode::Continuation, false, &[3]));
        match asm.push(data(OpCode::Continuation, true, &[4, 5])).unwrap() {
            Assembled::Message(WsEvent::Binary(b)) => assert_eq!(b, vec![1, 2, 3, 4, 5]),
            _ => panic!("expected reassembled binary message"),
        }
    }
}
