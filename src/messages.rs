//! The internal control protocol (protocol id 1): keepalives, disconnect
//!  notification, datagram acknowledgement and the handshake envelope.
//!
//! Internal messages never raise `MessageSent` and are never recorded for
//!  retransmission; reliable ones still flow through the ordered delivery queue
//!  so control traffic keeps its place in the reliable stream.

use crate::buffers::wire::{self, WireWriter};
use crate::dynamic_types::SerializationContext;
use crate::protocol::{Message, Protocol, TEMPEST_PROTOCOL_ID};
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use std::any::Any;
use std::sync::Arc;

/// Why a connection ended. Carried on the `Disconnected` event and inside the
///  wire-level `Disconnect` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectReason {
    /// orderly close requested by either side
    #[default]
    Requested,
    /// transport-level failure with no more specific cause
    ConnectionFailed,
    /// a frame that could not be decoded
    MalformedFrame,
    /// a frame whose declared length exceeds the configured maximum
    MessageTooLarge,
    /// HMAC verification failed
    MessageAuthenticationFailed,
    /// key agreement could not be completed
    HandshakeFailed,
    /// application-defined reason, see the custom text
    Custom,
}

impl DisconnectReason {
    pub fn wire_code(&self) -> u8 {
        match self {
            DisconnectReason::Requested => 0,
            DisconnectReason::ConnectionFailed => 1,
            DisconnectReason::MalformedFrame => 2,
            DisconnectReason::MessageTooLarge => 3,
            DisconnectReason::MessageAuthenticationFailed => 4,
            DisconnectReason::HandshakeFailed => 5,
            DisconnectReason::Custom => 6,
        }
    }

    pub fn from_wire_code(code: u8) -> Option<DisconnectReason> {
        match code {
            0 => Some(DisconnectReason::Requested),
            1 => Some(DisconnectReason::ConnectionFailed),
            2 => Some(DisconnectReason::MalformedFrame),
            3 => Some(DisconnectReason::MessageTooLarge),
            4 => Some(DisconnectReason::MessageAuthenticationFailed),
            5 => Some(DisconnectReason::HandshakeFailed),
            6 => Some(DisconnectReason::Custom),
            _ => None,
        }
    }
}

pub const MSG_TYPE_PING: u16 = 1;
pub const MSG_TYPE_PONG: u16 = 2;
pub const MSG_TYPE_DISCONNECT: u16 = 3;
pub const MSG_TYPE_ACKNOWLEDGE: u16 = 4;
pub const MSG_TYPE_HANDSHAKE_OFFER: u16 = 5;
pub const MSG_TYPE_HANDSHAKE_ACCEPT: u16 = 6;

pub struct TempestProtocol;

impl Protocol for TempestProtocol {
    fn id(&self) -> u8 {
        TEMPEST_PROTOCOL_ID
    }

    fn version(&self) -> u16 {
        1
    }

    fn create_message(&self, message_type: u16) -> Option<Box<dyn Message>> {
        match message_type {
            MSG_TYPE_PING => Some(Box::new(Ping)),
            MSG_TYPE_PONG => Some(Box::new(Pong)),
            MSG_TYPE_DISCONNECT => Some(Box::<Disconnect>::default()),
            MSG_TYPE_ACKNOWLEDGE => Some(Box::<Acknowledge>::default()),
            MSG_TYPE_HANDSHAKE_OFFER => Some(Box::<HandshakeOffer>::default()),
            MSG_TYPE_HANDSHAKE_ACCEPT => Some(Box::<HandshakeAccept>::default()),
            _ => None,
        }
    }
}

macro_rules! tempest_message_boilerplate {
    () => {
        fn protocol_id(&self) -> u8 {
            TEMPEST_PROTOCOL_ID
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    };
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Ping;

impl Message for Ping {
    tempest_message_boilerplate!();

    fn message_type(&self) -> u16 {
        MSG_TYPE_PING
    }

    fn write_payload(&self, _ctx: &mut SerializationContext, _w: &mut WireWriter) -> anyhow::Result<()> {
        Ok(())
    }

    fn read_payload(&mut self, _ctx: &SerializationContext, _buf: &mut &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Pong;

impl Message for Pong {
    tempest_message_boilerplate!();

    fn message_type(&self) -> u16 {
        MSG_TYPE_PONG
    }

    fn write_payload(&self, _ctx: &mut SerializationContext, _w: &mut WireWriter) -> anyhow::Result<()> {
        Ok(())
    }

    fn read_payload(&mut self, _ctx: &SerializationContext, _buf: &mut &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: DisconnectReason,
    pub custom_reason: Option<String>,
}

impl Message for Disconnect {
    tempest_message_boilerplate!();

    fn message_type(&self) -> u16 {
        MSG_TYPE_DISCONNECT
    }

    fn prefer_reliable(&self) -> bool {
        true
    }

    fn write_payload(&self, _ctx: &mut SerializationContext, w: &mut WireWriter) -> anyhow::Result<()> {
        w.put_u8(self.reason.wire_code());
        wire::put_string(w, self.custom_reason.as_deref().unwrap_or(""));
        Ok(())
    }

    fn read_payload(&mut self, _ctx: &SerializationContext, buf: &mut &[u8]) -> anyhow::Result<()> {
        let code = buf.try_get_u8()?;
        self.reason = DisconnectReason::from_wire_code(code)
            .ok_or_else(|| anyhow::anyhow!("unknown disconnect reason code {}", code))?;
        let custom = wire::try_get_string(buf)?;
        self.custom_reason = if custom.is_empty() { None } else { Some(custom) };
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Acknowledge {
    pub message_id: u32,
}

impl Message for Acknowledge {
    tempest_message_boilerplate!();

    fn message_type(&self) -> u16 {
        MSG_TYPE_ACKNOWLEDGE
    }

    fn write_payload(&self, _ctx: &mut SerializationContext, w: &mut WireWriter) -> anyhow::Result<()> {
        w.put_u32_le(self.message_id);
        Ok(())
    }

    fn read_payload(&mut self, _ctx: &SerializationContext, buf: &mut &[u8]) -> anyhow::Result<()> {
        self.message_id = buf.try_get_u32_le()?;
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct HandshakeOffer {
    /// opaque key-agreement bytes, interpreted by the negotiated `KeyExchange`
    pub public: Vec<u8>,
}

impl Message for HandshakeOffer {
    tempest_message_boilerplate!();

    fn message_type(&self) -> u16 {
        MSG_TYPE_HANDSHAKE_OFFER
    }

    fn write_payload(&self, _ctx: &mut SerializationContext, w: &mut WireWriter) -> anyhow::Result<()> {
        w.put_usize_varint(self.public.len());
        w.put_slice(&self.public);
        Ok(())
    }

    fn read_payload(&mut self, _ctx: &SerializationContext, buf: &mut &[u8]) -> anyhow::Result<()> {
        let len = buf.try_get_usize_varint()?;
        self.public = wire::try_get_exact(buf, len)?;
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct HandshakeAccept {
    pub public: Vec<u8>,
}

impl Message for HandshakeAccept {
    tempest_message_boilerplate!();

    fn message_type(&self) -> u16 {
        MSG_TYPE_HANDSHAKE_ACCEPT
    }

    fn write_payload(&self, _ctx: &mut SerializationContext, w: &mut WireWriter) -> anyhow::Result<()> {
        w.put_usize_varint(self.public.len());
        w.put_slice(&self.public);
        Ok(())
    }

    fn read_payload(&mut self, _ctx: &SerializationContext, buf: &mut &[u8]) -> anyhow::Result<()> {
        let len = buf.try_get_usize_varint()?;
        self.public = wire::try_get_exact(buf, len)?;
        Ok(())
    }
}
