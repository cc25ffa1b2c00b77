//! The message model: protocols as versioned namespaces of message types, and
//!  the `Message` trait implemented by everything that goes on the wire.

use crate::buffers::wire::WireWriter;
use crate::dynamic_types::SerializationContext;
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// protocol id reserved for the internal control protocol
pub const TEMPEST_PROTOCOL_ID: u8 = 1;

/// A versioned namespace of message types. Each message on the wire carries the id
///  of its protocol; several protocols can coexist on a single connection.
pub trait Protocol: Send + Sync + 'static {
    fn id(&self) -> u8;

    fn version(&self) -> u16;

    /// if true, the connection stays in `Handshaking` until session keys are
    ///  established
    fn requires_handshake(&self) -> bool {
        false
    }

    /// create an empty instance for an inbound message of the given type, to be
    ///  filled by `Message::read_payload`. `None` means the type is unknown to this
    ///  protocol version, and the frame is dropped without raising an error.
    fn create_message(&self, message_type: u16) -> Option<Box<dyn Message>>;
}

/// One strongly-typed unit of communication.
///
/// The `encrypted` / `authenticated` / reliability flags are static properties of
///  the message type, not of individual instances.
pub trait Message: Send + Sync + Debug + 'static {
    fn protocol_id(&self) -> u8;

    fn message_type(&self) -> u16;

    fn encrypted(&self) -> bool {
        false
    }

    fn authenticated(&self) -> bool {
        false
    }

    fn must_be_reliable(&self) -> bool {
        false
    }

    fn prefer_reliable(&self) -> bool {
        false
    }

    fn write_payload(&self, ctx: &mut SerializationContext, w: &mut WireWriter) -> anyhow::Result<()>;

    fn read_payload(&mut self, ctx: &SerializationContext, buf: &mut &[u8]) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub fn is_reliable(message: &dyn Message) -> bool {
    message.must_be_reliable() || message.prefer_reliable()
}

pub fn is_internal(message: &dyn Message) -> bool {
    message.protocol_id() == TEMPEST_PROTOCOL_ID
}

/// Decoded frame metadata, available to handlers alongside the message itself.
///
/// `message_id` / `is_response` are only populated on unreliable transports -
///  the stream path has no per-message ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub protocol_id: u8,
    pub message_type: u16,
    /// total frame length including header, type table, IV and tag
    pub message_length: u32,
    /// offset of the payload region within the frame
    pub header_length: u16,
    pub message_id: u32,
    pub is_response: bool,
}

/// The set of protocols negotiated for one connection. The internal control
///  protocol is always present.
pub struct ProtocolSet {
    protocols: FxHashMap<u8, Arc<dyn Protocol>>,
}

impl ProtocolSet {
    pub fn new() -> ProtocolSet {
        let mut protocols: FxHashMap<u8, Arc<dyn Protocol>> = FxHashMap::default();
        protocols.insert(TEMPEST_PROTOCOL_ID, Arc::new(crate::messages::TempestProtocol));
        ProtocolSet { protocols }
    }

    /// register an application protocol. Registering a second protocol with the same
    ///  id (or claiming the reserved internal id) is an error.
    pub fn register(&mut self, protocol: Arc<dyn Protocol>) -> anyhow::Result<()> {
        if protocol.id() == TEMPEST_PROTOCOL_ID {
            return Err(anyhow!("protocol id {} is reserved for the internal control protocol", TEMPEST_PROTOCOL_ID));
        }
        if self.protocols.contains_key(&protocol.id()) {
            return Err(anyhow!("registering a second protocol for id {}", protocol.id()));
        }
        self.protocols.insert(protocol.id(), protocol);
        Ok(())
    }

    pub fn find(&self, id: u8) -> Option<&Arc<dyn Protocol>> {
        self.protocols.get(&id)
    }

    pub fn requires_handshake(&self) -> bool {
        self.protocols.values().any(|p| p.requires_handshake())
    }

    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.protocols.keys().copied()
    }
}

impl Default for ProtocolSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyProtocol(u8);
    impl Protocol for DummyProtocol {
        fn id(&self) -> u8 {
            self.0
        }
        fn version(&self) -> u16 {
            1
        }
        fn create_message(&self, _message_type: u16) -> Option<Box<dyn Message>> {
            None
        }
    }

    #[test]
    fn test_internal_protocol_always_present() {
        let protocols = ProtocolSet::new();
        assert!(protocols.find(TEMPEST_PROTOCOL_ID).is_some());
        assert!(!protocols.requires_handshake());
    }

    #[test]
    fn test_register_rejects_duplicates_and_reserved_id() {
        let mut protocols = ProtocolSet::new();
        assert!(protocols.register(Arc::new(DummyProtocol(2))).is_ok());
        assert!(protocols.register(Arc::new(DummyProtocol(2))).is_err());
        assert!(protocols.register(Arc::new(DummyProtocol(TEMPEST_PROTOCOL_ID))).is_err());
    }
}
