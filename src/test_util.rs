//! Message and protocol fixtures shared by unit tests across the crate.

use crate::buffers::wire::{self, WireWriter};
use crate::dynamic_types::{DynamicValue, SerializationContext, TypeRegistry};
use crate::protocol::{Message, Protocol};
use bytes::{Buf, BufMut};
use std::any::Any;
use std::sync::Arc;

pub const TEST_PROTOCOL_ID: u8 = 2;

pub struct TestProtocol;

impl Protocol for TestProtocol {
    fn id(&self) -> u8 {
        TEST_PROTOCOL_ID
    }

    fn version(&self) -> u16 {
        1
    }

    fn create_message(&self, message_type: u16) -> Option<Box<dyn Message>> {
        match message_type {
            1 => Some(Box::<EchoMessage>::default()),
            2 => Some(Box::<SecretMessage>::default()),
            3 => Some(Box::<TaggedMessage>::default()),
            4 => Some(Box::<UnreliableMessage>::default()),
            _ => None,
        }
    }
}

/// A handshake-requiring protocol with the same message set.
pub struct SecureTestProtocol;

impl Protocol for SecureTestProtocol {
    fn id(&self) -> u8 {
        3
    }

    fn version(&self) -> u16 {
        1
    }

    fn requires_handshake(&self) -> bool {
        true
    }

    fn create_message(&self, message_type: u16) -> Option<Box<dyn Message>> {
        TestProtocol.create_message(message_type)
    }
}

macro_rules! test_message_boilerplate {
    ($message_type:expr) => {
        fn protocol_id(&self) -> u8 {
            TEST_PROTOCOL_ID
        }

        fn message_type(&self) -> u16 {
            $message_type
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    };
}

/// Plain reliable text message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EchoMessage {
    pub text: String,
}

impl EchoMessage {
    pub fn new(text: &str) -> EchoMessage {
        EchoMessage { text: text.to_owned() }
    }
}

impl Message for EchoMessage {
    test_message_boilerplate!(1);

    fn prefer_reliable(&self) -> bool {
        true
    }

    fn write_payload(&self, _ctx: &mut SerializationContext, w: &mut WireWriter) -> anyhow::Result<()> {
        wire::put_string(w, &self.text);
        Ok(())
    }

    fn read_payload(&mut self, _ctx: &SerializationContext, buf: &mut &[u8]) -> anyhow::Result<()> {
        self.text = wire::try_get_string(buf)?;
        Ok(())
    }
}

/// Encrypted and authenticated text message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SecretMessage {
    pub secret: String,
}

impl Message for SecretMessage {
    test_message_boilerplate!(2);

    fn encrypted(&self) -> bool {
        true
    }

    fn authenticated(&self) -> bool {
        true
    }

    fn write_payload(&self, _ctx: &mut SerializationContext, w: &mut WireWriter) -> anyhow::Result<()> {
        wire::put_string(w, &self.secret);
        Ok(())
    }

    fn read_payload(&mut self, _ctx: &SerializationContext, buf: &mut &[u8]) -> anyhow::Result<()> {
        self.secret = wire::try_get_string(buf)?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl DynamicValue for Point {
    fn type_name(&self) -> &'static str {
        "test.point"
    }

    fn write_value(&self, w: &mut WireWriter) -> anyhow::Result<()> {
        w.put_u32_le(self.x);
        w.put_u32_le(self.y);
        Ok(())
    }

    fn read_value(&mut self, buf: &mut &[u8]) -> anyhow::Result<()> {
        self.x = buf.try_get_u32_le()?;
        self.y = buf.try_get_u32_le()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Message embedding a polymorphic value, exercising the per-frame type table.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TaggedMessage {
    pub point: Point,
}

impl Message for TaggedMessage {
    test_message_boilerplate!(3);

    fn write_payload(&self, ctx: &mut SerializationContext, w: &mut WireWriter) -> anyhow::Result<()> {
        ctx.write_dynamic(w, &self.point)
    }

    fn read_payload(&mut self, ctx: &SerializationContext, buf: &mut &[u8]) -> anyhow::Result<()> {
        let value = ctx.read_dynamic(buf)?;
        self.point = value
            .as_any()
            .downcast_ref::<Point>()
            .ok_or_else(|| anyhow::anyhow!("expected a point value"))?
            .clone();
        Ok(())
    }
}

/// Fire-and-forget message without reliability flags.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UnreliableMessage {
    pub n: u32,
}

impl Message for UnreliableMessage {
    test_message_boilerplate!(4);

    fn write_payload(&self, _ctx: &mut SerializationContext, w: &mut WireWriter) -> anyhow::Result<()> {
        w.put_u32_le(self.n);
        Ok(())
    }

    fn read_payload(&mut self, _ctx: &SerializationContext, buf: &mut &[u8]) -> anyhow::Result<()> {
        self.n = buf.try_get_u32_le()?;
        Ok(())
    }
}

pub fn test_type_registry() -> Arc<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    registry.register("test.point", || Box::<Point>::default()).unwrap();
    Arc::new(registry)
}

/// Observer capturing every event for assertions, with notification support so
///  tests can wait instead of polling.
pub struct RecordingObserver {
    pub messages: std::sync::Mutex<Vec<crate::connection::MessageEvent>>,
    pub sent: std::sync::Mutex<Vec<crate::connection::MessageEvent>>,
    pub disconnects: std::sync::Mutex<Vec<crate::connection::DisconnectEvent>>,
    pub changed: tokio::sync::Notify,
}

impl RecordingObserver {
    pub fn new() -> Arc<RecordingObserver> {
        Arc::new(RecordingObserver {
            messages: std::sync::Mutex::new(Vec::new()),
            sent: std::sync::Mutex::new(Vec::new()),
            disconnects: std::sync::Mutex::new(Vec::new()),
            changed: tokio::sync::Notify::new(),
        })
    }

    pub async fn wait_for_messages(&self, n: usize) {
        loop {
            let changed = self.changed.notified();
            if self.messages.lock().unwrap().len() >= n {
                return;
            }
            changed.await;
        }
    }

    pub async fn wait_for_disconnect(&self) {
        loop {
            let changed = self.changed.notified();
            if !self.disconnects.lock().unwrap().is_empty() {
                return;
            }
            changed.await;
        }
    }
}

#[async_trait::async_trait]
impl crate::connection::ConnectionObserver for RecordingObserver {
    async fn on_message(&self, event: crate::connection::MessageEvent) {
        self.messages.lock().unwrap().push(event);
        self.changed.notify_waiters();
    }

    async fn on_message_sent(&self, event: crate::connection::MessageEvent) {
        self.sent.lock().unwrap().push(event);
        self.changed.notify_waiters();
    }

    async fn on_disconnected(&self, event: crate::connection::DisconnectEvent) {
        self.disconnects.lock().unwrap().push(event);
        self.changed.notify_waiters();
    }
}
