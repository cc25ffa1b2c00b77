//! Support for payload fields whose concrete type is only known at runtime.
//!
//! Writers tag such values with a stable string name; the per-frame type table
//!  remaps those names to compact u16 ids that are only meaningful within the one
//!  frame carrying them. The receiving side resolves names back to constructors
//!  through a registry.

use crate::buffers::wire::WireWriter;
use anyhow::anyhow;
use bytes::{Buf, BufMut};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// A value that can be embedded polymorphically in a message payload.
///
/// `type_name` must be deterministic and stable across versions - it is what goes
///  into the wire-level type table.
pub trait DynamicValue: Send + Sync + Debug + 'static {
    fn type_name(&self) -> &'static str;

    fn write_value(&self, w: &mut WireWriter) -> anyhow::Result<()>;

    fn read_value(&mut self, buf: &mut &[u8]) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Process-wide mapping from stable type names to constructors for empty instances.
pub struct TypeRegistry {
    constructors: FxHashMap<String, fn() -> Box<dyn DynamicValue>>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry {
            constructors: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, name: &str, constructor: fn() -> Box<dyn DynamicValue>) -> anyhow::Result<()> {
        if self.constructors.contains_key(name) {
            return Err(anyhow!("registering a second constructor for type name {:?}", name));
        }
        self.constructors.insert(name.to_owned(), constructor);
        Ok(())
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn DynamicValue>> {
        self.constructors.get(name).map(|c| c())
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-frame serialization state: the bidirectional u16 <-> type-name mapping.
///
/// On encode the map starts empty and is populated as the payload writes dynamic
///  values; the collected table is then transmitted in the frame header. On decode
///  the context is created from the received table.
pub struct SerializationContext {
    types: Arc<TypeRegistry>,
    names: Vec<String>,
    ids: FxHashMap<String, u16>,
}

impl SerializationContext {
    pub fn new(types: Arc<TypeRegistry>) -> SerializationContext {
        SerializationContext {
            types,
            names: Vec::new(),
            ids: FxHashMap::default(),
        }
    }

    pub fn with_table(types: Arc<TypeRegistry>, names: Vec<String>) -> SerializationContext {
        let ids = names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id as u16))
            .collect();
        SerializationContext { types, names, ids }
    }

    pub fn has_types(&self) -> bool {
        !self.names.is_empty()
    }

    pub fn type_names(&self) -> &[String] {
        &self.names
    }

    fn intern(&mut self, name: &str) -> u16 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as u16;
        self.names.push(name.to_owned());
        self.ids.insert(name.to_owned(), id);
        id
    }

    pub fn write_dynamic(&mut self, w: &mut WireWriter, value: &dyn DynamicValue) -> anyhow::Result<()> {
        let id = self.intern(value.type_name());
        w.put_u16_le(id);
        value.write_value(w)
    }

    pub fn read_dynamic(&self, buf: &mut &[u8]) -> anyhow::Result<Box<dyn DynamicValue>> {
        let id = buf.try_get_u16_le()?;
        let name = self
            .names
            .get(id as usize)
            .ok_or_else(|| anyhow!("type id {} is not in the frame's type table", id))?;
        let mut value = self
            .types
            .create(name)
            .ok_or_else(|| anyhow!("no constructor registered for type name {:?}", name))?;
        value.read_value(buf)?;
        Ok(value)
    }
}
