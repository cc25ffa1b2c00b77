//! Tempest is a message-oriented networking runtime: processes exchange
//!  strongly-typed, versioned messages over both reliable (stream) and
//!  unreliable (datagram) transports, with optional end-to-end authentication
//!  and confidentiality negotiated by handshake.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length, typed
//!   units of data) rather than byte streams
//! * Several protocols - versioned namespaces of message types - can share one
//!   connection; each frame names the protocol it belongs to
//! * Reliability is a per-message property on the datagram transport: messages
//!   flagged reliable are acknowledged, retransmitted on loss and delivered in
//!   send order, everything else is delivered as it arrives
//! * Confidentiality and authenticity are per-message-type properties; the keys
//!   come from an opaque handshake on the internal control protocol
//! * Servers choose between per-connection ordering and one global total order
//!   when delivering events to application handlers
//!
//! ## Wire format
//!
//! One self-delimited frame (all integers little-endian):
//!
//! ```ascii
//!  0: protocol id (u8)
//!  1: message type (u16)
//!  3: (frame length << 1) | has-type-table (u32) - the length covers the
//!      entire frame including the trailing tag
//!  7: type table (u16 count, count x varint-length-prefixed UTF-8 name),
//!      present iff the low bit of the length word is set. Maps the u16 type
//!      ids embedded in this frame's payload to stable type names.
//!  *: IV (16 bytes), present iff the message type is encrypted
//!  *: payload, zero-padded to the AES block size and AES-256-CBC encrypted
//!      in place when the message type is encrypted. On the datagram transport
//!      the payload starts with (message id << 1) | is-response (u32).
//!  *: HMAC tag over the (encrypted) payload region, present iff the message
//!      type is authenticated
//! ```
//!
//! ## Ordering guarantees
//!
//! * Stream transport: the application observes messages in exactly the order
//!   the bytes arrived
//! * Datagram transport: reliable messages are observed in sender id order;
//!   unreliable messages as they arrive; responses as they arrive
//! * `ConnectionOrder` dispatch preserves per-connection order, `GlobalOrder`
//!   dispatch preserves one total order across all connections
//!
//! ## Teardown
//!
//! Every asynchronous submission holds a guard on the connection's in-flight
//!  counter; `dispose` is a synchronous barrier that returns only once the
//!  counter reaches zero. `Disconnected` is raised exactly once per connection,
//!  with the first observed reason.

pub mod buffers;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod dynamic_types;
pub mod frame;
pub mod handshake;
pub mod messages;
pub mod protocol;
pub mod reliable_queue;
pub mod server;
pub mod tcp_connection;
pub mod udp_connection;

#[cfg(test)]
pub mod test_util;
