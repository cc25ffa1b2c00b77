use anyhow::bail;
use std::time::Duration;

/// The HMAC variant used for message authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningHashAlgorithm {
    Sha256,
    Sha384,
}

impl SigningHashAlgorithm {
    /// length of the authentication tag appended to a signed frame
    pub fn tag_len(&self) -> usize {
        match self {
            SigningHashAlgorithm::Sha256 => 32,
            SigningHashAlgorithm::Sha384 => 48,
        }
    }
}

pub struct TempestConfig {
    /// Frames declaring a total length above this value cause the connection to be
    ///  dropped immediately: a peer announcing a huge frame is either broken or
    ///  hostile, and buffering for it would be an easy DoS vector.
    pub max_message_length: usize,

    /// Ceiling on the number of concurrently checked-out send buffers. When the pool
    ///  is exhausted and this many buffers exist, senders wait for a buffer to be
    ///  returned. This is the send-side backpressure mechanism.
    pub buffer_limit: usize,

    /// Initial capacity of pooled send buffers. Buffers grow on demand when a frame
    ///  is bigger, so this is a tuning knob rather than a limit.
    pub send_buffer_capacity: usize,

    pub signing_hash: SigningHashAlgorithm,

    /// Unacknowledged reliable datagrams older than this are retransmitted on the
    ///  next resend tick. Only meaningful for unreliable transports.
    pub resend_interval: Duration,

    /// If set, each connection sends a `Ping` on this interval and tracks the
    ///  round-trip time from the matching `Pong`.
    pub ping_interval: Option<Duration>,
}

impl TempestConfig {
    pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 1024 * 1024;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_length < crate::frame::BASE_HEADER_LENGTH {
            bail!("max message length is too small to hold a frame header");
        }
        if self.max_message_length >= (1 << 31) {
            bail!("max message length must fit the 31-bit length field");
        }
        if self.buffer_limit == 0 {
            bail!("buffer limit must be positive");
        }
        if self.resend_interval.is_zero() {
            bail!("resend interval must be positive");
        }
        Ok(())
    }
}

impl Default for TempestConfig {
    fn default() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        TempestConfig {
            max_message_length: Self::DEFAULT_MAX_MESSAGE_LENGTH,
            buffer_limit: 10 * cpu_count,
            send_buffer_capacity: 2048,
            signing_hash: SigningHashAlgorithm::Sha256,
            resend_interval: Duration::from_secs(1),
            ping_interval: None,
        }
    }
}
