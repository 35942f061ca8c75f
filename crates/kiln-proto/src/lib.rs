//! Wire protocol spoken between the build host and its worker process.
//!
//! A frame is a 4-byte big-endian length followed by exactly that many payload
//! bytes. The payload is a CBOR-encoded [`WireMessage`].

use serde::{Deserialize, Serialize};

mod diagnostics;
mod job;

pub use diagnostics::{parse_diagnostics, Diagnostic, Severity};
pub use job::{CompileResult, CompilerFile, CompilerJob, WorkerFailure};

/// Maximum size of a single message payload (not including the length prefix).
///
/// Jobs carry every source and reference file inline, so this is generous.
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024; // 256 MiB

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Correlates a job with its response. Unique per worker generation.
pub type MessageId = u32;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A compile job (host -> worker) or its result (worker -> host).
    Data,
    /// Handshake. Sent once by the worker and echoed back by the host.
    Ready,
    /// Job-level failure carrying a [`WorkerFailure`].
    Error,
    /// Graceful stop request.
    Shutdown,
    /// Liveness check. Either side may send one; the worker echoes it.
    Heartbeat,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireMessage {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(with = "cbor_bytes", default)]
    pub data: Vec<u8>,
    /// Free-form text. Results carry the compiler's stdout here.
    #[serde(rename = "extraData", default, skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<String>,
}

impl WireMessage {
    pub fn new(id: MessageId, kind: MessageType, data: Vec<u8>) -> Self {
        Self {
            id,
            kind,
            data,
            extra_data: None,
        }
    }

    pub fn ready() -> Self {
        Self::new(0, MessageType::Ready, Vec::new())
    }

    pub fn heartbeat() -> Self {
        Self::new(0, MessageType::Heartbeat, Vec::new())
    }

    pub fn shutdown() -> Self {
        Self::new(0, MessageType::Shutdown, Vec::new())
    }

    pub fn job(id: MessageId, job: &CompilerJob) -> anyhow::Result<Self> {
        Ok(Self::new(id, MessageType::Data, job.encode()?))
    }

    pub fn result(id: MessageId, result: &CompileResult, stdout: Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            extra_data: stdout,
            ..Self::new(id, MessageType::Data, result.encode()?)
        })
    }

    pub fn failure(id: MessageId, message: impl Into<String>) -> anyhow::Result<Self> {
        let failure = WorkerFailure {
            message: message.into(),
        };
        Ok(Self::new(id, MessageType::Error, failure.encode()?))
    }

    pub fn with_extra_data(mut self, extra: impl Into<String>) -> Self {
        self.extra_data = Some(extra.into());
        self
    }
}

pub fn encode_message(message: &WireMessage) -> anyhow::Result<Vec<u8>> {
    Ok(serde_cbor::to_vec(message)?)
}

pub fn decode_message(bytes: &[u8]) -> anyhow::Result<WireMessage> {
    anyhow::ensure!(
        bytes.len() <= MAX_FRAME_BYTES,
        "wire message too large: {} bytes (max {})",
        bytes.len(),
        MAX_FRAME_BYTES
    );
    Ok(serde_cbor::from_slice(bytes)?)
}

/// Prefix `payload` with its big-endian length.
pub fn encode_frame(payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(
        payload.len() <= MAX_FRAME_BYTES,
        "frame too large: {} bytes (max {})",
        payload.len(),
        MAX_FRAME_BYTES
    );
    let len = u32::try_from(payload.len())?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode a single, complete frame and return its payload.
///
/// Truncated frames and trailing bytes are both rejected.
pub fn decode_frame(bytes: &[u8]) -> anyhow::Result<&[u8]> {
    anyhow::ensure!(
        bytes.len() >= LENGTH_PREFIX_BYTES,
        "frame shorter than length prefix"
    );
    let (prefix, rest) = bytes.split_at(LENGTH_PREFIX_BYTES);
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    anyhow::ensure!(
        len <= MAX_FRAME_BYTES,
        "frame too large: {len} bytes (max {MAX_FRAME_BYTES})"
    );
    anyhow::ensure!(
        rest.len() == len,
        "frame length mismatch: prefix says {len}, got {}",
        rest.len()
    );
    Ok(rest)
}

pub fn encode_framed_message(message: &WireMessage) -> anyhow::Result<Vec<u8>> {
    encode_frame(&encode_message(message)?)
}

pub fn decode_framed_message(bytes: &[u8]) -> anyhow::Result<WireMessage> {
    decode_message(decode_frame(bytes)?)
}

pub(crate) mod cbor_bytes {
    use serde::de::{Error, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a CBOR byte string (or a sequence of u8)")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: Error,
            {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
            where
                E: Error,
            {
                Ok(v)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut out = Vec::new();
                while let Some(byte) = seq.next_element::<u8>()? {
                    out.push(byte);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_any(BytesVisitor)
    }
}
