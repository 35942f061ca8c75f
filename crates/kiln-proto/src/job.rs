use serde::{Deserialize, Serialize};

use crate::cbor_bytes;

/// A named file shipped inline with a job.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompilerFile {
    pub name: String,
    #[serde(with = "cbor_bytes")]
    pub data: Vec<u8>,
}

impl CompilerFile {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Payload of a host -> worker `Data` message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompilerJob {
    pub output_file: String,
    pub source_files: Vec<CompilerFile>,
    pub reference_files: Vec<CompilerFile>,
    #[serde(default)]
    pub stdlib: bool,
    pub target: String,
    pub platform: String,
    pub language_version: String,
    pub encoding: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub preprocessor: Vec<String>,
}

impl CompilerJob {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}

/// Payload of a worker -> host `Data` message.
///
/// An empty `data` image means the worker produced no module; the compiler's
/// diagnostics then explain why.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompileResult {
    pub name: String,
    #[serde(with = "cbor_bytes", default)]
    pub data: Vec<u8>,
    #[serde(with = "cbor_bytes", default)]
    pub symbols: Vec<u8>,
}

impl CompileResult {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}

/// Payload of an `Error` message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerFailure {
    pub message: String,
}

impl WorkerFailure {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}
