use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Result, UmbraError};

pub const INIT_PACK: u32 = 1;
pub const EXFIL_PACK: u32 = 2;
pub const JOB_PACK: u32 = 3;

/// Outer dispatch envelope carried in every decrypted frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u32,
    pub data: Bytes,
}

/// Inner payload of an INIT envelope. `id` and `type` are formatted by the
/// listener as 8-hex-lowercase agent id and agent watermark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitPack {
    pub id: u32,
    #[serde(rename = "type")]
    pub agent_type: u32,
    pub data: Bytes,
}

/// Inner payload of EXFIL and JOB envelopes: the agent and the running task
/// the stream belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPack {
    pub id: u32,
    pub task: String,
}

impl Envelope {
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| UmbraError::Decode(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| UmbraError::Decode(e.to_string()))
    }
}

impl InitPack {
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| UmbraError::Decode(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| UmbraError::Decode(e.to_string()))
    }
}

impl StreamPack {
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| UmbraError::Decode(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| UmbraError::Decode(e.to_string()))
    }
}
