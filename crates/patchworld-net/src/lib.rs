//! TCP transport for the patchworld RPC contract: a tokio server hosting a
//! simulator for many clients, and a blocking client handle.
//!
//! Frames are a 4-byte little-endian length prefix followed by one JSON
//! message from `patchworld-proto`.

pub mod client;
pub mod server;

pub use client::Client;
pub use server::{ServerConfig, SimulationServer};

use patchworld_proto::Status;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use thiserror::Error;

/// Upper bound on a single frame; anything larger is treated as corruption.
pub(crate) const MAX_FRAME_LEN: usize = 64 << 20;

/// Errors surfaced by the transport layer.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("malformed message: {0}")]
    Protocol(&'static str),
    #[error("connection to the server was lost")]
    ConnectionLost,
    #[error("server rejected the request: {0:?}")]
    Rejected(Status),
}

pub(crate) fn encode_frame(value: &impl Serialize) -> Result<Vec<u8>, NetError> {
    let body = serde_json::to_vec(value).map_err(|_| NetError::Protocol("serialize failed"))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub(crate) fn write_frame_sync(
    stream: &mut impl Write,
    value: &impl Serialize,
) -> Result<(), NetError> {
    let frame = encode_frame(value)?;
    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}

pub(crate) fn read_frame_sync<T: DeserializeOwned>(stream: &mut impl Read) -> Result<T, NetError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|_| NetError::Protocol("deserialize failed"))
}
