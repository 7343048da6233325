//! Newline-delimited JSON frames spoken with the archive gateway.
//!
//! Object payloads are not JSON: an `object` frame announces `length` raw
//! bytes that follow immediately after its newline.

use crate::model::{Attributes, HierarchyLevel, QueryNode};
use eyre::{eyre, Result, WrapErr};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Read, Write};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one JSON frame, payload bytes excluded.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Client → gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GatewayRequest {
    Associate {
        calling: String,
        called: String,
        transfer_syntaxes: Vec<String>,
    },
    Find {
        depth: HierarchyLevel,
        filter: Attributes,
    },
    Move {
        level: HierarchyLevel,
        identifiers: Attributes,
        destination: String,
    },
    Get {
        level: HierarchyLevel,
        identifiers: Attributes,
        classes: Vec<String>,
        transfer_syntaxes: Vec<String>,
    },
    Release,
}

/// Gateway → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayReply {
    Accepted,
    Rejected {
        reason: String,
    },
    Matches {
        nodes: Vec<QueryNode>,
    },
    Object {
        transfer_syntax: String,
        length: u64,
        #[serde(default)]
        source: Option<String>,
    },
    Done {
        status: u16,
        #[serde(default)]
        completed: u32,
        #[serde(default)]
        failed: u32,
        #[serde(default)]
        warning: u32,
    },
    Error {
        message: String,
    },
}

/// Remote archive → push listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreRequest {
    Associate {
        calling: String,
        called: String,
        transfer_syntaxes: Vec<String>,
    },
    Object {
        transfer_syntax: String,
        length: u64,
    },
    Release,
}

/// Push listener → remote archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreResponse {
    Accepted { transfer_syntax: String },
    Rejected { reason: String },
    Status { status: u16 },
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> Result<()> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).wrap_err("failed to write frame")?;
    writer.flush()?;
    Ok(())
}

/// Next frame, or `None` on a clean end of stream.
pub fn read_frame<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    read_frame_bounded(reader, MAX_FRAME_BYTES)
}

fn read_frame_bounded<R: BufRead, T: DeserializeOwned>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<T>> {
    let mut line = String::new();
    let read = Read::take(&mut *reader, limit as u64)
        .read_line(&mut line)
        .wrap_err("failed to read frame")?;
    if read == 0 {
        return Ok(None);
    }
    parse_line(&line, limit).map(Some)
}

pub async fn write_frame_async<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).await.wrap_err("failed to write frame")?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame_async<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_frame_bounded_async(reader, MAX_FRAME_BYTES).await
}

/// The peer is untrusted: never buffer more than `limit` bytes of one line.
async fn read_frame_bounded_async<R, T>(reader: &mut R, limit: usize) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let read = AsyncReadExt::take(&mut *reader, limit as u64)
        .read_line(&mut line)
        .await
        .wrap_err("failed to read frame")?;
    if read == 0 {
        return Ok(None);
    }
    parse_line(&line, limit).map(Some)
}

fn parse_line<T: DeserializeOwned>(line: &str, limit: usize) -> Result<T> {
    if !line.ends_with('\n') {
        if line.len() >= limit {
            return Err(eyre!("frame exceeds {limit} bytes"));
        }
        return Err(eyre!("truncated frame"));
    }
    serde_json::from_str(line.trim_end()).wrap_err("malformed frame")
}
