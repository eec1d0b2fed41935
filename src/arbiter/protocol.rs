//! Wire protocol shared by the daemon and its clients.
//!
//! Frames are line-delimited JSON: one message per `\n`-terminated line,
//! symmetric in both directions. The message set is closed; anything a peer
//! does not recognise is a protocol error and closes the session.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CorelockError, Result};

/// Port the daemon listens on when none is configured. Clients default to
/// the same constant.
pub const DEFAULT_PORT: u16 = 12_000;

/// Seconds since the Unix epoch, sub-second precision.
pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// A client's request for cores.
///
/// `cores == 0` means an exclusive hold of the whole host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub cores: i32,
    pub priority: i32,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    pub query_time: f64,
}

impl JobRequest {
    pub fn new(cores: i32, priority: i32) -> Self {
        Self {
            cores,
            priority,
            pid: std::process::id(),
            user: std::env::var("USER").ok(),
            tag: None,
            info: None,
            query_time: epoch_seconds(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }
}

/// Messages a client sends to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start,
    End,
    Acquire(JobRequest),
    Release,
    Status,
    StopAccepting,
}

/// Messages the daemon sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Go,
    Reject,
    StatusAnswer(StatusAnswer),
}

/// A job currently holding cores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentJob {
    pub id: u64,
    pub job: JobRequest,
    /// Seconds since the Unix epoch at admission time.
    pub start_time: f64,
}

/// A job still waiting for admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingJob {
    pub id: u64,
    pub job: JobRequest,
}

/// Consistent view of the scheduler state, taken under a single scheduler
/// turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusAnswer {
    pub max_cores: u32,
    pub running: Vec<CurrentJob>,
    /// Waiting tasks in admission order.
    pub waiting: Vec<WaitingJob>,
}

/// Write one framed message.
pub async fn write_message<W, M>(writer: &mut W, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. `Ok(None)` means the peer closed the
/// connection; a malformed frame is a protocol error.
pub async fn read_message<R, M>(reader: &mut R) -> Result<Option<M>>
where
    R: AsyncBufReadExt + Unpin,
    M: DeserializeOwned,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let msg = serde_json::from_str(line.trim_end())
        .map_err(|e| CorelockError::Protocol(format!("malformed frame: {e}")))?;
    Ok(Some(msg))
}
