use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::arbiter::protocol::{
    read_message, write_message, ClientMessage, JobRequest, ServerMessage, StatusAnswer,
};
use crate::error::{CorelockError, Result};

const SPAWN_RETRIES: usize = 50;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Client side of an arbiter session. Dropping the client releases
/// whatever it holds (the daemon treats the disconnect as Release + End).
pub struct ArbiterClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ArbiterClient {
    /// Connect to a running daemon on the loopback interface and open the
    /// session.
    pub async fn connect(port: u16) -> Result<Self> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };
        client.send(&ClientMessage::Start).await?;
        Ok(client)
    }

    /// Connect, spawning a detached daemon first if nothing is listening.
    /// When two clients race, the losing daemon fails to bind and exits;
    /// both clients end up connected to the winner.
    pub async fn connect_or_spawn(port: u16) -> Result<Self> {
        if let Ok(client) = Self::connect(port).await {
            return Ok(client);
        }
        spawn_daemon(port)?;
        for _ in 0..SPAWN_RETRIES {
            tokio::time::sleep(SPAWN_RETRY_DELAY).await;
            if let Ok(client) = Self::connect(port).await {
                return Ok(client);
            }
        }
        Err(CorelockError::Daemon(format!(
            "daemon did not come up on port {port}"
        )))
    }

    /// Ask for cores and wait for the grant. `Ok(true)` means the request
    /// was admitted and this session now holds the cores; `Ok(false)` means
    /// the daemon is no longer accepting.
    pub async fn acquire(&mut self, request: JobRequest) -> Result<bool> {
        self.send(&ClientMessage::Acquire(request)).await?;
        match self.recv().await? {
            ServerMessage::Go => Ok(true),
            ServerMessage::Reject => Ok(false),
            other => Err(CorelockError::Protocol(format!(
                "expected Go or Reject, got {other:?}"
            ))),
        }
    }

    /// Release the held cores.
    pub async fn release(&mut self) -> Result<()> {
        self.send(&ClientMessage::Release).await
    }

    pub async fn status(&mut self) -> Result<StatusAnswer> {
        self.send(&ClientMessage::Status).await?;
        match self.recv().await? {
            ServerMessage::StatusAnswer(answer) => Ok(answer),
            other => Err(CorelockError::Protocol(format!(
                "expected StatusAnswer, got {other:?}"
            ))),
        }
    }

    /// Tell the daemon to reject all future acquire requests. Existing
    /// holders are unaffected.
    pub async fn stop_accepting(&mut self) -> Result<()> {
        self.send(&ClientMessage::StopAccepting).await
    }

    /// Close the session cleanly.
    pub async fn end(mut self) -> Result<()> {
        self.send(&ClientMessage::End).await
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        write_message(&mut self.writer, msg).await
    }

    async fn recv(&mut self) -> Result<ServerMessage> {
        match read_message(&mut self.reader).await? {
            Some(msg) => Ok(msg),
            None => Err(CorelockError::Protocol(
                "daemon closed the connection".into(),
            )),
        }
    }
}

/// Fork-and-detach a fresh daemon: scratch working directory, null stdio,
/// log records appended to a file next to it.
fn spawn_daemon(port: u16) -> Result<()> {
    let exe = std::env::current_exe()?;
    let scratch = std::env::temp_dir();
    let log_file = scratch.join(format!("corelock-{port}.log"));

    Command::new(exe)
        .arg("daemon")
        .arg("--port")
        .arg(port.to_string())
        .arg("--log-file")
        .arg(&log_file)
        .current_dir(&scratch)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    tracing::info!(port, log_file = %log_file.display(), "Spawned arbiter daemon");
    Ok(())
}
