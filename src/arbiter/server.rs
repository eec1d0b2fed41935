use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::arbiter::protocol::{read_message, write_message, ClientMessage, ServerMessage};
use crate::arbiter::scheduler::{Admission, SchedMsg, Scheduler};
use crate::error::{CorelockError, Result};

const INBOX_CAPACITY: usize = 64;
const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(10);

/// The arbitration daemon: a loopback TCP listener, one scheduler task, and
/// one task per client session.
pub struct Server {
    listener: TcpListener,
    max_cores: u32,
    idle_grace: Duration,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the daemon on the loopback interface. Binding fails if another
    /// daemon already owns the port.
    pub async fn bind(port: u16, max_cores: u32) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            max_cores,
            idle_grace: DEFAULT_IDLE_GRACE,
            shutdown: CancellationToken::new(),
        })
    }

    /// How long the scheduler waits for a first sign of life before
    /// concluding nobody is coming.
    pub fn with_idle_grace(mut self, grace: Duration) -> Self {
        self.idle_grace = grace;
        self
    }

    /// Cancelling this token stops the accept loop and the scheduler. The
    /// scheduler also cancels it itself when the daemon goes idle.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the daemon goes idle or the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        let addr = self.listener.local_addr()?;
        tracing::info!(addr = %addr, max_cores = self.max_cores, "Arbiter listening");

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let scheduler = Scheduler::new(self.max_cores, self.idle_grace, rx, self.shutdown.clone());
        let scheduler_handle = tokio::spawn(scheduler.run());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_session(stream, tx).await {
                                tracing::warn!(peer = %peer, error = %e, "Session closed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                },
            }
        }

        drop(tx);
        let _ = scheduler_handle.await;
        tracing::info!(addr = %addr, "Arbiter stopped");
        Ok(())
    }
}

/// Drive one client session. Whatever the session held is released when it
/// ends, cleanly or not.
async fn handle_session(stream: TcpStream, tx: mpsc::Sender<SchedMsg>) -> Result<()> {
    if tx.send(SchedMsg::ClientConnected).await.is_err() {
        // Scheduler already gone; the daemon is shutting down.
        return Ok(());
    }

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;
    let mut held: Option<u64> = None;

    let result = session_loop(&mut reader, &mut writer, &tx, &mut held).await;

    if let Some(task_id) = held.take() {
        let _ = tx.send(SchedMsg::Done { task_id }).await;
    }
    let _ = tx.send(SchedMsg::ClientDisconnected).await;
    result
}

/// The session state machine. `started` tracks Start; `held` tracks the
/// HOLDING state and is owned by the caller so teardown can release it.
async fn session_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut (impl AsyncWrite + Unpin),
    tx: &mpsc::Sender<SchedMsg>,
    held: &mut Option<u64>,
) -> Result<()> {
    let mut started = false;

    loop {
        let msg = match read_message::<_, ClientMessage>(reader).await? {
            Some(msg) => msg,
            // Disconnect in any state is End; the caller releases holds.
            None => return Ok(()),
        };

        match (started, held.is_some(), msg) {
            (false, _, ClientMessage::Start) => {
                started = true;
            }
            (true, false, ClientMessage::End) => return Ok(()),
            (true, false, ClientMessage::Acquire(request)) => {
                let (ready_tx, mut ready_rx) = oneshot::channel();
                if tx
                    .send(SchedMsg::Register {
                        request,
                        ready: ready_tx,
                    })
                    .await
                    .is_err()
                {
                    return Ok(());
                }

                // AWAITING_GO: nothing but the grant is legal, but we keep
                // reading so a disconnect is noticed while we wait.
                let mut line = String::new();
                tokio::select! {
                    admission = &mut ready_rx => match admission {
                        Ok(Admission::Granted { task_id }) => {
                            *held = Some(task_id);
                            write_message(writer, &ServerMessage::Go).await?;
                        }
                        Ok(Admission::Rejected) => {
                            write_message(writer, &ServerMessage::Reject).await?;
                        }
                        Err(_) => return Ok(()),
                    },
                    read = reader.read_line(&mut line) => {
                        // A grant may have raced the disconnect; give it back.
                        if let Ok(Admission::Granted { task_id }) = ready_rx.try_recv() {
                            let _ = tx.send(SchedMsg::Done { task_id }).await;
                        }
                        return match read {
                            Ok(0) => Ok(()),
                            Ok(_) => Err(CorelockError::Protocol(
                                "unexpected message while awaiting grant".into(),
                            )),
                            Err(e) => Err(e.into()),
                        };
                    }
                }
            }
            (true, true, ClientMessage::Release) => {
                if let Some(task_id) = held.take() {
                    if tx.send(SchedMsg::Done { task_id }).await.is_err() {
                        return Ok(());
                    }
                }
            }
            (true, false, ClientMessage::Status) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx.send(SchedMsg::Status { reply: reply_tx }).await.is_err() {
                    return Ok(());
                }
                match reply_rx.await {
                    Ok(answer) => {
                        write_message(writer, &ServerMessage::StatusAnswer(answer)).await?
                    }
                    Err(_) => return Ok(()),
                }
            }
            (true, false, ClientMessage::StopAccepting) => {
                if tx.send(SchedMsg::StopAccepting).await.is_err() {
                    return Ok(());
                }
            }
            (_, _, other) => {
                return Err(CorelockError::Protocol(format!(
                    "unexpected message in this state: {other:?}"
                )));
            }
        }
    }
}
