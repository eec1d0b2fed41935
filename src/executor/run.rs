//! Child process plumbing: spawn through a shell in a fresh process group,
//! capture both streams, kill the whole group when the watchdog fires, and
//! reap with `wait4` so CPU times come from the kernel's per-child rusage.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

/// Extra headroom the child gets beyond the declared timeout before the
/// watchdog kills its process group.
pub(crate) const WATCHDOG_SLACK: Duration = Duration::from_secs(1);

/// Resource limits for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub timeout_s: u64,
    pub memory_mb: u64,
}

/// Raw, unclassified record of one finished child.
#[derive(Debug)]
pub(crate) struct ChildOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub errcode: i32,
    pub rtime: f64,
    pub utime: f64,
    pub stime: f64,
    pub timed_out: bool,
}

/// Substitute the template placeholders. The result goes through `sh -c`
/// so commands can compose pipes.
pub(crate) fn render_command(template: &str, file: &Path, limits: Limits) -> String {
    template
        .replace("$file", &file.display().to_string())
        .replace("$timeout", &limits.timeout_s.to_string())
        .replace("$memory", &limits.memory_mb.to_string())
}

/// Run one shell command to completion under the given limits. Blocking;
/// callers run this on the blocking pool.
pub(crate) fn run_child(command: &str, limits: Limits) -> std::io::Result<ChildOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    if limits.memory_mb > 0 {
        let bytes = limits.memory_mb.saturating_mul(1024 * 1024);
        unsafe {
            cmd.pre_exec(move || {
                let limit = libc::rlimit {
                    rlim_cur: bytes,
                    rlim_max: bytes,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    let pid = child.id() as i32;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_reader = thread::spawn(move || drain(stdout_pipe));
    let stderr_reader = thread::spawn(move || drain(stderr_pipe));

    let timed_out = Arc::new(AtomicBool::new(false));
    let fired = Arc::clone(&timed_out);
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let deadline = Duration::from_secs(limits.timeout_s) + WATCHDOG_SLACK;
    let watchdog = thread::spawn(move || {
        if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(deadline) {
            fired.store(true, Ordering::SeqCst);
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    });

    let (errcode, utime, stime) = wait_child(pid)?;
    let rtime = start.elapsed().as_secs_f64();

    drop(done_tx);
    let _ = watchdog.join();
    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    Ok(ChildOutput {
        stdout,
        stderr,
        errcode,
        rtime,
        utime,
        stime,
        timed_out: timed_out.load(Ordering::SeqCst),
    })
}

fn drain<R: Read>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

/// Reap the child, returning `(errcode, utime, stime)`. Signal deaths are
/// encoded as negated signal numbers.
fn wait_child(pid: i32) -> std::io::Result<(i32, f64, f64)> {
    let mut status: libc::c_int = 0;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            break;
        }
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }

    let errcode = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        -libc::WTERMSIG(status)
    } else {
        -1
    };

    Ok((
        errcode,
        timeval_seconds(usage.ru_utime),
        timeval_seconds(usage.ru_stime),
    ))
}

fn timeval_seconds(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1e6
}
