
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use corelock::arbiter::protocol::{read_message, write_message, ClientMessage, ServerMessage};
use corelock::arbiter::{ArbiterClient, JobRequest};
use test_harness::{assert_eventually, settle, Holder, TestDaemon};

fn admitted_names(admitted: &Arc<Mutex<Vec<&'static str>>>) -> Vec<&'static str> {
    admitted.lock().unwrap().clone()
}

fn admitted_sorted(admitted: &Arc<Mutex<Vec<&'static str>>>) -> Vec<&'static str> {
    let mut names = admitted_names(admitted);
    names.sort();
    names
}

#[tokio::test]
async fn test_acquire_release_basic() {
    let daemon = TestDaemon::start(4).await;

    let mut holder = daemon.client().await;
    assert!(holder.acquire(JobRequest::new(2, 0)).await.unwrap());

    let mut observer = daemon.client().await;
    let status = observer.status().await.unwrap();
    assert_eq!(status.max_cores, 4);
    assert_eq!(status.running.len(), 1);
    assert_eq!(status.running[0].job.cores, 2);
    assert!(status.waiting.is_empty());

    holder.release().await.unwrap();
    settle().await;

    let status = observer.status().await.unwrap();
    assert!(status.running.is_empty());

    holder.end().await.unwrap();
    observer.end().await.unwrap();
}

/// Admissions serialize through a single slot, so the grant order is
/// exactly the priority order: priority first, then registration order.
#[tokio::test]
async fn test_priority_order_single_slot() {
    let daemon = TestDaemon::start(1).await;
    let admitted = Arc::new(Mutex::new(Vec::new()));

    let mut gate = daemon.client().await;
    assert!(gate.acquire(JobRequest::new(1, 0)).await.unwrap());

    let a = Holder::spawn(daemon.port(), JobRequest::new(1, 0), admitted.clone(), "a");
    settle().await;
    let b = Holder::spawn(daemon.port(), JobRequest::new(1, 5), admitted.clone(), "b");
    settle().await;
    let c = Holder::spawn(daemon.port(), JobRequest::new(1, 0), admitted.clone(), "c");
    settle().await;

    gate.release().await.unwrap();
    settle().await;
    assert_eq!(admitted_names(&admitted), vec!["b"]);

    b.release().await;
    settle().await;
    assert_eq!(admitted_names(&admitted), vec!["b", "a"]);

    a.release().await;
    settle().await;
    assert_eq!(admitted_names(&admitted), vec!["b", "a", "c"]);

    c.release().await;
    gate.end().await.unwrap();
}

/// At equal priority the smaller request is admitted first, even though
/// the bigger one registered earlier.
#[tokio::test]
async fn test_smaller_cores_win_at_equal_priority() {
    let daemon = TestDaemon::start(4).await;
    let admitted = Arc::new(Mutex::new(Vec::new()));

    let mut gate = daemon.client().await;
    assert!(gate.acquire(JobRequest::new(0, 0)).await.unwrap());

    let big = Holder::spawn(daemon.port(), JobRequest::new(3, 0), admitted.clone(), "big");
    settle().await;
    let small = Holder::spawn(
        daemon.port(),
        JobRequest::new(2, 0),
        admitted.clone(),
        "small",
    );
    settle().await;

    gate.release().await.unwrap();
    settle().await;
    // small (2 cores) fits and outranks big; big (3 cores) no longer fits.
    assert_eq!(admitted_names(&admitted), vec!["small"]);

    small.release().await;
    settle().await;
    assert_eq!(admitted_names(&admitted), vec!["small", "big"]);

    big.release().await;
    gate.end().await.unwrap();
}

/// S2: one release frees enough capacity for two waiters; both are
/// admitted in the same scheduler tick.
#[tokio::test]
async fn test_release_admits_multiple_in_one_tick() {
    let daemon = TestDaemon::start(2).await;
    let admitted = Arc::new(Mutex::new(Vec::new()));

    let mut gate = daemon.client().await;
    assert!(gate.acquire(JobRequest::new(2, 0)).await.unwrap());

    let b = Holder::spawn(daemon.port(), JobRequest::new(1, 0), admitted.clone(), "b");
    settle().await;
    let c = Holder::spawn(daemon.port(), JobRequest::new(1, 0), admitted.clone(), "c");
    settle().await;
    let d = Holder::spawn(daemon.port(), JobRequest::new(1, 0), admitted.clone(), "d");
    settle().await;

    assert!(admitted_names(&admitted).is_empty());

    gate.release().await.unwrap();
    settle().await;
    assert_eq!(admitted_sorted(&admitted), vec!["b", "c"]);

    b.release().await;
    settle().await;
    assert_eq!(admitted_sorted(&admitted), vec!["b", "c", "d"]);

    c.release().await;
    d.release().await;
    gate.end().await.unwrap();
}

/// An exclusive request takes the whole host and blocks everyone else.
#[tokio::test]
async fn test_exclusive_hold_blocks_all() {
    let daemon = TestDaemon::start(4).await;
    let admitted = Arc::new(Mutex::new(Vec::new()));

    let mut exclusive = daemon.client().await;
    assert!(exclusive.acquire(JobRequest::new(0, 0)).await.unwrap());

    let one = Holder::spawn(daemon.port(), JobRequest::new(1, 0), admitted.clone(), "one");
    settle().await;
    assert!(admitted_names(&admitted).is_empty());

    exclusive.release().await.unwrap();
    settle().await;
    assert_eq!(admitted_names(&admitted), vec!["one"]);

    one.release().await;
    exclusive.end().await.unwrap();
}

/// S6: after StopAccepting every fresh Acquire is rejected immediately
/// while existing holders keep their grant.
#[tokio::test]
async fn test_stop_accepting_rejects_new_acquires() {
    let daemon = TestDaemon::start(4).await;

    let mut holder = daemon.client().await;
    assert!(holder.acquire(JobRequest::new(2, 0)).await.unwrap());

    let mut admin = daemon.client().await;
    admin.stop_accepting().await.unwrap();
    admin.end().await.unwrap();
    settle().await;

    let mut late = daemon.client().await;
    assert!(!late.acquire(JobRequest::new(1, 0)).await.unwrap());
    late.end().await.unwrap();

    let mut observer = daemon.client().await;
    let status = observer.status().await.unwrap();
    assert_eq!(status.running.len(), 1);
    observer.end().await.unwrap();

    holder.release().await.unwrap();
    holder.end().await.unwrap();
}

/// A holder whose connection dies is released implicitly.
#[tokio::test]
async fn test_disconnect_releases_hold() {
    let daemon = TestDaemon::start(2).await;
    let admitted = Arc::new(Mutex::new(Vec::new()));

    let dying = Holder::spawn(
        daemon.port(),
        JobRequest::new(0, 0),
        admitted.clone(),
        "dying",
    );
    settle().await;
    let waiter = Holder::spawn(
        daemon.port(),
        JobRequest::new(1, 0),
        admitted.clone(),
        "waiter",
    );
    settle().await;
    assert_eq!(admitted_names(&admitted), vec!["dying"]);

    // Drop the connection without sending Release.
    dying.abort();

    let admitted_clone = admitted.clone();
    assert_eventually(
        || {
            let admitted = admitted_clone.clone();
            async move { admitted.lock().unwrap().contains(&"waiter") }
        },
        Duration::from_secs(3),
        "waiter was not admitted after the holder's connection died",
    )
    .await;

    waiter.release().await;
}

/// The capacity invariant holds at every observable moment while clients
/// churn.
#[tokio::test]
async fn test_capacity_invariant_under_churn() {
    let daemon = TestDaemon::start(4).await;
    let port = daemon.port();

    let mut workers = Vec::new();
    for cores in [1i32, 2, 3, 1, 2] {
        workers.push(tokio::spawn(async move {
            for _ in 0..3 {
                let mut client = ArbiterClient::connect(port).await.expect("churn connect");
                assert!(client.acquire(JobRequest::new(cores, 0)).await.unwrap());
                tokio::time::sleep(Duration::from_millis(30)).await;
                client.release().await.unwrap();
                client.end().await.unwrap();
            }
        }));
    }

    for _ in 0..25 {
        let mut observer = daemon.client().await;
        let status = observer.status().await.unwrap();
        let used: u32 = status
            .running
            .iter()
            .map(|j| {
                if j.job.cores <= 0 {
                    status.max_cores
                } else {
                    (j.job.cores as u32).min(status.max_cores)
                }
            })
            .sum();
        assert!(
            used <= status.max_cores,
            "capacity exceeded: {used} > {}",
            status.max_cores
        );
        observer.end().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for worker in workers {
        worker.await.unwrap();
    }
}

/// Status lists waiters in admission order.
#[tokio::test]
async fn test_status_waiting_in_admission_order() {
    let daemon = TestDaemon::start(2).await;
    let admitted = Arc::new(Mutex::new(Vec::new()));

    let mut gate = daemon.client().await;
    assert!(gate.acquire(JobRequest::new(0, 0)).await.unwrap());

    let x = Holder::spawn(daemon.port(), JobRequest::new(2, 1), admitted.clone(), "x");
    settle().await;
    let y = Holder::spawn(daemon.port(), JobRequest::new(1, 3), admitted.clone(), "y");
    settle().await;
    let z = Holder::spawn(daemon.port(), JobRequest::new(1, 1), admitted.clone(), "z");
    settle().await;

    let mut observer = daemon.client().await;
    let status = observer.status().await.unwrap();
    let priorities: Vec<i32> = status.waiting.iter().map(|w| w.job.priority).collect();
    let cores: Vec<i32> = status.waiting.iter().map(|w| w.job.cores).collect();
    // y (priority 3) first; then z before x (equal priority, fewer cores).
    assert_eq!(priorities, vec![3, 1, 1]);
    assert_eq!(cores, vec![1, 1, 2]);
    observer.end().await.unwrap();

    gate.release().await.unwrap();
    settle().await;
    x.abort();
    y.abort();
    z.abort();
    gate.end().await.unwrap();
}

/// A daemon nobody ever contacts exits on its own after the grace period.
#[tokio::test]
async fn test_untouched_daemon_exits() {
    let daemon = TestDaemon::start(4).await;
    assert_eventually(
        || async { daemon.handle.is_finished() },
        Duration::from_secs(3),
        "idle daemon did not exit",
    )
    .await;
}

/// A connected but idle client keeps the daemon alive; its departure
/// triggers auto-shutdown.
#[tokio::test]
async fn test_idle_client_prevents_shutdown() {
    let daemon = TestDaemon::start(4).await;
    let client = daemon.client().await;

    tokio::time::sleep(test_harness::TEST_IDLE_GRACE * 2).await;
    assert!(!daemon.is_stopped(), "daemon exited despite a live client");

    drop(client);
    assert_eventually(
        || async { daemon.handle.is_finished() },
        Duration::from_secs(3),
        "daemon did not exit after its last client left",
    )
    .await;
}

async fn raw_session(port: u16) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    (BufReader::new(read_half), write_half)
}

/// A message outside the state machine closes only the offending session.
#[tokio::test]
async fn test_protocol_error_closes_session() {
    let daemon = TestDaemon::start(4).await;
    // Keep the daemon alive across the misbehaving session.
    let keeper = daemon.client().await;

    let (mut reader, mut writer) = raw_session(daemon.port()).await;
    // Status before Start is a protocol error.
    write_message(&mut writer, &ClientMessage::Status)
        .await
        .unwrap();
    let reply: corelock::Result<Option<ServerMessage>> = read_message(&mut reader).await;
    assert!(matches!(reply, Ok(None)), "session was not closed");

    // The daemon itself is unaffected.
    let mut client = daemon.client().await;
    assert!(client.acquire(JobRequest::new(1, 0)).await.unwrap());
    client.release().await.unwrap();
    client.end().await.unwrap();
    drop(keeper);
}

/// A malformed frame closes the session and implicitly releases its hold.
#[tokio::test]
async fn test_malformed_frame_releases_hold() {
    let daemon = TestDaemon::start(4).await;
    let keeper = daemon.client().await;

    let (mut reader, mut writer) = raw_session(daemon.port()).await;
    write_message(&mut writer, &ClientMessage::Start)
        .await
        .unwrap();
    write_message(&mut writer, &ClientMessage::Acquire(JobRequest::new(2, 0)))
        .await
        .unwrap();
    let go: Option<ServerMessage> = read_message(&mut reader).await.unwrap();
    assert_eq!(go, Some(ServerMessage::Go));

    use tokio::io::AsyncWriteExt;
    writer.write_all(b"this is not json\n").await.unwrap();
    let closed: corelock::Result<Option<ServerMessage>> = read_message(&mut reader).await;
    assert!(matches!(closed, Ok(None)), "session was not closed");

    // The hold must be gone: the full capacity is available again.
    let daemon_port = daemon.port();
    assert_eventually(
        || async move {
            let mut observer = ArbiterClient::connect(daemon_port).await.unwrap();
            let status = observer.status().await.unwrap();
            let _ = observer.end().await;
            status.running.is_empty()
        },
        Duration::from_secs(3),
        "hold of the misbehaving session was not released",
    )
    .await;
    drop(keeper);
}
