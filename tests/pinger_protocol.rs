//! Ping-daemon control channel: wire protocol, queue discipline, reconnect.

use std::time::Duration;

use pollwatch::ping::PingController;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::timeout;

struct FakePinger {
    listener: UnixListener,
}

struct PingerConnection {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl FakePinger {
    fn bind(path: &std::path::Path) -> Self {
        Self {
            listener: UnixListener::bind(path).unwrap(),
        }
    }

    async fn accept(&self) -> PingerConnection {
        let (stream, _) = timeout(Duration::from_secs(30), self.listener.accept())
            .await
            .expect("controller did not connect")
            .unwrap();
        let (read_half, write_half) = stream.into_split();
        PingerConnection {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }
}

impl PingerConnection {
    async fn read_command(&mut self) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(30), self.reader.read_line(&mut line))
            .await
            .expect("no command arrived")
            .unwrap();
        line.trim_end().to_string()
    }

    async fn respond(&mut self, response: &str) {
        self.writer
            .write_all(format!("{response}\n").as_bytes())
            .await
            .unwrap();
    }
}

fn socket_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("pinger.sock")
}

#[tokio::test(start_paused = true)]
async fn commands_are_issued_one_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let pinger = FakePinger::bind(&socket_path(&dir));

    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let controller = PingController::start(shutdown_rx);
    controller.connect(socket_path(&dir));

    let mut connection = pinger.accept().await;

    controller.add_host(7, 11, "a".to_string());
    controller.add_host(7, 12, "b".to_string());

    // The second command must wait for the first acknowledgement.
    assert_eq!(connection.read_command().await, "A 11 a");
    connection.respond("OK").await;
    assert_eq!(connection.read_command().await, "A 12 b");
    connection.respond("OK").await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_hosts_register_once() {
    let dir = tempfile::tempdir().unwrap();
    let pinger = FakePinger::bind(&socket_path(&dir));

    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let controller = PingController::start(shutdown_rx);
    controller.connect(socket_path(&dir));
    let mut connection = pinger.accept().await;

    controller.add_host(7, 11, "a".to_string());
    controller.add_host(7, 11, "a".to_string());
    controller.remove_customer(7);

    assert_eq!(connection.read_command().await, "A 11 a");
    connection.respond("OK").await;
    // Straight to the removal: the duplicate registration was dropped.
    assert_eq!(connection.read_command().await, "R 11");
    connection.respond("OK").await;
}

#[tokio::test(start_paused = true)]
async fn error_responses_pop_transient_failures_retry() {
    let dir = tempfile::tempdir().unwrap();
    let pinger = FakePinger::bind(&socket_path(&dir));

    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let controller = PingController::start(shutdown_rx);
    controller.connect(socket_path(&dir));
    let mut connection = pinger.accept().await;

    controller.add_host(7, 11, "a".to_string());
    controller.add_host(7, 12, "b".to_string());

    // A rejected command is logged and dropped; the queue moves on.
    assert_eq!(connection.read_command().await, "A 11 a");
    connection.respond("ERROR unsupported").await;
    assert_eq!(connection.read_command().await, "A 12 b");

    // A transient failure keeps the head; the same command is re-sent after
    // the retry delay.
    connection.respond("failed temporarily overloaded").await;
    assert_eq!(connection.read_command().await, "A 12 b");
    connection.respond("OK").await;
}

#[tokio::test(start_paused = true)]
async fn noping_is_advisory_only() {
    let dir = tempfile::tempdir().unwrap();
    let pinger = FakePinger::bind(&socket_path(&dir));

    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let controller = PingController::start(shutdown_rx);
    controller.connect(socket_path(&dir));
    let mut connection = pinger.accept().await;

    controller.add_host(7, 11, "a".to_string());
    assert_eq!(connection.read_command().await, "A 11 a");

    // NOPING leaves the queue untouched; the real acknowledgement follows.
    connection.respond("NOPING host unreachable").await;
    connection.respond("OK").await;

    controller.mark_host_defunct(11);
    assert_eq!(connection.read_command().await, "D 11");
    connection.respond("OK").await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_from_the_queue_head() {
    let dir = tempfile::tempdir().unwrap();
    let pinger = FakePinger::bind(&socket_path(&dir));

    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let controller = PingController::start(shutdown_rx);
    controller.connect(socket_path(&dir));

    let mut connection = pinger.accept().await;
    controller.add_host(7, 11, "a".to_string());
    assert_eq!(connection.read_command().await, "A 11 a");

    // Close the socket mid-command, before acknowledging.
    drop(connection);

    // After the retry delay the controller reconnects and re-sends the same
    // head command.
    let mut connection = pinger.accept().await;
    assert_eq!(connection.read_command().await, "A 11 a");
    connection.respond("OK").await;
}

#[tokio::test(start_paused = true)]
async fn deactivation_withdraws_every_registered_host() {
    let dir = tempfile::tempdir().unwrap();
    let pinger = FakePinger::bind(&socket_path(&dir));

    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let controller = PingController::start(shutdown_rx);
    controller.connect(socket_path(&dir));
    let mut connection = pinger.accept().await;

    controller.add_host(7, 11, "a".to_string());
    assert_eq!(connection.read_command().await, "A 11 a");
    connection.respond("OK").await;

    controller.go_inactive();
    assert_eq!(connection.read_command().await, "R 11");
    connection.respond("OK").await;

    // Reactivation re-issues the registration; the host set is retained.
    controller.go_active();
    assert_eq!(connection.read_command().await, "A 11 a");
    connection.respond("OK").await;
}
