use crate::server::{Server, ServerConfig, SessionLock, bind};
use core::time::Duration;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);
const BUSY: &str = "ERROR: Transaction in progress. Retry later.";
const BEGUN: &str = "OK: Transaction started. Exclusive lock acquired.";
const COMMITTED: &str = "OK: Transaction committed. Lock released.";

struct Harness {
    addr: SocketAddr,
    lock: Arc<SessionLock>,
    shutdown: CancellationToken,
    server: JoinHandle<crate::Result<()>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start(max_concurrent: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            dir.path().join("inventory.csv"),
        )
        .with_max_concurrent(max_concurrent);

        let server = Server::open(&config).unwrap();
        let lock = Arc::clone(server.session_lock());
        let listener = bind(config.addr, config.backlog).unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(server.serve(listener, shutdown.clone()));

        Self {
            addr,
            lock,
            shutdown,
            server,
            _dir: dir,
        }
    }

    async fn connect(&self) -> Client {
        let mut client = Client::open(self.addr).await;
        let banner = client.line().await.unwrap();
        assert!(banner.starts_with("OK: Welcome. You are user "), "{banner}");
        client
    }

    async fn stop(self) {
        self.shutdown.cancel();
        timeout(WAIT, self.server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn open(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn line(&mut self) -> Option<String> {
        timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for the server")
            .unwrap()
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn send(&mut self, command: &str) {
        self.writer
            .write_all(format!("{command}\n").as_bytes())
            .await
            .unwrap();
    }

    /// Sends a command that answers with one status line.
    async fn request(&mut self, command: &str) -> String {
        self.send(command).await;
        self.line().await.unwrap()
    }

    /// Sends a command that answers with rows, or with a single error line.
    async fn query(&mut self, command: &str) -> Vec<String> {
        self.send(command).await;
        let mut lines = Vec::new();
        while let Some(line) = self.line().await {
            if line == "---END---" {
                break;
            }
            let is_error = line.starts_with("ERROR:");
            lines.push(line);
            if is_error {
                break;
            }
        }
        lines
    }
}

#[tokio::test]
async fn second_begin_is_refused_until_commit() {
    let harness = Harness::start(5).await;
    let mut a = harness.connect().await;
    let mut b = harness.connect().await;

    assert_eq!(a.request("BEGIN TRANSACTION").await, BEGUN);
    assert_eq!(b.request("BEGIN TRANSACTION").await, BUSY);
    assert_eq!(a.request("COMMIT TRANSACTION").await, COMMITTED);
    assert_eq!(b.request("BEGIN TRANSACTION").await, BEGUN);
    assert_eq!(b.request("COMMIT TRANSACTION").await, COMMITTED);

    harness.stop().await;
}

#[tokio::test]
async fn insert_requires_begin_and_is_visible_after_commit() {
    let harness = Harness::start(5).await;
    let mut a = harness.connect().await;

    assert_eq!(
        a.request("INSERT 100;Router;5;199.99").await,
        "ERROR: Modifications require BEGIN TRANSACTION."
    );
    assert_eq!(a.request("BEGIN TRANSACTION").await, BEGUN);
    assert_eq!(a.request("INSERT 100;Router;5;199.99").await, "OK: Row inserted.");
    assert_eq!(a.request("COMMIT TRANSACTION").await, COMMITTED);

    assert_eq!(
        a.query("SELECT WHERE ID=100").await,
        ["ID,Product,Quantity,Price", "100,Router,5,199.99"]
    );

    harness.stop().await;
}

#[tokio::test]
async fn select_is_refused_while_any_transaction_is_open() {
    let harness = Harness::start(5).await;
    let mut a = harness.connect().await;
    let mut b = harness.connect().await;

    assert_eq!(a.request("BEGIN TRANSACTION").await, BEGUN);
    assert_eq!(a.request("INSERT 1;Cable;10;2.50").await, "OK: Row inserted.");
    assert_eq!(b.query("SELECT ALL").await, [BUSY]);
    assert_eq!(b.query("SELECT WHERE Product=Cable").await, [BUSY]);
    assert_eq!(b.query("SELECT WHERE Colour=red").await, [BUSY]);
    assert_eq!(a.query("SELECT ALL").await, [BUSY]);
    assert_eq!(
        b.request("INSERT 2;Hub;1;9.99").await,
        "ERROR: Transaction in progress by another session. Retry later."
    );

    assert_eq!(a.request("COMMIT TRANSACTION").await, COMMITTED);
    assert_eq!(
        b.query("SELECT ALL").await,
        ["ID,Product,Quantity,Price", "1,Cable,10,2.50"]
    );

    harness.stop().await;
}

#[tokio::test]
async fn commit_without_transaction_never_changes_the_lock() {
    let harness = Harness::start(5).await;
    let mut a = harness.connect().await;
    let mut b = harness.connect().await;

    assert_eq!(b.request("BEGIN TRANSACTION").await, BEGUN);
    let holder = harness.lock.holder();
    for _ in 0..3 {
        assert_eq!(
            a.request("COMMIT TRANSACTION").await,
            "ERROR: No active transaction to COMMIT."
        );
        assert_eq!(harness.lock.holder(), holder);
    }

    harness.stop().await;
}

#[tokio::test]
async fn disconnect_inside_a_transaction_frees_the_lock() {
    let harness = Harness::start(5).await;
    let mut a = harness.connect().await;
    let mut b = harness.connect().await;

    assert_eq!(a.request("BEGIN TRANSACTION").await, BEGUN);
    drop(a);

    let begun = timeout(WAIT, async {
        loop {
            let reply = b.request("BEGIN TRANSACTION").await;
            if reply == BEGUN {
                break;
            }
            assert_eq!(reply, BUSY);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(begun.is_ok(), "lock was never released");

    harness.stop().await;
}

#[tokio::test]
async fn exit_releases_the_lock_and_closes_the_connection() {
    let harness = Harness::start(5).await;
    let mut a = harness.connect().await;

    assert_eq!(a.request("BEGIN TRANSACTION").await, BEGUN);
    assert_eq!(a.request("EXIT").await, "OK: Bye.");
    assert_eq!(a.line().await, None);

    let mut b = harness.connect().await;
    assert_eq!(b.request("BEGIN TRANSACTION").await, BEGUN);

    harness.stop().await;
}

#[tokio::test]
async fn sessions_beyond_capacity_wait_for_a_free_slot() {
    let harness = Harness::start(1).await;
    let mut a = harness.connect().await;

    let mut waiting = Client::open(harness.addr).await;
    let early = timeout(Duration::from_millis(200), waiting.lines.next_line()).await;
    assert!(early.is_err(), "second session admitted while the first was live");

    assert_eq!(a.request("EXIT").await, "OK: Bye.");
    let banner = waiting.line().await.unwrap();
    assert!(banner.starts_with("OK: Welcome. You are user 2."), "{banner}");

    harness.stop().await;
}

#[tokio::test]
async fn help_and_unknown_commands() {
    let harness = Harness::start(5).await;
    let mut a = harness.connect().await;

    let help = a.query("HELP").await;
    assert!(help.iter().any(|line| line.contains("BEGIN TRANSACTION")));
    assert_eq!(a.request("FROBNICATE").await, "ERROR: Unrecognized command.");
    assert!(
        a.request("SELECT WHERE nothing")
            .await
            .starts_with("ERROR: Invalid SELECT format")
    );

    harness.stop().await;
}

#[tokio::test]
async fn shutdown_closes_live_sessions_and_releases_the_lock() {
    let harness = Harness::start(5).await;
    let mut a = harness.connect().await;
    assert_eq!(a.request("BEGIN TRANSACTION").await, BEGUN);

    let lock = Arc::clone(&harness.lock);
    harness.stop().await;

    assert_eq!(a.line().await, None);
    assert!(!lock.is_held());
}

#[tokio::test]
async fn undecodable_bytes_are_refused_and_the_transaction_survives() {
    let harness = Harness::start(5).await;
    let mut a = harness.connect().await;

    assert_eq!(a.request("BEGIN TRANSACTION").await, BEGUN);
    a.send_raw(b"\xff\xfe BOGUS\n").await;
    assert_eq!(a.line().await.as_deref(), Some("ERROR: Unrecognized command."));
    assert_eq!(harness.lock.holder(), Some(1));
    assert_eq!(a.request("COMMIT TRANSACTION").await, COMMITTED);

    harness.stop().await;
}

#[tokio::test]
async fn overlong_commands_are_refused_and_skipped() {
    let harness = Harness::start(5).await;
    let mut a = harness.connect().await;

    let long = format!("SELECT WHERE Product={}", "x".repeat(4 * 512));
    let reply = a.request(&long).await;
    assert!(reply.starts_with("ERROR: Invalid command format"), "{reply}");
    assert_eq!(a.request("BEGIN TRANSACTION").await, BEGUN);
    assert_eq!(a.request("COMMIT TRANSACTION").await, COMMITTED);

    harness.stop().await;
}
