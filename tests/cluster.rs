//! End-to-end cluster tests over real TCP servers: bootstrap, membership
//! changes, replication, commit delivery, and client RPCs.

use quorum::error::Result;
use quorum::raft::{
    self, Apply, EntryKind, Index, Log, Member, Options, Raft, Server, ServerId,
};
use quorum::storage;
use quorum::Client;

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long to wait for an expected condition before failing.
const WAIT: Duration = Duration::from_secs(10);

/// A test server running in-process: its Raft handle, address, and the Data
/// payloads its host subscriber has received, in order.
struct TestServer {
    id: ServerId,
    addr: String,
    raft: Raft,
    data: Arc<Mutex<Vec<Vec<u8>>>>,
    restores: Arc<Mutex<Vec<Index>>>,
}

impl TestServer {
    /// Starts a server with in-memory storage on an ephemeral port.
    fn start(id: ServerId) -> Result<TestServer> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?.to_string();

        let snapshots: Arc<Mutex<Box<dyn raft::snapshot::Store>>> =
            Arc::new(Mutex::new(Box::new(raft::snapshot::Memory::new())));
        let log = Log::new(Box::new(storage::Memory::new()), None)?;
        let opts = Options {
            tick_millis: 20,
            election_timeout_range: 5..10,
            addresses: addr.clone(),
            ..Options::default()
        };
        let server = Server::new(id, addr.clone(), log, snapshots, opts, 16)?;
        let raft = server.handle();

        let data = Arc::new(Mutex::new(Vec::new()));
        let restores = Arc::new(Mutex::new(Vec::new()));
        let subscriber = {
            let data = data.clone();
            let restores = restores.clone();
            Box::new(move |apply: Apply| match apply {
                Apply::Entries(entries) => {
                    let mut data = data.lock().expect("poisoned");
                    for entry in entries {
                        if entry.kind == EntryKind::Data {
                            data.push(entry.payload);
                        }
                    }
                }
                Apply::Snapshot { index, .. } => restores.lock().expect("poisoned").push(index),
            })
        };
        std::thread::spawn(move || server.serve(vec![listener], subscriber));

        Ok(TestServer { id, addr, raft, data, restores })
    }

    fn member(&self) -> Member {
        Member { id: self.id, addresses: self.addr.clone() }
    }

    fn data(&self) -> Vec<Vec<u8>> {
        self.data.lock().expect("poisoned").clone()
    }

    /// Waits until the server's host has received the given number of Data
    /// entries.
    fn wait_for_data(&self, count: usize) -> Result<()> {
        let deadline = Instant::now() + WAIT;
        while self.data.lock().expect("poisoned").len() < count {
            if Instant::now() > deadline {
                panic!(
                    "server {} received {} of {count} entries",
                    self.id,
                    self.data.lock().expect("poisoned").len()
                );
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

/// Retries an operation until it succeeds or the deadline passes, to ride
/// out elections and commit propagation.
fn retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let deadline = Instant::now() + WAIT;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(err) if Instant::now() > deadline => return Err(err),
            Err(_) => std::thread::sleep(Duration::from_millis(50)),
        }
    }
}

/// Bootstraps a two-server cluster, replicates a batch of entries, and
/// verifies both hosts observe them in order. Then grows the cluster by a
/// third server, which must catch up from scratch.
#[test]
fn bootstrap_replicate_and_grow() -> Result<()> {
    let s1 = TestServer::start(1)?;
    let s2 = TestServer::start(2)?;

    // Bootstrap server 1 and wait for it to elect itself.
    s1.raft.bootstrap()?;
    retry(|| s1.raft.get_last_commit_index())?;

    // Add server 2; the change succeeds once it has caught up and the final
    // configuration has committed.
    s1.raft.set_configuration(1, vec![s1.member(), s2.member()])?;

    // Replicate a batch of payloads in order.
    let count = 100;
    for i in 0..count {
        let payload = format!("{i}").into_bytes();
        retry(|| s1.raft.replicate(payload.clone()))?;
    }

    // Both hosts observe all entries, in order.
    let expect: Vec<Vec<u8>> = (0..count).map(|i| format!("{i}").into_bytes()).collect();
    s1.wait_for_data(count)?;
    s2.wait_for_data(count)?;
    assert_eq!(s1.data(), expect);
    assert_eq!(s2.data(), expect);

    // Grow the cluster: a brand-new server must observe the full history.
    let s3 = TestServer::start(3)?;
    let (config_id, members) = retry(|| s1.raft.get_configuration())?;
    assert_eq!(members.len(), 2);
    s1.raft.set_configuration(config_id, vec![s1.member(), s2.member(), s3.member()])?;
    s3.wait_for_data(count)?;
    assert_eq!(s3.data(), expect);

    Ok(())
}

/// The client RPC surface: server info, recipient verification, replication
/// and configuration reads over TCP, with leader hints on non-leaders.
#[test]
fn client_rpcs() -> Result<()> {
    let s1 = TestServer::start(1)?;
    let s2 = TestServer::start(2)?;

    s1.raft.bootstrap()?;
    retry(|| s1.raft.get_last_commit_index())?;
    s1.raft.set_configuration(1, vec![s1.member(), s2.member()])?;

    let mut c1 = Client::connect(&s1.addr)?;
    let (id, addresses) = c1.get_server_info()?;
    assert_eq!(id, 1);
    assert_eq!(addresses, s1.addr);

    // Recipient verification detects reconnecting to the wrong server.
    c1.verify_recipient(1)?;
    assert!(c1.verify_recipient(2).is_err());

    // Writes through the client commit and reach both hosts.
    let index = c1.replicate(b"via client".to_vec())?;
    assert!(index > 0);
    s1.wait_for_data(1)?;
    s2.wait_for_data(1)?;

    // The committed configuration is visible through any retry loop.
    let (_, members) = retry(|| c1.get_configuration())?;
    assert_eq!(
        members.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![1, 2],
    );

    // The follower rejects leader-only requests with a hint.
    let mut c2 = Client::connect(&s2.addr)?;
    match c2.replicate(b"nope".to_vec()) {
        Err(quorum::Error::NotLeader(hint)) => assert_eq!(hint, Some(1)),
        other => panic!("expected NotLeader, got {other:?}"),
    }

    // Shutdown: subsequent requests fail.
    s1.raft.shutdown()?;
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(s1.raft.get_last_commit_index(), Err(quorum::Error::Shutdown));

    Ok(())
}

/// A host snapshot compacts the log; a follower that joins afterwards is
/// restored from the snapshot and then follows the log.
#[test]
fn snapshot_restore_on_catchup() -> Result<()> {
    let s1 = TestServer::start(1)?;

    s1.raft.bootstrap()?;
    retry(|| s1.raft.get_last_commit_index())?;
    for i in 0..10 {
        retry(|| s1.raft.replicate(format!("{i}").into_bytes()))?;
    }
    s1.wait_for_data(10)?;

    // Snapshot through the last committed entry and compact the log.
    let commit_index = retry(|| s1.raft.get_last_commit_index())?;
    let (meta, mut writer) = s1.raft.begin_snapshot(commit_index)?;
    writer.append(b"compacted host state")?;
    s1.raft.snapshot_done(&meta, writer)?;

    // A new server can only be caught up via snapshot transfer.
    let s2 = TestServer::start(2)?;
    s1.raft.set_configuration(1, vec![s1.member(), s2.member()])?;
    retry(|| s1.raft.replicate(b"after snapshot".to_vec()))?;
    s2.wait_for_data(1)?;

    // The new host saw a restore signal, never the compacted entries.
    assert_eq!(s2.restores.lock().expect("poisoned").as_slice(), &[commit_index]);
    assert_eq!(s2.data(), vec![b"after snapshot".to_vec()]);

    Ok(())
}
