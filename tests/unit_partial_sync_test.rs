//! Partial resynchronization over an in-memory link: a reconnecting follower
//! inside the backlog window resumes with +CONTINUE and the exact missed
//! bytes; one outside the window is demoted to a full resync.

use bytes::{Bytes, BytesMut};
use kunzitedb::config::Config;
use kunzitedb::core::replication::primary::{FollowerSession, SyncKind, SyncRequest};
use kunzitedb::core::state::{ReplicaCapa, ServerState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::broadcast;
use uuid::Uuid;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

struct TestClient {
    stream: DuplexStream,
    buf: BytesMut,
}

impl TestClient {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn fill(&mut self) {
        let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read_buf(&mut self.buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        assert!(n > 0, "peer closed the link unexpectedly");
    }

    async fn read_line(&mut self) -> String {
        loop {
            while self.buf.first() == Some(&b'\n') {
                let _ = self.buf.split_to(1);
            }
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos);
                let _ = self.buf.split_to(2);
                return String::from_utf8_lossy(&line).to_string();
            }
            self.fill().await;
        }
    }

    async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            self.fill().await;
        }
        self.buf.split_to(n).to_vec()
    }
}

/// A leader with 100 known bytes in its backlog, offsets 1..=100.
fn seeded_state() -> (Arc<ServerState>, String, Vec<u8>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.persistence.snapshot_path = dir
        .path()
        .join("dump.kzdb")
        .to_string_lossy()
        .into_owned();
    let state = ServerState::initialize(config).expect("state").state;

    let stream_bytes: Vec<u8> = (0u8..100).collect();
    let replid = {
        let mut core = state.replication.core.lock();
        core.create_backlog_fresh_history(64 * 1024);
        core.append_stream_bytes(&stream_bytes);
        core.identity.primary_id.clone()
    };
    (state, replid, stream_bytes, dir)
}

fn psync_request(replid: &str, offset: u64) -> SyncRequest {
    SyncRequest {
        kind: SyncKind::Psync {
            replid: replid.to_string(),
            offset: offset.to_string(),
        },
        capa: ReplicaCapa::empty(),
        uuid: Uuid::nil(),
        listening_port: Some(7777),
        announced_ip: None,
    }
}

fn follower_addr() -> SocketAddr {
    "127.0.0.1:6002".parse().expect("addr")
}

#[tokio::test]
async fn test_partial_resync_replays_the_exact_missed_bytes() {
    let (state, replid, stream_bytes, _dir) = seeded_state();
    let first_valid = {
        let core = state.replication.core.lock();
        core.backlog.as_ref().expect("backlog").first_valid_offset()
    };
    let offset = first_valid + 10;

    let (server_end, client_end) = tokio::io::duplex(1 << 16);
    let (shutdown_tx, _) = broadcast::channel(1);
    let session = FollowerSession::new(state.clone(), 1, follower_addr(), server_end);
    tokio::spawn(session.run(psync_request(&replid, offset), shutdown_tx.subscribe()));

    let mut client = TestClient::new(client_end);
    // No psync2 capability declared, so the reply is the bare +CONTINUE.
    assert_eq!(client.read_line().await, "+CONTINUE");
    let missed = client.read_exact(stream_bytes.len() - 10).await;
    assert_eq!(&missed, &stream_bytes[10..]);
}

#[tokio::test]
async fn test_psync2_follower_gets_the_replid_in_continue() {
    let (state, replid, _stream_bytes, _dir) = seeded_state();

    let (server_end, client_end) = tokio::io::duplex(1 << 16);
    let (shutdown_tx, _) = broadcast::channel(1);
    let session = FollowerSession::new(state.clone(), 1, follower_addr(), server_end);
    let mut request = psync_request(&replid, 50);
    request.capa = ReplicaCapa::PSYNC2;
    tokio::spawn(session.run(request, shutdown_tx.subscribe()));

    let mut client = TestClient::new(client_end);
    assert_eq!(client.read_line().await, format!("+CONTINUE {replid}"));
}

#[tokio::test]
async fn test_backlog_miss_demotes_to_full_resync() {
    let (state, replid, _stream_bytes, _dir) = seeded_state();
    let first_valid = {
        let core = state.replication.core.lock();
        core.backlog.as_ref().expect("backlog").first_valid_offset()
    };

    let (server_end, client_end) = tokio::io::duplex(1 << 16);
    let (shutdown_tx, _) = broadcast::channel(1);
    let session = FollowerSession::new(state.clone(), 1, follower_addr(), server_end);
    // One byte before the retained window: the backlog cannot serve it.
    tokio::spawn(session.run(
        psync_request(&replid, first_valid - 1),
        shutdown_tx.subscribe(),
    ));

    let mut client = TestClient::new(client_end);
    let header = client.read_line().await;
    let parts: Vec<&str> = header.split_whitespace().collect();
    assert_eq!(parts[0], "+FULLRESYNC");
    // The lineage did not change; the offset is the current stream position.
    assert_eq!(parts[1], replid);
    assert_eq!(parts[2], "100");
    // A snapshot follows, as for any full resync.
    let bulk_header = client.read_line().await;
    let size: usize = bulk_header
        .strip_prefix('$')
        .expect("bulk prefix")
        .parse()
        .expect("bulk size");
    let image = client.read_exact(size).await;
    assert!(!image.is_empty());
}

#[tokio::test]
async fn test_unknown_replid_is_demoted_to_full_resync() {
    let (state, _replid, _stream_bytes, _dir) = seeded_state();

    let (server_end, client_end) = tokio::io::duplex(1 << 16);
    let (shutdown_tx, _) = broadcast::channel(1);
    let session = FollowerSession::new(state.clone(), 1, follower_addr(), server_end);
    tokio::spawn(session.run(
        psync_request(&"f".repeat(40), 50),
        shutdown_tx.subscribe(),
    ));

    let mut client = TestClient::new(client_end);
    assert!(client.read_line().await.starts_with("+FULLRESYNC "));
}

#[tokio::test]
async fn test_secondary_id_serves_psync_within_its_validity_window() {
    let (state, old_replid, stream_bytes, _dir) = seeded_state();
    // Promotion: the old lineage becomes the secondary, answerable up to the
    // offset at the moment of the shift.
    let new_replid = {
        let mut core = state.replication.core.lock();
        let offset = core.master_repl_offset;
        core.identity.promote_to_leader(offset);
        core.identity.primary_id.clone()
    };

    let (server_end, client_end) = tokio::io::duplex(1 << 16);
    let (shutdown_tx, _) = broadcast::channel(1);
    let session = FollowerSession::new(state.clone(), 1, follower_addr(), server_end);
    let mut request = psync_request(&old_replid, 41);
    request.capa = ReplicaCapa::PSYNC2;
    tokio::spawn(session.run(request, shutdown_tx.subscribe()));

    let mut client = TestClient::new(client_end);
    // The reply advertises the new primary lineage.
    assert_eq!(client.read_line().await, format!("+CONTINUE {new_replid}"));
    let missed = client.read_exact(stream_bytes.len() - 40).await;
    assert_eq!(&missed, &stream_bytes[40..]);
}
