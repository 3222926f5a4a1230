//! End-to-end leader-side synchronization over an in-memory link: a fresh
//! follower sends PSYNC, receives a FULLRESYNC header and the bulk snapshot,
//! then the live stream, and acknowledges offsets back.

use bytes::{Bytes, BytesMut};
use kunzitedb::config::Config;
use kunzitedb::core::persistence::snapshot::{
    SnapshotLoadOptions, SnapshotMeta, load_from_bytes, save_to_bytes,
};
use kunzitedb::core::protocol::RespFrame;
use kunzitedb::core::replication::primary::{FollowerSession, SyncKind, SyncRequest};
use kunzitedb::core::replication::propagate::propagate_write;
use kunzitedb::core::replication::tick::ReplicationCronTask;
use kunzitedb::core::state::{FollowerSyncState, ReplicaCapa, ServerState};
use kunzitedb::core::storage::Db;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
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

    /// Reads one CRLF line, skipping bare keepalive newlines.
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

    async fn expect_silence(&mut self, window: Duration) {
        assert!(self.buf.is_empty(), "unexpected buffered bytes");
        let result =
            tokio::time::timeout(window, self.stream.read_buf(&mut self.buf)).await;
        assert!(result.is_err(), "expected no traffic, got {:?}", self.buf);
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write failed");
    }
}

fn test_state(configure: impl FnOnce(&mut Config)) -> (Arc<ServerState>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.persistence.snapshot_path = dir
        .path()
        .join("dump.kzdb")
        .to_string_lossy()
        .into_owned();
    configure(&mut config);
    let state = ServerState::initialize(config).expect("state").state;
    (state, dir)
}

fn follower_addr() -> SocketAddr {
    "127.0.0.1:6001".parse().expect("addr")
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + IO_TIMEOUT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let argv: Vec<Bytes> = args.iter().map(|a| Bytes::copy_from_slice(a)).collect();
    RespFrame::command(&argv).encode_to_vec().expect("encode")
}

#[tokio::test]
async fn test_fresh_follower_full_sync_then_stream_and_ack() {
    let (state, _dir) = test_state(|_| {});
    state
        .dbs[0]
        .set(Bytes::from_static(b"seed"), Bytes::from_static(b"value"), 5);

    let (server_end, client_end) = tokio::io::duplex(1 << 20);
    let (shutdown_tx, _) = broadcast::channel(1);
    let session = FollowerSession::new(state.clone(), 1, follower_addr(), server_end);
    let request = SyncRequest {
        kind: SyncKind::Psync {
            replid: "?".into(),
            offset: "-1".into(),
        },
        capa: ReplicaCapa::PSYNC2,
        uuid: Uuid::nil(),
        listening_port: Some(7777),
        announced_ip: None,
    };
    tokio::spawn(session.run(request, shutdown_tx.subscribe()));

    let mut client = TestClient::new(client_end);

    // 1. The FULLRESYNC header names the lineage and the snapshot offset.
    let header = client.read_line().await;
    let parts: Vec<&str> = header.split_whitespace().collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], "+FULLRESYNC");
    assert_eq!(parts[1].len(), 40);
    assert_eq!(parts[2], "0");

    // 2. The size-prefixed bulk snapshot follows and contains the dataset.
    let bulk_header = client.read_line().await;
    let size: usize = bulk_header
        .strip_prefix('$')
        .expect("bulk prefix")
        .parse()
        .expect("bulk size");
    let image = client.read_exact(size).await;
    let restored = vec![Arc::new(Db::new())];
    let report =
        load_from_bytes(&image, &restored, &SnapshotLoadOptions::default()).expect("image loads");
    assert_eq!(report.meta.replid, parts[1]);
    assert_eq!(report.meta.master_repl_offset, 0);
    assert_eq!(
        restored[0].get(b"seed").expect("seeded key").data,
        Bytes::from_static(b"value")
    );

    // 3. Once online, fan-out reaches the follower: SELECT (forced after the
    //    cut-over) followed by the command, and the offset advances by
    //    exactly those bytes.
    wait_for("follower to come online", || {
        state
            .replication
            .core
            .lock()
            .followers
            .get(&1)
            .is_some_and(|f| f.state == FollowerSyncState::Online)
    })
    .await;

    let before = state.replication.master_repl_offset();
    let mvcc = state.mvcc_clock.next();
    let after = propagate_write(
        &state,
        0,
        &[
            Bytes::from_static(b"SET"),
            Bytes::from_static(b"k"),
            Bytes::from_static(b"v"),
        ],
        state.instance_uuid,
        mvcc,
    );

    let mut expected = encode_command(&[b"SELECT", b"0"]);
    expected.extend_from_slice(&encode_command(&[b"SET", b"k", b"v"]));
    assert_eq!(after - before, expected.len() as u64);
    let received = client.read_exact(expected.len()).await;
    assert_eq!(received, expected);

    // 4. The acknowledgement flows back and lands on the record.
    client
        .send(&encode_command(&[
            b"REPLCONF",
            b"ACK",
            after.to_string().as_bytes(),
        ]))
        .await;
    wait_for("the ACK to be recorded", || {
        state
            .replication
            .core
            .lock()
            .followers
            .get(&1)
            .is_some_and(|f| f.ack_offset == after)
    })
    .await;
}

#[tokio::test]
async fn test_diskless_sync_uses_eof_envelope_and_holds_stream_until_ack() {
    let (state, _dir) = test_state(|config| {
        config.replication.diskless_sync = true;
    });
    state
        .dbs[0]
        .set(Bytes::from_static(b"seed"), Bytes::from_static(b"value"), 5);

    let (server_end, client_end) = tokio::io::duplex(1 << 20);
    let (shutdown_tx, _) = broadcast::channel(1);
    let session = FollowerSession::new(state.clone(), 1, follower_addr(), server_end);
    let request = SyncRequest {
        kind: SyncKind::Psync {
            replid: "?".into(),
            offset: "-1".into(),
        },
        capa: ReplicaCapa::PSYNC2 | ReplicaCapa::EOF,
        uuid: Uuid::nil(),
        listening_port: Some(7777),
        announced_ip: None,
    };
    tokio::spawn(session.run(request, shutdown_tx.subscribe()));

    // Diskless saves are launched by the cron after the arrival delay, so
    // more followers can share the stream. Age the request and run a round.
    wait_for("follower registration", || {
        state.replication.core.lock().followers.contains_key(&1)
    })
    .await;
    {
        let mut core = state.replication.core.lock();
        let follower = core.followers.get_mut(&1).expect("record");
        follower.last_interaction = Instant::now()
            .checked_sub(Duration::from_secs(30))
            .expect("instant arithmetic");
    }
    ReplicationCronTask::new(state.clone()).run_round(1).await;

    let mut client = TestClient::new(client_end);
    let header = client.read_line().await;
    assert!(header.starts_with("+FULLRESYNC "));
    let replid = header.split_whitespace().nth(1).expect("replid").to_string();

    // The EOF envelope: `$EOF:<40-byte mark>`, payload, mark.
    let bulk_header = client.read_line().await;
    let mark = bulk_header.strip_prefix("$EOF:").expect("EOF envelope");
    assert_eq!(mark.len(), 40);

    let expected_image = save_to_bytes(
        &state.dbs,
        &SnapshotMeta {
            replid,
            master_repl_offset: 0,
            selected_db: 0,
        },
    )
    .expect("reference image");
    let payload = client.read_exact(expected_image.len()).await;
    assert_eq!(payload, expected_image);
    let trailer = client.read_exact(40).await;
    assert_eq!(trailer, mark.as_bytes());

    // The follower is online but not yet writable: stream bytes are held
    // back until its first ACK confirms it finished loading.
    wait_for("follower to come online", || {
        state
            .replication
            .core
            .lock()
            .followers
            .get(&1)
            .is_some_and(|f| f.state == FollowerSyncState::Online && f.put_online_on_ack)
    })
    .await;

    let mvcc = state.mvcc_clock.next();
    let after = propagate_write(
        &state,
        0,
        &[
            Bytes::from_static(b"SET"),
            Bytes::from_static(b"k"),
            Bytes::from_static(b"v"),
        ],
        state.instance_uuid,
        mvcc,
    );
    client.expect_silence(Duration::from_millis(300)).await;

    client
        .send(&encode_command(&[
            b"REPLCONF",
            b"ACK",
            after.to_string().as_bytes(),
        ]))
        .await;

    let mut expected = encode_command(&[b"SELECT", b"0"]);
    expected.extend_from_slice(&encode_command(&[b"SET", b"k", b"v"]));
    let received = client.read_exact(expected.len()).await;
    assert_eq!(received, expected);
}
