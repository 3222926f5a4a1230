//! Follower-side handshake driven against a scripted leader on a real
//! loopback socket: the REPLCONF/PSYNC sequence, bulk transfer, stream
//! application, acknowledgements, and the active-replica RREPLAY rules.

use bytes::{Bytes, BytesMut};
use kunzitedb::config::{Config, LeaderEndpoint};
use kunzitedb::core::persistence::snapshot::{SnapshotMeta, save_to_bytes};
use kunzitedb::core::protocol::RespFrame;
use kunzitedb::core::protocol::resp_frame::parse_frame;
use kunzitedb::core::replication::propagate::wrap_rreplay;
use kunzitedb::core::replication::replica::ReplicaWorker;
use kunzitedb::core::state::{LinkState, ServerState};
use kunzitedb::core::storage::Db;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use uuid::Uuid;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// A scripted leader endpoint: parses commands the follower sends and
/// replies from the test body.
struct FakeLeader {
    stream: TcpStream,
    buf: BytesMut,
}

impl FakeLeader {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn read_command(&mut self) -> Vec<String> {
        use tokio::io::AsyncReadExt;
        loop {
            // Skip the bare newline keepalives the follower emits while busy.
            while self.buf.first() == Some(&b'\n') {
                let _ = self.buf.split_to(1);
            }
            match parse_frame(&self.buf) {
                Ok((frame, len)) => {
                    let _ = self.buf.split_to(len);
                    let RespFrame::Array(parts) = frame else {
                        panic!("follower sent a non-command frame");
                    };
                    return parts
                        .into_iter()
                        .map(|p| match p {
                            RespFrame::BulkString(b) => String::from_utf8_lossy(&b).to_string(),
                            other => panic!("unexpected frame part: {other:?}"),
                        })
                        .collect();
                }
                Err(_) => {
                    let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read_buf(&mut self.buf))
                        .await
                        .expect("read timed out")
                        .expect("read failed");
                    assert!(n > 0, "follower closed the link");
                }
            }
        }
    }

    async fn reply(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write failed");
    }

    /// Runs the handshake up to and including the PSYNC reply and snapshot.
    async fn serve_handshake_and_full_sync(
        &mut self,
        leader_uuid: Uuid,
        replid: &str,
        active_follower: bool,
        snapshot: &[u8],
    ) {
        let cmd = self.read_command().await;
        assert_eq!(cmd, vec!["PING"]);
        self.reply(b"+PONG\r\n").await;

        let cmd = self.read_command().await;
        assert_eq!(cmd[0], "REPLCONF");
        assert_eq!(cmd[1], "uuid");
        assert!(Uuid::parse_str(&cmd[2]).is_ok());
        self.reply(format!("+{leader_uuid}\r\n").as_bytes()).await;

        let cmd = self.read_command().await;
        assert_eq!(&cmd[..2], &["REPLCONF", "listening-port"]);
        self.reply(b"+OK\r\n").await;

        let cmd = self.read_command().await;
        let mut expected = vec!["REPLCONF", "capa", "eof", "capa", "psync2"];
        if active_follower {
            expected.extend(["capa", "activeExpire"]);
        }
        assert_eq!(cmd, expected);
        self.reply(b"+OK\r\n").await;

        let cmd = self.read_command().await;
        assert_eq!(cmd[0], "PSYNC");
        // A fresh (or active) follower always requests a full transfer.
        assert_eq!(&cmd[1..], &["?", "-1"]);
        self.reply(format!("+FULLRESYNC {replid} 0\r\n").as_bytes())
            .await;
        self.reply(format!("${}\r\n", snapshot.len()).as_bytes())
            .await;
        self.reply(snapshot).await;
    }

    /// Reads commands until a `REPLCONF ACK` at or past `offset` arrives.
    async fn await_ack_at_least(&mut self, offset: u64) {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            assert!(Instant::now() < deadline, "no ACK for offset {offset}");
            let cmd = self.read_command().await;
            if cmd.len() == 3 && cmd[0] == "REPLCONF" && cmd[1] == "ACK" {
                let acked: u64 = cmd[2].parse().expect("ack offset");
                if acked >= offset {
                    return;
                }
            }
        }
    }
}

fn snapshot_with_seed(replid: &str) -> Vec<u8> {
    let source = vec![Arc::new(Db::new())];
    source[0].set(Bytes::from_static(b"seed"), Bytes::from_static(b"value"), 7);
    save_to_bytes(
        &source,
        &SnapshotMeta {
            replid: replid.to_string(),
            master_repl_offset: 0,
            selected_db: 0,
        },
    )
    .expect("snapshot")
    .to_vec()
}

async fn spawn_follower(
    configure: impl FnOnce(&mut Config),
    leader_port: u16,
) -> (Arc<ServerState>, broadcast::Sender<()>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.port = 7799;
    config.persistence.snapshot_path = dir
        .path()
        .join("dump.kzdb")
        .to_string_lossy()
        .into_owned();
    config.replication.leaders = vec![LeaderEndpoint {
        host: "127.0.0.1".into(),
        port: leader_port,
    }];
    configure(&mut config);
    let state = ServerState::initialize(config).expect("state").state;

    let link = state.replication.leaders.lock()[0].clone();
    let (shutdown_tx, _) = broadcast::channel(1);
    let worker = ReplicaWorker::new(state.clone(), link);
    tokio::spawn(worker.run(
        shutdown_tx.subscribe(),
        state.replication.reconfigure_tx.subscribe(),
    ));
    (state, shutdown_tx, dir)
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
async fn test_follower_full_sync_applies_snapshot_and_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let leader_port = listener.local_addr().expect("addr").port();
    let (state, shutdown_tx, _dir) = spawn_follower(|_| {}, leader_port).await;

    let (socket, _) = listener.accept().await.expect("accept");
    let mut leader = FakeLeader::new(socket);

    let leader_uuid = Uuid::new_v4();
    let replid = "c".repeat(40);
    let snapshot = snapshot_with_seed(&replid);
    leader
        .serve_handshake_and_full_sync(leader_uuid, &replid, false, &snapshot)
        .await;

    // The transfer completes: snapshot applied, identity adopted, link up.
    wait_for("link to reach Connected", || {
        state.replication.leaders.lock()[0].link_state() == LinkState::Connected
    })
    .await;
    assert_eq!(
        state.dbs[0].get(b"seed").expect("snapshot key").data,
        Bytes::from_static(b"value")
    );
    {
        let core = state.replication.core.lock();
        assert_eq!(core.identity.primary_id, replid);
        assert_eq!(core.master_repl_offset, 0);
        assert!(core.backlog.is_some());
    }
    let link = state.replication.leaders.lock()[0].clone();
    assert_eq!(*link.master_uuid.lock(), leader_uuid);

    // Live stream: one SET, applied and acknowledged with its byte length.
    let set_bytes = encode_command(&[b"SET", b"streamed", b"yes"]);
    leader.reply(&set_bytes).await;
    wait_for("streamed key to apply", || {
        state.dbs[0].get(b"streamed").is_some()
    })
    .await;
    assert_eq!(link.reploff(), set_bytes.len() as u64);
    leader.await_ack_at_least(set_bytes.len() as u64).await;

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_follower_answers_getack_immediately() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let leader_port = listener.local_addr().expect("addr").port();
    let (state, shutdown_tx, _dir) = spawn_follower(|_| {}, leader_port).await;

    let (socket, _) = listener.accept().await.expect("accept");
    let mut leader = FakeLeader::new(socket);
    let replid = "d".repeat(40);
    let snapshot = snapshot_with_seed(&replid);
    leader
        .serve_handshake_and_full_sync(Uuid::new_v4(), &replid, false, &snapshot)
        .await;
    wait_for("link to reach Connected", || {
        state.replication.leaders.lock()[0].link_state() == LinkState::Connected
    })
    .await;

    let getack = encode_command(&[b"REPLCONF", b"GETACK", b"*"]);
    leader.reply(&getack).await;
    // The ACK covers the GETACK frame itself.
    leader.await_ack_at_least(getack.len() as u64).await;

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_active_follower_applies_foreign_rreplay_and_drops_its_own() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let leader_port = listener.local_addr().expect("addr").port();
    let (state, shutdown_tx, _dir) = spawn_follower(
        |config| {
            config.replication.active_replica = true;
        },
        leader_port,
    )
    .await;

    let (socket, _) = listener.accept().await.expect("accept");
    let mut leader = FakeLeader::new(socket);
    let replid = "e".repeat(40);
    let snapshot = snapshot_with_seed(&replid);
    leader
        .serve_handshake_and_full_sync(Uuid::new_v4(), &replid, true, &snapshot)
        .await;
    wait_for("link to reach Connected", || {
        state.replication.leaders.lock()[0].link_state() == LinkState::Connected
    })
    .await;

    // The active merge keeps local data and folds the leader's lineage into
    // the local one instead of adopting it verbatim.
    assert_eq!(
        state.dbs[0].get(b"seed").expect("merged key").data,
        Bytes::from_static(b"value")
    );

    // A peer's command arrives wrapped: unwrap, apply, and record its MVCC.
    let peer_uuid = Uuid::new_v4();
    let inner = encode_command(&[b"SET", b"from_peer", b"1"]);
    let wrapped = wrap_rreplay(peer_uuid, &inner, 0, 12345);
    leader.reply(&wrapped).await;
    wait_for("peer write to apply", || {
        state.dbs[0].get(b"from_peer").is_some()
    })
    .await;
    let link = state.replication.leaders.lock()[0].clone();
    assert_eq!(
        link.mvcc_last_sync.load(std::sync::atomic::Ordering::SeqCst),
        12345
    );

    // Our own command looping back must be dropped, not re-applied.
    let own_inner = encode_command(&[b"SET", b"looped", b"1"]);
    let own_wrapped = wrap_rreplay(state.instance_uuid, &own_inner, 0, 99999);
    let offset_before = link.reploff();
    leader.reply(&own_wrapped).await;
    wait_for("looped frame to be consumed", || {
        link.reploff() == offset_before + own_wrapped.len() as u64
    })
    .await;
    assert!(state.dbs[0].get(b"looped").is_none());

    let _ = shutdown_tx.send(());
}
