use bytes::Bytes;
use kunzitedb::config::Config;
use kunzitedb::core::protocol::RespFrame;
use kunzitedb::core::protocol::resp_frame::parse_frame;
use kunzitedb::core::replication::propagate::{propagate_getack, propagate_write, wrap_rreplay};
use kunzitedb::core::state::{FollowerRecord, FollowerSyncState, ServerState};
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

fn active_state() -> Arc<ServerState> {
    let mut config = Config::default();
    config.replication.active_replica = true;
    ServerState::initialize(config).expect("state").state
}

fn leader_state() -> Arc<ServerState> {
    ServerState::initialize(Config::default()).expect("state").state
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().expect("addr")
}

/// Installs an online follower record and returns its session id.
fn install_online_follower(state: &Arc<ServerState>, session_id: u64, uuid: Uuid) {
    let mut core = state.replication.core.lock();
    if core.backlog.is_none() {
        core.create_backlog_fresh_history(64 * 1024);
    }
    let mut record = FollowerRecord::new(session_id, addr(7000 + session_id as u16));
    record.state = FollowerSyncState::Online;
    record.uuid = uuid;
    core.followers.insert(session_id, record);
    core.no_followers_since = None;
}

#[test]
fn test_rreplay_wrap_produces_the_documented_envelope() {
    let origin = Uuid::nil();
    let inner = b"*1\r\n$4\r\nPING\r\n";
    let wrapped = wrap_rreplay(origin, inner, 3, 12345);

    let expected = format!(
        "*5\r\n$7\r\nRREPLAY\r\n$36\r\n{origin}\r\n${}\r\n{}\r\n$1\r\n3\r\n$5\r\n12345\r\n",
        inner.len(),
        String::from_utf8_lossy(inner),
    );
    assert_eq!(&wrapped[..], expected.as_bytes());

    // The envelope is itself a well-formed frame carrying the sidecars.
    let (frame, consumed) = parse_frame(&wrapped).expect("parse");
    assert_eq!(consumed, wrapped.len());
    let RespFrame::Array(parts) = frame else {
        panic!("expected an array envelope");
    };
    assert_eq!(parts.len(), 5);
    assert_eq!(parts[0], RespFrame::BulkString(Bytes::from_static(b"RREPLAY")));
    assert_eq!(parts[2], RespFrame::BulkString(Bytes::copy_from_slice(inner)));
    assert_eq!(parts[3], RespFrame::BulkString(Bytes::from_static(b"3")));
    assert_eq!(parts[4], RespFrame::BulkString(Bytes::from_static(b"12345")));
}

#[tokio::test]
async fn test_active_fanout_suppresses_the_originator() {
    let state = active_state();
    let origin = Uuid::new_v4();
    let other = Uuid::new_v4();
    install_online_follower(&state, 1, origin);
    install_online_follower(&state, 2, other);

    let before = state.replication.master_repl_offset();
    let offset = propagate_write(
        &state,
        0,
        &[
            Bytes::from_static(b"SET"),
            Bytes::from_static(b"x"),
            Bytes::from_static(b"1"),
        ],
        origin,
        777,
    );
    let delta = offset - before;
    assert!(delta > 0);

    let core = state.replication.core.lock();
    let originator = core.followers.get(&1).expect("record");
    let bystander = core.followers.get(&2).expect("record");

    // The follower the command came from never sees it again, but the bytes
    // are accounted so its ACK arithmetic still lines up.
    assert!(originator.stream.is_empty());
    assert_eq!(originator.skipped_bytes, delta);
    assert_eq!(originator.effective_ack(), delta);

    let sent: usize = bystander.stream.iter().map(|b| b.len()).sum();
    assert_eq!(sent as u64, delta);
    assert_eq!(bystander.skipped_bytes, 0);

    // The stream payload is the RREPLAY envelope wrapping the command.
    let payload = bystander.stream.front().expect("payload");
    assert!(payload.starts_with(b"*5\r\n$7\r\nRREPLAY\r\n"));
    assert!(
        payload
            .windows(origin.to_string().len())
            .any(|w| w == origin.to_string().as_bytes())
    );
}

#[tokio::test]
async fn test_nil_uuid_follower_is_never_suppressed() {
    let state = active_state();
    install_online_follower(&state, 1, Uuid::nil());

    let before = state.replication.master_repl_offset();
    // An originator with the nil sentinel cannot match anyone.
    let offset = propagate_write(
        &state,
        0,
        &[Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"v")],
        Uuid::nil(),
        1,
    );
    let delta = offset - before;

    let core = state.replication.core.lock();
    let follower = core.followers.get(&1).expect("record");
    assert_eq!(follower.skipped_bytes, 0);
    let sent: usize = follower.stream.iter().map(|b| b.len()).sum();
    assert_eq!(sent as u64, delta);
}

#[tokio::test]
async fn test_raw_fanout_emits_select_on_db_change() {
    let state = leader_state();
    install_online_follower(&state, 1, Uuid::nil());
    {
        // Force the SELECT re-emission the way a fresh full sync does.
        state.replication.core.lock().replica_seldb = None;
    }

    let before = state.replication.master_repl_offset();
    let offset = propagate_write(
        &state,
        2,
        &[Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"v")],
        state.instance_uuid,
        1,
    );

    let select = RespFrame::command(&[Bytes::from_static(b"SELECT"), Bytes::from_static(b"2")])
        .encode_to_vec()
        .expect("encode");
    let set = RespFrame::command(&[
        Bytes::from_static(b"SET"),
        Bytes::from_static(b"k"),
        Bytes::from_static(b"v"),
    ])
    .encode_to_vec()
    .expect("encode");
    assert_eq!(offset - before, (select.len() + set.len()) as u64);

    let core = state.replication.core.lock();
    let follower = core.followers.get(&1).expect("record");
    let mut sent = Vec::new();
    for chunk in &follower.stream {
        sent.extend_from_slice(chunk);
    }
    let mut expected = select;
    expected.extend_from_slice(&set);
    assert_eq!(sent, expected);
    assert_eq!(core.replica_seldb, Some(2));
}

#[tokio::test]
async fn test_getack_skips_followers_awaiting_their_first_ack() {
    let state = leader_state();
    install_online_follower(&state, 1, Uuid::nil());
    install_online_follower(&state, 2, Uuid::nil());
    {
        let mut core = state.replication.core.lock();
        core.followers.get_mut(&2).expect("record").put_online_on_ack = true;
    }

    let before = state.replication.master_repl_offset();
    propagate_getack(&state);
    let delta = state.replication.master_repl_offset() - before;
    assert!(delta > 0);

    let core = state.replication.core.lock();
    let ready = core.followers.get(&1).expect("record");
    let pending = core.followers.get(&2).expect("record");
    let sent: usize = ready.stream.iter().map(|b| b.len()).sum();
    assert_eq!(sent as u64, delta);
    assert!(pending.stream.is_empty());
    assert_eq!(pending.skipped_bytes, delta);
}

#[tokio::test]
async fn test_fanout_without_backlog_or_followers_is_a_noop() {
    let state = leader_state();
    let before = state.replication.master_repl_offset();
    let offset = propagate_write(
        &state,
        0,
        &[Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"v")],
        state.instance_uuid,
        1,
    );
    assert_eq!(offset, before);
    assert_eq!(state.replication.master_repl_offset(), before);
}
