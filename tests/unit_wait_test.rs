use kunzitedb::config::Config;
use kunzitedb::core::state::{FollowerRecord, FollowerSyncState, ServerState};
use std::net::SocketAddr;
use std::sync::Arc;

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().expect("addr")
}

fn state() -> Arc<ServerState> {
    ServerState::initialize(Config::default()).expect("state").state
}

fn online_follower(
    session_id: u64,
    ack_offset: u64,
    skipped_bytes: u64,
) -> FollowerRecord {
    let mut record = FollowerRecord::new(session_id, addr(7000 + session_id as u16));
    record.state = FollowerSyncState::Online;
    record.ack_offset = ack_offset;
    record.skipped_bytes = skipped_bytes;
    record
}

#[test]
fn test_ack_counting_includes_loop_suppressed_bytes() {
    let state = state();
    {
        let mut core = state.replication.core.lock();
        core.followers.insert(1, online_follower(1, 100, 0));
        // Acked 60 bytes but 40 more were skipped as its own loop-backs:
        // effectively it holds everything up to offset 100.
        core.followers.insert(2, online_follower(2, 60, 40));
        core.followers.insert(3, online_follower(3, 10, 0));
    }

    let core = state.replication.core.lock();
    assert_eq!(core.count_acks(100), 2);
    assert_eq!(core.count_acks(61), 2);
    assert_eq!(core.count_acks(10), 3);
    assert_eq!(core.count_acks(101), 0);
}

#[test]
fn test_followers_still_syncing_never_count() {
    let state = state();
    {
        let mut core = state.replication.core.lock();
        let mut syncing = online_follower(1, 1000, 0);
        syncing.state = FollowerSyncState::WaitBgsaveEnd;
        core.followers.insert(1, syncing);
    }
    assert_eq!(state.replication.core.lock().count_acks(1), 0);
}

#[test]
fn test_good_follower_count_tracks_online_acks() {
    let state = state();
    {
        let mut core = state.replication.core.lock();
        core.followers.insert(1, online_follower(1, 0, 0));
        core.followers.insert(2, online_follower(2, 0, 0));
        let mut syncing = FollowerRecord::new(3, addr(7003));
        syncing.state = FollowerSyncState::WaitBgsaveStart;
        core.followers.insert(3, syncing);
        core.refresh_good_follower_count(10);
        assert_eq!(core.good_follower_count, 2);
    }
}
