use bytes::Bytes;
use kunzitedb::config::Config;
use kunzitedb::core::replication::snapshot::schedule_full_sync;
use kunzitedb::core::replication::tick::ReplicationCronTask;
use kunzitedb::core::state::{
    FollowerRecord, FollowerSyncState, ReplicaCapa, SaveInProgress, SaveTarget, ServerState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().expect("addr")
}

fn state_with(config: Config) -> Arc<ServerState> {
    ServerState::initialize(config).expect("state").state
}

fn long_ago(secs: u64) -> Instant {
    Instant::now()
        .checked_sub(Duration::from_secs(secs))
        .expect("instant arithmetic")
}

#[tokio::test]
async fn test_cron_disconnects_timed_out_online_followers() {
    let mut config = Config::default();
    config.replication.repl_timeout_secs = 60;
    let state = state_with(config);
    {
        let mut core = state.replication.core.lock();
        core.create_backlog_fresh_history(64 * 1024);

        let mut stale = FollowerRecord::new(1, addr(7001));
        stale.state = FollowerSyncState::Online;
        stale.ack_time = long_ago(120);
        core.followers.insert(1, stale);

        let mut healthy = FollowerRecord::new(2, addr(7002));
        healthy.state = FollowerSyncState::Online;
        core.followers.insert(2, healthy);

        // Legacy-SYNC followers never ACK; the timeout must not touch them.
        let mut legacy = FollowerRecord::new(3, addr(7003));
        legacy.state = FollowerSyncState::Online;
        legacy.pre_psync = true;
        legacy.ack_time = long_ago(999);
        core.followers.insert(3, legacy);
        core.no_followers_since = None;
    }

    ReplicationCronTask::new(state.clone()).run_round(1).await;

    let core = state.replication.core.lock();
    assert!(core.followers.get(&1).expect("record").closing);
    assert!(!core.followers.get(&2).expect("record").closing);
    assert!(!core.followers.get(&3).expect("record").closing);
    // The record stays until its owning session removes it; the backlog is
    // untouched by the eviction.
    assert!(core.backlog.is_some());
}

#[tokio::test]
async fn test_cron_reclaims_idle_backlog_and_rotates_the_primary_id() {
    let mut config = Config::default();
    config.replication.backlog_time_limit_secs = 30;
    let state = state_with(config);
    let old_id = {
        let mut core = state.replication.core.lock();
        core.create_backlog_fresh_history(64 * 1024);
        core.no_followers_since = Some(long_ago(120));
        core.identity.primary_id.clone()
    };

    ReplicationCronTask::new(state.clone()).run_round(1).await;

    let core = state.replication.core.lock();
    assert!(core.backlog.is_none());
    assert_ne!(core.identity.primary_id, old_id);
    assert_eq!(core.identity.secondary_valid_until_offset, -1);
}

#[tokio::test]
async fn test_cron_keeps_backlog_while_followers_exist() {
    let mut config = Config::default();
    config.replication.backlog_time_limit_secs = 30;
    let state = state_with(config);
    {
        let mut core = state.replication.core.lock();
        core.create_backlog_fresh_history(64 * 1024);
        core.no_followers_since = Some(long_ago(120));
        let mut record = FollowerRecord::new(1, addr(7001));
        record.state = FollowerSyncState::Online;
        core.followers.insert(1, record);
    }

    ReplicationCronTask::new(state.clone()).run_round(1).await;
    assert!(state.replication.core.lock().backlog.is_some());
}

#[tokio::test]
async fn test_cron_presync_heartbeats_reach_waiting_followers() {
    let state = state_with(Config::default());
    {
        let mut core = state.replication.core.lock();
        core.create_backlog_fresh_history(64 * 1024);
        core.followers.insert(1, FollowerRecord::new(1, addr(7001)));
        let mut online = FollowerRecord::new(2, addr(7002));
        online.state = FollowerSyncState::Online;
        core.followers.insert(2, online);
    }

    ReplicationCronTask::new(state.clone()).run_round(1).await;

    let core = state.replication.core.lock();
    let waiting = core.followers.get(&1).expect("record");
    assert_eq!(
        waiting.immediate.front(),
        Some(&Bytes::from_static(b"\n"))
    );
    // Online followers are pinged through the stream, not with raw newlines.
    assert!(core.followers.get(&2).expect("record").immediate.is_empty());
}

#[tokio::test]
async fn test_attach_to_running_disk_save_copies_the_donor_buffer() {
    let state = state_with(Config::default());
    {
        let mut core = state.replication.core.lock();
        core.create_backlog_fresh_history(64 * 1024);
        core.save = Some(SaveInProgress {
            target: SaveTarget::Disk,
            start_offset: 500,
        });

        let mut donor = FollowerRecord::new(1, addr(7001));
        donor.state = FollowerSyncState::WaitBgsaveEnd;
        donor.capa = ReplicaCapa::PSYNC2;
        donor.psync_initial_offset = 500;
        donor.stream.push_back(Bytes::from_static(b"accumulated-diff"));
        core.followers.insert(1, donor);

        let mut joiner = FollowerRecord::new(2, addr(7002));
        joiner.capa = ReplicaCapa::PSYNC2 | ReplicaCapa::EOF;
        joiner.uuid = Uuid::new_v4();
        core.followers.insert(2, joiner);
    }

    schedule_full_sync(&state, 2).await;

    let core = state.replication.core.lock();
    let joiner = core.followers.get(&2).expect("record");
    assert_eq!(joiner.state, FollowerSyncState::WaitBgsaveEnd);
    assert_eq!(joiner.psync_initial_offset, 500);
    assert_eq!(
        joiner.stream.front(),
        Some(&Bytes::from_static(b"accumulated-diff"))
    );
    // The +FULLRESYNC header was queued with the donor's save-start offset.
    let header = joiner.immediate.front().expect("header");
    assert!(header.starts_with(b"+FULLRESYNC "));
    assert!(header.ends_with(b" 500\r\n"));
}

#[tokio::test]
async fn test_attach_requires_covering_the_donor_capabilities() {
    let state = state_with(Config::default());
    {
        let mut core = state.replication.core.lock();
        core.create_backlog_fresh_history(64 * 1024);
        core.save = Some(SaveInProgress {
            target: SaveTarget::Disk,
            start_offset: 500,
        });

        let mut donor = FollowerRecord::new(1, addr(7001));
        donor.state = FollowerSyncState::WaitBgsaveEnd;
        donor.capa = ReplicaCapa::PSYNC2 | ReplicaCapa::EOF;
        core.followers.insert(1, donor);

        // The joiner lacks EOF, so the running save cannot serve it.
        let mut joiner = FollowerRecord::new(2, addr(7002));
        joiner.capa = ReplicaCapa::PSYNC2;
        core.followers.insert(2, joiner);
    }

    schedule_full_sync(&state, 2).await;

    let core = state.replication.core.lock();
    let joiner = core.followers.get(&2).expect("record");
    assert_eq!(joiner.state, FollowerSyncState::WaitBgsaveStart);
    assert!(joiner.immediate.is_empty());
}

#[tokio::test]
async fn test_socket_target_saves_are_never_shared_after_the_fact() {
    let state = state_with(Config::default());
    {
        let mut core = state.replication.core.lock();
        core.create_backlog_fresh_history(64 * 1024);
        core.save = Some(SaveInProgress {
            target: SaveTarget::Socket,
            start_offset: 100,
        });
        let mut donor = FollowerRecord::new(1, addr(7001));
        donor.state = FollowerSyncState::WaitBgsaveEnd;
        core.followers.insert(1, donor);
        let mut joiner = FollowerRecord::new(2, addr(7002));
        joiner.capa = ReplicaCapa::all();
        core.followers.insert(2, joiner);
    }

    schedule_full_sync(&state, 2).await;

    let core = state.replication.core.lock();
    assert_eq!(
        core.followers.get(&2).expect("record").state,
        FollowerSyncState::WaitBgsaveStart
    );
}
