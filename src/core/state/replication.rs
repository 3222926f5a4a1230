// src/core/state/replication.rs

//! Replication state: the data-plane core shared by the fan-out, the
//! leader-side sessions, the follower workers and the cron, plus the
//! per-upstream-leader link records.
//!
//! The single `Mutex<ReplicationCore>` is the global data-plane lock of this
//! server: the backlog, the replication identity, the follower table and the
//! snapshot orchestration state all live under it, and every fan-out or
//! session state transition happens while holding it. Socket I/O never does.

use crate::config::ReplicationSettings;
use crate::core::replication::backlog::ReplicationBacklog;
use crate::core::replication::cached::CachedPrimary;
use crate::core::replication::replid::ReplicationIdentity;
use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Notify, broadcast, watch};
use uuid::Uuid;

bitflags! {
    /// Capabilities a follower declares via `REPLCONF capa`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReplicaCapa: u32 {
        /// Understands EOF-delimited (diskless) bulk transfers.
        const EOF           = 1 << 0;
        /// Understands `+CONTINUE <replid>` and secondary-ID PSYNC.
        const PSYNC2        = 1 << 1;
        /// Expires keys on its own; required between active replicas.
        const ACTIVE_EXPIRE = 1 << 2;
    }
}

/// Leader-side view of a follower's synchronization progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerSyncState {
    /// Waiting for a usable background save to start.
    WaitBgsaveStart,
    /// A save it is attached to is running; stream diffs are accumulating.
    WaitBgsaveEnd,
    /// The snapshot payload is being written to its socket.
    SendBulk,
    /// Fully synchronized, receiving the live stream.
    Online,
}

/// The snapshot payload handed to a session once its save completes.
#[derive(Debug, Clone)]
pub enum BulkHandoff {
    /// Disk target: stream the saved file with a `$<size>\r\n` preamble.
    DiskFile { path: PathBuf, size: u64 },
    /// Diskless target: write the EOF-delimited envelope directly.
    SocketPayload { payload: Bytes, eof_mark: Bytes },
}

/// Per-follower record, owned by the data-plane lock. The session task that
/// owns the socket drains the two byte queues; everything else only appends
/// to them and rings `notify`.
#[derive(Debug)]
pub struct FollowerRecord {
    pub session_id: u64,
    pub addr: SocketAddr,
    pub state: FollowerSyncState,
    pub capa: ReplicaCapa,
    /// The follower's instance identity; nil until `REPLCONF uuid`. The nil
    /// UUID is a sentinel and never compares equal for loop suppression.
    pub uuid: Uuid,
    /// Set for followers that used legacy SYNC: no FULLRESYNC header, no
    /// ACKs expected, exempt from ACK timeouts.
    pub pre_psync: bool,
    /// Global offset at the moment its attached save started; later arrivals
    /// that share the save inherit it.
    pub psync_initial_offset: u64,
    pub ack_offset: u64,
    pub ack_time: Instant,
    pub last_interaction: Instant,
    /// Stream bytes never sent to this follower because it originated them
    /// (RREPLAY loop suppression); keeps its ACK arithmetic exact.
    pub skipped_bytes: u64,
    /// Diskless syncs only: the follower counts as writable once its first
    /// ACK arrives.
    pub put_online_on_ack: bool,
    pub listening_port: Option<u16>,
    pub announced_ip: Option<String>,
    /// Control bytes (headers, heartbeats, error lines): flushed in any state.
    pub immediate: VecDeque<Bytes>,
    /// Replication stream bytes: held back until the follower is Online.
    pub stream: VecDeque<Bytes>,
    /// Snapshot payload parked here by the save task; picked up in SendBulk.
    pub pending_bulk: Option<BulkHandoff>,
    pub notify: Arc<Notify>,
    /// Set by the cron or an admin action; the session observes it and exits.
    pub closing: bool,
}

impl FollowerRecord {
    pub fn new(session_id: u64, addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            addr,
            state: FollowerSyncState::WaitBgsaveStart,
            capa: ReplicaCapa::empty(),
            uuid: Uuid::nil(),
            pre_psync: false,
            psync_initial_offset: 0,
            ack_offset: 0,
            ack_time: now,
            last_interaction: now,
            skipped_bytes: 0,
            put_online_on_ack: false,
            listening_port: None,
            announced_ip: None,
            immediate: VecDeque::new(),
            stream: VecDeque::new(),
            pending_bulk: None,
            notify: Arc::new(Notify::new()),
            closing: false,
        }
    }

    pub fn queue_immediate(&mut self, bytes: Bytes) {
        self.immediate.push_back(bytes);
        self.notify.notify_one();
    }

    pub fn queue_stream(&mut self, bytes: Bytes) {
        self.stream.push_back(bytes);
        self.notify.notify_one();
    }

    /// The follower's acknowledged position in our stream, adjusted for the
    /// bytes it never received because it originated them.
    pub fn effective_ack(&self) -> u64 {
        self.ack_offset + self.skipped_bytes
    }
}

/// Target of an in-flight background save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTarget {
    Disk,
    Socket,
}

/// Bookkeeping for the one background save that may run at a time.
#[derive(Debug)]
pub struct SaveInProgress {
    pub target: SaveTarget,
    pub start_offset: u64,
}

/// Everything under the data-plane lock.
#[derive(Debug)]
pub struct ReplicationCore {
    pub identity: ReplicationIdentity,
    /// Total bytes ever produced on the current primary ID. Strictly
    /// monotonic; advanced only by `append_stream_bytes`.
    pub master_repl_offset: u64,
    /// Created lazily on first follower attach; reclaimed by the cron.
    pub backlog: Option<ReplicationBacklog>,
    /// DB index the outgoing stream last selected. `None` forces the next
    /// fan-out to emit SELECT.
    pub replica_seldb: Option<usize>,
    pub followers: HashMap<u64, FollowerRecord>,
    pub save: Option<SaveInProgress>,
    /// When the follower table last became empty; drives backlog reclamation.
    pub no_followers_since: Option<Instant>,
    /// Followers with lag within `min_replicas_max_lag`, refreshed by the
    /// cron and after ACK processing.
    pub good_follower_count: usize,
    offset_tx: watch::Sender<u64>,
}

impl ReplicationCore {
    fn new(offset_tx: watch::Sender<u64>) -> Self {
        Self {
            identity: ReplicationIdentity::new(),
            master_repl_offset: 0,
            backlog: None,
            replica_seldb: Some(0),
            followers: HashMap::new(),
            save: None,
            no_followers_since: Some(Instant::now()),
            good_follower_count: 0,
            offset_tx,
        }
    }

    /// Appends bytes to the stream: advances the global offset, feeds the
    /// backlog if one exists, and publishes the new offset.
    pub fn append_stream_bytes(&mut self, bytes: &[u8]) {
        self.master_repl_offset += bytes.len() as u64;
        if let Some(backlog) = self.backlog.as_mut() {
            backlog.append(bytes, self.master_repl_offset);
        }
        let offset = self.master_repl_offset;
        self.offset_tx.send_if_modified(|current| {
            if *current < offset {
                *current = offset;
                true
            } else {
                false
            }
        });
    }

    /// Creates the backlog for a brand-new replication history: fresh primary
    /// ID, cleared secondary. Used when the first follower ever attaches.
    pub fn create_backlog_fresh_history(&mut self, capacity: usize) {
        self.identity.rotate_primary();
        self.identity.clear_secondary();
        self.backlog = Some(ReplicationBacklog::new(capacity, self.master_repl_offset));
    }

    /// Creates the backlog without touching the identity. Used on the
    /// follower side after a sync, where the history continues the leader's.
    pub fn ensure_backlog(&mut self, capacity: usize) {
        if self.backlog.is_none() {
            self.backlog = Some(ReplicationBacklog::new(capacity, self.master_repl_offset));
        }
    }

    /// Releases the backlog. Only legal when no follower relies on it.
    pub fn free_backlog(&mut self) {
        self.backlog = None;
    }

    /// Recomputes the good-follower count from current ACK times.
    pub fn refresh_good_follower_count(&mut self, max_lag_secs: u64) {
        self.good_follower_count = self
            .followers
            .values()
            .filter(|f| {
                f.state == FollowerSyncState::Online
                    && f.ack_time.elapsed().as_secs() <= max_lag_secs
            })
            .count();
    }

    /// Number of followers a given offset has been acknowledged by.
    pub fn count_acks(&self, offset: u64) -> usize {
        self.followers
            .values()
            .filter(|f| f.state == FollowerSyncState::Online && f.effective_ack() >= offset)
            .count()
    }

    /// Marks every follower for disconnection, except those whose identity
    /// matches `except_uuid` (when non-nil).
    pub fn disconnect_followers_except(&mut self, except_uuid: Uuid) {
        for follower in self.followers.values_mut() {
            if same_uuid_no_nil(follower.uuid, except_uuid) {
                continue;
            }
            follower.closing = true;
            follower.notify.notify_one();
        }
    }

    /// Removes a follower record; called by the owning session on exit.
    pub fn remove_follower(&mut self, session_id: u64) {
        self.followers.remove(&session_id);
        if self.followers.is_empty() {
            self.no_followers_since = Some(Instant::now());
        }
    }
}

/// The connection state of an upstream leader link, mirroring each discrete
/// resume point of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    None,
    Connect,
    Connecting,
    ReceivePong,
    SendAuth,
    ReceiveAuth,
    SendUuid,
    ReceiveUuid,
    SendKey,
    KeyAck,
    SendPort,
    ReceivePort,
    SendIp,
    ReceiveIp,
    SendCapa,
    ReceiveCapa,
    SendPsync,
    ReceivePsync,
    Transfer,
    Connected,
}

impl LinkState {
    /// The string `ROLE` and `INFO` expose for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::None => "none",
            LinkState::Connect => "connect",
            LinkState::Connecting => "connecting",
            LinkState::Transfer => "sync",
            LinkState::Connected => "connected",
            _ => "handshake",
        }
    }
}

/// One upstream leader this instance follows. The worker task owns the
/// socket; this record is the part visible to ROLE/INFO, the cron, and the
/// fan-out (loop suppression by leader UUID).
#[derive(Debug)]
pub struct LeaderLink {
    pub host: String,
    pub port: u16,
    pub state: Mutex<LinkState>,
    /// Replication ID learned from the last `+FULLRESYNC`; empty when
    /// unknown or deliberately blanked after a malformed reply.
    pub master_replid: Mutex<String>,
    /// The leader's instance UUID from `REPLCONF uuid`; nil on leaders that
    /// never answered (the nil sentinel never matches anything).
    pub master_uuid: Mutex<Uuid>,
    /// Offset announced by the last `+FULLRESYNC`; -1 while unknown.
    pub master_initial_offset: AtomicI64,
    /// Bytes of leader stream fully processed.
    pub reploff: AtomicU64,
    /// Highest MVCC timestamp applied from this leader.
    pub mvcc_last_sync: AtomicU64,
    pub cached: Mutex<Option<CachedPrimary>>,
    /// Keys queued for DEL propagation after an active-replica full resync:
    /// (db index, key).
    pub stale_keys: Mutex<Vec<(usize, Bytes)>>,
}

impl LeaderLink {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            state: Mutex::new(LinkState::Connect),
            master_replid: Mutex::new(String::new()),
            master_uuid: Mutex::new(Uuid::nil()),
            master_initial_offset: AtomicI64::new(-1),
            reploff: AtomicU64::new(0),
            mvcc_last_sync: AtomicU64::new(0),
            cached: Mutex::new(None),
            stale_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn link_state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }

    pub fn reploff(&self) -> u64 {
        self.reploff.load(Ordering::SeqCst)
    }
}

/// The central struct holding all replication-related state.
#[derive(Debug)]
pub struct ReplicationState {
    /// Replication settings frozen at startup (the leader *list* is dynamic,
    /// these toggles are not).
    pub settings: ReplicationSettings,
    pub core: Mutex<ReplicationCore>,
    pub leaders: Mutex<Vec<Arc<LeaderLink>>>,
    /// Observers of the global offset (INFO, tests, WAIT bookkeeping).
    pub offset_rx: watch::Receiver<u64>,
    /// Rung every time an ACK advances; WAIT blocks on it.
    pub ack_changed: Arc<Notify>,
    /// Signals follower workers that the leader set changed.
    pub reconfigure_tx: broadcast::Sender<()>,
}

impl ReplicationState {
    pub fn new(settings: ReplicationSettings) -> Self {
        let (offset_tx, offset_rx) = watch::channel(0u64);
        let (reconfigure_tx, _) = broadcast::channel(4);
        let leaders = settings
            .leaders
            .iter()
            .map(|l| Arc::new(LeaderLink::new(l.host.clone(), l.port)))
            .collect();
        Self {
            settings,
            core: Mutex::new(ReplicationCore::new(offset_tx)),
            leaders: Mutex::new(leaders),
            offset_rx,
            ack_changed: Arc::new(Notify::new()),
            reconfigure_tx,
        }
    }

    pub fn master_repl_offset(&self) -> u64 {
        self.core.lock().master_repl_offset
    }

    pub fn has_leaders(&self) -> bool {
        !self.leaders.lock().is_empty()
    }

    /// True when this instance must reject writes from normal clients: it
    /// follows at least one leader and is not an active replica.
    pub fn is_read_only_follower(&self) -> bool {
        !self.settings.active_replica && self.has_leaders()
    }

    /// True when any configured leader link is not fully connected.
    pub fn any_disconnected_leader(&self) -> bool {
        self.leaders
            .lock()
            .iter()
            .any(|l| l.link_state() != LinkState::Connected)
    }

    /// The UUIDs of all configured upstream leaders, for §4.7 loop
    /// suppression when relaying the leader stream downstream.
    pub fn leader_uuids(&self) -> Vec<Uuid> {
        self.leaders
            .lock()
            .iter()
            .map(|l| *l.master_uuid.lock())
            .collect()
    }

    /// Byte-exact relay of the upstream leader stream to the backlog and to
    /// every downstream follower, so sub-followers observe the identical
    /// stream (same replication ID, same offsets). Skips any downstream
    /// whose identity matches a configured upstream leader.
    pub fn feed_from_leader_stream(&self, bytes: &[u8]) {
        let leader_uuids = self.leader_uuids();
        let mut core = self.core.lock();
        if core.backlog.is_none() && core.followers.is_empty() {
            return;
        }
        core.append_stream_bytes(bytes);
        let chunk = Bytes::copy_from_slice(bytes);
        for follower in core.followers.values_mut() {
            if follower.state == FollowerSyncState::WaitBgsaveStart || follower.closing {
                continue;
            }
            if leader_uuids
                .iter()
                .any(|u| same_uuid_no_nil(follower.uuid, *u))
            {
                continue;
            }
            follower.queue_stream(chunk.clone());
        }
    }
}

/// UUID equality with the nil sentinel excluded: an all-zero UUID means
/// "identity unknown" and never equals anything, including itself.
pub fn same_uuid_no_nil(a: Uuid, b: Uuid) -> bool {
    !a.is_nil() && a == b
}
