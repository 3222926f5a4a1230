// src/core/replication/replica.rs

//! The follower side of replication: one worker per configured upstream
//! leader.
//!
//! Each worker drives the handshake state machine (connect, PING, AUTH,
//! identity and capability exchange, PSYNC), receives the bulk snapshot when
//! a full resynchronization is ordered, and then applies the live command
//! stream. It reconnects with exponential backoff and can be reconfigured at
//! runtime when REPLICAOF changes the leader set.
//!
//! No handshake step retries internally: any failure cancels the whole
//! attempt (socket and transfer file dropped, state back to Connect) and the
//! next cycle starts clean.

use crate::core::commands::command_trait::{CommandFlags, ExecutionContext};
use crate::core::persistence::restart_aof_after_sync;
use crate::core::persistence::snapshot::{SnapshotLoadOptions, load_from_file};
use crate::core::protocol::RespFrame;
use crate::core::protocol::resp_frame::parse_frame;
use crate::core::replication::cached::CachedPrimary;
use crate::core::replication::propagate::propagate_write;
use crate::core::replication::replid::REPL_ID_LEN;
use crate::core::state::{LeaderLink, LinkState, ServerState, same_uuid_no_nil};
use crate::core::{Command, KunziteError};
use bytes::{Bytes, BytesMut};
use rand::Rng;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Snapshot reception is chunked so one transfer cannot starve the runtime.
const TRANSFER_READ_CHUNK: usize = 4096;
/// Transfer bytes are fsynced in batches to avoid one giant flush at the end.
const TRANSFER_FSYNC_EVERY: u64 = 8 * 1024 * 1024;

/// Outcome of the PSYNC exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PsyncOutcome {
    /// Leader ordered a full transfer.
    FullResync,
    /// Leader resumes our stream; no transfer needed.
    Continue,
    /// Transient leader condition (loading, no master link); retry later.
    TryLater,
    /// Leader does not speak PSYNC; fall back to legacy SYNC.
    NotSupported,
}

/// Buffered access to the leader socket. Handshake replies are read line by
/// line; the transfer and the live stream consume raw bytes from the same
/// buffer, so nothing the leader pipelines is ever lost between phases.
struct LeaderConnection<S> {
    stream: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LeaderConnection<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    async fn send_command(&mut self, args: &[&[u8]]) -> Result<(), KunziteError> {
        let argv: Vec<Bytes> = args.iter().map(|a| Bytes::copy_from_slice(a)).collect();
        let encoded = RespFrame::command(&argv).encode_to_vec()?;
        self.stream.write_all(&encoded).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), KunziteError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads more bytes into the buffer; zero bytes means the leader closed
    /// the connection.
    async fn fill(&mut self) -> Result<(), KunziteError> {
        let n = self.stream.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(KunziteError::ReplicationError(
                "connection with leader lost".into(),
            ));
        }
        Ok(())
    }

    /// Reads one CRLF-terminated reply line, skipping the bare `\n`
    /// keepalives a leader emits while busy. Applies `timeout` to each
    /// socket read.
    async fn read_reply_line(&mut self, timeout: Duration) -> Result<String, KunziteError> {
        loop {
            while self.buf.first() == Some(&b'\n') {
                let _ = self.buf.split_to(1);
            }
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos);
                let _ = self.buf.split_to(2);
                return Ok(String::from_utf8_lossy(&line).to_string());
            }
            tokio::time::timeout(timeout, self.fill())
                .await
                .map_err(|_| {
                    KunziteError::ReplicationError("timeout reading reply from leader".into())
                })??;
        }
    }
}

/// The worker task that follows one upstream leader.
pub struct ReplicaWorker {
    state: Arc<ServerState>,
    link: Arc<LeaderLink>,
    /// DB index the leader stream has selected on this link.
    current_db: usize,
    /// False after falling back to legacy SYNC: such leaders do not
    /// understand replication offsets, so no ACKs are sent.
    acks_enabled: bool,
}

impl ReplicaWorker {
    pub fn new(state: Arc<ServerState>, link: Arc<LeaderLink>) -> Self {
        Self {
            state,
            link,
            current_db: 0,
            acks_enabled: true,
        }
    }

    /// The main run loop: connect cycles with exponential backoff, exiting
    /// when the link is dropped from the leader set or the server shuts down.
    pub async fn run(
        mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut reconfigure_rx: broadcast::Receiver<()>,
    ) {
        info!(
            "Replication worker for leader {}:{} started.",
            self.link.host, self.link.port
        );
        let mut current_delay = INITIAL_RECONNECT_DELAY;

        loop {
            let still_configured = self
                .state
                .replication
                .leaders
                .lock()
                .iter()
                .any(|l| Arc::ptr_eq(l, &self.link));
            if !still_configured {
                info!(
                    "Leader {}:{} removed from configuration. Worker exiting.",
                    self.link.host, self.link.port
                );
                self.link.set_state(LinkState::None);
                return;
            }

            tokio::select! {
                _ = reconfigure_rx.recv() => {
                    current_delay = INITIAL_RECONNECT_DELAY;
                    continue;
                }
                _ = shutdown_rx.recv() => {
                    info!("Replication worker shutting down.");
                    return;
                }
                result = self.handle_connection_cycle() => {
                    match result {
                        Ok(()) => {
                            info!(
                                "Connection to leader {}:{} closed. Reconnecting...",
                                self.link.host, self.link.port
                            );
                            current_delay = INITIAL_RECONNECT_DELAY;
                        }
                        Err(e) => {
                            warn!(
                                "Replication cycle with {}:{} failed: {e}. Reconnecting...",
                                self.link.host, self.link.port
                            );
                        }
                    }

                    // Jitter avoids a thundering herd against a restarting leader.
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                    let wait_time = current_delay + jitter;
                    tokio::select! {
                        _ = tokio::time::sleep(wait_time) => {}
                        _ = shutdown_rx.recv() => { return; }
                        _ = reconfigure_rx.recv() => {}
                    }
                    current_delay = (current_delay * 2).min(MAX_RECONNECT_DELAY);
                }
            }
        }
    }

    /// One full connection lifecycle: connect, handshake, sync, stream.
    async fn handle_connection_cycle(&mut self) -> Result<(), KunziteError> {
        let timeout = Duration::from_secs(self.state.replication.settings.repl_timeout_secs);
        self.current_db = 0;
        self.acks_enabled = true;

        let addr = format!("{}:{}", self.link.host, self.link.port);
        info!("Connecting to LEADER {}", addr);
        self.link.set_state(LinkState::Connecting);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                self.cancel_handshake();
                KunziteError::ReplicationError("timeout connecting to the leader".into())
            })?
            .map_err(|e| {
                self.cancel_handshake();
                KunziteError::ReplicationError(format!("failed to connect: {e}"))
            })?;
        let mut conn = LeaderConnection::new(stream);

        let outcome = match self.perform_handshake(&mut conn, timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.cancel_handshake();
                return Err(e);
            }
        };

        match outcome {
            PsyncOutcome::Continue => {
                info!("LEADER <-> REPLICA sync: leader accepted a partial resynchronization.");
            }
            PsyncOutcome::TryLater => {
                self.cancel_handshake();
                return Err(KunziteError::ReplicationError(
                    "leader is currently unable to PSYNC; retrying later".into(),
                ));
            }
            PsyncOutcome::FullResync | PsyncOutcome::NotSupported => {
                self.prepare_for_new_history();
                if outcome == PsyncOutcome::NotSupported {
                    info!("Retrying with SYNC...");
                    self.acks_enabled = false;
                    conn.write_raw(b"SYNC\r\n").await?;
                }
                if let Err(e) = self.full_sync(&mut conn, timeout).await {
                    self.cancel_handshake();
                    return Err(e);
                }
            }
        }

        self.process_leader_stream(&mut conn, timeout).await
    }

    /// Resets the link to Connect after a failed attempt. The socket and any
    /// transfer temp file are dropped by scope; no partial state survives.
    fn cancel_handshake(&self) {
        self.link.set_state(LinkState::Connect);
    }

    // --- Handshake ---

    async fn perform_handshake(
        &mut self,
        conn: &mut LeaderConnection<impl AsyncRead + AsyncWrite + Unpin>,
        timeout: Duration,
    ) -> Result<PsyncOutcome, KunziteError> {
        let settings = self.state.replication.settings.clone();
        let my_port = { self.state.config.lock().await.port };

        // Step 1: PING. The leader may legitimately answer with an auth
        // error at this stage; anything else unexpected aborts.
        conn.send_command(&[b"PING"]).await?;
        self.link.set_state(LinkState::ReceivePong);
        let reply = conn.read_reply_line(timeout).await?;
        if !reply.starts_with('+')
            && !reply.starts_with("-NOAUTH")
            && !reply.starts_with("-ERR operation not permitted")
        {
            return Err(KunziteError::ReplicationError(format!(
                "unexpected reply to PING: {reply}"
            )));
        }

        // Step 2: AUTH, when configured.
        self.link.set_state(LinkState::SendAuth);
        if let Some(secret) = &settings.auth_secret {
            match &settings.auth_user {
                Some(user) => {
                    conn.send_command(&[b"AUTH", user.as_bytes(), secret.as_bytes()])
                        .await?
                }
                None => conn.send_command(&[b"AUTH", secret.as_bytes()]).await?,
            }
            self.link.set_state(LinkState::ReceiveAuth);
            let reply = conn.read_reply_line(timeout).await?;
            if !reply.starts_with('+') {
                return Err(KunziteError::ReplicationError(format!(
                    "authentication with leader failed: {reply}"
                )));
            }
        }

        // Step 3: exchange instance UUIDs. An old leader may not understand
        // this; its identity then stays at the nil sentinel.
        self.link.set_state(LinkState::SendUuid);
        let own_uuid = self.state.instance_uuid.to_string();
        conn.send_command(&[b"REPLCONF", b"uuid", own_uuid.as_bytes()])
            .await?;
        self.link.set_state(LinkState::ReceiveUuid);
        let reply = conn.read_reply_line(timeout).await?;
        *self.link.master_uuid.lock() = reply
            .strip_prefix('+')
            .and_then(|rest| Uuid::parse_str(rest.trim()).ok())
            .unwrap_or_else(|| {
                warn!("non-fatal: leader doesn't understand REPLCONF uuid");
                Uuid::nil()
            });

        // Step 4: license token, when configured. A duplicate key is a hard
        // error on the leader side.
        self.link.set_state(LinkState::SendKey);
        if let Some(key) = &settings.license_key {
            conn.send_command(&[b"REPLCONF", b"license", key.as_bytes()])
                .await?;
            self.link.set_state(LinkState::KeyAck);
            let reply = conn.read_reply_line(timeout).await?;
            if reply.starts_with('-') {
                return Err(KunziteError::ReplicationError(format!(
                    "leader rejected the license exchange: {reply}"
                )));
            }
        }

        // Step 5: advertise our listening port.
        self.link.set_state(LinkState::SendPort);
        let port_text = my_port.to_string();
        conn.send_command(&[b"REPLCONF", b"listening-port", port_text.as_bytes()])
            .await?;
        self.link.set_state(LinkState::ReceivePort);
        let reply = conn.read_reply_line(timeout).await?;
        if reply.starts_with('-') {
            warn!("(non critical) leader does not understand REPLCONF listening-port");
        }

        // Step 6: advertise our IP, when configured.
        if let Some(ip) = &settings.announce_ip {
            self.link.set_state(LinkState::SendIp);
            conn.send_command(&[b"REPLCONF", b"ip-address", ip.as_bytes()])
                .await?;
            self.link.set_state(LinkState::ReceiveIp);
            let reply = conn.read_reply_line(timeout).await?;
            if reply.starts_with('-') {
                warn!("(non critical) leader does not understand REPLCONF ip-address");
            }
        }

        // Step 7: declare capabilities.
        self.link.set_state(LinkState::SendCapa);
        if settings.active_replica {
            conn.send_command(&[
                b"REPLCONF",
                b"capa",
                b"eof",
                b"capa",
                b"psync2",
                b"capa",
                b"activeExpire",
            ])
            .await?;
        } else {
            conn.send_command(&[b"REPLCONF", b"capa", b"eof", b"capa", b"psync2"])
                .await?;
        }
        self.link.set_state(LinkState::ReceiveCapa);
        let reply = conn.read_reply_line(timeout).await?;
        if reply.starts_with('-') {
            warn!("(non critical) leader does not understand REPLCONF capa");
        }

        // Step 8: PSYNC.
        self.try_psync(conn, timeout, settings.active_replica).await
    }

    /// Sends PSYNC and classifies the reply.
    async fn try_psync(
        &mut self,
        conn: &mut LeaderConnection<impl AsyncRead + AsyncWrite + Unpin>,
        timeout: Duration,
        active: bool,
    ) -> Result<PsyncOutcome, KunziteError> {
        self.link.master_initial_offset.store(-1, Ordering::SeqCst);
        self.link.set_state(LinkState::SendPsync);

        // An active replica merges datasets rather than mirroring one, so it
        // always requests a full transfer; the cached leader only drives the
        // non-active resume path.
        let cached_snapshot = self.link.cached.lock().clone();
        let (psync_replid, psync_offset) = match &cached_snapshot {
            Some(cached) if !active => {
                info!(
                    "Trying a partial resynchronization (request {}:{}).",
                    cached.replid,
                    cached.reploff + 1
                );
                (cached.replid.clone(), (cached.reploff + 1).to_string())
            }
            _ => {
                info!("Partial resynchronization not possible (no cached leader).");
                ("?".to_string(), "-1".to_string())
            }
        };
        conn.send_command(&[
            b"PSYNC",
            psync_replid.as_bytes(),
            psync_offset.as_bytes(),
        ])
        .await?;

        self.link.set_state(LinkState::ReceivePsync);
        let reply = conn.read_reply_line(timeout).await?;

        if let Some(rest) = reply.strip_prefix("+FULLRESYNC") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() == 2 && parts[0].len() == REPL_ID_LEN {
                *self.link.master_replid.lock() = parts[0].to_string();
                let offset: i64 = parts[1].parse().map_err(|_| {
                    KunziteError::ReplicationError("invalid offset in FULLRESYNC".into())
                })?;
                self.link
                    .master_initial_offset
                    .store(offset, Ordering::SeqCst);
                info!("Full resync from leader: {}:{offset}", parts[0]);
            } else {
                // Protocol mismatch: blank the replid so the next PSYNC is
                // forced to a full resync rather than resuming a history we
                // cannot trust.
                warn!("Leader replied with wrong +FULLRESYNC syntax.");
                self.link.master_replid.lock().clear();
            }
            *self.link.cached.lock() = None;
            return Ok(PsyncOutcome::FullResync);
        }

        if let Some(rest) = reply.strip_prefix("+CONTINUE") {
            self.handle_continue(rest.trim())?;
            return Ok(PsyncOutcome::Continue);
        }

        if reply.starts_with("-NOMASTERLINK") || reply.starts_with("-LOADING") {
            info!("Leader is currently unable to PSYNC but should be in the future: {reply}");
            return Ok(PsyncOutcome::TryLater);
        }

        if reply.starts_with("-ERR") {
            info!("Leader does not support PSYNC or is in error state (reply: {reply})");
        } else {
            warn!("Unexpected reply to PSYNC from leader: {reply}");
        }
        *self.link.cached.lock() = None;
        Ok(PsyncOutcome::NotSupported)
    }

    /// Partial resync accepted: adopt a changed replication ID if the leader
    /// advertised one, then resurrect the cached leader as the live link.
    fn handle_continue(&mut self, advertised: &str) -> Result<(), KunziteError> {
        let mut cached_guard = self.link.cached.lock();
        let Some(mut cached) = cached_guard.take() else {
            return Err(KunziteError::ReplicationError(
                "leader sent +CONTINUE but no cached leader exists".into(),
            ));
        };
        drop(cached_guard);

        if advertised.len() == REPL_ID_LEN && advertised != cached.replid {
            info!("Leader replication ID changed to {advertised}");
            let active = self.state.replication.settings.active_replica;
            let mut core = self.state.replication.core.lock();
            core.identity.secondary_id = cached.replid.clone();
            core.identity.secondary_valid_until_offset = core.master_repl_offset as i64 + 1;
            core.identity.primary_id = advertised.to_string();
            if !active {
                // Sub-followers must learn about the lineage change; they
                // will partially resync right back.
                core.disconnect_followers_except(Uuid::nil());
            }
            cached.replid = advertised.to_string();
        }

        info!("Successful partial resynchronization with leader.");
        *self.link.master_replid.lock() = cached.replid.clone();
        self.link.reploff.store(cached.reploff, Ordering::SeqCst);
        self.current_db = cached.selected_db;

        let backlog_size = self.state.replication.settings.backlog_size;
        self.state.replication.core.lock().ensure_backlog(backlog_size);
        self.link.set_state(LinkState::Connected);
        Ok(())
    }

    /// A full transfer is coming: our sub-followers cannot be incrementally
    /// fed across it, so the topology is adjusted up front.
    fn prepare_for_new_history(&self) {
        let active = self.state.replication.settings.active_replica;
        let leader_uuid = *self.link.master_uuid.lock();
        let mut core = self.state.replication.core.lock();
        if !active {
            core.disconnect_followers_except(leader_uuid);
            core.free_backlog();
        } else if !core.followers.is_empty() {
            // Active replicas keep their followers consistent through
            // RREPLAY, but the merged dataset starts a new lineage.
            core.identity.rotate_primary();
            core.identity.clear_secondary();
        } else {
            core.free_backlog();
        }
    }

    // --- Bulk transfer ---

    async fn full_sync(
        &mut self,
        conn: &mut LeaderConnection<impl AsyncRead + AsyncWrite + Unpin>,
        timeout: Duration,
    ) -> Result<(), KunziteError> {
        self.link.set_state(LinkState::Transfer);
        let temp_path = self.receive_bulk_payload(conn, timeout).await?;
        // One more keepalive before the load starts; the leader sees no
        // traffic from us while the snapshot is applied.
        let _ = conn.stream.write_all(b"\n").await;
        self.load_received_snapshot(&temp_path).await
    }

    /// Receives the bulk payload into a temp file, fsyncing every 8 MiB and
    /// sending a `\n` keepalive to the leader at most once per second so it
    /// does not time us out while we are busy.
    async fn receive_bulk_payload(
        &mut self,
        conn: &mut LeaderConnection<impl AsyncRead + AsyncWrite + Unpin>,
        timeout: Duration,
    ) -> Result<tempfile::TempPath, KunziteError> {
        let header = conn.read_reply_line(timeout).await?;
        let Some(rest) = header.strip_prefix('$') else {
            return Err(KunziteError::ReplicationError(format!(
                "bad bulk length prefix from leader: {header}"
            )));
        };

        // Two envelopes: `$<size>` (disk saves) and `$EOF:<40-byte mark>`
        // (diskless saves, where the size is unknown up front).
        let mut eof_mark: Option<Vec<u8>> = None;
        let mut expected: Option<u64> = None;
        if let Some(mark) = rest.strip_prefix("EOF:") {
            if mark.len() != REPL_ID_LEN {
                return Err(KunziteError::ReplicationError(
                    "malformed EOF mark in bulk header".into(),
                ));
            }
            eof_mark = Some(mark.as_bytes().to_vec());
        } else {
            expected = Some(rest.parse::<u64>().map_err(|_| {
                KunziteError::ReplicationError(format!("invalid bulk length: {rest}"))
            })?);
        }
        info!(
            "Full resync from leader: receiving {} payload.",
            match expected {
                Some(size) => format!("{size} bytes"),
                None => "an EOF-delimited".to_string(),
            }
        );

        let snapshot_dir = {
            let config = self.state.config.lock().await;
            PathBuf::from(&config.persistence.snapshot_path)
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."))
        };
        tokio::fs::create_dir_all(&snapshot_dir).await?;
        let temp = tempfile::NamedTempFile::new_in(&snapshot_dir)
            .map_err(KunziteError::from)?;
        let (file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut written: u64 = 0;
        let mut last_fsync: u64 = 0;
        let mut last_newline = Instant::now();
        // Rolling window of the last mark-length bytes, for EOF detection.
        let mut tail: Vec<u8> = Vec::new();
        loop {
            if conn.buf.is_empty() {
                tokio::time::timeout(timeout, conn.fill())
                    .await
                    .map_err(|_| {
                        KunziteError::ReplicationError(
                            "timeout receiving bulk data from leader".into(),
                        )
                    })??;
            }

            let take = match expected {
                Some(size) => ((size - written) as usize).min(TRANSFER_READ_CHUNK),
                None => TRANSFER_READ_CHUNK,
            }
            .min(conn.buf.len());
            let chunk = conn.buf.split_to(take);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if written >= last_fsync + TRANSFER_FSYNC_EVERY {
                file.sync_data().await?;
                last_fsync = written;
            }
            if last_newline.elapsed() >= Duration::from_secs(1) {
                let _ = conn.stream.write_all(b"\n").await;
                last_newline = Instant::now();
            }

            if let Some(mark) = &eof_mark {
                tail.extend_from_slice(&chunk);
                if tail.len() > mark.len() {
                    tail.drain(..tail.len() - mark.len());
                }
                if tail.as_slice() == mark.as_slice() && written >= mark.len() as u64 {
                    // Strip the trailing mark from the payload.
                    file.sync_all().await?;
                    file.set_len(written - mark.len() as u64).await?;
                    break;
                }
            } else if let Some(size) = expected {
                if written == size {
                    break;
                }
            }
        }
        file.sync_all().await?;
        drop(file);
        Ok(temp_path)
    }

    /// Loads the received snapshot and finalizes the link: identity update,
    /// backlog creation, stale-key collection in active mode, AOF restore.
    async fn load_received_snapshot(
        &mut self,
        temp_path: &tempfile::TempPath,
    ) -> Result<(), KunziteError> {
        let active = self.state.replication.settings.active_replica;
        let aof_was_enabled = self.state.persistence.stop_aof_for_sync();
        self.state.is_loading.store(true, Ordering::SeqCst);

        // For the merge path we need the pre-load key population to find the
        // keys the leader no longer has.
        let pre_keys: Vec<HashSet<Bytes>> = if active {
            self.state.dbs.iter().map(|db| db.key_set()).collect()
        } else {
            info!("LEADER <-> REPLICA sync: Flushing old data");
            for db in &self.state.dbs {
                db.clear();
            }
            Vec::new()
        };

        info!("LEADER <-> REPLICA sync: Loading snapshot into memory");
        let mvcc_floor = self.link.mvcc_last_sync.load(Ordering::SeqCst);
        let opts = SnapshotLoadOptions {
            update_only: active,
            mvcc_min_threshold: mvcc_floor,
            collect_keys: active,
        };
        let report = match load_from_file(temp_path, &self.state.dbs, &opts).await {
            Ok(report) => report,
            Err(e) => {
                self.state.is_loading.store(false, Ordering::SeqCst);
                error!("Failed trying to load the snapshot received from the leader: {e}");
                if aof_was_enabled {
                    restart_aof_after_sync(&self.state).await;
                }
                return Err(e);
            }
        };
        self.state.is_loading.store(false, Ordering::SeqCst);

        if active {
            // Keys we held that the snapshot does not contain were deleted
            // upstream while we were away. Purge the ones our own writes did
            // not outrun, and queue them for DEL propagation downstream.
            let mut stale = self.link.stale_keys.lock();
            for (db_index, local_keys) in pre_keys.iter().enumerate() {
                let snapshot_keys = &report.keys_per_db[db_index];
                let db = &self.state.dbs[db_index];
                for key in local_keys.difference(snapshot_keys) {
                    if db.del_if_not_newer(key, mvcc_floor) {
                        stale.push((db_index, key.clone()));
                    }
                }
            }
        }

        // Prefer the identity the FULLRESYNC announced; a legacy SYNC leader
        // never announced one, so fall back to the snapshot metadata.
        let announced_offset = self.link.master_initial_offset.load(Ordering::SeqCst);
        let (replid, initial_offset) = if announced_offset >= 0 {
            (self.link.master_replid.lock().clone(), announced_offset as u64)
        } else {
            (report.meta.replid.clone(), report.meta.master_repl_offset)
        };

        {
            let backlog_size = self.state.replication.settings.backlog_size;
            let mut core = self.state.replication.core.lock();
            if active {
                core.identity.merge_primary(&replid);
            } else {
                // We now share the leader's history verbatim: same ID, same
                // offset, so our own sub-followers see an identical stream.
                core.identity.replace_primary(&replid);
                core.master_repl_offset = initial_offset;
            }
            core.identity.clear_secondary();
            core.ensure_backlog(backlog_size);
        }

        *self.link.master_replid.lock() = replid;
        self.link.reploff.store(initial_offset, Ordering::SeqCst);
        self.current_db = report.meta.selected_db;
        self.link.set_state(LinkState::Connected);
        info!("LEADER <-> REPLICA sync: Finished with success");

        if aof_was_enabled {
            restart_aof_after_sync(&self.state).await;
        }
        Ok(())
    }

    // --- Live stream ---

    /// Applies the live command stream until the connection drops, sending
    /// `REPLCONF ACK` once per second and enforcing the link timeout.
    async fn process_leader_stream(
        &mut self,
        conn: &mut LeaderConnection<impl AsyncRead + AsyncWrite + Unpin>,
        timeout: Duration,
    ) -> Result<(), KunziteError> {
        info!("Now in sync with leader; processing the command stream.");
        let mut ack_interval = tokio::time::interval(Duration::from_secs(1));
        ack_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_io = Instant::now();

        let result = loop {
            // Drain whatever is already buffered before waiting for more.
            if let Err(e) = self.drain_stream_buffer(conn).await {
                break Err(e);
            }

            tokio::select! {
                _ = ack_interval.tick() => {
                    if last_io.elapsed() > timeout {
                        break Err(KunziteError::ReplicationError(
                            "LEADER timeout: no data nor PING received".into(),
                        ));
                    }
                    if self.acks_enabled {
                        if let Err(e) = self.send_ack(conn).await {
                            break Err(e);
                        }
                    }
                }
                res = conn.fill() => {
                    match res {
                        Ok(()) => last_io = Instant::now(),
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        // The link was fully established; keep its stream position so the
        // next connection can attempt PSYNC +CONTINUE.
        if self.link.link_state() == LinkState::Connected {
            self.cache_leader();
        }
        self.link.set_state(LinkState::Connect);
        result
    }

    async fn send_ack(
        &mut self,
        conn: &mut LeaderConnection<impl AsyncRead + AsyncWrite + Unpin>,
    ) -> Result<(), KunziteError> {
        let offset = self.link.reploff().to_string();
        conn.send_command(&[b"REPLCONF", b"ACK", offset.as_bytes()])
            .await
    }

    /// Parses and applies every complete frame currently buffered. Raw bytes
    /// of applied frames are relayed verbatim to sub-followers when this is
    /// a non-active replica (the passthrough of chained replication).
    async fn drain_stream_buffer(
        &mut self,
        conn: &mut LeaderConnection<impl AsyncRead + AsyncWrite + Unpin>,
    ) -> Result<(), KunziteError> {
        let passthrough = !self.state.replication.settings.active_replica;
        loop {
            while conn.buf.first() == Some(&b'\n') {
                let _ = conn.buf.split_to(1);
            }
            let (frame, frame_len) = match parse_frame(&conn.buf) {
                Ok(parsed) => parsed,
                Err(KunziteError::IncompleteData) => return Ok(()),
                Err(e) => return Err(e),
            };
            let raw = conn.buf.split_to(frame_len).freeze();
            if passthrough {
                self.state.replication.feed_from_leader_stream(&raw);
            }
            let send_ack = self.apply_stream_frame(frame).await?;
            self.link
                .reploff
                .fetch_add(frame_len as u64, Ordering::SeqCst);
            if send_ack && self.acks_enabled {
                self.send_ack(conn).await?;
            }
        }
    }

    /// Applies one frame of the leader stream. Returns true when an
    /// immediate ACK was requested.
    async fn apply_stream_frame(&mut self, frame: RespFrame) -> Result<bool, KunziteError> {
        let RespFrame::Array(parts) = frame else {
            // Stray non-command traffic (e.g. a +OK crossing a role change)
            // does not affect the dataset; count it and move on.
            return Ok(false);
        };
        let mut argv = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                RespFrame::BulkString(b) => argv.push(b),
                _ => return Ok(false),
            }
        }
        let Some(name) = argv.first().cloned() else {
            return Ok(false);
        };

        if name.eq_ignore_ascii_case(b"PING") {
            return Ok(false);
        }
        if name.eq_ignore_ascii_case(b"SELECT") && argv.len() == 2 {
            self.current_db = String::from_utf8_lossy(&argv[1])
                .parse()
                .map_err(|_| KunziteError::ReplicationError("bad SELECT from leader".into()))?;
            return Ok(false);
        }
        if name.eq_ignore_ascii_case(b"REPLCONF")
            && argv.len() >= 2
            && argv[1].eq_ignore_ascii_case(b"GETACK")
        {
            return Ok(true);
        }
        if name.eq_ignore_ascii_case(b"RREPLAY") {
            return self.apply_rreplay(&argv).await;
        }

        // A plain write command from the leader stream.
        let mvcc = self.state.mvcc_clock.next();
        self.execute_replicated(argv.clone(), self.current_db, mvcc, false)
            .await?;
        if self.state.replication.settings.active_replica {
            let origin = *self.link.master_uuid.lock();
            propagate_write(&self.state, self.current_db, &argv, origin, mvcc);
        }
        Ok(false)
    }

    /// Unwraps and applies an RREPLAY envelope:
    /// `RREPLAY <origin-uuid> <cmd-bytes> [<db>] [<mvcc>]`.
    async fn apply_rreplay(&mut self, argv: &[Bytes]) -> Result<bool, KunziteError> {
        if argv.len() < 3 || argv.len() > 5 {
            return Err(KunziteError::ReplicationError(
                "malformed RREPLAY from leader".into(),
            ));
        }
        let origin = Uuid::parse_str(&String::from_utf8_lossy(&argv[1]))
            .map_err(|_| KunziteError::ReplicationError("RREPLAY with invalid UUID".into()))?;

        // Our own command came back around the loop; drop it.
        if same_uuid_no_nil(origin, self.state.instance_uuid) {
            return Ok(false);
        }

        let db_index = if argv.len() >= 4 {
            String::from_utf8_lossy(&argv[3])
                .parse()
                .map_err(|_| KunziteError::ReplicationError("RREPLAY with invalid db".into()))?
        } else {
            self.current_db
        };
        let mvcc = if argv.len() == 5 {
            String::from_utf8_lossy(&argv[4])
                .parse()
                .map_err(|_| KunziteError::ReplicationError("RREPLAY with invalid MVCC".into()))?
        } else {
            0
        };

        let (inner, _) = parse_frame(&argv[2])?;
        let RespFrame::Array(parts) = inner else {
            return Err(KunziteError::ReplicationError(
                "RREPLAY payload is not a command".into(),
            ));
        };
        let mut inner_argv = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                RespFrame::BulkString(b) => inner_argv.push(b),
                _ => {
                    return Err(KunziteError::ReplicationError(
                        "RREPLAY payload is not a command".into(),
                    ));
                }
            }
        }
        let Some(inner_name) = inner_argv.first() else {
            return Err(KunziteError::ReplicationError(
                "RREPLAY with empty payload".into(),
            ));
        };
        if inner_name.eq_ignore_ascii_case(b"RREPLAY") {
            return Err(KunziteError::ReplicationError(
                "nested RREPLAY from leader".into(),
            ));
        }

        let send_ack = inner_name.eq_ignore_ascii_case(b"REPLCONF")
            && inner_argv
                .get(1)
                .is_some_and(|a| a.eq_ignore_ascii_case(b"GETACK"));
        if !send_ack && !inner_name.eq_ignore_ascii_case(b"PING") {
            self.execute_replicated(inner_argv.clone(), db_index, mvcc, true)
                .await?;
        }

        if mvcc > 0 {
            self.link.mvcc_last_sync.fetch_max(mvcc, Ordering::SeqCst);
            self.state.mvcc_clock.witness(mvcc);
        }

        // Re-fan the command to our own followers, preserving the original
        // originator so it dies when it reaches them again.
        propagate_write(&self.state, db_index, &inner_argv, origin, mvcc);
        Ok(send_ack)
    }

    /// Executes a replicated command against the local keyspace. Read-only
    /// commands are skipped; `lww` applies last-write-wins semantics for
    /// commands carrying a peer's MVCC stamp.
    async fn execute_replicated(
        &mut self,
        argv: Vec<Bytes>,
        db_index: usize,
        mvcc: u64,
        lww: bool,
    ) -> Result<(), KunziteError> {
        let frame = RespFrame::command(&argv);
        let command = match Command::try_from(frame) {
            Ok(command) => command,
            Err(e) => {
                debug!("Ignoring unsupported command from leader stream: {e}");
                return Ok(());
            }
        };
        if !command.flags().contains(CommandFlags::WRITE) {
            return Ok(());
        }
        let db = self.state.get_db(db_index).ok_or_else(|| {
            KunziteError::ReplicationError("leader stream selected an invalid DB".into())
        })?;
        let mut ctx = ExecutionContext {
            state: self.state.clone(),
            db,
            db_index,
            session_id: 0,
            mvcc,
            apply_lww: lww,
        };
        if let Err(e) = command.execute(&mut ctx).await {
            error!("Failed to execute replicated command: {e}. Disconnecting from leader.");
            return Err(KunziteError::ReplicationError(format!(
                "replicated command failed: {e}"
            )));
        }
        Ok(())
    }

    /// Preserves the stream position of a dropped connection so the next
    /// cycle can try PSYNC +CONTINUE instead of a full transfer.
    fn cache_leader(&mut self) {
        let replid = self.link.master_replid.lock().clone();
        if replid.len() != REPL_ID_LEN {
            return;
        }
        info!("Caching the disconnected leader state for a future partial resync.");
        *self.link.cached.lock() = Some(CachedPrimary {
            replid,
            reploff: self.link.reploff(),
            selected_db: self.current_db,
        });
    }
}
