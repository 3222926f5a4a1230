// src/core/replication/primary.rs

//! The leader-side session for one follower, from the SYNC/PSYNC request
//! through snapshot transfer to online streaming.
//!
//! The connection handler hands the stream off here once it sees SYNC or
//! PSYNC. The session owns the socket for the rest of the follower's life:
//! it decides partial vs. full resynchronization, waits out the snapshot
//! handoff, streams the bulk payload, and then pumps the live stream while
//! reading `REPLCONF ACK`s coming back.

use crate::core::KunziteError;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use crate::core::replication::snapshot::schedule_full_sync;
use crate::core::state::{
    BulkHandoff, FollowerRecord, FollowerSyncState, ReplicaCapa, ServerState,
};
use bytes::Bytes;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf, split};
use tokio::sync::{Notify, broadcast};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How the follower asked to synchronize.
#[derive(Debug, Clone)]
pub enum SyncKind {
    /// `PSYNC <replid|?> <offset|-1>`.
    Psync { replid: String, offset: String },
    /// Legacy `SYNC`: always a full transfer, no FULLRESYNC header, no ACKs.
    LegacySync,
}

/// Everything the connection handler learned about the follower before the
/// handoff (REPLCONF options arrive on the same connection before PSYNC).
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub kind: SyncKind,
    pub capa: ReplicaCapa,
    pub uuid: Uuid,
    pub listening_port: Option<u16>,
    pub announced_ip: Option<String>,
}

/// Manages the synchronization and streaming lifecycle for a single
/// connected follower. Generic over the stream type to support in-memory
/// transports in tests.
pub struct FollowerSession<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> {
    state: Arc<ServerState>,
    session_id: u64,
    addr: SocketAddr,
    stream: Option<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> FollowerSession<S> {
    pub fn new(state: Arc<ServerState>, session_id: u64, addr: SocketAddr, stream: S) -> Self {
        Self {
            state,
            session_id,
            addr,
            stream: Some(stream),
        }
    }

    /// Entry point: runs the whole session, cleaning up the follower record
    /// on any exit path.
    pub async fn run(mut self, request: SyncRequest, mut shutdown_rx: broadcast::Receiver<()>) {
        let result = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!("Follower session for {} received shutdown signal.", self.addr);
                Ok(())
            }
            res = self.perform_sync_cycle(request) => res,
        };

        if let Err(e) = result {
            warn!("Replication session for {} ended: {}", self.addr, e);
        }

        self.state.clients.remove(&self.session_id);
        let max_lag = self.state.replication.settings.min_replicas_max_lag_secs;
        let mut core = self.state.replication.core.lock();
        core.remove_follower(self.session_id);
        core.refresh_good_follower_count(max_lag);
    }

    async fn perform_sync_cycle(&mut self, request: SyncRequest) -> Result<(), KunziteError> {
        let Some(stream) = self.stream.take() else {
            return Err(KunziteError::Internal("follower stream already taken".into()));
        };
        let (read_half, mut write_half) = split(stream);
        let mut framed_reader = FramedRead::new(read_half, RespFrameCodec);

        if self.state.is_loading() {
            let msg = "-LOADING server is loading the dataset in memory\r\n";
            let _ = write_half.write_all(msg.as_bytes()).await;
            return Err(KunziteError::Loading);
        }

        // A non-active follower cannot serve SYNC while its own leader link
        // is down: it could hand out a stale dataset with no stream behind it.
        if !self.state.replication.settings.active_replica
            && self.state.replication.has_leaders()
            && self.state.replication.any_disconnected_leader()
        {
            let msg = "-NOMASTERLINK Can't SYNC while not connected with my master\r\n";
            let _ = write_half.write_all(msg.as_bytes()).await;
            return Err(KunziteError::NoMasterLink);
        }

        info!(
            "Replica {} asks for synchronization ({:?})",
            self.addr, request.kind
        );

        // Try a partial resynchronization first. On success the follower
        // goes straight online with the backlog slice.
        if let SyncKind::Psync { replid, offset } = &request.kind {
            if let Some((reply, slice, notify)) =
                self.try_partial_resync(&request, replid, offset)
            {
                info!(
                    "Partial resynchronization request from {} accepted. \
                     Sending {} bytes of backlog.",
                    self.addr,
                    slice.len()
                );
                write_half.write_all(&reply).await?;
                if !slice.is_empty() {
                    write_half.write_all(&slice).await?;
                }
                write_half.flush().await?;
                return self
                    .stream_online(&mut framed_reader, &mut write_half, notify)
                    .await;
            }
        }

        // Full resynchronization path.
        let notify = self.register_full_resync(&request);
        schedule_full_sync(&self.state, self.session_id).await;

        let handoff = self
            .await_bulk_handoff(&mut framed_reader, &mut write_half, notify.clone())
            .await?;

        self.send_bulk(&mut write_half, &handoff).await?;

        {
            let max_lag = self.state.replication.settings.min_replicas_max_lag_secs;
            let mut core = self.state.replication.core.lock();
            if let Some(follower) = core.followers.get_mut(&self.session_id) {
                follower.state = FollowerSyncState::Online;
                follower.put_online_on_ack =
                    matches!(handoff, BulkHandoff::SocketPayload { .. });
                follower.ack_time = Instant::now();
            }
            core.refresh_good_follower_count(max_lag);
        }
        info!("Synchronization with replica {} succeeded", self.addr);

        self.stream_online(&mut framed_reader, &mut write_half, notify)
            .await
    }

    /// Checks the PSYNC request against the identity registry and the
    /// backlog window. On acceptance, registers the follower as Online and
    /// returns the `+CONTINUE` reply, the backlog slice, and the record's
    /// notifier.
    fn try_partial_resync(
        &self,
        request: &SyncRequest,
        replid: &str,
        offset_str: &str,
    ) -> Option<(Bytes, Bytes, Arc<Notify>)> {
        let offset: u64 = offset_str.parse().ok()?;
        let max_lag = self.state.replication.settings.min_replicas_max_lag_secs;
        let mut core = self.state.replication.core.lock();

        let id_matches = replid.eq_ignore_ascii_case(&core.identity.primary_id)
            || (replid.eq_ignore_ascii_case(&core.identity.secondary_id)
                && (offset as i64) <= core.identity.secondary_valid_until_offset);
        if !id_matches {
            if !replid.starts_with('?') {
                info!(
                    "Partial resynchronization not accepted: replication ID mismatch \
                     (replica asked for '{}', my IDs are '{}' and '{}')",
                    replid, core.identity.primary_id, core.identity.secondary_id
                );
            } else {
                info!("Full resync requested by replica {}", self.addr);
            }
            return None;
        }

        let slice = core.backlog.as_ref().and_then(|b| b.slice(offset));
        let Some(slice) = slice else {
            info!(
                "Unable to partial resync with replica {} for lack of backlog \
                 (replica request was: {}).",
                self.addr, offset
            );
            if offset > core.master_repl_offset + 1 {
                warn!(
                    "Replica {} tried to PSYNC with an offset beyond the leader \
                     replication offset.",
                    self.addr
                );
            }
            return None;
        };

        let mut record = FollowerRecord::new(self.session_id, self.addr);
        record.state = FollowerSyncState::Online;
        record.capa = request.capa;
        record.uuid = request.uuid;
        record.listening_port = request.listening_port;
        record.announced_ip = request.announced_ip.clone();
        let notify = record.notify.clone();
        core.followers.insert(self.session_id, record);
        core.no_followers_since = None;

        let reply = if request.capa.contains(ReplicaCapa::PSYNC2) {
            Bytes::from(format!("+CONTINUE {}\r\n", core.identity.primary_id))
        } else {
            Bytes::from_static(b"+CONTINUE\r\n")
        };
        core.refresh_good_follower_count(max_lag);
        Some((reply, slice, notify))
    }

    /// Registers the follower for a full resync in WAIT_BGSAVE_START,
    /// creating the backlog (with a fresh history) if this is the first
    /// follower ever to attach.
    fn register_full_resync(&self, request: &SyncRequest) -> Arc<Notify> {
        let backlog_size = self.state.replication.settings.backlog_size;
        let mut core = self.state.replication.core.lock();
        if core.followers.is_empty() && core.backlog.is_none() {
            core.create_backlog_fresh_history(backlog_size);
        }
        let mut record = FollowerRecord::new(self.session_id, self.addr);
        record.capa = request.capa;
        record.uuid = request.uuid;
        record.pre_psync = matches!(request.kind, SyncKind::LegacySync);
        record.listening_port = request.listening_port;
        record.announced_ip = request.announced_ip.clone();
        let notify = record.notify.clone();
        core.followers.insert(self.session_id, record);
        core.no_followers_since = None;
        notify
    }

    /// Waits through WAIT_BGSAVE_START / WAIT_BGSAVE_END, flushing control
    /// bytes (the FULLRESYNC header, keepalive newlines) as they are queued,
    /// until the save completes and parks the payload on the record.
    async fn await_bulk_handoff(
        &mut self,
        framed_reader: &mut FramedRead<ReadHalf<S>, RespFrameCodec>,
        write_half: &mut WriteHalf<S>,
        notify: Arc<Notify>,
    ) -> Result<BulkHandoff, KunziteError> {
        loop {
            // Drain control bytes and inspect the record before sleeping, so
            // a transition that happened before we subscribed is not missed.
            let (control, outcome) = {
                let mut core = self.state.replication.core.lock();
                let Some(follower) = core.followers.get_mut(&self.session_id) else {
                    return Err(KunziteError::ReplicationError(
                        "follower record removed during sync".into(),
                    ));
                };
                let control: Vec<Bytes> = follower.immediate.drain(..).collect();
                let outcome = if follower.closing {
                    Some(None)
                } else if follower.state == FollowerSyncState::SendBulk {
                    Some(follower.pending_bulk.take())
                } else {
                    None
                };
                (control, outcome)
            };
            for chunk in &control {
                write_half.write_all(chunk).await?;
            }
            if !control.is_empty() {
                write_half.flush().await?;
            }
            match outcome {
                Some(Some(handoff)) => return Ok(handoff),
                Some(None) => {
                    return Err(KunziteError::ReplicationError(
                        "sync aborted while waiting for the background save".into(),
                    ));
                }
                None => {}
            }

            tokio::select! {
                _ = notify.notified() => {}
                frame = framed_reader.next() => {
                    match frame {
                        Some(Ok(frame)) => self.handle_inbound_frame(frame),
                        Some(Err(e)) => return Err(e),
                        None => {
                            return Err(KunziteError::ReplicationError(
                                "follower disconnected while waiting for the background save"
                                    .into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Streams the snapshot payload: a `$<size>` preamble plus the file for
    /// disk saves, the EOF-delimited envelope for diskless ones.
    async fn send_bulk(
        &mut self,
        write_half: &mut WriteHalf<S>,
        handoff: &BulkHandoff,
    ) -> Result<(), KunziteError> {
        match handoff {
            BulkHandoff::DiskFile { path, size } => {
                let preamble = format!("${size}\r\n");
                write_half.write_all(preamble.as_bytes()).await?;
                let mut file = tokio::fs::File::open(path).await?;
                tokio::io::copy(&mut file, write_half).await?;
            }
            BulkHandoff::SocketPayload { payload, eof_mark } => {
                let preamble = format!("$EOF:{}\r\n", String::from_utf8_lossy(eof_mark));
                write_half.write_all(preamble.as_bytes()).await?;
                write_half.write_all(payload).await?;
                write_half.write_all(eof_mark).await?;
            }
        }
        write_half.flush().await?;
        debug!("Finished sending bulk payload to replica {}.", self.addr);
        Ok(())
    }

    /// The online phase: drain queued stream bytes on every wakeup, read
    /// `REPLCONF ACK` frames coming back, and exit when the record is marked
    /// for closing or the socket drops.
    async fn stream_online(
        &mut self,
        framed_reader: &mut FramedRead<ReadHalf<S>, RespFrameCodec>,
        write_half: &mut WriteHalf<S>,
        notify: Arc<Notify>,
    ) -> Result<(), KunziteError> {
        loop {
            let (pending, closing) = {
                let mut core = self.state.replication.core.lock();
                let Some(follower) = core.followers.get_mut(&self.session_id) else {
                    return Ok(());
                };
                let mut pending: Vec<Bytes> = follower.immediate.drain(..).collect();
                if !follower.put_online_on_ack {
                    pending.extend(follower.stream.drain(..));
                }
                (pending, follower.closing)
            };

            for chunk in &pending {
                write_half.write_all(chunk).await?;
            }
            if !pending.is_empty() {
                write_half.flush().await?;
            }
            if closing {
                info!("Closing connection with replica {}.", self.addr);
                return Ok(());
            }

            tokio::select! {
                _ = notify.notified() => {}
                frame = framed_reader.next() => {
                    match frame {
                        Some(Ok(frame)) => self.handle_inbound_frame(frame),
                        Some(Err(e)) => return Err(e),
                        None => {
                            return Err(KunziteError::ReplicationError(
                                "connection with replica lost".into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Processes a frame sent by the follower on the replication link. The
    /// only traffic expected here is `REPLCONF ACK <offset>`.
    fn handle_inbound_frame(&self, frame: RespFrame) {
        let RespFrame::Array(parts) = frame else {
            return;
        };
        let mut args = Vec::with_capacity(parts.len());
        for part in parts {
            if let RespFrame::BulkString(b) = part {
                args.push(b);
            } else {
                return;
            }
        }
        if args.len() < 3
            || !args[0].eq_ignore_ascii_case(b"REPLCONF")
            || !args[1].eq_ignore_ascii_case(b"ACK")
        {
            return;
        }
        let Ok(offset) = String::from_utf8_lossy(&args[2]).parse::<u64>() else {
            return;
        };

        let max_lag = self.state.replication.settings.min_replicas_max_lag_secs;
        let mut notify_session = None;
        {
            let mut core = self.state.replication.core.lock();
            if let Some(follower) = core.followers.get_mut(&self.session_id) {
                if offset > follower.ack_offset {
                    follower.ack_offset = offset;
                }
                follower.ack_time = Instant::now();
                if follower.put_online_on_ack
                    && follower.state == FollowerSyncState::Online
                {
                    // Diskless followers count as writable only now.
                    follower.put_online_on_ack = false;
                    notify_session = Some(follower.notify.clone());
                }
            }
            core.refresh_good_follower_count(max_lag);
        }
        if let Some(notify) = notify_session {
            notify.notify_one();
        }
        self.state.replication.ack_changed.notify_waiters();
        debug!(
            "Replica {} acknowledged offset {}.",
            self.addr, offset
        );
    }
}
