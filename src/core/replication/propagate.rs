// src/core/replication/propagate.rs

//! Command fan-out: turns every admitted write into replication stream
//! bytes, feeds the backlog, and queues the bytes to each follower.
//!
//! Two stream dialects exist. A plain leader emits raw command arrays
//! (preceded by SELECT when the target database changes). An active replica
//! wraps every command in an RREPLAY envelope carrying the originator's
//! UUID plus db/mvcc sidecars, so peers can suppress their own commands
//! looping back and order concurrent writes.

use crate::core::protocol::RespFrame;
use crate::core::state::{FollowerSyncState, ServerState, same_uuid_no_nil};
use bytes::Bytes;
use std::sync::Arc;
use uuid::Uuid;

/// Builds the RREPLAY envelope for one encoded command:
/// `*5\r\n$7\r\nRREPLAY\r\n$<ulen>\r\n<uuid>\r\n$<clen>\r\n<cmd>\r\n$<dlen>\r\n<db>\r\n$<mlen>\r\n<mvcc>\r\n`.
pub fn wrap_rreplay(origin: Uuid, inner: &[u8], db_index: usize, mvcc: u64) -> Bytes {
    let uuid_text = origin.to_string();
    let db_text = db_index.to_string();
    let mvcc_text = mvcc.to_string();

    let mut out = Vec::with_capacity(inner.len() + 96);
    out.extend_from_slice(b"*5\r\n$7\r\nRREPLAY\r\n");
    out.extend_from_slice(format!("${}\r\n{}\r\n", uuid_text.len(), uuid_text).as_bytes());
    out.extend_from_slice(format!("${}\r\n", inner.len()).as_bytes());
    out.extend_from_slice(inner);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(format!("${}\r\n{}\r\n", db_text.len(), db_text).as_bytes());
    out.extend_from_slice(format!("${}\r\n{}\r\n", mvcc_text.len(), mvcc_text).as_bytes());
    Bytes::from(out)
}

/// Propagates one write command to the backlog and all followers. Returns the
/// global offset after the append, which the issuing session records for
/// `WAIT`.
///
/// `origin` identifies the instance the command first entered the topology
/// on: the local UUID for client writes, the wrapping UUID when re-fanning a
/// command received via RREPLAY.
pub fn propagate_write(
    state: &Arc<ServerState>,
    db_index: usize,
    argv: &[Bytes],
    origin: Uuid,
    mvcc: u64,
) -> u64 {
    let active = state.replication.settings.active_replica;

    // A non-active follower never produces its own stream: sub-followers get
    // the byte-exact relay of the upstream stream instead.
    if !active && state.replication.has_leaders() {
        return state.replication.master_repl_offset();
    }

    let mut core = state.replication.core.lock();
    if core.backlog.is_none() && core.followers.is_empty() {
        return core.master_repl_offset;
    }

    let cmd_bytes = match RespFrame::command(argv).encode_to_vec() {
        Ok(b) => b,
        Err(_) => return core.master_repl_offset,
    };

    if active {
        let wrapped = wrap_rreplay(origin, &cmd_bytes, db_index, mvcc);
        let offset_before = core.master_repl_offset;
        core.append_stream_bytes(&wrapped);
        let delta = core.master_repl_offset - offset_before;
        for follower in core.followers.values_mut() {
            if follower.state == FollowerSyncState::WaitBgsaveStart || follower.closing {
                continue;
            }
            if same_uuid_no_nil(follower.uuid, origin) {
                // This command looped back to where it came from; account the
                // bytes so the follower's ACKs still line up.
                follower.skipped_bytes += delta;
                continue;
            }
            follower.queue_stream(wrapped.clone());
        }
    } else {
        let mut payload = Vec::with_capacity(cmd_bytes.len() + 32);
        if core.replica_seldb != Some(db_index) {
            let select = RespFrame::command(&[
                Bytes::from_static(b"SELECT"),
                Bytes::from(db_index.to_string()),
            ]);
            if let Ok(select_bytes) = select.encode_to_vec() {
                payload.extend_from_slice(&select_bytes);
            }
            core.replica_seldb = Some(db_index);
        }
        payload.extend_from_slice(&cmd_bytes);
        let payload = Bytes::from(payload);
        core.append_stream_bytes(&payload);
        for follower in core.followers.values_mut() {
            if follower.state == FollowerSyncState::WaitBgsaveStart || follower.closing {
                continue;
            }
            follower.queue_stream(payload.clone());
        }
    }

    core.master_repl_offset
}

/// Fans out the periodic PING heartbeat on whatever database the stream has
/// selected, so no SELECT is forced.
pub fn propagate_ping(state: &Arc<ServerState>) {
    let db_index = {
        let core = state.replication.core.lock();
        if core.followers.is_empty() {
            return;
        }
        core.replica_seldb.unwrap_or(0)
    };
    let mvcc = state.mvcc_clock.next();
    propagate_write(
        state,
        db_index,
        &[Bytes::from_static(b"PING")],
        state.instance_uuid,
        mvcc,
    );
}

/// Feeds `REPLCONF GETACK *` through the stream so followers acknowledge
/// immediately. Always sent raw, even in active mode: it is flow control, not
/// a write. Followers still waiting for their first post-diskless ACK are
/// skipped (with the bytes accounted in `skipped_bytes`), since they cannot
/// usefully answer yet.
pub fn propagate_getack(state: &Arc<ServerState>) {
    let mut core = state.replication.core.lock();
    if core.backlog.is_none() && core.followers.is_empty() {
        return;
    }
    let getack = RespFrame::command(&[
        Bytes::from_static(b"REPLCONF"),
        Bytes::from_static(b"GETACK"),
        Bytes::from_static(b"*"),
    ]);
    let Ok(payload) = getack.encode_to_vec() else {
        return;
    };
    let payload = Bytes::from(payload);
    let offset_before = core.master_repl_offset;
    core.append_stream_bytes(&payload);
    let delta = core.master_repl_offset - offset_before;
    for follower in core.followers.values_mut() {
        if follower.state == FollowerSyncState::WaitBgsaveStart || follower.closing {
            continue;
        }
        if follower.put_online_on_ack {
            follower.skipped_bytes += delta;
            continue;
        }
        follower.queue_stream(payload.clone());
    }
}
