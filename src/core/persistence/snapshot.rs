// src/core/persistence/snapshot.rs

//! The KZDB snapshot format.
//!
//! Layout: a magic/version header, the replication metadata (primary ID,
//! global offset, last-selected DB) that lets a restarted instance attempt
//! PSYNC, then one record block per non-empty database, an end tag, and a
//! CRC-32 over everything preceding it.
//!
//! Every value carries its MVCC stamp, so an active replica loading a peer's
//! snapshot can merge with last-write-wins instead of flushing.

use crate::core::KunziteError;
use crate::core::storage::Db;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

const KZDB_MAGIC: &[u8; 4] = b"KZDB";
const KZDB_VERSION: u8 = 1;
const TAG_DB: u8 = 0x01;
const TAG_END: u8 = 0xFF;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Replication metadata embedded in every snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub replid: String,
    pub master_repl_offset: u64,
    pub selected_db: usize,
}

/// Knobs for loading a snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotLoadOptions {
    /// Merge into the existing keyspace with last-write-wins instead of
    /// assuming it was flushed (active-replica full resync).
    pub update_only: bool,
    /// When merging, records stamped strictly below this threshold are
    /// skipped: they predate what the stream already delivered, and applying
    /// them could resurrect keys deleted since.
    pub mvcc_min_threshold: u64,
    /// Collect the set of keys present in the snapshot per database, for the
    /// stale-key diff.
    pub collect_keys: bool,
}

/// What a load produced.
#[derive(Debug)]
pub struct SnapshotLoadReport {
    pub meta: SnapshotMeta,
    /// Keys seen in the snapshot per database index; empty sets unless
    /// `collect_keys` was requested.
    pub keys_per_db: Vec<HashSet<Bytes>>,
}

/// Serializes all databases into a KZDB byte image.
pub fn save_to_bytes(dbs: &[Arc<Db>], meta: &SnapshotMeta) -> Result<Bytes, KunziteError> {
    if meta.replid.len() != 40 {
        return Err(KunziteError::SnapshotError(format!(
            "replication ID must be 40 characters, got {}",
            meta.replid.len()
        )));
    }
    let mut buf = BytesMut::new();
    buf.put_slice(KZDB_MAGIC);
    buf.put_u8(KZDB_VERSION);
    buf.put_slice(meta.replid.as_bytes());
    buf.put_u64_le(meta.master_repl_offset);
    buf.put_u32_le(meta.selected_db as u32);

    for (db_index, db) in dbs.iter().enumerate() {
        let entries = db.entries();
        if entries.is_empty() {
            continue;
        }
        buf.put_u8(TAG_DB);
        buf.put_u32_le(db_index as u32);
        buf.put_u64_le(entries.len() as u64);
        for (key, value) in entries {
            buf.put_u32_le(key.len() as u32);
            buf.put_slice(&key);
            buf.put_u32_le(value.data.len() as u32);
            buf.put_slice(&value.data);
            buf.put_u64_le(value.mvcc);
        }
    }

    buf.put_u8(TAG_END);
    let crc = CRC32.checksum(&buf);
    buf.put_u32_le(crc);
    Ok(buf.freeze())
}

/// Serializes and writes a snapshot to `path` atomically (temp file +
/// rename). Returns the file size in bytes.
pub async fn save_to_file(
    path: &Path,
    dbs: &[Arc<Db>],
    meta: &SnapshotMeta,
) -> Result<u64, KunziteError> {
    let image = save_to_bytes(dbs, meta)?;
    let size = image.len() as u64;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let parent = path.parent().unwrap_or_else(|| Path::new(".")).to_owned();
    let temp = tokio::task::spawn_blocking(move || tempfile::NamedTempFile::new_in(parent))
        .await
        .map_err(|e| KunziteError::Internal(format!("snapshot writer task failed: {e}")))??;
    let (file, temp_path) = temp.into_parts();
    let mut file = tokio::fs::File::from_std(file);
    file.write_all(&image).await?;
    file.sync_all().await?;
    drop(file);
    let target = path.to_owned();
    tokio::task::spawn_blocking(move || temp_path.persist(&target))
        .await
        .map_err(|e| KunziteError::Internal(format!("snapshot rename task failed: {e}")))?
        .map_err(|e| KunziteError::SnapshotError(format!("failed to persist snapshot: {e}")))?;
    Ok(size)
}

/// Loads a KZDB image into the given databases.
pub fn load_from_bytes(
    image: &[u8],
    dbs: &[Arc<Db>],
    opts: &SnapshotLoadOptions,
) -> Result<SnapshotLoadReport, KunziteError> {
    if image.len() < 4 + 1 + 40 + 8 + 4 + 1 + 4 {
        return Err(KunziteError::SnapshotError("snapshot truncated".into()));
    }
    let (body, crc_bytes) = image.split_at(image.len() - 4);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if CRC32.checksum(body) != stored_crc {
        return Err(KunziteError::SnapshotError("snapshot CRC mismatch".into()));
    }

    let mut cursor = body;
    let mut magic = [0u8; 4];
    cursor.copy_to_slice(&mut magic);
    if &magic != KZDB_MAGIC {
        return Err(KunziteError::SnapshotError("bad snapshot magic".into()));
    }
    let version = cursor.get_u8();
    if version != KZDB_VERSION {
        return Err(KunziteError::SnapshotError(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let mut replid_bytes = [0u8; 40];
    cursor.copy_to_slice(&mut replid_bytes);
    let replid = String::from_utf8(replid_bytes.to_vec())
        .map_err(|_| KunziteError::SnapshotError("replication ID is not UTF-8".into()))?;
    let master_repl_offset = cursor.get_u64_le();
    let selected_db = cursor.get_u32_le() as usize;

    let mut keys_per_db: Vec<HashSet<Bytes>> = (0..dbs.len()).map(|_| HashSet::new()).collect();

    loop {
        if cursor.remaining() < 1 {
            return Err(KunziteError::SnapshotError("missing end tag".into()));
        }
        match cursor.get_u8() {
            TAG_END => break,
            TAG_DB => {
                if cursor.remaining() < 12 {
                    return Err(KunziteError::SnapshotError("truncated db block".into()));
                }
                let db_index = cursor.get_u32_le() as usize;
                let count = cursor.get_u64_le();
                let db = dbs.get(db_index).ok_or_else(|| {
                    KunziteError::SnapshotError(format!(
                        "snapshot references database {db_index} beyond the configured range"
                    ))
                })?;
                for _ in 0..count {
                    let key = read_chunk(&mut cursor)?;
                    let value = read_chunk(&mut cursor)?;
                    if cursor.remaining() < 8 {
                        return Err(KunziteError::SnapshotError("truncated record".into()));
                    }
                    let mvcc = cursor.get_u64_le();
                    if opts.collect_keys {
                        keys_per_db[db_index].insert(key.clone());
                    }
                    if opts.update_only {
                        // Records older than what we already applied from this
                        // leader are settled history; re-inserting them could
                        // resurrect keys deleted since.
                        if mvcc >= opts.mvcc_min_threshold {
                            db.set_if_newer(key, value, mvcc);
                        }
                    } else {
                        db.set(key, value, mvcc);
                    }
                }
            }
            other => {
                return Err(KunziteError::SnapshotError(format!(
                    "unknown snapshot tag 0x{other:02x}"
                )));
            }
        }
    }

    Ok(SnapshotLoadReport {
        meta: SnapshotMeta {
            replid,
            master_repl_offset,
            selected_db,
        },
        keys_per_db,
    })
}

/// Loads a snapshot from a file.
pub async fn load_from_file(
    path: &Path,
    dbs: &[Arc<Db>],
    opts: &SnapshotLoadOptions,
) -> Result<SnapshotLoadReport, KunziteError> {
    let image = tokio::fs::read(path).await?;
    load_from_bytes(&image, dbs, opts)
}

fn read_chunk(cursor: &mut &[u8]) -> Result<Bytes, KunziteError> {
    if cursor.remaining() < 4 {
        return Err(KunziteError::SnapshotError("truncated length prefix".into()));
    }
    let len = cursor.get_u32_le() as usize;
    if cursor.remaining() < len {
        return Err(KunziteError::SnapshotError("truncated chunk".into()));
    }
    let chunk = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);
    Ok(chunk)
}
