// src/core/state/core.rs

//! Defines the central `ServerState` struct, holding all shared server-wide
//! state.

use super::client::ClientMap;
use super::persistence::PersistenceState;
use super::replication::ReplicationState;
use crate::config::Config;
use crate::core::KunziteError;
use crate::core::storage::{Db, MvccClock};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

/// Everything `initialize` produces: the shared state plus the channel ends
/// the task spawner needs.
pub struct ServerInit {
    pub state: Arc<ServerState>,
    /// Signals follower workers that the leader set changed.
    pub reconfigure_rx: broadcast::Receiver<()>,
}

/// The central struct holding all shared, server-wide state. Wrapped in an
/// `Arc` and handed to every task and connection handler.
#[derive(Debug)]
pub struct ServerState {
    /// All logical databases; `SELECT` indexes into this.
    pub dbs: Vec<Arc<Db>>,
    /// Active client connections keyed by session ID.
    pub clients: ClientMap,
    /// Runtime configuration; a Mutex so REPLICAOF can rewrite the role.
    pub config: Arc<Mutex<Config>>,
    /// This instance's stable identity, exchanged via `REPLCONF uuid` and
    /// carried in every RREPLAY envelope.
    pub instance_uuid: Uuid,
    /// MVCC timestamp source for write stamping.
    pub mvcc_clock: MvccClock,
    /// True while a received snapshot is being loaded; PSYNC requests are
    /// answered with -LOADING.
    pub is_loading: AtomicBool,
    pub replication: ReplicationState,
    pub persistence: PersistenceState,
}

impl ServerState {
    /// Builds the full server state from a validated configuration.
    pub fn initialize(config: Config) -> Result<ServerInit, KunziteError> {
        let dbs = (0..config.databases).map(|_| Arc::new(Db::new())).collect();
        let replication = ReplicationState::new(config.replication.clone());
        let reconfigure_rx = replication.reconfigure_tx.subscribe();
        let persistence = PersistenceState::new(
            config.persistence.aof_enabled,
            PathBuf::from(&config.persistence.aof_path),
        );

        let state = Arc::new(Self {
            dbs,
            clients: Arc::new(DashMap::new()),
            config: Arc::new(Mutex::new(config)),
            instance_uuid: Uuid::new_v4(),
            mvcc_clock: MvccClock::new(),
            is_loading: AtomicBool::new(false),
            replication,
            persistence,
        });

        Ok(ServerInit {
            state,
            reconfigure_rx,
        })
    }

    pub fn get_db(&self, db_index: usize) -> Option<Arc<Db>> {
        self.dbs.get(db_index).cloned()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading.load(Ordering::SeqCst)
    }
}
