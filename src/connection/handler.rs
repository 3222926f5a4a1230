// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of a
//! client connection.

use super::guard::ConnectionGuard;
use super::session::SessionState;
use crate::core::commands::CommandFlags;
use crate::core::commands::command_trait::ExecutionContext;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use crate::core::replication::primary::{FollowerSession, SyncKind, SyncRequest};
use crate::core::replication::propagate::{propagate_getack, propagate_write};
use crate::core::replication::{replicaof_no_one, replicaof_set};
use crate::core::state::{ClientRole, ReplicaCapa, ServerState};
use crate::core::{Command, KunziteError};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The next step for the connection's main loop to take.
enum NextAction {
    Continue,
    ExitLoop,
}

/// Manages the full lifecycle of a client connection.
pub struct ConnectionHandler {
    framed: Option<Framed<TcpStream, RespFrameCodec>>,
    addr: SocketAddr,
    state: Arc<ServerState>,
    session_id: u64,
    shutdown_rx: broadcast::Receiver<()>,
    session: SessionState,
}

impl ConnectionHandler {
    pub async fn new(
        socket: TcpStream,
        addr: SocketAddr,
        state: Arc<ServerState>,
        session_id: u64,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let is_auth_required = state.config.lock().await.password.is_some();
        Self {
            framed: Some(Framed::new(socket, RespFrameCodec)),
            addr,
            state,
            session_id,
            shutdown_rx,
            session: SessionState::new(is_auth_required),
        }
    }

    /// The main event loop for the connection.
    pub async fn run(&mut self) -> Result<(), KunziteError> {
        let mut guard = ConnectionGuard::new(self.state.clone(), self.session_id, self.addr);
        loop {
            if self.framed.is_none() {
                // Connection was handed off to a follower session.
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!("Connection handler for {} received shutdown signal.", self.addr);
                    if let Some(framed) = self.framed.as_mut() {
                        let _ = framed
                            .send(RespFrame::Error("SHUTDOWN Server is shutting down".into()))
                            .await;
                    }
                    return Ok(());
                }
                result = self.framed.as_mut().unwrap().next() => {
                    match result {
                        Some(Ok(frame)) => {
                            match self.process_frame(frame, &mut guard).await {
                                Ok(NextAction::Continue) => {
                                    self.touch_client_activity();
                                }
                                Ok(NextAction::ExitLoop) => return Ok(()),
                                Err(e) => self.send_error(e).await?,
                            }
                        }
                        Some(Err(e)) => {
                            if is_normal_disconnect(&e) {
                                debug!("Connection from {} closed by peer: {}", self.addr, e);
                            } else {
                                warn!("Connection error for {}: {}", self.addr, e);
                            }
                            return Ok(());
                        }
                        None => {
                            debug!("Connection from {} closed by peer.", self.addr);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Parses a frame, routes it as a command, and sends the response.
    async fn process_frame(
        &mut self,
        frame: RespFrame,
        guard: &mut ConnectionGuard,
    ) -> Result<NextAction, KunziteError> {
        let command = Command::try_from(frame)?;
        debug!(
            "Session {}: received command {}",
            self.session_id,
            command.name()
        );

        // Only AUTH passes before authentication.
        if !self.session.is_authenticated && !matches!(command, Command::Auth(_)) {
            return Err(KunziteError::AuthRequired);
        }

        match command {
            Command::Auth(auth) => {
                let expected = { self.state.config.lock().await.password.clone() };
                match expected {
                    Some(expected) if expected == auth.secret => {
                        self.session.is_authenticated = true;
                        self.send_frame(RespFrame::ok()).await?;
                    }
                    Some(_) => return Err(KunziteError::InvalidPassword),
                    None => {
                        return Err(KunziteError::InvalidState(
                            "Client sent AUTH, but no password is set".into(),
                        ));
                    }
                }
            }
            Command::Select(select) => {
                if select.db_index >= self.state.dbs.len() {
                    return Err(KunziteError::InvalidRequest("DB index is out of range".into()));
                }
                self.session.current_db_index = select.db_index;
                self.send_frame(RespFrame::ok()).await?;
            }
            Command::Replconf(replconf) => {
                let reply = self.handle_replconf(&replconf.args)?;
                if let Some(reply) = reply {
                    self.send_frame(reply).await?;
                }
            }
            Command::Psync(psync) => {
                return self
                    .handoff_to_follower_session(
                        SyncKind::Psync {
                            replid: psync.replication_id,
                            offset: psync.offset,
                        },
                        guard,
                    )
                    .await;
            }
            Command::Sync(_) => {
                return self
                    .handoff_to_follower_session(SyncKind::LegacySync, guard)
                    .await;
            }
            Command::ReplicaOf(replicaof) => {
                if replicaof.is_no_one() {
                    replicaof_no_one(&self.state).await?;
                } else {
                    let port: u16 = replicaof
                        .port
                        .parse()
                        .map_err(|_| KunziteError::NotAnInteger)?;
                    if port == 0 {
                        return Err(KunziteError::InvalidRequest("Invalid master port".into()));
                    }
                    replicaof_set(&self.state, &replicaof.host, port).await?;
                }
                self.send_frame(RespFrame::ok()).await?;
            }
            Command::Wait(wait) => {
                let reply = self.handle_wait(wait.num_replicas, wait.timeout_ms).await?;
                self.send_frame(reply).await?;
            }
            command => {
                let reply = self.execute_command(&command).await?;
                self.send_frame(reply).await?;
            }
        }
        Ok(NextAction::Continue)
    }

    /// Runs a data-plane command and propagates it on success.
    async fn execute_command(&mut self, command: &Command) -> Result<RespFrame, KunziteError> {
        let flags = command.flags();

        if flags.contains(CommandFlags::WRITE) {
            if self.state.replication.is_read_only_follower() {
                return Err(KunziteError::ReadOnly(
                    "You can't write against a read only replica.".into(),
                ));
            }
            self.check_min_replicas_policy()?;
        }

        let db = self
            .state
            .get_db(self.session.current_db_index)
            .ok_or_else(|| KunziteError::Internal("session selected an invalid DB".into()))?;
        let mut ctx = ExecutionContext {
            state: self.state.clone(),
            db,
            db_index: self.session.current_db_index,
            session_id: self.session_id,
            mvcc: self.state.mvcc_clock.next(),
            apply_lww: false,
        };
        let (reply, outcome) = command.execute(&mut ctx).await?;

        if flags.contains(CommandFlags::WRITE)
            && !flags.contains(CommandFlags::NO_PROPAGATE)
            && outcome.wrote()
        {
            let offset = propagate_write(
                &self.state,
                self.session.current_db_index,
                &command.argv(),
                self.state.instance_uuid,
                ctx.mvcc,
            );
            self.session.last_write_offset = offset;
        }
        Ok(reply)
    }

    /// Enforces the `min_replicas_to_write` policy.
    fn check_min_replicas_policy(&self) -> Result<(), KunziteError> {
        let settings = &self.state.replication.settings;
        if settings.min_replicas_to_write == 0 || self.state.replication.has_leaders() {
            return Ok(());
        }
        let good = self.state.replication.core.lock().good_follower_count;
        if good < settings.min_replicas_to_write {
            return Err(KunziteError::ReplicationError(format!(
                "NOREPLICAS Not enough good replicas to write (have {good}, need {})",
                settings.min_replicas_to_write
            )));
        }
        Ok(())
    }

    /// Applies `REPLCONF <option> <value> ...` pairs to the session. Returns
    /// the reply frame, or `None` for options that reply nothing.
    fn handle_replconf(&mut self, args: &[String]) -> Result<Option<RespFrame>, KunziteError> {
        if args.len() % 2 != 0 {
            return Err(KunziteError::SyntaxError);
        }
        for pair in args.chunks_exact(2) {
            let option = pair[0].to_ascii_lowercase();
            let value = &pair[1];
            match option.as_str() {
                "listening-port" => {
                    let port: u16 = value.parse().map_err(|_| KunziteError::NotAnInteger)?;
                    self.session.replconf.listening_port = Some(port);
                }
                "ip-address" => {
                    self.session.replconf.announced_ip = Some(value.clone());
                }
                "capa" => {
                    // Capabilities we do not understand are silently ignored.
                    if value.eq_ignore_ascii_case("eof") {
                        self.session.replconf.capa |= ReplicaCapa::EOF;
                    } else if value.eq_ignore_ascii_case("psync2") {
                        self.session.replconf.capa |= ReplicaCapa::PSYNC2;
                    } else if value.eq_ignore_ascii_case("activeExpire") {
                        self.session.replconf.capa |= ReplicaCapa::ACTIVE_EXPIRE;
                    }
                }
                "uuid" => {
                    let parsed = Uuid::parse_str(value)
                        .map_err(|_| KunziteError::InvalidRequest("Invalid UUID".into()))?;
                    self.session.replconf.uuid = parsed;
                    // The reply carries our own identity back.
                    return Ok(Some(RespFrame::SimpleString(
                        self.state.instance_uuid.to_string(),
                    )));
                }
                "license" => {
                    let own = { self.state.replication.settings.license_key.clone() };
                    if own.as_deref() == Some(value.as_str()) {
                        return Err(KunziteError::InvalidRequest(
                            "Each replica must have a unique license key".into(),
                        ));
                    }
                }
                "ack" | "getack" => {
                    // ACK traffic belongs on a follower session's link; on a
                    // plain client connection it is ignored without a reply.
                    return Ok(None);
                }
                other => {
                    return Err(KunziteError::InvalidRequest(format!(
                        "Unrecognized REPLCONF option: {other}"
                    )));
                }
            }
        }
        Ok(Some(RespFrame::ok()))
    }

    /// Implements WAIT: ask followers to acknowledge, then block until
    /// enough have caught up with this session's last write or the timeout
    /// expires.
    async fn handle_wait(
        &mut self,
        num_replicas: usize,
        timeout_ms: u64,
    ) -> Result<RespFrame, KunziteError> {
        if self.state.replication.has_leaders()
            && !self.state.replication.settings.active_replica
        {
            return Err(KunziteError::InvalidState(
                "WAIT cannot be used with replica instances".into(),
            ));
        }
        let target = self.session.last_write_offset;

        let mut acked = self.state.replication.core.lock().count_acks(target);
        if acked >= num_replicas {
            return Ok(RespFrame::Integer(acked as i64));
        }

        propagate_getack(&self.state);

        // Re-check on every ACK notification, with a short poll floor so a
        // notification racing the count can never strand the client.
        const WAIT_POLL_FLOOR: Duration = Duration::from_millis(100);
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        loop {
            acked = self.state.replication.core.lock().count_acks(target);
            if acked >= num_replicas {
                break;
            }
            let mut nap = WAIT_POLL_FLOOR;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                nap = nap.min(deadline - now);
            }
            let _ = tokio::time::timeout(nap, self.state.replication.ack_changed.notified()).await;
        }
        Ok(RespFrame::Integer(acked as i64))
    }

    /// Hands the connection off to a dedicated follower session.
    async fn handoff_to_follower_session(
        &mut self,
        kind: SyncKind,
        guard: &mut ConnectionGuard,
    ) -> Result<NextAction, KunziteError> {
        if let Some(mut entry) = self.state.clients.get_mut(&self.session_id) {
            entry.role = ClientRole::Follower;
        }
        guard.set_handed_off();

        let Some(framed) = self.framed.take() else {
            return Err(KunziteError::Internal(
                "framed stream already taken for follower handoff".into(),
            ));
        };
        info!("Handing off connection {} to a follower session.", self.addr);

        let request = SyncRequest {
            kind,
            capa: self.session.replconf.capa,
            uuid: self.session.replconf.uuid,
            listening_port: self.session.replconf.listening_port,
            announced_ip: self.session.replconf.announced_ip.clone(),
        };
        let stream = framed.into_inner();
        let session = FollowerSession::new(
            self.state.clone(),
            self.session_id,
            self.addr,
            stream,
        );
        tokio::spawn(session.run(request, self.shutdown_rx.resubscribe()));
        Ok(NextAction::ExitLoop)
    }

    async fn send_frame(&mut self, frame: RespFrame) -> Result<(), KunziteError> {
        if let Some(framed) = self.framed.as_mut() {
            framed.send(frame).await?;
        }
        Ok(())
    }

    async fn send_error(&mut self, e: KunziteError) -> Result<(), KunziteError> {
        debug!("Session {}: sending error response: {}", self.session_id, e);
        self.send_frame(RespFrame::Error(e.to_string())).await
    }

    fn touch_client_activity(&self) {
        if let Some(mut entry) = self.state.clients.get_mut(&self.session_id) {
            entry.last_command_time = Instant::now();
        }
    }
}

/// Helper to check for non-critical disconnection errors.
fn is_normal_disconnect(e: &KunziteError) -> bool {
    matches!(e, KunziteError::Io(arc_err) if matches!(
        arc_err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
    ))
}
