// src/core/commands/generic/mod.rs

pub mod auth;
pub mod dbsize;
pub mod del;
pub mod echo;
pub mod flushall;
pub mod info;
pub mod ping;
pub mod psync;
pub mod replconf;
pub mod replicaof;
pub mod role;
pub mod rreplay;
pub mod select;
pub mod sync;
pub mod wait;

pub use auth::Auth;
pub use dbsize::DbSize;
pub use del::Del;
pub use echo::Echo;
pub use flushall::FlushAll;
pub use info::Info;
pub use ping::Ping;
pub use psync::Psync;
pub use replconf::Replconf;
pub use replicaof::ReplicaOf;
pub use role::Role;
pub use rreplay::Rreplay;
pub use select::Select;
pub use sync::SyncCmd;
pub use wait::Wait;
