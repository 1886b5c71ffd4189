//! Plain domain types shared between the service crates. Everything here is
//! serializable data without I/O; all linking between entities is by id.

pub mod auth;
pub mod bid;
pub mod leaderboard;
pub mod scoring;
pub mod session;

use uuid::Uuid;

pub type SessionId = Uuid;
pub type UserId = Uuid;
pub type ProductId = Uuid;
