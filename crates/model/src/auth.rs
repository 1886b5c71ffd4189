use {crate::UserId, serde::Serialize};

/// Resolved identity behind an opaque token. Immutable for the lifetime of
/// the token; the weight feeds into bid scoring.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Principal {
    pub id: UserId,
    pub username: String,
    pub weight: f64,
    pub is_admin: bool,
}
