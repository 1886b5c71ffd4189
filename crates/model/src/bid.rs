use {
    chrono::{DateTime, Utc},
    serde::Serialize,
};

/// The hot per-bid record. Exactly one exists per `(session, user)`;
/// resubmission overwrites it in place.
#[derive(Clone, Debug, PartialEq)]
pub struct BidRecord {
    pub price: f64,
    pub score: f64,
    pub updated_at: DateTime<Utc>,
}

/// Returned to the caller of a successful bid submission.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BidOutcome {
    pub score: f64,
    /// 1-based position on the descending scoreboard.
    pub rank: Option<i64>,
}
