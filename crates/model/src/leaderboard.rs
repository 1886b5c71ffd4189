use {
    crate::{SessionId, UserId},
    serde::Serialize,
};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub username: String,
    pub price: f64,
    pub score: f64,
    /// 1-based, strictly increasing by position.
    pub rank: i64,
    pub is_winner: bool,
}

/// One page of a session's live ranking.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Leaderboard {
    pub session_id: SessionId,
    pub entries: Vec<LeaderboardEntry>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
    pub total_pages: i64,
    /// Price of the top ranked bid. This deliberately reports the price
    /// behind the best *score*, not the maximum price over all bidders.
    pub highest_bid: Option<f64>,
    /// Score of the K-th ranked entry, `None` while fewer than K bidders
    /// participate.
    pub threshold_score: Option<f64>,
}
