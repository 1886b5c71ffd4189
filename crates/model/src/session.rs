use {
    crate::{ProductId, SessionId},
    chrono::{DateTime, Utc},
    serde::Serialize,
};

/// Per-session scoring parameters and timing. Immutable once the session
/// has started, which is what makes them safe to cache for the session's
/// whole lifetime.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionParams {
    pub id: SessionId,
    pub product_id: ProductId,
    pub reserve_price: f64,
    /// Number of winning slots (K). Always >= 1.
    pub inventory: i64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SessionParams {
    /// Where `now` falls relative to the session's bidding window.
    pub fn status_at(&self, now: DateTime<Utc>) -> SessionStatus {
        if now < self.start_time {
            SessionStatus::NotStarted
        } else if now >= self.end_time {
            SessionStatus::Ended
        } else {
            SessionStatus::Active
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStatus {
    NotStarted,
    Active,
    Ended,
    /// Administratively deactivated while inside the bidding window.
    Paused,
}

/// Session-list entry pushed to observers of the global topic.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub product_id: ProductId,
    pub name: String,
    pub description: String,
    pub reserve_price: f64,
    pub inventory: i64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_active: bool,
    pub status: &'static str,
}

#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeZone};

    fn params(start: DateTime<Utc>, end: DateTime<Utc>) -> SessionParams {
        SessionParams {
            id: SessionId::nil(),
            product_id: ProductId::nil(),
            reserve_price: 100.,
            inventory: 1,
            alpha: 1.,
            beta: 1.,
            gamma: 1.,
            start_time: start,
            end_time: end,
        }
    }

    #[test]
    fn status_follows_window() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap();
        let params = params(start, end);

        assert_eq!(
            params.status_at(start - chrono::Duration::seconds(1)),
            SessionStatus::NotStarted
        );
        assert_eq!(params.status_at(start), SessionStatus::Active);
        assert_eq!(
            params.status_at(end - chrono::Duration::seconds(1)),
            SessionStatus::Active
        );
        // The window is half open: `end` itself is already over.
        assert_eq!(params.status_at(end), SessionStatus::Ended);
    }
}
