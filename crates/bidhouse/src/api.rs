//! In-process surface consumed by the transport layer. The transport is
//! expected to decode requests, call into this facade, and stream the push
//! events out over its own channel.

use {
    crate::{
        auth::{AuthError, Authenticator},
        broadcast::{Broadcaster, Subscription},
        database::Persisting,
        leaderboard::{LeaderboardError, LeaderboardReader},
        monitor::SessionMonitor,
        processor::{BidError, BidProcessor},
    },
    database::rankings::Ranking,
    model::{auth::Principal, bid::BidOutcome, leaderboard::Leaderboard, SessionId},
    std::sync::Arc,
};

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("bidding session not found")]
    SessionNotFound,
    #[error("durable store unavailable")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A session's frozen outcome.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionFinalState {
    pub session_id: SessionId,
    pub final_price: Option<f64>,
    pub rankings: Vec<Ranking>,
}

pub struct Api {
    authenticator: Authenticator,
    processor: BidProcessor,
    reader: Arc<LeaderboardReader>,
    broadcaster: Arc<Broadcaster>,
    monitor: Arc<SessionMonitor>,
    db: Arc<dyn Persisting>,
}

impl Api {
    pub fn new(
        authenticator: Authenticator,
        processor: BidProcessor,
        reader: Arc<LeaderboardReader>,
        broadcaster: Arc<Broadcaster>,
        monitor: Arc<SessionMonitor>,
        db: Arc<dyn Persisting>,
    ) -> Self {
        Self {
            authenticator,
            processor,
            reader,
            broadcaster,
            monitor,
            db,
        }
    }

    pub async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        self.authenticator.authenticate(token).await
    }

    pub async fn submit_bid(
        &self,
        principal: &Principal,
        session_id: SessionId,
        price: f64,
    ) -> Result<BidOutcome, BidError> {
        self.processor.submit_bid(principal, session_id, price).await
    }

    pub async fn get_leaderboard(
        &self,
        session_id: SessionId,
        page: i64,
        page_size: Option<i64>,
    ) -> Result<Leaderboard, LeaderboardError> {
        self.reader.leaderboard(session_id, page, page_size).await
    }

    /// Stream of leaderboard snapshots for one session.
    pub fn subscribe(&self, session_id: SessionId) -> Subscription {
        self.broadcaster.subscribe(session_id)
    }

    /// Stream of session-list updates.
    pub fn subscribe_session_list(&self) -> Subscription {
        self.broadcaster.subscribe_session_list()
    }

    /// Finalizes a session (idempotent) and returns its frozen state. An
    /// already-finalized session returns its recorded outcome unchanged.
    pub async fn finalize_session(
        &self,
        session_id: SessionId,
    ) -> Result<SessionFinalState, FinalizeError> {
        let session = self
            .db
            .session(session_id)
            .await?
            .ok_or(FinalizeError::SessionNotFound)?;
        if session.is_active {
            self.monitor.finalize(&session).await?;
        }

        let session = self
            .db
            .session(session_id)
            .await?
            .ok_or(FinalizeError::SessionNotFound)?;
        let rankings = self.db.session_rankings(session_id).await?;
        Ok(SessionFinalState {
            session_id,
            final_price: session.final_price,
            rankings,
        })
    }
}
