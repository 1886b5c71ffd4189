//! The read path: one pipelined range query against the hot scoreboard,
//! one pipelined metadata multi-get, and at most one bulk identity lookup
//! against the durable store. Identity trouble degrades to placeholder
//! names instead of failing the response.

use {
    crate::{
        database::Persisting,
        hotstore::{HotStoreError, HotStoring},
        session_cache::{SessionCacheError, SessionParamCache},
    },
    itertools::izip,
    model::{
        leaderboard::{Leaderboard, LeaderboardEntry},
        SessionId,
        UserId,
    },
    std::{collections::HashMap, sync::Arc},
};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, thiserror::Error)]
pub enum LeaderboardError {
    #[error("bidding session not found")]
    SessionNotFound,
    #[error("hot store unavailable")]
    HotStoreUnavailable(#[source] anyhow::Error),
    #[error("durable store unavailable")]
    DurableStoreUnavailable(#[source] sqlx::Error),
    #[error("upstream deadline exceeded")]
    UpstreamTimeout,
}

impl From<SessionCacheError> for LeaderboardError {
    fn from(err: SessionCacheError) -> Self {
        match err {
            SessionCacheError::NotFound => Self::SessionNotFound,
            SessionCacheError::Database(err) => Self::DurableStoreUnavailable(err),
        }
    }
}

impl From<HotStoreError> for LeaderboardError {
    fn from(err: HotStoreError) -> Self {
        match err {
            HotStoreError::Unavailable(err) => Self::HotStoreUnavailable(err),
            HotStoreError::Timeout => Self::UpstreamTimeout,
        }
    }
}

pub struct LeaderboardReader {
    hot: Arc<dyn HotStoring>,
    db: Arc<dyn Persisting>,
    sessions: Arc<SessionParamCache>,
}

impl LeaderboardReader {
    pub fn new(
        hot: Arc<dyn HotStoring>,
        db: Arc<dyn Persisting>,
        sessions: Arc<SessionParamCache>,
    ) -> Self {
        Self { hot, db, sessions }
    }

    pub async fn leaderboard(
        &self,
        session_id: SessionId,
        page: i64,
        page_size: Option<i64>,
    ) -> Result<Leaderboard, LeaderboardError> {
        let page = page.max(1);
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1) * page_size;

        let params = self.sessions.params(session_id).await?;
        let k = params.inventory;

        let (pairs, total) = self.hot.leaderboard_page(session_id, offset, page_size).await?;
        let users: Vec<UserId> = pairs.iter().map(|(user, _)| *user).collect();
        let records = self.hot.bid_records(session_id, &users).await?;
        let usernames = self.resolve_usernames(&users).await;

        let threshold_score = self.threshold_score(session_id, &pairs, offset, total, k).await?;
        let highest_bid = self
            .highest_bid(session_id, &records, offset, total)
            .await?;

        let entries = izip!(&pairs, records, usernames)
            .enumerate()
            .map(|(position, ((user_id, score), record, username))| {
                let rank = offset + position as i64 + 1;
                LeaderboardEntry {
                    user_id: *user_id,
                    username,
                    price: record.map(|record| record.price).unwrap_or_default(),
                    score: *score,
                    rank,
                    is_winner: rank <= k,
                }
            })
            .collect();

        Ok(Leaderboard {
            session_id,
            entries,
            page,
            page_size,
            total,
            total_pages: if total == 0 {
                0
            } else {
                (total + page_size - 1) / page_size
            },
            highest_bid,
            threshold_score,
        })
    }

    /// Score at position K of the full scoreboard, `None` with fewer than K
    /// bidders. Served from the already-fetched page when it covers rank K.
    async fn threshold_score(
        &self,
        session_id: SessionId,
        pairs: &[(UserId, f64)],
        offset: i64,
        total: i64,
        k: i64,
    ) -> Result<Option<f64>, LeaderboardError> {
        if k < 1 || total < k {
            return Ok(None);
        }
        let kth = k - 1;
        if kth >= offset && kth < offset + pairs.len() as i64 {
            return Ok(Some(pairs[(kth - offset) as usize].1));
        }
        let (kth_entry, _) = self.hot.leaderboard_page(session_id, kth, 1).await?;
        Ok(kth_entry.first().map(|(_, score)| *score))
    }

    /// Price behind the best score. See `Leaderboard::highest_bid`.
    async fn highest_bid(
        &self,
        session_id: SessionId,
        records: &[Option<model::bid::BidRecord>],
        offset: i64,
        total: i64,
    ) -> Result<Option<f64>, LeaderboardError> {
        if total == 0 {
            return Ok(None);
        }
        if offset == 0 {
            return Ok(records
                .first()
                .and_then(|record| record.as_ref())
                .map(|record| record.price));
        }
        let (top, _) = self.hot.leaderboard_page(session_id, 0, 1).await?;
        let Some((user, _)) = top.first() else {
            return Ok(None);
        };
        Ok(self
            .hot
            .bid_records(session_id, &[*user])
            .await?
            .into_iter()
            .next()
            .flatten()
            .map(|record| record.price))
    }

    /// Display names for a page of users: identity cache first, then one
    /// bulk durable store query for the misses. Failures leave placeholder
    /// names; the response is still well formed.
    async fn resolve_usernames(&self, users: &[UserId]) -> Vec<String> {
        let cached = match self.hot.cached_usernames(users).await {
            Ok(cached) => cached,
            Err(err) => {
                tracing::warn!(?err, "identity cache unavailable");
                vec![None; users.len()]
            }
        };

        let mut resolved: HashMap<UserId, String> = users
            .iter()
            .zip(&cached)
            .filter_map(|(user, name)| Some((*user, name.clone()?)))
            .collect();

        let missing: Vec<UserId> = users
            .iter()
            .filter(|user| !resolved.contains_key(user))
            .copied()
            .collect();
        if !missing.is_empty() {
            match self.db.usernames(&missing).await {
                Ok(rows) => {
                    if let Err(err) = self.hot.cache_usernames(&rows).await {
                        tracing::debug!(?err, "failed to backfill identity cache");
                    }
                    resolved.extend(rows);
                }
                Err(err) => {
                    tracing::warn!(?err, "identity lookup failed, using placeholders");
                }
            }
        }

        users
            .iter()
            .map(|user| {
                resolved
                    .get(user)
                    .cloned()
                    .unwrap_or_else(|| placeholder_username(*user))
            })
            .collect()
    }
}

fn placeholder_username(user: UserId) -> String {
    let id = user.to_string();
    format!("user-{}", &id[..8])
}
