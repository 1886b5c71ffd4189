//! Typed facade over the in-memory hot store. The hot store is the
//! authority for live scoreboards between persist cycles, so every value
//! crossing this boundary is parsed into a typed record here; downstream
//! code never sees raw strings.

use {
    anyhow::Context as _,
    chrono::{DateTime, Utc},
    deadpool_redis::{Config, Pool, Runtime},
    model::{bid::BidRecord, session::SessionParams, ProductId, SessionId, UserId},
    redis::AsyncCommands,
    std::{collections::HashMap, future::Future, time::Duration},
};

/// Deadline applied to every hot store operation.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Hot keys must outlive the session itself with a generous margin for
/// finalization; short sessions still get at least this TTL.
const MIN_KEY_TTL: Duration = Duration::from_secs(3600);

/// TTL of the cached immutable session parameters.
const SESSION_PARAMS_TTL: Duration = Duration::from_secs(3600);

/// TTL of cached identity snapshots.
const USERNAME_TTL: Duration = Duration::from_secs(24 * 3600);

const DIRTY_SESSIONS: &str = "dirty_sessions";

fn ranking_key(session: SessionId) -> String {
    format!("ranking:{session}")
}

fn bid_key(session: SessionId, user: UserId) -> String {
    format!("bid:{session}:{user}")
}

fn bid_metadata_key(session: SessionId, user: UserId) -> String {
    format!("bid_metadata:{session}:{user}")
}

fn session_params_key(session: SessionId) -> String {
    format!("session:params:{session}")
}

fn session_active_key(session: SessionId) -> String {
    format!("session:active:{session}")
}

fn user_key(user: UserId) -> String {
    format!("user:{user}")
}

/// TTL for a session's ranking and bid keys: twice the remaining session
/// lifetime, floored so even nearly-over sessions survive finalization.
pub fn key_ttl(end_time: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let remaining = (end_time - now).to_std().unwrap_or_default();
    std::cmp::max(remaining * 2, MIN_KEY_TTL)
}

#[derive(Debug, thiserror::Error)]
pub enum HotStoreError {
    #[error("hot store unavailable")]
    Unavailable(#[source] anyhow::Error),
    #[error("hot store deadline exceeded")]
    Timeout,
}

/// Everything the hot store needs to record one accepted bid in a single
/// pipelined round trip.
#[derive(Clone, Debug, PartialEq)]
pub struct BidSubmission {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub price: f64,
    pub score: f64,
    pub updated_at: DateTime<Utc>,
    pub ttl: Duration,
}

/// Persister-facing copy of a bid, scanned out of `bid_metadata:*` keys.
#[derive(Clone, Debug, PartialEq)]
pub struct BidMetadata {
    pub user_id: UserId,
    pub price: f64,
    pub score: f64,
    pub updated_at: DateTime<Utc>,
}

impl BidMetadata {
    fn from_fields(fields: &HashMap<String, String>) -> anyhow::Result<Self> {
        Ok(Self {
            user_id: fields
                .get("user_id")
                .context("missing user_id")?
                .parse()
                .context("malformed user_id")?,
            price: fields
                .get("bid_price")
                .context("missing bid_price")?
                .parse()
                .context("malformed bid_price")?,
            score: fields
                .get("bid_score")
                .context("missing bid_score")?
                .parse()
                .context("malformed bid_score")?,
            updated_at: parse_timestamp(fields.get("updated_at").context("missing updated_at")?)?,
        })
    }
}

/// Cached session activity, written by the session parameter cache. The
/// paused flag may be flipped back by an administrator so it only lives
/// for seconds, while "ended" is definitive and may be cached for minutes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActivityFlag {
    Active,
    Paused,
    Ended,
}

impl ActivityFlag {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "1",
            Self::Paused => "0",
            Self::Ended => "ended",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "1" => Some(Self::Active),
            "0" => Some(Self::Paused),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }

    fn ttl(&self) -> Duration {
        match self {
            Self::Active | Self::Paused => Duration::from_secs(10),
            Self::Ended => Duration::from_secs(300),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait HotStoring: Send + Sync {
    /// Records an accepted bid: scoreboard upsert, bid hash, TTL refresh,
    /// dirty marker and persister metadata, all in one atomic pipeline.
    async fn apply_bid(&self, bid: &BidSubmission) -> Result<(), HotStoreError>;

    /// 1-based position of the user on the descending scoreboard.
    async fn rank_of(&self, session: SessionId, user: UserId)
        -> Result<Option<i64>, HotStoreError>;

    /// One page of the descending scoreboard plus its total size.
    async fn leaderboard_page(
        &self,
        session: SessionId,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<(UserId, f64)>, i64), HotStoreError>;

    /// The whole descending scoreboard. Used at finalization only.
    async fn full_ranking(&self, session: SessionId) -> Result<Vec<(UserId, f64)>, HotStoreError>;

    /// Per-bid hashes for the given users, one pipelined round trip.
    async fn bid_records(
        &self,
        session: SessionId,
        users: &[UserId],
    ) -> Result<Vec<Option<BidRecord>>, HotStoreError>;

    /// Atomically reads and clears the dirty-session set.
    async fn snapshot_and_clear_dirty(&self) -> Result<Vec<SessionId>, HotStoreError>;

    async fn mark_dirty(&self, session: SessionId) -> Result<(), HotStoreError>;

    /// Cursor-based scan of all persister metadata of a session. Entries
    /// that fail to decode are logged and skipped.
    async fn scan_bid_metadata(
        &self,
        session: SessionId,
    ) -> Result<Vec<BidMetadata>, HotStoreError>;

    async fn delete_bid_metadata(
        &self,
        session: SessionId,
        users: &[UserId],
    ) -> Result<(), HotStoreError>;

    async fn cached_session_params(
        &self,
        session: SessionId,
    ) -> Result<Option<SessionParams>, HotStoreError>;

    async fn cache_session_params(&self, params: &SessionParams) -> Result<(), HotStoreError>;

    async fn cached_activity(
        &self,
        session: SessionId,
    ) -> Result<Option<ActivityFlag>, HotStoreError>;

    async fn cache_activity(
        &self,
        session: SessionId,
        flag: ActivityFlag,
    ) -> Result<(), HotStoreError>;

    /// Identity cache lookups, one pipelined round trip.
    async fn cached_usernames(
        &self,
        users: &[UserId],
    ) -> Result<Vec<Option<String>>, HotStoreError>;

    async fn cache_usernames(&self, entries: &[(UserId, String)]) -> Result<(), HotStoreError>;

    async fn is_alive(&self) -> bool;
}

pub struct HotStore {
    pool: Pool,
    op_timeout: Duration,
}

impl HotStore {
    pub fn new(url: &str, max_connections: usize, op_timeout: Duration) -> anyhow::Result<Self> {
        let mut config = Config::from_url(url);
        config.pool = Some(deadpool_redis::PoolConfig::new(max_connections));
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .context("failed to create hot store pool")?;
        Ok(Self { pool, op_timeout })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, HotStoreError> {
        match tokio::time::timeout(self.op_timeout, self.pool.get()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => Err(HotStoreError::Unavailable(err.into())),
            Err(_) => Err(HotStoreError::Timeout),
        }
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, redis::RedisError>>,
    ) -> Result<T, HotStoreError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(HotStoreError::Unavailable(err.into())),
            Err(_) => Err(HotStoreError::Timeout),
        }
    }
}

#[async_trait::async_trait]
impl HotStoring for HotStore {
    async fn apply_bid(&self, bid: &BidSubmission) -> Result<(), HotStoreError> {
        let mut conn = self.conn().await?;
        let ranking = ranking_key(bid.session_id);
        let bid_hash = bid_key(bid.session_id, bid.user_id);
        let metadata = bid_metadata_key(bid.session_id, bid.user_id);
        let ttl = bid.ttl.as_secs() as i64;
        let updated_at = bid.updated_at.to_rfc3339();

        // Sub-operations apply in issue order within the transactional
        // pipeline, so the scoreboard and both hashes can never diverge for
        // a single user even under concurrent re-bids.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(&ranking, bid.user_id.to_string(), bid.score)
            .ignore()
            .hset_multiple(
                &bid_hash,
                &[
                    ("price", bid.price.to_string()),
                    ("score", bid.score.to_string()),
                    ("updated_at", updated_at.clone()),
                ],
            )
            .ignore()
            .expire(&ranking, ttl)
            .ignore()
            .expire(&bid_hash, ttl)
            .ignore()
            .sadd(DIRTY_SESSIONS, bid.session_id.to_string())
            .ignore()
            .hset_multiple(
                &metadata,
                &[
                    ("user_id", bid.user_id.to_string()),
                    ("bid_price", bid.price.to_string()),
                    ("bid_score", bid.score.to_string()),
                    ("updated_at", updated_at),
                ],
            )
            .ignore()
            .expire(&metadata, ttl)
            .ignore();

        self.timed(pipe.query_async::<_, ()>(&mut conn)).await
    }

    async fn rank_of(
        &self,
        session: SessionId,
        user: UserId,
    ) -> Result<Option<i64>, HotStoreError> {
        let mut conn = self.conn().await?;
        let rank: Option<i64> = self
            .timed(
                redis::cmd("ZREVRANK")
                    .arg(ranking_key(session))
                    .arg(user.to_string())
                    .query_async(&mut conn),
            )
            .await?;
        Ok(rank.map(|rank| rank + 1))
    }

    async fn leaderboard_page(
        &self,
        session: SessionId,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<(UserId, f64)>, i64), HotStoreError> {
        let mut conn = self.conn().await?;
        let key = ranking_key(session);

        let mut pipe = redis::pipe();
        pipe.cmd("ZREVRANGE")
            .arg(&key)
            .arg(offset)
            .arg(offset + limit - 1)
            .arg("WITHSCORES")
            .zcard(&key);
        let (pairs, total): (Vec<(String, f64)>, i64) =
            self.timed(pipe.query_async(&mut conn)).await?;

        Ok((parse_members(pairs), total))
    }

    async fn full_ranking(&self, session: SessionId) -> Result<Vec<(UserId, f64)>, HotStoreError> {
        let mut conn = self.conn().await?;
        let pairs: Vec<(String, f64)> = self
            .timed(
                redis::cmd("ZREVRANGE")
                    .arg(ranking_key(session))
                    .arg(0)
                    .arg(-1)
                    .arg("WITHSCORES")
                    .query_async(&mut conn),
            )
            .await?;
        Ok(parse_members(pairs))
    }

    async fn bid_records(
        &self,
        session: SessionId,
        users: &[UserId],
    ) -> Result<Vec<Option<BidRecord>>, HotStoreError> {
        if users.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        for user in users {
            pipe.hgetall(bid_key(session, *user));
        }
        let maps: Vec<HashMap<String, String>> = self.timed(pipe.query_async(&mut conn)).await?;

        Ok(maps
            .iter()
            .zip(users)
            .map(|(fields, user)| {
                if fields.is_empty() {
                    return None;
                }
                match parse_bid_record(fields) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        tracing::warn!(?err, %session, %user, "dropping malformed bid hash");
                        None
                    }
                }
            })
            .collect())
    }

    async fn snapshot_and_clear_dirty(&self) -> Result<Vec<SessionId>, HotStoreError> {
        let mut conn = self.conn().await?;

        // Read and clear must be one atomic unit; a bid arriving afterwards
        // re-adds its session on its own.
        let mut pipe = redis::pipe();
        pipe.atomic().smembers(DIRTY_SESSIONS).del(DIRTY_SESSIONS).ignore();
        let (members,): (Vec<String>,) = self.timed(pipe.query_async(&mut conn)).await?;

        Ok(members
            .into_iter()
            .filter_map(|member| match member.parse() {
                Ok(session) => Some(session),
                Err(_) => {
                    tracing::warn!(%member, "dropping malformed dirty session id");
                    None
                }
            })
            .collect())
    }

    async fn mark_dirty(&self, session: SessionId) -> Result<(), HotStoreError> {
        let mut conn = self.conn().await?;
        self.timed(conn.sadd(DIRTY_SESSIONS, session.to_string()))
            .await
    }

    async fn scan_bid_metadata(
        &self,
        session: SessionId,
    ) -> Result<Vec<BidMetadata>, HotStoreError> {
        let mut conn = self.conn().await?;
        let pattern = format!("bid_metadata:{session}:*");

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .timed(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(key);
        }
        let maps: Vec<HashMap<String, String>> = self.timed(pipe.query_async(&mut conn)).await?;

        Ok(maps
            .iter()
            .zip(&keys)
            .filter_map(|(fields, key)| {
                if fields.is_empty() {
                    // Expired between scan and fetch.
                    return None;
                }
                match BidMetadata::from_fields(fields) {
                    Ok(metadata) => Some(metadata),
                    Err(err) => {
                        tracing::warn!(?err, %key, "skipping malformed bid metadata");
                        None
                    }
                }
            })
            .collect())
    }

    async fn delete_bid_metadata(
        &self,
        session: SessionId,
        users: &[UserId],
    ) -> Result<(), HotStoreError> {
        if users.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let keys: Vec<_> = users
            .iter()
            .map(|user| bid_metadata_key(session, *user))
            .collect();
        self.timed(conn.del(keys)).await
    }

    async fn cached_session_params(
        &self,
        session: SessionId,
    ) -> Result<Option<SessionParams>, HotStoreError> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> =
            self.timed(conn.hgetall(session_params_key(session))).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        match parse_session_params(session, &fields) {
            Ok(params) => Ok(Some(params)),
            Err(err) => {
                tracing::warn!(?err, %session, "ignoring malformed cached session params");
                Ok(None)
            }
        }
    }

    async fn cache_session_params(&self, params: &SessionParams) -> Result<(), HotStoreError> {
        let mut conn = self.conn().await?;
        let key = session_params_key(params.id);

        let mut pipe = redis::pipe();
        pipe.hset_multiple(
            &key,
            &[
                ("product_id", params.product_id.to_string()),
                ("reserve_price", params.reserve_price.to_string()),
                ("inventory", params.inventory.to_string()),
                ("alpha", params.alpha.to_string()),
                ("beta", params.beta.to_string()),
                ("gamma", params.gamma.to_string()),
                ("start_time", params.start_time.to_rfc3339()),
                ("end_time", params.end_time.to_rfc3339()),
            ],
        )
        .ignore()
        .expire(&key, SESSION_PARAMS_TTL.as_secs() as i64)
        .ignore();

        self.timed(pipe.query_async::<_, ()>(&mut conn)).await
    }

    async fn cached_activity(
        &self,
        session: SessionId,
    ) -> Result<Option<ActivityFlag>, HotStoreError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = self.timed(conn.get(session_active_key(session))).await?;
        Ok(value.as_deref().and_then(ActivityFlag::from_str))
    }

    async fn cache_activity(
        &self,
        session: SessionId,
        flag: ActivityFlag,
    ) -> Result<(), HotStoreError> {
        let mut conn = self.conn().await?;
        self.timed(conn.set_ex(
            session_active_key(session),
            flag.as_str(),
            flag.ttl().as_secs(),
        ))
        .await
    }

    async fn cached_usernames(
        &self,
        users: &[UserId],
    ) -> Result<Vec<Option<String>>, HotStoreError> {
        if users.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        for user in users {
            pipe.hget(user_key(*user), "username");
        }
        self.timed(pipe.query_async(&mut conn)).await
    }

    async fn cache_usernames(&self, entries: &[(UserId, String)]) -> Result<(), HotStoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        for (user, username) in entries {
            let key = user_key(*user);
            pipe.hset(&key, "username", username)
                .ignore()
                .expire(&key, USERNAME_TTL.as_secs() as i64)
                .ignore();
        }
        self.timed(pipe.query_async::<_, ()>(&mut conn)).await
    }

    async fn is_alive(&self) -> bool {
        let Ok(mut conn) = self.conn().await else {
            return false;
        };
        self.timed(redis::cmd("PING").query_async::<_, String>(&mut conn))
            .await
            .is_ok()
    }
}

fn parse_members(pairs: Vec<(String, f64)>) -> Vec<(UserId, f64)> {
    pairs
        .into_iter()
        .filter_map(|(member, score)| match member.parse() {
            Ok(user) => Some((user, score)),
            Err(_) => {
                tracing::warn!(%member, "dropping malformed scoreboard member");
                None
            }
        })
        .collect()
}

fn parse_bid_record(fields: &HashMap<String, String>) -> anyhow::Result<BidRecord> {
    Ok(BidRecord {
        price: fields
            .get("price")
            .context("missing price")?
            .parse()
            .context("malformed price")?,
        score: fields
            .get("score")
            .context("missing score")?
            .parse()
            .context("malformed score")?,
        updated_at: parse_timestamp(fields.get("updated_at").context("missing updated_at")?)?,
    })
}

fn parse_session_params(
    session: SessionId,
    fields: &HashMap<String, String>,
) -> anyhow::Result<SessionParams> {
    let field = |name: &str| fields.get(name).with_context(|| format!("missing {name}"));
    Ok(SessionParams {
        id: session,
        product_id: field("product_id")?
            .parse::<ProductId>()
            .context("malformed product_id")?,
        reserve_price: field("reserve_price")?
            .parse()
            .context("malformed reserve_price")?,
        inventory: field("inventory")?.parse().context("malformed inventory")?,
        alpha: field("alpha")?.parse().context("malformed alpha")?,
        beta: field("beta")?.parse().context("malformed beta")?,
        gamma: field("gamma")?.parse().context("malformed gamma")?,
        start_time: parse_timestamp(field("start_time")?)?,
        end_time: parse_timestamp(field("end_time")?)?,
    })
}

fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("malformed timestamp {value:?}"))?
        .with_timezone(&Utc))
}
