//! Fan-out of leaderboard snapshots to per-session subscribers plus a
//! global session-list topic. Notification from the write path is a cheap
//! synchronous marker; an off-path task renders snapshots and delivers
//! them, coalescing bursts of changes into one snapshot per flush.

use {
    crate::{database::Persisting, leaderboard::LeaderboardReader},
    chrono::{DateTime, Utc},
    database::sessions::SessionWithProduct,
    model::{
        leaderboard::Leaderboard,
        session::SessionSummary,
        SessionId,
    },
    std::{
        collections::{HashMap, HashSet},
        sync::{Arc, Mutex},
    },
    tokio::sync::{mpsc, Notify},
};

/// Outbound queue bound per subscriber. A subscriber that falls this far
/// behind is closed rather than allowed to block or bloat the process.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 8;

#[derive(Clone, Debug, PartialEq)]
pub enum PushEvent {
    Leaderboard(Leaderboard),
    SessionList(Vec<SessionSummary>),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
enum Topic {
    Session(SessionId),
    SessionList,
}

#[derive(Clone, Debug)]
pub struct SubscriberHandle {
    topic: Topic,
    id: u64,
}

pub struct Subscription {
    pub handle: SubscriberHandle,
    pub receiver: mpsc::Receiver<PushEvent>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<Topic, HashMap<u64, mpsc::Sender<PushEvent>>>,
}

#[derive(Default)]
struct Changes {
    sessions: HashSet<SessionId>,
    session_list: bool,
}

#[derive(Default)]
pub struct Broadcaster {
    registry: Mutex<Registry>,
    changes: Mutex<Changes>,
    wakeup: Notify,
}

impl Broadcaster {
    pub fn subscribe(&self, session: SessionId) -> Subscription {
        self.subscribe_topic(Topic::Session(session))
    }

    pub fn subscribe_session_list(&self) -> Subscription {
        self.subscribe_topic(Topic::SessionList)
    }

    fn subscribe_topic(&self, topic: Topic) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let mut registry = self.registry.lock().unwrap();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.topics.entry(topic).or_default().insert(id, sender);
        Subscription {
            handle: SubscriberHandle { topic, id },
            receiver,
        }
    }

    pub fn unsubscribe(&self, handle: &SubscriberHandle) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(subscribers) = registry.topics.get_mut(&handle.topic) {
            subscribers.remove(&handle.id);
            if subscribers.is_empty() {
                registry.topics.remove(&handle.topic);
            }
        }
    }

    /// Marks the session's leaderboard changed. Never blocks; called from
    /// the bid write path.
    pub fn notify_leaderboard(&self, session: SessionId) {
        self.changes.lock().unwrap().sessions.insert(session);
        self.wakeup.notify_one();
    }

    /// Marks the global session list changed (creation, state change).
    pub fn notify_session_list(&self) {
        self.changes.lock().unwrap().session_list = true;
        self.wakeup.notify_one();
    }

    fn has_subscribers(&self, topic: Topic) -> bool {
        self.registry
            .lock()
            .unwrap()
            .topics
            .get(&topic)
            .is_some_and(|subscribers| !subscribers.is_empty())
    }

    /// Delivers an event to every subscriber of a topic. Full or closed
    /// queues drop the subscriber; delivery never waits.
    fn deliver(&self, topic: Topic, event: &PushEvent) {
        let subscribers: Vec<(u64, mpsc::Sender<PushEvent>)> = {
            let registry = self.registry.lock().unwrap();
            match registry.topics.get(&topic) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|(id, sender)| (*id, sender.clone()))
                    .collect(),
                None => return,
            }
        };

        let mut dropped = Vec::new();
        for (id, sender) in subscribers {
            match sender.try_send(event.clone()) {
                Ok(()) => (),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    Metrics::get().dropped_subscribers.inc();
                    tracing::debug!(?topic, id, "dropping subscriber that fell behind");
                    dropped.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(id),
            }
        }
        if !dropped.is_empty() {
            let mut registry = self.registry.lock().unwrap();
            if let Some(subscribers) = registry.topics.get_mut(&topic) {
                for id in dropped {
                    subscribers.remove(&id);
                }
            }
        }
    }

    /// One coalesced fan-out pass over everything marked changed since the
    /// previous pass.
    pub async fn flush(&self, reader: &LeaderboardReader, db: &dyn Persisting) {
        let (sessions, session_list) = {
            let mut changes = self.changes.lock().unwrap();
            (
                std::mem::take(&mut changes.sessions),
                std::mem::take(&mut changes.session_list),
            )
        };

        let snapshots = sessions
            .into_iter()
            .filter(|session| self.has_subscribers(Topic::Session(*session)))
            .map(|session| async move {
                match reader.leaderboard(session, 1, None).await {
                    Ok(leaderboard) => Some((session, leaderboard)),
                    Err(err) => {
                        tracing::warn!(?err, %session, "failed to render push snapshot");
                        None
                    }
                }
            });
        for (session, leaderboard) in futures::future::join_all(snapshots)
            .await
            .into_iter()
            .flatten()
        {
            self.deliver(Topic::Session(session), &PushEvent::Leaderboard(leaderboard));
        }

        if session_list && self.has_subscribers(Topic::SessionList) {
            match db.sessions_with_products().await {
                Ok(rows) => {
                    let now = Utc::now();
                    let summaries = rows
                        .into_iter()
                        .map(|row| session_summary(row, now))
                        .collect();
                    self.deliver(Topic::SessionList, &PushEvent::SessionList(summaries));
                }
                Err(err) => tracing::warn!(?err, "failed to render session list snapshot"),
            }
        }
    }

    pub async fn run_forever(
        self: Arc<Self>,
        reader: Arc<LeaderboardReader>,
        db: Arc<dyn Persisting>,
    ) -> ! {
        loop {
            self.wakeup.notified().await;
            self.flush(&reader, db.as_ref()).await;
        }
    }
}

pub fn session_summary(row: SessionWithProduct, now: DateTime<Utc>) -> SessionSummary {
    let session = row.session;
    let ended = !session.is_active || now >= session.end_time;
    SessionSummary {
        session_id: session.id,
        product_id: session.product_id,
        name: row.name,
        description: row.description,
        reserve_price: session.reserve_price,
        inventory: session.inventory,
        alpha: session.alpha,
        beta: session.beta,
        gamma: session.gamma,
        start_time: session.start_time,
        end_time: session.end_time,
        is_active: session.is_active,
        status: if ended { "ended" } else { "active" },
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "broadcast")]
struct Metrics {
    /// Subscribers dropped because their outbound queue overflowed.
    dropped_subscribers: prometheus::IntCounter,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            database::MockPersisting,
            hotstore::MockHotStoring,
            session_cache::SessionParamCache,
        },
        chrono::TimeZone,
        database::sessions::Session,
        model::ProductId,
    };

    fn leaderboard(session_id: SessionId) -> Leaderboard {
        Leaderboard {
            session_id,
            entries: Vec::new(),
            page: 1,
            page_size: 50,
            total: 0,
            total_pages: 0,
            highest_bid: None,
            threshold_score: None,
        }
    }

    #[tokio::test]
    async fn delivers_to_session_subscribers() {
        let broadcaster = Broadcaster::default();
        let session = SessionId::new_v4();
        let mut subscription = broadcaster.subscribe(session);

        broadcaster.deliver(
            Topic::Session(session),
            &PushEvent::Leaderboard(leaderboard(session)),
        );

        let event = subscription.receiver.try_recv().unwrap();
        assert!(matches!(event, PushEvent::Leaderboard(l) if l.session_id == session));
    }

    #[tokio::test]
    async fn slow_subscribers_are_dropped_not_awaited() {
        let broadcaster = Broadcaster::default();
        let session = SessionId::new_v4();
        let subscription = broadcaster.subscribe(session);

        for _ in 0..SUBSCRIBER_QUEUE_CAPACITY + 1 {
            broadcaster.deliver(
                Topic::Session(session),
                &PushEvent::Leaderboard(leaderboard(session)),
            );
        }

        assert!(!broadcaster.has_subscribers(Topic::Session(session)));
        drop(subscription);
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_subscriber() {
        let broadcaster = Broadcaster::default();
        let session = SessionId::new_v4();
        let subscription = broadcaster.subscribe(session);
        assert!(broadcaster.has_subscribers(Topic::Session(session)));

        broadcaster.unsubscribe(&subscription.handle);
        assert!(!broadcaster.has_subscribers(Topic::Session(session)));
    }

    #[tokio::test]
    async fn flush_skips_sessions_without_subscribers() {
        let broadcaster = Broadcaster::default();
        broadcaster.notify_leaderboard(SessionId::new_v4());

        // No subscribers anywhere: the reader must not be consulted, which
        // the mocks enforce by panicking on any unexpected call.
        let hot = Arc::new(MockHotStoring::new());
        let db = Arc::new(MockPersisting::new());
        let reader = LeaderboardReader::new(
            hot.clone(),
            db.clone(),
            Arc::new(SessionParamCache::new(hot, db.clone())),
        );
        broadcaster.flush(&reader, db.as_ref()).await;
    }

    #[tokio::test]
    async fn flush_coalesces_changes_into_one_snapshot() {
        let broadcaster = Broadcaster::default();
        let session_id = SessionId::new_v4();
        let mut subscription = broadcaster.subscribe(session_id);

        // Three bids, one flush: a single snapshot goes out.
        broadcaster.notify_leaderboard(session_id);
        broadcaster.notify_leaderboard(session_id);
        broadcaster.notify_leaderboard(session_id);

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let session = Session {
            id: session_id,
            product_id: ProductId::new_v4(),
            reserve_price: 200.,
            final_price: None,
            inventory: 5,
            alpha: 0.5,
            beta: 1000.,
            gamma: 2.,
            start_time: start,
            end_time: start + chrono::Duration::seconds(60),
            is_active: true,
        };
        let mut hot = MockHotStoring::new();
        hot.expect_cached_session_params().returning(|_| Ok(None));
        hot.expect_cache_session_params().returning(|_| Ok(()));
        hot.expect_leaderboard_page()
            .times(1)
            .returning(|_, _, _| Ok((Vec::new(), 0)));
        hot.expect_bid_records().returning(|_, _| Ok(Vec::new()));
        hot.expect_cached_usernames().returning(|_| Ok(Vec::new()));
        let mut db = MockPersisting::new();
        db.expect_session()
            .returning(move |_| Ok(Some(session.clone())));

        let hot = Arc::new(hot);
        let db = Arc::new(db);
        let reader = LeaderboardReader::new(
            hot.clone(),
            db.clone(),
            Arc::new(SessionParamCache::new(hot, db.clone())),
        );
        broadcaster.flush(&reader, db.as_ref()).await;

        assert!(subscription.receiver.try_recv().is_ok());
        assert!(subscription.receiver.try_recv().is_err());
    }

    #[test]
    fn session_summary_status_tracks_activity_and_window() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let end = start + chrono::Duration::seconds(60);
        let row = |is_active| SessionWithProduct {
            session: Session {
                id: SessionId::new_v4(),
                product_id: ProductId::new_v4(),
                reserve_price: 200.,
                final_price: None,
                inventory: 5,
                alpha: 0.5,
                beta: 1000.,
                gamma: 2.,
                start_time: start,
                end_time: end,
                is_active,
            },
            name: "widget".to_string(),
            description: "a widget".to_string(),
        };

        let inside = start + chrono::Duration::seconds(30);
        assert_eq!(session_summary(row(true), inside).status, "active");
        assert_eq!(session_summary(row(false), inside).status, "ended");
        assert_eq!(session_summary(row(true), end).status, "ended");
    }
}
