use crate::bus::{ClientEvent, EventBus};
use crate::config::Timings;
use crate::connection::ConnectionManager;
use crate::entity::{Id, Identity};
use crate::protocol::{frame, Liveness, PresenceUpdate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Id,
    pub user_name: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub is_online: bool,
    pub avatar: Option<String>,
}

impl PresenceRecord {
    /// Online and seen within `window`.
    pub fn is_fresh(&self, window: Duration) -> bool {
        if !self.is_online {
            return false;
        }
        match Utc::now().signed_duration_since(self.last_seen_at).to_std() {
            Ok(age) => age <= window,
            // Timestamp in the future: clock skew, treat as just seen.
            Err(_) => true,
        }
    }
}

/// Peer online/offline view plus the local heartbeat and activity signals.
#[derive(Clone)]
pub struct PresenceTracker {
    me: Identity,
    inner: Arc<Mutex<PresenceState>>,
    conn: ConnectionManager,
    bus: EventBus,
    heartbeat_interval: Duration,
    stale_after: Duration,
    throttle: Duration,
}

#[derive(Default)]
struct PresenceState {
    records: HashMap<Id, PresenceRecord>,
    heartbeat: Option<JoinHandle<()>>,
    last_activity: Option<Instant>,
}

impl PresenceTracker {
    pub fn new(me: Identity, conn: ConnectionManager, bus: EventBus, timings: &Timings) -> Self {
        Self {
            me,
            inner: Arc::new(Mutex::new(PresenceState::default())),
            conn,
            bus,
            heartbeat_interval: timings.heartbeat_interval,
            stale_after: timings.presence_stale_after,
            throttle: timings.activity_throttle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PresenceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark ourselves online and start the heartbeat.
    pub fn start(&self) {
        self.upsert(self.own_update(), true);

        let tracker = self.clone();
        let period = self.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracker.beat();
            }
        });
        if let Some(old) = self.lock().heartbeat.replace(task) {
            old.abort();
        }
    }

    /// Stop the heartbeat and mark ourselves offline locally.
    pub fn stop(&self) {
        let task = {
            let mut state = self.lock();
            state.last_activity = None;
            state.heartbeat.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.upsert(self.own_update(), false);
    }

    fn beat(&self) {
        if !self.conn.is_connected() {
            return;
        }
        self.conn.send(frame::HEARTBEAT, &self.liveness());
        self.upsert(self.own_update(), true);
    }

    /// Local input signal, throttled. Returns whether an activity update went out.
    pub fn record_interaction(&self) -> bool {
        let now = Instant::now();
        {
            let mut state = self.lock();
            if let Some(last) = state.last_activity {
                if now.duration_since(last) < self.throttle {
                    return false;
                }
            }
            state.last_activity = Some(now);
        }
        self.upsert(self.own_update(), true);
        self.conn.send(frame::USER_ACTIVITY, &self.liveness());
        true
    }

    pub fn handle_online(&self, update: PresenceUpdate) {
        self.upsert(update, true);
    }

    pub fn handle_offline(&self, update: PresenceUpdate) {
        self.upsert(update, false);
    }

    /// Activity implies the peer is online.
    pub fn handle_activity(&self, update: PresenceUpdate) {
        self.upsert(update, true);
    }

    /// Connect-time snapshot of everyone online. Anyone else not listed goes offline.
    pub fn handle_snapshot(&self, users: Vec<PresenceUpdate>) {
        debug!("Presence snapshot with {} users", users.len());
        let listed: HashSet<Id> = users.iter().map(|u| u.user_id.clone()).collect();
        let gone: Vec<Id> = {
            let mut state = self.lock();
            let gone = state
                .records
                .values_mut()
                .filter(|r| r.is_online && r.user_id != self.me.user_id)
                .filter(|r| !listed.contains(&r.user_id))
                .map(|r| {
                    r.is_online = false;
                    r.user_id.clone()
                })
                .collect();
            gone
        };
        for user_id in gone {
            self.bus.publish(ClientEvent::PresenceChanged {
                user_id,
                online: false,
            });
        }
        for update in users {
            self.upsert(update, true);
        }
    }

    pub fn is_user_online(&self, user_id: &Id) -> bool {
        self.lock()
            .records
            .get(user_id)
            .map(|r| r.is_fresh(self.stale_after))
            .unwrap_or(false)
    }

    pub fn record(&self, user_id: &Id) -> Option<PresenceRecord> {
        self.lock().records.get(user_id).cloned()
    }

    pub fn online_users(&self) -> Vec<PresenceRecord> {
        self.lock()
            .records
            .values()
            .filter(|r| r.is_fresh(self.stale_after))
            .cloned()
            .collect()
    }

    pub fn heartbeat_running(&self) -> bool {
        self.lock()
            .heartbeat
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    fn own_update(&self) -> PresenceUpdate {
        PresenceUpdate {
            user_id: self.me.user_id.clone(),
            user_name: Some(self.me.name.clone()),
            avatar: None,
            timestamp: None,
        }
    }

    fn liveness(&self) -> Liveness {
        Liveness {
            user_id: self.me.user_id.clone(),
            timestamp: Utc::now(),
        }
    }

    fn upsert(&self, update: PresenceUpdate, online: bool) {
        let seen = update.timestamp.unwrap_or_else(Utc::now);
        let flipped = {
            let mut state = self.lock();
            let record = state
                .records
                .entry(update.user_id.clone())
                .or_insert_with(|| PresenceRecord {
                    user_id: update.user_id.clone(),
                    user_name: None,
                    last_seen_at: seen,
                    is_online: !online,
                    avatar: None,
                });
            if update.user_name.is_some() {
                record.user_name = update.user_name;
            }
            if update.avatar.is_some() {
                record.avatar = update.avatar;
            }
            if seen > record.last_seen_at {
                record.last_seen_at = seen;
            }
            std::mem::replace(&mut record.is_online, online) != online
        };
        if flipped {
            self.bus.publish(ClientEvent::PresenceChanged {
                user_id: update.user_id,
                online,
            });
        }
    }
}
