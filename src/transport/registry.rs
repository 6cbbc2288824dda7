//! Session Registry
//!
//! Maps node ids to live sessions. A slot holding `None` is a tombstone: the
//! session dropped unexpectedly and the client dial loop is allowed to
//! reconnect it. Explicit closes remove the slot entirely.
//!
//! Every mutation republishes the usable-session count on a `watch` channel,
//! which is what `request` callers and the dial loop wait on.

use super::session::Session;
use super::types::NodeId;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::watch;

pub struct SessionRegistry {
    sessions: DashMap<NodeId, Option<Arc<Session>>>,
    usable: watch::Sender<usize>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            sessions: DashMap::new(),
            usable: watch::Sender::new(0),
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Binds `id` to `session`, returning the live session it displaced.
    pub fn insert(&self, id: NodeId, session: Arc<Session>) -> Option<Arc<Session>> {
        let previous = self.sessions.insert(id, Some(session)).flatten();
        self.refresh();
        previous
    }

    /// Marks a registered session as usable and wakes waiters.
    pub fn activate(&self, session: &Session) {
        session.mark_usable();
        self.refresh();
    }

    /// Live session for `id`. Tombstones and sessions already told to close are skipped.
    pub fn get(&self, id: &NodeId) -> Option<Arc<Session>> {
        self.sessions
            .get(id)
            .and_then(|entry| entry.value().clone())
            .filter(|session| !session.cancel_token().is_cancelled())
    }

    /// True for live sessions and tombstones alike.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Removes `session` from `id` if that slot still holds it.
    ///
    /// With `reconnect` the slot is tombstoned instead of deleted. Returns
    /// whether this call did the removal, so only one worker logs it.
    pub fn remove(&self, id: &NodeId, session: &Arc<Session>, reconnect: bool) -> bool {
        let removed = if reconnect {
            match self.sessions.get_mut(id) {
                Some(mut slot) if holds(slot.value(), session) => {
                    *slot = None;
                    true
                }
                _ => false,
            }
        } else {
            self.sessions
                .remove_if(id, |_, slot| holds(slot, session))
                .is_some()
        };

        if removed {
            self.refresh();
        }
        removed
    }

    /// Permanently removes whatever `id` maps to.
    pub fn take(&self, id: &NodeId) -> Option<Arc<Session>> {
        let taken = self.sessions.remove(id).and_then(|(_, slot)| slot);
        self.refresh();
        taken
    }

    /// Permanently removes every entry.
    pub fn drain(&self) -> Vec<(NodeId, Arc<Session>)> {
        let ids: Vec<NodeId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        let drained = ids
            .into_iter()
            .filter_map(|id| {
                self.sessions
                    .remove(&id)
                    .and_then(|(id, slot)| slot.map(|session| (id, session)))
            })
            .collect();
        self.refresh();
        drained
    }

    pub fn count_usable(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().as_ref().is_some_and(|s| s.is_usable()))
            .count()
    }

    pub fn usable_ids(&self) -> Vec<NodeId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().as_ref().is_some_and(|s| s.is_usable()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Receiver that observes the usable-session count.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.usable.subscribe()
    }

    pub fn refresh(&self) {
        self.usable.send_replace(self.count_usable());
    }

    /// Waits until `id` has a usable session.
    pub async fn wait_for(&self, id: &NodeId) -> Arc<Session> {
        let mut changes = self.subscribe();
        loop {
            if let Some(session) = self.get(id).filter(|s| s.is_usable()) {
                return session;
            }
            if changes.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Waits until any session is usable and picks one at random.
    pub async fn wait_for_any(&self) -> NodeId {
        let mut changes = self.subscribe();
        loop {
            let ids = self.usable_ids();
            if let Some(id) = ids.choose(&mut rand::thread_rng()) {
                return id.clone();
            }
            if changes.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Waits until no session is usable.
    pub async fn wait_until_empty(&self) {
        let mut changes = self.subscribe();
        let _ = changes.wait_for(|count| *count == 0).await;
    }
}

fn holds(slot: &Option<Arc<Session>>, session: &Arc<Session>) -> bool {
    slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, session))
}
