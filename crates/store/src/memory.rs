//! In-process store.
//!
//! Backs push-mode runs without infrastructure and every engine test. State
//! lives behind a single mutex; no call holds it across an await point.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use pushgate_common::error::AppError;
use pushgate_common::types::{App, Notification, TokenFeedback};

use crate::{Result, StatusUpdate, Store};

#[derive(Debug, Default)]
struct MemoryState {
    apps: Vec<App>,
    notifications: HashMap<Uuid, Notification>,
    claimed: HashSet<Uuid>,
    feedback: Vec<TokenFeedback>,
    history: HashMap<Uuid, Vec<StatusUpdate>>,
}

/// Mutex-guarded in-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an app.
    pub fn upsert_app(&self, app: App) {
        let mut state = self.state.lock();
        match state.apps.iter_mut().find(|a| a.id == app.id) {
            Some(existing) => *existing = app,
            None => state.apps.push(app),
        }
    }

    pub fn remove_app(&self, app_id: Uuid) {
        self.state.lock().apps.retain(|a| a.id != app_id);
    }

    pub fn app(&self, app_id: Uuid) -> Option<App> {
        self.state.lock().apps.iter().find(|a| a.id == app_id).cloned()
    }

    pub fn insert_notification(&self, notification: Notification) {
        self.state
            .lock()
            .notifications
            .insert(notification.id, notification);
    }

    pub fn notification(&self, id: Uuid) -> Option<Notification> {
        self.state.lock().notifications.get(&id).cloned()
    }

    /// All notifications of an app, oldest first.
    pub fn notifications_for(&self, app_id: Uuid) -> Vec<Notification> {
        let state = self.state.lock();
        let mut found: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.app_id == app_id)
            .cloned()
            .collect();
        found.sort_by_key(|n| n.created_at);
        found
    }

    pub fn is_claimed(&self, id: Uuid) -> bool {
        self.state.lock().claimed.contains(&id)
    }

    /// Every status update written for a notification, in order.
    pub fn history(&self, id: Uuid) -> Vec<StatusUpdate> {
        self.state
            .lock()
            .history
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn token_feedback(&self) -> Vec<TokenFeedback> {
        self.state.lock().feedback.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_apps(&self) -> Result<Vec<App>> {
        Ok(self.state.lock().apps.clone())
    }

    async fn fetch_due_notifications(
        &self,
        app: &App,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let mut state = self.state.lock();
        let mut due: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.app_id == app.id && n.is_due(now) && !state.claimed.contains(&n.id))
            .cloned()
            .collect();
        due.sort_by_key(|n| n.created_at);
        due.truncate(limit);

        for n in &due {
            state.claimed.insert(n.id);
        }
        Ok(due)
    }

    async fn update_status(
        &self,
        notification: &Notification,
        update: &StatusUpdate,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let stored = state
            .notifications
            .get_mut(&notification.id)
            .ok_or_else(|| AppError::NotFound(format!("Notification {}", notification.id)))?;
        update.apply(stored);
        state.claimed.remove(&notification.id);
        state
            .history
            .entry(notification.id)
            .or_default()
            .push(update.clone());
        Ok(())
    }

    async fn create_notification(&self, notification: &Notification) -> Result<()> {
        self.insert_notification(notification.clone());
        Ok(())
    }

    async fn update_app(&self, app: &App) -> Result<()> {
        let mut state = self.state.lock();
        let stored = state
            .apps
            .iter_mut()
            .find(|a| a.id == app.id)
            .ok_or_else(|| AppError::NotFound(format!("App {}", app.id)))?;
        *stored = app.clone();
        Ok(())
    }

    async fn record_token_feedback(&self, feedback: &TokenFeedback) -> Result<()> {
        self.state.lock().feedback.push(feedback.clone());
        Ok(())
    }

    async fn release_stale_claims(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let released = state.claimed.len() as u64;
        state.claimed.clear();
        Ok(released)
    }
}
