//! Interfaces the core consumes from the host application.

use log::info;
use parking_lot::RwLock;

/// Current login session (auth token, store id).
pub trait SessionProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn store_id(&self) -> Option<String>;
}

/// Receives decoded alerts. Fire-and-forget.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, body: &str, badge: u32);
}

/// Session credentials held in memory, e.g. loaded from config.
#[derive(Debug, Default)]
pub struct StaticSession {
    access_token: RwLock<Option<String>>,
    store_id: RwLock<Option<String>>,
}

impl StaticSession {
    pub fn new(access_token: Option<String>, store_id: Option<String>) -> Self {
        Self {
            access_token: RwLock::new(access_token),
            store_id: RwLock::new(store_id),
        }
    }

    pub fn save(&self, access_token: String, store_id: String) {
        *self.access_token.write() = Some(access_token);
        *self.store_id.write() = Some(store_id);
    }

    pub fn clear(&self) {
        *self.access_token.write() = None;
        *self.store_id.write() = None;
    }
}

impl SessionProvider for StaticSession {
    fn access_token(&self) -> Option<String> {
        self.access_token.read().clone()
    }

    fn store_id(&self) -> Option<String> {
        self.store_id.read().clone()
    }
}

/// Writes notifications to the log instead of presenting them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn notify(&self, title: &str, body: &str, badge: u32) {
        info!("[{}] {} (badge {})", title, body, badge);
    }
}
