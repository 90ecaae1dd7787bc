use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::JobTracker;
use tokio_rusqlite::Connection;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub tracker: JobTracker,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Connection) -> Self {
        Self {
            config: Arc::new(config),
            db,
            tracker: JobTracker::new(),
        }
    }
}
