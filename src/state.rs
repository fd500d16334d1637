use std::sync::Arc;

use sqlx::SqlitePool;

use crate::reminders::{Notifier, ReminderScheduler};
use crate::security::{BiometricProbe, SecretStore, SecurityGate};
use crate::store::Store;

/// Everything a request handler needs, wired once at startup and cloned
/// cheaply per task.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub scheduler: Arc<ReminderScheduler>,
    pub gate: Arc<SecurityGate>,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        notifier: Arc<dyn Notifier>,
        secrets: Arc<dyn SecretStore>,
        biometrics: Arc<dyn BiometricProbe>,
    ) -> Self {
        AppState {
            store: Store::new(pool),
            scheduler: Arc::new(ReminderScheduler::new(notifier)),
            gate: Arc::new(SecurityGate::new(secrets, biometrics)),
        }
    }
}
