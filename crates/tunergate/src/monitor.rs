use std::sync::Arc;
use std::time::Duration;
use tunergate_core::clock::Clock;
use tunergate_core::sessions::SessionStore;
use tracing::{debug, info};

/// How long terminal records stay visible before housekeeping removes them
const TERMINAL_RETENTION_SECS: i64 = 3_600;

/// Periodic session housekeeping: reports activity and prunes old terminal
/// records. Idle sessions are only hidden from listings by the store, never
/// terminated here.
pub struct BackgroundMonitor {
    store: Arc<SessionStore>,
    clock: Arc<dyn Clock>,
    idle_timeout_secs: i64,
}

impl BackgroundMonitor {
    pub fn new(store: Arc<SessionStore>, clock: Arc<dyn Clock>, idle_timeout_secs: i64) -> Self {
        Self {
            store,
            clock,
            idle_timeout_secs,
        }
    }

    pub async fn check(&mut self) -> anyhow::Result<()> {
        let now = self.clock.now_unix();
        let all = self.store.list();
        let active = self.store.list_active(self.idle_timeout_secs).len();

        let mut pruned = 0;
        for record in &all {
            if record.state.is_terminal() && now - record.updated_at > TERMINAL_RETENTION_SECS {
                if self.store.delete(&record.id).is_ok() {
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            info!(pruned, "pruned terminal session records");
        }
        debug!(total = all.len(), active, "session sweep");
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(30)
    }
}
