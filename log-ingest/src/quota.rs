// Per (tenant, app) admission counter over calendar minutes.
//
// Admission is a compare-and-swap on the current minute's counter, so the
// count of a window never exceeds the limit and the hot path never waits on
// I/O. Windows live in memory only; a restart resets all quotas.
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// Past this many tracked keys, windows older than the previous minute are pruned.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug)]
struct QuotaWindow {
    epoch_minute: u64,
    count: AtomicU64,
}

impl QuotaWindow {
    fn new(epoch_minute: u64) -> Self {
        QuotaWindow {
            epoch_minute,
            count: AtomicU64::new(0),
        }
    }
}

pub struct MinuteQuota {
    limit: u64,
    windows: RwLock<HashMap<String, Arc<QuotaWindow>>>,
}

impl MinuteQuota {
    /// A limit below 1 is treated as 1; the limiter cannot be disabled.
    pub fn new(limit_per_minute: i64) -> Self {
        MinuteQuota {
            limit: limit_per_minute.max(1) as u64,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn try_acquire(&self, tenant_id: &str, app_id: &str, size: u64) -> bool {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.try_acquire_at(tenant_id, app_id, size, now)
    }

    /// Admits `size` units for the minute containing `now_epoch_secs`.
    pub fn try_acquire_at(&self, tenant_id: &str, app_id: &str, size: u64, now_epoch_secs: u64) -> bool {
        if size == 0 {
            return true;
        }
        if size > self.limit {
            return false;
        }

        let window = self.window(&format!("{tenant_id}|{app_id}"), now_epoch_secs / 60);

        let mut current = window.count.load(Ordering::Acquire);
        loop {
            let next = current + size;
            if next > self.limit {
                return false;
            }
            match window.count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns the window for `minute`, replacing an older one. A caller that
    /// arrives late with a previous minute is charged against the newer window.
    fn window(&self, key: &str, minute: u64) -> Arc<QuotaWindow> {
        if let Some(window) = self.windows.read().get(key)
            && window.epoch_minute >= minute
        {
            return window.clone();
        }

        let mut windows = self.windows.write();
        if windows.len() >= PRUNE_THRESHOLD {
            windows.retain(|_, w| w.epoch_minute + 1 >= minute);
        }

        let window = windows
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(QuotaWindow::new(minute)));
        if window.epoch_minute < minute {
            *window = Arc::new(QuotaWindow::new(minute));
        }
        window.clone()
    }
}
