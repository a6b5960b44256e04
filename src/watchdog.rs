use crate::core::clock::to_chrono;
use crate::core::{Clock, CoordinationError, Result};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub type ExpirationCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Fires once a locally held lease runs out.
///
/// Each [`arm`](Self::arm) starts a single-shot timer for one work item. When
/// the deadline passes before the returned [`LeaseGuard`] is disarmed, the
/// guard's cancellation token is cancelled and the expiration callback runs
/// with the work item id. Hosts that must not outlive their lease pass a
/// callback that exits the process; embedded hosts watch the token instead.
///
/// Arming again replaces the previous timer: only one lease is watched at a
/// time.
pub struct LeaseExpirationWatchdog {
    clock: Arc<dyn Clock>,
    on_expired: ExpirationCallback,
    current: Mutex<Option<CancellationToken>>,
}

impl LeaseExpirationWatchdog {
    pub fn new<F>(clock: Arc<dyn Clock>, on_expired: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            clock,
            on_expired: Arc::new(on_expired),
            current: Mutex::new(None),
        }
    }

    /// A watchdog whose only effect on expiry is cancelling the guard's token.
    pub fn cancel_only(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, |_| {})
    }

    pub fn arm(&self, work_item_id: &str, deadline: DateTime<Utc>) -> LeaseGuard {
        let superseded = CancellationToken::new();
        {
            let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(previous) = current.replace(superseded.clone()) {
                previous.cancel();
            }
        }

        let delay = (deadline - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        let expired = CancellationToken::new();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let id = work_item_id.to_string();
        let token = expired.clone();
        let on_expired = self.on_expired.clone();
        let join_handle = tokio::spawn(async move {
            tokio::select! {
                _ = &mut stop_rx => {}
                _ = superseded.cancelled() => {
                    debug!(work_item_id = %id, "Lease watchdog replaced by a newer lease");
                }
                _ = sleep(delay) => {
                    error!(
                        work_item_id = %id,
                        deadline = %deadline,
                        "Lease expired before work on the item finished"
                    );
                    token.cancel();
                    on_expired(&id);
                }
            }
        });

        debug!(
            work_item_id = %work_item_id,
            deadline = %deadline,
            delay_ms = delay.as_millis() as u64,
            "Armed lease watchdog"
        );

        LeaseGuard {
            work_item_id: work_item_id.to_string(),
            deadline,
            expired,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    /// Arms for `lease_expiry` moved earlier by `margin`.
    pub fn arm_with_margin(
        &self,
        work_item_id: &str,
        lease_expiry: DateTime<Utc>,
        margin: Duration,
    ) -> LeaseGuard {
        let deadline = lease_expiry
            .checked_sub_signed(to_chrono(margin))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.arm(work_item_id, deadline)
    }
}

/// Live timer for one leased work item. Dropping the guard disarms it.
pub struct LeaseGuard {
    work_item_id: String,
    deadline: DateTime<Utc>,
    expired: CancellationToken,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    pub fn work_item_id(&self) -> &str {
        &self.work_item_id
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Cancelled when the lease deadline passes while armed.
    pub fn token(&self) -> CancellationToken {
        self.expired.clone()
    }

    pub fn is_expired(&self) -> bool {
        self.expired.is_cancelled()
    }

    pub fn is_armed(&self) -> bool {
        self.stop_tx.is_some()
    }

    /// Stops the timer. Safe to call any number of times.
    pub fn disarm(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
            debug!(work_item_id = %self.work_item_id, "Disarmed lease watchdog");
        }
    }

    /// Disarms and waits for the timer task to finish.
    pub async fn stop(mut self) -> Result<()> {
        self.disarm();
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.await.map_err(|err| {
                CoordinationError::Backend(format!("lease watchdog join: {}", err))
            })?;
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.disarm();
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SystemClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_watchdog() -> (LeaseExpirationWatchdog, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let ids = Arc::new(Mutex::new(Vec::new()));
        let fired_in_cb = fired.clone();
        let ids_in_cb = ids.clone();
        let watchdog = LeaseExpirationWatchdog::new(Arc::new(SystemClock), move |id: &str| {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
            ids_in_cb.lock().unwrap().push(id.to_string());
        });
        (watchdog, fired, ids)
    }

    #[tokio::test]
    async fn test_fires_after_deadline() {
        let (watchdog, fired, ids) = counting_watchdog();
        let guard = watchdog.arm("logs__0__0", Utc::now() + chrono::Duration::milliseconds(30));
        let token = guard.token();

        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;

        assert!(guard.is_expired());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(ids.lock().unwrap().as_slice(), ["logs__0__0".to_string()]);
    }

    #[tokio::test]
    async fn test_disarm_prevents_firing() {
        let (watchdog, fired, _) = counting_watchdog();
        let mut guard = watchdog.arm("a", Utc::now() + chrono::Duration::milliseconds(30));
        guard.disarm();
        guard.disarm();
        assert!(!guard.is_armed());

        sleep(Duration::from_millis(80)).await;
        assert!(!guard.is_expired());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_disarms() {
        let (watchdog, fired, _) = counting_watchdog();
        {
            let _guard = watchdog.arm("a", Utc::now() + chrono::Duration::milliseconds(30));
        }
        sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rearming_replaces_previous_timer() {
        let (watchdog, fired, ids) = counting_watchdog();
        let first = watchdog.arm("first", Utc::now() + chrono::Duration::milliseconds(30));
        let second = watchdog.arm("second", Utc::now() + chrono::Duration::milliseconds(60));

        sleep(Duration::from_millis(150)).await;
        assert!(!first.is_expired());
        assert!(second.is_expired());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(ids.lock().unwrap().as_slice(), ["second".to_string()]);
    }

    #[tokio::test]
    async fn test_past_deadline_fires_immediately() {
        let watchdog = LeaseExpirationWatchdog::cancel_only(Arc::new(SystemClock));
        let guard = watchdog.arm_with_margin("a", Utc::now(), Duration::from_secs(5));
        tokio::time::timeout(Duration::from_secs(1), guard.token().cancelled())
            .await
            .unwrap();
        assert!(guard.is_expired());
    }

    #[tokio::test]
    async fn test_stop_waits_for_timer_task() {
        let watchdog = LeaseExpirationWatchdog::cancel_only(Arc::new(SystemClock));
        let guard = watchdog.arm("a", Utc::now() + chrono::Duration::seconds(60));
        guard.stop().await.unwrap();
    }
}
