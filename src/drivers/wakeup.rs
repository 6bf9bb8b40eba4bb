//! Time-bounded wake-up window
//!
//! Some units answer a relock wake-up pulse by reporting "locked" for a few
//! seconds. While the window is open that report is presented as
//! [`ChargeStatus::Connected`] so the supervising loop does not see a
//! spurious state change. Any other report closes the window early.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::status::ChargeStatus;

#[derive(Debug)]
pub struct WakeUpWindow {
    duration: Duration,
    until: Mutex<Option<Instant>>,
}

impl WakeUpWindow {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            until: Mutex::new(None),
        }
    }

    pub fn open(&self) {
        *self.until.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now() + self.duration);
    }

    pub fn is_open(&self) -> bool {
        self.until
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|until| Instant::now() < until)
    }

    /// Status to report for a freshly read `status`.
    pub fn settle(&self, status: ChargeStatus) -> ChargeStatus {
        let mut until = self.until.lock().unwrap_or_else(|e| e.into_inner());

        match (status, *until) {
            (ChargeStatus::Locked, Some(deadline)) if Instant::now() < deadline => {
                ChargeStatus::Connected
            }
            _ => {
                *until = None;
                status
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_locked_masked_while_open() {
        let window = WakeUpWindow::new(Duration::from_secs(10));
        assert_eq!(window.settle(ChargeStatus::Locked), ChargeStatus::Locked);

        window.open();
        assert!(window.is_open());
        assert_eq!(window.settle(ChargeStatus::Locked), ChargeStatus::Connected);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(window.settle(ChargeStatus::Locked), ChargeStatus::Locked);
        assert!(!window.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_status_closes_window() {
        let window = WakeUpWindow::new(Duration::from_secs(10));
        window.open();

        assert_eq!(window.settle(ChargeStatus::Charging), ChargeStatus::Charging);
        assert_eq!(window.settle(ChargeStatus::Locked), ChargeStatus::Locked);
    }
}
