//! Status notifications for the user-facing surface.
//!
//! The engine reports progress through [`UiNotifier`]. [`StatusBoard`] is the
//! daemon's implementation: it logs each status once and keeps the latest
//! text and window visibility for the control socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

/// Fire-and-forget sink for status text and UI visibility.
pub trait UiNotifier: Send + Sync {
    fn notify(&self, status: &str);
    fn hide(&self);
    fn show(&self);
}

/// Latest status plus visibility, with repeated statuses suppressed.
pub struct StatusBoard {
    last_status: Mutex<Option<String>>,
    visible: AtomicBool,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            last_status: Mutex::new(None),
            visible: AtomicBool::new(true),
        }
    }

    pub fn last_status(&self) -> Option<String> {
        self.last_status.lock().ok().and_then(|s| s.clone())
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl UiNotifier for StatusBoard {
    fn notify(&self, status: &str) {
        let mut last = match self.last_status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.as_deref() == Some(status) {
            return;
        }
        info!(status, "Status");
        *last = Some(status.to_string());
    }

    fn hide(&self) {
        if self.visible.swap(false, Ordering::Relaxed) {
            debug!("Hiding UI");
        }
    }

    fn show(&self) {
        if !self.visible.swap(true, Ordering::Relaxed) {
            debug!("Showing UI");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_board_keeps_latest() {
        let board = StatusBoard::new();
        assert_eq!(board.last_status(), None);
        board.notify("Learning baseline...");
        board.notify("Learning baseline...");
        board.notify("Ready");
        assert_eq!(board.last_status().as_deref(), Some("Ready"));
    }

    #[test]
    fn test_visibility_toggles() {
        let board = StatusBoard::new();
        assert!(board.is_visible());
        board.hide();
        board.hide();
        assert!(!board.is_visible());
        board.show();
        assert!(board.is_visible());
    }
}
