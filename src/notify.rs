use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::timers::TimerExpired;

pub trait Notifier: Send + Sync {
    fn timer_expired(&self, expiry: &TimerExpired);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn timer_expired(&self, expiry: &TimerExpired) {
        info!(
            slot = expiry.slot_index + 1,
            duration_seconds = expiry.duration_seconds,
            "timer finished"
        );
    }
}

impl Notifier for UnboundedSender<TimerExpired> {
    fn timer_expired(&self, expiry: &TimerExpired) {
        if self.send(*expiry).is_err() {
            warn!(slot = expiry.slot_index + 1, "timer listener is gone");
        }
    }
}
