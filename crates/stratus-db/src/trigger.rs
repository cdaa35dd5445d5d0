//! Change triggers.
//!
//! A trigger is a capacity-1 channel. Delivery never blocks: if a wakeup
//! is already pending, further ones are dropped, so consumers must re-read
//! full state on every wakeup rather than count signals.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

/// Receiving side handed to consumers.
pub struct Trigger {
    rx: mpsc::Receiver<()>,
    stop_tx: watch::Sender<bool>,
}

/// Sending side kept by each watched table.
pub(crate) struct TriggerHandle {
    tx: mpsc::Sender<()>,
    stop_rx: watch::Receiver<bool>,
}

impl Trigger {
    pub(crate) fn new() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel(1);
        let (stop_tx, _) = watch::channel(false);
        (Self { rx, stop_tx }, tx)
    }

    pub(crate) fn handle(&self, tx: mpsc::Sender<()>) -> TriggerHandle {
        TriggerHandle {
            tx,
            stop_rx: self.stop_tx.subscribe(),
        }
    }

    /// Wait for the next wakeup. Returns `None` once the trigger is
    /// stopped and no wakeup is pending.
    pub async fn recv(&mut self) -> Option<()> {
        if *self.stop_tx.borrow() {
            return self.rx.try_recv().ok();
        }
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::select! {
            signal = self.rx.recv() => signal,
            _ = stop_rx.wait_for(|stopped| *stopped) => None,
        }
    }

    /// Non-blocking poll for a pending wakeup.
    pub fn try_recv(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Stop delivery. Idempotent and never blocks.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Fire now and then every `interval` until stopped.
    pub(crate) fn spawn_ticker(&self, tx: mpsc::Sender<()>, interval: Duration) {
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        let _ = tx.try_send(());
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl TriggerHandle {
    pub(crate) fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow() || self.tx.is_closed()
    }

    pub(crate) fn notify(&self) {
        // Full means a wakeup is already pending.
        let _ = self.tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_notifications_collapse() {
        let (mut trigger, tx) = Trigger::new();
        let handle = trigger.handle(tx);

        handle.notify();
        handle.notify();
        handle.notify();

        assert!(trigger.try_recv());
        assert!(!trigger.try_recv());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (mut trigger, tx) = Trigger::new();
        let handle = trigger.handle(tx);

        trigger.stop();
        trigger.stop();

        assert!(trigger.is_stopped());
        assert!(handle.is_stopped());
        assert_eq!(trigger.recv().await, None);
    }
}
