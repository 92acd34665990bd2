//! Cooperative stop and pause for long running tasks
//!
//! Every loop calls [`WorkerControl::interact`] between two blocking steps:
//! it parks while the worker is paused and fails with
//! [`SyncError::ThreadInterrupt`] once it is stopped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::errors::{Result, SyncError};

#[derive(Debug, Clone)]
pub struct WorkerControl {
    stop: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerControl {
    pub fn new() -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            stop: CancellationToken::new(),
            pause: Arc::new(pause),
        }
    }

    /// A control stopped along with this one but paused on its own.
    pub fn child(&self) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            stop: self.stop.child_token(),
            pause: Arc::new(pause),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn suspend(&self) {
        self.pause.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Suspension point.
    pub async fn interact(&self) -> Result<()> {
        let mut paused = self.pause.subscribe();
        loop {
            if self.stop.is_cancelled() {
                return Err(SyncError::ThreadInterrupt);
            }
            if !*paused.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.stop.cancelled() => return Err(SyncError::ThreadInterrupt),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sleep unless stopped first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.stop.cancelled() => Err(SyncError::ThreadInterrupt),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_interact_waits_while_paused() {
        let control = WorkerControl::new();
        control.interact().await.unwrap();

        control.suspend();
        assert!(control.is_paused());
        let waiting = control.clone();
        let task = tokio::spawn(async move { waiting.interact().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        control.resume();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_interrupts() {
        let control = WorkerControl::new();
        let child = control.child();
        control.suspend();
        let waiting = control.clone();
        let task = tokio::spawn(async move { waiting.interact().await });

        control.stop();
        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(SyncError::ThreadInterrupt)));
        assert!(child.is_stopped());
        assert!(matches!(
            child.sleep(Duration::from_secs(10)).await,
            Err(SyncError::ThreadInterrupt)
        ));
    }
}
