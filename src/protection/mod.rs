//! Keeps the hosting task protected from scale-in while matches are live

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::game::ClockTimer;

pub mod ecs;

pub use ecs::{EcsAgentProtection, NoopOrchestrator};

/// Toggles the orchestrator's "do not terminate" flag for this task
#[async_trait]
pub trait OrchestratorControl: Send + Sync {
    async fn set_protection(&self, enabled: bool, expires_in: Duration) -> Result<(), ProtectionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProtectionError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Agent error (status {status}): {body}")]
    Api { status: u16, body: String },
}

/// Single-shot protection horizon. Arming enables protection; expiry of the
/// horizon disables it.
pub struct ProtectionGovernor {
    control: Arc<dyn OrchestratorControl>,
    timer: Mutex<Option<Arc<ClockTimer>>>,
}

impl ProtectionGovernor {
    pub fn new(control: Arc<dyn OrchestratorControl>) -> Arc<Self> {
        Arc::new(Self {
            control,
            timer: Mutex::new(None),
        })
    }

    /// Ensure protection holds for at least `duration` from now.
    pub async fn arm(self: &Arc<Self>, duration: Duration) {
        let mut slot = self.timer.lock().await;

        if let Some(timer) = slot.as_ref() {
            if timer.remaining() < duration {
                timer.reset(duration);
                self.enable(duration).await;
            }
            return;
        }

        self.enable(duration).await;
        let timer = Arc::new(ClockTimer::new(duration));
        *slot = Some(timer.clone());
        tokio::spawn(self.clone().watch(timer));
    }

    /// Let the current horizon lapse now.
    pub async fn skip(&self) {
        if let Some(timer) = self.timer.lock().await.as_ref() {
            timer.skip();
        }
    }

    pub async fn is_protected(&self) -> bool {
        self.timer.lock().await.is_some()
    }

    async fn enable(&self, duration: Duration) {
        match self.control.set_protection(true, duration).await {
            Ok(()) => info!(expires_in_secs = duration.as_secs(), "Task protection enabled"),
            Err(e) => warn!(error = %e, "Failed to enable task protection"),
        }
    }

    async fn watch(self: Arc<Self>, timer: Arc<ClockTimer>) {
        loop {
            timer.expired().await;

            let mut slot = self.timer.lock().await;
            // extended between firing and taking the lock
            if !timer.remaining().is_zero() {
                continue;
            }
            *slot = None;

            match self.control.set_protection(false, Duration::ZERO).await {
                Ok(()) => info!("Task protection disabled"),
                Err(e) => warn!(error = %e, "Failed to disable task protection"),
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingOrchestrator {
        calls: parking_lot::Mutex<Vec<(bool, Duration)>>,
    }

    impl RecordingOrchestrator {
        fn flags(&self) -> Vec<bool> {
            self.calls.lock().iter().map(|(enabled, _)| *enabled).collect()
        }
    }

    #[async_trait]
    impl OrchestratorControl for RecordingOrchestrator {
        async fn set_protection(&self, enabled: bool, expires_in: Duration) -> Result<(), ProtectionError> {
            self.calls.lock().push((enabled, expires_in));
            Ok(())
        }
    }

    fn governor() -> (Arc<ProtectionGovernor>, Arc<RecordingOrchestrator>) {
        let control = Arc::new(RecordingOrchestrator::default());
        (ProtectionGovernor::new(control.clone()), control)
    }

    #[tokio::test(start_paused = true)]
    async fn arm_enables_then_lapses() {
        let (governor, control) = governor();

        governor.arm(Duration::from_secs(10)).await;
        assert!(governor.is_protected().await);
        assert_eq!(control.flags(), vec![true]);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!governor.is_protected().await);
        assert_eq!(control.flags(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_arm_never_shrinks_the_horizon() {
        let (governor, control) = governor();

        governor.arm(Duration::from_secs(60)).await;
        governor.arm(Duration::from_secs(5)).await;
        assert_eq!(control.flags(), vec![true]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(governor.is_protected().await);

        governor.arm(Duration::from_secs(120)).await;
        assert_eq!(control.calls.lock()[1], (true, Duration::from_secs(120)));

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(governor.is_protected().await);
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(!governor.is_protected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_disables_promptly_and_rearm_enables_again() {
        let (governor, control) = governor();

        governor.arm(Duration::from_secs(600)).await;
        governor.skip().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!governor.is_protected().await);
        assert_eq!(control.flags(), vec![true, false]);

        governor.arm(Duration::from_secs(600)).await;
        assert_eq!(control.flags(), vec![true, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_without_horizon_is_a_no_op() {
        let (governor, control) = governor();
        governor.skip().await;
        assert!(control.flags().is_empty());
    }
}
