use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use super::{Attempt, Session};
use crate::error::SessionError;

const RESET_POLL_INTERVAL: Duration = Duration::from_secs(1);

impl Session {
    /// Resetting: drop the current attempt and wait for the modem to
    /// re-enumerate. Ok(false) if Stop arrived while waiting.
    ///
    /// The host link is marked down without calling the notifier.
    pub(super) async fn recover(&mut self, attempt: Attempt) -> Result<bool, SessionError> {
        warn!("Modem reset, restarting session");
        attempt.close().await;
        self.link.force_down();
        self.retry_at = None;

        let polls = (self.config.reset_wait.as_secs_f64() / RESET_POLL_INTERVAL.as_secs_f64())
            .ceil()
            .max(1.0) as u32;
        for poll in 1..=polls {
            sleep(RESET_POLL_INTERVAL).await;
            if self.stop_requested() {
                info!("Stop requested during modem reset");
                return Ok(false);
            }
            if self.watch.is_present().await {
                info!("{} is back after {}s", self.watch.describe(), poll);
                return Ok(true);
            }
        }

        Err(SessionError::DeviceGone(self.watch.describe()))
    }
}
