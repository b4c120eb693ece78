//! Drain cadence: buffered chunks go to the player a fixed gap apart

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Instant, Sleep};

use super::bridge::DrainStep;

pub struct DrainPacer {
    timer: Pin<Box<Sleep>>,
    armed: bool,
    gap: Duration,
}

impl DrainPacer {
    pub fn new(gap: Duration) -> Self {
        Self {
            timer: Box::pin(sleep(Duration::ZERO)),
            armed: false,
            gap,
        }
    }

    /// First chunk is due immediately
    pub fn start(&mut self) {
        self.timer.as_mut().reset(Instant::now());
        self.armed = true;
    }

    pub fn stop(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Resolves when the next chunk is due; never while stopped. Cancel-safe.
    pub async fn due(&mut self) {
        if !self.armed {
            std::future::pending::<()>().await;
        }
        self.timer.as_mut().await;
    }

    /// Schedule the next step from the outcome of the last one.
    pub fn after(&mut self, step: DrainStep) {
        match step {
            DrainStep::Delivered { .. } | DrainStep::Stalled => {
                self.timer.as_mut().reset(Instant::now() + self.gap);
            }
            DrainStep::Finished | DrainStep::Aborted => self.armed = false,
        }
    }
}
