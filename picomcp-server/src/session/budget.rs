use std::time::{Duration, Instant};

use thiserror::Error;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum BudgetExceeded {
    #[error("more than {limit} error responses within one second")]
    Burst { limit: u32 },

    #[error("more than {limit} error responses over the life of the session")]
    Lifetime { limit: u32 },
}

/// Counts the error responses a session sends, with a burst ceiling and a lifetime ceiling.
#[derive(Clone, Debug)]
pub struct ErrorBudget {
    per_second: u32,
    lifetime: u32,
    window_start: Option<Instant>,
    in_window: u32,
    total: u32,
}

impl ErrorBudget {
    pub fn new(per_second: u32, lifetime: u32) -> Self {
        Self {
            per_second,
            lifetime,
            window_start: None,
            in_window: 0,
            total: 0,
        }
    }

    /// Record one error at `now`.  Fails once either ceiling has been passed.
    pub fn charge(&mut self, now: Instant) -> Result<(), BudgetExceeded> {
        self.total = self.total.saturating_add(1);

        match self.window_start {
            Some(start) if now.saturating_duration_since(start) < WINDOW => {
                self.in_window = self.in_window.saturating_add(1);
            }
            _ => {
                self.window_start = Some(now);
                self.in_window = 1;
            }
        }

        if self.in_window > self.per_second {
            Err(BudgetExceeded::Burst { limit: self.per_second })
        } else if self.total > self.lifetime {
            Err(BudgetExceeded::Lifetime { limit: self.lifetime })
        } else {
            Ok(())
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}
