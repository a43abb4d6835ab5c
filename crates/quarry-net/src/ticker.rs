//! The refresh ticker driving peer-set maintenance.

use std::time::Duration;
use tokio::sync::mpsc;

/// Signal source for periodic refresh passes.
///
/// Production code uses [`RefreshTicker::interval`]; tests drive passes
/// deterministically through [`RefreshTicker::manual`].
pub struct RefreshTicker {
    inner: Inner,
}

enum Inner {
    /// Wall-clock ticks. The underlying interval is created on first use,
    /// so an interval ticker can be constructed outside a runtime.
    Interval {
        period: Duration,
        interval: Option<tokio::time::Interval>,
    },
    /// Hand-driven ticks.
    Manual(mpsc::Receiver<()>),
}

impl RefreshTicker {
    /// A wall-clock ticker firing every `period`, starting one period after
    /// the first wait.
    pub fn interval(period: Duration) -> Self {
        Self {
            inner: Inner::Interval {
                period,
                interval: None,
            },
        }
    }

    /// A ticker fired by hand. Each send on the returned sender produces one
    /// tick; dropping the sender ends the ticker.
    pub fn manual() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel(8);
        (Self { inner: Inner::Manual(rx) }, tx)
    }

    /// Wait for the next tick. `None` once a manual ticker's driving side is
    /// gone; interval tickers never end.
    pub async fn tick(&mut self) -> Option<()> {
        match &mut self.inner {
            Inner::Interval { period, interval } => {
                let interval = interval.get_or_insert_with(|| {
                    tokio::time::interval_at(
                        tokio::time::Instant::now() + *period,
                        *period,
                    )
                });
                interval.tick().await;
                Some(())
            }
            Inner::Manual(rx) => rx.recv().await,
        }
    }
}
