// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rate-limited logging for events the device or a VF can trigger at will.
//!
//! Each callsite gets a [`LogBudget`]: a burst of events per window, then
//! silence until the next window opens. The first event logged in a new
//! window carries the number suppressed in the windows before it.

use parking_lot::Mutex;
use std::time::Duration;
use std::time::Instant;

pub(crate) const WINDOW: Duration = Duration::from_secs(5);
pub(crate) const BURST: u32 = 10;

pub(crate) struct LogBudget {
    window: Duration,
    burst: u32,
    current: Mutex<Window>,
}

struct Window {
    opened: Option<Instant>,
    logged: u32,
    suppressed: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admit {
    /// Log it. `suppressed` counts the events dropped since the last logged
    /// one, if any were.
    Log { suppressed: Option<u64> },
    Suppress,
}

impl LogBudget {
    pub const fn new(window: Duration, burst: u32) -> Self {
        Self {
            window,
            burst,
            current: Mutex::new(Window {
                opened: None,
                logged: 0,
                suppressed: 0,
            }),
        }
    }

    pub fn admit(&self) -> Admit {
        self.admit_at(Instant::now())
    }

    fn admit_at(&self, now: Instant) -> Admit {
        let mut current = self.current.lock();
        let expired = current
            .opened
            .is_none_or(|opened| now.saturating_duration_since(opened) >= self.window);
        if expired {
            current.opened = Some(now);
            current.logged = 0;
        }
        if current.logged == self.burst {
            current.suppressed += 1;
            return Admit::Suppress;
        }
        current.logged += 1;
        let suppressed = std::mem::take(&mut current.suppressed);
        Admit::Log {
            suppressed: (suppressed > 0).then_some(suppressed),
        }
    }
}

macro_rules! ratelimited {
    ($level:ident, $($rest:tt)*) => {{
        static BUDGET: $crate::ratelimit::LogBudget =
            $crate::ratelimit::LogBudget::new($crate::ratelimit::WINDOW, $crate::ratelimit::BURST);
        if let $crate::ratelimit::Admit::Log { suppressed } = BUDGET.admit() {
            ::tracing::$level!(dropped_ratelimited = suppressed, $($rest)*);
        }
    }};
}

macro_rules! error_ratelimited {
    ($($rest:tt)*) => {
        $crate::ratelimit::ratelimited!(error, $($rest)*)
    };
}

macro_rules! warn_ratelimited {
    ($($rest:tt)*) => {
        $crate::ratelimit::ratelimited!(warn, $($rest)*)
    };
}

pub(crate) use error_ratelimited;
pub(crate) use ratelimited;
pub(crate) use warn_ratelimited;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_suppress() {
        let budget = LogBudget::new(Duration::from_secs(1), 3);
        let t0 = Instant::now();
        for _ in 0..3 {
            assert_eq!(budget.admit_at(t0), Admit::Log { suppressed: None });
        }
        for _ in 0..4 {
            assert_eq!(budget.admit_at(t0), Admit::Suppress);
        }
        assert_eq!(
            budget.admit_at(t0 + Duration::from_millis(999)),
            Admit::Suppress
        );
    }

    #[test]
    fn next_window_reports_suppressed() {
        let budget = LogBudget::new(Duration::from_secs(1), 1);
        let t0 = Instant::now();
        assert_eq!(budget.admit_at(t0), Admit::Log { suppressed: None });
        assert_eq!(budget.admit_at(t0), Admit::Suppress);
        assert_eq!(budget.admit_at(t0), Admit::Suppress);

        let t1 = t0 + Duration::from_secs(1);
        assert_eq!(budget.admit_at(t1), Admit::Log { suppressed: Some(2) });
        assert_eq!(budget.admit_at(t1), Admit::Suppress);

        // A quiet window resets the count without losing the report.
        let t3 = t1 + Duration::from_secs(2);
        assert_eq!(budget.admit_at(t3), Admit::Log { suppressed: Some(1) });
        assert_eq!(
            budget.admit_at(t3 + Duration::from_secs(1)),
            Admit::Log { suppressed: None }
        );
    }

    #[test]
    fn macros_expand_at_each_callsite() {
        for i in 0..20 {
            warn_ratelimited!(i, "repeated warning");
            error_ratelimited!(i, "repeated error");
        }
    }
}
