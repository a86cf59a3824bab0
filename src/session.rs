// =============================================================================
// Trading sessions — America/New_York wall clock
// =============================================================================
//
// Session windows (New York time):
//
//   Asia     18:00 -> 03:00 (close rolls to the following day)
//   London   03:00 -> 11:30
//   NewYork  08:00 -> 17:00
//
// London and NewYork overlap between 08:00 and 11:30; a market therefore
// tracks every window containing the current instant and treats the
// latest-opened one as *the* current session. A session matures one hour
// after its open. DST transitions are handled by the tz database.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::market_data::Candle;

/// The three tracked sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionName {
    Asia,
    London,
    NewYork,
}

impl SessionName {
    pub const ALL: [SessionName; 3] = [Self::Asia, Self::London, Self::NewYork];

    /// Wall-clock open in New York time.
    fn open_time(&self) -> NaiveTime {
        match self {
            Self::Asia => NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            Self::London => NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
            Self::NewYork => NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        }
    }

    /// Open-to-close span. Asia wraps midnight, so its close lands on the
    /// following day.
    fn span(&self) -> Duration {
        match self {
            Self::Asia => Duration::hours(9),
            Self::London => Duration::hours(8) + Duration::minutes(30),
            Self::NewYork => Duration::hours(9),
        }
    }

    /// London and New York carry the bulk of daily volume.
    pub fn is_high_volume(&self) -> bool {
        matches!(self, Self::London | Self::NewYork)
    }
}

impl std::fmt::Display for SessionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asia => write!(f, "Asia"),
            Self::London => write!(f, "London"),
            Self::NewYork => write!(f, "NewYork"),
        }
    }
}

/// A concrete open/close pair for one session on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub name: SessionName,
    pub open: DateTime<Utc>,
    pub close: DateTime<Utc>,
}

impl SessionWindow {
    /// `open <= at < close`.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.open <= at && at < self.close
    }
}

/// Resolve the open instant of `name` anchored on the New York calendar day
/// `days_back` days before `at`'s New York date.
fn open_on(name: SessionName, at: DateTime<Utc>, days_back: i64) -> Option<DateTime<Utc>> {
    let local_date = at.with_timezone(&New_York).date_naive() - Duration::days(days_back);
    let local_open = local_date.and_time(name.open_time());
    // `earliest` resolves fall-back ambiguity; spring-forward gaps never land
    // on a session open under current DST rules.
    New_York
        .from_local_datetime(&local_open)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Every window containing `at` — at most one per session name, possibly two
/// overall during the London/NewYork overlap.
pub fn windows_containing(at: DateTime<Utc>) -> Vec<SessionWindow> {
    let mut windows = Vec::with_capacity(2);
    for name in SessionName::ALL {
        for days_back in [1, 0] {
            if let Some(open) = open_on(name, at, days_back) {
                let window = SessionWindow {
                    name,
                    open,
                    close: open + name.span(),
                };
                if window.contains(at) {
                    windows.push(window);
                    break;
                }
            }
        }
    }
    windows
}

/// The session considered current at `at`: the latest-opened containing
/// window. `None` only in the daily 17:00–18:00 New York gap.
pub fn current_window(at: DateTime<Utc>) -> Option<SessionWindow> {
    windows_containing(at).into_iter().max_by_key(|w| w.open)
}

/// Whether `at` falls inside a high-volume (London or New York) session.
pub fn is_high_volume_time(at: DateTime<Utc>) -> bool {
    windows_containing(at)
        .iter()
        .any(|w| w.name.is_high_volume())
}

/// The most recent session open at or before `at`, used to seed catch-up
/// fetches.
pub fn last_session_open(at: DateTime<Utc>) -> DateTime<Utc> {
    let mut latest: Option<DateTime<Utc>> = None;
    for name in SessionName::ALL {
        for days_back in [1, 0] {
            if let Some(open) = open_on(name, at, days_back) {
                if open <= at && latest.map_or(true, |cur| open > cur) {
                    latest = Some(open);
                }
            }
        }
    }
    // Fall back to 24h ago if the tz lookup ever fails.
    latest.unwrap_or(at - Duration::hours(24))
}

/// Rolling high/low of a session, tracked while candles stream in.
#[derive(Debug, Clone, Copy, Default)]
struct SessionRange {
    high: Option<f64>,
    low: Option<f64>,
}

/// A live session being tracked by a market context.
pub struct Session {
    pub name: SessionName,
    pub open: DateTime<Utc>,
    pub close: DateTime<Utc>,
    range: RwLock<SessionRange>,
    matured: AtomicBool,
    levels_published: AtomicBool,
}

impl Session {
    pub fn new(window: SessionWindow) -> Self {
        Self {
            name: window.name,
            open: window.open,
            close: window.close,
            range: RwLock::new(SessionRange::default()),
            matured: AtomicBool::new(false),
            levels_published: AtomicBool::new(false),
        }
    }

    /// `open <= at < close`.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.open <= at && at < self.close
    }

    /// Fold `candle` into the rolling high/low when it falls inside the
    /// window, and flip the matured flag one hour after the open.
    pub fn update(&self, candle: &Candle) {
        if !self.contains(candle.date) {
            return;
        }

        {
            let mut range = self.range.write();
            range.high = Some(range.high.map_or(candle.high, |h| h.max(candle.high)));
            range.low = Some(range.low.map_or(candle.low, |l| l.min(candle.low)));
        }

        // One hour after the open the session counts as matured.
        if candle.date >= self.open + Duration::hours(1) {
            self.matured.store(true, Ordering::Release);
        }
    }

    pub fn high(&self) -> Option<f64> {
        self.range.read().high
    }

    pub fn low(&self) -> Option<f64> {
        self.range.read().low
    }

    pub fn matured(&self) -> bool {
        self.matured.load(Ordering::Acquire)
    }

    /// Claim the one-shot right to publish this session's levels. Returns
    /// true exactly once.
    pub fn claim_level_publication(&self) -> bool {
        !self.levels_published.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("open", &self.open)
            .field("close", &self.close)
            .field("matured", &self.matured())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    /// 2024-03-04 is a Monday; EST (UTC-5) applies until March 10.
    fn ny(h: u32, m: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(2024, 3, 4, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn candle_at(date: DateTime<Utc>, high: f64, low: f64) -> Candle {
        Candle {
            market: "^GSPC".to_string(),
            timeframe: Timeframe::FiveMinute,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 1.0,
            vwap: 0.0,
            date,
        }
    }

    #[test]
    fn single_session_hours() {
        let windows = windows_containing(ny(5, 0));
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].name, SessionName::London);

        let windows = windows_containing(ny(1, 0));
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].name, SessionName::Asia);
        // Asia opened yesterday at 18:00.
        assert!(windows[0].open < ny(1, 0));

        let windows = windows_containing(ny(13, 0));
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].name, SessionName::NewYork);
    }

    #[test]
    fn london_newyork_overlap() {
        let windows = windows_containing(ny(9, 0));
        let names: Vec<SessionName> = windows.iter().map(|w| w.name).collect();
        assert!(names.contains(&SessionName::London));
        assert!(names.contains(&SessionName::NewYork));

        // The current session during the overlap is New York (later open).
        let current = current_window(ny(9, 0)).unwrap();
        assert_eq!(current.name, SessionName::NewYork);
    }

    #[test]
    fn daily_gap_has_no_session() {
        assert!(windows_containing(ny(17, 30)).is_empty());
        assert!(current_window(ny(17, 30)).is_none());
    }

    #[test]
    fn high_volume_resolution() {
        assert!(is_high_volume_time(ny(5, 0))); // London
        assert!(is_high_volume_time(ny(13, 0))); // New York
        assert!(!is_high_volume_time(ny(1, 0))); // Asia
        assert!(!is_high_volume_time(ny(17, 30))); // gap
    }

    #[test]
    fn last_open_during_gap_is_new_york() {
        let open = last_session_open(ny(17, 30));
        assert_eq!(open, ny(8, 0));
    }

    #[test]
    fn asia_close_rolls_to_next_day() {
        let windows = windows_containing(ny(19, 0));
        assert_eq!(windows.len(), 1);
        let asia = windows[0];
        assert_eq!(asia.name, SessionName::Asia);
        assert_eq!(asia.open, ny(18, 0));
        assert_eq!(asia.close - asia.open, Duration::hours(9));
    }

    #[test]
    fn summer_wall_clock_holds_under_dst() {
        // 2024-07-08 is under EDT (UTC-4); the wall-clock schedule must not
        // shift.
        let at = New_York
            .with_ymd_and_hms(2024, 7, 8, 5, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let windows = windows_containing(at);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].name, SessionName::London);

        let at = New_York
            .with_ymd_and_hms(2024, 7, 8, 13, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!(is_high_volume_time(at));

        let at = New_York
            .with_ymd_and_hms(2024, 7, 8, 17, 30, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!(windows_containing(at).is_empty());
    }

    #[test]
    fn session_tracks_range_and_maturity() {
        let session = Session::new(current_window(ny(5, 0)).unwrap());

        session.update(&candle_at(ny(3, 5), 10.0, 8.0));
        assert_eq!(session.high(), Some(10.0));
        assert_eq!(session.low(), Some(8.0));
        assert!(!session.matured());

        session.update(&candle_at(ny(4, 5), 12.0, 9.0));
        assert_eq!(session.high(), Some(12.0));
        assert_eq!(session.low(), Some(8.0));
        assert!(session.matured());

        // A candle outside the window is ignored.
        session.update(&candle_at(ny(12, 0), 99.0, 1.0));
        assert_eq!(session.high(), Some(12.0));
    }

    #[test]
    fn level_publication_claims_once() {
        let session = Session::new(current_window(ny(5, 0)).unwrap());
        assert!(session.claim_level_publication());
        assert!(!session.claim_level_publication());
    }
}
