// =============================================================================
// Typed ring snapshots — candles, sessions, levels, imbalances, VWAP
// =============================================================================
//
// Each snapshot wraps the fixed-capacity `Ring` with the accessors its
// consumers need. Level and imbalance snapshots hold `Arc`s because their
// entries carry their own atomic accounting and are shared with reactions
// in flight.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::indicators::VwapEntry;
use crate::market_data::{Candle, Ring};
use crate::poi::{Imbalance, Level};
use crate::session::Session;

// -----------------------------------------------------------------------------
// Candles
// -----------------------------------------------------------------------------

/// Rolling candle history for one market.
pub struct CandleSnapshot {
    ring: Ring<Candle>,
}

impl CandleSnapshot {
    pub fn new(size: usize) -> Result<Self> {
        Ok(Self {
            ring: Ring::new(size)?,
        })
    }

    pub fn add(&self, candle: Candle) {
        self.ring.add(candle);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn last(&self) -> Option<Candle> {
        self.ring.last()
    }

    /// Up to `k` most recent candles, oldest first.
    pub fn last_n(&self, k: usize) -> Vec<Candle> {
        self.ring.last_n(k)
    }

    /// Mean volume of the `n` candles before the most recent one. `None`
    /// until at least one full candle precedes the latest.
    pub fn average_volume(&self, n: usize) -> Option<f64> {
        let window = self.ring.last_n(n + 1);
        if window.len() < 2 {
            return None;
        }
        let prior = &window[..window.len() - 1];
        let sum: f64 = prior.iter().map(|c| c.volume).sum();
        Some(sum / prior.len() as f64)
    }
}

// -----------------------------------------------------------------------------
// Sessions
// -----------------------------------------------------------------------------

/// Recently tracked sessions for one market.
pub struct SessionSnapshot {
    ring: Ring<Arc<Session>>,
}

impl SessionSnapshot {
    pub fn new(size: usize) -> Result<Self> {
        Ok(Self {
            ring: Ring::new(size)?,
        })
    }

    pub fn add(&self, session: Arc<Session>) {
        self.ring.add(session);
    }

    pub fn last(&self) -> Option<Arc<Session>> {
        self.ring.last()
    }

    /// Fold `candle` into every tracked session (each session ignores
    /// candles outside its own window).
    pub fn update(&self, candle: &Candle) {
        self.ring.for_each(|session| session.update(candle));
    }

    /// The tracked session matching `name`+`open`, if still in the ring.
    pub fn find(&self, name: crate::session::SessionName, open: DateTime<Utc>) -> Option<Arc<Session>> {
        self.ring
            .filter(|s| s.name == name && s.open == open)
            .pop()
    }

    /// Sessions whose close has passed at `now`, insertion order.
    pub fn closed_by(&self, now: DateTime<Utc>) -> Vec<Arc<Session>> {
        self.ring.filter(|s| s.close <= now)
    }
}

// -----------------------------------------------------------------------------
// Levels
// -----------------------------------------------------------------------------

/// Support/resistance levels tracked for one market.
pub struct LevelSnapshot {
    ring: Ring<Arc<Level>>,
}

impl LevelSnapshot {
    pub fn new(size: usize) -> Result<Self> {
        Ok(Self {
            ring: Ring::new(size)?,
        })
    }

    pub fn add(&self, level: Arc<Level>) {
        self.ring.add(level);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Fold `candle` into every level's reversal/break accounting.
    pub fn update(&self, candle: &Candle) {
        self.ring.for_each(|level| level.apply(candle));
    }

    /// Levels tagged by `candle`, insertion order.
    pub fn tagged_by(&self, candle: &Candle) -> Vec<Arc<Level>> {
        self.ring.filter(|level| level.tagged_by(candle))
    }
}

// -----------------------------------------------------------------------------
// Imbalances
// -----------------------------------------------------------------------------

/// Fair-value imbalances tracked for one market.
pub struct ImbalanceSnapshot {
    ring: Ring<Arc<Imbalance>>,
}

impl ImbalanceSnapshot {
    pub fn new(size: usize) -> Result<Self> {
        Ok(Self {
            ring: Ring::new(size)?,
        })
    }

    pub fn add(&self, imbalance: Arc<Imbalance>) {
        self.ring.add(imbalance);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Fold `candle` into every imbalance's fill accounting.
    pub fn update(&self, candle: &Candle) {
        self.ring.for_each(|imbalance| imbalance.apply(candle));
    }

    /// Imbalances tagged by `candle`, insertion order.
    pub fn tagged_by(&self, candle: &Candle) -> Vec<Arc<Imbalance>> {
        self.ring.filter(|imbalance| imbalance.tagged_by(candle))
    }
}

// -----------------------------------------------------------------------------
// VWAP
// -----------------------------------------------------------------------------

/// Rolling VWAP observations for one market.
pub struct VwapSnapshot {
    ring: Ring<VwapEntry>,
}

impl VwapSnapshot {
    pub fn new(size: usize) -> Result<Self> {
        Ok(Self {
            ring: Ring::new(size)?,
        })
    }

    pub fn add(&self, entry: VwapEntry) {
        self.ring.add(entry);
    }

    pub fn last(&self) -> Option<VwapEntry> {
        self.ring.last()
    }

    pub fn last_n(&self, k: usize) -> Vec<VwapEntry> {
        self.ring.last_n(k)
    }

    /// The observation recorded exactly at `date`, by linear scan.
    pub fn at(&self, date: DateTime<Utc>) -> Option<VwapEntry> {
        self.ring.filter(|entry| entry.date == date).pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;
    use chrono::TimeZone;

    fn candle(volume: f64, minute: u32) -> Candle {
        Candle {
            market: "^GSPC".to_string(),
            timeframe: Timeframe::FiveMinute,
            open: 10.0,
            high: 11.0,
            low: 9.0,
            close: 10.5,
            volume,
            vwap: 0.0,
            date: Utc.with_ymd_and_hms(2024, 3, 4, 14, minute, 0).unwrap(),
        }
    }

    #[test]
    fn average_volume_excludes_most_recent() {
        let snapshot = CandleSnapshot::new(16).unwrap();
        for (i, volume) in [2.0, 4.0, 6.0, 8.0, 100.0].iter().enumerate() {
            snapshot.add(candle(*volume, i as u32));
        }
        // Mean of the 4 candles before the latest: (2+4+6+8)/4.
        assert_eq!(snapshot.average_volume(4), Some(5.0));
    }

    #[test]
    fn average_volume_with_short_history() {
        let snapshot = CandleSnapshot::new(16).unwrap();
        snapshot.add(candle(3.0, 0));
        assert_eq!(snapshot.average_volume(4), None);

        snapshot.add(candle(9.0, 1));
        // Only one candle precedes the latest.
        assert_eq!(snapshot.average_volume(4), Some(3.0));
    }

    #[test]
    fn level_snapshot_update_and_tags() {
        let snapshot = LevelSnapshot::new(8).unwrap();
        snapshot.add(Arc::new(crate::poi::Level::new("^GSPC", 9.5, 10.5)));
        snapshot.add(Arc::new(crate::poi::Level::new("^GSPC", 12.0, 10.5)));

        // Candle with low 9.0 tags the support at 9.5 but not the
        // resistance at 12.0.
        let tagged = snapshot.tagged_by(&candle(1.0, 0));
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].price, 9.5);

        // The same candle closes above the support: a reversal is recorded.
        snapshot.update(&candle(1.0, 0));
        assert_eq!(tagged[0].reversals(), 1);
    }

    #[test]
    fn session_snapshot_tracks_and_harvests() {
        use crate::session::{self, Session};
        use chrono_tz::America::New_York;

        let at = New_York
            .with_ymd_and_hms(2024, 3, 4, 5, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let window = session::current_window(at).unwrap();

        let snapshot = SessionSnapshot::new(6).unwrap();
        snapshot.add(Arc::new(Session::new(window)));

        assert!(snapshot.find(window.name, window.open).is_some());
        assert!(snapshot
            .find(window.name, window.open + chrono::Duration::days(1))
            .is_none());

        // Nothing has closed yet at 11:00; at 12:00 London has.
        let eleven = New_York
            .with_ymd_and_hms(2024, 3, 4, 11, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!(snapshot.closed_by(eleven).is_empty());

        let noon = New_York
            .with_ymd_and_hms(2024, 3, 4, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(snapshot.closed_by(noon).len(), 1);
    }

    #[test]
    fn imbalance_snapshot_update_invalidates_filled_gaps() {
        let snapshot = ImbalanceSnapshot::new(8).unwrap();
        let gap = Arc::new(crate::poi::Imbalance::new(
            "^GSPC",
            10.2,
            9.8,
            crate::types::Sentiment::Bullish,
        ));
        snapshot.add(gap.clone());

        // The candle helper's low of 9 trades through the whole band.
        assert_eq!(snapshot.tagged_by(&candle(1.0, 0)).len(), 1);
        snapshot.update(&candle(1.0, 0));
        assert!(gap.invalidated());
        assert!(snapshot.tagged_by(&candle(1.0, 1)).is_empty());
    }

    #[test]
    fn vwap_at_scans_by_date() {
        let snapshot = VwapSnapshot::new(8).unwrap();
        for minute in [0, 5, 10] {
            snapshot.add(VwapEntry {
                market: "^GSPC".to_string(),
                timeframe: Timeframe::FiveMinute,
                value: minute as f64,
                date: Utc.with_ymd_and_hms(2024, 3, 4, 14, minute, 0).unwrap(),
            });
        }

        let hit = snapshot
            .at(Utc.with_ymd_and_hms(2024, 3, 4, 14, 5, 0).unwrap())
            .expect("entry at 14:05");
        assert_eq!(hit.value, 5.0);

        assert!(snapshot
            .at(Utc.with_ymd_and_hms(2024, 3, 4, 14, 20, 0).unwrap())
            .is_none());
    }
}
