//! Historical bar pagination.
//!
//! The gateway returns at most one bounded window of bars per request, and
//! the window it accepts depends on the bar size. `Paginator` walks windows
//! backwards from a cursor until it has `limit` bars, history runs out, or
//! the round bound is hit, then returns the most recent `limit` bars in
//! ascending time order with duplicate timestamps collapsed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use ibkr_wire::{Bar, Contract};
use rust_decimal::prelude::ToPrimitive;

use crate::error::{ProxyError, Result};
use crate::models::HistoricalBar;

// ============================================================================
// Intervals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BarUnit {
    Secs,
    Mins,
    Hours,
    Days,
    Weeks,
    Months,
}

/// A bar size the gateway accepts, e.g. `5 mins`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BarInterval {
    pub count: u32,
    pub unit: BarUnit,
}

impl BarInterval {
    pub const fn new(count: u32, unit: BarUnit) -> Self {
        Self { count, unit }
    }

    fn is_supported(&self) -> bool {
        let allowed: &[u32] = match self.unit {
            BarUnit::Secs => &[1, 5, 10, 15, 30],
            BarUnit::Mins => &[1, 2, 3, 5, 10, 15, 20, 30],
            BarUnit::Hours => &[1, 2, 3, 4, 8],
            BarUnit::Days | BarUnit::Weeks | BarUnit::Months => &[1],
        };
        allowed.contains(&self.count)
    }
}

impl FromStr for BarInterval {
    type Err = ProxyError;

    /// Accepts gateway bar sizes (`1 min`, `5 mins`, `1 hour`) and compact
    /// forms (`1min`, `5m`, `1h`, `1d`, `1w`, `1mo`).
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProxyError::InvalidArgument(format!("unsupported interval '{s}'"));
        let compact: String = s.trim().to_ascii_lowercase().split_whitespace().collect();
        let split = compact
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (digits, unit) = compact.split_at(split);
        let count: u32 = digits.parse().map_err(|_| invalid())?;
        let unit = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => BarUnit::Secs,
            "m" | "min" | "mins" | "minute" | "minutes" => BarUnit::Mins,
            "h" | "hr" | "hour" | "hours" => BarUnit::Hours,
            "d" | "day" | "days" => BarUnit::Days,
            "w" | "wk" | "week" | "weeks" => BarUnit::Weeks,
            "mo" | "mon" | "month" | "months" => BarUnit::Months,
            _ => return Err(invalid()),
        };
        let interval = Self::new(count, unit);
        if interval.is_supported() {
            Ok(interval)
        } else {
            Err(invalid())
        }
    }
}

/// Renders the gateway's bar size string.
impl fmt::Display for BarInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = self.count > 1;
        let unit = match (self.unit, plural) {
            (BarUnit::Secs, _) => "secs",
            (BarUnit::Mins, false) => "min",
            (BarUnit::Mins, true) => "mins",
            (BarUnit::Hours, false) => "hour",
            (BarUnit::Hours, true) => "hours",
            (BarUnit::Days, _) => "day",
            (BarUnit::Weeks, _) => "week",
            (BarUnit::Months, _) => "month",
        };
        write!(f, "{} {unit}", self.count)
    }
}

// ============================================================================
// Window table
// ============================================================================

/// Validate a gateway duration string such as `1 D` or `1800 S`.
pub fn parse_duration(s: &str) -> Result<String> {
    let invalid = || ProxyError::InvalidArgument(format!("invalid duration '{s}'"));
    let mut parts = s.split_whitespace();
    let (Some(count), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };
    let count: u32 = count.parse().map_err(|_| invalid())?;
    let unit = unit.to_ascii_uppercase();
    if count == 0 || !matches!(unit.as_str(), "S" | "D" | "W" | "M" | "Y") {
        return Err(invalid());
    }
    Ok(format!("{count} {unit}"))
}

/// Window span requested per bar size.
#[derive(Debug, Clone, Default)]
pub struct WindowTable {
    overrides: HashMap<BarInterval, String>,
}

impl WindowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, interval: BarInterval, span: String) -> Self {
        self.overrides.insert(interval, span);
        self
    }

    pub fn span_for(&self, interval: BarInterval) -> String {
        self.overrides
            .get(&interval)
            .cloned()
            .unwrap_or_else(|| default_span(interval).to_string())
    }
}

fn default_span(interval: BarInterval) -> &'static str {
    match (interval.unit, interval.count) {
        (BarUnit::Secs, 1) => "1800 S",
        (BarUnit::Secs, 5) => "3600 S",
        (BarUnit::Secs, 10 | 15) => "14400 S",
        (BarUnit::Secs, _) => "28800 S",
        (BarUnit::Mins, 1..=3) => "1 D",
        (BarUnit::Mins, 5..=10) => "1 W",
        (BarUnit::Mins, _) => "2 W",
        (BarUnit::Hours, _) => "1 M",
        (BarUnit::Days, _) => "1 Y",
        (BarUnit::Weeks, _) => "2 Y",
        (BarUnit::Months, _) => "5 Y",
    }
}

// ============================================================================
// Bar source
// ============================================================================

/// One upstream historical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// `yyyyMMdd-HH:mm:ss` UTC, empty for "now".
    pub end_date_time: String,
    pub duration: String,
    pub bar_size: String,
}

#[async_trait]
pub trait BarSource: Send + Sync {
    /// Full contract for a contract id.
    async fn resolve(&self, con_id: i64) -> Result<Contract>;

    /// Bars of one window, ascending.
    async fn fetch_window(&self, contract: &Contract, window: &Window) -> Result<Vec<Bar>>;
}

// ============================================================================
// Paginator
// ============================================================================

#[derive(Debug, Clone)]
pub struct PaginatorConfig {
    pub max_rounds: u32,
    pub window_retries: u32,
    pub retry_delay: Duration,
    pub max_limit: usize,
}

impl Default for PaginatorConfig {
    fn default() -> Self {
        Self {
            max_rounds: 20,
            window_retries: 2,
            retry_delay: Duration::from_millis(500),
            max_limit: 5000,
        }
    }
}

pub struct Paginator {
    source: Arc<dyn BarSource>,
    windows: WindowTable,
    config: PaginatorConfig,
}

impl Paginator {
    pub fn new(source: Arc<dyn BarSource>, windows: WindowTable, config: PaginatorConfig) -> Self {
        Self {
            source,
            windows,
            config,
        }
    }

    /// The most recent `limit` bars.
    pub async fn load(
        &self,
        con_id: i64,
        interval: BarInterval,
        limit: usize,
        duration: Option<&str>,
    ) -> Result<Vec<HistoricalBar>> {
        self.paginate(con_id, interval, None, limit, duration).await
    }

    /// Up to `limit` bars strictly older than `end_time` (epoch seconds).
    pub async fn load_more(
        &self,
        con_id: i64,
        interval: BarInterval,
        end_time: i64,
        limit: usize,
        duration: Option<&str>,
    ) -> Result<Vec<HistoricalBar>> {
        self.paginate(con_id, interval, Some(end_time), limit, duration)
            .await
    }

    async fn paginate(
        &self,
        con_id: i64,
        interval: BarInterval,
        end: Option<i64>,
        limit: usize,
        duration: Option<&str>,
    ) -> Result<Vec<HistoricalBar>> {
        if limit == 0 || limit > self.config.max_limit {
            return Err(ProxyError::InvalidArgument(format!(
                "limit must be between 1 and {}",
                self.config.max_limit
            )));
        }
        let span = match duration {
            Some(d) => parse_duration(d)?,
            None => self.windows.span_for(interval),
        };
        let contract = self.source.resolve(con_id).await?;

        let mut cursor = end;
        let mut merged: BTreeMap<i64, HistoricalBar> = BTreeMap::new();
        let mut rounds = 0;

        while rounds < self.config.max_rounds {
            rounds += 1;
            let window = Window {
                end_date_time: cursor.map(format_end).unwrap_or_default(),
                duration: span.clone(),
                bar_size: interval.to_string(),
            };
            let bars = self.fetch_with_retry(&contract, &window).await?;

            let before = merged.len();
            for bar in &bars {
                let time = parse_bar_time(&bar.time)?;
                if cursor.is_some_and(|c| time >= c) {
                    continue;
                }
                merged.entry(time).or_insert_with(|| to_historical(time, bar));
            }
            let added = merged.len() - before;
            tracing::debug!(con_id, round = rounds, received = bars.len(), added, "historical window");

            if added == 0 {
                break;
            }
            if merged.len() >= limit {
                break;
            }
            cursor = merged.keys().next().copied();
        }

        let skip = merged.len().saturating_sub(limit);
        let result: Vec<HistoricalBar> = merged.into_values().skip(skip).collect();
        tracing::info!(con_id, %interval, rounds, bars = result.len(), "historical data loaded");
        Ok(result)
    }

    async fn fetch_with_retry(&self, contract: &Contract, window: &Window) -> Result<Vec<Bar>> {
        let mut attempt = 0;
        loop {
            match self.source.fetch_window(contract, window).await {
                Ok(bars) => return Ok(bars),
                Err(e) if e.is_retryable() && attempt < self.config.window_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, end = %window.end_date_time, "window fetch failed, retrying");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub(crate) fn to_historical(time: i64, bar: &Bar) -> HistoricalBar {
    HistoricalBar {
        time,
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
        volume: bar.volume.and_then(|v| v.to_f64()).unwrap_or(0.0),
    }
}

/// Gateway end cursor for an epoch timestamp.
pub fn format_end(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .unwrap_or_default()
        .format("%Y%m%d-%H:%M:%S")
        .to_string()
}

/// Bar timestamp to epoch seconds. Daily bars (`yyyyMMdd`) map to UTC
/// midnight.
pub fn parse_bar_time(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    let invalid = || ProxyError::Protocol(format!("unparseable bar time '{raw}'"));

    if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
        let date = NaiveDate::parse_from_str(raw, "%Y%m%d").map_err(|_| invalid())?;
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .ok_or_else(invalid);
    }
    if let Ok(epoch) = raw.parse::<i64>() {
        return Ok(epoch);
    }
    // formatDate=1: "yyyyMMdd  HH:mm:ss", possibly followed by a zone name.
    let normalized: Vec<&str> = raw.split_whitespace().take(2).collect();
    let joined = normalized.join(" ");
    NaiveDateTime::parse_from_str(&joined, "%Y%m%d %H:%M:%S")
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const MINUTE: i64 = 60;
    const LAST: i64 = 1_700_000_000 - 1_700_000_000 % MINUTE;

    /// One-minute bars every 60s over `[first, LAST]`.
    struct SeriesSource {
        first: i64,
        per_window: usize,
        /// Include the bar at the cursor itself.
        inclusive: bool,
        failures: AtomicU32,
        failure: Option<ProxyError>,
        windows: Mutex<Vec<Window>>,
    }

    impl SeriesSource {
        fn new(first: i64, per_window: usize) -> Self {
            Self {
                first,
                per_window,
                inclusive: true,
                failures: AtomicU32::new(0),
                failure: None,
                windows: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.windows.lock().unwrap().len()
        }
    }

    fn parse_end(s: &str) -> Option<i64> {
        if s.is_empty() {
            return None;
        }
        Some(
            NaiveDateTime::parse_from_str(s, "%Y%m%d-%H:%M:%S")
                .unwrap()
                .and_utc()
                .timestamp(),
        )
    }

    #[async_trait]
    impl BarSource for SeriesSource {
        async fn resolve(&self, con_id: i64) -> Result<Contract> {
            if con_id == 0 {
                return Err(ProxyError::NotFound("contract 0".into()));
            }
            Ok(Contract::with_con_id(con_id))
        }

        async fn fetch_window(&self, _contract: &Contract, window: &Window) -> Result<Vec<Bar>> {
            self.windows.lock().unwrap().push(window.clone());
            if let Some(err) = &self.failure {
                if self.failures.load(Ordering::SeqCst) > 0 {
                    self.failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(err.clone());
                }
            }
            let top = match parse_end(&window.end_date_time) {
                Some(end) if self.inclusive => end,
                Some(end) => end - MINUTE,
                None => LAST,
            };
            let top = top.min(LAST);
            let mut bars = Vec::new();
            let mut t = top;
            while t >= self.first && bars.len() < self.per_window {
                bars.push(Bar {
                    time: t.to_string(),
                    open: 1.0,
                    high: 2.0,
                    low: 0.5,
                    close: 1.5,
                    volume: Some(100.into()),
                    ..Default::default()
                });
                t -= MINUTE;
            }
            bars.reverse();
            Ok(bars)
        }
    }

    fn paginator(source: Arc<SeriesSource>, config: PaginatorConfig) -> Paginator {
        Paginator::new(source, WindowTable::new(), config)
    }

    fn fast_config() -> PaginatorConfig {
        PaginatorConfig {
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    const ONE_MIN: BarInterval = BarInterval::new(1, BarUnit::Mins);

    fn assert_strictly_ascending(bars: &[HistoricalBar]) {
        assert!(bars.windows(2).all(|w| w[0].time < w[1].time));
    }

    #[test]
    fn parses_interval_forms() {
        assert_eq!("1 min".parse::<BarInterval>().unwrap(), ONE_MIN);
        assert_eq!("1min".parse::<BarInterval>().unwrap(), ONE_MIN);
        assert_eq!("5m".parse::<BarInterval>().unwrap().to_string(), "5 mins");
        assert_eq!("1h".parse::<BarInterval>().unwrap().to_string(), "1 hour");
        assert_eq!("4 hours".parse::<BarInterval>().unwrap().to_string(), "4 hours");
        assert_eq!("1d".parse::<BarInterval>().unwrap().to_string(), "1 day");
        assert_eq!("1W".parse::<BarInterval>().unwrap().to_string(), "1 week");
        assert_eq!("1mo".parse::<BarInterval>().unwrap().to_string(), "1 month");
        assert_eq!("30 secs".parse::<BarInterval>().unwrap().to_string(), "30 secs");

        for bad in ["", "min", "7 mins", "2 days", "1 fortnight", "-1 min"] {
            assert!(
                matches!(bad.parse::<BarInterval>(), Err(ProxyError::InvalidArgument(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn window_table_defaults_and_overrides() {
        let table = WindowTable::new();
        assert_eq!(table.span_for(BarInterval::new(1, BarUnit::Secs)), "1800 S");
        assert_eq!(table.span_for(ONE_MIN), "1 D");
        assert_eq!(table.span_for(BarInterval::new(5, BarUnit::Mins)), "1 W");
        assert_eq!(table.span_for(BarInterval::new(30, BarUnit::Mins)), "2 W");
        assert_eq!(table.span_for(BarInterval::new(1, BarUnit::Hours)), "1 M");
        assert_eq!(table.span_for(BarInterval::new(1, BarUnit::Days)), "1 Y");
        assert_eq!(table.span_for(BarInterval::new(1, BarUnit::Months)), "5 Y");

        let table = table.with_override(ONE_MIN, "2 D".into());
        assert_eq!(table.span_for(ONE_MIN), "2 D");
    }

    #[test]
    fn duration_validation() {
        assert_eq!(parse_duration("2 d").unwrap(), "2 D");
        assert_eq!(parse_duration("1800 S").unwrap(), "1800 S");
        assert!(parse_duration("1D").is_err());
        assert!(parse_duration("0 D").is_err());
        assert!(parse_duration("1 Q").is_err());
    }

    #[test]
    fn bar_time_formats() {
        assert_eq!(parse_bar_time("1700000000").unwrap(), 1_700_000_000);
        assert_eq!(parse_bar_time("20240102").unwrap(), 1_704_153_600);
        assert_eq!(parse_bar_time("20240102  15:30:00").unwrap(), 1_704_209_400);
        assert_eq!(
            parse_bar_time("20240102 15:30:00 US/Eastern").unwrap(),
            1_704_209_400
        );
        assert!(parse_bar_time("yesterday").is_err());
        assert_eq!(format_end(1_704_209_400), "20240102-15:30:00");
    }

    #[tokio::test]
    async fn load_returns_most_recent_bars_ascending() {
        let source = Arc::new(SeriesSource::new(LAST - 999 * MINUTE, 300));
        let p = paginator(source.clone(), fast_config());

        let bars = p.load(265598, ONE_MIN, 100, None).await.unwrap();
        assert_eq!(bars.len(), 100);
        assert_eq!(bars.last().unwrap().time, LAST);
        assert_eq!(bars[0].time, LAST - 99 * MINUTE);
        assert_strictly_ascending(&bars);
        assert_eq!(source.calls(), 1);

        let first = &source.windows.lock().unwrap()[0];
        assert_eq!(first.end_date_time, "");
        assert_eq!(first.bar_size, "1 min");
        assert_eq!(first.duration, "1 D");
    }

    #[tokio::test]
    async fn overlapping_windows_are_deduplicated() {
        let source = Arc::new(SeriesSource::new(LAST - 999 * MINUTE, 300));
        let p = paginator(source.clone(), fast_config());

        let bars = p.load(265598, ONE_MIN, 500, None).await.unwrap();
        assert_eq!(bars.len(), 500);
        assert_strictly_ascending(&bars);
        assert_eq!(source.calls(), 2);
        // The second window restated the first window's earliest bar.
        let boundary = LAST - 299 * MINUTE;
        assert_eq!(bars.iter().filter(|b| b.time == boundary).count(), 1);
    }

    #[tokio::test]
    async fn load_more_continues_without_overlap() {
        let source = Arc::new(SeriesSource::new(LAST - 999 * MINUTE, 300));
        let p = paginator(source.clone(), fast_config());

        let recent = p.load(265598, ONE_MIN, 100, None).await.unwrap();
        let earliest = recent[0].time;
        let older = p.load_more(265598, ONE_MIN, earliest, 50, None).await.unwrap();

        assert_eq!(older.len(), 50);
        assert!(older.iter().all(|b| b.time < earliest));
        assert_eq!(older.last().unwrap().time, earliest - MINUTE);
        assert_strictly_ascending(&older);

        let windows = source.windows.lock().unwrap();
        assert_eq!(windows[1].end_date_time, format_end(earliest));
    }

    #[tokio::test]
    async fn stops_after_max_rounds_when_each_window_yields_one_bar() {
        let mut source = SeriesSource::new(0, 1);
        source.inclusive = false;
        let source = Arc::new(source);
        let config = PaginatorConfig {
            max_rounds: 7,
            ..fast_config()
        };
        let p = paginator(source.clone(), config);

        let bars = p.load(265598, ONE_MIN, 1000, None).await.unwrap();
        assert_eq!(source.calls(), 7);
        assert_eq!(bars.len(), 7);
        assert_strictly_ascending(&bars);
    }

    #[tokio::test]
    async fn stops_when_history_is_exhausted() {
        let source = Arc::new(SeriesSource::new(LAST - 149 * MINUTE, 100));
        let p = paginator(source.clone(), fast_config());

        let bars = p.load(265598, ONE_MIN, 500, None).await.unwrap();
        assert_eq!(bars.len(), 150);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn duration_override_applies_to_every_window() {
        let source = Arc::new(SeriesSource::new(LAST - 999 * MINUTE, 300));
        let p = paginator(source.clone(), fast_config());

        p.load(265598, ONE_MIN, 400, Some("2 d")).await.unwrap();
        assert!(source.windows.lock().unwrap().iter().all(|w| w.duration == "2 D"));

        let err = p.load(265598, ONE_MIN, 10, Some("forever")).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn retries_transient_window_failures() {
        let mut source = SeriesSource::new(LAST - 999 * MINUTE, 300);
        source.failure = Some(ProxyError::Timeout(Duration::from_secs(1)));
        source.failures = AtomicU32::new(2);
        let source = Arc::new(source);
        let p = paginator(source.clone(), fast_config());

        let bars = p.load(265598, ONE_MIN, 10, None).await.unwrap();
        assert_eq!(bars.len(), 10);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let mut source = SeriesSource::new(LAST - 999 * MINUTE, 300);
        source.failure = Some(ProxyError::UpstreamRejected {
            code: 366,
            message: "No historical data query found".into(),
        });
        source.failures = AtomicU32::new(10);
        let source = Arc::new(source);
        let p = paginator(source.clone(), fast_config());

        let err = p.load(265598, ONE_MIN, 10, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamRejected { code: 366, .. }));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn caller_errors_are_not_retried() {
        let mut source = SeriesSource::new(LAST - 999 * MINUTE, 300);
        source.failure = Some(ProxyError::InvalidArgument("bad bar size".into()));
        source.failures = AtomicU32::new(10);
        let source = Arc::new(source);
        let p = paginator(source.clone(), fast_config());

        assert!(p.load(265598, ONE_MIN, 10, None).await.is_err());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn rejects_out_of_range_limit_and_unknown_contract() {
        let source = Arc::new(SeriesSource::new(LAST - 999 * MINUTE, 300));
        let p = paginator(source.clone(), fast_config());

        for limit in [0, 5001] {
            let err = p.load(265598, ONE_MIN, limit, None).await.unwrap_err();
            assert!(matches!(err, ProxyError::InvalidArgument(_)));
        }
        let err = p.load(0, ONE_MIN, 10, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
        assert_eq!(source.calls(), 0);
    }
}
