//! Pre-loop data validation: monotonic timestamps, OHLC consistency, and a
//! gap scan. Hard violations abort the run via `DataError`; gaps are only
//! reported, since sparse trading calendars (holidays, halts) are normal.

use crate::error::DataError;
use crate::models::Bar;

#[derive(Debug, Clone, Copy)]
pub struct DataQualityReport {
    pub bar_count: usize,
    pub gap_count: usize,
    pub max_gap_days: i64,
}

/// Longer than this between consecutive bars counts as a gap worth noting
/// (covers week-long holidays without flagging an ordinary weekend).
const GAP_THRESHOLD_DAYS: i64 = 5;

pub fn scan(symbol: &str, bars: &[Bar]) -> Result<DataQualityReport, DataError> {
    if bars.is_empty() {
        return Err(DataError::EmptyBars(symbol.to_string()));
    }

    let mut gap_count = 0;
    let mut max_gap_days = 0i64;

    for (i, bar) in bars.iter().enumerate() {
        if bar.high < bar.low
            || bar.open > bar.high
            || bar.open < bar.low
            || bar.close > bar.high
            || bar.close < bar.low
        {
            return Err(DataError::InvalidOhlc(symbol.to_string(), bar.timestamp));
        }

        if i > 0 {
            let prev = bars[i - 1].timestamp;
            if bar.timestamp <= prev {
                return Err(DataError::NonMonotonicTimestamps(symbol.to_string(), i));
            }
            let gap = (bar.timestamp - prev).num_days();
            if gap > GAP_THRESHOLD_DAYS {
                gap_count += 1;
                max_gap_days = max_gap_days.max(gap);
            }
        }
    }

    if gap_count > 0 {
        tracing::warn!(symbol, gap_count, max_gap_days, "data gaps detected");
    }

    Ok(DataQualityReport {
        bar_count: bars.len(),
        gap_count,
        max_gap_days,
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    use super::*;

    fn bar(day: u32, close: rust_decimal::Decimal) -> Bar {
        Bar {
            timestamp: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(scan("X", &[]), Err(DataError::EmptyBars(_))));
    }

    #[test]
    fn rejects_inverted_high_low() {
        let mut b = bar(1, dec!(100));
        b.high = dec!(90);
        b.low = dec!(95);
        assert!(matches!(scan("X", &[b]), Err(DataError::InvalidOhlc(_, _))));
    }

    #[test]
    fn rejects_non_monotonic() {
        let bars = vec![bar(5, dec!(100)), bar(3, dec!(101))];
        assert!(matches!(scan("X", &bars), Err(DataError::NonMonotonicTimestamps(_, 1))));
    }

    #[test]
    fn counts_gaps() {
        let bars = vec![bar(1, dec!(100)), bar(20, dec!(101)), bar(22, dec!(102))];
        let report = scan("X", &bars).unwrap();
        assert_eq!(report.gap_count, 1);
        assert_eq!(report.bar_count, 3);
    }

    #[test]
    fn clean_series_has_no_gaps() {
        let bars = vec![bar(1, dec!(100)), bar(2, dec!(101)), bar(3, dec!(102))];
        let report = scan("X", &bars).unwrap();
        assert_eq!(report.gap_count, 0);
    }
}
