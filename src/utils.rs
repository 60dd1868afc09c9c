/// Utility functions for time handling and formatting
use time::{format_description, OffsetDateTime};

use crate::models::DownloadWindow;

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    match format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]") {
        Ok(format) => dt.format(&format).unwrap_or_else(|_| dt.to_string()),
        Err(_) => dt.to_string(),
    }
}

/// Minute index (minutes since the Unix epoch) of a point in time
pub fn minute_index(dt: &OffsetDateTime) -> i64 {
    dt.unix_timestamp().div_euclid(60)
}

/// Window covering the `minutes` most recent minutes up to and including `now`
///
/// Returns None if `now` lies before the epoch or `minutes` is zero.
pub fn recent_window(now: &OffsetDateTime, minutes: u32) -> Option<DownloadWindow> {
    let to_index = u32::try_from(minute_index(now)).ok()?;
    let from_index = to_index.checked_sub(minutes.checked_sub(1)?)?;
    Some(DownloadWindow {
        from_index,
        to_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_datetime() {
        let dt = OffsetDateTime::from_unix_timestamp(1_641_938_760).unwrap();
        assert_eq!(format_datetime(&dt), "11.01.2022 - 22:06:00");
    }

    #[test]
    fn recent_window_ends_now() {
        let now = OffsetDateTime::from_unix_timestamp(27366342 * 60 + 59).unwrap();
        assert_eq!(
            recent_window(&now, 737),
            Some(DownloadWindow {
                from_index: 27365606,
                to_index: 27366342
            })
        );
        assert_eq!(recent_window(&now, 0), None);

        let early = OffsetDateTime::from_unix_timestamp(120).unwrap();
        assert_eq!(recent_window(&early, 10), None);
    }
}
