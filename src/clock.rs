use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Wall-clock helpers bound to the configured IANA zone. Everything that
/// reasons about "the current hour" goes through this so DST shifts stay in
/// one place.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    tz: Tz,
}

impl Clock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    /// Hour-of-day of local now, 0..=23. Index into the hourly plan vectors.
    pub fn current_hour(&self) -> usize {
        self.now().hour() as usize
    }

    /// Today's midnight in the local zone. DST-ambiguous midnights resolve to
    /// the earlier instant.
    pub fn local_midnight(&self) -> DateTime<Tz> {
        let now = self.now();
        self.tz
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .earliest()
            .unwrap_or(now)
    }

    /// ISO-8601 timestamp with the local offset, as used in status payloads.
    pub fn now_iso(&self) -> String {
        self.now().to_rfc3339()
    }
}
