//! Trading session calendar
//!
//! Outside-market ticks bypass volume gating in the fan-out engine, so the
//! engine needs to know whether an instrument's session is open right now.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::errors::SessionError;

/// Regular trading hours of one exchange segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    /// Exchange local time offset from UTC, in minutes.
    pub utc_offset_minutes: i32,
    pub trading_days: Vec<Weekday>,
}

impl MarketHours {
    pub fn new(
        open: NaiveTime,
        close: NaiveTime,
        utc_offset_minutes: i32,
        trading_days: Vec<Weekday>,
    ) -> Result<Self, SessionError> {
        if FixedOffset::east_opt(utc_offset_minutes * 60).is_none() {
            return Err(SessionError::InvalidOffset {
                minutes: utc_offset_minutes,
            });
        }
        if close <= open {
            return Err(SessionError::EmptySession {
                open: open.to_string(),
                close: close.to_string(),
            });
        }
        Ok(Self {
            open,
            close,
            utc_offset_minutes,
            trading_days,
        })
    }

    /// NSE cash segment: 09:15-15:30 IST, Monday to Friday.
    pub fn nse_equity() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
            utc_offset_minutes: 330,
            trading_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
        }
    }

    /// Whether the session is open at the given instant.
    pub fn is_open_at(&self, at: DateTime<Utc>) -> bool {
        let Some(offset) = FixedOffset::east_opt(self.utc_offset_minutes * 60) else {
            return false;
        };
        let local = at.with_timezone(&offset);
        if !self.trading_days.contains(&local.weekday()) {
            return false;
        }
        let time = local.time();
        time >= self.open && time < self.close
    }

    /// Whether the session is open now.
    pub fn is_open_now(&self) -> bool {
        self.is_open_at(Utc::now())
    }
}

impl Default for MarketHours {
    fn default() -> Self {
        Self::nse_equity()
    }
}
