use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Timezone attached to a timestamp column or a site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Zone {
    Utc,
    Fixed(FixedOffset),
    Named(Tz),
}

impl Zone {
    /// Parse an IANA name ("Australia/Brisbane") or a fixed offset ("+10:00").
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        if name.eq_ignore_ascii_case("utc") || name == "Z" {
            return Some(Self::Utc);
        }
        if let Ok(tz) = name.parse::<Tz>() {
            return Some(Self::Named(tz));
        }
        name.parse::<FixedOffset>().ok().map(Self::Fixed)
    }

    /// Wall-clock time for an instant.
    pub fn local(&self, micros: i64) -> Option<NaiveDateTime> {
        let utc = DateTime::<Utc>::from_timestamp_micros(micros)?;
        Some(match self {
            Self::Utc => utc.naive_utc(),
            Self::Fixed(offset) => utc.with_timezone(offset).naive_local(),
            Self::Named(tz) => utc.with_timezone(tz).naive_local(),
        })
    }

    /// Instant for a wall-clock time. Ambiguous times resolve to the earliest instant.
    pub fn instant(&self, local: NaiveDateTime) -> Option<i64> {
        let utc = match self {
            Self::Utc => Some(local.and_utc()),
            Self::Fixed(offset) => offset
                .from_local_datetime(&local)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
            Self::Named(tz) => tz
                .from_local_datetime(&local)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
        }?;
        Some(utc.timestamp_micros())
    }

    pub fn to_rfc3339(&self, micros: i64) -> Option<String> {
        let utc = DateTime::<Utc>::from_timestamp_micros(micros)?;
        Some(match self {
            Self::Utc => utc.to_rfc3339(),
            Self::Fixed(offset) => utc.with_timezone(offset).to_rfc3339(),
            Self::Named(tz) => utc.with_timezone(tz).to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    #[test]
    fn test_parse_variants() {
        assert_eq!(Zone::parse("UTC"), Some(Zone::Utc));
        assert!(matches!(Zone::parse("Europe/London"), Some(Zone::Named(_))));
        assert!(matches!(Zone::parse("+10:00"), Some(Zone::Fixed(_))));
        assert_eq!(Zone::parse("Not/AZone"), None);
    }

    #[test]
    fn test_local_fixed_offset() {
        let zone = Zone::parse("+10:00").unwrap();
        let midnight_utc = NaiveDate::from_ymd_opt(2023, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_micros();
        assert_eq!(zone.local(midnight_utc).unwrap().hour(), 10);
    }

    #[test]
    fn test_instant_inverts_local() {
        let zone = Zone::parse("Australia/Brisbane").unwrap();
        let local = NaiveDate::from_ymd_opt(2023, 6, 1)
            .unwrap()
            .and_hms_opt(5, 30, 0)
            .unwrap();
        let t = zone.instant(local).unwrap();
        assert_eq!(zone.local(t), Some(local));
    }
}
