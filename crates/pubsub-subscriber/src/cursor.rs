//! Position in the event stream ("timetoken") plus region hint.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Opaque, totally ordered stream position.
///
/// A zero timetoken asks the service for "now": the response carries the
/// current time as the next cursor and no catch-up is performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub timetoken: u64,
    pub region: Option<u32>,
}

impl Cursor {
    pub const ZERO: Cursor = Cursor {
        timetoken: 0,
        region: None,
    };

    pub fn new(timetoken: u64, region: Option<u32>) -> Self {
        Self { timetoken, region }
    }

    pub fn is_zero(&self) -> bool {
        self.timetoken == 0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.region {
            Some(region) => write!(f, "{}@{region}", self.timetoken),
            None => write!(f, "{}", self.timetoken),
        }
    }
}

impl FromStr for Cursor {
    type Err = Error;

    /// Parses the decimal timetoken form (`"15000000000000000"`), optionally
    /// followed by `@region`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tt, region) = match s.split_once('@') {
            Some((tt, region)) => {
                let region = region
                    .parse::<u32>()
                    .map_err(|e| Error::Decode(format!("invalid region {region:?}: {e}")))?;
                (tt, Some(region))
            }
            None => (s, None),
        };
        let timetoken = tt
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::Decode(format!("invalid timetoken {tt:?}: {e}")))?;
        Ok(Cursor { timetoken, region })
    }
}

impl From<u64> for Cursor {
    fn from(timetoken: u64) -> Self {
        Cursor {
            timetoken,
            region: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_timetoken() {
        let c: Cursor = "15000000000000000".parse().unwrap();
        assert_eq!(c, Cursor::new(15_000_000_000_000_000, None));
        assert!(!c.is_zero());
    }

    #[test]
    fn parse_with_region() {
        let c: Cursor = "17000000000000001@12".parse().unwrap();
        assert_eq!(c.timetoken, 17_000_000_000_000_001);
        assert_eq!(c.region, Some(12));
        assert_eq!(c.to_string(), "17000000000000001@12");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("abc".parse::<Cursor>().is_err());
        assert!("1@x".parse::<Cursor>().is_err());
    }

    #[test]
    fn ordering_follows_timetoken() {
        assert!(Cursor::from(2) > Cursor::from(1));
        assert!(Cursor::ZERO < Cursor::from(1));
        assert!(Cursor::ZERO.is_zero());
    }
}
