//! Duration parsing and serde codecs shared across the Shipwright crates.
//!
//! Config fields that express a duration accept either a humantime string
//! (`"30s"`, `"5m"`) or a raw integer of seconds, so operators can hand-edit
//! `daemon-config.json` without memorizing a unit. Internally everything is
//! a [`std::time::Duration`]; serialization always emits seconds so the
//! round trip is lossless at the granularity the daemon cares about.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a `Duration` from either a humantime string or a raw
/// integer of seconds.
pub fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        Secs(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration {s:?}: {e}"))),
        DurationHelper::Secs(secs) => Ok(Duration::from_secs(secs)),
    }
}

/// Serialize a `Duration` as a raw integer of seconds.
pub fn serialize_duration_secs<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

/// Same as [`deserialize_duration_secs`] but the field is optional.
pub fn deserialize_opt_duration_secs<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OptHelper {
        None,
        String(String),
        Secs(u64),
    }

    match Option::<OptHelper>::deserialize(deserializer)? {
        None | Some(OptHelper::None) => Ok(None),
        Some(OptHelper::String(s)) => parse_duration(&s)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration {s:?}: {e}"))),
        Some(OptHelper::Secs(secs)) => Ok(Some(Duration::from_secs(secs))),
    }
}

pub fn serialize_opt_duration_secs<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serializer.serialize_some(&d.as_secs()),
        None => serializer.serialize_none(),
    }
}

/// Parse a duration from a humantime string. Bare integers are treated as
/// a count of seconds, matching the behavior of `deserialize_duration_secs`.
pub fn parse_duration(input: &str) -> Result<Duration, ParseDurationError> {
    let trimmed = input.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed).map_err(ParseDurationError)
}

/// Render a duration the way `daemon status`/`daemon metrics` display it.
pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

#[derive(Debug)]
pub struct ParseDurationError(humantime::DurationError);

impl fmt::Display for ParseDurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseDurationError {}

/// A duration newtype with a direct `(de)serialize_duration_secs` impl.
/// Use this where a struct field would otherwise need `#[serde(with = ...)]`
/// boilerplate repeated at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationSecs(#[serde(with = "self::secs_repr")] pub Duration);

mod secs_repr {
    use super::*;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize_duration_secs(d, s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize_duration_secs(d)
    }
}

impl From<Duration> for DurationSecs {
    fn from(d: Duration) -> Self {
        DurationSecs(d)
    }
}

impl From<DurationSecs> for Duration {
    fn from(d: DurationSecs) -> Self {
        d.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_humantime_strings() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn parses_bare_integers_as_seconds() {
        assert_eq!(parse_duration("120").unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("not-a-duration").is_err());
    }

    #[test]
    fn duration_secs_roundtrips_through_json() {
        let d = DurationSecs(Duration::from_secs(45));
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "45");
        let back: DurationSecs = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn deserialize_duration_secs_accepts_either_shape() {
        #[derive(Deserialize)]
        struct Wrap {
            #[serde(deserialize_with = "deserialize_duration_secs")]
            d: Duration,
        }
        let from_str: Wrap = serde_json::from_str(r#"{"d":"30s"}"#).unwrap();
        assert_eq!(from_str.d, Duration::from_secs(30));
        let from_int: Wrap = serde_json::from_str(r#"{"d":30}"#).unwrap();
        assert_eq!(from_int.d, Duration::from_secs(30));
    }

    proptest::proptest! {
        #[test]
        fn roundtrip_is_stable(secs in 0u64..1_000_000) {
            let d = Duration::from_secs(secs);
            let json = serde_json::to_string(&DurationSecs(d)).unwrap();
            let back: DurationSecs = serde_json::from_str(&json).unwrap();
            proptest::prop_assert_eq!(back.0, d);
        }
    }
}
