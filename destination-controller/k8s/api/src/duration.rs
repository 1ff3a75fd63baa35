use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A duration in the Go `time.ParseDuration` format, as used by
/// `ServiceProfile` timeouts and `Link` probe periods (e.g. `"300ms"`,
/// `"1m30s"`).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct GoDuration(pub Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("negative durations are not supported")]
    Negative,

    #[error("invalid floating-point number: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', 'ms', 's', 'm', or 'h'";

impl From<Duration> for GoDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<GoDuration> for Duration {
    fn from(GoDuration(d): GoDuration) -> Self {
        d
    }
}

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(mut s: &str) -> Result<Self, Self::Err> {
        fn unit_base(unit: &str) -> Result<Duration, ParseError> {
            const MINUTE: Duration = Duration::from_secs(60);
            match unit {
                "ns" => Ok(Duration::from_nanos(1)),
                // U+00B5 is the "micro sign"; U+03BC is Greek mu.
                "us" | "\u{00b5}s" | "\u{03bc}s" => Ok(Duration::from_micros(1)),
                "ms" => Ok(Duration::from_millis(1)),
                "s" => Ok(Duration::from_secs(1)),
                "m" => Ok(MINUTE),
                "h" => Ok(MINUTE * 60),
                _ => Err(ParseError::InvalidUnit),
            }
        }

        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        s = s.trim_start_matches('+');

        if s == "0" {
            return Ok(Self(Duration::ZERO));
        }

        let mut total = Duration::ZERO;
        while !s.is_empty() {
            let unit_start = s
                .find(|c: char| c.is_alphabetic())
                .ok_or(ParseError::NoUnit)?;
            let (val, rest) = s.split_at(unit_start);
            let val = val.parse::<f64>()?;
            let unit_end = rest
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(rest.len());
            let (unit, rest) = rest.split_at(unit_end);
            total += unit_base(unit)?.mul_f64(val);
            s = rest;
        }

        Ok(Self(total))
    }
}

impl fmt::Debug for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            return f.write_str("0s");
        }
        if nanos % 1_000_000 == 0 {
            let millis = self.0.as_millis();
            if millis % 1_000 == 0 {
                write!(f, "{}s", millis / 1_000)
            } else {
                write!(f, "{millis}ms")
            }
        } else {
            write!(f, "{nanos}ns")
        }
    }
}

impl Serialize for GoDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GoDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = GoDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string in Go `time.Duration` format")
            }

            fn visit_str<E: de::Error>(self, s: &str) -> Result<Self::Value, E> {
                s.parse().map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}

impl schemars::JsonSchema for GoDuration {
    fn schema_name() -> String {
        "GoDuration".to_string()
    }

    fn json_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        schemars::schema::SchemaObject {
            instance_type: Some(schemars::schema::InstanceType::String.into()),
            ..Default::default()
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple() {
        assert_eq!(
            "300ms".parse::<GoDuration>().unwrap().0,
            Duration::from_millis(300)
        );
        assert_eq!("10s".parse::<GoDuration>().unwrap().0, Duration::from_secs(10));
        assert_eq!("0".parse::<GoDuration>().unwrap().0, Duration::ZERO);
    }

    #[test]
    fn parses_compound() {
        assert_eq!(
            "1m30s".parse::<GoDuration>().unwrap().0,
            Duration::from_secs(90)
        );
        assert_eq!(
            "1.5h".parse::<GoDuration>().unwrap().0,
            Duration::from_secs(5400)
        );
    }

    #[test]
    fn rejects_invalid() {
        assert_eq!("10".parse::<GoDuration>(), Err(ParseError::NoUnit));
        assert_eq!("10d".parse::<GoDuration>(), Err(ParseError::InvalidUnit));
        assert_eq!("-5s".parse::<GoDuration>(), Err(ParseError::Negative));
    }

    #[test]
    fn displays_round_trip() {
        for s in ["300ms", "10s", "90s"] {
            let d = s.parse::<GoDuration>().unwrap();
            assert_eq!(d.to_string().parse::<GoDuration>().unwrap(), d);
        }
    }
}
