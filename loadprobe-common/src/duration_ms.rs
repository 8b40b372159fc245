//! Serde helpers that encode [`Duration`]s as floating-point milliseconds.
//!
//! Reports and scenario files are read by people, so `"p95": 212.5` beats
//! `{"secs": 0, "nanos": 212500000}`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(to_ms(d))
}

pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let ms = f64::deserialize(d)?;
    from_ms(ms).map_err(serde::de::Error::custom)
}

fn to_ms(d: &Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

fn from_ms(ms: f64) -> Result<Duration, String> {
    let nanos = (ms * 1_000_000.0).round();
    if !nanos.is_finite() || nanos < 0.0 || nanos >= u64::MAX as f64 {
        return Err(format!("duration must be a non-negative number of milliseconds, got {ms}"));
    }
    Ok(Duration::from_nanos(nanos as u64))
}

pub mod option {
    use super::{from_ms, to_ms};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&to_ms(d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(d)? {
            Some(ms) => from_ms(ms).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
