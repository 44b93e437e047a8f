//! JSON encoding of floats that may be infinite.
//!
//! JSON has no infinity, and `serde_json` silently writes `null` for it.
//! Fields tagged `#[serde(with = "crate::float::scalar")]` (or `vector`)
//! encode `+inf`/`-inf` as the strings `"inf"`/`"-inf"` instead, and
//! refuse to encode NaN. Decoding accepts either numbers or those strings.

use serde::de::{self, Deserializer};
use serde::ser::{self, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// Wire form of a possibly infinite float.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Repr {
    Number(f64),
    Text(String),
}

fn encode<E: ser::Error>(value: f64) -> Result<Repr, E> {
    if value.is_nan() {
        Err(E::custom("NaN cannot be represented in JSON"))
    } else if value.is_infinite() {
        let text = if value > 0.0 { "inf" } else { "-inf" };
        Ok(Repr::Text(text.to_owned()))
    } else {
        Ok(Repr::Number(value))
    }
}

fn decode<E: de::Error>(repr: Repr) -> Result<f64, E> {
    match repr {
        Repr::Number(value) => Ok(value),
        Repr::Text(text) => match text.as_str() {
            "inf" => Ok(f64::INFINITY),
            "-inf" => Ok(f64::NEG_INFINITY),
            other => Err(E::custom(format!("expected a number, found {other:?}"))),
        },
    }
}

/// A single `f64` field.
pub mod scalar {
    use super::{Deserialize, Deserializer, Repr, Serialize, Serializer, decode, encode};

    /// Serialize `value`, mapping infinities to strings.
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        encode(*value)?.serialize(serializer)
    }

    /// Deserialize a number or an infinity string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        decode(Repr::deserialize(deserializer)?)
    }
}

/// A `Vec<f64>` field.
pub mod vector {
    use super::{
        Deserialize, Deserializer, Repr, Serialize, SerializeSeq, Serializer, decode, encode,
    };

    /// Serialize each element, mapping infinities to strings.
    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&encode::<S::Error>(*value)?)?;
        }
        seq.end()
    }

    /// Deserialize a sequence of numbers or infinity strings.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Repr>::deserialize(deserializer)?
            .into_iter()
            .map(decode)
            .collect()
    }
}
