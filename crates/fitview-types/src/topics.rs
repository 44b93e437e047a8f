//! Topic names and retained topic records.
//!
//! A topic is a named, ordered log of state-update messages. Clients
//! subscribe to every topic implicitly; on connect they receive the most
//! recent record of each topic that has one.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// The closed set of topics the server publishes on.
///
/// Serialized in `snake_case`, which is also the event name clients
/// listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Topic {
    /// Human-readable log lines (`{message, title}`).
    Log,
    /// Parameter values changed; clients should re-query parameters.
    UpdateParameters,
    /// Model structure changed (e.g. the fitted parameter set).
    UpdateModel,
    /// A new problem was loaded (`{pathlist, filename}`).
    ModelLoaded,
    /// Active fit description, or an empty object when no fit is running.
    FitActive,
    /// A new uncertainty summary is available.
    UncertaintyUpdate,
    /// A new convergence history is available.
    ConvergenceUpdate,
    /// Fitter settings chosen by a client.
    FitterSettings,
    /// Fitter selected by a client.
    FitterActive,
}

impl Topic {
    /// Every topic, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::Log,
        Self::UpdateParameters,
        Self::UpdateModel,
        Self::ModelLoaded,
        Self::FitActive,
        Self::UncertaintyUpdate,
        Self::ConvergenceUpdate,
        Self::FitterSettings,
        Self::FitterActive,
    ];

    /// Wire name of the topic.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::UpdateParameters => "update_parameters",
            Self::UpdateModel => "update_model",
            Self::ModelLoaded => "model_loaded",
            Self::FitActive => "fit_active",
            Self::UncertaintyUpdate => "uncertainty_update",
            Self::ConvergenceUpdate => "convergence_update",
            Self::FitterSettings => "fitter_settings",
            Self::FitterActive => "fitter_active",
        }
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_owned()))
    }
}

/// Error returned when a string does not name a known [`Topic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTopic(pub String);

impl core::fmt::Display for UnknownTopic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "topic {} not defined", self.0)
    }
}

impl std::error::Error for UnknownTopic {}

/// One retained message on a topic.
///
/// `timestamp` is the publish time in decimal seconds since the Unix
/// epoch with exactly six fractional digits (e.g. `"1700000000.123456"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TopicRecord {
    /// The published payload.
    pub message: serde_json::Value,
    /// Publish time, decimal seconds with microsecond precision.
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_round_trip_through_from_str() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>(), Ok(topic));
        }
    }

    #[test]
    fn serde_name_matches_wire_name() {
        for topic in Topic::ALL {
            let json = serde_json::to_value(topic).ok();
            assert_eq!(json, Some(serde_json::Value::from(topic.as_str())));
        }
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let err = "fit_progress".parse::<Topic>();
        assert_eq!(err, Err(UnknownTopic(String::from("fit_progress"))));
    }
}
