//! Mapping from a raw transport result to a delivery outcome.
//!
//! Precedence is fixed: any transport-level failure is transient, then the
//! HTTP status decides. Operators may override how individual status codes
//! or whole status classes are treated; transport failures cannot be
//! overridden.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    client::RawResult,
    error::{DeliveryError, Result},
};

/// What the sink does with the unit of work after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The endpoint accepted the payload. Commit.
    Delivered {
        /// Status code of the accepting response
        status_code: u16,
    },
    /// An unmodified retry may succeed. Roll back and back off.
    TransientFailure {
        /// Status code, if the endpoint answered at all
        status_code: Option<u16>,
        /// Human readable reason
        reason: String,
    },
    /// Retrying the identical request cannot help. Roll back and raise.
    FatalFailure {
        /// Status code of the rejecting response
        status_code: u16,
        /// Human readable reason
        reason: String,
    },
}

impl DeliveryOutcome {
    /// Returns `true` only for [`DeliveryOutcome::Delivered`].
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Treatment an operator can assign to a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeClass {
    /// Commit as delivered.
    Delivered,
    /// Roll back and back off.
    Transient,
    /// Roll back and raise.
    Fatal,
}

/// Key of a status override: an exact code (`"404"`) or a class (`"4XX"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusMatcher {
    /// One exact status code.
    Exact(u16),
    /// Every code whose hundreds digit matches.
    Class(u8),
}

impl FromStr for StatusMatcher {
    type Err = DeliveryError;

    fn from_str(key: &str) -> Result<Self> {
        let key = key.trim();
        let invalid =
            || DeliveryError::configuration(format!("invalid status override key '{key}'"));

        if key.len() != 3 {
            return Err(invalid());
        }

        let upper = key.to_ascii_uppercase();
        if let Some(digit) = upper.strip_suffix("XX") {
            let class = digit.parse::<u8>().map_err(|_| invalid())?;
            if !(1..=5).contains(&class) {
                return Err(invalid());
            }
            return Ok(Self::Class(class));
        }

        let code = key.parse::<u16>().map_err(|_| invalid())?;
        if !(100..=599).contains(&code) {
            return Err(invalid());
        }
        Ok(Self::Exact(code))
    }
}

impl fmt::Display for StatusMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(code) => write!(f, "{code}"),
            Self::Class(class) => write!(f, "{class}XX"),
        }
    }
}

/// Resolved status overrides, consulted after the transport succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusPolicy {
    exact: HashMap<u16, OutcomeClass>,
    class: HashMap<u8, OutcomeClass>,
}

impl StatusPolicy {
    /// Builds a policy from configured `key -> class` overrides.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if any key is not a valid code
    /// or class.
    pub fn from_overrides(overrides: &BTreeMap<String, OutcomeClass>) -> Result<Self> {
        let mut policy = Self::default();
        for (key, class) in overrides {
            match key.parse::<StatusMatcher>()? {
                StatusMatcher::Exact(code) => policy.exact.insert(code, *class),
                StatusMatcher::Class(digit) => policy.class.insert(digit, *class),
            };
        }
        Ok(policy)
    }

    /// Returns how a response with `status_code` should be treated.
    pub fn resolve(&self, status_code: u16) -> OutcomeClass {
        if let Some(class) = self.exact.get(&status_code) {
            return *class;
        }
        let digit = u8::try_from(status_code / 100).unwrap_or(u8::MAX);
        if let Some(class) = self.class.get(&digit) {
            return *class;
        }
        default_class(status_code)
    }
}

fn default_class(status_code: u16) -> OutcomeClass {
    match status_code {
        200..=299 => OutcomeClass::Delivered,
        500..=599 => OutcomeClass::Transient,
        _ => OutcomeClass::Fatal,
    }
}

/// Classifies the result of one attempt.
pub fn classify(result: &RawResult, policy: &StatusPolicy) -> DeliveryOutcome {
    let response = match result {
        RawResult::Failed(failure) => {
            return DeliveryOutcome::TransientFailure {
                status_code: None,
                reason: failure.to_string(),
            };
        },
        RawResult::Response(response) => response,
    };

    let status_code = response.status_code;
    match policy.resolve(status_code) {
        OutcomeClass::Delivered => DeliveryOutcome::Delivered { status_code },
        OutcomeClass::Transient => DeliveryOutcome::TransientFailure {
            status_code: Some(status_code),
            reason: format!("endpoint answered HTTP {status_code}"),
        },
        OutcomeClass::Fatal => DeliveryOutcome::FatalFailure {
            status_code,
            reason: format!("endpoint rejected request with HTTP {status_code}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{client::DeliveryResponse, error::TransportFailure};

    fn response(status_code: u16) -> RawResult {
        RawResult::Response(DeliveryResponse {
            status_code,
            body: String::new(),
            duration: Duration::from_millis(3),
        })
    }

    #[test]
    fn default_mapping_follows_status_ranges() {
        let policy = StatusPolicy::default();

        assert_eq!(classify(&response(200), &policy), DeliveryOutcome::Delivered {
            status_code: 200
        });
        assert!(classify(&response(204), &policy).is_delivered());
        assert!(matches!(
            classify(&response(503), &policy),
            DeliveryOutcome::TransientFailure { status_code: Some(503), .. }
        ));
        assert!(matches!(
            classify(&response(404), &policy),
            DeliveryOutcome::FatalFailure { status_code: 404, .. }
        ));
        assert!(matches!(
            classify(&response(302), &policy),
            DeliveryOutcome::FatalFailure { status_code: 302, .. }
        ));
    }

    #[test]
    fn transport_failures_are_transient_regardless_of_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("5XX".to_string(), OutcomeClass::Fatal);
        let policy = StatusPolicy::from_overrides(&overrides).unwrap();

        let failure = RawResult::Failed(TransportFailure::ConnectionReset {
            message: "closed".to_string(),
        });
        assert!(matches!(
            classify(&failure, &policy),
            DeliveryOutcome::TransientFailure { status_code: None, .. }
        ));
    }

    #[test]
    fn exact_override_beats_class_override() {
        let mut overrides = BTreeMap::new();
        overrides.insert("4xx".to_string(), OutcomeClass::Transient);
        overrides.insert("409".to_string(), OutcomeClass::Delivered);
        let policy = StatusPolicy::from_overrides(&overrides).unwrap();

        assert_eq!(policy.resolve(409), OutcomeClass::Delivered);
        assert_eq!(policy.resolve(429), OutcomeClass::Transient);
        assert_eq!(policy.resolve(500), OutcomeClass::Transient);
        assert_eq!(policy.resolve(200), OutcomeClass::Delivered);
    }

    #[test]
    fn status_matcher_parsing() {
        assert_eq!("404".parse::<StatusMatcher>().unwrap(), StatusMatcher::Exact(404));
        assert_eq!("5XX".parse::<StatusMatcher>().unwrap(), StatusMatcher::Class(5));
        assert_eq!("2xx".parse::<StatusMatcher>().unwrap(), StatusMatcher::Class(2));
        assert_eq!(StatusMatcher::Class(4).to_string(), "4XX");

        for bad in ["", "40", "4040", "6XX", "0XX", "abc", "099", "X04"] {
            assert!(bad.parse::<StatusMatcher>().is_err(), "{bad} should be rejected");
        }
    }
}
