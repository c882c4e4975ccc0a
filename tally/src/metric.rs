//! Metric model for tally.
//!
//! A metric is identified by its [`MetricKey`] (kind + id) and carries either
//! a gauge `value` or a counter `delta`, never both. [`MetricRequest`] has the
//! same shape and is the input to every write; it may be partially populated
//! when it only names a key.
//!
//! # Example
//!
//! ```rust
//! use tally::metric::{Metric, MetricKind, MetricRequest};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stored = Metric::counter("hits", 5);
//! let request = MetricRequest::counter("hits", 3);
//!
//! // Counters accumulate onto the stored delta.
//! let next = request.accumulate(&stored)?.expect("delta present");
//! assert_eq!(next.delta, Some(8));
//!
//! let parsed = MetricRequest::parse(MetricKind::Gauge, "temp", "21.5")?;
//! assert_eq!(parsed.value, Some(21.5));
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MetricError;

/// The two supported metric kinds.
///
/// Variant order matches the lowercase names so sorting by kind agrees with
/// the relational backend's `ORDER BY kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Accumulates deltas across writes.
    Counter,
    /// Replaced wholesale on each write.
    Gauge,
}

impl MetricKind {
    /// Lowercase name used in snapshots, the database and the CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            other => Err(MetricError::UnknownKind(other.to_string())),
        }
    }
}

/// Natural key of a stored metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    /// The metric kind.
    pub kind: MetricKind,
    /// The metric name.
    pub id: String,
}

impl MetricKey {
    /// Creates a new key.
    pub fn new(kind: MetricKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// A stored metric record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// The metric name.
    pub id: String,
    /// Gauge or counter.
    #[serde(rename = "type")]
    pub kind: MetricKind,
    /// Current gauge value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Accumulated counter total.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
}

impl Metric {
    /// Creates a gauge record.
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Gauge,
            value: Some(value),
            delta: None,
        }
    }

    /// Creates a counter record.
    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Counter,
            value: None,
            delta: Some(delta),
        }
    }

    /// Returns this record's key.
    pub fn key(&self) -> MetricKey {
        MetricKey::new(self.kind, self.id.clone())
    }

    /// Overwrites every field the request populates.
    ///
    /// This is plain replacement; accumulation is decided by the caller
    /// before the request reaches a store.
    pub fn apply(&mut self, request: &MetricRequest) {
        if let Some(value) = request.value {
            self.value = Some(value);
        }
        if let Some(delta) = request.delta {
            self.delta = Some(delta);
        }
    }
}

impl From<&MetricRequest> for Metric {
    fn from(request: &MetricRequest) -> Self {
        Self {
            id: request.id.clone(),
            kind: request.kind,
            value: request.value,
            delta: request.delta,
        }
    }
}

/// Input to create and update operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRequest {
    /// The metric name.
    pub id: String,
    /// Gauge or counter.
    #[serde(rename = "type")]
    pub kind: MetricKind,
    /// New gauge value, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Counter increment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
}

impl MetricRequest {
    /// A gauge write.
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Gauge,
            value: Some(value),
            delta: None,
        }
    }

    /// A counter increment.
    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Counter,
            value: None,
            delta: Some(delta),
        }
    }

    /// A request naming only a key, with no value or delta.
    pub fn key_only(kind: MetricKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            value: None,
            delta: None,
        }
    }

    /// Parses the textual form used by collectors (`gauge temp 21.5`,
    /// `counter hits 3`).
    ///
    /// # Errors
    ///
    /// Returns [`MetricError::InvalidValue`] if `raw` is not a float for a
    /// gauge or not an integer for a counter, and any error from
    /// [`MetricRequest::validate`].
    pub fn parse(kind: MetricKind, id: &str, raw: &str) -> Result<Self, MetricError> {
        let invalid = || MetricError::InvalidValue {
            kind,
            raw: raw.to_string(),
        };
        let request = match kind {
            MetricKind::Gauge => Self::gauge(id, raw.trim().parse::<f64>().map_err(|_| invalid())?),
            MetricKind::Counter => {
                Self::counter(id, raw.trim().parse::<i64>().map_err(|_| invalid())?)
            }
        };
        request.validate()?;
        Ok(request)
    }

    /// Returns the key this request targets.
    pub fn key(&self) -> MetricKey {
        MetricKey::new(self.kind, self.id.clone())
    }

    /// Checks that the request is well formed for its kind.
    ///
    /// A request may omit its value or delta entirely; see
    /// [`MetricRequest::validate_write`] for the stricter batch rule.
    ///
    /// # Errors
    ///
    /// Returns [`MetricError`] for an empty id, a field belonging to the
    /// other kind, or a non-finite gauge value.
    pub fn validate(&self) -> Result<(), MetricError> {
        if self.id.is_empty() {
            return Err(MetricError::EmptyId);
        }
        match self.kind {
            MetricKind::Gauge => {
                if self.delta.is_some() {
                    return Err(self.mismatched("delta"));
                }
                if let Some(value) = self.value
                    && !value.is_finite()
                {
                    return Err(MetricError::NonFiniteValue {
                        id: self.id.clone(),
                        value,
                    });
                }
            }
            MetricKind::Counter => {
                if self.value.is_some() {
                    return Err(self.mismatched("value"));
                }
            }
        }
        Ok(())
    }

    /// Like [`MetricRequest::validate`], but also requires the field that
    /// belongs to the request's kind.
    ///
    /// # Errors
    ///
    /// Returns [`MetricError::MissingField`] when a gauge has no value or a
    /// counter has no delta, plus every error of `validate`.
    pub fn validate_write(&self) -> Result<(), MetricError> {
        self.validate()?;
        let missing = match self.kind {
            MetricKind::Gauge if self.value.is_none() => Some("value"),
            MetricKind::Counter if self.delta.is_none() => Some("delta"),
            _ => None,
        };
        match missing {
            Some(field) => Err(MetricError::MissingField {
                kind: self.kind,
                id: self.id.clone(),
                field,
            }),
            None => Ok(()),
        }
    }

    /// Computes the write this request implies against the stored record.
    ///
    /// Gauges replace the stored value; counters add the stored delta to the
    /// request's delta. Returns `None` when the request carries nothing to
    /// write. The request itself is never modified.
    ///
    /// # Errors
    ///
    /// Returns [`MetricError::CounterOverflow`] if the new total does not fit
    /// in an `i64`.
    pub fn accumulate(&self, stored: &Metric) -> Result<Option<MetricRequest>, MetricError> {
        match self.kind {
            MetricKind::Gauge => Ok(self.value.map(|_| self.clone())),
            MetricKind::Counter => match self.delta {
                None => Ok(None),
                Some(delta) => {
                    let total = add_delta(&self.id, stored.delta.unwrap_or(0), delta)?;
                    Ok(Some(Self::counter(self.id.clone(), total)))
                }
            },
        }
    }

    fn mismatched(&self, field: &'static str) -> MetricError {
        MetricError::MismatchedField {
            kind: self.kind,
            id: self.id.clone(),
            field,
        }
    }
}

/// Adds two counter deltas, failing on overflow.
pub(crate) fn add_delta(id: &str, current: i64, delta: i64) -> Result<i64, MetricError> {
    current
        .checked_add(delta)
        .ok_or_else(|| MetricError::CounterOverflow {
            id: id.to_string(),
            current,
            delta,
        })
}
