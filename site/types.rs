use ndarray::{Array1, ArrayView1};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ops::Deref;

/// A fitted beta vector, ordered like the augmented design matrix (`const` first).
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct Coefficients(pub Array1<f64>);

impl Coefficients {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }
}

impl Deref for Coefficients {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Array1<f64>> for Coefficients {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

impl From<Vec<f64>> for Coefficients {
    fn from(values: Vec<f64>) -> Self {
        Self(Array1::from_vec(values))
    }
}

// On the wire a beta vector is a flat JSON list, not ndarray's `{v, dim, data}` form.
impl Serialize for Coefficients {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

impl<'de> Deserialize<'de> for Coefficients {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<f64>::deserialize(deserializer).map(Coefficients::from)
    }
}

/// A per-target-column result. Columns with no observed rows are `Empty` in every round,
/// so the aggregator can skip them without inspecting sentinel values.
///
/// `Empty` is written as `[]`. When reading, `[]` and `null` both decode to `Empty`.
#[derive(Clone, Debug, PartialEq)]
pub enum PerColumn<T> {
    Observed(T),
    Empty,
}

impl<T> PerColumn<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, PerColumn::Empty)
    }

    pub fn as_observed(&self) -> Option<&T> {
        match self {
            PerColumn::Observed(value) => Some(value),
            PerColumn::Empty => None,
        }
    }

    pub fn map<U, F: FnOnce(&T) -> U>(&self, f: F) -> PerColumn<U> {
        match self {
            PerColumn::Observed(value) => PerColumn::Observed(f(value)),
            PerColumn::Empty => PerColumn::Empty,
        }
    }
}

impl<T: Serialize> Serialize for PerColumn<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PerColumn::Observed(value) => value.serialize(serializer),
            PerColumn::Empty => serializer.collect_seq(std::iter::empty::<f64>()),
        }
    }
}

impl<'de, T: serde::de::DeserializeOwned> Deserialize<'de> for PerColumn<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Null => Ok(PerColumn::Empty),
            serde_json::Value::Array(ref items) if items.is_empty() => Ok(PerColumn::Empty),
            other => serde_json::from_value(other)
                .map(PerColumn::Observed)
                .map_err(D::Error::custom),
        }
    }
}
