use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload handed to a job handler: a map of keys to JSON values.
///
/// Stored as a JSON object in the `data` column and never modified after the
/// job is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobData(Map<String, Value>);

impl JobData {
    /// An empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of a serializable value.
    pub fn with(
        mut self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Insert a serializable value, replacing any previous value under `key`.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<(), serde_json::Error> {
        self.0.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Read `key` as `T`.
    ///
    /// Returns `Ok(None)` when the key is absent and an error when the stored
    /// value does not deserialize as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.0
            .get(key)
            .map(|value| T::deserialize(value))
            .transpose()
    }

    /// The raw JSON value under `key`.
    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize any struct or map into a payload.
    ///
    /// The value must serialize to a JSON object.
    pub fn from_serializable(value: &impl Serialize) -> Result<Option<Self>, serde_json::Error> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Some(Self(map))),
            Value::Null => Ok(Some(Self::default())),
            _ => Ok(None),
        }
    }

    /// Deserialize the whole payload into `T`.
    ///
    /// An empty payload also deserializes into unit-like types.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        if self.0.is_empty() {
            if let Ok(value) = T::deserialize(Value::Null) {
                return Ok(value);
            }
        }
        T::deserialize(Value::Object(self.0.clone()))
    }
}

impl From<Map<String, Value>> for JobData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for JobData {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}
