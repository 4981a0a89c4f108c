use serde::{Deserialize, Serialize};

/// A registered measure: dataset column key plus display label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricEntry {
    pub key: String,
    pub label: String,
}

impl MetricEntry {
    pub fn new(key: &str, label: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
        }
    }
}

/// Ordered registry of measures eligible for aggregation.
///
/// A measure is usable only when it is registered here AND present in the
/// dataset the caller is looking at; datasets may lack configured measures.
#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    entries: Vec<MetricEntry>,
}

impl MetricRegistry {
    pub fn new(entries: Vec<MetricEntry>) -> Self {
        let mut deduped: Vec<MetricEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            if !deduped.iter().any(|e| e.key == entry.key) {
                deduped.push(entry);
            }
        }
        Self { entries: deduped }
    }

    pub fn entries(&self) -> &[MetricEntry] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    /// Display label for a key; unknown keys label themselves, empty keys are blank
    pub fn label<'a>(&'a self, key: &'a str) -> &'a str {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.label.as_str())
            .unwrap_or(key)
    }

    /// Return the measure key if it is registered and one of `columns`
    pub fn validate<'a, S: AsRef<str>>(&self, columns: &[S], key: Option<&'a str>) -> Option<&'a str> {
        let key = key.map(str::trim).filter(|k| !k.is_empty())?;
        let present = columns.iter().any(|c| c.as_ref() == key);
        (present && self.contains(key)).then_some(key)
    }

    /// Validate every key, keeping request order and dropping unknown ones
    pub fn validate_all<'a, S: AsRef<str>>(&self, columns: &[S], keys: &[&'a str]) -> Vec<&'a str> {
        let mut valid: Vec<&str> = Vec::new();
        for key in keys {
            if let Some(k) = self.validate(columns, Some(*key)) {
                if !valid.contains(&k) {
                    valid.push(k);
                }
            }
        }
        valid
    }

    /// Registered measures present in `columns`, in registry order
    pub fn available<S: AsRef<str>>(&self, columns: &[S]) -> Vec<&MetricEntry> {
        self.entries
            .iter()
            .filter(|e| columns.iter().any(|c| c.as_ref() == e.key))
            .collect()
    }
}
