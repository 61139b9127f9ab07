use serde::{Deserialize, Serialize};

/// Axis-aligned box of named values with per-dimension bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxSpace {
    pub names: Vec<String>,
    pub low: Vec<f64>,
    pub high: Vec<f64>,
}

impl BoxSpace {
    pub fn new(names: Vec<String>, low: Vec<f64>, high: Vec<f64>) -> Self {
        Self { names, low, high }
    }

    pub fn dim(&self) -> usize {
        self.names.len()
    }

    /// Whether `values` has the right length and lies within the bounds
    pub fn contains(&self, values: &[f64]) -> bool {
        values.len() == self.dim()
            && values
                .iter()
                .zip(self.low.iter().zip(&self.high))
                .all(|(value, (low, high))| *value >= *low && *value <= *high)
    }
}
