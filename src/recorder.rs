//! # Data Recorder
//!
//! Per-step records of the running episode plus an optional archive of
//! completed episodes.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const TIME_COLUMN: &str = "time";
pub const REWARD_COLUMN: &str = "reward";

/// One row of the dataset: a simulation time and named values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub time: f64,
    pub columns: IndexMap<String, f64>,
}

impl Record {
    pub fn new(time: f64) -> Self {
        Self {
            time,
            columns: IndexMap::new(),
        }
    }

    /// Value of a column; `"time"` resolves to the record time
    pub fn get(&self, name: &str) -> Option<f64> {
        if name == TIME_COLUMN {
            return Some(self.time);
        }
        self.columns.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        name == TIME_COLUMN || self.columns.contains_key(name)
    }

    /// Set a column, overwriting an existing value in place
    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        if name == TIME_COLUMN {
            self.time = value;
        } else {
            self.columns.insert(name, value);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<f64> {
        self.columns.shift_remove(name)
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = (String, f64)>) {
        for (name, value) in values {
            self.set(name, value);
        }
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Serialize records as a split table: `{"columns", "index", "data"}`
///
/// `index` holds the record times, `data` one array per record in column
/// order. Missing values and non-finite numbers become `null`. Rows that
/// share a time stay distinct.
pub fn records_to_json(records: &[Record]) -> Value {
    let mut columns: IndexSet<&str> = IndexSet::new();
    columns.insert(TIME_COLUMN);
    for record in records {
        columns.extend(record.columns.keys().map(String::as_str));
    }

    let index: Vec<Value> = records.iter().map(|record| number(record.time)).collect();
    let data: Vec<Vec<Value>> = records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|column| record.get(column).map(number).unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    json!({
        "columns": columns.into_iter().collect::<Vec<_>>(),
        "index": index,
        "data": data,
    })
}

/// Running table of the current episode and archive of completed ones
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    data: Vec<Record>,
    data_all: Vec<Vec<Record>>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the current episode's rows and start over from `record`
    pub fn restart(&mut self, record: Record) {
        self.data.clear();
        self.data.push(record);
    }

    pub fn push(&mut self, record: Record) {
        self.data.push(record);
    }

    /// Keep only the most recent row
    pub fn truncate_to_last(&mut self) {
        if self.data.len() > 1 {
            self.data.drain(..self.data.len() - 1);
        }
    }

    /// Archive a deep copy of the current episode
    pub fn archive_current(&mut self) {
        self.data_all.push(self.data.clone());
    }

    pub fn last(&self) -> Option<&Record> {
        self.data.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut Record> {
        self.data.last_mut()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rows(&self) -> &[Record] {
        &self.data
    }

    /// Deep copy of the current episode
    pub fn snapshot(&self) -> Vec<Record> {
        self.data.clone()
    }

    /// Deep copy of all archived episodes
    pub fn archive(&self) -> Vec<Vec<Record>> {
        self.data_all.clone()
    }

    pub fn archived_episodes(&self) -> usize {
        self.data_all.len()
    }

    pub fn to_json(&self) -> Value {
        records_to_json(&self.data)
    }
}
