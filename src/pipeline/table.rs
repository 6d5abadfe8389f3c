// Metrics aggregator
// One record per unit in input order, filled through write-once slots and addressable by metric name

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::metrics::{MetricName, MetricValue, QualityMetricsRecord, UnknownMetric};

#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("Slot {index} written twice")]
    SlotWritten { index: usize },

    #[error("Slot {index} was never written")]
    EmptySlot { index: usize },

    #[error("Unit {0} appears more than once")]
    DuplicateUnitId(u32),
}

/// A table position that accepts exactly one record
#[derive(Debug, Default)]
pub struct Slot(Option<QualityMetricsRecord>);

impl Slot {
    pub fn write(&mut self, index: usize, record: QualityMetricsRecord) -> Result<(), TableError> {
        if self.0.is_some() {
            return Err(TableError::SlotWritten { index });
        }
        self.0 = Some(record);
        Ok(())
    }

    pub fn is_filled(&self) -> bool {
        self.0.is_some()
    }
}

/// Pre-sized slot array, one slot per input unit
#[derive(Debug)]
pub struct TableSlots {
    slots: Vec<Slot>,
}

impl TableSlots {
    pub fn new(n_units: usize) -> Self {
        TableSlots {
            slots: (0..n_units).map(|_| Slot::default()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots for parallel filling; index `i` belongs to input unit `i`
    pub fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }

    pub fn fill(&mut self, index: usize, record: QualityMetricsRecord) -> Result<(), TableError> {
        match self.slots.get_mut(index) {
            Some(slot) => slot.write(index, record),
            None => Err(TableError::EmptySlot { index }),
        }
    }

    /// Finish the table; every slot must have been written
    pub fn finish(self) -> Result<MetricsTable, TableError> {
        let mut records = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.into_iter().enumerate() {
            match slot.0 {
                Some(record) => records.push(record),
                None => return Err(TableError::EmptySlot { index }),
            }
        }
        MetricsTable::from_records(records)
    }
}

/// Quality metrics of every unit of a run, in input order
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<QualityMetricsRecord>", into = "Vec<QualityMetricsRecord>")]
pub struct MetricsTable {
    records: Vec<QualityMetricsRecord>,
}

impl TryFrom<Vec<QualityMetricsRecord>> for MetricsTable {
    type Error = TableError;

    fn try_from(records: Vec<QualityMetricsRecord>) -> Result<Self, Self::Error> {
        MetricsTable::from_records(records)
    }
}

impl From<MetricsTable> for Vec<QualityMetricsRecord> {
    fn from(table: MetricsTable) -> Self {
        table.records
    }
}

/// Column-oriented view of a table, one array per metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnarTable {
    pub unit_ids: Vec<u32>,
    pub peak_channels: Vec<usize>,
    pub columns: BTreeMap<MetricName, Vec<MetricValue>>,
}

/// One unit as plain numbers; anything not defined is null
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatRow {
    pub unit_id: u32,
    pub peak_channel: usize,

    #[serde(flatten)]
    pub values: BTreeMap<String, Option<f64>>,
}

impl MetricsTable {
    pub fn from_records(records: Vec<QualityMetricsRecord>) -> Result<Self, TableError> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.unit_id) {
                return Err(TableError::DuplicateUnitId(record.unit_id));
            }
        }
        Ok(MetricsTable { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[QualityMetricsRecord] {
        &self.records
    }

    pub fn get(&self, unit_id: u32) -> Option<&QualityMetricsRecord> {
        self.records.iter().find(|r| r.unit_id == unit_id)
    }

    pub fn unit_ids(&self) -> Vec<u32> {
        self.records.iter().map(|r| r.unit_id).collect()
    }

    /// One metric for every unit, in table order
    pub fn column(&self, name: MetricName) -> Vec<(u32, &MetricValue)> {
        self.records.iter().map(|r| (r.unit_id, r.get(name))).collect()
    }

    pub fn column_by_name(&self, name: &str) -> Result<Vec<(u32, &MetricValue)>, UnknownMetric> {
        let name: MetricName = name.parse()?;
        Ok(self.column(name))
    }

    pub fn to_columns(&self) -> ColumnarTable {
        let columns = MetricName::ALL
            .iter()
            .map(|&name| {
                let values = self.records.iter().map(|r| r.get(name).clone()).collect();
                (name, values)
            })
            .collect();

        ColumnarTable {
            unit_ids: self.unit_ids(),
            peak_channels: self.records.iter().map(|r| r.peak_channel).collect(),
            columns,
        }
    }

    pub fn flat_rows(&self) -> Vec<FlatRow> {
        self.records
            .iter()
            .map(|r| FlatRow {
                unit_id: r.unit_id,
                peak_channel: r.peak_channel,
                values: r
                    .metrics()
                    .iter()
                    .map(|(name, value)| (name.as_str().to_string(), value.value()))
                    .collect(),
            })
            .collect()
    }

    /// Counts of (defined, undefined, not applicable) cells over the whole table
    pub fn state_counts(&self) -> (usize, usize, usize) {
        self.records.iter().fold((0, 0, 0), |(d, u, n), r| {
            let (rd, ru, rn) = r.state_counts();
            (d + rd, u + ru, n + rn)
        })
    }
}
