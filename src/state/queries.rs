// Database CRUD operations
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::db::{DbConnection, DbError, DbResult};
use super::models::{LabelSet, Run, RunSummary};
use super::storage::calculate_sha256;
use crate::classify::{ClassificationLabel, ClassificationResult, LabelAssignment, ThresholdConfig};
use crate::metrics::{MetricName, MetricValue, MetricsConfig, RecordBuilder};
use crate::pipeline::MetricsTable;

fn conversion_error(column: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e))
}

fn uuid_column(row: &rusqlite::Row<'_>, column: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(column)?;
    Uuid::parse_str(&s).map_err(|e| conversion_error(column, e))
}

fn timestamp_column(row: &rusqlite::Row<'_>, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(column)?;
    s.parse().map_err(|e| conversion_error(column, e))
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: uuid_column(row, 0)?,
        created_at: timestamp_column(row, 1)?,
        input_path: row.get(2)?,
        input_sha256: row.get(3)?,
        params_json: row.get(4)?,
        crate_version: row.get(5)?,
        n_units: row.get(6)?,
    })
}

fn label_set_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LabelSet> {
    Ok(LabelSet {
        id: uuid_column(row, 0)?,
        run_id: uuid_column(row, 1)?,
        created_at: timestamp_column(row, 2)?,
        thresholds_sha256: row.get(3)?,
    })
}

// ==================== RUN QUERIES ====================

/// Store a run and its full metrics table in one transaction
pub fn save_run(
    db: &DbConnection,
    run_id: Uuid,
    input_path: &str,
    input_sha256: &str,
    params: &MetricsConfig,
    table: &MetricsTable,
) -> DbResult<Run> {
    let run = Run {
        id: run_id,
        created_at: Utc::now(),
        input_path: input_path.to_string(),
        input_sha256: input_sha256.to_string(),
        params_json: serde_json::to_string(params)?,
        crate_version: env!("CARGO_PKG_VERSION").to_string(),
        n_units: table.len() as i64,
    };

    let mut conn = db.lock();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO runs (id, created_at, input_path, input_sha256, params_json, crate_version, n_units)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run.id.to_string(),
            run.created_at.to_rfc3339(),
            run.input_path,
            run.input_sha256,
            run.params_json,
            run.crate_version,
            run.n_units,
        ],
    )?;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO unit_metrics (run_id, unit_id, position, peak_channel, metric, state, value, reason_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for (position, record) in table.records().iter().enumerate() {
            for (name, value) in record.metrics().iter() {
                let reason = match value {
                    MetricValue::Undefined { reason } => Some(serde_json::to_string(reason)?),
                    _ => None,
                };
                stmt.execute(params![
                    run.id.to_string(),
                    record.unit_id,
                    position as i64,
                    record.peak_channel as i64,
                    name.as_str(),
                    value.state_name(),
                    value.value(),
                    reason,
                ])?;
            }
        }
    }

    tx.commit()?;
    log::info!("Stored run {} ({} units)", run.id, run.n_units);
    Ok(run)
}

/// Get a run by ID
pub fn get_run(db: &DbConnection, id: &Uuid) -> DbResult<Option<Run>> {
    let conn = db.lock();
    let run = conn
        .query_row(
            "SELECT id, created_at, input_path, input_sha256, params_json, crate_version, n_units
             FROM runs WHERE id = ?1",
            [id.to_string()],
            run_from_row,
        )
        .optional()?;
    Ok(run)
}

/// List all runs, newest first, with how many times each was labelled
pub fn list_runs(db: &DbConnection) -> DbResult<Vec<RunSummary>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT r.id, r.created_at, r.input_path, r.input_sha256, r.params_json, r.crate_version, r.n_units,
                COUNT(l.id) as label_set_count
         FROM runs r
         LEFT JOIN label_sets l ON r.id = l.run_id
         GROUP BY r.id
         ORDER BY r.created_at DESC",
    )?;

    let runs = stmt
        .query_map([], |row| {
            Ok(RunSummary {
                run: run_from_row(row)?,
                label_set_count: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(runs)
}

fn metric_value(state: &str, value: Option<f64>, reason: Option<String>) -> DbResult<MetricValue> {
    match (state, value, reason) {
        ("defined", Some(value), _) => Ok(MetricValue::Defined { value }),
        ("undefined", _, Some(reason)) => Ok(MetricValue::Undefined {
            reason: serde_json::from_str(&reason)?,
        }),
        ("not_applicable", _, _) => Ok(MetricValue::NotApplicable),
        (state, _, _) => Err(DbError::Corrupt(format!("metric cell in state '{}' is incomplete", state))),
    }
}

/// Rebuild a run's metrics table exactly as it was stored
pub fn load_metrics_table(db: &DbConnection, run_id: &Uuid) -> DbResult<Option<MetricsTable>> {
    if get_run(db, run_id)?.is_none() {
        return Ok(None);
    }

    type Cell = (u32, i64, i64, String, String, Option<f64>, Option<String>);
    let cells: Vec<Cell> = {
        let conn = db.lock();
        let mut stmt = conn.prepare(
            "SELECT unit_id, position, peak_channel, metric, state, value, reason_json
             FROM unit_metrics WHERE run_id = ?1
             ORDER BY position",
        )?;
        let rows = stmt
            .query_map([run_id.to_string()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut records = Vec::new();
    let mut current: Option<(i64, RecordBuilder)> = None;
    for (unit_id, position, peak_channel, metric, state, value, reason) in cells {
        let name: MetricName = metric
            .parse()
            .map_err(|e| DbError::Corrupt(format!("unit {}: {}", unit_id, e)))?;
        let value = metric_value(&state, value, reason)?;

        let builder = match current.take() {
            Some((p, builder)) if p == position => builder,
            Some((_, finished)) => {
                records.push(finished.build());
                RecordBuilder::new(unit_id, peak_channel as usize)
            }
            None => RecordBuilder::new(unit_id, peak_channel as usize),
        };
        current = Some((position, builder.set(name, value)));
    }
    if let Some((_, builder)) = current {
        records.push(builder.build());
    }

    let table = MetricsTable::from_records(records).map_err(|e| DbError::Corrupt(e.to_string()))?;
    Ok(Some(table))
}

// ==================== LABEL QUERIES ====================

/// Store the labels produced by applying `thresholds` to a run
pub fn save_labels(
    db: &DbConnection,
    run_id: &Uuid,
    thresholds: &ThresholdConfig,
    labels: &[LabelAssignment],
) -> DbResult<LabelSet> {
    let thresholds_json = serde_json::to_string(thresholds)?;
    let label_set = LabelSet {
        id: Uuid::new_v4(),
        run_id: *run_id,
        created_at: Utc::now(),
        thresholds_sha256: calculate_sha256(thresholds_json.as_bytes()),
    };

    let mut conn = db.lock();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO label_sets (id, run_id, created_at, thresholds_sha256, thresholds_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            label_set.id.to_string(),
            label_set.run_id.to_string(),
            label_set.created_at.to_rfc3339(),
            label_set.thresholds_sha256,
            thresholds_json,
        ],
    )?;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO unit_labels (label_set_id, unit_id, position, label, rule_id, reasoning)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for (position, assignment) in labels.iter().enumerate() {
            stmt.execute(params![
                label_set.id.to_string(),
                assignment.unit_id,
                position as i64,
                assignment.result.label.as_str(),
                assignment.result.rule_id,
                assignment.result.reasoning,
            ])?;
        }
    }

    tx.commit()?;
    Ok(label_set)
}

/// Labels of a label set, in table order
pub fn load_labels(db: &DbConnection, label_set_id: &Uuid) -> DbResult<Vec<LabelAssignment>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT unit_id, label, rule_id, reasoning
         FROM unit_labels WHERE label_set_id = ?1
         ORDER BY position",
    )?;

    let rows = stmt
        .query_map([label_set_id.to_string()], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(unit_id, label, rule_id, reasoning)| {
            let label: ClassificationLabel = label.parse().map_err(DbError::Corrupt)?;
            Ok(LabelAssignment {
                unit_id,
                result: ClassificationResult {
                    label,
                    rule_id,
                    reasoning,
                },
            })
        })
        .collect()
}

/// Most recent label set of a run
pub fn latest_label_set(db: &DbConnection, run_id: &Uuid) -> DbResult<Option<LabelSet>> {
    let conn = db.lock();
    let label_set = conn
        .query_row(
            "SELECT id, run_id, created_at, thresholds_sha256
             FROM label_sets WHERE run_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1",
            [run_id.to_string()],
            label_set_from_row,
        )
        .optional()?;
    Ok(label_set)
}
