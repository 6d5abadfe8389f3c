// State management module
// SQLite persistence of metrics tables and label sets, plus report files

pub mod db;
pub mod models;
pub mod queries;
pub mod storage;

pub use db::{init_db, open_in_memory, DbConnection, DbError};
pub use models::{LabelSet, Run, RunSummary};
pub use queries::{
    get_run, latest_label_set, list_runs, load_labels, load_metrics_table, save_labels, save_run,
};
pub use storage::{calculate_sha256, hash_file, write_json, StorageError};
