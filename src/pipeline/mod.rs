// Pipeline execution and monitoring module
// Orchestrates validation, metric extraction, aggregation and classification

pub mod run;
pub mod table;
pub mod trace;

pub use run::{relabel, PipelineError, PipelineOutput, QualityPipeline};
pub use table::{ColumnarTable, FlatRow, MetricsTable, TableError, TableSlots};
pub use trace::{read_trace_file, Stage, TraceBuilder, TraceEntry, TraceError, TraceWriter};
