// Units module
// Recording data model and input validation

pub mod ingest;
pub mod types;

pub use ingest::{parse_recording, read_recording, validate_recording, InputDataError};
pub use types::{Recording, SpikeFeatures, Template, Unit};
