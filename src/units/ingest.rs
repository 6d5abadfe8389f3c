// Recording ingestion
// Reads a recording from JSON and checks it against the input contract before any metric runs

use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::units::types::{Recording, Unit};

/// Malformed global input. Always fatal for the run.
#[derive(Debug, Error)]
pub enum InputDataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse recording: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid recording: {0}")]
    InvalidRecording(String),

    #[error("No units in recording but {rules} classification rule(s) configured")]
    NoUnits { rules: usize },

    #[error("Duplicate unit id {0}")]
    DuplicateUnitId(u32),

    #[error("Unit {unit}: {what} has length {actual}, expected {expected}")]
    LengthMismatch {
        unit: u32,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Unit {unit}: spike times decrease at index {index}")]
    UnsortedSpikeTimes { unit: u32, index: usize },

    #[error("Unit {unit}: non-finite value in {what} at index {index}")]
    NonFinite {
        unit: u32,
        what: &'static str,
        index: usize,
    },

    #[error("Unit {unit}: spike {index} at {time}s lies outside the recording (0..{duration}s)")]
    SpikeOutOfRange {
        unit: u32,
        index: usize,
        time: f64,
        duration: f64,
    },

    #[error("Unit {unit}: template has {actual} channels, recording has {expected}")]
    TemplateChannelMismatch {
        unit: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Unit {unit}: template channel {channel} has a different sample count")]
    RaggedTemplate { unit: u32, channel: usize },

    #[error("Unit {unit}: channel {channel} out of range ({n_channels} channels)")]
    ChannelOutOfRange {
        unit: u32,
        channel: usize,
        n_channels: usize,
    },

    #[error("Unit {unit}: invalid feature coordinates: {detail}")]
    InvalidFeatures { unit: u32, detail: String },
}

/// Read and validate a recording stored as JSON
pub fn read_recording(path: &Path) -> Result<Recording, InputDataError> {
    let contents = std::fs::read_to_string(path)?;
    let recording = parse_recording(&contents)?;
    log::info!(
        "Loaded recording from {:?}: {} units, {} channels, {:.1}s",
        path,
        recording.units.len(),
        recording.n_channels(),
        recording.duration_s
    );
    Ok(recording)
}

/// Parse and validate a recording from a JSON string
pub fn parse_recording(json: &str) -> Result<Recording, InputDataError> {
    let recording: Recording = serde_json::from_str(json)?;
    validate_recording(&recording)?;
    Ok(recording)
}

/// Check every array length, ordering and range the metrics rely on
pub fn validate_recording(recording: &Recording) -> Result<(), InputDataError> {
    if !(recording.duration_s.is_finite() && recording.duration_s > 0.0) {
        return Err(InputDataError::InvalidRecording(format!(
            "duration must be positive, got {}",
            recording.duration_s
        )));
    }
    if !(recording.sample_rate_hz.is_finite() && recording.sample_rate_hz > 0.0) {
        return Err(InputDataError::InvalidRecording(format!(
            "sampling rate must be positive, got {}",
            recording.sample_rate_hz
        )));
    }
    if recording.channel_positions.is_empty() {
        return Err(InputDataError::InvalidRecording(
            "no channel positions".to_string(),
        ));
    }
    if let Some(i) = recording
        .channel_positions
        .iter()
        .position(|p| !(p[0].is_finite() && p[1].is_finite()))
    {
        return Err(InputDataError::InvalidRecording(format!(
            "non-finite position for channel {}",
            i
        )));
    }

    let mut seen = HashSet::new();
    let mut n_components: Option<usize> = None;

    for unit in &recording.units {
        if !seen.insert(unit.id) {
            return Err(InputDataError::DuplicateUnitId(unit.id));
        }
        validate_unit(unit, recording)?;

        // All units must share one feature space
        if let Some(features) = &unit.features {
            match n_components {
                None => n_components = Some(features.n_components),
                Some(n) if n != features.n_components => {
                    return Err(InputDataError::InvalidFeatures {
                        unit: unit.id,
                        detail: format!(
                            "{} components per channel, other units have {}",
                            features.n_components, n
                        ),
                    });
                }
                _ => {}
            }
        }
    }

    Ok(())
}

fn validate_unit(unit: &Unit, recording: &Recording) -> Result<(), InputDataError> {
    let n_spikes = unit.spike_times.len();
    let n_channels = recording.n_channels();

    if unit.amplitudes.len() != n_spikes {
        return Err(InputDataError::LengthMismatch {
            unit: unit.id,
            what: "amplitudes",
            expected: n_spikes,
            actual: unit.amplitudes.len(),
        });
    }

    for (index, &t) in unit.spike_times.iter().enumerate() {
        if !t.is_finite() {
            return Err(InputDataError::NonFinite {
                unit: unit.id,
                what: "spike_times",
                index,
            });
        }
        if t < 0.0 || t > recording.duration_s {
            return Err(InputDataError::SpikeOutOfRange {
                unit: unit.id,
                index,
                time: t,
                duration: recording.duration_s,
            });
        }
        if index > 0 && t < unit.spike_times[index - 1] {
            return Err(InputDataError::UnsortedSpikeTimes {
                unit: unit.id,
                index,
            });
        }
    }

    check_finite(unit.id, "amplitudes", &unit.amplitudes)?;

    // Template: one row per recording channel, all rows the same length
    if unit.template.n_channels() != n_channels {
        return Err(InputDataError::TemplateChannelMismatch {
            unit: unit.id,
            expected: n_channels,
            actual: unit.template.n_channels(),
        });
    }
    let n_samples = unit.template.n_samples();
    if let Some(channel) = unit.template.0.iter().position(|c| c.len() != n_samples) {
        return Err(InputDataError::RaggedTemplate {
            unit: unit.id,
            channel,
        });
    }

    if let Some(channel) = unit.best_channel {
        if channel >= n_channels {
            return Err(InputDataError::ChannelOutOfRange {
                unit: unit.id,
                channel,
                n_channels,
            });
        }
    }

    if let Some(depths) = &unit.spike_depths {
        if depths.len() != n_spikes {
            return Err(InputDataError::LengthMismatch {
                unit: unit.id,
                what: "spike_depths",
                expected: n_spikes,
                actual: depths.len(),
            });
        }
        check_finite(unit.id, "spike_depths", depths)?;
    }

    if let Some(noise) = &unit.noise_samples {
        check_finite(unit.id, "noise_samples", noise)?;
    }

    if let Some(features) = &unit.features {
        let invalid = |detail: String| InputDataError::InvalidFeatures {
            unit: unit.id,
            detail,
        };

        if features.channels.is_empty() || features.n_components == 0 {
            return Err(invalid("empty feature space".to_string()));
        }
        if let Some(&channel) = features.channels.iter().find(|&&c| c >= n_channels) {
            return Err(InputDataError::ChannelOutOfRange {
                unit: unit.id,
                channel,
                n_channels,
            });
        }
        let mut distinct = HashSet::new();
        if !features.channels.iter().all(|c| distinct.insert(*c)) {
            return Err(invalid("repeated channel id".to_string()));
        }
        if features.values.len() != n_spikes {
            return Err(InputDataError::LengthMismatch {
                unit: unit.id,
                what: "feature rows",
                expected: n_spikes,
                actual: features.values.len(),
            });
        }
        let width = features.channels.len() * features.n_components;
        for (spike, row) in features.values.iter().enumerate() {
            if row.len() != width {
                return Err(invalid(format!(
                    "spike {} has {} values, expected {}",
                    spike,
                    row.len(),
                    width
                )));
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(InputDataError::NonFinite {
                    unit: unit.id,
                    what: "features",
                    index: spike,
                });
            }
        }
    }

    Ok(())
}

fn check_finite(unit: u32, what: &'static str, values: &[f64]) -> Result<(), InputDataError> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(InputDataError::NonFinite { unit, what, index }),
        None => Ok(()),
    }
}
