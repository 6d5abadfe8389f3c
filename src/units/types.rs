// Recording and unit data model
// In-memory form of a spike-sorted recording, as handed over by an external loader

use serde::{Deserialize, Serialize};

/// Average multi-channel waveform of a unit: `channels × samples`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Template(pub Vec<Vec<f64>>);

impl Template {
    pub fn n_channels(&self) -> usize {
        self.0.len()
    }

    /// Samples per channel (0 for an empty template)
    pub fn n_samples(&self) -> usize {
        self.0.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn channel(&self, index: usize) -> Option<&[f64]> {
        self.0.get(index).map(|c| c.as_slice())
    }

    /// Peak-to-peak amplitude of one channel
    pub fn peak_to_peak(&self, index: usize) -> f64 {
        match self.channel(index) {
            Some(samples) if !samples.is_empty() => {
                let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
                max - min
            }
            _ => 0.0,
        }
    }

    /// Channel with the largest peak-to-peak amplitude (first one on ties)
    pub fn largest_channel(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for ch in 0..self.n_channels() {
            let ptp = self.peak_to_peak(ch);
            if !ptp.is_finite() {
                continue;
            }
            match best {
                Some((_, b)) if ptp <= b => {}
                _ => best = Some((ch, ptp)),
            }
        }
        best.map(|(ch, _)| ch)
    }
}

/// Per-spike coordinates in a shared feature space (e.g. principal components).
///
/// `values[s]` holds spike `s`'s features laid out channel-major:
/// `[ch0_c0, ch0_c1, .., ch1_c0, ..]`, following the order of `channels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeFeatures {
    /// Channel ids the feature blocks belong to, most relevant channel first
    pub channels: Vec<usize>,

    /// Feature components per channel
    pub n_components: usize,

    /// One row per spike, `channels.len() * n_components` values each
    pub values: Vec<Vec<f64>>,
}

impl SpikeFeatures {
    pub fn n_spikes(&self) -> usize {
        self.values.len()
    }

    /// Position of a channel id in this unit's channel list
    pub fn channel_slot(&self, channel: usize) -> Option<usize> {
        self.channels.iter().position(|&c| c == channel)
    }

    /// Feature block of spike `spike` on the channel at `slot`
    pub fn block(&self, spike: usize, slot: usize) -> &[f64] {
        let start = slot * self.n_components;
        &self.values[spike][start..start + self.n_components]
    }
}

/// A single sorted unit (putative neuron)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Identifier assigned by the spike sorter
    pub id: u32,

    /// Assigned best channel; derived from the template when absent
    #[serde(default)]
    pub best_channel: Option<usize>,

    /// Multi-channel template waveform
    pub template: Template,

    /// Spike times in seconds, non-decreasing
    pub spike_times: Vec<f64>,

    /// Per-spike amplitudes, same length as `spike_times`
    pub amplitudes: Vec<f64>,

    /// Feature-space coordinates, used only by the distance metrics
    #[serde(default)]
    pub features: Option<SpikeFeatures>,

    /// Per-spike depth estimates in µm, used for drift
    #[serde(default)]
    pub spike_depths: Option<Vec<f64>>,

    /// Voltage samples taken away from spikes, used for SNR
    #[serde(default)]
    pub noise_samples: Option<Vec<f64>>,
}

impl Unit {
    pub fn n_spikes(&self) -> usize {
        self.spike_times.len()
    }

    /// Best channel, falling back to the largest template channel
    pub fn peak_channel(&self) -> Option<usize> {
        self.best_channel.or_else(|| self.template.largest_channel())
    }
}

/// A whole spike-sorted recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Recording duration in seconds
    pub duration_s: f64,

    /// Acquisition sampling rate in Hz
    pub sample_rate_hz: f64,

    /// (x, y) position of every channel in µm; y is depth
    pub channel_positions: Vec<[f64; 2]>,

    /// Units in output order
    pub units: Vec<Unit>,
}

impl Recording {
    pub fn n_channels(&self) -> usize {
        self.channel_positions.len()
    }
}
