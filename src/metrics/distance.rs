// Distance-metric calculator
// Isolation distance, L-ratio and silhouette score in a feature space shared between neighbouring units

use statrs::function::gamma::gamma_ur;
use std::collections::HashMap;

use crate::metrics::config::DistanceConfig;
use crate::metrics::linalg::{column_means, covariance};
use crate::metrics::value::{MetricFailure, MetricValue};
use crate::units::{SpikeFeatures, Unit};

#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMetrics {
    pub isolation_distance: MetricValue,
    pub l_ratio: MetricValue,
    pub silhouette: MetricValue,
}

impl DistanceMetrics {
    pub fn not_applicable() -> Self {
        DistanceMetrics {
            isolation_distance: MetricValue::NotApplicable,
            l_ratio: MetricValue::NotApplicable,
            silhouette: MetricValue::NotApplicable,
        }
    }
}

/// Read-only index of every unit's feature coordinates, keyed by channel.
/// Built once before any distance metric is computed, then shared across workers.
pub struct FeatureSpace<'a> {
    n_channels: usize,
    features: Vec<Option<&'a SpikeFeatures>>,
    by_channel: HashMap<usize, Vec<usize>>,
}

impl<'a> FeatureSpace<'a> {
    pub fn build(units: &'a [Unit], config: &DistanceConfig) -> Self {
        let features: Vec<Option<&SpikeFeatures>> = units.iter().map(|u| u.features.as_ref()).collect();

        let mut by_channel: HashMap<usize, Vec<usize>> = HashMap::new();
        for (index, f) in features.iter().enumerate() {
            if let Some(f) = f {
                for &ch in &f.channels {
                    by_channel.entry(ch).or_default().push(index);
                }
            }
        }

        log::debug!(
            "Feature space: {} of {} units with features, {} channels indexed",
            features.iter().filter(|f| f.is_some()).count(),
            units.len(),
            by_channel.len()
        );

        FeatureSpace {
            n_channels: config.n_channels,
            features,
            by_channel,
        }
    }

    /// Neighbour spikes projected onto the unit's channels, grouped by neighbour unit.
    /// Components on channels the neighbour does not have are zero.
    fn neighbour_vectors(&self, index: usize, channels: &[usize], n_components: usize) -> Vec<Vec<Vec<f64>>> {
        let dims = channels.len() * n_components;

        let mut neighbours: Vec<usize> = channels
            .iter()
            .filter_map(|ch| self.by_channel.get(ch))
            .flatten()
            .copied()
            .filter(|&u| u != index)
            .collect();
        neighbours.sort_unstable();
        neighbours.dedup();

        neighbours
            .into_iter()
            .filter_map(|u| self.features[u])
            .map(|other| {
                let slots: Vec<Option<usize>> = channels.iter().map(|&ch| other.channel_slot(ch)).collect();
                (0..other.n_spikes())
                    .map(|s| {
                        let mut v = vec![0.0; dims];
                        for (i, slot) in slots.iter().enumerate() {
                            if let Some(slot) = slot {
                                v[i * n_components..(i + 1) * n_components]
                                    .copy_from_slice(other.block(s, *slot));
                            }
                        }
                        v
                    })
                    .collect()
            })
            .collect()
    }

    /// Distance metrics of the unit at `index` (position in the recording's unit list)
    pub fn unit_metrics(&self, index: usize) -> DistanceMetrics {
        let own = match self.features.get(index).copied().flatten() {
            Some(f) => f,
            None => return DistanceMetrics::not_applicable(),
        };

        let n_channels = own.channels.len().min(self.n_channels);
        let channels = &own.channels[..n_channels];
        let dims = n_channels * own.n_components;

        let own_vectors: Vec<Vec<f64>> = own.values.iter().map(|row| row[..dims].to_vec()).collect();
        let neighbours = self.neighbour_vectors(index, channels, own.n_components);

        DistanceMetrics {
            silhouette: silhouette(&own_vectors, &neighbours, dims).into(),
            ..mahalanobis_metrics(&own_vectors, &neighbours, dims)
        }
    }
}

/// Isolation distance and L-ratio from the unit's own covariance
fn mahalanobis_metrics(own: &[Vec<f64>], neighbours: &[Vec<Vec<f64>>], dims: usize) -> DistanceMetrics {
    let n = own.len();
    let undefined = |reason: MetricFailure| DistanceMetrics {
        isolation_distance: MetricValue::undefined(reason.clone()),
        l_ratio: MetricValue::undefined(reason),
        silhouette: MetricValue::NotApplicable,
    };

    if n <= dims {
        return undefined(MetricFailure::insufficient("spikes", dims + 1, n));
    }

    let (mean, cov) = match covariance(own, dims) {
        Ok(result) => result,
        Err(e) => return undefined(MetricFailure::fit(e.to_string())),
    };
    let chol = match cov.cholesky() {
        Ok(chol) => chol,
        Err(e) => return undefined(MetricFailure::fit(format!("covariance: {}", e))),
    };

    let mut d2: Vec<f64> = neighbours
        .iter()
        .flatten()
        .map(|v| chol.mahalanobis_sq(v, &mean))
        .collect();

    let l_ratio = if d2.is_empty() {
        MetricValue::undefined(MetricFailure::insufficient("neighbour spikes", 1, 0))
    } else {
        // χ² survival function with `dims` degrees of freedom
        let k = dims as f64 / 2.0;
        let total: f64 = d2.iter().map(|&d| gamma_ur(k, d / 2.0)).sum();
        MetricValue::defined(total / n as f64)
    };

    let isolation_distance = if d2.len() < n {
        MetricValue::undefined(MetricFailure::insufficient("neighbour spikes", n, d2.len()))
    } else {
        d2.sort_by(|a, b| a.total_cmp(b));
        MetricValue::defined(d2[n - 1])
    };

    DistanceMetrics {
        isolation_distance,
        l_ratio,
        silhouette: MetricValue::NotApplicable,
    }
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

/// Mean over own spikes of `(b - a) / max(a, b)`, with `a` the distance to the own centroid
/// and `b` the distance to the nearest neighbour centroid
fn silhouette(own: &[Vec<f64>], neighbours: &[Vec<Vec<f64>>], dims: usize) -> Result<f64, MetricFailure> {
    if own.is_empty() {
        return Err(MetricFailure::insufficient("spikes", 1, 0));
    }
    let centroids: Vec<Vec<f64>> = neighbours
        .iter()
        .filter(|spikes| !spikes.is_empty())
        .map(|spikes| column_means(spikes, dims))
        .collect();
    if centroids.is_empty() {
        return Err(MetricFailure::insufficient("neighbour units", 1, 0));
    }

    let own_centroid = column_means(own, dims);
    let total: f64 = own
        .iter()
        .map(|x| {
            let a = euclidean(x, &own_centroid);
            let b = centroids
                .iter()
                .map(|c| euclidean(x, c))
                .fold(f64::INFINITY, f64::min);
            let scale = a.max(b);
            if scale > 0.0 {
                (b - a) / scale
            } else {
                0.0
            }
        })
        .sum();

    Ok(total / own.len() as f64)
}
