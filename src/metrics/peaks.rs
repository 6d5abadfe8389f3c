// Prominence-based extrema detection
// Local maxima with topographic prominence and half-prominence width, for waveform shape metrics

/// A detected local maximum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Sample index (middle of a flat top)
    pub index: usize,
    pub prominence: f64,
    /// Width in samples at half prominence, interpolated
    pub width: f64,
}

/// Strict local maxima, flat tops reduced to their middle sample.
/// The first and last samples are never peaks.
fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }

    let last = x.len() - 1;
    let mut i = 1;
    while i < last {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < last && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                let left = i;
                let right = ahead - 1;
                peaks.push((left + right) / 2);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

/// Prominence of a peak plus the indices of its left and right bases
fn prominence(x: &[f64], peak: usize) -> (f64, usize, usize) {
    let height = x[peak];

    let mut left_min = height;
    let mut left_base = peak;
    let mut i = peak as isize;
    while i >= 0 && x[i as usize] <= height {
        if x[i as usize] < left_min {
            left_min = x[i as usize];
            left_base = i as usize;
        }
        i -= 1;
    }

    let mut right_min = height;
    let mut right_base = peak;
    let mut j = peak;
    while j < x.len() && x[j] <= height {
        if x[j] < right_min {
            right_min = x[j];
            right_base = j;
        }
        j += 1;
    }

    (height - left_min.max(right_min), left_base, right_base)
}

/// Width at half prominence between the peak's bases, with linear interpolation
fn half_prominence_width(x: &[f64], peak: usize, prominence: f64, bases: (usize, usize)) -> f64 {
    let (left_base, right_base) = bases;
    let height = x[peak] - prominence * 0.5;

    let mut i = peak;
    while left_base < i && height < x[i] {
        i -= 1;
    }
    let mut left = i as f64;
    if x[i] < height {
        left += (height - x[i]) / (x[i + 1] - x[i]);
    }

    let mut j = peak;
    while j < right_base && height < x[j] {
        j += 1;
    }
    let mut right = j as f64;
    if x[j] < height {
        right -= (height - x[j]) / (x[j - 1] - x[j]);
    }

    right - left
}

/// All local maxima of `x` whose prominence is at least `min_prominence`
pub fn find_peaks(x: &[f64], min_prominence: f64) -> Vec<Peak> {
    local_maxima(x)
        .into_iter()
        .filter_map(|index| {
            let (prom, left_base, right_base) = prominence(x, index);
            if prom < min_prominence {
                return None;
            }
            Some(Peak {
                index,
                prominence: prom,
                width: half_prominence_width(x, index, prom, (left_base, right_base)),
            })
        })
        .collect()
}

/// Local minima of `x` (peaks of `-x`), prominence measured on the inverted signal
pub fn find_troughs(x: &[f64], min_prominence: f64) -> Vec<Peak> {
    let inverted: Vec<f64> = x.iter().map(|v| -v).collect();
    find_peaks(&inverted, min_prominence)
}

/// The most prominent peak (first one on ties)
pub fn most_prominent(peaks: &[Peak]) -> Option<&Peak> {
    let mut best: Option<&Peak> = None;
    for peak in peaks {
        match best {
            Some(b) if peak.prominence <= b.prominence => {}
            _ => best = Some(peak),
        }
    }
    best
}

/// Index of the first maximum
pub fn argmax(x: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &v) in x.iter().enumerate() {
        match best {
            Some(b) if v <= x[b] => {}
            _ => best = Some(i),
        }
    }
    best
}

/// Index of the first minimum
pub fn argmin(x: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &v) in x.iter().enumerate() {
        match best {
            Some(b) if v >= x[b] => {}
            _ => best = Some(i),
        }
    }
    best
}
