// Amplitude-threshold pulse detection over one channel

use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Detection thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseConfig {
    /// Threshold as a percentage of the channel maximum.
    pub threshold_percent: f64,
    /// Seconds.
    pub min_pulse_width: f64,
    /// Seconds between the end of one pulse and the start of the next.
    pub min_pulse_separation: f64,
}

impl Default for PulseConfig {
    fn default() -> Self {
        PulseConfig {
            threshold_percent: 10.0,
            min_pulse_width: 0.001,
            min_pulse_separation: 0.01,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Pulse {
    pub number: usize,
    pub start_index: usize,
    pub end_index: usize,
    pub peak_index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub peak_time: f64,
    pub duration: f64,
    pub peak_value: f64,
    pub mean_value: f64,
    /// Trapezoidal integral of value over time.
    pub energy: f64,
}

/// Find runs of samples strictly above the threshold.
///
/// A run still open at the last sample ends there. Runs shorter than the
/// minimum width, or starting too soon after the previously accepted pulse,
/// are dropped.
pub fn detect_pulses(times: &[f64], values: &[f64], config: &PulseConfig) -> Vec<Pulse> {
    if values.is_empty() || times.len() != values.len() {
        return Vec::new();
    }

    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let threshold = max * config.threshold_percent / 100.0;
    debug!(
        "Pulse threshold {} ({}% of max {})",
        threshold, config.threshold_percent, max
    );

    let mut runs = Vec::new();
    let mut start = None;
    for (i, &v) in values.iter().enumerate() {
        match (v > threshold, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push((s, i - 1));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, values.len() - 1));
    }

    let interval = if times.len() > 1 { times[1] - times[0] } else { 0.0 };
    let (min_width, min_separation) = if interval > 0.0 {
        (
            (config.min_pulse_width / interval).floor() as usize,
            (config.min_pulse_separation / interval).floor() as usize,
        )
    } else {
        (0, 0)
    };

    let mut pulses: Vec<Pulse> = Vec::new();
    for (start, end) in runs {
        if end - start < min_width {
            continue;
        }
        if let Some(prev) = pulses.last() {
            if start - prev.end_index < min_separation {
                continue;
            }
        }

        let span = &values[start..=end];
        let mut peak_index = start;
        for (offset, &v) in span.iter().enumerate() {
            if v > values[peak_index] {
                peak_index = start + offset;
            }
        }

        pulses.push(Pulse {
            number: pulses.len() + 1,
            start_index: start,
            end_index: end,
            peak_index,
            start_time: times[start],
            end_time: times[end],
            peak_time: times[peak_index],
            duration: times[end] - times[start],
            peak_value: values[peak_index],
            mean_value: span.iter().sum::<f64>() / span.len() as f64,
            energy: trapezoid(&times[start..=end], span),
        });
    }

    info!("Detected {} pulses", pulses.len());
    pulses
}

fn trapezoid(times: &[f64], values: &[f64]) -> f64 {
    times
        .windows(2)
        .zip(values.windows(2))
        .map(|(t, v)| (t[1] - t[0]) * (v[0] + v[1]) / 2.0)
        .sum()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PulseStats {
    pub total_pulses: usize,
    pub peak_min: f64,
    pub peak_max: f64,
    pub peak_mean: f64,
    pub peak_std: f64,
    pub duration_min: f64,
    pub duration_max: f64,
    pub duration_mean: f64,
    pub duration_std: f64,
    pub energy_total: f64,
    pub energy_mean: f64,
    pub first_pulse_time: f64,
    pub last_pulse_time: f64,
    pub test_duration: f64,
}

impl PulseStats {
    /// Summary over all pulses; `None` when there are none.
    pub fn from_pulses(pulses: &[Pulse]) -> Option<Self> {
        let first = pulses.first()?;
        let last = pulses.last()?;

        let peaks: Vec<f64> = pulses.iter().map(|p| p.peak_value).collect();
        let durations: Vec<f64> = pulses.iter().map(|p| p.duration).collect();
        let energy_total: f64 = pulses.iter().map(|p| p.energy).sum();

        Some(PulseStats {
            total_pulses: pulses.len(),
            peak_min: min(&peaks),
            peak_max: max(&peaks),
            peak_mean: mean(&peaks),
            peak_std: std_dev(&peaks),
            duration_min: min(&durations),
            duration_max: max(&durations),
            duration_mean: mean(&durations),
            duration_std: std_dev(&durations),
            energy_total,
            energy_mean: energy_total / pulses.len() as f64,
            first_pulse_time: first.start_time,
            last_pulse_time: last.end_time,
            test_duration: last.end_time - first.start_time,
        })
    }
}

fn min(xs: &[f64]) -> f64 {
    xs.iter().copied().fold(f64::INFINITY, f64::min)
}

fn max(xs: &[f64]) -> f64 {
    xs.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

// population standard deviation
fn std_dev(xs: &[f64]) -> f64 {
    let m = mean(xs);
    (xs.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / xs.len() as f64).sqrt()
}
