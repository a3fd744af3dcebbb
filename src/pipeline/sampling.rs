/// Base spacing between sampled frames, by video length.
pub fn base_interval(duration_secs: f64) -> f64 {
    if duration_secs <= 120.0 {
        5.0
    } else if duration_secs <= 600.0 {
        10.0
    } else {
        20.0
    }
}

/// Spacing that keeps the sample count within `max_frames`.
pub fn sampling_interval(duration_secs: f64, max_frames: usize) -> f64 {
    let max_frames = max_frames.max(1) as f64;
    base_interval(duration_secs).max(duration_secs / max_frames)
}

/// `0, i, 2i, ...` strictly below the duration, at most `max_frames` of them.
pub fn sample_timestamps(duration_secs: f64, max_frames: usize) -> Vec<f64> {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return Vec::new();
    }
    let interval = sampling_interval(duration_secs, max_frames);
    (0..max_frames.max(1))
        .map(|index| index as f64 * interval)
        .take_while(|timestamp| *timestamp < duration_secs)
        .collect()
}

pub fn expected_frame_count(duration_secs: f64, max_frames: usize) -> usize {
    sample_timestamps(duration_secs, max_frames).len()
}
