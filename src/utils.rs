use std::error::Error;

pub type DynError = Box<dyn Error + Send + Sync>;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn max_value(values: &[f64]) -> f64 {
    values.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
}

// First index of the maximum; NaN entries never win.
pub fn first_argmax(values: &[f64]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &value) in values.iter().enumerate() {
        match best {
            Some((_, current)) if value <= current || value.is_nan() => {}
            None if value.is_nan() => {}
            _ => best = Some((idx, value)),
        }
    }
    best
}

// Halves round to even.
pub fn round_time_axis(time: &[f64]) -> Vec<f64> {
    time.iter().map(|t| t.round_ties_even()).collect()
}

// Inclusive index range between the first samples at `start` and `end` on a rounded time axis.
pub fn window_indices(rounded_time: &[f64], start: f64, end: f64) -> Option<(usize, usize)> {
    let first = rounded_time.iter().position(|&t| t == start)?;
    let last = rounded_time.iter().position(|&t| t == end)?;
    if last < first {
        return None;
    }
    Some((first, last))
}

// Slot of a time value on a unit-step grid starting at `origin`.
pub fn unit_grid_index(origin: f64, time: f64) -> Option<usize> {
    let offset = (time - origin).round();
    if !offset.is_finite() || offset < 0.0 {
        return None;
    }
    Some(offset as usize)
}

pub fn wrap_degrees(value: f64) -> f64 {
    let wrapped = value % 360.0;
    if wrapped < 0.0 {
        wrapped + 360.0
    } else {
        wrapped
    }
}
