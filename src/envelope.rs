// Upper envelope of a sampled waveform: cubic interpolation through the
// strict local maxima, pinned to the first and last samples.
use thiserror::Error;

use crate::utils::first_argmax;

#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeError {
    #[error("cannot build an envelope from an empty sample series")]
    Empty,
    #[error("time axis has {time} values but the channel has {samples} samples")]
    LengthMismatch { time: usize, samples: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub values: Vec<f64>,
    pub peak_index: usize,
    pub peak_time: f64,
    pub peak_value: f64,
}

/// Anchors plus every strict local maximum, in index order.
pub fn control_points(samples: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let n = samples.len();
    if n == 0 {
        return (Vec::new(), Vec::new());
    }
    let mut xs = vec![0.0];
    let mut ys = vec![samples[0]];
    for k in 1..n.saturating_sub(1) {
        if samples[k] - samples[k - 1] > 0.0 && samples[k] - samples[k + 1] > 0.0 {
            xs.push(k as f64);
            ys.push(samples[k]);
        }
    }
    if n > 1 {
        xs.push((n - 1) as f64);
        ys.push(samples[n - 1]);
    }
    (xs, ys)
}

// Second derivatives of the not-a-knot cubic through the knots.
fn not_a_knot_second_derivatives(xs: &[f64], ys: &[f64]) -> Vec<f64> {
    let m = xs.len();
    let h: Vec<f64> = xs.windows(2).map(|w| w[1] - w[0]).collect();
    let rhs = |i: usize| 6.0 * ((ys[i + 1] - ys[i]) / h[i] - (ys[i] - ys[i - 1]) / h[i - 1]);

    if m == 3 {
        // Three knots: both end conditions collapse the cubic to one parabola.
        let curvature = rhs(1) / (3.0 * (h[0] + h[1]));
        return vec![curvature; 3];
    }

    // Unknowns M_1 .. M_{m-2}; the end values follow from third-derivative continuity.
    let k = m - 2;
    let mut lower = vec![0.0; k];
    let mut diag = vec![0.0; k];
    let mut upper = vec![0.0; k];
    let mut rhs_vec = vec![0.0; k];
    for row in 0..k {
        let i = row + 1;
        lower[row] = h[i - 1];
        diag[row] = 2.0 * (h[i - 1] + h[i]);
        upper[row] = h[i];
        rhs_vec[row] = rhs(i);
    }
    let (h0, h1) = (h[0], h[1]);
    diag[0] = 3.0 * h0 + 2.0 * h1 + h0 * h0 / h1;
    upper[0] = h1 - h0 * h0 / h1;
    let (a, b) = (h[m - 3], h[m - 2]);
    lower[k - 1] = a - b * b / a;
    diag[k - 1] = 2.0 * a + 3.0 * b + b * b / a;

    // Thomas algorithm.
    for row in 1..k {
        let w = lower[row] / diag[row - 1];
        diag[row] -= w * upper[row - 1];
        rhs_vec[row] -= w * rhs_vec[row - 1];
    }
    let mut interior = vec![0.0; k];
    interior[k - 1] = rhs_vec[k - 1] / diag[k - 1];
    for row in (0..k - 1).rev() {
        interior[row] = (rhs_vec[row] - upper[row] * interior[row + 1]) / diag[row];
    }

    let mut second = vec![0.0; m];
    second[1..m - 1].copy_from_slice(&interior);
    second[0] = second[1] - h0 * (second[2] - second[1]) / h1;
    second[m - 1] = second[m - 2] + b * (second[m - 2] - second[m - 3]) / a;
    second
}

/// Evaluates the cubic interpolant through `(xs, ys)` at `0..n`.
/// Points outside `[xs[0], xs[last]]` are 0; knots are returned exactly.
pub fn cubic_interpolate(xs: &[f64], ys: &[f64], n: usize) -> Vec<f64> {
    let m = xs.len();
    let mut out = vec![0.0; n];
    if m == 0 {
        return out;
    }
    if m == 1 {
        let idx = xs[0] as usize;
        if idx < n {
            out[idx] = ys[0];
        }
        return out;
    }

    let second = if m == 2 {
        vec![0.0; 2]
    } else {
        not_a_knot_second_derivatives(xs, ys)
    };

    let mut seg = 0;
    for (idx, value) in out.iter_mut().enumerate() {
        let x = idx as f64;
        if x < xs[0] || x > xs[m - 1] {
            continue;
        }
        while seg < m - 2 && x > xs[seg + 1] {
            seg += 1;
        }
        if x == xs[seg] {
            *value = ys[seg];
            continue;
        }
        if x == xs[seg + 1] {
            *value = ys[seg + 1];
            continue;
        }
        let h = xs[seg + 1] - xs[seg];
        let left = xs[seg + 1] - x;
        let right = x - xs[seg];
        *value = second[seg] * left.powi(3) / (6.0 * h)
            + second[seg + 1] * right.powi(3) / (6.0 * h)
            + (ys[seg] - second[seg] * h * h / 6.0) * left / h
            + (ys[seg + 1] - second[seg + 1] * h * h / 6.0) * right / h;
    }
    out
}

pub fn extract_envelope(time: &[f64], samples: &[f64]) -> Result<Envelope, EnvelopeError> {
    if samples.is_empty() {
        return Err(EnvelopeError::Empty);
    }
    if time.len() != samples.len() {
        return Err(EnvelopeError::LengthMismatch {
            time: time.len(),
            samples: samples.len(),
        });
    }

    let (xs, ys) = control_points(samples);
    let values = cubic_interpolate(&xs, &ys, samples.len());
    let (peak_index, peak_value) = first_argmax(&values).unwrap_or((0, values[0]));

    Ok(Envelope {
        peak_time: time[peak_index],
        peak_index,
        peak_value,
        values,
    })
}
