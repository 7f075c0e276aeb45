use nalgebra::{Matrix3, Vector3};
use serde::Serialize;
use thiserror::Error;

use crate::utils::{mean, wrap_degrees};

// --- Plane-wave TDOA definitions (after arXiv:1702.04902) ---
// Direction vector (d): unit vector pointing from the array towards the source.
// Antenna position vector (P_i): local survey frame, metres.
// Arrival time (t_i): nanoseconds; the wavefront reaches antennas further
//   along d first:
//   t_i = t_0 - d . (P_i - P_0) / c
// Array normal (D): unit normal of the plane through the three antennas.
// Primed frame: rotation A~ taking D onto the z axis, so the three antennas
//   share z' and the in-plane components of d' follow from two TDOAs.
// ------------------------------------------------------------

const COLLINEAR_SINE: f64 = 1e-9;
const VERTICAL_NORMAL_EPS: f64 = 1e-12;
const UNIT_NORM_BAND: (f64, f64) = (0.999, 1.0001);
const ACOS_SLACK: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Error, PartialEq, Serialize)]
pub enum ReconstructionError {
    #[error("antenna positions are collinear")]
    CollinearAntennas,
    #[error("array normal is vertical; in-plane rotation undefined")]
    VerticalNormal,
    #[error("projected antenna positions are degenerate")]
    DegenerateProjection,
    #[error("in-plane component {in_plane:.4} exceeds unity (implied speed above c)")]
    Superluminal { in_plane: f64 },
    #[error("direction norm {norm:.6} outside [0.999, 1.0001)")]
    NotUnitNorm { norm: f64 },
    #[error("array rotation is not invertible")]
    SingularTransform,
    #[error("direction angles are not finite")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Direction {
    /// Degrees east of true north after the survey offset rotation.
    pub azimuth_deg: f64,
    pub zenith_deg: f64,
    pub unit: [f64; 3],
}

fn array_normal(positions: &[[f64; 3]; 3]) -> Result<Vector3<f64>, ReconstructionError> {
    let p0 = Vector3::from(positions[0]);
    let u = Vector3::from(positions[1]) - p0;
    let v = Vector3::from(positions[2]) - p0;
    let cross = u.cross(&v);
    let norm = cross.norm();
    if norm == 0.0 || norm <= COLLINEAR_SINE * u.norm() * v.norm() {
        return Err(ReconstructionError::CollinearAntennas);
    }
    Ok(cross / norm)
}

fn plane_rotation(d: &Vector3<f64>) -> Result<Matrix3<f64>, ReconstructionError> {
    let xy = (d.x * d.x + d.y * d.y).sqrt();
    if xy <= VERTICAL_NORMAL_EPS {
        return Err(ReconstructionError::VerticalNormal);
    }
    Ok(Matrix3::new(
        d.x * d.z / xy,
        d.y * d.z / xy,
        -xy,
        -d.y / xy,
        d.x / xy,
        0.0,
        d.x,
        d.y,
        d.z,
    ))
}

pub fn rotate_to_true_north(azimuth_deg: f64, offset_deg: f64) -> f64 {
    (azimuth_deg + 360.0 - offset_deg) % 360.0
}

/// Solves one antenna triple. Failures never carry NaN out of this function.
pub fn reconstruct_direction(
    positions: &[[f64; 3]; 3],
    times: &[f64; 3],
    speed_of_light: f64,
    azimuth_offset_deg: f64,
) -> Result<Direction, ReconstructionError> {
    let normal = array_normal(positions)?;
    let a_tilde = plane_rotation(&normal)?;
    let r: Vec<Vector3<f64>> = positions
        .iter()
        .map(|p| a_tilde * Vector3::from(*p))
        .collect();

    let dx1 = r[1].x - r[0].x;
    let dy1 = r[1].y - r[0].y;
    let dx2 = r[2].x - r[0].x;
    let dy2 = r[2].y - r[0].y;
    let den = dx2 * dy1 - dx1 * dy2;
    let scale = (dx1.abs() + dy1.abs()) * (dx2.abs() + dy2.abs());
    if den == 0.0 || den.abs() <= COLLINEAR_SINE * scale {
        return Err(ReconstructionError::DegenerateProjection);
    }

    let (t0, t1, t2) = (times[0], times[1], times[2]);
    let d_x_prime = speed_of_light * ((t0 - t2) * dy1 - (t0 - t1) * dy2) / den;
    let d_y_prime = speed_of_light * ((t0 - t1) * dx2 - (t0 - t2) * dx1) / den;
    let in_plane = d_x_prime * d_x_prime + d_y_prime * d_y_prime;
    if !in_plane.is_finite() {
        return Err(ReconstructionError::NonFinite);
    }
    if in_plane > 1.0 {
        return Err(ReconstructionError::Superluminal { in_plane });
    }
    let d_prime = Vector3::new(d_x_prime, d_y_prime, (1.0 - in_plane).sqrt());

    let norm = d_prime.norm();
    if !(norm >= UNIT_NORM_BAND.0 && norm < UNIT_NORM_BAND.1) {
        return Err(ReconstructionError::NotUnitNorm { norm });
    }

    let inverse = a_tilde
        .try_inverse()
        .ok_or(ReconstructionError::SingularTransform)?;
    let d = inverse * d_prime;

    let zenith = d.z.acos();
    let mut ratio = d.x / zenith.sin();
    if ratio.abs() > 1.0 && ratio.abs() <= 1.0 + ACOS_SLACK {
        ratio = ratio.signum();
    }
    let mut azimuth = ratio.acos().to_degrees();
    let mut zenith = zenith.to_degrees();
    if d.y > 0.0 {
        azimuth = 360.0 - azimuth;
    }
    if d.z < 0.0 {
        zenith = 180.0 - zenith;
    }
    let azimuth = rotate_to_true_north(azimuth, azimuth_offset_deg);

    if !azimuth.is_finite() || !zenith.is_finite() {
        return Err(ReconstructionError::NonFinite);
    }
    Ok(Direction {
        azimuth_deg: azimuth,
        zenith_deg: zenith,
        unit: [d.x, d.y, d.z],
    })
}

/// Unit vector in the survey frame for a true-north azimuth and zenith.
pub fn unit_direction(azimuth_deg: f64, zenith_deg: f64, azimuth_offset_deg: f64) -> [f64; 3] {
    let frame_azimuth = wrap_degrees(azimuth_deg + azimuth_offset_deg).to_radians();
    let zenith = zenith_deg.to_radians();
    [
        zenith.sin() * frame_azimuth.cos(),
        -zenith.sin() * frame_azimuth.sin(),
        zenith.cos(),
    ]
}

/// Forward model: arrival time at each antenna for a plane wave along `direction`.
pub fn simulate_arrival_times(
    positions: &[[f64; 3]],
    direction: [f64; 3],
    t0: f64,
    speed_of_light: f64,
) -> Vec<f64> {
    let Some(first) = positions.first() else {
        return Vec::new();
    };
    let p0 = Vector3::from(*first);
    let s = Vector3::from(direction);
    positions
        .iter()
        .map(|p| t0 - s.dot(&(Vector3::from(*p) - p0)) / speed_of_light)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AntennaHit {
    pub channel: usize,
    pub antenna: usize,
    pub position: [f64; 3],
    pub arrival_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComboOutcome {
    pub channels: [usize; 3],
    pub antennas: [usize; 3],
    pub arrival_times: [f64; 3],
    pub result: Result<Direction, ReconstructionError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSolution {
    pub combos: Vec<ComboOutcome>,
    /// Mean (azimuth, zenith) over the successful combos only.
    pub mean: Option<(f64, f64)>,
}

pub fn antenna_combinations(hit_count: usize) -> &'static [[usize; 3]] {
    match hit_count {
        3 => &[[0, 1, 2]],
        4 => &[[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]],
        _ => &[],
    }
}

/// Solves every 3-of-n combination of one polarity group (n = 3 or 4).
pub fn solve_group(hits: &[AntennaHit], speed_of_light: f64, azimuth_offset_deg: f64) -> GroupSolution {
    let mut ordered = hits.to_vec();
    ordered.sort_by_key(|h| h.channel);

    let combos: Vec<ComboOutcome> = antenna_combinations(ordered.len())
        .iter()
        .map(|idx| {
            let picked = [ordered[idx[0]], ordered[idx[1]], ordered[idx[2]]];
            let positions = picked.map(|h| h.position);
            let times = picked.map(|h| h.arrival_time);
            ComboOutcome {
                channels: picked.map(|h| h.channel),
                antennas: picked.map(|h| h.antenna),
                arrival_times: times,
                result: reconstruct_direction(&positions, &times, speed_of_light, azimuth_offset_deg),
            }
        })
        .collect();

    let solved: Vec<&Direction> = combos.iter().filter_map(|c| c.result.as_ref().ok()).collect();
    let mean = if solved.is_empty() {
        None
    } else {
        let azimuths: Vec<f64> = solved.iter().map(|d| d.azimuth_deg).collect();
        let zeniths: Vec<f64> = solved.iter().map(|d| d.zenith_deg).collect();
        Some((mean(&azimuths), mean(&zeniths)))
    };

    GroupSolution { combos, mean }
}
