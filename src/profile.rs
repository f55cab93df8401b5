//! Piecewise-linear schedules for user count and request rate.
//!
//! A [`Profile`] maps elapsed test time to a scalar. Concurrency shaping
//! reads it directly; rate shaping inverts its integral through a
//! [`Pacer`] to place every iteration start on the timeline.

use std::time::Duration;

use crate::error::Error;

/// Ordered `(t_seconds, value)` series, strictly increasing in `t`.
///
/// Queries outside the covered range clamp to the nearest endpoint;
/// queries between points interpolate linearly.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    points: Vec<(f64, f64)>,
}

impl Profile {
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self, Error> {
        if points.is_empty() {
            return Err(Error::config("profile must contain at least one point"));
        }
        for &(t, v) in &points {
            if !t.is_finite() || t < 0.0 {
                return Err(Error::config(format!("profile time {t} is not a finite non-negative number")));
            }
            if !v.is_finite() || v < 0.0 {
                return Err(Error::config(format!("profile value {v} is not a finite non-negative number")));
            }
        }
        if points.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(Error::config("profile times must be strictly increasing"));
        }
        Ok(Self { points })
    }

    /// Single-point profile holding `value` forever. `value` must be a
    /// finite non-negative number; use [`Pacer::unpaced`] for an
    /// unbounded rate.
    pub fn constant(value: f64) -> Self {
        Self {
            points: vec![(0.0, value.max(0.0))],
        }
    }

    /// Evaluate the profile at elapsed time `t` seconds.
    pub fn value(&self, t: f64) -> f64 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if t <= first.0 {
            return first.1;
        }
        if t >= last.0 {
            return last.1;
        }
        for w in self.points.windows(2) {
            let (ta, va) = w[0];
            let (tb, vb) = w[1];
            if t <= tb {
                return va + (vb - va) * (t - ta) / (tb - ta);
            }
        }
        last.1
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }
}

/// Where the next iteration start falls relative to the loop origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NextStart {
    /// No pacing; start now.
    Immediate,
    /// Start at this offset from the loop origin.
    At(Duration),
    /// The rate integrates to a bound below the requested start number.
    Never,
}

/// Admits starts so that the cumulative count tracks the integral of a
/// rate profile. The deadline for start `n + 1` is the time `t` at which
/// `∫₀ᵗ r(u) du = n + 1`; deadlines are non-decreasing in `n`, which
/// makes the pacer the single serialization point for start numbering.
#[derive(Debug, Clone)]
pub struct Pacer {
    profile: Option<Profile>,
}

impl Pacer {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile: Some(profile),
        }
    }

    /// A pacer that admits every start immediately.
    pub fn unpaced() -> Self {
        Self { profile: None }
    }

    pub fn is_unpaced(&self) -> bool {
        self.profile.is_none()
    }

    /// Deadline for the next start given `n_started` starts so far.
    pub fn next_start(&self, n_started: u64) -> NextStart {
        let Some(profile) = &self.profile else {
            return NextStart::Immediate;
        };
        let target = (n_started + 1) as f64;
        let points = profile.points();
        let mut cum = 0.0;

        // Clamp region before the first point: constant v0.
        let (t0, v0) = points[0];
        if t0 > 0.0 {
            if let Some(t) = solve_segment(0.0, t0, v0, v0, &mut cum, target) {
                return NextStart::At(Duration::from_secs_f64(t));
            }
        }
        for w in points.windows(2) {
            let (ta, va) = w[0];
            let (tb, vb) = w[1];
            if let Some(t) = solve_segment(ta, tb, va, vb, &mut cum, target) {
                return NextStart::At(Duration::from_secs_f64(t));
            }
        }
        // Clamp region after the last point: constant v_last.
        let (tl, vl) = points[points.len() - 1];
        if vl <= 0.0 {
            return NextStart::Never;
        }
        let t = tl + (target - cum) / vl;
        NextStart::At(Duration::from_secs_f64(t))
    }
}

/// Accumulate the integral of the linear segment `(ta, va) → (tb, vb)`
/// into `cum`; if the segment carries the integral past `target`, return
/// the crossing time.
fn solve_segment(ta: f64, tb: f64, va: f64, vb: f64, cum: &mut f64, target: f64) -> Option<f64> {
    let dt = tb - ta;
    if dt <= 0.0 {
        return None;
    }
    let area = (va + vb) * 0.5 * dt;
    if *cum + area < target {
        *cum += area;
        return None;
    }
    let need = target - *cum;
    let slope = (vb - va) / dt;
    let dx = if slope.abs() < f64::EPSILON {
        // Constant rate; va > 0 because the segment covers `need`.
        need / va
    } else {
        // Solve va·x + slope·x²/2 = need for the earliest crossing.
        let disc = va * va + 2.0 * slope * need;
        (-va + disc.max(0.0).sqrt()) / slope
    };
    Some(ta + dx.clamp(0.0, dt))
}
