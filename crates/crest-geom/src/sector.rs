//! Forward-sector containment and wave-front delay.
//!
//! Both levels of the propagation wave reason about an angular sector:
//! a cluster head selecting target cells in neighbor density maps, and
//! a node deciding whether an inter-node frame reaches it at all.
//! The sector has its apex at `source`, its axis along `direction`, a
//! half-angle of `theta / 2` on each side and a bounded radius.

use crate::Vec3;

/// Test whether `destination` lies inside the forward sector anchored at
/// `source` with axis `direction`, radius `radius` and full opening angle
/// `theta` (radians).
///
/// The delta is rotated into the frame spanned by `direction` and its
/// perpendicular (scaled by 1/|direction|²), then checked against the two
/// bounding rays with signed cross products. A sector wider than π flips
/// the containment logic, which the branch on the rays' own cross product
/// handles.
pub fn in_sector(source: Vec3, destination: Vec3, direction: Vec3, radius: f64, theta: f64) -> bool {
    let a = direction.x;
    let b = direction.y;
    let norm = a * a + b * b;
    let delta = destination - source;

    if delta.x * delta.x + delta.y * delta.y > radius * radius {
        return false;
    }

    // Delta expressed in the direction frame.
    let dx = (a * delta.x + b * delta.y) / norm;
    let dy = (-b * delta.x + a * delta.y) / norm;

    let ex = (theta / 2.0).cos();
    let ey = (theta / 2.0).sin();
    let sx = (-theta / 2.0).cos();
    let sy = (-theta / 2.0).sin();

    if sx * ey - ex * sy > 0.0 {
        if sx * dy - dx * sy < 0.0 {
            return false;
        }
        if ex * dy - dx * ey > 0.0 {
            return false;
        }
        true
    } else {
        if sx * dy - dx * sy >= 0.0 {
            return true;
        }
        if ex * dy - dx * ey <= 0.0 {
            return true;
        }
        false
    }
}

/// Time in seconds for a wave front travelling along `direction` to cover
/// the stretch from `source` to `destination`.
///
/// Only the projection of the delta onto the direction axis counts: the
/// front is a line perpendicular to the axis, so lateral offset does not
/// delay it. `direction`'s horizontal length is the front speed.
pub fn propagation_delay(source: Vec3, destination: Vec3, direction: Vec3) -> f64 {
    let a = direction.x;
    let b = direction.y;
    let speed_sq = a * a + b * b;
    let delta = destination - source;

    let along = (a * delta.x + b * delta.y) / speed_sq;
    along.abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const THETA: f64 = std::f64::consts::FRAC_PI_3; // 60 degrees

    #[test]
    fn point_on_axis_is_inside() {
        let src = Vec3::ZERO;
        let dir = Vec3::new(10.0, 0.0, 0.0);
        assert!(in_sector(src, Vec3::new(50.0, 0.0, 0.0), dir, 100.0, THETA));
    }

    #[test]
    fn point_beyond_radius_is_outside() {
        let src = Vec3::ZERO;
        let dir = Vec3::new(10.0, 0.0, 0.0);
        assert!(!in_sector(src, Vec3::new(150.0, 0.0, 0.0), dir, 100.0, THETA));
    }

    #[test]
    fn point_behind_is_outside() {
        let src = Vec3::ZERO;
        let dir = Vec3::new(10.0, 0.0, 0.0);
        assert!(!in_sector(src, Vec3::new(-50.0, 0.0, 0.0), dir, 100.0, THETA));
    }

    #[test]
    fn lateral_points_respect_half_angle() {
        let src = Vec3::ZERO;
        let dir = Vec3::new(10.0, 0.0, 0.0);
        // 60 degree sector: +-30 degrees around the axis. tan(30) ~ 0.577.
        assert!(in_sector(src, Vec3::new(50.0, 20.0, 0.0), dir, 100.0, THETA));
        assert!(in_sector(src, Vec3::new(50.0, -20.0, 0.0), dir, 100.0, THETA));
        assert!(!in_sector(src, Vec3::new(50.0, 40.0, 0.0), dir, 100.0, THETA));
        assert!(!in_sector(src, Vec3::new(50.0, -40.0, 0.0), dir, 100.0, THETA));
    }

    #[test]
    fn sector_follows_rotated_axis() {
        let src = Vec3::ZERO;
        let dir = Vec3::new(0.0, 5.0, 0.0); // pointing +y
        assert!(in_sector(src, Vec3::new(0.0, 50.0, 0.0), dir, 100.0, THETA));
        assert!(!in_sector(src, Vec3::new(50.0, 0.0, 0.0), dir, 100.0, THETA));
    }

    #[test]
    fn wide_sector_accepts_most_of_the_disc() {
        let src = Vec3::ZERO;
        let dir = Vec3::new(10.0, 0.0, 0.0);
        let wide = 1.5 * std::f64::consts::PI; // 270 degrees
        assert!(in_sector(src, Vec3::new(0.0, 50.0, 0.0), dir, 100.0, wide));
        assert!(in_sector(src, Vec3::new(0.0, -50.0, 0.0), dir, 100.0, wide));
        assert!(!in_sector(src, Vec3::new(-50.0, 0.0, 0.0), dir, 100.0, wide));
    }

    #[test]
    fn delay_is_projection_over_speed() {
        let src = Vec3::ZERO;
        let dir = Vec3::new(10.0, 0.0, 0.0);
        // 30 m along the axis at 10 m/s -> 3 s, lateral offset irrelevant.
        let delay = propagation_delay(src, Vec3::new(30.0, 12.0, 0.0), dir);
        assert!((delay - 3.0).abs() < 1e-9);
    }

    #[test]
    fn delay_is_symmetric_in_sign() {
        let src = Vec3::ZERO;
        let dir = Vec3::new(10.0, 0.0, 0.0);
        let fwd = propagation_delay(src, Vec3::new(30.0, 0.0, 0.0), dir);
        let back = propagation_delay(src, Vec3::new(-30.0, 0.0, 0.0), dir);
        assert_eq!(fwd, back);
    }
}
