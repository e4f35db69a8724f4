//! Spherical-projection invariants precomputed once per parameter set.
//!
//! The monitor is a flat plane at `monitor_distance_cm` from the eye,
//! optionally rotated laterally. For every pixel we precompute the visual
//! azimuth and altitude it subtends, plus the base counter-phase
//! checkerboard evaluated in those spherical coordinates. Frame generation
//! then reduces to a per-pixel mask lookup against the bar position, which
//! makes this precompute the main performance lever of the renderer.

use ndarray::Array2;

use crate::config::{MonitorParams, StimulusParams};

/// Per-pixel spherical coordinates and the base checkerboard.
pub struct SphericalField {
    pub width: usize,
    pub height: usize,
    /// Visual azimuth per pixel, degrees. Positive to the right.
    pub azimuth_deg: Array2<f32>,
    /// Visual altitude per pixel, degrees. Positive up.
    pub altitude_deg: Array2<f32>,
    /// Base checkerboard, `+1`/`-1` per pixel.
    pub checkerboard: Array2<f32>,
    /// Min/max azimuth actually subtended by the monitor.
    pub azimuth_range_deg: (f64, f64),
    /// Min/max altitude actually subtended by the monitor.
    pub altitude_range_deg: (f64, f64),
}

impl SphericalField {
    /// Precompute all invariants for one `(monitor, stimulus)` config.
    pub fn precompute(monitor: &MonitorParams, stimulus: &StimulusParams) -> Self {
        let width = monitor.monitor_width_px as usize;
        let height = monitor.monitor_height_px as usize;
        let distance = monitor.monitor_distance_cm;
        let lateral = monitor.monitor_lateral_angle_deg;

        let mut azimuth_deg = Array2::zeros((height, width));
        let mut altitude_deg = Array2::zeros((height, width));
        let mut checkerboard = Array2::zeros((height, width));

        let mut az_min = f64::INFINITY;
        let mut az_max = f64::NEG_INFINITY;
        let mut alt_min = f64::INFINITY;
        let mut alt_max = f64::NEG_INFINITY;

        let checker = stimulus.checker_size_deg;

        for row in 0..height {
            // Pixel centers; rows run top to bottom, altitude runs bottom to top.
            let y_cm = (0.5 - (row as f64 + 0.5) / height as f64) * monitor.monitor_height_cm;
            for col in 0..width {
                let x_cm = ((col as f64 + 0.5) / width as f64 - 0.5) * monitor.monitor_width_cm;

                let azimuth = lateral + x_cm.atan2(distance).to_degrees();
                let altitude = y_cm.atan2((distance * distance + x_cm * x_cm).sqrt()).to_degrees();

                az_min = az_min.min(azimuth);
                az_max = az_max.max(azimuth);
                alt_min = alt_min.min(altitude);
                alt_max = alt_max.max(altitude);

                azimuth_deg[[row, col]] = azimuth as f32;
                altitude_deg[[row, col]] = altitude as f32;

                let cell = (azimuth / checker).floor() + (altitude / checker).floor();
                checkerboard[[row, col]] = if (cell as i64).rem_euclid(2) == 0 {
                    1.0
                } else {
                    -1.0
                };
            }
        }

        Self {
            width,
            height,
            azimuth_deg,
            altitude_deg,
            checkerboard,
            azimuth_range_deg: (az_min, az_max),
            altitude_range_deg: (alt_min, alt_max),
        }
    }
}

/// Half-extent of the visual field subtended by the monitor, degrees,
/// (azimuth_half, altitude_half). Used by the analysis stage to scale
/// phases to visual angle without building a full field.
pub fn monitor_half_extents_deg(monitor: &MonitorParams) -> (f64, f64) {
    let azimuth_half = (monitor.monitor_width_cm / 2.0)
        .atan2(monitor.monitor_distance_cm)
        .to_degrees();
    let altitude_half = (monitor.monitor_height_cm / 2.0)
        .atan2(monitor.monitor_distance_cm)
        .to_degrees();
    (azimuth_half, altitude_half)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_monitor() -> MonitorParams {
        MonitorParams {
            monitor_distance_cm: 10.0,
            monitor_lateral_angle_deg: 0.0,
            monitor_width_px: 64,
            monitor_height_px: 32,
            monitor_width_cm: 20.0,
            monitor_height_cm: 10.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_field_dimensions_match_monitor() {
        let field = SphericalField::precompute(&small_monitor(), &StimulusParams::default());
        assert_eq!(field.azimuth_deg.dim(), (32, 64));
        assert_eq!(field.altitude_deg.dim(), (32, 64));
        assert_eq!(field.checkerboard.dim(), (32, 64));
    }

    #[test]
    fn test_azimuth_monotonic_left_to_right() {
        let field = SphericalField::precompute(&small_monitor(), &StimulusParams::default());
        let mid = field.height / 2;
        for col in 1..field.width {
            assert!(field.azimuth_deg[[mid, col]] > field.azimuth_deg[[mid, col - 1]]);
        }
        // Symmetric monitor: edges are near +/- atan(10/10) = 45 deg.
        assert!(field.azimuth_deg[[mid, 0]] < 0.0);
        assert!(field.azimuth_deg[[mid, field.width - 1]] > 0.0);
    }

    #[test]
    fn test_altitude_monotonic_bottom_to_top() {
        let field = SphericalField::precompute(&small_monitor(), &StimulusParams::default());
        let mid = field.width / 2;
        for row in 1..field.height {
            // Rows go top to bottom; altitude must decrease with row.
            assert!(field.altitude_deg[[row, mid]] < field.altitude_deg[[row - 1, mid]]);
        }
    }

    #[test]
    fn test_lateral_angle_shifts_azimuth() {
        let mut monitor = small_monitor();
        let centered = SphericalField::precompute(&monitor, &StimulusParams::default());
        monitor.monitor_lateral_angle_deg = 30.0;
        let shifted = SphericalField::precompute(&monitor, &StimulusParams::default());
        let mid = (centered.height / 2, centered.width / 2);
        let delta = shifted.azimuth_deg[[mid.0, mid.1]] - centered.azimuth_deg[[mid.0, mid.1]];
        assert!((delta - 30.0).abs() < 1e-3);
    }

    #[test]
    fn test_checkerboard_is_binary() {
        let field = SphericalField::precompute(&small_monitor(), &StimulusParams::default());
        for &v in field.checkerboard.iter() {
            assert!(v == 1.0 || v == -1.0);
        }
    }

    #[test]
    fn test_half_extents_match_geometry() {
        let (az, alt) = monitor_half_extents_deg(&small_monitor());
        assert!((az - 45.0).abs() < 1e-9);
        assert!((alt - 26.565).abs() < 1e-2);
    }
}
