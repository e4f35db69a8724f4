//! Fourier retinotopic analysis pipeline (Kalatsky & Stryker 2003;
//! Zhuang et al. 2017).
//!
//! Pure and deterministic: the pipeline is constructed from the analysis
//! parameter group, reads one recorded session, and produces the full map
//! set. Stages, in order: load & validate, correlate frames to stimulus
//! events, hemodynamic delay compensation, per-pixel FFT at the stimulus
//! frequency, bidirectional phase synthesis, smoothing and gradients,
//! visual field sign, and boundary/area segmentation.
//!
//! Cancellation is cooperative: the stop flag is honored at stage
//! boundaries and between row batches inside the FFT stage.

use ndarray::{Array2, Array3};
use num_complex::Complex32;
use rustfft::FftPlanner;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::config::AnalysisParams;
use crate::core::Direction;
use crate::error::{AppResult, IsiError};
use crate::session::{self, SessionMetadata, StimulusEvent};
use crate::stimulus::monitor_half_extents_deg;

/// Frame/event pairings at or beyond this gap are rejected.
const CORRELATION_WINDOW_US: u64 = 50_000;

/// Rows processed between cancellation checks in the FFT stage.
const FFT_ROW_BATCH: usize = 8;

/// Complete output of one pipeline run.
pub struct AnalysisResults {
    pub session_path: PathBuf,
    pub shape: (usize, usize),
    pub azimuth_map: Array2<f32>,
    pub elevation_map: Array2<f32>,
    pub sign_map: Array2<f32>,
    pub area_map: Array2<f32>,
    pub boundary_map: Array2<f32>,
    pub phase_maps: BTreeMap<Direction, Array2<f32>>,
    pub magnitude_maps: BTreeMap<Direction, Array2<f32>>,
    pub num_areas: u32,
    pub anatomical: Option<Array2<u8>>,
}

impl AnalysisResults {
    pub fn primary_layer_names(&self) -> Vec<String> {
        let mut names = vec![
            "azimuth_map".to_string(),
            "elevation_map".to_string(),
            "sign_map".to_string(),
            "area_map".to_string(),
            "boundary_map".to_string(),
        ];
        if self.anatomical.is_some() {
            names.push("anatomical".to_string());
        }
        names
    }

    pub fn advanced_layer_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for direction in self.phase_maps.keys() {
            names.push(format!("phase_{direction}"));
        }
        for direction in self.magnitude_maps.keys() {
            names.push(format!("magnitude_{direction}"));
        }
        names
    }

    /// Look up a float layer by its published name.
    pub fn layer(&self, name: &str) -> Option<&Array2<f32>> {
        match name {
            "azimuth_map" => Some(&self.azimuth_map),
            "elevation_map" => Some(&self.elevation_map),
            "sign_map" => Some(&self.sign_map),
            "area_map" => Some(&self.area_map),
            "boundary_map" => Some(&self.boundary_map),
            _ => {
                if let Some(rest) = name.strip_prefix("phase_") {
                    let direction = Direction::parse(rest).ok()?;
                    self.phase_maps.get(&direction)
                } else if let Some(rest) = name.strip_prefix("magnitude_") {
                    let direction = Direction::parse(rest).ok()?;
                    self.magnitude_maps.get(&direction)
                } else {
                    None
                }
            }
        }
    }
}

/// One direction's correlated data, ready for the Fourier stage.
struct DirectionStack {
    frames: Array3<f32>,
    fps: f64,
    num_cycles: u32,
}

/// The pipeline proper.
pub struct AnalysisPipeline {
    params: AnalysisParams,
}

impl AnalysisPipeline {
    pub fn new(params: AnalysisParams) -> Self {
        Self { params }
    }

    /// Run every stage for one session.
    ///
    /// `progress(fraction, stage)` fires at stage boundaries;
    /// `layer_ready(name, layer)` fires as each primary layer materializes.
    pub fn run(
        &self,
        session_dir: &Path,
        stop: &AtomicBool,
        progress: &(dyn Fn(f64, &str) + Sync),
        layer_ready: &(dyn Fn(&str, &Array2<f32>) + Sync),
    ) -> AppResult<AnalysisResults> {
        progress(0.0, "loading session");
        let metadata = SessionMetadata::load(session_dir)?;
        self.validate_session(session_dir, &metadata)?;

        let mut phase_maps = BTreeMap::new();
        let mut magnitude_maps = BTreeMap::new();
        let mut shape: Option<(usize, usize)> = None;

        let per_direction = 0.6 / metadata.directions.len() as f64;
        for (idx, &direction) in metadata.directions.iter().enumerate() {
            self.check_stop(stop)?;
            let base = 0.05 + per_direction * idx as f64;
            progress(base, &format!("correlating {direction}"));
            let stack = self.load_direction(session_dir, &metadata, direction)?;
            let (n, h, w) = stack.frames.dim();
            shape = Some((h, w));
            debug!(%direction, frames = n, "direction correlated");

            progress(base + per_direction * 0.3, &format!("fourier {direction}"));
            let compensated = self.compensate_hemodynamic(stack.frames, stack.fps);
            let (phase, magnitude) =
                fourier_at_bin(&compensated, stack.num_cycles as usize, stop)?;
            phase_maps.insert(direction, phase);
            magnitude_maps.insert(direction, magnitude);
        }
        let shape = shape.ok_or_else(|| IsiError::Analysis("session has no directions".into()))?;

        self.check_stop(stop)?;
        progress(0.65, "bidirectional synthesis");
        let (azimuth_half, altitude_half) = monitor_half_extents_deg(&metadata.monitor);
        let azimuth_map = self.synthesize_axis(
            &phase_maps,
            Direction::LR,
            Direction::RL,
            azimuth_half,
            shape,
        )?;
        let elevation_map = self.synthesize_axis(
            &phase_maps,
            Direction::TB,
            Direction::BT,
            altitude_half,
            shape,
        )?;
        layer_ready("azimuth_map", &azimuth_map);
        layer_ready("elevation_map", &elevation_map);

        self.check_stop(stop)?;
        progress(0.75, "visual field sign");
        let sign_map = self.visual_field_sign(&azimuth_map, &elevation_map, &magnitude_maps);
        layer_ready("sign_map", &sign_map);

        self.check_stop(stop)?;
        progress(0.85, "segmenting areas");
        let boundary_map = super::segmentation::boundary_map(&sign_map);
        let (area_map, num_areas) =
            super::segmentation::label_areas(&sign_map, self.params.area_min_size);
        layer_ready("boundary_map", &boundary_map);
        layer_ready("area_map", &area_map);

        let anatomical_path = session_dir.join(session::ANATOMICAL_FILE);
        let anatomical = if anatomical_path.exists() {
            Some(session::read_npy_u8(&anatomical_path)?)
        } else {
            None
        };

        progress(0.95, "finalizing");
        info!(num_areas, "analysis pipeline finished");
        Ok(AnalysisResults {
            session_path: session_dir.to_path_buf(),
            shape,
            azimuth_map,
            elevation_map,
            sign_map,
            area_map,
            boundary_map,
            phase_maps,
            magnitude_maps,
            num_areas,
            anatomical,
        })
    }

    // =========================================================================
    // Stage 1: load & validate
    // =========================================================================

    fn validate_session(&self, session_dir: &Path, metadata: &SessionMetadata) -> AppResult<()> {
        if metadata.directions.is_empty() {
            return Err(IsiError::Analysis(format!(
                "session {} lists no recorded directions",
                session_dir.display()
            )));
        }
        for &direction in &metadata.directions {
            for file in [
                session::camera_file(direction),
                session::stimulus_file(direction),
                session::events_file(direction),
            ] {
                let path = session_dir.join(&file);
                if !path.exists() {
                    return Err(IsiError::Analysis(format!(
                        "missing session file: {}",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Stage 2: correlate frames to stimulus events
    // =========================================================================

    fn load_direction(
        &self,
        session_dir: &Path,
        metadata: &SessionMetadata,
        direction: Direction,
    ) -> AppResult<DirectionStack> {
        let camera_path = session_dir.join(session::camera_file(direction));
        let file = hdf5::File::open(&camera_path)?;
        let frames_ds = file.dataset("frames")?;
        let timestamps: Vec<u64> = file.dataset("timestamps")?.read_raw()?;
        let shape = frames_ds.shape();
        if shape.is_empty() || shape[0] != timestamps.len() {
            return Err(IsiError::Analysis(format!(
                "{}: {} frames but {} timestamps",
                camera_path.display(),
                shape.first().copied().unwrap_or(0),
                timestamps.len()
            )));
        }
        let raw: Vec<u8> = frames_ds.read_raw()?;
        let stack = to_luminance_stack(&raw, &shape)?;

        let events = session::load_events(session_dir, direction)?;
        if events.is_empty() {
            return Err(IsiError::Analysis(format!(
                "{direction}: no stimulus events recorded"
            )));
        }

        // Nearest-event pairing; frames further than the window from any
        // stimulus event are dropped.
        let kept: Vec<usize> = timestamps
            .iter()
            .enumerate()
            .filter(|(_, &ts)| {
                nearest_event_gap_us(&events, ts) < CORRELATION_WINDOW_US
            })
            .map(|(i, _)| i)
            .collect();
        if kept.is_empty() {
            return Err(IsiError::Analysis(format!(
                "{direction}: no camera frame correlates with any stimulus event"
            )));
        }
        let dropped = timestamps.len() - kept.len();
        if dropped > 0 {
            debug!(%direction, dropped, "frames outside the correlation window");
        }

        let (_, h, w) = stack.dim();
        let mut frames = Array3::zeros((kept.len(), h, w));
        for (out_idx, &src_idx) in kept.iter().enumerate() {
            frames
                .index_axis_mut(ndarray::Axis(0), out_idx)
                .assign(&stack.index_axis(ndarray::Axis(0), src_idx));
        }

        let fps = estimate_fps(&timestamps).unwrap_or(metadata.camera.camera_fps.max(1.0));
        Ok(DirectionStack {
            frames,
            fps,
            num_cycles: metadata.stimulus_params.num_cycles,
        })
    }

    // =========================================================================
    // Stage 3: hemodynamic delay compensation
    // =========================================================================

    /// Circularly shift the frame stack backward by `round(delay * fps)`
    /// samples, aligning the optical response to the stimulus that caused
    /// it. Residual bias cancels in the bidirectional average.
    fn compensate_hemodynamic(&self, frames: Array3<f32>, fps: f64) -> Array3<f32> {
        let n = frames.dim().0;
        let shift =
            ((self.params.hemodynamic_delay_sec * fps).round() as usize).rem_euclid(n.max(1));
        if shift == 0 || n == 0 {
            return frames;
        }
        let mut rolled = Array3::zeros(frames.dim());
        for t in 0..n {
            rolled
                .index_axis_mut(ndarray::Axis(0), t)
                .assign(&frames.index_axis(ndarray::Axis(0), (t + shift) % n));
        }
        rolled
    }

    // =========================================================================
    // Stage 5: bidirectional synthesis
    // =========================================================================

    /// Average the forward phase with the mirrored reverse phase, then map
    /// the centered phase linearly onto the monitor's visual-angle extent.
    fn synthesize_axis(
        &self,
        phase_maps: &BTreeMap<Direction, Array2<f32>>,
        forward: Direction,
        reverse: Direction,
        half_extent_deg: f64,
        shape: (usize, usize),
    ) -> AppResult<Array2<f32>> {
        let center = match (phase_maps.get(&forward), phase_maps.get(&reverse)) {
            (Some(fwd), Some(rev)) => {
                let fwd = self.filter_phase(fwd);
                let rev = self.filter_phase(rev);
                let mut center = Array2::zeros(shape);
                ndarray::Zip::from(&mut center)
                    .and(&fwd)
                    .and(&rev)
                    .for_each(|c, &f, &r| *c = bidirectional_center(f, r));
                center
            }
            // A single recorded direction still yields a (biased) map.
            (Some(single), None) => self.filter_phase(single),
            (None, Some(single)) => self.filter_phase(single).mapv(|p| wrap_phase(-p)),
            (None, None) => Array2::zeros(shape),
        };
        Ok(center.mapv(|p| (p as f64 / std::f64::consts::PI * half_extent_deg) as f32))
    }

    /// Wrap-safe phase smoothing: filter the unit phasor, then take its
    /// argument. Disabled when `phase_filter_sigma` is zero.
    fn filter_phase(&self, phase: &Array2<f32>) -> Array2<f32> {
        if self.params.phase_filter_sigma <= 0.0 {
            return phase.clone();
        }
        let real = gaussian_smooth(&phase.mapv(f32::cos), self.params.phase_filter_sigma);
        let imag = gaussian_smooth(&phase.mapv(f32::sin), self.params.phase_filter_sigma);
        let mut out = Array2::zeros(phase.dim());
        ndarray::Zip::from(&mut out)
            .and(&real)
            .and(&imag)
            .for_each(|o, &re, &im| *o = im.atan2(re));
        out
    }

    // =========================================================================
    // Stages 6-7: gradients and visual field sign
    // =========================================================================

    fn visual_field_sign(
        &self,
        azimuth: &Array2<f32>,
        elevation: &Array2<f32>,
        magnitude_maps: &BTreeMap<Direction, Array2<f32>>,
    ) -> Array2<f32> {
        let azimuth_s = gaussian_smooth(azimuth, self.params.smoothing_sigma);
        let elevation_s = gaussian_smooth(elevation, self.params.smoothing_sigma);
        let window = self.params.gradient_window_size.max(1);
        let (daz_dy, daz_dx) = gradients(&azimuth_s, window);
        let (del_dy, del_dx) = gradients(&elevation_s, window);

        let mut sign = Array2::zeros(azimuth.dim());
        ndarray::Zip::from(&mut sign)
            .and(&daz_dx)
            .and(&del_dy)
            .and(&daz_dy)
            .and(&del_dx)
            .for_each(|s, &ax, &ey, &ay, &ex| {
                let det = ax * ey - ay * ex;
                *s = if det > 0.0 {
                    1.0
                } else if det < 0.0 {
                    -1.0
                } else {
                    0.0
                };
            });

        self.apply_response_mask(&mut sign, magnitude_maps);
        self.apply_vfs_threshold(&mut sign);
        sign
    }

    /// Zero the sign map where the stimulus response is too weak to trust,
    /// using the mean magnitude across directions.
    fn apply_response_mask(
        &self,
        sign: &mut Array2<f32>,
        magnitude_maps: &BTreeMap<Direction, Array2<f32>>,
    ) {
        let floor = self
            .params
            .magnitude_threshold
            .max(self.params.response_threshold_percent / 100.0);
        if floor <= 0.0 || magnitude_maps.is_empty() {
            return;
        }
        let mut combined: Array2<f32> = Array2::zeros(sign.dim());
        for magnitude in magnitude_maps.values() {
            combined += magnitude;
        }
        let peak = combined.iter().copied().fold(0.0f32, f32::max);
        if peak <= 0.0 {
            return;
        }
        let cutoff = (floor as f32) * peak;
        ndarray::Zip::from(sign)
            .and(&combined)
            .for_each(|s, &m| {
                if m < cutoff {
                    *s = 0.0;
                }
            });
    }

    /// Zhuang-style statistical cleanup: smooth the raw sign field and
    /// keep only pixels beyond `vfs_threshold_sd` standard deviations.
    fn apply_vfs_threshold(&self, sign: &mut Array2<f32>) {
        if self.params.vfs_threshold_sd <= 0.0 {
            return;
        }
        let smoothed = gaussian_smooth(sign, self.params.smoothing_sigma.max(1.0));
        let mean = smoothed.mean().unwrap_or(0.0);
        let std = (smoothed.mapv(|v| (v - mean).powi(2)).mean().unwrap_or(0.0)).sqrt();
        let cutoff = self.params.vfs_threshold_sd as f32 * std;
        ndarray::Zip::from(sign).and(&smoothed).for_each(|s, &v| {
            *s = if v > cutoff {
                1.0
            } else if v < -cutoff {
                -1.0
            } else {
                0.0
            };
        });
    }

    fn check_stop(&self, stop: &AtomicBool) -> AppResult<()> {
        if stop.load(Ordering::SeqCst) {
            Err(IsiError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// Stage 4: per-pixel FFT at the stimulus frequency
// =============================================================================

/// For each pixel: subtract the temporal mean, FFT, and sample the bin
/// nearest the stimulus frequency. With `num_cycles` complete sweeps over
/// `N` frames the target frequency is `num_cycles / N` cycles per frame,
/// i.e. bin index `num_cycles`.
///
/// Phase follows the response-lag convention (the negated spectrum
/// argument): a pixel whose intensity is `cos(2pi k t / N + phi)` yields
/// `-phi`, wrapped to `(-pi, pi]`.
pub fn fourier_at_bin(
    frames: &Array3<f32>,
    bin: usize,
    stop: &AtomicBool,
) -> AppResult<(Array2<f32>, Array2<f32>)> {
    let (n, height, width) = frames.dim();
    if n < 2 {
        return Err(IsiError::Analysis(format!(
            "need at least 2 frames for spectral analysis, got {n}"
        )));
    }
    let bin = bin.clamp(1, n / 2);

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n);
    let mut scratch = vec![Complex32::default(); fft.get_inplace_scratch_len()];
    let mut series = vec![Complex32::default(); n];

    let mut phase = Array2::zeros((height, width));
    let mut magnitude = Array2::zeros((height, width));

    for row in 0..height {
        if row % FFT_ROW_BATCH == 0 && stop.load(Ordering::SeqCst) {
            return Err(IsiError::Cancelled);
        }
        for col in 0..width {
            let mut mean = 0.0f32;
            for t in 0..n {
                mean += frames[[t, row, col]];
            }
            mean /= n as f32;
            for t in 0..n {
                series[t] = Complex32::new(frames[[t, row, col]] - mean, 0.0);
            }
            fft.process_with_scratch(&mut series, &mut scratch);
            let coeff = series[bin];
            phase[[row, col]] = wrap_phase(-coeff.arg());
            magnitude[[row, col]] = coeff.norm();
        }
    }
    Ok((phase, magnitude))
}

/// Wrap to `(-pi, pi]`.
pub fn wrap_phase(mut p: f32) -> f32 {
    use std::f32::consts::PI;
    while p > PI {
        p -= 2.0 * PI;
    }
    while p <= -PI {
        p += 2.0 * PI;
    }
    p
}

/// Mirror the reverse-direction phase onto the forward axis, unwrap the
/// pair to the nearest branch, and average. The common hemodynamic offset
/// cancels; the result is the centered position phase, wrapped.
pub fn bidirectional_center(forward: f32, reverse: f32) -> f32 {
    use std::f32::consts::PI;
    let mut mirrored = wrap_phase(-reverse);
    if forward - mirrored > PI {
        mirrored += 2.0 * PI;
    } else if mirrored - forward > PI {
        mirrored -= 2.0 * PI;
    }
    wrap_phase((forward + mirrored) / 2.0)
}

// =============================================================================
// Numeric helpers
// =============================================================================

/// Separable Gaussian smoothing with reflected borders. Sigma of zero (or
/// a kernel that would be a single tap) is the identity.
pub fn gaussian_smooth(input: &Array2<f32>, sigma: f64) -> Array2<f32> {
    if sigma <= 0.0 {
        return input.clone();
    }
    let radius = (3.0 * sigma).ceil() as isize;
    if radius < 1 {
        return input.clone();
    }
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    for i in -radius..=radius {
        kernel.push((-(i as f64).powi(2) / (2.0 * sigma * sigma)).exp() as f32);
    }
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }

    let (height, width) = input.dim();
    let reflect = |i: isize, len: usize| -> usize {
        let len = len as isize;
        let mut i = i;
        if i < 0 {
            i = -i - 1;
        }
        if i >= len {
            i = 2 * len - 1 - i;
        }
        i.clamp(0, len - 1) as usize
    };

    let mut rows = Array2::zeros((height, width));
    for r in 0..height {
        for c in 0..width {
            let mut acc = 0.0;
            for (ki, k) in kernel.iter().enumerate() {
                let cc = reflect(c as isize + ki as isize - radius, width);
                acc += k * input[[r, cc]];
            }
            rows[[r, c]] = acc;
        }
    }
    let mut out = Array2::zeros((height, width));
    for r in 0..height {
        for c in 0..width {
            let mut acc = 0.0;
            for (ki, k) in kernel.iter().enumerate() {
                let rr = reflect(r as isize + ki as isize - radius, height);
                acc += k * rows[[rr, c]];
            }
            out[[r, c]] = acc;
        }
    }
    out
}

/// Central-difference gradients `(d/dy, d/dx)` with a configurable spacing
/// window; borders clamp.
pub fn gradients(input: &Array2<f32>, window: usize) -> (Array2<f32>, Array2<f32>) {
    let (height, width) = input.dim();
    let w = window as isize;
    let mut dy = Array2::zeros((height, width));
    let mut dx = Array2::zeros((height, width));
    let clamp = |i: isize, len: usize| i.clamp(0, len as isize - 1) as usize;
    for r in 0..height {
        for c in 0..width {
            let r_hi = clamp(r as isize + w, height);
            let r_lo = clamp(r as isize - w, height);
            let c_hi = clamp(c as isize + w, width);
            let c_lo = clamp(c as isize - w, width);
            if r_hi > r_lo {
                dy[[r, c]] = (input[[r_hi, c]] - input[[r_lo, c]]) / (r_hi - r_lo) as f32;
            }
            if c_hi > c_lo {
                dx[[r, c]] = (input[[r, c_hi]] - input[[r, c_lo]]) / (c_hi - c_lo) as f32;
            }
        }
    }
    (dy, dx)
}

/// Mean inter-frame interval, as frames per second.
fn estimate_fps(timestamps: &[u64]) -> Option<f64> {
    if timestamps.len() < 2 {
        return None;
    }
    let span = timestamps.last()? - timestamps.first()?;
    if span == 0 {
        return None;
    }
    Some((timestamps.len() - 1) as f64 * 1e6 / span as f64)
}

/// Gap in microseconds to the nearest event timestamp.
fn nearest_event_gap_us(events: &[StimulusEvent], ts: u64) -> u64 {
    let idx = events.partition_point(|e| e.timestamp_us < ts);
    let mut best = u64::MAX;
    if idx < events.len() {
        best = best.min(events[idx].timestamp_us.abs_diff(ts));
    }
    if idx > 0 {
        best = best.min(events[idx - 1].timestamp_us.abs_diff(ts));
    }
    best
}

/// Collapse a raw `[N,H,W]` or `[N,H,W,C]` u8 stack to float luminance.
fn to_luminance_stack(raw: &[u8], shape: &[usize]) -> AppResult<Array3<f32>> {
    match shape {
        [n, h, w] => {
            let expected = n * h * w;
            if raw.len() != expected {
                return Err(IsiError::Analysis("frame dataset size mismatch".into()));
            }
            let data: Vec<f32> = raw.iter().map(|&v| v as f32).collect();
            Array3::from_shape_vec((*n, *h, *w), data)
                .map_err(|e| IsiError::Analysis(format!("frame stack shape: {e}")))
        }
        [n, h, w, c] if *c == 3 => {
            let expected = n * h * w * c;
            if raw.len() != expected {
                return Err(IsiError::Analysis("frame dataset size mismatch".into()));
            }
            let mut data = Vec::with_capacity(n * h * w);
            for px in raw.chunks_exact(3) {
                data.push(0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32);
            }
            Array3::from_shape_vec((*n, *h, *w), data)
                .map_err(|e| IsiError::Analysis(format!("frame stack shape: {e}")))
        }
        other => Err(IsiError::Analysis(format!(
            "unsupported frame dataset shape: {other:?}"
        ))),
    }
}

// =============================================================================
// Persistence
// =============================================================================

/// Write the single analysis HDF5 under `<session>/analysis_results/`.
pub fn save_results(results: &AnalysisResults) -> AppResult<PathBuf> {
    let out_dir = results.session_path.join(session::ANALYSIS_DIR);
    std::fs::create_dir_all(&out_dir)?;
    let path = out_dir.join(session::ANALYSIS_RESULTS_FILE);
    let file = hdf5::File::create(&path)?;

    for (name, layer) in [
        ("azimuth_map", &results.azimuth_map),
        ("elevation_map", &results.elevation_map),
        ("sign_map", &results.sign_map),
        ("area_map", &results.area_map),
        ("boundary_map", &results.boundary_map),
    ] {
        file.new_dataset_builder().with_data(layer).create(name)?;
    }

    let phase_group = file.create_group("phase_maps")?;
    for (direction, layer) in &results.phase_maps {
        phase_group
            .new_dataset_builder()
            .with_data(layer)
            .create(direction.as_str())?;
    }
    let magnitude_group = file.create_group("magnitude_maps")?;
    for (direction, layer) in &results.magnitude_maps {
        magnitude_group
            .new_dataset_builder()
            .with_data(layer)
            .create(direction.as_str())?;
    }

    file.new_attr::<u32>()
        .create("num_areas")?
        .write_scalar(&results.num_areas)?;

    info!(path = %path.display(), "analysis results written");
    Ok(path)
}
