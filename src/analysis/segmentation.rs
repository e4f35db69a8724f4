//! Visual-area segmentation from the sign map.
//!
//! The boundary map marks sign transitions between 4-neighbors; area
//! labeling flood-fills same-sign regions, discards components below the
//! configured minimum pixel count, and relabels the survivors compactly
//! so `num_areas == max(area_map)`.

use ndarray::Array2;
use std::collections::VecDeque;

/// 1.0 wherever a pixel's sign differs from any 4-neighbor, 0.0 elsewhere.
/// Zero-valued (masked) pixels never mark boundaries themselves.
pub fn boundary_map(sign: &Array2<f32>) -> Array2<f32> {
    let (height, width) = sign.dim();
    let mut boundary = Array2::zeros((height, width));
    for r in 0..height {
        for c in 0..width {
            let here = sign[[r, c]];
            if here == 0.0 {
                continue;
            }
            let mut edge = false;
            if r + 1 < height && sign[[r + 1, c]] != here {
                edge = true;
            }
            if c + 1 < width && sign[[r, c + 1]] != here {
                edge = true;
            }
            if r > 0 && sign[[r - 1, c]] != here {
                edge = true;
            }
            if c > 0 && sign[[r, c - 1]] != here {
                edge = true;
            }
            if edge {
                boundary[[r, c]] = 1.0;
            }
        }
    }
    boundary
}

/// Connected-component labeling of the sign map (4-connectivity, same
/// sign). Components smaller than `min_size` pixels are discarded.
/// Returns `(area_map, num_areas)` with labels `1..=num_areas` and `0`
/// for background.
pub fn label_areas(sign: &Array2<f32>, min_size: usize) -> (Array2<f32>, u32) {
    let (height, width) = sign.dim();
    let mut labels: Array2<i32> = Array2::from_elem((height, width), -1);
    let mut components: Vec<Vec<(usize, usize)>> = Vec::new();

    for r in 0..height {
        for c in 0..width {
            if labels[[r, c]] != -1 || sign[[r, c]] == 0.0 {
                continue;
            }
            let target = sign[[r, c]];
            let id = components.len() as i32;
            let mut pixels = Vec::new();
            let mut queue = VecDeque::from([(r, c)]);
            labels[[r, c]] = id;
            while let Some((pr, pc)) = queue.pop_front() {
                pixels.push((pr, pc));
                let mut visit = |nr: usize, nc: usize| {
                    if labels[[nr, nc]] == -1 && sign[[nr, nc]] == target {
                        labels[[nr, nc]] = id;
                        queue.push_back((nr, nc));
                    }
                };
                if pr > 0 {
                    visit(pr - 1, pc);
                }
                if pr + 1 < height {
                    visit(pr + 1, pc);
                }
                if pc > 0 {
                    visit(pr, pc - 1);
                }
                if pc + 1 < width {
                    visit(pr, pc + 1);
                }
            }
            components.push(pixels);
        }
    }

    // Compact relabeling of the survivors, in discovery order.
    let mut area_map = Array2::zeros((height, width));
    let mut next_label = 0u32;
    for pixels in components {
        if pixels.len() < min_size {
            continue;
        }
        next_label += 1;
        for (r, c) in pixels {
            area_map[[r, c]] = next_label as f32;
        }
    }
    (area_map, next_label)
}
