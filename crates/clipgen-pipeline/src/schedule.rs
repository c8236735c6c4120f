//! Sampling schedules.

/// Noise level reached at the end of the linear segment.
pub const DEFAULT_THRESHOLD_NOISE: f32 = 0.025;

/// `steps + 1` sigmas falling from 1.0 to 0.0: linear for the first
/// `linear_steps` steps (down to `1 - threshold_noise`), then quadratic.
///
/// `linear_steps` defaults to `steps / 2`.
pub fn linear_quadratic_schedule(
    steps: usize,
    threshold_noise: f32,
    linear_steps: Option<usize>,
) -> Vec<f32> {
    if steps == 0 {
        return vec![1.0];
    }
    let linear_steps = linear_steps.unwrap_or(steps / 2).min(steps);
    if linear_steps == 0 || linear_steps == steps {
        // One segment only: spread evenly.
        return (0..=steps).map(|i| 1.0 - i as f32 / steps as f32).collect();
    }

    let (n, l, thr) = (steps as f64, linear_steps as f64, f64::from(threshold_noise));
    let q = n - l;
    let step_diff = l - thr * n;
    let quad_coef = step_diff / (l * q * q);
    let lin_coef = thr / l - 2.0 * step_diff / (q * q);
    let constant = quad_coef * l * l;

    let linear = (0..linear_steps).map(|i| i as f64 * thr / l);
    let quadratic = (linear_steps..steps).map(|i| {
        let i = i as f64;
        quad_coef * i * i + lin_coef * i + constant
    });

    linear
        .chain(quadratic)
        .chain(std::iter::once(1.0))
        .map(|x| (1.0 - x) as f32)
        .collect()
}

/// Guidance scale for every step.
pub fn cfg_schedule(steps: usize, guidance_scale: f32) -> Vec<f32> {
    vec![guidance_scale; steps]
}

// ── Tests ─────────────────────────────────────────────────────────────────────
