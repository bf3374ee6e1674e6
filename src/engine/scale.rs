//! Fixed-point conversion of continuous samples.

/// Largest raw value; the raw range is symmetric `[-RAW_MAX, RAW_MAX]`.
pub const RAW_MAX: f64 = 32767.0;

/// Convert one physical sample to raw units.
///
/// `raw = round(clamp(sample / (RAW_MAX * scale), -1, 1) * RAW_MAX)`, i.e. the
/// sample divided by the per-channel scale, rounded and saturated. NaN maps to 0.
#[inline]
pub fn to_fixed(sample: f32, scale: f64) -> i16 {
    let normalized = (f64::from(sample) / (RAW_MAX * scale)).clamp(-1.0, 1.0);
    (normalized * RAW_MAX).round() as i16
}

/// Recover the physical value of a raw sample.
#[inline]
pub fn from_fixed(raw: i16, scale: f64) -> f64 {
    f64::from(raw) * scale
}

/// Convert a block into `out`, replacing its contents.
pub fn scale_into(samples: &[f32], scale: f64, out: &mut Vec<i16>) {
    out.clear();
    out.extend(samples.iter().map(|&s| to_fixed(s, scale)));
}
