//! Boundary checks on raw synthesis output
//!
//! Every generation path funnels its output through [`validate`] before the
//! samples are delivered or cached.

use crate::error::ValidationError;
use crate::types::RawOutput;
use log::{debug, warn};

/// Validate and sanitize raw backend output
///
/// Scalars, missing output and sequences with fewer than two elements are
/// rejected. Accepted output is flattened to one dimension with NaN replaced
/// by `0.0` and infinities clamped to `±1.0`.
pub fn validate(raw: RawOutput, segment_index: usize) -> Result<Vec<f32>, ValidationError> {
    let flat: Vec<f32> = match raw {
        RawOutput::Scalar(value) => {
            warn!(
                "segment {}: backend returned scalar {} instead of samples",
                segment_index, value
            );
            return Err(ValidationError::Scalar(value));
        }
        RawOutput::Missing => {
            warn!("segment {}: backend returned no output", segment_index);
            return Err(ValidationError::Missing);
        }
        RawOutput::Flat(samples) => samples,
        RawOutput::Nested(rows) => rows.into_iter().flatten().collect(),
        RawOutput::Wide(samples) => samples.into_iter().map(|s| s as f32).collect(),
    };

    if flat.len() <= 1 {
        warn!(
            "segment {}: backend returned {} element(s)",
            segment_index,
            flat.len()
        );
        return Err(ValidationError::TooShort(flat.len()));
    }

    let mut repaired = 0usize;
    let sanitized: Vec<f32> = flat
        .into_iter()
        .map(|sample| {
            if sample.is_finite() {
                sample
            } else {
                repaired += 1;
                sanitize(sample)
            }
        })
        .collect();

    if repaired > 0 {
        debug!(
            "segment {}: repaired {} non-finite sample(s) of {}",
            segment_index,
            repaired,
            sanitized.len()
        );
    }

    Ok(sanitized)
}

fn sanitize(sample: f32) -> f32 {
    if sample.is_nan() {
        0.0
    } else if sample.is_sign_positive() {
        1.0
    } else {
        -1.0
    }
}
