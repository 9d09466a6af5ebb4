//! META_MATH module
//!
//! Byte statistics over the object buffer: Shannon entropy (0.0 - 8.0) and
//! arithmetic mean. High entropy on an unrecognized buffer is a classic
//! packer/ciphertext signal, so the module optionally raises a flag above a
//! configurable threshold (`entropy_flag_above=7.5`).

use crate::error::{ModuleError, ModuleResult};
use crate::metadata::MetaValue;
use crate::module::{ModuleContext, ModuleOutput, ScanModule};
use crate::object::ScanObject;

/// Byte statistics module
pub struct MetaMath;

impl ScanModule for MetaMath {
    fn name(&self) -> &'static str {
        "META_MATH"
    }

    fn scan(&self, object: &ScanObject, ctx: &ModuleContext<'_>) -> ModuleResult<ModuleOutput> {
        let data = object.buffer();

        let mut output = ModuleOutput::new();
        let entropy = entropy(data);
        output.add_metadata("entropy", MetaValue::Float(entropy));
        output.add_metadata("mean", MetaValue::Float(mean(data)));

        if let Some(threshold) = ctx.options.get("entropy_flag_above") {
            let threshold: f64 = threshold.parse().map_err(|_| {
                ModuleError::InvalidOptions(format!(
                    "entropy_flag_above is not a number: {}",
                    threshold
                ))
            })?;
            if entropy > threshold {
                output.add_flag("MATH:HIGH_ENTROPY");
            }
        }

        Ok(output)
    }
}

/// Shannon entropy of a buffer, 0.0 for empty input
pub fn entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut counts = [0u64; 256];
    for byte in data {
        counts[*byte as usize] += 1;
    }

    let len = data.len() as f64;
    let mut entropy = 0.0;
    for &count in &counts {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }
    entropy
}

/// Arithmetic mean of byte values, 0.0 for empty input
pub fn mean(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let sum: u64 = data.iter().map(|&b| b as u64).sum();
    sum as f64 / data.len() as f64
}
