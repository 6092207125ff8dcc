//! Kubernetes memory quantities and the memory-limit sizing policy.

use regex::Regex;
use remediator_config::MemoryPolicyConfig;
use std::sync::LazyLock;

use super::ToolError;

const MI: u64 = 1024 * 1024;

static QUANTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+(?:\.[0-9]+)?)([a-zA-Z]*)$").unwrap());

fn unit_multiplier(unit: &str) -> Option<u64> {
    let m = match unit {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => return None,
    };
    Some(m)
}

/// Parse a memory quantity (`512Mi`, `1.5G`, `1048576`) into bytes.
///
/// Binary and decimal suffixes are accepted. CPU-style `m` and anything
/// else is rejected as `invalid_quantity`.
pub fn parse_bytes(quantity: &str) -> Result<u64, ToolError> {
    let q = quantity.trim();
    let invalid = || ToolError::InvalidQuantity(quantity.to_string());

    let caps = QUANTITY.captures(q).ok_or_else(invalid)?;
    let number: f64 = caps[1].parse().map_err(|_| invalid())?;
    let multiplier = unit_multiplier(&caps[2]).ok_or_else(invalid)?;

    Ok((number * multiplier as f64) as u64)
}

/// Outcome of sizing a memory limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemorySizing {
    /// Current limit already meets or exceeds the ceiling
    AtCeiling,
    Resize { new_limit: String },
}

/// Floor / multiplier / ceiling policy for `increase_memory_limit`.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPolicy {
    floor: u64,
    multiplier: f64,
    ceiling: u64,
}

impl MemoryPolicy {
    pub fn new(floor: u64, multiplier: f64, ceiling: u64) -> Result<Self, ToolError> {
        if ceiling < MI {
            return Err(ToolError::InvalidPolicy(format!(
                "memory ceiling {ceiling} is below 1Mi"
            )));
        }
        if floor > ceiling {
            return Err(ToolError::InvalidPolicy(format!(
                "memory floor {floor} exceeds ceiling {ceiling}"
            )));
        }
        if !(multiplier > 1.0 && multiplier.is_finite()) {
            return Err(ToolError::InvalidPolicy(format!(
                "memory multiplier must be above 1.0, got {multiplier}"
            )));
        }
        Ok(Self {
            floor,
            multiplier,
            ceiling,
        })
    }

    pub fn from_config(config: &MemoryPolicyConfig) -> Result<Self, ToolError> {
        Self::new(
            parse_bytes(&config.floor)?,
            config.multiplier,
            parse_bytes(&config.ceiling)?,
        )
    }

    /// Compute the next limit for a container currently limited to `current`.
    ///
    /// The target is rounded up to whole mebibytes, then capped at the
    /// ceiling rounded down to whole mebibytes, so it never exceeds the
    /// ceiling.
    pub fn size(&self, current: &str) -> Result<MemorySizing, ToolError> {
        let current = parse_bytes(current)?;
        if current >= self.ceiling {
            return Ok(MemorySizing::AtCeiling);
        }
        let target = if current < self.floor {
            self.floor
        } else {
            (current as f64 * self.multiplier) as u64
        };
        let new_mi = target.div_ceil(MI).min(self.ceiling / MI);
        if new_mi * MI <= current {
            return Ok(MemorySizing::AtCeiling);
        }
        Ok(MemorySizing::Resize {
            new_limit: format!("{new_mi}Mi"),
        })
    }
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            floor: 256 * MI,
            multiplier: 2.0,
            ceiling: 4 * 1024 * MI,
        }
    }
}
