use crate::{CoreError, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

const KIB: i64 = 1024;
const MIB: i64 = 1024 * KIB;
const GIB: i64 = 1024 * MIB;
const TIB: i64 = 1024 * GIB;

/// CPU and memory demand of a workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceQuantities {
    /// CPU in millicores (1000 = 1 core)
    pub cpu_millicores: i64,
    /// Memory in bytes
    pub memory_bytes: i64,
}

impl ResourceQuantities {
    /// Parse CPU string (e.g., "2", "1000m", "0.5")
    pub fn parse_cpu(s: &str) -> Result<i64> {
        if let Some(m) = s.strip_suffix('m') {
            m.parse::<i64>()
                .map_err(|e| CoreError::invalid_quantity(s, e.to_string()))
        } else if let Ok(cores) = s.parse::<f64>() {
            Ok((cores * 1000.0) as i64)
        } else {
            Err(CoreError::invalid_quantity(s, "not a CPU amount"))
        }
    }

    /// Parse a byte quantity ("128Mi", "10Gi", "2G", "1024")
    pub fn parse_bytes(s: &str) -> Result<i64> {
        let (digits, multiplier) = [
            ("Ki", KIB),
            ("Mi", MIB),
            ("Gi", GIB),
            ("Ti", TIB),
            ("k", 1_000),
            ("M", 1_000_000),
            ("G", 1_000_000_000),
            ("T", 1_000_000_000_000),
        ]
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|d| (d, *mult)))
        .unwrap_or((s, 1));

        let value = digits
            .parse::<i64>()
            .map_err(|e| CoreError::invalid_quantity(s, e.to_string()))?;

        value
            .checked_mul(multiplier)
            .filter(|v| *v >= 0)
            .ok_or_else(|| CoreError::invalid_quantity(s, "out of range"))
    }

    /// Read "cpu" and "memory" out of a container resource map. Missing
    /// entries count as zero.
    pub fn from_resource_map(resources: &BTreeMap<String, Quantity>) -> Result<Self> {
        let cpu_millicores = match resources.get("cpu") {
            Some(q) => Self::parse_cpu(&q.0)?,
            None => 0,
        };
        let memory_bytes = match resources.get("memory") {
            Some(q) => Self::parse_bytes(&q.0)?,
            None => 0,
        };

        Ok(Self {
            cpu_millicores,
            memory_bytes,
        })
    }

    /// Format bytes with the largest binary suffix that divides evenly
    pub fn format_bytes(bytes: i64) -> String {
        if bytes > 0 && bytes % GIB == 0 {
            format!("{}Gi", bytes / GIB)
        } else if bytes > 0 && bytes % MIB == 0 {
            format!("{}Mi", bytes / MIB)
        } else if bytes > 0 && bytes % KIB == 0 {
            format!("{}Ki", bytes / KIB)
        } else {
            bytes.to_string()
        }
    }
}

impl std::ops::Add for ResourceQuantities {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            cpu_millicores: self.cpu_millicores.saturating_add(rhs.cpu_millicores),
            memory_bytes: self.memory_bytes.saturating_add(rhs.memory_bytes),
        }
    }
}
