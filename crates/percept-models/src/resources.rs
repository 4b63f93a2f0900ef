//! Device resource state polled once per frame cycle.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Memory pressure level reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl MemoryPressure {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryPressure::Normal => "normal",
            MemoryPressure::Warning => "warning",
            MemoryPressure::Critical => "critical",
        }
    }
}

impl fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MemoryPressure {
    type Err = ResourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(MemoryPressure::Normal),
            "warning" | "warn" => Ok(MemoryPressure::Warning),
            "critical" => Ok(MemoryPressure::Critical),
            _ => Err(ResourceParseError::MemoryPressure(s.to_string())),
        }
    }
}

/// Thermal state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    #[default]
    Nominal,
    Fair,
    Serious,
    Critical,
}

impl ThermalState {
    /// All states, coolest first.
    pub const ALL: &'static [ThermalState] = &[
        ThermalState::Nominal,
        ThermalState::Fair,
        ThermalState::Serious,
        ThermalState::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThermalState::Nominal => "nominal",
            ThermalState::Fair => "fair",
            ThermalState::Serious => "serious",
            ThermalState::Critical => "critical",
        }
    }
}

impl fmt::Display for ThermalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ThermalState {
    type Err = ResourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nominal" => Ok(ThermalState::Nominal),
            "fair" => Ok(ThermalState::Fair),
            "serious" => Ok(ThermalState::Serious),
            "critical" => Ok(ThermalState::Critical),
            _ => Err(ResourceParseError::ThermalState(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResourceParseError {
    #[error("Unknown memory pressure: {0}")]
    MemoryPressure(String),

    #[error("Unknown thermal state: {0}")]
    ThermalState(String),
}

/// Snapshot of device resources.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    /// CPU usage as a fraction (0.0-1.0)
    pub cpu_usage: f64,
    pub memory_pressure: MemoryPressure,
    pub thermal_state: ThermalState,
}

impl ResourceState {
    /// Resources with no pressure at all.
    pub fn nominal() -> Self {
        Self::default()
    }

    pub fn with_cpu(mut self, cpu_usage: f64) -> Self {
        self.cpu_usage = cpu_usage;
        self
    }

    pub fn with_memory(mut self, memory_pressure: MemoryPressure) -> Self {
        self.memory_pressure = memory_pressure;
        self
    }

    pub fn with_thermal(mut self, thermal_state: ThermalState) -> Self {
        self.thermal_state = thermal_state;
        self
    }

    /// CPU usage as a fraction, accepting either 0-1 or 0-100 input.
    pub fn cpu_fraction(&self) -> f64 {
        if !self.cpu_usage.is_finite() || self.cpu_usage <= 0.0 {
            0.0
        } else if self.cpu_usage > 1.0 {
            (self.cpu_usage / 100.0).min(1.0)
        } else {
            self.cpu_usage
        }
    }

    /// True when no dimension reports pressure.
    pub fn is_nominal(&self) -> bool {
        self.cpu_fraction() <= 0.6
            && self.memory_pressure == MemoryPressure::Normal
            && self.thermal_state == ThermalState::Nominal
    }
}
