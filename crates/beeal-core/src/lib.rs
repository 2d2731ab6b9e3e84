//! # BeeAL Core
//!
//! Shared types for the honeybee antennal lobe simulator.
//!
//! The antennal lobe model is organized into glomeruli, each holding a set
//! of olfactory receptor neurons (ORN), projection neurons (PN) and
//! homogeneous local interneurons (hLN), with a small downstream population
//! of lateral horn interneurons (LHI). This crate carries the pieces every
//! layer needs: the error type, unit aliases, the voltage-dependent rate
//! functions of the conductance-based neurons, and simple containers for
//! recorded output.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum BeealError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Simulation error: {0}")]
    SimulationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Numerical error: {0}")]
    NumericalError(String),
}

pub type Result<T> = std::result::Result<T, BeealError>;

/// Time point (ms)
pub type Time = f64;

/// Voltage (mV)
pub type Voltage = f64;

/// Current (nA)
pub type Current = f64;

/// Conductance (uS)
pub type Conductance = f64;

/// State vector for per-population quantities
pub type StateVector = Array1<f64>;

/// Global simulation time step in ms. All rate constants in the model are
/// calibrated against this value.
pub const DT: Time = 0.01;

/// Number of Euler sub-steps per outer time step.
pub const SUBSTEPS: usize = 5;

/// How a population's per-unit update loop is executed.
///
/// The numeric integration is an order-free map over independent units, so
/// the same kernel can run as a plain loop or as a rayon parallel iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecMode {
    Serial,
    Parallel,
}

impl Default for ExecMode {
    fn default() -> Self {
        ExecMode::Serial
    }
}

/// Simulation run parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Time step (ms)
    pub dt: Time,
    /// Interval between diagnostic output lines (ms)
    pub write_interval: Time,
    /// Master RNG seed
    pub seed: u64,
    /// Execution backend for the population kernels
    pub exec_mode: ExecMode,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            dt: DT,
            write_interval: 0.5,
            seed: 1234,
            exec_mode: ExecMode::Serial,
        }
    }
}

/// Voltage-dependent rate function
///
/// The conductance-based neurons use the classical saturating-exponential
/// rate forms. Signs of `a` and `c` are folded in so that each of the
/// model's alpha/beta expressions is one variant instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RateFunction {
    /// Standard HH form: A*(V+B)/(exp((V+B)/C)-1)
    HodgkinHuxley { a: f64, b: f64, c: f64 },
    /// Exponential: A*exp((V+B)/C)
    Exponential { a: f64, b: f64, c: f64 },
    /// Sigmoid: A/(1+exp((V+B)/C))
    Sigmoid { a: f64, b: f64, c: f64 },
    /// Constant
    Constant(f64),
}

impl RateFunction {
    /// Evaluate rate at given voltage.
    pub fn eval(&self, v: Voltage) -> f64 {
        match self {
            Self::HodgkinHuxley { a, b, c } => {
                let x = (v + b) / c;
                if x.abs() < 1e-6 {
                    // L'Hopital's rule at the singular voltage
                    a * c
                } else {
                    a * (v + b) / (x.exp() - 1.0)
                }
            }
            Self::Exponential { a, b, c } => a * ((v + b) / c).exp(),
            Self::Sigmoid { a, b, c } => a / (1.0 + ((v + b) / c).exp()),
            Self::Constant(k) => *k,
        }
    }
}

/// Recorded spike events: `(time, global unit index)` pairs in emission
/// order. Global indices are offset per population, ORN < PN < hLN < LHI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpikeLog {
    pub times: Vec<Time>,
    pub units: Vec<usize>,
}

impl SpikeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, t: Time, unit: usize) {
        self.times.push(t);
        self.units.push(unit);
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Number of spikes with `lo <= t < hi` from units in `units`.
    pub fn count_in(&self, lo: Time, hi: Time, units: std::ops::Range<usize>) -> usize {
        self.times
            .iter()
            .zip(self.units.iter())
            .filter(|(&t, &u)| t >= lo && t < hi && units.contains(&u))
            .count()
    }
}

/// Diagnostic trace: one row of sampled scalars per output interval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticTrace {
    pub time: Vec<Time>,
    pub rows: Vec<Vec<f64>>,
}

impl DiagnosticTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, t: Time, row: Vec<f64>) {
        self.time.push(t);
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}
