//! # BeeAL Sim
//!
//! Simulation driver for the antennal lobe model: run configuration with a
//! named-parameter override table, odor and inhibition file readers, the
//! stimulus protocol scheduler, the reward trace, the outer step loop and
//! the two output streams (periodic diagnostic lines and the spike log).
//!
//! A run is a single-shot batch: configuration problems are fatal, there is
//! no retry or partial-failure mode. The run ends when the protocol is
//! exhausted.

use beeal_core::{DiagnosticTrace, SimulationParams, SpikeLog, Time};
use beeal_model::{AntennalLobe, ModelError, ModelParams};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("Unknown parameter name: {0}")]
    UnknownParameter(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;

// ============================================================================
// RUN CONFIGURATION
// ============================================================================

/// Reward-trace dynamics: the trace relaxes toward `base + reward_input`
/// with time constant `tau`. A negative baseline means extinction in the
/// absence of reward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RewardParams {
    pub base: f64,
    pub tau: f64,
}

impl Default for RewardParams {
    fn default() -> Self {
        Self { base: -5.0, tau: 50.0 }
    }
}

/// Everything a run needs beyond the protocol file: model and integration
/// parameters, reward dynamics, and the locations of the odor and
/// inhibition data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelParams,
    pub sim: SimulationParams,
    pub reward: RewardParams,
    /// Number of odor files to load
    pub n_odor: usize,
    /// Directory holding `odor<i><extension>` files
    pub odor_path: PathBuf,
    pub odor_extension: String,
    /// hLN->PN scale-factor table, `n_glo x n_glo` whitespace floats
    pub inhibition_file: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: ModelParams::default(),
            sim: SimulationParams::default(),
            reward: RewardParams::default(),
            n_odor: 17,
            odor_path: PathBuf::from("odors"),
            odor_extension: String::from(".para"),
            inhibition_file: PathBuf::from("inhibition.dat"),
        }
    }
}

fn parse_value<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| SimError::Parse {
        file: String::from("parameter table"),
        message: format!("bad value '{}' for {}", value, name),
    })
}

impl RunConfig {
    /// Set one named parameter from its text value. Names are dotted field
    /// paths into the configuration. Unknown names are fatal.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "sim.dt" => self.sim.dt = parse_value(name, value)?,
            "sim.write_interval" => self.sim.write_interval = parse_value(name, value)?,
            "sim.seed" => self.sim.seed = parse_value(name, value)?,

            "reward.base" => self.reward.base = parse_value(name, value)?,
            "reward.tau" => self.reward.tau = parse_value(name, value)?,

            "n_odor" => self.n_odor = parse_value(name, value)?,
            "odor_path" => self.odor_path = PathBuf::from(value),
            "odor_extension" => self.odor_extension = String::from(value),
            "inhibition_file" => self.inhibition_file = PathBuf::from(value),

            "topology.n_glo" => self.model.topology.n_glo = parse_value(name, value)?,
            "topology.n_orn" => self.model.topology.n_orn = parse_value(name, value)?,
            "topology.n_pn" => self.model.topology.n_pn = parse_value(name, value)?,
            "topology.n_hln" => self.model.topology.n_hln = parse_value(name, value)?,
            "topology.n_lhi" => self.model.topology.n_lhi = parse_value(name, value)?,

            "orn.tspike" => self.model.orn.tspike = parse_value(name, value)?,
            "orn.trefract" => self.model.orn.trefract = parse_value(name, value)?,
            "orn.v_rest" => self.model.orn.v_rest = parse_value(name, value)?,
            "orn.v_spike" => self.model.orn.v_spike = parse_value(name, value)?,
            "orn.brate" => self.model.orn.brate = parse_value(name, value)?,
            "orn.randfac" => self.model.orn.randfac = parse_value(name, value)?,
            "orn.adrate" => self.model.orn.adrate = parse_value(name, value)?,
            "orn.recrate" => self.model.orn.recrate = parse_value(name, value)?,

            "orn_pn1.gmax" => self.model.orn_pn1.gmax = parse_value(name, value)?,
            "orn_pn1.g_lambda" => self.model.orn_pn1.g_lambda = parse_value(name, value)?,
            "orn_pn1.gmid" => self.model.orn_pn1.gmid = parse_value(name, value)?,
            "orn_pn1.gslope" => self.model.orn_pn1.gslope = parse_value(name, value)?,
            "orn_pn1.pbase" => self.model.orn_pn1.pbase = parse_value(name, value)?,
            "orn_pn1.p_lambda" => self.model.orn_pn1.p_lambda = parse_value(name, value)?,
            "orn_pn1.a" => self.model.orn_pn1.a = parse_value(name, value)?,
            "orn_pn1.tau_p" => self.model.orn_pn1.tau_p = parse_value(name, value)?,
            "orn_pn1.tau_m" => self.model.orn_pn1.tau_m = parse_value(name, value)?,
            "orn_pn1.g0" => self.model.orn_pn1.g0 = parse_value(name, value)?,
            "orn_pn1.gjitter" => self.model.orn_pn1.gjitter = parse_value(name, value)?,
            "orn_pn1.erev" => self.model.orn_pn1.erev = parse_value(name, value)?,
            "orn_pn1.beta" => self.model.orn_pn1.beta = parse_value(name, value)?,

            _ => {
                // neuron and static-synapse fields share their layout, so
                // resolve them through two generic helpers
                if !self.set_neuron_field(name, value)? && !self.set_synapse_field(name, value)? {
                    return Err(SimError::UnknownParameter(String::from(name)));
                }
            }
        }
        Ok(())
    }

    fn set_neuron_field(&mut self, name: &str, value: &str) -> Result<bool> {
        let Some((pop, field)) = name.split_once('.') else {
            return Ok(false);
        };
        let target = match pop {
            "pn" => &mut self.model.pn,
            "hln" => &mut self.model.hln,
            "lhi" => &mut self.model.lhi,
            _ => return Ok(false),
        };
        match field {
            "g_na" => target.g_na = parse_value(name, value)?,
            "e_na" => target.e_na = parse_value(name, value)?,
            "g_k" => target.g_k = parse_value(name, value)?,
            "e_k" => target.e_k = parse_value(name, value)?,
            "g_l" => target.g_l = parse_value(name, value)?,
            "e_l" => target.e_l = parse_value(name, value)?,
            "c" => target.c = parse_value(name, value)?,
            "g_m" => target.g_m = parse_value(name, value)?,
            "k_m_alpha" => target.k_m_alpha = parse_value(name, value)?,
            "k_m_beta" => target.k_m_beta = parse_value(name, value)?,
            "i0" => target.i0 = parse_value(name, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn set_synapse_field(&mut self, name: &str, value: &str) -> Result<bool> {
        let Some((proj, field)) = name.split_once('.') else {
            return Ok(false);
        };
        let target = match proj {
            "orn_pn" => &mut self.model.orn_pn,
            "orn_hln" => &mut self.model.orn_hln,
            "pn_hln" => &mut self.model.pn_hln,
            "pn_lhi" => &mut self.model.pn_lhi,
            "hln_pn" => &mut self.model.hln_pn,
            "hln_hln" => &mut self.model.hln_hln,
            _ => return Ok(false),
        };
        match field {
            "g0" => target.g0 = parse_value(name, value)?,
            "gjitter" => target.gjitter = parse_value(name, value)?,
            "erev" => target.erev = parse_value(name, value)?,
            "beta" => target.beta = parse_value(name, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Apply a whitespace-separated `<name> <value>` override table.
    pub fn apply_overrides(&mut self, text: &str) -> Result<()> {
        let mut tokens = text.split_whitespace();
        while let Some(name) = tokens.next() {
            let value = tokens.next().ok_or_else(|| SimError::Parse {
                file: String::from("parameter table"),
                message: format!("missing value for {}", name),
            })?;
            self.set(name, value)?;
        }
        Ok(())
    }

    /// Load and apply an override file. A missing file is fatal.
    pub fn apply_override_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|e| SimError::Parse {
            file: path.display().to_string(),
            message: e.to_string(),
        })?;
        self.apply_overrides(&text)
    }

    /// Full effective configuration as JSON, for archiving a run's exact
    /// settings next to its output.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// DATA FILE READERS
// ============================================================================

/// Parse one odor profile: `n_glo` rows x 5 receptor-kinetics columns.
/// Trailing extra values in hand-edited data files are tolerated.
pub fn parse_odor(text: &str, n_glo: usize, file: &str) -> Result<Array2<f64>> {
    let values: std::result::Result<Vec<f64>, _> =
        text.split_whitespace().map(str::parse).collect();
    let mut values = values.map_err(|e| SimError::Parse {
        file: String::from(file),
        message: format!("bad float: {}", e),
    })?;
    if values.len() < n_glo * 5 {
        return Err(SimError::Parse {
            file: String::from(file),
            message: format!("expected {} values, found {}", n_glo * 5, values.len()),
        });
    }
    values.truncate(n_glo * 5);
    Array2::from_shape_vec((n_glo, 5), values).map_err(|e| SimError::Parse {
        file: String::from(file),
        message: e.to_string(),
    })
}

/// Parse the hLN->PN inhibition scale table: `n_glo x n_glo` floats in
/// row-major glomerulus order.
pub fn parse_inhibition(text: &str, n_glo: usize, file: &str) -> Result<Array2<f64>> {
    let values: std::result::Result<Vec<f64>, _> =
        text.split_whitespace().map(str::parse).collect();
    let mut values = values.map_err(|e| SimError::Parse {
        file: String::from(file),
        message: format!("bad float: {}", e),
    })?;
    if values.len() < n_glo * n_glo {
        return Err(SimError::Parse {
            file: String::from(file),
            message: format!("expected {} values, found {}", n_glo * n_glo, values.len()),
        });
    }
    values.truncate(n_glo * n_glo);
    Array2::from_shape_vec((n_glo, n_glo), values).map_err(|e| SimError::Parse {
        file: String::from(file),
        message: e.to_string(),
    })
}

/// Load all odor files `odor0<ext> .. odor<n-1><ext>` from a directory.
pub fn load_odors(config: &RunConfig) -> Result<Vec<Array2<f64>>> {
    let mut odors = Vec::with_capacity(config.n_odor);
    for i in 0..config.n_odor {
        let name = format!("odor{}{}", i, config.odor_extension);
        let path = config.odor_path.join(&name);
        let text = fs::read_to_string(&path).map_err(|e| SimError::Parse {
            file: path.display().to_string(),
            message: e.to_string(),
        })?;
        odors.push(parse_odor(&text, config.model.topology.n_glo, &name)?);
    }
    Ok(odors)
}

pub fn load_inhibition(config: &RunConfig) -> Result<Array2<f64>> {
    let path = &config.inhibition_file;
    let text = fs::read_to_string(path).map_err(|e| SimError::Parse {
        file: path.display().to_string(),
        message: e.to_string(),
    })?;
    parse_inhibition(&text, config.model.topology.n_glo, &path.display().to_string())
}

// ============================================================================
// STIMULUS PROTOCOL
// ============================================================================

/// One scheduled stimulus action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ProtocolAction {
    /// Switch an odor on or off in one of the two slots. `log_conc` is the
    /// base-10 logarithm of the concentration.
    Odor {
        slot: usize,
        odor: usize,
        log_conc: f64,
        on: bool,
    },
    /// Set the reward input of the reward trace.
    Reward(f64),
    /// Set the direct injected current of one LHI.
    DirectInput { id: usize, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProtocolItem {
    pub t: Time,
    pub action: ProtocolAction,
}

/// Time-ordered stimulus script with a consume-once cursor.
///
/// Items must be listed in non-decreasing time order; each item fires on
/// the first step whose time is at or past its scheduled time, exactly
/// once, in file order. The run loop keeps stepping while items remain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Protocol {
    pub items: Vec<ProtocolItem>,
    cursor: usize,
}

impl Protocol {
    /// Parse a protocol script: one `<time> <action> <payload...>` item per
    /// whitespace-separated record. An unrecognized action is fatal.
    pub fn parse(text: &str) -> Result<Self> {
        fn next<'a>(
            tokens: &mut impl Iterator<Item = &'a str>,
            what: &str,
        ) -> Result<&'a str> {
            tokens
                .next()
                .ok_or_else(|| SimError::Protocol(format!("unexpected end of input, expected {}", what)))
        }
        fn num<T: std::str::FromStr>(tok: &str, what: &str) -> Result<T> {
            tok.parse()
                .map_err(|_| SimError::Protocol(format!("bad {} '{}'", what, tok)))
        }

        let mut items = Vec::new();
        let mut tokens = text.split_whitespace();
        while let Some(t_tok) = tokens.next() {
            let t: f64 = num(t_tok, "time")?;
            let action = next(&mut tokens, "action")?;
            let action = match action {
                "odor" => ProtocolAction::Odor {
                    slot: num(next(&mut tokens, "slot")?, "slot")?,
                    odor: num(next(&mut tokens, "odor id")?, "odor id")?,
                    log_conc: num(next(&mut tokens, "concentration")?, "concentration")?,
                    on: num::<i32>(next(&mut tokens, "on/off flag")?, "on/off flag")? == 1,
                },
                "reward" => {
                    ProtocolAction::Reward(num(next(&mut tokens, "reward value")?, "reward value")?)
                }
                "input" => ProtocolAction::DirectInput {
                    id: num(next(&mut tokens, "neuron id")?, "neuron id")?,
                    value: num(next(&mut tokens, "input value")?, "input value")?,
                },
                other => {
                    return Err(SimError::Protocol(format!("unrecognized action '{}'", other)))
                }
            };
            items.push(ProtocolItem { t, action });
        }
        Ok(Self { items, cursor: 0 })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| SimError::Parse {
            file: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&text)
    }

    /// Next item due at or before `t`, advancing the cursor past it.
    pub fn pop_due(&mut self, t: Time) -> Option<ProtocolItem> {
        let item = self.items.get(self.cursor)?;
        if t >= item.t {
            self.cursor += 1;
            Some(*item)
        } else {
            None
        }
    }

    /// Whether unconsumed items remain. The run ends when this is false.
    pub fn has_pending(&self) -> bool {
        self.cursor < self.items.len()
    }
}

// ============================================================================
// REWARD TRACE
// ============================================================================

/// The scalar reward trace gating the plastic ORN->PN projection.
///
/// Relaxes exponentially toward `base + input` with time constant `tau`;
/// protocol reward events move `input` instantly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RewardTrace {
    pub value: f64,
    pub input: f64,
    params: RewardParams,
}

impl RewardTrace {
    pub fn new(params: RewardParams) -> Self {
        Self {
            value: params.base,
            input: 0.0,
            params,
        }
    }

    pub fn set_input(&mut self, reward: f64) {
        self.input = reward;
    }

    pub fn step(&mut self, dt: Time) {
        self.value += (self.params.base + self.input - self.value) / self.params.tau * dt;
    }
}

// ============================================================================
// DIAGNOSTIC SAMPLING
// ============================================================================

/// Indices of the plastic edges sampled for the diagnostic line, in units
/// of the per-glomerulus ORN count (edge `k*n_orn` is the first edge of
/// glomerulus `k`). The selection is a fixed debug sample set.
const DIAG_EDGE_GLOS: [usize; 6] = [1, 5, 14, 2, 9, 25];

/// PN unit indices sampled for the diagnostic line.
const DIAG_PNS: [usize; 7] = [0, 1, 5, 14, 2, 9, 24];

fn sample(values: &[f64], idx: usize) -> f64 {
    values.get(idx).copied().unwrap_or(0.0)
}

/// Build one diagnostic row: the leading plastic edge, the reward trace,
/// then eligibility/conductance/raw-conductance samples over a fixed set of
/// glomeruli and a fixed set of PN voltages. Indices beyond a smaller
/// topology read as zero.
pub fn diagnostic_row(al: &AntennalLobe, reward_value: f64) -> Vec<f64> {
    let n = al.topo.n_orn;
    let pn_v = al.pn.voltages();
    let proj = &al.orn_pn1;
    let mut row = Vec::with_capacity(3 + DIAG_EDGE_GLOS.len() * 3 + DIAG_PNS.len());
    row.push(sample(&proj.p, 0));
    row.push(sample(&proj.g, 0));
    row.push(reward_value);
    let (first, second) = DIAG_EDGE_GLOS.split_at(3);
    let (pn_first, pn_second) = DIAG_PNS.split_at(4);
    for &k in first {
        row.push(sample(&proj.p, k * n));
    }
    for &k in first {
        row.push(sample(&proj.g, k * n));
    }
    for &k in first {
        row.push(sample(&proj.graw, k * n));
    }
    for &i in pn_first {
        row.push(sample(&pn_v, i));
    }
    for &k in second {
        row.push(sample(&proj.p, k * n));
    }
    for &k in second {
        row.push(sample(&proj.g, k * n));
    }
    for &k in second {
        row.push(sample(&proj.graw, k * n));
    }
    for &i in pn_second {
        row.push(sample(&pn_v, i));
    }
    row
}

// ============================================================================
// SIMULATION DRIVER
// ============================================================================

/// The outer simulation loop: owns the network, the protocol cursor, the
/// reward trace and the recorded output.
pub struct Simulation {
    pub al: AntennalLobe,
    pub protocol: Protocol,
    pub reward: RewardTrace,
    odors: Vec<Array2<f64>>,
    pub sim: SimulationParams,
    pub spikes: SpikeLog,
    pub diagnostics: DiagnosticTrace,
    t: Time,
    step_count: u64,
    write_every: u64,
}

impl Simulation {
    /// Assemble a run from an already-built configuration, odor set and
    /// protocol. Reads no files; [`Simulation::from_config`] does the file
    /// loading.
    pub fn new(
        config: &RunConfig,
        odors: Vec<Array2<f64>>,
        inhibition: Array2<f64>,
        protocol: Protocol,
    ) -> Result<Self> {
        let mut al = AntennalLobe::new(&config.model, inhibition.view(), &config.sim)?;
        al.enable();
        let write_every = (config.sim.write_interval / config.sim.dt).round().max(1.0) as u64;
        Ok(Self {
            al,
            protocol,
            reward: RewardTrace::new(config.reward),
            odors,
            sim: config.sim.clone(),
            spikes: SpikeLog::new(),
            diagnostics: DiagnosticTrace::new(),
            t: 0.0,
            step_count: 0,
            write_every,
        })
    }

    /// Load odors, the inhibition table and the protocol file, then build
    /// the run.
    pub fn from_config(config: &RunConfig, protocol_path: &Path) -> Result<Self> {
        let odors = load_odors(config)?;
        let inhibition = load_inhibition(config)?;
        let protocol = Protocol::load(protocol_path)?;
        Self::new(config, odors, inhibition, protocol)
    }

    pub fn t(&self) -> Time {
        self.t
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    fn apply(&mut self, item: ProtocolItem) -> Result<()> {
        match item.action {
            ProtocolAction::Odor {
                slot,
                odor,
                log_conc,
                on,
            } => {
                if on {
                    let profile = self.odors.get(odor).ok_or_else(|| {
                        SimError::Protocol(format!("odor id {} out of range", odor))
                    })?;
                    self.al
                        .set_odor(profile.view(), slot, 10f64.powf(log_conc))?;
                } else {
                    self.al.clear_odor(slot)?;
                }
            }
            ProtocolAction::Reward(v) => self.reward.set_input(v),
            ProtocolAction::DirectInput { id, value } => self.al.set_direct_input(id, value)?,
        }
        Ok(())
    }

    /// Advance the run by one outer time step: fire due protocol items,
    /// relax the reward trace, step the network, record spikes with their
    /// global population offsets, and emit a diagnostic row on the write
    /// interval.
    pub fn step(&mut self) -> Result<()> {
        while let Some(item) = self.protocol.pop_due(self.t) {
            self.apply(item)?;
        }
        let dt = self.sim.dt;
        self.reward.step(dt);
        self.al.step(self.reward.value, self.t, dt)?;

        let topo = self.al.topo;
        for &i in &self.al.orn_spikes {
            self.spikes.record(self.t, i);
        }
        for &i in &self.al.pn_spikes {
            self.spikes.record(self.t, i + topo.pn_offset());
        }
        for &i in &self.al.hln_spikes {
            self.spikes.record(self.t, i + topo.hln_offset());
        }
        for &i in &self.al.lhi_spikes {
            self.spikes.record(self.t, i + topo.lhi_offset());
        }

        if self.step_count % self.write_every == 0 {
            let row = diagnostic_row(&self.al, self.reward.value);
            self.diagnostics.push(self.t, row);
        }

        self.step_count += 1;
        self.t = self.step_count as f64 * dt;
        Ok(())
    }

    /// Step until the protocol is exhausted.
    pub fn run(&mut self) -> Result<()> {
        while self.protocol.has_pending() {
            self.step()?;
        }
        Ok(())
    }
}

// ============================================================================
// OUTPUT WRITERS
// ============================================================================

/// Write the spike log as `<time> <global-unit-index>` lines.
pub fn write_spike_log<W: Write>(log: &SpikeLog, mut out: W) -> Result<()> {
    for (&t, &unit) in log.times.iter().zip(log.units.iter()) {
        writeln!(out, "{} {}", t, unit)?;
    }
    Ok(())
}

/// Write the diagnostic trace, one space-separated line per sample row,
/// time first.
pub fn write_diagnostics<W: Write>(trace: &DiagnosticTrace, mut out: W) -> Result<()> {
    for (t, row) in trace.time.iter().zip(trace.rows.iter()) {
        write!(out, "{}", t)?;
        for v in row {
            write!(out, " {}", v)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use beeal_model::Topology;

    fn small_config() -> RunConfig {
        let mut config = RunConfig::default();
        config.model.topology = Topology {
            n_glo: 3,
            n_orn: 4,
            n_pn: 3,
            n_hln: 1,
            n_lhi: 2,
        };
        config
    }

    fn uniform_odor(n_glo: usize, row: [f64; 5]) -> Array2<f64> {
        let mut a = Array2::zeros((n_glo, 5));
        for i in 0..n_glo {
            for (j, v) in row.iter().enumerate() {
                a[(i, j)] = *v;
            }
        }
        a
    }

    #[test]
    fn test_config_overrides() {
        let mut config = RunConfig::default();
        config
            .apply_overrides("orn.brate 0.01 pn.g_na 8.0 orn_pn1.gmax 1e-5 reward.tau 25 sim.seed 99")
            .unwrap();
        assert_eq!(config.model.orn.brate, 0.01);
        assert_eq!(config.model.pn.g_na, 8.0);
        assert_eq!(config.model.orn_pn1.gmax, 1e-5);
        assert_eq!(config.reward.tau, 25.0);
        assert_eq!(config.sim.seed, 99);
    }

    #[test]
    fn test_config_rejects_unknown_name() {
        let mut config = RunConfig::default();
        assert!(matches!(
            config.apply_overrides("no_such_thing 1.0"),
            Err(SimError::UnknownParameter(_))
        ));
        assert!(matches!(
            config.apply_overrides("pn.no_field 1.0"),
            Err(SimError::UnknownParameter(_))
        ));
        assert!(config.apply_overrides("dangling_name").is_err());
    }

    #[test]
    fn test_config_json_round_trip() {
        let mut config = RunConfig::default();
        config.model.orn.brate = 0.007;
        config.n_odor = 3;
        let text = config.to_json().unwrap();
        let back = RunConfig::from_json(&text).unwrap();
        assert_eq!(back.model.orn.brate, 0.007);
        assert_eq!(back.n_odor, 3);
    }

    #[test]
    fn test_parse_odor_shape() {
        let text = "0.1 0.2 0.3 0.4 0.5\n1.1 1.2 1.3 1.4 1.5\n";
        let odor = parse_odor(text, 2, "test").unwrap();
        assert_eq!(odor.dim(), (2, 5));
        assert_eq!(odor[(1, 2)], 1.3);
        assert!(parse_odor(text, 3, "test").is_err());
        assert!(parse_odor("0.1 frog", 1, "test").is_err());
    }

    #[test]
    fn test_parse_inhibition_shape() {
        let text = "1 0 0  0 1 0  0 0 1";
        let inh = parse_inhibition(text, 3, "test").unwrap();
        assert_eq!(inh.dim(), (3, 3));
        assert_eq!(inh[(1, 1)], 1.0);
        assert!(parse_inhibition("1 2 3", 3, "test").is_err());
    }

    #[test]
    fn test_protocol_parse_and_order() {
        let text = "0 odor 0 2 -1.5 1\n50 odor 0 2 -1.5 0\n60 reward 5\n70 input 1 0.02\n";
        let mut proto = Protocol::parse(text).unwrap();
        assert_eq!(proto.items.len(), 4);
        assert_eq!(
            proto.items[0].action,
            ProtocolAction::Odor {
                slot: 0,
                odor: 2,
                log_conc: -1.5,
                on: true
            }
        );
        assert_eq!(proto.items[2].action, ProtocolAction::Reward(5.0));

        // nothing due before its time, each item fires exactly once
        assert!(proto.pop_due(-1.0).is_none());
        assert!(proto.pop_due(0.0).is_some());
        assert!(proto.pop_due(0.0).is_none());
        assert!(proto.has_pending());
        assert!(proto.pop_due(65.0).is_some());
        assert!(proto.pop_due(65.0).is_some());
        assert!(proto.pop_due(65.0).is_none());
        assert!(proto.pop_due(70.0).is_some());
        assert!(!proto.has_pending());
    }

    #[test]
    fn test_protocol_rejects_bad_action() {
        assert!(matches!(
            Protocol::parse("0 explode 1 2 3"),
            Err(SimError::Protocol(_))
        ));
        assert!(Protocol::parse("0 reward").is_err());
        assert!(Protocol::parse("0 odor 0 1 x 1").is_err());
    }

    #[test]
    fn test_reward_trace_relaxation() {
        let params = RewardParams { base: -5.0, tau: 50.0 };
        let mut trace = RewardTrace::new(params);
        assert_eq!(trace.value, -5.0);
        trace.set_input(10.0);
        // approaches base + input = 5 exponentially with tau = 50 ms;
        // 300 ms is six time constants
        for _ in 0..30_000 {
            trace.step(0.01);
        }
        assert!((trace.value - 5.0).abs() < 0.05);
        // one tau after the input returns to zero the trace has covered
        // about 63% of the way back toward the baseline
        trace.set_input(0.0);
        let start = trace.value;
        for _ in 0..5000 {
            trace.step(0.01);
        }
        let expected = -5.0 + (start + 5.0) * (-1.0f64).exp();
        assert!((trace.value - expected).abs() < 0.05);
    }

    #[test]
    fn test_diagnostic_row_small_topology() {
        let config = small_config();
        let inhibition = Array2::from_elem((3, 3), 1.0);
        let al = {
            let mut al =
                AntennalLobe::new(&config.model, inhibition.view(), &config.sim).unwrap();
            al.enable();
            al
        };
        let row = diagnostic_row(&al, -5.0);
        assert_eq!(row.len(), 28);
        assert_eq!(row[2], -5.0);
        // samples beyond the small topology read as zero
        assert_eq!(*row.last().unwrap(), 0.0);
    }

    #[test]
    fn test_run_ends_on_protocol_exhaustion() {
        let config = small_config();
        let odors = vec![uniform_odor(3, [0.01, 0.1, 0.005, 0.05, 1.0])];
        let inhibition = Array2::from_elem((3, 3), 1.0);
        let protocol = Protocol::parse("0 reward 0\n5 reward 0\n").unwrap();
        let mut sim = Simulation::new(&config, odors, inhibition, protocol).unwrap();
        sim.run().unwrap();
        assert!((sim.t() - 5.01).abs() < 1e-9);
        assert!(!sim.diagnostics.is_empty());
    }

    #[test]
    fn test_odor_pulse_drives_orn_spiking() {
        let mut config = RunConfig::default();
        config.model.topology = Topology::standard();
        let n_glo = config.model.topology.n_glo;
        // fast unlock rate so the locked receptor fraction has relaxed well
        // before the late measurement window
        let odors = vec![uniform_odor(n_glo, [0.05, 0.1, 0.05, 0.05, 1.0])];
        let inhibition = Array2::from_elem((n_glo, n_glo), 1.0);
        let protocol =
            Protocol::parse("0 odor 0 0 0 1\n50 odor 0 0 0 0\n200 reward 0\n").unwrap();
        let mut sim = Simulation::new(&config, odors, inhibition, protocol).unwrap();
        sim.run().unwrap();

        let n_orn = config.model.topology.n_orn_total();
        let during = sim.spikes.count_in(5.0, 50.0, 0..n_orn);
        let late = sim.spikes.count_in(150.0, 195.0, 0..n_orn);
        assert!(during > 0);
        // after odor removal activity falls back toward the baseline
        assert!(during > late);
    }

    #[test]
    fn test_fixed_seed_reproducibility() {
        let config = small_config();
        let run = || {
            let odors = vec![uniform_odor(3, [0.01, 0.1, 0.005, 0.05, 1.0])];
            let inhibition = Array2::from_elem((3, 3), 1.0);
            let protocol = Protocol::parse("0 odor 0 0 0 1\n20 odor 0 0 0 0\n").unwrap();
            let mut sim = Simulation::new(&config, odors, inhibition, protocol).unwrap();
            sim.run().unwrap();
            (sim.diagnostics.rows.clone(), sim.spikes.times.clone())
        };
        let (rows_a, times_a) = run();
        let (rows_b, times_b) = run();
        assert_eq!(rows_a, rows_b);
        assert_eq!(times_a, times_b);
    }

    #[test]
    fn test_output_formats() {
        let mut log = SpikeLog::new();
        log.record(0.5, 12);
        log.record(0.75, 460);
        let mut out = Vec::new();
        write_spike_log(&log, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "0.5 12\n0.75 460\n");

        let mut trace = DiagnosticTrace::new();
        trace.push(0.0, vec![1.0, -2.5]);
        let mut out = Vec::new();
        write_diagnostics(&trace, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "0 1 -2.5\n");
    }
}
