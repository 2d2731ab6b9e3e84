//! # BeeAL Model
//!
//! Spiking network model of the honeybee antennal lobe.
//!
//! The antennal lobe is built from `n_glo` repeated glomeruli. Each
//! glomerulus holds `n_orn` olfactory receptor neurons (ORN), `n_pn`
//! projection neurons (PN) and `n_hln` homogeneous local interneurons
//! (hLN); a small shared population of `n_lhi` lateral horn interneurons
//! (LHI) sits downstream. ORNs transduce odor binding into stochastic
//! spikes via two-state receptor kinetics; PN, hLN and LHI are
//! conductance-based Hodgkin-Huxley-type neurons with a slow M-current.
//!
//! Projections:
//! - ORN -> PN (primary): one plastic synapse per ORN onto the first PN of
//!   its glomerulus, learning under a three-factor reward-modulated rule.
//! - ORN -> PN (others): static synapses onto the remaining PNs.
//! - ORN -> hLN, PN -> hLN: static same-glomerulus fan-out.
//! - PN -> LHI: the first `n_lhi` PNs of each glomerulus, one edge each.
//! - hLN -> hLN: cross-glomerular lateral inhibition (never same-glo).
//! - hLN -> PN: dense inhibitory matrix scaled per glomerulus pair.
//!
//! All populations advance with 5 Euler sub-steps per outer time step.
//! Spikes detected in one step reach their targets in the next.

use beeal_core::{ExecMode, RateFunction, SimulationParams, Time, SUBSTEPS};
use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Model is not enabled: call enable() after construction")]
    NotEnabled,

    #[error("Invalid unit index: {0}")]
    InvalidUnit(usize),

    #[error("Invalid odor slot: {0} (only slots 0 and 1 exist)")]
    InvalidSlot(usize),
}

pub type Result<T> = std::result::Result<T, ModelError>;

// ============================================================================
// GLOMERULAR TOPOLOGY
// ============================================================================

/// Counts defining the glomerular layout of the antennal lobe.
///
/// Global unit indices are contiguous per population, in the fixed order
/// ORN < PN < hLN < LHI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Number of glomeruli
    pub n_glo: usize,
    /// Receptor neurons per glomerulus
    pub n_orn: usize,
    /// Projection neurons per glomerulus
    pub n_pn: usize,
    /// Local interneurons per glomerulus
    pub n_hln: usize,
    /// Lateral horn interneurons (global, not per glomerulus)
    pub n_lhi: usize,
}

impl Topology {
    /// The configuration of the data-driven honeybee model:
    /// 30 glomeruli x (15 ORN, 5 PN, 1 hLN), 4 LHI.
    pub fn standard() -> Self {
        Self {
            n_glo: 30,
            n_orn: 15,
            n_pn: 5,
            n_hln: 1,
            n_lhi: 4,
        }
    }

    pub fn n_orn_total(&self) -> usize {
        self.n_glo * self.n_orn
    }

    pub fn n_pn_total(&self) -> usize {
        self.n_glo * self.n_pn
    }

    pub fn n_hln_total(&self) -> usize {
        self.n_glo * self.n_hln
    }

    /// Offset of the PN index range in the global spike numbering.
    pub fn pn_offset(&self) -> usize {
        self.n_orn_total()
    }

    pub fn hln_offset(&self) -> usize {
        self.pn_offset() + self.n_pn_total()
    }

    pub fn lhi_offset(&self) -> usize {
        self.hln_offset() + self.n_hln_total()
    }

    pub fn n_total(&self) -> usize {
        self.lhi_offset() + self.n_lhi
    }
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// ORN parameters (rates in kHz, times in ms, voltages in mV)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrnParams {
    /// Spike width
    pub tspike: f64,
    /// Refractory period (includes spike width)
    pub trefract: f64,
    /// Resting potential
    pub v_rest: f64,
    /// Potential at the top of a spike
    pub v_spike: f64,
    /// Base firing rate
    pub brate: f64,
    /// Firing-rate amplitude normalized to the spike-draw generator range
    pub randfac: f64,
    /// Rate of adaptation
    pub adrate: f64,
    /// Rate of recovery from adaptation
    pub recrate: f64,
}

impl Default for OrnParams {
    fn default() -> Self {
        Self {
            tspike: 0.1,
            trefract: 0.2,
            v_rest: -60.0,
            v_spike: 50.0,
            brate: 0.005,
            randfac: 1.4e14,
            adrate: 0.004,
            recrate: 0.002,
        }
    }
}

/// Conductance-based neuron parameters (PN, hLN, LHI)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HhParams {
    pub g_na: f64,
    pub e_na: f64,
    pub g_k: f64,
    pub e_k: f64,
    pub g_l: f64,
    pub e_l: f64,
    /// Membrane capacitance density
    pub c: f64,
    /// M-current conductance
    pub g_m: f64,
    /// Rise rate of M activation
    pub k_m_alpha: f64,
    /// Fall rate of M activation
    pub k_m_beta: f64,
    /// Bias current
    pub i0: f64,
}

impl HhParams {
    pub fn pn() -> Self {
        Self {
            g_na: 7.15,
            e_na: 50.0,
            g_k: 1.43,
            e_k: -95.0,
            g_l: 0.02672,
            e_l: -63.563,
            c: 0.143,
            g_m: 0.0,
            k_m_alpha: 0.0025,
            k_m_beta: 0.0001,
            i0: 0.05,
        }
    }

    pub fn hln() -> Self {
        Self {
            g_m: 0.006,
            k_m_alpha: 0.025,
            k_m_beta: 0.0001,
            i0: -0.03,
            ..Self::pn()
        }
    }

    pub fn lhi() -> Self {
        Self {
            g_m: 0.05,
            k_m_alpha: 0.02,
            k_m_beta: 0.002,
            i0: -0.08,
            ..Self::pn()
        }
    }
}

/// Initial state of a conductance-based neuron
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HhInit {
    pub v: f64,
    pub m: f64,
    pub h: f64,
    pub n: f64,
    pub r: f64,
}

impl HhInit {
    pub fn pn() -> Self {
        Self {
            v: -60.5,
            m: 0.01899074535,
            h: 0.9899576152,
            n: 0.04034804332,
            r: 0.1471045567,
        }
    }

    /// hLN and LHI start from the same fixed point.
    pub fn hln() -> Self {
        Self {
            v: -61.43808551,
            m: 0.02987296875,
            h: 0.9826520875,
            n: 0.06344290756,
            r: 0.2973757385,
        }
    }
}

/// Static synapse parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StaticSynParams {
    /// Base conductance
    pub g0: f64,
    /// Fractional gaussian jitter applied to g0 at build time
    pub gjitter: f64,
    /// Reversal potential (mV)
    pub erev: f64,
    /// Accumulator decay rate (kHz)
    pub beta: f64,
}

impl StaticSynParams {
    pub fn orn_pn() -> Self {
        Self {
            g0: 3.7e-6,
            gjitter: 0.1,
            erev: 0.0,
            beta: 0.04,
        }
    }

    pub fn orn_hln() -> Self {
        Self {
            g0: 6.5e-6,
            gjitter: 0.1,
            erev: 0.0,
            beta: 0.01,
        }
    }

    pub fn pn_hln() -> Self {
        Self {
            g0: 1.5e-5,
            gjitter: 0.1,
            erev: 0.0,
            beta: 0.02,
        }
    }

    pub fn pn_lhi() -> Self {
        Self {
            g0: 0.85e-5,
            gjitter: 0.1,
            erev: 0.0,
            beta: 0.004,
        }
    }

    pub fn hln_pn() -> Self {
        Self {
            g0: 0.0007,
            gjitter: 0.0,
            erev: -80.0,
            beta: 0.05,
        }
    }

    pub fn hln_hln() -> Self {
        Self {
            g0: 0.0003,
            gjitter: 0.0,
            erev: -80.0,
            beta: 0.02,
        }
    }
}

/// Three-factor plastic synapse parameters (primary ORN->PN projection)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlasticParams {
    /// Maximal conductance; the sigmoid filter maps graw into [0, gmax]
    pub gmax: f64,
    /// Decay timescale of the raw conductance
    pub g_lambda: f64,
    /// Midpoint of the sigmoid filter
    pub gmid: f64,
    /// Inverse slope of the sigmoid filter
    pub gslope: f64,
    /// Baseline of the eligibility trace
    pub pbase: f64,
    /// Decay timescale of the eligibility trace
    pub p_lambda: f64,
    /// Amplitude of the STDP branches
    pub a: f64,
    /// STDP tau_+ (defined for completeness; the amplitude is flat)
    pub tau_p: f64,
    /// STDP tau_- (defined for completeness; the amplitude is flat)
    pub tau_m: f64,
    /// Initial conductance before jitter
    pub g0: f64,
    /// Fractional gaussian jitter on the initial conductance
    pub gjitter: f64,
    /// Floor for the initial conductance (keeps the inverse sigmoid finite)
    pub g_min: f64,
    /// Reversal potential
    pub erev: f64,
    /// Accumulator decay rate (kHz)
    pub beta: f64,
}

impl Default for PlasticParams {
    fn default() -> Self {
        Self {
            gmax: 7.5e-6,
            g_lambda: 300_000.0,
            gmid: 4.0e-6,
            gslope: 3.0e-6,
            pbase: -2.2e-12,
            p_lambda: 1500.0,
            a: 0.8e-14,
            tau_p: 12.0,
            tau_m: 6.0,
            g0: 3.7e-6,
            gjitter: 0.1,
            g_min: 1e-20,
            erev: 0.0,
            beta: 0.01,
        }
    }
}

/// Full parameter set of the antennal lobe model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    pub topology: Topology,
    pub orn: OrnParams,
    pub pn: HhParams,
    pub pn_init: HhInit,
    pub hln: HhParams,
    pub hln_init: HhInit,
    pub lhi: HhParams,
    pub lhi_init: HhInit,
    pub orn_pn: StaticSynParams,
    pub orn_hln: StaticSynParams,
    pub pn_hln: StaticSynParams,
    pub pn_lhi: StaticSynParams,
    pub hln_pn: StaticSynParams,
    pub hln_hln: StaticSynParams,
    pub orn_pn1: PlasticParams,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            topology: Topology::standard(),
            orn: OrnParams::default(),
            pn: HhParams::pn(),
            pn_init: HhInit::pn(),
            hln: HhParams::hln(),
            hln_init: HhInit::hln(),
            lhi: HhParams::lhi(),
            lhi_init: HhInit::hln(),
            orn_pn: StaticSynParams::orn_pn(),
            orn_hln: StaticSynParams::orn_hln(),
            pn_hln: StaticSynParams::pn_hln(),
            pn_lhi: StaticSynParams::pn_lhi(),
            hln_pn: StaticSynParams::hln_pn(),
            hln_hln: StaticSynParams::hln_hln(),
            orn_pn1: PlasticParams::default(),
        }
    }
}

// ============================================================================
// SPARSE CONNECTIVITY
// ============================================================================

/// Compressed-row sparse connection from a source to a target population.
///
/// `ind_in_g[s]..ind_in_g[s+1]` is the edge range of source unit `s`;
/// `ind[e]` is the target unit of edge `e`. Per-edge weight arrays are
/// parallel to `ind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseConnection {
    pub ind_in_g: Vec<usize>,
    pub ind: Vec<usize>,
}

impl SparseConnection {
    pub fn conn_n(&self) -> usize {
        self.ind.len()
    }

    pub fn n_source(&self) -> usize {
        self.ind_in_g.len() - 1
    }

    pub fn edge_range(&self, src: usize) -> Range<usize> {
        self.ind_in_g[src]..self.ind_in_g[src + 1]
    }

    pub fn targets_of(&self, src: usize) -> &[usize] {
        &self.ind[self.edge_range(src)]
    }

    /// Structural invariant: offsets start at 0, never decrease, and end at
    /// the edge count.
    pub fn is_valid(&self) -> bool {
        self.ind_in_g.first() == Some(&0)
            && self.ind_in_g.windows(2).all(|w| w[0] <= w[1])
            && self.ind_in_g.last() == Some(&self.conn_n())
    }

    /// Derive the post-to-pre index for target-ordered iteration.
    pub fn reverse(&self, n_target: usize) -> ReverseIndex {
        let mut counts = vec![0usize; n_target + 1];
        for &tgt in &self.ind {
            counts[tgt + 1] += 1;
        }
        for j in 0..n_target {
            counts[j + 1] += counts[j];
        }
        let ind_in_g = counts.clone();
        let mut pre = vec![0usize; self.conn_n()];
        let mut edge = vec![0usize; self.conn_n()];
        let mut cursor = counts;
        for src in 0..self.n_source() {
            for e in self.edge_range(src) {
                let tgt = self.ind[e];
                pre[cursor[tgt]] = src;
                edge[cursor[tgt]] = e;
                cursor[tgt] += 1;
            }
        }
        ReverseIndex { ind_in_g, pre, edge }
    }
}

/// Post-to-pre companion of a [`SparseConnection`]: for each target unit,
/// the presynaptic units and the forward edge ids pointing at it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseIndex {
    pub ind_in_g: Vec<usize>,
    pub pre: Vec<usize>,
    pub edge: Vec<usize>,
}

impl ReverseIndex {
    pub fn edge_range(&self, tgt: usize) -> Range<usize> {
        self.ind_in_g[tgt]..self.ind_in_g[tgt + 1]
    }
}

fn jittered(g0: f64, frac: f64, rng: &mut StdRng) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    g0 * (1.0 + z * frac)
}

// ============================================================================
// SYNAPTIC PROJECTIONS
// ============================================================================

/// Static conductance synapse population over a sparse connection.
///
/// Presynaptic spikes add `g` to the per-target accumulator; the
/// transmitted current is `in_syn * (erev - V_post)`; after each neuron
/// update the accumulator decays by the precomputed factor `exp(-beta*dt)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticProjection {
    pub conn: SparseConnection,
    pub g: Vec<f64>,
    pub in_syn: Vec<f64>,
    pub erev: f64,
    decay: f64,
}

impl StaticProjection {
    pub fn new(conn: SparseConnection, g: Vec<f64>, n_target: usize, p: StaticSynParams, dt: Time) -> Self {
        Self {
            conn,
            g,
            in_syn: vec![0.0; n_target],
            erev: p.erev,
            decay: (-p.beta * dt).exp(),
        }
    }

    pub fn deliver(&mut self, pre_spikes: &[usize]) {
        for &i in pre_spikes {
            for e in self.conn.edge_range(i) {
                self.in_syn[self.conn.ind[e]] += self.g[e];
            }
        }
    }

    pub fn add_current(&self, v: &[f64], out: &mut [f64]) {
        for (j, out_j) in out.iter_mut().enumerate() {
            *out_j += self.in_syn[j] * (self.erev - v[j]);
        }
    }

    pub fn apply_decay(&mut self) {
        for x in &mut self.in_syn {
            *x *= self.decay;
        }
    }
}

/// Dense inhibitory projection (hLN -> PN): a full SxT weight matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseProjection {
    pub g: Array2<f64>,
    pub in_syn: Vec<f64>,
    pub erev: f64,
    decay: f64,
}

impl DenseProjection {
    /// Build the hLN->PN matrix from an `n_glo x n_glo` scale-factor table:
    /// every hLN of glomerulus `i` inhibits every PN of glomerulus `j` with
    /// conductance `scale[(i, j)] * g0`.
    pub fn from_scale(
        topo: &Topology,
        p: StaticSynParams,
        scale: ArrayView2<f64>,
        dt: Time,
    ) -> Result<Self> {
        if scale.dim() != (topo.n_glo, topo.n_glo) {
            return Err(ModelError::DimensionMismatch(format!(
                "inhibition scale table is {:?}, expected ({}, {})",
                scale.dim(),
                topo.n_glo,
                topo.n_glo
            )));
        }
        let (n_hln, n_pn) = (topo.n_hln_total(), topo.n_pn_total());
        let mut g = Array2::zeros((n_hln, n_pn));
        for i in 0..topo.n_glo {
            for j in 0..topo.n_glo {
                let w = scale[(i, j)] * p.g0;
                for k in 0..topo.n_hln {
                    for l in 0..topo.n_pn {
                        g[(i * topo.n_hln + k, j * topo.n_pn + l)] = w;
                    }
                }
            }
        }
        Ok(Self {
            g,
            in_syn: vec![0.0; n_pn],
            erev: p.erev,
            decay: (-p.beta * dt).exp(),
        })
    }

    pub fn deliver(&mut self, pre_spikes: &[usize]) {
        for &i in pre_spikes {
            for (j, &w) in self.g.row(i).iter().enumerate() {
                self.in_syn[j] += w;
            }
        }
    }

    pub fn add_current(&self, v: &[f64], out: &mut [f64]) {
        for (j, out_j) in out.iter_mut().enumerate() {
            *out_j += self.in_syn[j] * (self.erev - v[j]);
        }
    }

    pub fn apply_decay(&mut self) {
        for x in &mut self.in_syn {
            *x *= self.decay;
        }
    }
}

/// Coincidence window for the presynaptic STDP branch (ms): a presynaptic
/// spike is eligible if the postsynaptic partner fired less than this long
/// ago.
const PRE_COINCIDENCE_WINDOW: f64 = 20.0;

/// Coincidence window for the postsynaptic STDP branch (ms).
const POST_COINCIDENCE_WINDOW: f64 = 30.0;

/// Reward-modulated plastic synapse population (three-factor rule).
///
/// Each edge carries an eligibility trace `p`, a raw conductance `graw`
/// and the filtered conductance `g = gmax*(tanh((graw-gmid)/gslope)+1)/2`,
/// which keeps `g` in `[0, gmax]` without clamping. Spike coincidences
/// within the STDP windows bump `p` by the flat amplitude `A`; the reward
/// signal converts eligibility into raw conductance every step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlasticProjection {
    pub conn: SparseConnection,
    pub rev: ReverseIndex,
    pub g: Vec<f64>,
    pub p: Vec<f64>,
    pub graw: Vec<f64>,
    pub lastupdate: Vec<f64>,
    pub in_syn: Vec<f64>,
    pub params: PlasticParams,
    decay: f64,
}

/// Sigmoid filter mapping raw conductance into [0, gmax].
pub fn conductance_from_raw(graw: f64, p: &PlasticParams) -> f64 {
    p.gmax * (((graw - p.gmid) / p.gslope).tanh() + 1.0) / 2.0
}

/// Inverse of [`conductance_from_raw`], clamped away from the log
/// singularity at `g == gmax`.
pub fn raw_from_conductance(g: f64, p: &PlasticParams) -> f64 {
    let mut u = g / p.gmax * 2.0;
    if 2.0 - u < 1e-20 {
        u = 2.0 - 1e-19;
    }
    0.5 * (u / (2.0 - u)).ln() * p.gslope + p.gmid
}

impl PlasticProjection {
    pub fn new(
        conn: SparseConnection,
        g: Vec<f64>,
        n_target: usize,
        params: PlasticParams,
        dt: Time,
    ) -> Self {
        let conn_n = conn.conn_n();
        let rev = conn.reverse(n_target);
        let graw = g.iter().map(|&gi| raw_from_conductance(gi, &params)).collect();
        Self {
            conn,
            rev,
            g,
            p: vec![params.pbase; conn_n],
            graw,
            lastupdate: vec![0.0; conn_n],
            in_syn: vec![0.0; n_target],
            params,
            decay: (-params.beta * dt).exp(),
        }
    }

    /// Presynaptic spikes: transmit, and potentiate eligibility for edges
    /// whose postsynaptic partner fired within the coincidence window.
    pub fn deliver(&mut self, pre_spikes: &[usize], post_last_spike: &[f64], t: Time) {
        for &i in pre_spikes {
            for e in self.conn.edge_range(i) {
                let tgt = self.conn.ind[e];
                self.in_syn[tgt] += self.g[e];
                if t - post_last_spike[tgt] < PRE_COINCIDENCE_WINDOW {
                    self.p[e] += self.params.a;
                }
                self.lastupdate[e] = t;
            }
        }
    }

    /// Postsynaptic spikes, iterated through the reverse index.
    pub fn learn_post(&mut self, post_spikes: &[usize], pre_last_spike: &[f64], t: Time) {
        for &j in post_spikes {
            for k in self.rev.edge_range(j) {
                if t - pre_last_spike[self.rev.pre[k]] < POST_COINCIDENCE_WINDOW {
                    self.p[self.rev.edge[k]] += self.params.a;
                }
            }
        }
    }

    /// Per-step reward-gated dynamics: eligibility relaxes to its baseline,
    /// raw conductance decays and integrates `R*p`, and the filtered
    /// conductance is recomputed.
    pub fn reward_step(&mut self, r: f64, dt: Time) {
        let pp = self.params;
        for e in 0..self.g.len() {
            self.p[e] += (pp.pbase - self.p[e]) * dt / pp.p_lambda;
            self.graw[e] += -self.graw[e] * dt / pp.g_lambda;
            self.graw[e] += r * self.p[e] * dt;
            self.g[e] = conductance_from_raw(self.graw[e], &pp);
        }
    }

    pub fn add_current(&self, v: &[f64], out: &mut [f64]) {
        for (j, out_j) in out.iter_mut().enumerate() {
            *out_j += self.in_syn[j] * (self.erev() - v[j]);
        }
    }

    pub fn erev(&self) -> f64 {
        self.params.erev
    }

    pub fn apply_decay(&mut self) {
        for x in &mut self.in_syn {
            *x *= self.decay;
        }
    }
}

// ============================================================================
// CONNECTIVITY BUILDERS
// ============================================================================

/// Each ORN connects to the primary (first) PN of its glomerulus: one
/// plastic edge per ORN. Initial conductances are jittered around `g0`,
/// floored at `g_min`, and inverted through the sigmoid filter to seed
/// `graw`.
pub fn connect_orn_pn1(
    topo: &Topology,
    params: PlasticParams,
    dt: Time,
    rng: &mut StdRng,
) -> PlasticProjection {
    let conn_n = topo.n_orn_total();
    let mut ind_in_g = Vec::with_capacity(conn_n + 1);
    let mut ind = Vec::with_capacity(conn_n);
    let mut g = Vec::with_capacity(conn_n);
    let mut n = 0;
    for i in 0..topo.n_glo {
        for _ in 0..topo.n_orn {
            ind_in_g.push(n);
            ind.push(i * topo.n_pn);
            g.push(jittered(params.g0, params.gjitter, rng).max(params.g_min));
            n += 1;
        }
    }
    assert_eq!(n, conn_n);
    ind_in_g.push(conn_n);
    PlasticProjection::new(
        SparseConnection { ind_in_g, ind },
        g,
        topo.n_pn_total(),
        params,
        dt,
    )
}

/// Each ORN connects to every non-primary PN of its glomerulus.
pub fn connect_orn_pn(
    topo: &Topology,
    params: StaticSynParams,
    dt: Time,
    rng: &mut StdRng,
) -> StaticProjection {
    let conn_n = topo.n_orn_total() * (topo.n_pn - 1);
    let mut ind_in_g = Vec::with_capacity(topo.n_orn_total() + 1);
    let mut ind = Vec::with_capacity(conn_n);
    let mut g = Vec::with_capacity(conn_n);
    let mut n = 0;
    for i in 0..topo.n_glo {
        for _ in 0..topo.n_orn {
            ind_in_g.push(n);
            for k in 1..topo.n_pn {
                ind.push(i * topo.n_pn + k);
                g.push(jittered(params.g0, params.gjitter, rng));
                n += 1;
            }
        }
    }
    assert_eq!(n, conn_n);
    ind_in_g.push(conn_n);
    StaticProjection::new(SparseConnection { ind_in_g, ind }, g, topo.n_pn_total(), params, dt)
}

/// Each ORN connects to every hLN of its glomerulus.
pub fn connect_orn_hln(
    topo: &Topology,
    params: StaticSynParams,
    dt: Time,
    rng: &mut StdRng,
) -> StaticProjection {
    let conn_n = topo.n_orn_total() * topo.n_hln;
    let mut ind_in_g = Vec::with_capacity(topo.n_orn_total() + 1);
    let mut ind = Vec::with_capacity(conn_n);
    let mut g = Vec::with_capacity(conn_n);
    let mut n = 0;
    for i in 0..topo.n_glo {
        for _ in 0..topo.n_orn {
            ind_in_g.push(n);
            for k in 0..topo.n_hln {
                ind.push(i * topo.n_hln + k);
                g.push(jittered(params.g0, params.gjitter, rng));
                n += 1;
            }
        }
    }
    assert_eq!(n, conn_n);
    ind_in_g.push(conn_n);
    StaticProjection::new(SparseConnection { ind_in_g, ind }, g, topo.n_hln_total(), params, dt)
}

/// Each PN excites every hLN of its glomerulus.
pub fn connect_pn_hln(
    topo: &Topology,
    params: StaticSynParams,
    dt: Time,
    rng: &mut StdRng,
) -> StaticProjection {
    let conn_n = topo.n_pn_total() * topo.n_hln;
    let mut ind_in_g = Vec::with_capacity(topo.n_pn_total() + 1);
    let mut ind = Vec::with_capacity(conn_n);
    let mut g = Vec::with_capacity(conn_n);
    let mut n = 0;
    for i in 0..topo.n_glo {
        for _ in 0..topo.n_pn {
            ind_in_g.push(n);
            for k in 0..topo.n_hln {
                ind.push(i * topo.n_hln + k);
                g.push(jittered(params.g0, params.gjitter, rng));
                n += 1;
            }
        }
    }
    assert_eq!(n, conn_n);
    ind_in_g.push(conn_n);
    StaticProjection::new(SparseConnection { ind_in_g, ind }, g, topo.n_hln_total(), params, dt)
}

/// Only the first `n_lhi` PNs of each glomerulus project to the lateral
/// horn, PN with local index `j` onto LHI `j`.
pub fn connect_pn_lhi(
    topo: &Topology,
    params: StaticSynParams,
    dt: Time,
    rng: &mut StdRng,
) -> StaticProjection {
    let conn_n = topo.n_lhi * topo.n_glo;
    let mut ind_in_g = Vec::with_capacity(topo.n_pn_total() + 1);
    let mut ind = Vec::with_capacity(conn_n);
    let mut g = Vec::with_capacity(conn_n);
    let mut n = 0;
    for _ in 0..topo.n_glo {
        for j in 0..topo.n_pn {
            ind_in_g.push(n);
            if j < topo.n_lhi {
                ind.push(j);
                g.push(jittered(params.g0, params.gjitter, rng));
                n += 1;
            }
        }
    }
    assert_eq!(n, conn_n);
    ind_in_g.push(conn_n);
    StaticProjection::new(SparseConnection { ind_in_g, ind }, g, topo.n_lhi, params, dt)
}

/// Every hLN inhibits every hLN of every *other* glomerulus; a hLN never
/// connects to itself or to hLNs of its own glomerulus.
pub fn connect_hln_hln(topo: &Topology, params: StaticSynParams, dt: Time) -> StaticProjection {
    let n_hln = topo.n_hln_total();
    let conn_n = n_hln * (n_hln - topo.n_hln);
    let mut ind_in_g = Vec::with_capacity(n_hln + 1);
    let mut ind = Vec::with_capacity(conn_n);
    let mut g = Vec::with_capacity(conn_n);
    let mut n = 0;
    for i in 0..topo.n_glo {
        for _ in 0..topo.n_hln {
            ind_in_g.push(n);
            for j in 0..topo.n_glo {
                if i != j {
                    for l in 0..topo.n_hln {
                        ind.push(j * topo.n_hln + l);
                        g.push(params.g0);
                        n += 1;
                    }
                }
            }
        }
    }
    assert_eq!(n, conn_n);
    ind_in_g.push(conn_n);
    StaticProjection::new(SparseConnection { ind_in_g, ind }, g, n_hln, params, dt)
}

// ============================================================================
// NEURON POPULATIONS
// ============================================================================

/// Run a per-unit kernel over a population, serially or as a rayon
/// parallel map, and collect the indices of units that spiked. Unit updates
/// are independent, so the two backends produce identical results.
fn run_kernel<U, F>(mode: ExecMode, units: &mut [U], kernel: F) -> Vec<usize>
where
    U: Send,
    F: Fn(usize, &mut U) -> bool + Sync,
{
    match mode {
        ExecMode::Serial => units
            .iter_mut()
            .enumerate()
            .filter_map(|(i, u)| kernel(i, u).then_some(i))
            .collect(),
        ExecMode::Parallel => units
            .par_iter_mut()
            .enumerate()
            .filter_map(|(i, u)| kernel(i, u).then_some(i))
            .collect(),
    }
}

/// Per-unit state of an olfactory receptor neuron.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrnState {
    pub v: f64,
    /// Bound receptor fraction per odor slot
    pub r: [f64; 2],
    /// Locked-in receptor fraction per odor slot
    pub rs: [f64; 2],
    /// Adaptation variable (1 = unadapted)
    pub ad: f64,
    /// Unbound receptor fraction
    pub rb: f64,
    /// Current firing rate
    pub trate: f64,
    pub refract: bool,
    /// Per-unit spike-draw generator state
    pub seed: u64,
    pub last_spike: f64,
}

/// ORN population: receptor kinetics plus stochastic spike generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrnPopulation {
    pub units: Vec<OrnState>,
    pub params: OrnParams,
}

impl OrnPopulation {
    pub fn new(topo: &Topology, params: OrnParams, rng: &mut StdRng) -> Self {
        let units = (0..topo.n_orn_total())
            .map(|_| OrnState {
                v: params.v_rest,
                r: [0.0; 2],
                rs: [0.0; 2],
                ad: 1.0,
                rb: 1.0,
                trate: 0.0,
                refract: false,
                seed: (rng.gen::<f64>() * 1e8) as u64,
                last_spike: f64::NEG_INFINITY,
            })
            .collect();
        Self { units, params }
    }

    /// Advance all ORNs by one outer time step (5 Euler sub-steps).
    ///
    /// `kk` is the shared per-glomerulus rate table, one row of 12 values
    /// per glomerulus: for each odor slot `s`, `kk[6s..6s+5]` are the
    /// unbind/bind/unlock/lock rates and the Hill exponent, `kk[6s+5]` the
    /// current concentration. Returns the indices of units whose voltage
    /// crossed 0 upward this step.
    pub fn update(
        &mut self,
        kk: &Array2<f64>,
        n_orn_per_glo: usize,
        t: Time,
        dt: Time,
        mode: ExecMode,
    ) -> Vec<usize> {
        let p = self.params;
        let mdt = dt / SUBSTEPS as f64;
        run_kernel(mode, &mut self.units, |i, u| {
            let row = kk.row(i / n_orn_per_glo);
            let v_before = u.v;
            for _ in 0..SUBSTEPS {
                let mut drb = 0.0;
                for s in 0..2 {
                    let b = 6 * s;
                    let drive = row[b + 1] * u.rb * row[b + 5].powf(row[b + 4]);
                    let dr = -(row[b] + row[b + 3]) * u.r[s] + row[b + 2] * u.rs[s] + drive;
                    let drs = -row[b + 2] * u.rs[s] + row[b + 3] * u.r[s];
                    drb += row[b] * u.r[s] - drive;
                    u.r[s] += dr * mdt;
                    u.rs[s] += drs * mdt;
                }
                // adaptation uses the firing rate from the previous sub-step
                u.ad += (p.recrate - (u.trate * p.adrate + p.recrate) * u.ad) * mdt;
                u.rb += drb * mdt;
                u.trate = p.brate + u.rs[0] + u.rs[1];
                if u.v >= p.v_spike {
                    if t - u.last_spike > p.tspike {
                        u.v = p.v_rest;
                        u.refract = true;
                    }
                } else if u.refract {
                    if t - u.last_spike > p.trefract {
                        u.refract = false;
                    }
                } else {
                    u.seed = u.seed.wrapping_mul(1103515245).wrapping_add(12345);
                    let rnd = u.seed >> 16;
                    if (rnd as f64) <= p.randfac * u.trate * u.ad {
                        u.v = p.v_spike;
                    }
                }
            }
            let spiked = v_before <= 0.0 && u.v > 0.0;
            if spiked {
                u.last_spike = t;
            }
            spiked
        })
    }

    pub fn last_spikes(&self) -> Vec<f64> {
        self.units.iter().map(|u| u.last_spike).collect()
    }
}

/// Per-unit state of a conductance-based neuron.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HhState {
    pub v: f64,
    pub m: f64,
    pub h: f64,
    pub n: f64,
    pub r: f64,
    pub last_spike: f64,
}

// Voltage-dependent rates of the antennal lobe neurons. Offsets are the
// classical Traub-Miles parameterization; the HodgkinHuxley variant guards
// the removable singularities at -52, -25 and -50 mV.
const ALPHA_M: RateFunction = RateFunction::HodgkinHuxley { a: -0.32, b: 52.0, c: -4.0 };
const BETA_M: RateFunction = RateFunction::HodgkinHuxley { a: 0.28, b: 25.0, c: 5.0 };
const ALPHA_H: RateFunction = RateFunction::Exponential { a: 0.128, b: 48.0, c: -18.0 };
const BETA_H: RateFunction = RateFunction::Sigmoid { a: 4.0, b: 25.0, c: -5.0 };
const ALPHA_N: RateFunction = RateFunction::HodgkinHuxley { a: -0.032, b: 50.0, c: -5.0 };
const BETA_N: RateFunction = RateFunction::Exponential { a: 0.5, b: 55.0, c: -40.0 };

/// Conductance-based population (PN, hLN or LHI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HhPopulation {
    pub units: Vec<HhState>,
    pub params: HhParams,
}

impl HhPopulation {
    pub fn new(n: usize, params: HhParams, init: HhInit) -> Self {
        let units = (0..n)
            .map(|_| HhState {
                v: init.v,
                m: init.m,
                h: init.h,
                n: init.n,
                r: init.r,
                last_spike: f64::NEG_INFINITY,
            })
            .collect();
        Self { units, params }
    }

    /// Advance all units by one outer time step. `i_syn[i]` is the total
    /// synaptic plus injected current for unit `i`, held constant across
    /// the sub-steps. Returns indices of units whose voltage crossed 0.
    pub fn update(&mut self, i_syn: &[f64], t: Time, dt: Time, mode: ExecMode) -> Vec<usize> {
        let p = self.params;
        let mdt = dt / SUBSTEPS as f64;
        let alpha_r = RateFunction::Sigmoid { a: p.k_m_alpha, b: -20.0, c: -5.0 };
        run_kernel(mode, &mut self.units, |i, u| {
            let isyn = i_syn[i];
            let v_before = u.v;
            for _ in 0..SUBSTEPS {
                let imem = -(u.m * u.m * u.m * u.h * p.g_na * (u.v - p.e_na)
                    + u.n * u.n * u.n * u.n * p.g_k * (u.v - p.e_k)
                    + u.r * p.g_m * (u.v - p.e_k)
                    + p.g_l * (u.v - p.e_l)
                    - p.i0
                    - isyn);
                let (am, bm) = (ALPHA_M.eval(u.v), BETA_M.eval(u.v));
                u.m += (am * (1.0 - u.m) - bm * u.m) * mdt;
                let (ah, bh) = (ALPHA_H.eval(u.v), BETA_H.eval(u.v));
                u.h += (ah * (1.0 - u.h) - bh * u.h) * mdt;
                let (an, bn) = (ALPHA_N.eval(u.v), BETA_N.eval(u.v));
                u.n += (an * (1.0 - u.n) - bn * u.n) * mdt;
                let ar = alpha_r.eval(u.v);
                u.r += (ar * (1.0 - u.r) - p.k_m_beta * u.r) * mdt;
                u.v += imem / p.c * mdt;
            }
            let spiked = v_before <= 0.0 && u.v > 0.0;
            if spiked {
                u.last_spike = t;
            }
            spiked
        })
    }

    pub fn voltages(&self) -> Vec<f64> {
        self.units.iter().map(|u| u.v).collect()
    }

    pub fn last_spikes(&self) -> Vec<f64> {
        self.units.iter().map(|u| u.last_spike).collect()
    }
}

// ============================================================================
// THE ANTENNAL LOBE NETWORK
// ============================================================================

/// The complete antennal lobe: four populations, seven projections, the
/// shared odor-kinetics table and the per-LHI direct input.
///
/// Spike lists are double-buffered implicitly: [`AntennalLobe::step`]
/// delivers the spikes detected in the *previous* step before integrating
/// the neurons, so transmission has a one-step latency.
#[derive(Debug, Clone)]
pub struct AntennalLobe {
    pub topo: Topology,
    pub orn: OrnPopulation,
    pub pn: HhPopulation,
    pub hln: HhPopulation,
    pub lhi: HhPopulation,
    /// Plastic primary ORN->PN projection
    pub orn_pn1: PlasticProjection,
    pub orn_pn: StaticProjection,
    pub orn_hln: StaticProjection,
    pub pn_hln: StaticProjection,
    pub pn_lhi: StaticProjection,
    pub hln_pn: DenseProjection,
    pub hln_hln: StaticProjection,
    /// Receptor-kinetics table, one row of 12 per glomerulus
    pub kk: Array2<f64>,
    /// Direct injected current per LHI
    pub direct_input: Vec<f64>,
    pub orn_spikes: Vec<usize>,
    pub pn_spikes: Vec<usize>,
    pub hln_spikes: Vec<usize>,
    pub lhi_spikes: Vec<usize>,
    exec_mode: ExecMode,
    enabled: bool,
}

impl AntennalLobe {
    /// Build the full network. `scale` is the `n_glo x n_glo` hLN->PN
    /// inhibition scale table. All randomness (conductance jitter, ORN
    /// spike-draw seeds) derives from `sim.seed`.
    pub fn new(params: &ModelParams, scale: ArrayView2<f64>, sim: &SimulationParams) -> Result<Self> {
        let topo = params.topology;
        let mut rng = StdRng::seed_from_u64(sim.seed);
        let dt = sim.dt;

        let orn = OrnPopulation::new(&topo, params.orn, &mut rng);
        let pn = HhPopulation::new(topo.n_pn_total(), params.pn, params.pn_init);
        let hln = HhPopulation::new(topo.n_hln_total(), params.hln, params.hln_init);
        let lhi = HhPopulation::new(topo.n_lhi, params.lhi, params.lhi_init);

        let orn_pn1 = connect_orn_pn1(&topo, params.orn_pn1, dt, &mut rng);
        let orn_pn = connect_orn_pn(&topo, params.orn_pn, dt, &mut rng);
        let orn_hln = connect_orn_hln(&topo, params.orn_hln, dt, &mut rng);
        let pn_hln = connect_pn_hln(&topo, params.pn_hln, dt, &mut rng);
        let pn_lhi = connect_pn_lhi(&topo, params.pn_lhi, dt, &mut rng);
        let hln_pn = DenseProjection::from_scale(&topo, params.hln_pn, scale, dt)?;
        let hln_hln = connect_hln_hln(&topo, params.hln_hln, dt);

        Ok(Self {
            topo,
            orn,
            pn,
            hln,
            lhi,
            orn_pn1,
            orn_pn,
            orn_hln,
            pn_hln,
            pn_lhi,
            hln_pn,
            hln_hln,
            kk: Array2::zeros((topo.n_glo, 12)),
            direct_input: vec![0.0; topo.n_lhi],
            orn_spikes: Vec::new(),
            pn_spikes: Vec::new(),
            hln_spikes: Vec::new(),
            lhi_spikes: Vec::new(),
            exec_mode: sim.exec_mode,
            enabled: false,
        })
    }

    /// Arm the model for stepping. Both odor slots start cleared.
    pub fn enable(&mut self) {
        self.clear_odor(0).ok();
        self.clear_odor(1).ok();
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Write an odor's kinetic profile (`n_glo` rows x 5 rate columns) and
    /// its concentration into one slot of the kk table.
    pub fn set_odor(&mut self, profile: ArrayView2<f64>, slot: usize, conc: f64) -> Result<()> {
        if slot >= 2 {
            return Err(ModelError::InvalidSlot(slot));
        }
        if profile.dim() != (self.topo.n_glo, 5) {
            return Err(ModelError::DimensionMismatch(format!(
                "odor profile is {:?}, expected ({}, 5)",
                profile.dim(),
                self.topo.n_glo
            )));
        }
        for i in 0..self.topo.n_glo {
            for l in 0..5 {
                self.kk[(i, slot * 6 + l)] = profile[(i, l)];
            }
            self.kk[(i, slot * 6 + 5)] = conc;
        }
        Ok(())
    }

    /// Zero the concentration in a slot, leaving its rates in place.
    pub fn clear_odor(&mut self, slot: usize) -> Result<()> {
        if slot >= 2 {
            return Err(ModelError::InvalidSlot(slot));
        }
        for i in 0..self.topo.n_glo {
            self.kk[(i, slot * 6 + 5)] = 0.0;
        }
        Ok(())
    }

    /// Set the direct injected current of one LHI.
    pub fn set_direct_input(&mut self, id: usize, value: f64) -> Result<()> {
        if id >= self.direct_input.len() {
            return Err(ModelError::InvalidUnit(id));
        }
        self.direct_input[id] = value;
        Ok(())
    }

    /// Advance the whole network by one outer time step.
    ///
    /// `reward` is the current value of the reward trace gating the plastic
    /// projection. Phase order matches the reference backend: synaptic
    /// delivery of last step's spikes, then neuron integration with the
    /// accumulated input, then accumulator decay.
    pub fn step(&mut self, reward: f64, t: Time, dt: Time) -> Result<()> {
        if !self.enabled {
            return Err(ModelError::NotEnabled);
        }

        // --- synapse phase: previous step's spikes ---
        let pn_last = self.pn.last_spikes();
        let orn_last = self.orn.last_spikes();
        self.orn_pn1.deliver(&self.orn_spikes, &pn_last, t);
        self.orn_pn1.learn_post(&self.pn_spikes, &orn_last, t);
        self.orn_pn1.reward_step(reward, dt);
        self.orn_pn.deliver(&self.orn_spikes);
        self.orn_hln.deliver(&self.orn_spikes);
        self.pn_hln.deliver(&self.pn_spikes);
        self.pn_lhi.deliver(&self.pn_spikes);
        self.hln_pn.deliver(&self.hln_spikes);
        self.hln_hln.deliver(&self.hln_spikes);

        // --- neuron phase: input currents from voltages at step start ---
        let pn_v = self.pn.voltages();
        let hln_v = self.hln.voltages();
        let lhi_v = self.lhi.voltages();

        let mut i_pn = vec![0.0; pn_v.len()];
        self.orn_pn1.add_current(&pn_v, &mut i_pn);
        self.orn_pn.add_current(&pn_v, &mut i_pn);
        self.hln_pn.add_current(&pn_v, &mut i_pn);

        let mut i_hln = vec![0.0; hln_v.len()];
        self.orn_hln.add_current(&hln_v, &mut i_hln);
        self.pn_hln.add_current(&hln_v, &mut i_hln);
        self.hln_hln.add_current(&hln_v, &mut i_hln);

        let mut i_lhi = vec![0.0; lhi_v.len()];
        self.pn_lhi.add_current(&lhi_v, &mut i_lhi);
        for (cur, inj) in i_lhi.iter_mut().zip(self.direct_input.iter()) {
            *cur += inj;
        }

        self.orn_spikes = self
            .orn
            .update(&self.kk, self.topo.n_orn, t, dt, self.exec_mode);
        self.pn_spikes = self.pn.update(&i_pn, t, dt, self.exec_mode);
        self.hln_spikes = self.hln.update(&i_hln, t, dt, self.exec_mode);
        self.lhi_spikes = self.lhi.update(&i_lhi, t, dt, self.exec_mode);

        // --- decay phase ---
        self.orn_pn1.apply_decay();
        self.orn_pn.apply_decay();
        self.orn_hln.apply_decay();
        self.pn_hln.apply_decay();
        self.pn_lhi.apply_decay();
        self.hln_pn.apply_decay();
        self.hln_hln.apply_decay();

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn small_topo() -> Topology {
        Topology {
            n_glo: 3,
            n_orn: 4,
            n_pn: 3,
            n_hln: 2,
            n_lhi: 2,
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_topology_offsets() {
        let t = Topology::standard();
        assert_eq!(t.n_orn_total(), 450);
        assert_eq!(t.n_pn_total(), 150);
        assert_eq!(t.n_hln_total(), 30);
        assert_eq!(t.pn_offset(), 450);
        assert_eq!(t.hln_offset(), 600);
        assert_eq!(t.lhi_offset(), 630);
        assert_eq!(t.n_total(), 634);
    }

    #[test]
    fn test_orn_pn1_structure() {
        let topo = small_topo();
        let proj = connect_orn_pn1(&topo, PlasticParams::default(), 0.01, &mut rng());
        assert!(proj.conn.is_valid());
        assert_eq!(proj.conn.conn_n(), topo.n_orn_total());
        // every ORN has exactly one edge, onto the primary PN of its glo
        for src in 0..topo.n_orn_total() {
            let glo = src / topo.n_orn;
            assert_eq!(proj.conn.targets_of(src), &[glo * topo.n_pn]);
        }
    }

    #[test]
    fn test_orn_pn_structure() {
        let topo = small_topo();
        let proj = connect_orn_pn(&topo, StaticSynParams::orn_pn(), 0.01, &mut rng());
        assert!(proj.conn.is_valid());
        assert_eq!(proj.conn.conn_n(), topo.n_orn_total() * (topo.n_pn - 1));
        for src in 0..topo.n_orn_total() {
            let glo = src / topo.n_orn;
            let targets = proj.conn.targets_of(src);
            assert_eq!(targets.len(), topo.n_pn - 1);
            // never the primary PN
            assert!(!targets.contains(&(glo * topo.n_pn)));
        }
    }

    #[test]
    fn test_same_glo_fanout_structures() {
        let topo = small_topo();
        let oh = connect_orn_hln(&topo, StaticSynParams::orn_hln(), 0.01, &mut rng());
        assert!(oh.conn.is_valid());
        assert_eq!(oh.conn.conn_n(), topo.n_orn_total() * topo.n_hln);

        let ph = connect_pn_hln(&topo, StaticSynParams::pn_hln(), 0.01, &mut rng());
        assert!(ph.conn.is_valid());
        assert_eq!(ph.conn.conn_n(), topo.n_pn_total() * topo.n_hln);
        for src in 0..topo.n_pn_total() {
            let glo = src / topo.n_pn;
            for &tgt in ph.conn.targets_of(src) {
                assert_eq!(tgt / topo.n_hln, glo);
            }
        }
    }

    #[test]
    fn test_pn_lhi_structure() {
        let topo = small_topo();
        let proj = connect_pn_lhi(&topo, StaticSynParams::pn_lhi(), 0.01, &mut rng());
        assert!(proj.conn.is_valid());
        assert_eq!(proj.conn.conn_n(), topo.n_lhi * topo.n_glo);
        for src in 0..topo.n_pn_total() {
            let j = src % topo.n_pn;
            if j < topo.n_lhi {
                assert_eq!(proj.conn.targets_of(src), &[j]);
            } else {
                assert!(proj.conn.targets_of(src).is_empty());
            }
        }
    }

    #[test]
    fn test_hln_hln_cross_glomerular_only() {
        let topo = small_topo();
        let proj = connect_hln_hln(&topo, StaticSynParams::hln_hln(), 0.01);
        assert!(proj.conn.is_valid());
        let n_hln = topo.n_hln_total();
        assert_eq!(proj.conn.conn_n(), n_hln * (n_hln - topo.n_hln));
        for src in 0..n_hln {
            let src_glo = src / topo.n_hln;
            for &tgt in proj.conn.targets_of(src) {
                assert_ne!(tgt / topo.n_hln, src_glo);
                assert_ne!(tgt, src);
            }
        }
    }

    #[test]
    fn test_dense_scale_broadcast_and_mismatch() {
        let topo = small_topo();
        let mut scale = Array2::zeros((topo.n_glo, topo.n_glo));
        scale[(0, 1)] = 2.0;
        scale[(2, 0)] = 0.5;
        let p = StaticSynParams::hln_pn();
        let proj = DenseProjection::from_scale(&topo, p, scale.view(), 0.01).unwrap();
        // hLN 0 (glo 0) onto PN of glo 1
        assert_eq!(proj.g[(0, topo.n_pn)], 2.0 * p.g0);
        // hLN of glo 2 onto PN of glo 0
        assert_eq!(proj.g[(2 * topo.n_hln, 0)], 0.5 * p.g0);
        // unset pairs are zero
        assert_eq!(proj.g[(0, 0)], 0.0);

        let bad = Array2::zeros((2, 2));
        assert!(DenseProjection::from_scale(&topo, p, bad.view(), 0.01).is_err());
    }

    #[test]
    fn test_reverse_index_consistency() {
        let topo = small_topo();
        let proj = connect_orn_pn(&topo, StaticSynParams::orn_pn(), 0.01, &mut rng());
        let rev = proj.conn.reverse(topo.n_pn_total());
        // every forward edge appears exactly once in the reverse index
        let mut seen = vec![false; proj.conn.conn_n()];
        for tgt in 0..topo.n_pn_total() {
            for k in rev.edge_range(tgt) {
                let e = rev.edge[k];
                assert!(!seen[e]);
                seen[e] = true;
                assert_eq!(proj.conn.ind[e], tgt);
                assert!(proj.conn.edge_range(rev.pre[k]).contains(&e));
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_inverse_sigmoid_round_trip() {
        let p = PlasticParams {
            gjitter: 0.0,
            ..PlasticParams::default()
        };
        let raw = raw_from_conductance(p.g0, &p);
        let g = conductance_from_raw(raw, &p);
        assert!((g - p.g0).abs() < 1e-18);
        // deterministic: same input, same output
        assert_eq!(raw, raw_from_conductance(p.g0, &p));
        // the clamp keeps the inverse finite at the top of the range
        assert!(raw_from_conductance(p.gmax, &p).is_finite());
    }

    #[test]
    fn test_plastic_g_stays_bounded() {
        let topo = small_topo();
        let mut proj = connect_orn_pn1(&topo, PlasticParams::default(), 0.01, &mut rng());
        let gmax = proj.params.gmax;
        // drive the raw conductance hard in both directions
        for e in 0..proj.p.len() {
            proj.p[e] = 1e-6;
        }
        for _ in 0..10_000 {
            proj.reward_step(1e9, 0.01);
        }
        for &g in &proj.g {
            assert!((0.0..=gmax).contains(&g));
        }
        for e in 0..proj.p.len() {
            proj.p[e] = -1e-6;
        }
        for _ in 0..10_000 {
            proj.reward_step(1e9, 0.01);
        }
        for &g in &proj.g {
            assert!((0.0..=gmax).contains(&g));
        }
    }

    #[test]
    fn test_stdp_windows() {
        let topo = small_topo();
        let mut proj = connect_orn_pn1(&topo, PlasticParams::default(), 0.01, &mut rng());
        let a = proj.params.a;
        let p0 = proj.p[0];
        // post partner fired 5 ms ago: inside the 20 ms pre window
        let mut post_last = vec![f64::NEG_INFINITY; topo.n_pn_total()];
        post_last[proj.conn.ind[0]] = 95.0;
        proj.deliver(&[0], &post_last, 100.0);
        assert!((proj.p[0] - (p0 + a)).abs() < a * 1e-9);
        assert_eq!(proj.lastupdate[0], 100.0);

        // post partner fired 25 ms ago: outside the pre window
        let p1 = proj.p[1];
        let mut post_last = vec![f64::NEG_INFINITY; topo.n_pn_total()];
        post_last[proj.conn.ind[1]] = 75.0;
        proj.deliver(&[1], &post_last, 100.0);
        assert_eq!(proj.p[1], p1);

        // pre partner fired 25 ms ago: inside the 30 ms post window
        let tgt = proj.conn.ind[0];
        let p2 = proj.p[0];
        let mut pre_last = vec![f64::NEG_INFINITY; topo.n_orn_total()];
        pre_last[0] = 75.0;
        proj.learn_post(&[tgt], &pre_last, 100.0);
        assert!((proj.p[0] - (p2 + a)).abs() < a * 1e-9);
    }

    #[test]
    fn test_orn_population_deterministic() {
        let topo = small_topo();
        let kk = Array2::zeros((topo.n_glo, 12));
        let mut a = OrnPopulation::new(&topo, OrnParams::default(), &mut rng());
        let mut b = OrnPopulation::new(&topo, OrnParams::default(), &mut rng());
        for step in 0..2000 {
            let t = step as f64 * 0.01;
            let sa = a.update(&kk, topo.n_orn, t, 0.01, ExecMode::Serial);
            let sb = b.update(&kk, topo.n_orn, t, 0.01, ExecMode::Serial);
            assert_eq!(sa, sb);
        }
    }

    #[test]
    fn test_orn_baseline_firing() {
        let topo = Topology {
            n_glo: 10,
            n_orn: 20,
            n_pn: 1,
            n_hln: 1,
            n_lhi: 1,
        };
        let kk = Array2::zeros((topo.n_glo, 12));
        let mut pop = OrnPopulation::new(&topo, OrnParams::default(), &mut rng());
        let mut total = 0;
        for step in 0..10_000 {
            let t = step as f64 * 0.01;
            total += pop.update(&kk, topo.n_orn, t, 0.01, ExecMode::Serial).len();
        }
        // 200 units at the 5 Hz base rate over 100 ms
        assert!(total > 0);
    }

    #[test]
    fn test_hh_spikes_under_current() {
        let mut pop = HhPopulation::new(1, HhParams::pn(), HhInit::pn());
        let mut spiked = false;
        for step in 0..5000 {
            let t = step as f64 * 0.01;
            if !pop.update(&[0.5], t, 0.01, ExecMode::Serial).is_empty() {
                spiked = true;
                break;
            }
        }
        assert!(spiked);
    }

    #[test]
    fn test_hh_rests_without_current() {
        let mut pop = HhPopulation::new(1, HhParams::hln(), HhInit::hln());
        for step in 0..5000 {
            let t = step as f64 * 0.01;
            let spikes = pop.update(&[0.0], t, 0.01, ExecMode::Serial);
            assert!(spikes.is_empty());
        }
        let v = pop.units[0].v;
        assert!(v > -80.0 && v < -40.0);
    }

    #[test]
    fn test_network_requires_enable() {
        let params = ModelParams {
            topology: small_topo(),
            ..ModelParams::default()
        };
        let scale = Array2::from_elem((3, 3), 1.0);
        let sim = SimulationParams::default();
        let mut al = AntennalLobe::new(&params, scale.view(), &sim).unwrap();
        assert!(al.step(0.0, 0.0, sim.dt).is_err());
        al.enable();
        assert!(al.step(0.0, 0.0, sim.dt).is_ok());
    }

    #[test]
    fn test_network_step_moves_time_forward() {
        let params = ModelParams {
            topology: small_topo(),
            ..ModelParams::default()
        };
        let scale = Array2::from_elem((3, 3), 1.0);
        let sim = SimulationParams::default();
        let mut al = AntennalLobe::new(&params, scale.view(), &sim).unwrap();
        al.enable();
        for step in 0..1000 {
            let t = step as f64 * sim.dt;
            al.step(-5.0, t, sim.dt).unwrap();
        }
        // plastic conductances must still be within the sigmoid range
        for &g in &al.orn_pn1.g {
            assert!((0.0..=al.orn_pn1.params.gmax).contains(&g));
        }
    }
}
