//! # MEC-REPLICATE
//!
//! Lattice replication engine for MEC (Model Extender for COPASI).
//!
//! ## History
//!
//! The original MEC script by Pedro Mendes replicated one COPASI model over
//! a rows x columns grid, suffixing every element name with its unit index.
//! This crate generalizes the idea to lattices of 1, 2 or 3 axes, each
//! independently bounded or wrapped, with diffusive coupling between
//! neighboring units and seeded per-unit parameter noise.
//!
//! ## Pipeline
//!
//! 1. **Topology**: enumerate units and neighbor relations
//! 2. **Cloning**: one renamed copy of every element per unit
//! 3. **Coupling**: transport reactions or rate terms between neighbors
//! 4. **Noise**: seeded per-unit perturbation of selected values
//! 5. **Assembly**: one flat model carrying every unit
//!
//! The whole pipeline is driven by [`replicate`].

use mec_core::{
    expression_references, rewrite_expression, Compartment, EntityIndex, EntityKind, Event,
    EventAssignment, GlobalQuantity, KineticLaw, LocalParameter, Model, ModelError, Reaction,
    SimulationType, Species, SpeciesReference,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================

/// Errors in the replication setup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Lattice shape is empty")]
    EmptyShape,

    #[error("Lattice has {0} axes, at most 3 are supported")]
    TooManyAxes(usize),

    #[error("Axis {axis} has size 0")]
    ZeroAxis { axis: usize },

    #[error("Boundary list has {got} entries for {axes} axes")]
    BoundaryMismatch { got: usize, axes: usize },

    #[error("Lattice size overflows")]
    LatticeTooLarge,

    #[error("Transport target '{0}' is not in the model")]
    UnknownTransportTarget(String),

    #[error("Transport target '{id}' is a {kind}, only species and global quantities can be transported")]
    NotTransportable { id: String, kind: &'static str },

    #[error("Transport target '{id}' has {status} status, which cannot receive transport")]
    TransportStatus { id: String, status: &'static str },

    #[error("Transport target '{0}' appears more than once")]
    DuplicateTransportTarget(String),

    #[error("Transport rate {rate} for '{id}' must be finite and non-negative")]
    InvalidRate { id: String, rate: f64 },

    #[error("Per-axis rates for '{id}' have {got} entries for {axes} axes")]
    RateAxesMismatch { id: String, got: usize, axes: usize },

    #[error("Noise target '{0}' is not in the model")]
    UnknownNoiseTarget(String),

    #[error("Noise target '{target}' {reason}")]
    NoiseTargetNotFree { target: String, reason: String },

    #[error("Noise magnitude {magnitude} for '{target}' must be finite and non-negative")]
    InvalidMagnitude { target: String, magnitude: f64 },

    #[error("Identifier '{id}' is too long ({len} > {limit})")]
    IdTooLong { id: String, len: usize, limit: usize },

    #[error("Identifier '{id}' is not valid under the {style} style: {reason}")]
    InvalidGeneratedId {
        id: String,
        style: &'static str,
        reason: String,
    },

    #[error("Identifier '{0}' appears twice in the replicated model")]
    IdCollision(String),
}

/// Replication errors
#[derive(Debug, Error)]
pub enum ReplicateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Structural error: {0}")]
    Model(#[from] ModelError),
}

pub type Result<T> = std::result::Result<T, ReplicateError>;

// =============================================================================
// TOPOLOGY
// =============================================================================

/// Edge behavior of one lattice axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryMode {
    /// Units at the edge have no neighbor past it
    Bounded,
    /// The axis closes into a ring
    Wrapped,
}

impl Default for BoundaryMode {
    fn default() -> Self {
        BoundaryMode::Bounded
    }
}

/// Position of a unit on the lattice
///
/// Always stored with three components; axes beyond the lattice dimension
/// stay zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitCoord([usize; 3]);

impl UnitCoord {
    pub fn d1(i: usize) -> Self {
        Self([i, 0, 0])
    }

    pub fn d2(row: usize, col: usize) -> Self {
        Self([row, col, 0])
    }

    pub fn d3(row: usize, col: usize, layer: usize) -> Self {
        Self([row, col, layer])
    }

    pub fn axis(&self, axis: usize) -> usize {
        self.0[axis]
    }

    fn with_axis(mut self, axis: usize, value: usize) -> Self {
        self.0[axis] = value;
        self
    }
}

/// Step direction along one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Negative,
    Positive,
}

impl Direction {
    fn offset(self) -> i64 {
        match self {
            Direction::Negative => -1,
            Direction::Positive => 1,
        }
    }
}

/// One lattice unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Position in the flat enumeration order
    pub index: usize,
    pub coord: UnitCoord,
}

/// Rectangular lattice of replica units
///
/// Units are enumerated in row-major order with the last axis varying
/// fastest, matching the original rows-then-columns loop of MEC.
#[derive(Debug, Clone)]
pub struct Topology {
    shape: Vec<usize>,
    boundary: Vec<BoundaryMode>,
    units: Vec<Unit>,
}

impl Topology {
    /// Build a lattice from its shape and per-axis boundary modes
    ///
    /// An empty boundary list defaults every axis to bounded.
    pub fn new(shape: &[usize], boundary: &[BoundaryMode]) -> Result<Self> {
        if shape.is_empty() {
            return Err(ConfigError::EmptyShape.into());
        }
        if shape.len() > 3 {
            return Err(ConfigError::TooManyAxes(shape.len()).into());
        }
        for (axis, &n) in shape.iter().enumerate() {
            if n == 0 {
                return Err(ConfigError::ZeroAxis { axis }.into());
            }
        }
        let boundary = if boundary.is_empty() {
            vec![BoundaryMode::Bounded; shape.len()]
        } else if boundary.len() == shape.len() {
            boundary.to_vec()
        } else {
            return Err(ConfigError::BoundaryMismatch {
                got: boundary.len(),
                axes: shape.len(),
            }
            .into());
        };

        let count = shape
            .iter()
            .try_fold(1usize, |acc, &n| acc.checked_mul(n))
            .ok_or(ConfigError::LatticeTooLarge)?;

        let mut units = Vec::with_capacity(count);
        for index in 0..count {
            let mut rem = index;
            let mut coord = [0usize; 3];
            for axis in (0..shape.len()).rev() {
                coord[axis] = rem % shape[axis];
                rem /= shape[axis];
            }
            units.push(Unit {
                index,
                coord: UnitCoord(coord),
            });
        }

        Ok(Self {
            shape: shape.to_vec(),
            boundary,
            units,
        })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn boundary(&self) -> &[BoundaryMode] {
        &self.boundary
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// All units in enumeration order
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    /// Flat index of a coordinate
    pub fn linear_index(&self, coord: UnitCoord) -> usize {
        let mut index = 0;
        for axis in 0..self.shape.len() {
            index = index * self.shape[axis] + coord.axis(axis);
        }
        index
    }

    /// Neighbor one step along an axis, or None past a bounded edge
    ///
    /// An axis of size 1 never yields a neighbor, so wrapping cannot
    /// produce a self-loop.
    pub fn neighbor(&self, coord: UnitCoord, axis: usize, direction: Direction) -> Option<UnitCoord> {
        let n = self.shape[axis] as i64;
        if n == 1 {
            return None;
        }
        let raw = coord.axis(axis) as i64 + direction.offset();
        let resolved = match self.boundary[axis] {
            BoundaryMode::Bounded => {
                if raw < 0 || raw >= n {
                    return None;
                }
                raw
            }
            BoundaryMode::Wrapped => ((raw % n) + n) % n,
        };
        Some(coord.with_axis(axis, resolved as usize))
    }

    /// All neighbors of a coordinate, one entry per (axis, direction)
    ///
    /// On a wrapped axis of size 2 both directions reach the same unit and
    /// it is listed twice; deduplication is the caller's concern.
    pub fn neighbors(&self, coord: UnitCoord) -> Vec<(usize, Direction, UnitCoord)> {
        let mut out = Vec::new();
        for axis in 0..self.ndim() {
            for direction in [Direction::Negative, Direction::Positive] {
                if let Some(nb) = self.neighbor(coord, axis, direction) {
                    out.push((axis, direction, nb));
                }
            }
        }
        out
    }
}

// =============================================================================
// NAMING
// =============================================================================

/// Suffix style for replica element names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStyle {
    /// `_r_c` suffixes, safe for SBML-style identifiers
    Underscored,
    /// `_r,c` suffixes as shown in the COPASI interface
    GridDisplay,
}

impl Default for IdStyle {
    fn default() -> Self {
        IdStyle::Underscored
    }
}

/// Longest identifier the namer will accept
pub const MAX_ID_LEN: usize = 255;

/// Maps source element names to per-unit replica names
///
/// Suffix components are 1-based, one per lattice axis. The mapping is
/// injective for a fixed lattice: the unit coordinate is always
/// recoverable as the last `ndim` suffix groups.
#[derive(Debug, Clone)]
pub struct Namespacer {
    shape: Vec<usize>,
    style: IdStyle,
    pub max_len: usize,
}

impl Namespacer {
    pub fn new(topology: &Topology, style: IdStyle) -> Self {
        Self {
            shape: topology.shape().to_vec(),
            style,
            max_len: MAX_ID_LEN,
        }
    }

    pub fn style(&self) -> IdStyle {
        self.style
    }

    /// Suffix for a unit coordinate
    pub fn suffix(&self, coord: UnitCoord) -> String {
        match self.style {
            IdStyle::Underscored => {
                let mut s = String::new();
                for axis in 0..self.shape.len() {
                    s.push('_');
                    s.push_str(&(coord.axis(axis) + 1).to_string());
                }
                s
            }
            IdStyle::GridDisplay => {
                let parts: Vec<String> = (0..self.shape.len())
                    .map(|axis| (coord.axis(axis) + 1).to_string())
                    .collect();
                format!("_{}", parts.join(","))
            }
        }
    }

    /// Replica name for a source element in one unit
    pub fn rename(&self, id: &str, coord: UnitCoord) -> String {
        format!("{}{}", id, self.suffix(coord))
    }

    /// Identifier for a transport reaction moving `entity` between two units
    pub fn transport_id(&self, entity: &str, a: UnitCoord, b: UnitCoord) -> String {
        format!("t_{}{}", self.rename(entity, a), self.suffix(b))
    }

    /// Invert a replica name back to (source name, unit coordinate)
    ///
    /// Returns None if the name does not end in a suffix valid for this
    /// lattice.
    pub fn original(&self, renamed: &str) -> Option<(String, UnitCoord)> {
        let ndim = self.shape.len();
        let mut components = [0usize; 3];
        let rest = match self.style {
            IdStyle::Underscored => {
                let mut rest = renamed;
                for axis in (0..ndim).rev() {
                    let pos = rest.rfind('_')?;
                    components[axis] = parse_component(&rest[pos + 1..], self.shape[axis])?;
                    rest = &rest[..pos];
                }
                rest
            }
            IdStyle::GridDisplay => {
                let pos = renamed.rfind('_')?;
                let parts: Vec<&str> = renamed[pos + 1..].split(',').collect();
                if parts.len() != ndim {
                    return None;
                }
                for (axis, part) in parts.iter().enumerate() {
                    components[axis] = parse_component(part, self.shape[axis])?;
                }
                &renamed[..pos]
            }
        };
        if rest.is_empty() {
            return None;
        }
        Some((rest.to_string(), UnitCoord(components)))
    }

    /// Check that a generated identifier is acceptable under the style
    pub fn validate_id(&self, id: &str) -> std::result::Result<(), ConfigError> {
        if id.len() > self.max_len {
            return Err(ConfigError::IdTooLong {
                id: id.to_string(),
                len: id.len(),
                limit: self.max_len,
            });
        }
        match self.style {
            IdStyle::Underscored => {
                let mut chars = id.chars();
                let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
                let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
                if !(head_ok && tail_ok) {
                    return Err(ConfigError::InvalidGeneratedId {
                        id: id.to_string(),
                        style: "underscored",
                        reason: "must match [A-Za-z_][A-Za-z0-9_]*".to_string(),
                    });
                }
            }
            IdStyle::GridDisplay => {
                if id.is_empty() {
                    return Err(ConfigError::InvalidGeneratedId {
                        id: id.to_string(),
                        style: "grid display",
                        reason: "empty".to_string(),
                    });
                }
                if id
                    .chars()
                    .any(|c| c.is_control() || matches!(c, '[' | ']' | '"' | ';'))
                {
                    return Err(ConfigError::InvalidGeneratedId {
                        id: id.to_string(),
                        style: "grid display",
                        reason: "contains brackets, quotes, semicolons or control characters"
                            .to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Parse a 1-based suffix component, bounded by the axis size
fn parse_component(digits: &str, axis_size: usize) -> Option<usize> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: usize = digits.parse().ok()?;
    if value < 1 || value > axis_size {
        return None;
    }
    Some(value - 1)
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Diffusive rate constant, shared or per axis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportRate {
    Uniform(f64),
    PerAxis(Vec<f64>),
}

impl TransportRate {
    pub fn along(&self, axis: usize) -> f64 {
        match self {
            TransportRate::Uniform(k) => *k,
            TransportRate::PerAxis(ks) => ks.get(axis).copied().unwrap_or(0.0),
        }
    }
}

impl From<f64> for TransportRate {
    fn from(k: f64) -> Self {
        TransportRate::Uniform(k)
    }
}

/// Couple one species or global quantity across neighboring units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSpec {
    pub entity: String,
    pub rate: TransportRate,
}

impl TransportSpec {
    pub fn new(entity: &str, rate: f64) -> Self {
        Self {
            entity: entity.to_string(),
            rate: TransportRate::Uniform(rate),
        }
    }
}

/// Value a noise spec perturbs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseTarget {
    GlobalQuantity(String),
    CompartmentSize(String),
    SpeciesConcentration(String),
    LocalParameter { reaction: String, parameter: String },
}

impl fmt::Display for NoiseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoiseTarget::GlobalQuantity(id)
            | NoiseTarget::CompartmentSize(id)
            | NoiseTarget::SpeciesConcentration(id) => write!(f, "{id}"),
            NoiseTarget::LocalParameter {
                reaction,
                parameter,
            } => write!(f, "{reaction}.{parameter}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseDistribution {
    /// Uniform on [-magnitude, +magnitude]
    Uniform,
    /// Normal with standard deviation `magnitude`
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseMode {
    /// value * (1 + sample)
    Relative,
    /// value + sample
    Absolute,
}

/// Perturb one value independently in every unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseSpec {
    pub target: NoiseTarget,
    pub distribution: NoiseDistribution,
    pub magnitude: f64,
    pub mode: NoiseMode,
}

impl NoiseSpec {
    pub fn uniform(target: NoiseTarget, magnitude: f64, mode: NoiseMode) -> Self {
        Self {
            target,
            distribution: NoiseDistribution::Uniform,
            magnitude,
            mode,
        }
    }

    pub fn normal(target: NoiseTarget, magnitude: f64, mode: NoiseMode) -> Self {
        Self {
            target,
            distribution: NoiseDistribution::Normal,
            magnitude,
            mode,
        }
    }
}

/// Everything [`replicate`] needs besides the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub shape: Vec<usize>,
    /// Per-axis boundary modes; empty means all bounded
    #[serde(default)]
    pub boundary: Vec<BoundaryMode>,
    #[serde(default)]
    pub id_style: IdStyle,
    #[serde(default)]
    pub transport: Vec<TransportSpec>,
    #[serde(default)]
    pub noise: Vec<NoiseSpec>,
    #[serde(default)]
    pub seed: u64,
}

impl ReplicationConfig {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            boundary: Vec::new(),
            id_style: IdStyle::default(),
            transport: Vec::new(),
            noise: Vec::new(),
            seed: 0,
        }
    }
}

// =============================================================================
// PREFLIGHT VALIDATION
// =============================================================================

/// Check every generated name at the worst-case coordinate
///
/// The last unit carries the longest suffix, so one pass over it bounds
/// the whole lattice.
fn preflight_ids(model: &Model, topology: &Topology, ns: &Namespacer) -> Result<()> {
    let worst = topology.units()[topology.unit_count() - 1].coord;
    for c in &model.compartments {
        ns.validate_id(&ns.rename(&c.id, worst))?;
    }
    for s in &model.species {
        ns.validate_id(&ns.rename(&s.id, worst))?;
    }
    for g in &model.global_quantities {
        ns.validate_id(&ns.rename(&g.id, worst))?;
    }
    for r in &model.reactions {
        ns.validate_id(&ns.rename(&r.id, worst))?;
    }
    for e in &model.events {
        ns.validate_id(&ns.rename(&e.id, worst))?;
    }
    Ok(())
}

fn validate_transport(
    model: &Model,
    index: &EntityIndex,
    topology: &Topology,
    ns: &Namespacer,
    specs: &[TransportSpec],
) -> Result<()> {
    let ndim = topology.ndim();
    let worst = topology.units()[topology.unit_count() - 1].coord;
    let mut seen = HashSet::new();

    for spec in specs {
        if !seen.insert(spec.entity.as_str()) {
            return Err(ConfigError::DuplicateTransportTarget(spec.entity.clone()).into());
        }
        match &spec.rate {
            TransportRate::Uniform(k) => check_rate(&spec.entity, *k)?,
            TransportRate::PerAxis(ks) => {
                if ks.len() != ndim {
                    return Err(ConfigError::RateAxesMismatch {
                        id: spec.entity.clone(),
                        got: ks.len(),
                        axes: ndim,
                    }
                    .into());
                }
                for &k in ks {
                    check_rate(&spec.entity, k)?;
                }
            }
        }
        match index.kind(&spec.entity) {
            Some(EntityKind::Species) => {
                let species = model
                    .get_species(&spec.entity)
                    .ok_or_else(|| ConfigError::UnknownTransportTarget(spec.entity.clone()))?;
                if species.status != SimulationType::Reactions {
                    return Err(ConfigError::TransportStatus {
                        id: spec.entity.clone(),
                        status: species.status.label(),
                    }
                    .into());
                }
                ns.validate_id(&ns.transport_id(&spec.entity, worst, worst))?;
            }
            Some(EntityKind::GlobalQuantity) => {
                let quantity = model
                    .get_global_quantity(&spec.entity)
                    .ok_or_else(|| ConfigError::UnknownTransportTarget(spec.entity.clone()))?;
                match quantity.status {
                    SimulationType::Fixed | SimulationType::Ode => {}
                    status => {
                        return Err(ConfigError::TransportStatus {
                            id: spec.entity.clone(),
                            status: status.label(),
                        }
                        .into())
                    }
                }
            }
            Some(kind) => {
                return Err(ConfigError::NotTransportable {
                    id: spec.entity.clone(),
                    kind: kind.label(),
                }
                .into())
            }
            None => return Err(ConfigError::UnknownTransportTarget(spec.entity.clone()).into()),
        }
    }
    Ok(())
}

fn check_rate(id: &str, rate: f64) -> Result<()> {
    if !rate.is_finite() || rate < 0.0 {
        return Err(ConfigError::InvalidRate {
            id: id.to_string(),
            rate,
        }
        .into());
    }
    Ok(())
}

/// Noise target resolved to positions in the source element lists
enum NoiseSlot {
    Global(usize),
    Compartment(usize),
    Species(usize),
    Local { reaction: usize, parameter: usize },
}

struct ResolvedNoise {
    slot: NoiseSlot,
    distribution: NoiseDistribution,
    magnitude: f64,
    mode: NoiseMode,
}

fn validate_noise(model: &Model, specs: &[NoiseSpec]) -> Result<Vec<ResolvedNoise>> {
    let mut resolved = Vec::with_capacity(specs.len());
    for spec in specs {
        if !spec.magnitude.is_finite() || spec.magnitude < 0.0 {
            return Err(ConfigError::InvalidMagnitude {
                target: spec.target.to_string(),
                magnitude: spec.magnitude,
            }
            .into());
        }
        let slot = match &spec.target {
            NoiseTarget::GlobalQuantity(id) => {
                let (i, g) = model
                    .global_quantities
                    .iter()
                    .enumerate()
                    .find(|(_, g)| g.id == *id)
                    .ok_or_else(|| ConfigError::UnknownNoiseTarget(id.clone()))?;
                check_free(&spec.target, g.status, g.initial_expression.as_deref())?;
                NoiseSlot::Global(i)
            }
            NoiseTarget::CompartmentSize(id) => {
                let (i, c) = model
                    .compartments
                    .iter()
                    .enumerate()
                    .find(|(_, c)| c.id == *id)
                    .ok_or_else(|| ConfigError::UnknownNoiseTarget(id.clone()))?;
                check_free(&spec.target, c.status, c.initial_expression.as_deref())?;
                NoiseSlot::Compartment(i)
            }
            NoiseTarget::SpeciesConcentration(id) => {
                let (i, s) = model
                    .species
                    .iter()
                    .enumerate()
                    .find(|(_, s)| s.id == *id)
                    .ok_or_else(|| ConfigError::UnknownNoiseTarget(id.clone()))?;
                check_free(&spec.target, s.status, s.initial_expression.as_deref())?;
                NoiseSlot::Species(i)
            }
            NoiseTarget::LocalParameter {
                reaction,
                parameter,
            } => {
                let (ri, r) = model
                    .reactions
                    .iter()
                    .enumerate()
                    .find(|(_, r)| r.id == *reaction)
                    .ok_or_else(|| ConfigError::UnknownNoiseTarget(spec.target.to_string()))?;
                let pi = r
                    .local_parameters
                    .iter()
                    .position(|lp| lp.id == *parameter)
                    .ok_or_else(|| ConfigError::UnknownNoiseTarget(spec.target.to_string()))?;
                NoiseSlot::Local {
                    reaction: ri,
                    parameter: pi,
                }
            }
        };
        resolved.push(ResolvedNoise {
            slot,
            distribution: spec.distribution,
            magnitude: spec.magnitude,
            mode: spec.mode,
        });
    }
    Ok(resolved)
}

/// A noise target must be a plain number, not a computed value
fn check_free(
    target: &NoiseTarget,
    status: SimulationType,
    initial_expression: Option<&str>,
) -> Result<()> {
    if status == SimulationType::Assignment {
        return Err(ConfigError::NoiseTargetNotFree {
            target: target.to_string(),
            reason: "has assignment status".to_string(),
        }
        .into());
    }
    if initial_expression.is_some() {
        return Err(ConfigError::NoiseTargetNotFree {
            target: target.to_string(),
            reason: "has an initial expression".to_string(),
        }
        .into());
    }
    Ok(())
}

// =============================================================================
// CLONING
// =============================================================================

/// All clones belonging to one unit
struct UnitEntities {
    compartments: Vec<Compartment>,
    species: Vec<Species>,
    global_quantities: Vec<GlobalQuantity>,
    reactions: Vec<Reaction>,
    events: Vec<Event>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventClass {
    /// Trigger touches model elements, so each unit gets its own copy
    PerUnit,
    /// Trigger is time-only; one copy fans its assignments over all units
    Shared,
}

fn classify_events(model: &Model, index: &EntityIndex) -> Result<Vec<EventClass>> {
    model
        .events
        .iter()
        .map(|e| {
            let mut refs = expression_references(&e.trigger)?;
            if let Some(delay) = &e.delay {
                refs.extend(expression_references(delay)?);
            }
            let touches_model = refs.iter().any(|r| index.kind(&r.name).is_some());
            Ok(if touches_model {
                EventClass::PerUnit
            } else {
                EventClass::Shared
            })
        })
        .collect()
}

/// Renames one source element into one unit
struct UnitRenamer<'a> {
    index: &'a EntityIndex,
    ns: &'a Namespacer,
    coord: UnitCoord,
}

impl UnitRenamer<'_> {
    fn id(&self, id: &str) -> String {
        self.ns.rename(id, self.coord)
    }

    fn expr(&self, referrer: &str, expr: &str) -> Result<String> {
        Ok(rewrite_expression(expr, referrer, |name| {
            self.index.kind(name).map(|_| self.id(name))
        })?)
    }

    fn expr_with_locals(
        &self,
        referrer: &str,
        locals: &[LocalParameter],
        expr: &str,
    ) -> Result<String> {
        Ok(rewrite_expression(expr, referrer, |name| {
            // Reaction-local parameters shadow model elements and keep
            // their name inside the cloned reaction.
            if locals.iter().any(|lp| lp.id == name) {
                None
            } else {
                self.index.kind(name).map(|_| self.id(name))
            }
        })?)
    }

    fn opt_expr(&self, referrer: &str, expr: &Option<String>) -> Result<Option<String>> {
        match expr {
            Some(e) => Ok(Some(self.expr(referrer, e)?)),
            None => Ok(None),
        }
    }

    /// Kinetic law binding: locals stay, model elements get the suffix
    fn binding(&self, locals: &[LocalParameter], name: &str) -> String {
        if locals.iter().any(|lp| lp.id == name) || !self.index.contains(name) {
            name.to_string()
        } else {
            self.id(name)
        }
    }

    fn compartment(&self, c: &Compartment) -> Result<Compartment> {
        let referrer = format!("compartment '{}'", c.id);
        Ok(Compartment {
            id: self.id(&c.id),
            status: c.status,
            initial_size: c.initial_size,
            initial_expression: self.opt_expr(&referrer, &c.initial_expression)?,
            expression: self.opt_expr(&referrer, &c.expression)?,
            dimensionality: c.dimensionality,
            unit: c.unit.clone(),
        })
    }

    fn species(&self, s: &Species) -> Result<Species> {
        let referrer = format!("species '{}'", s.id);
        Ok(Species {
            id: self.id(&s.id),
            compartment: self.id(&s.compartment),
            status: s.status,
            initial_concentration: s.initial_concentration,
            initial_expression: self.opt_expr(&referrer, &s.initial_expression)?,
            expression: self.opt_expr(&referrer, &s.expression)?,
            unit: s.unit.clone(),
        })
    }

    fn global_quantity(&self, g: &GlobalQuantity) -> Result<GlobalQuantity> {
        let referrer = format!("global quantity '{}'", g.id);
        Ok(GlobalQuantity {
            id: self.id(&g.id),
            status: g.status,
            initial_value: g.initial_value,
            initial_expression: self.opt_expr(&referrer, &g.initial_expression)?,
            expression: self.opt_expr(&referrer, &g.expression)?,
            unit: g.unit.clone(),
        })
    }

    fn reaction(&self, r: &Reaction) -> Result<Reaction> {
        let referrer = format!("reaction '{}'", r.id);
        let rename_refs = |refs: &[SpeciesReference]| {
            refs.iter()
                .map(|sr| SpeciesReference::new(&self.id(&sr.species), sr.stoichiometry))
                .collect()
        };
        let kinetic_law = match &r.kinetic_law {
            KineticLaw::MassAction { rate_constant } => KineticLaw::MassAction {
                rate_constant: self.binding(&r.local_parameters, rate_constant),
            },
            KineticLaw::MassActionReversible { kf, kr } => KineticLaw::MassActionReversible {
                kf: self.binding(&r.local_parameters, kf),
                kr: self.binding(&r.local_parameters, kr),
            },
            KineticLaw::MichaelisMenten {
                vmax,
                km,
                substrate,
            } => KineticLaw::MichaelisMenten {
                vmax: self.binding(&r.local_parameters, vmax),
                km: self.binding(&r.local_parameters, km),
                substrate: self.id(substrate),
            },
            KineticLaw::Hill {
                vmax,
                k,
                substrate,
                n,
            } => KineticLaw::Hill {
                vmax: self.binding(&r.local_parameters, vmax),
                k: self.binding(&r.local_parameters, k),
                substrate: self.id(substrate),
                n: *n,
            },
            KineticLaw::Custom(expr) => {
                KineticLaw::Custom(self.expr_with_locals(&referrer, &r.local_parameters, expr)?)
            }
        };
        Ok(Reaction {
            id: self.id(&r.id),
            reversible: r.reversible,
            reactants: rename_refs(&r.reactants),
            products: rename_refs(&r.products),
            modifiers: r.modifiers.iter().map(|m| self.id(m)).collect(),
            kinetic_law,
            local_parameters: r.local_parameters.clone(),
        })
    }

    fn event(&self, e: &Event) -> Result<Event> {
        let referrer = format!("event '{}'", e.id);
        Ok(Event {
            id: self.id(&e.id),
            trigger: self.expr(&referrer, &e.trigger)?,
            delay: self.opt_expr(&referrer, &e.delay)?,
            assignments: e
                .assignments
                .iter()
                .map(|a| {
                    Ok(EventAssignment {
                        target: self.id(&a.target),
                        expression: self.expr(&referrer, &a.expression)?,
                    })
                })
                .collect::<Result<_>>()?,
        })
    }
}

fn clone_unit(
    model: &Model,
    index: &EntityIndex,
    ns: &Namespacer,
    coord: UnitCoord,
    classes: &[EventClass],
) -> Result<UnitEntities> {
    let renamer = UnitRenamer { index, ns, coord };
    Ok(UnitEntities {
        compartments: model
            .compartments
            .iter()
            .map(|c| renamer.compartment(c))
            .collect::<Result<_>>()?,
        species: model
            .species
            .iter()
            .map(|s| renamer.species(s))
            .collect::<Result<_>>()?,
        global_quantities: model
            .global_quantities
            .iter()
            .map(|g| renamer.global_quantity(g))
            .collect::<Result<_>>()?,
        reactions: model
            .reactions
            .iter()
            .map(|r| renamer.reaction(r))
            .collect::<Result<_>>()?,
        events: model
            .events
            .iter()
            .zip(classes)
            .filter(|(_, class)| **class == EventClass::PerUnit)
            .map(|(e, _)| renamer.event(e))
            .collect::<Result<_>>()?,
    })
}

// =============================================================================
// COUPLING
// =============================================================================

/// Rate-rule coupling between two replicas of a global quantity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalCoupling {
    pub entity: String,
    pub unit_a: UnitCoord,
    pub unit_b: UnitCoord,
    pub id_a: String,
    pub id_b: String,
    pub rate: f64,
}

/// Build one coupling per (unordered neighbor pair, transported entity)
///
/// Pairs are discovered by walking every unit in the positive direction of
/// each axis; a normalized index pair guards against counting a wrapped
/// edge twice (a ring of size 2 has one edge, not two).
fn wire(
    topology: &Topology,
    ns: &Namespacer,
    index: &EntityIndex,
    transport: &[TransportSpec],
) -> Result<(Vec<Reaction>, Vec<GlobalCoupling>)> {
    let mut reactions = Vec::new();
    let mut couplings = Vec::new();

    for spec in transport {
        let kind = index
            .kind(&spec.entity)
            .ok_or_else(|| ConfigError::UnknownTransportTarget(spec.entity.clone()))?;
        let mut seen: HashSet<(usize, usize)> = HashSet::new();

        for unit in topology.units() {
            for axis in 0..topology.ndim() {
                let rate = spec.rate.along(axis);
                if rate == 0.0 {
                    continue;
                }
                let nb = match topology.neighbor(unit.coord, axis, Direction::Positive) {
                    Some(nb) => nb,
                    None => continue,
                };
                let j = topology.linear_index(nb);
                if !seen.insert((unit.index.min(j), unit.index.max(j))) {
                    continue;
                }
                // Orient the pair low to high index so output is stable
                let (a, b) = if unit.index <= j {
                    (unit.coord, nb)
                } else {
                    (nb, unit.coord)
                };
                match kind {
                    EntityKind::Species => {
                        reactions.push(transport_reaction(ns, &spec.entity, a, b, rate))
                    }
                    EntityKind::GlobalQuantity => couplings.push(GlobalCoupling {
                        entity: spec.entity.clone(),
                        unit_a: a,
                        unit_b: b,
                        id_a: ns.rename(&spec.entity, a),
                        id_b: ns.rename(&spec.entity, b),
                        rate,
                    }),
                    kind => {
                        return Err(ConfigError::NotTransportable {
                            id: spec.entity.clone(),
                            kind: kind.label(),
                        }
                        .into())
                    }
                }
            }
        }
    }
    Ok((reactions, couplings))
}

/// Reversible A_unit <-> A_neighbor reaction with equal rate constants
fn transport_reaction(
    ns: &Namespacer,
    entity: &str,
    a: UnitCoord,
    b: UnitCoord,
    rate: f64,
) -> Reaction {
    Reaction {
        id: ns.transport_id(entity, a, b),
        reversible: true,
        reactants: vec![SpeciesReference::new(&ns.rename(entity, a), 1.0)],
        products: vec![SpeciesReference::new(&ns.rename(entity, b), 1.0)],
        modifiers: Vec::new(),
        kinetic_law: KineticLaw::MassActionReversible {
            kf: "kf".to_string(),
            kr: "kr".to_string(),
        },
        local_parameters: vec![
            LocalParameter::new("kf", rate),
            LocalParameter::new("kr", rate),
        ],
    }
}

// =============================================================================
// NOISE
// =============================================================================

/// Perturb resolved targets in every unit, spec-major then unit order
///
/// One value is drawn per (spec, unit) regardless of magnitude, so adding
/// or removing a spec never shifts the draws of the ones before it.
fn apply_noise(clones: &mut [UnitEntities], resolved: &[ResolvedNoise], seed: u64) {
    if resolved.is_empty() {
        return;
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for noise in resolved {
        for bundle in clones.iter_mut() {
            let sample = draw(&mut rng, noise.distribution, noise.magnitude);
            let value = match noise.slot {
                NoiseSlot::Global(i) => &mut bundle.global_quantities[i].initial_value,
                NoiseSlot::Compartment(i) => &mut bundle.compartments[i].initial_size,
                NoiseSlot::Species(i) => &mut bundle.species[i].initial_concentration,
                NoiseSlot::Local {
                    reaction,
                    parameter,
                } => &mut bundle.reactions[reaction].local_parameters[parameter].value,
            };
            match noise.mode {
                NoiseMode::Relative => *value *= 1.0 + sample,
                NoiseMode::Absolute => *value += sample,
            }
        }
    }
}

fn draw(rng: &mut ChaCha8Rng, distribution: NoiseDistribution, magnitude: f64) -> f64 {
    match distribution {
        NoiseDistribution::Uniform => rng.gen_range(-magnitude..=magnitude),
        NoiseDistribution::Normal => {
            // Box-Muller transform; 1 - u keeps the logarithm away from 0
            let u1: f64 = 1.0 - rng.gen::<f64>();
            let u2: f64 = rng.gen();
            magnitude * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
        }
    }
}

// =============================================================================
// ASSEMBLY
// =============================================================================

/// One renamed element of one unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameEntry {
    pub unit: usize,
    pub original: String,
    pub renamed: String,
}

/// Result of replicating a model over a lattice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatedModel {
    /// All unit clones assembled into one model, couplings not yet merged
    pub model: Model,
    /// MEC-style lattice description, e.g. "a set of 6 (2x3) replicas"
    pub description: String,
    /// Transport reactions between neighboring species replicas
    pub coupling_reactions: Vec<Reaction>,
    /// Rate-rule couplings between neighboring global quantity replicas
    pub global_couplings: Vec<GlobalCoupling>,
    /// Who became what, unit-major in enumeration order
    pub id_map: Vec<RenameEntry>,
}

impl ReplicatedModel {
    /// Merge couplings into the model, yielding the final flat network
    ///
    /// Transport reactions are appended after all unit reactions. Global
    /// couplings become accumulated `rate * ([other] - [this])` terms on
    /// the rate expression of each endpoint, switching fixed quantities to
    /// ODE status.
    pub fn into_model(self) -> Model {
        let mut model = self.model;
        model.reactions.extend(self.coupling_reactions);

        let mut terms: HashMap<String, Vec<String>> = HashMap::new();
        for c in &self.global_couplings {
            terms
                .entry(c.id_a.clone())
                .or_default()
                .push(format!("{} * ([{}] - [{}])", c.rate, c.id_b, c.id_a));
            terms
                .entry(c.id_b.clone())
                .or_default()
                .push(format!("{} * ([{}] - [{}])", c.rate, c.id_a, c.id_b));
        }
        for g in model.global_quantities.iter_mut() {
            if let Some(list) = terms.remove(&g.id) {
                let added = list.join(" + ");
                g.expression = Some(match (g.status, g.expression.take()) {
                    (SimulationType::Ode, Some(expr)) => format!("{expr} + {added}"),
                    _ => added,
                });
                g.status = SimulationType::Ode;
            }
        }
        model
    }
}

/// MEC-style description of the lattice, used in names and notes
fn replica_description(topology: &Topology) -> String {
    let n = topology.unit_count();
    let shape = topology.shape();
    if shape.len() == 1 {
        format!("a set of {n} replicas")
    } else {
        let dims: Vec<String> = shape.iter().map(|s| s.to_string()).collect();
        format!("a set of {n} ({}) replicas", dims.join("x"))
    }
}

/// Append the processing note, inside the XHTML body when there is one
fn annotate_notes(original: Option<&str>, desc: &str, source: &str) -> String {
    let stamp = format!("Processed with MEC to produce {desc} of {source}");
    match original {
        None | Some("") => format!(
            "<body xmlns=\"http://www.w3.org/1999/xhtml\"><p><br/></p><hr/><p>{stamp}</p></body>"
        ),
        Some(notes) => match notes.find("</body>") {
            None => format!("{notes}\n\n{stamp}"),
            Some(index) => {
                let (head, tail) = notes.split_at(index);
                format!("{head}<hr/><p>{stamp}</p>{tail}")
            }
        },
    }
}

/// One copy of each time-only event, assignments fanned out over all units
fn fan_out_time_events(
    model: &Model,
    classes: &[EventClass],
    topology: &Topology,
    ns: &Namespacer,
    index: &EntityIndex,
) -> Result<Vec<Event>> {
    let mut out = Vec::new();
    for (e, class) in model.events.iter().zip(classes) {
        if *class != EventClass::Shared {
            continue;
        }
        let referrer = format!("event '{}'", e.id);
        let mut event = Event {
            id: e.id.clone(),
            trigger: e.trigger.clone(),
            delay: e.delay.clone(),
            assignments: Vec::new(),
        };
        for unit in topology.units() {
            let renamer = UnitRenamer {
                index,
                ns,
                coord: unit.coord,
            };
            for a in &e.assignments {
                event.assignments.push(EventAssignment {
                    target: renamer.id(&a.target),
                    expression: renamer.expr(&referrer, &a.expression)?,
                });
            }
        }
        out.push(event);
    }
    Ok(out)
}

/// Flatten unit clones into one model, element lists unit-major per class
fn assemble(
    source: &Model,
    clones: Vec<UnitEntities>,
    shared_events: Vec<Event>,
    desc: &str,
) -> Model {
    let mut model = Model::new(&format!("{desc} of {}", source.name));
    model.notes = Some(annotate_notes(source.notes.as_deref(), desc, &source.name));
    model.units = source.units.clone();

    for bundle in clones {
        model.compartments.extend(bundle.compartments);
        model.species.extend(bundle.species);
        model.global_quantities.extend(bundle.global_quantities);
        model.reactions.extend(bundle.reactions);
        model.events.extend(bundle.events);
    }
    model.events.extend(shared_events);
    model
}

fn build_id_map(
    model: &Model,
    topology: &Topology,
    ns: &Namespacer,
    classes: &[EventClass],
) -> Vec<RenameEntry> {
    let mut map = Vec::new();
    for unit in topology.units() {
        let mut push = |original: &str| {
            map.push(RenameEntry {
                unit: unit.index,
                original: original.to_string(),
                renamed: ns.rename(original, unit.coord),
            })
        };
        for c in &model.compartments {
            push(&c.id);
        }
        for s in &model.species {
            push(&s.id);
        }
        for g in &model.global_quantities {
            push(&g.id);
        }
        for r in &model.reactions {
            push(&r.id);
        }
        for (e, class) in model.events.iter().zip(classes) {
            if *class == EventClass::PerUnit {
                push(&e.id);
            }
        }
    }
    map
}

/// Every identifier in the output must be unique, coupling reactions
/// included
fn check_unique(model: &Model, coupling_reactions: &[Reaction]) -> Result<()> {
    let ids = model
        .compartments
        .iter()
        .map(|c| c.id.as_str())
        .chain(model.species.iter().map(|s| s.id.as_str()))
        .chain(model.global_quantities.iter().map(|g| g.id.as_str()))
        .chain(model.reactions.iter().map(|r| r.id.as_str()))
        .chain(model.events.iter().map(|e| e.id.as_str()))
        .chain(coupling_reactions.iter().map(|r| r.id.as_str()));

    let mut seen: HashSet<&str> = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ConfigError::IdCollision(id.to_string()).into());
        }
    }
    Ok(())
}

// =============================================================================
// REPLICATION
// =============================================================================

/// Replicate a model over a lattice of coupled units
///
/// The source model is validated first, every generated name is checked
/// against the identifier style, and unit cloning runs in parallel. The
/// output keeps couplings and the rename map separate; call
/// [`ReplicatedModel::into_model`] for the final flat model.
pub fn replicate(model: &Model, config: &ReplicationConfig) -> Result<ReplicatedModel> {
    let topology = Topology::new(&config.shape, &config.boundary)?;
    model.validate()?;
    let index = EntityIndex::build(model)?;
    let ns = Namespacer::new(&topology, config.id_style);

    preflight_ids(model, &topology, &ns)?;
    validate_transport(model, &index, &topology, &ns, &config.transport)?;
    let resolved_noise = validate_noise(model, &config.noise)?;
    let classes = classify_events(model, &index)?;

    let mut clones = topology
        .units()
        .par_iter()
        .map(|unit| clone_unit(model, &index, &ns, unit.coord, &classes))
        .collect::<Result<Vec<_>>>()?;

    apply_noise(&mut clones, &resolved_noise, config.seed);

    let (coupling_reactions, global_couplings) = wire(&topology, &ns, &index, &config.transport)?;
    let shared_events = fan_out_time_events(model, &classes, &topology, &ns, &index)?;

    let description = replica_description(&topology);
    let assembled = assemble(model, clones, shared_events, &description);
    check_unique(&assembled, &coupling_reactions)?;

    let id_map = build_id_map(model, &topology, &ns, &classes);

    Ok(ReplicatedModel {
        model: assembled,
        description,
        coupling_reactions,
        global_couplings,
        id_map,
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mec_core::models;

    fn bounded(shape: &[usize]) -> Topology {
        Topology::new(shape, &[]).unwrap()
    }

    fn wrapped(shape: &[usize]) -> Topology {
        let boundary = vec![BoundaryMode::Wrapped; shape.len()];
        Topology::new(shape, &boundary).unwrap()
    }

    /// One compartment, one diffusible species, one decay reaction
    fn diffusion_seed() -> Model {
        let mut model = Model::new("DiffusionSeed");
        model.add_compartment(Compartment::new("cell", 1.0));
        model.add_species(Species::new("S", "cell", 10.0));
        model.add_global_quantity(GlobalQuantity::new("kdeg", 0.1));
        let mut decay = Reaction::mass_action("decay", "S", "S", "kdeg");
        decay.products.clear();
        model.add_reaction(decay);
        model
    }

    #[test]
    fn test_topology_1d_bounded_edges() {
        let topo = bounded(&[4]);
        assert_eq!(topo.unit_count(), 4);
        let first = topo.units()[0].coord;
        let last = topo.units()[3].coord;
        assert!(topo.neighbor(first, 0, Direction::Negative).is_none());
        assert_eq!(
            topo.neighbor(first, 0, Direction::Positive),
            Some(UnitCoord::d1(1))
        );
        assert!(topo.neighbor(last, 0, Direction::Positive).is_none());
        assert_eq!(topo.neighbors(first).len(), 1);
        assert_eq!(topo.neighbors(topo.units()[1].coord).len(), 2);
    }

    #[test]
    fn test_topology_wrapped_ring() {
        let topo = wrapped(&[3]);
        let last = topo.units()[2].coord;
        assert_eq!(
            topo.neighbor(last, 0, Direction::Positive),
            Some(UnitCoord::d1(0))
        );
        assert_eq!(
            topo.neighbor(topo.units()[0].coord, 0, Direction::Negative),
            Some(UnitCoord::d1(2))
        );
        for unit in topo.units() {
            assert_eq!(topo.neighbors(unit.coord).len(), 2);
        }
    }

    #[test]
    fn test_topology_wrapped_two_by_two() {
        let topo = wrapped(&[2, 2]);
        for unit in topo.units() {
            let nbs = topo.neighbors(unit.coord);
            // Both directions of each size-2 axis land on the same unit
            assert_eq!(nbs.len(), 4);
            let distinct: HashSet<_> = nbs.iter().map(|(_, _, c)| *c).collect();
            assert_eq!(distinct.len(), 2);
            assert!(!distinct.contains(&unit.coord));
        }
    }

    #[test]
    fn test_topology_size_one_axis_has_no_neighbors() {
        let topo = wrapped(&[1]);
        assert!(topo.neighbors(topo.units()[0].coord).is_empty());
    }

    #[test]
    fn test_topology_3d_enumeration_order() {
        let topo = bounded(&[2, 2, 2]);
        assert_eq!(topo.unit_count(), 8);
        // Last axis varies fastest
        assert_eq!(topo.units()[0].coord, UnitCoord::d3(0, 0, 0));
        assert_eq!(topo.units()[1].coord, UnitCoord::d3(0, 0, 1));
        assert_eq!(topo.units()[2].coord, UnitCoord::d3(0, 1, 0));
        assert_eq!(topo.units()[4].coord, UnitCoord::d3(1, 0, 0));
        for unit in topo.units() {
            assert_eq!(topo.linear_index(unit.coord), unit.index);
        }
    }

    #[test]
    fn test_topology_rejects_bad_shapes() {
        assert!(matches!(
            Topology::new(&[], &[]),
            Err(ReplicateError::Config(ConfigError::EmptyShape))
        ));
        assert!(matches!(
            Topology::new(&[2, 0], &[]),
            Err(ReplicateError::Config(ConfigError::ZeroAxis { axis: 1 }))
        ));
        assert!(matches!(
            Topology::new(&[2, 2, 2, 2], &[]),
            Err(ReplicateError::Config(ConfigError::TooManyAxes(4)))
        ));
        assert!(matches!(
            Topology::new(&[2, 2], &[BoundaryMode::Wrapped]),
            Err(ReplicateError::Config(ConfigError::BoundaryMismatch {
                got: 1,
                axes: 2
            }))
        ));
    }

    #[test]
    fn test_suffix_styles() {
        let topo = bounded(&[3, 4]);
        let under = Namespacer::new(&topo, IdStyle::Underscored);
        let display = Namespacer::new(&topo, IdStyle::GridDisplay);
        let coord = UnitCoord::d2(1, 3);
        assert_eq!(under.rename("S", coord), "S_2_4");
        assert_eq!(display.rename("S", coord), "S_2,4");

        let line = bounded(&[5]);
        let linear = Namespacer::new(&line, IdStyle::GridDisplay);
        assert_eq!(linear.rename("S", UnitCoord::d1(4)), "S_5");
    }

    #[test]
    fn test_rename_is_invertible() {
        let topo = bounded(&[3, 4]);
        for style in [IdStyle::Underscored, IdStyle::GridDisplay] {
            let ns = Namespacer::new(&topo, style);
            for unit in topo.units() {
                let renamed = ns.rename("S_1", unit.coord);
                assert_eq!(ns.original(&renamed), Some(("S_1".to_string(), unit.coord)));
            }
        }
    }

    #[test]
    fn test_original_rejects_foreign_names() {
        let topo = bounded(&[3]);
        let ns = Namespacer::new(&topo, IdStyle::Underscored);
        assert_eq!(ns.original("S"), None);
        assert_eq!(ns.original("S_0"), None); // suffixes are 1-based
        assert_eq!(ns.original("S_9"), None); // out of range
        assert_eq!(ns.original("_2"), None); // nothing left of the suffix
    }

    #[test]
    fn test_validate_id_styles() {
        let topo = bounded(&[2]);
        let under = Namespacer::new(&topo, IdStyle::Underscored);
        assert!(under.validate_id("S_1").is_ok());
        assert!(under.validate_id("S P_1").is_err());
        assert!(under.validate_id("2S").is_err());

        let display = Namespacer::new(&topo, IdStyle::GridDisplay);
        assert!(display.validate_id("S P_1,2").is_ok());
        assert!(display.validate_id("S[x]").is_err());
    }

    #[test]
    fn test_clone_renames_everything() {
        let model = models::enzyme_pulse();
        let out = replicate(&model, &ReplicationConfig::new(&[2])).unwrap();
        let m = &out.model;

        assert_eq!(m.compartments.len(), 2);
        assert_eq!(m.species.len(), 4);
        assert_eq!(m.global_quantities.len(), 6);
        assert_eq!(m.reactions.len(), 2);
        assert!(m.get_species("S_1").is_some());
        assert!(m.get_species("S_2").is_some());
        assert_eq!(m.get_species("S_1").unwrap().compartment, "cell_1");

        let conv = m.get_global_quantity("conversion_2").unwrap();
        assert_eq!(conv.expression.as_deref(), Some("[P_2] / ([S_2] + [P_2])"));

        match &m.get_reaction("turnover_1").unwrap().kinetic_law {
            KineticLaw::MichaelisMenten {
                vmax,
                km,
                substrate,
            } => {
                assert_eq!(vmax, "vmax_1");
                assert_eq!(km, "km_1");
                assert_eq!(substrate, "S_1");
            }
            other => panic!("unexpected law {other:?}"),
        }
    }

    #[test]
    fn test_clone_keeps_local_parameters() {
        let mut model = diffusion_seed();
        model.reactions[0].kinetic_law = KineticLaw::MassAction {
            rate_constant: "k".to_string(),
        };
        model.reactions[0].local_parameters = vec![LocalParameter::new("k", 0.2)];

        let out = replicate(&model, &ReplicationConfig::new(&[2])).unwrap();
        let decay = out.model.get_reaction("decay_2").unwrap();
        match &decay.kinetic_law {
            KineticLaw::MassAction { rate_constant } => assert_eq!(rate_constant, "k"),
            other => panic!("unexpected law {other:?}"),
        }
        assert_eq!(decay.local_parameters[0].value, 0.2);
    }

    #[test]
    fn test_unit_count_and_id_map() {
        let model = models::linear_chain();
        let out = replicate(&model, &ReplicationConfig::new(&[2, 3])).unwrap();
        assert_eq!(out.model.species.len(), 18);
        // 6 units x (1 compartment + 3 species + 2 globals + 2 reactions)
        assert_eq!(out.id_map.len(), 48);
        assert_eq!(out.id_map[0].unit, 0);
        assert_eq!(out.id_map[0].original, "cell");
        assert_eq!(out.id_map[0].renamed, "cell_1_1");
        let last = out.id_map.last().unwrap();
        assert_eq!(last.unit, 5);
        assert_eq!(last.renamed, "step_2_2_3");
    }

    #[test]
    fn test_transport_chain_counts() {
        let model = diffusion_seed();
        let mut config = ReplicationConfig::new(&[4]);
        config.transport.push(TransportSpec::new("S", 0.5));

        let out = replicate(&model, &config).unwrap();
        assert_eq!(out.coupling_reactions.len(), 3);
        assert!(out.global_couplings.is_empty());

        let t = &out.coupling_reactions[0];
        assert_eq!(t.id, "t_S_1_2");
        assert!(t.reversible);
        assert_eq!(t.reactants[0].species, "S_1");
        assert_eq!(t.products[0].species, "S_2");
        assert_eq!(t.local_parameters[0].value, 0.5);
        assert_eq!(t.local_parameters[1].value, 0.5);
    }

    #[test]
    fn test_transport_wrapped_closes_the_ring() {
        let model = diffusion_seed();
        let mut config = ReplicationConfig::new(&[4]);
        config.boundary = vec![BoundaryMode::Wrapped];
        config.transport.push(TransportSpec::new("S", 0.5));

        let out = replicate(&model, &config).unwrap();
        assert_eq!(out.coupling_reactions.len(), 4);
        assert!(out
            .coupling_reactions
            .iter()
            .any(|r| r.reactants[0].species == "S_1" && r.products[0].species == "S_4"));
    }

    #[test]
    fn test_transport_size_two_ring_single_edge() {
        let model = diffusion_seed();
        let mut config = ReplicationConfig::new(&[2]);
        config.boundary = vec![BoundaryMode::Wrapped];
        config.transport.push(TransportSpec::new("S", 1.0));

        let out = replicate(&model, &config).unwrap();
        assert_eq!(out.coupling_reactions.len(), 1);
    }

    #[test]
    fn test_transport_grid_counts() {
        let model = diffusion_seed();
        let mut config = ReplicationConfig::new(&[2, 3]);
        config.transport.push(TransportSpec::new("S", 0.5));

        let out = replicate(&model, &config).unwrap();
        // Horizontal: 2 rows x 2 edges, vertical: 1 x 3 columns
        assert_eq!(out.coupling_reactions.len(), 7);
    }

    #[test]
    fn test_transport_per_axis_zero_disables_axis() {
        let model = diffusion_seed();
        let mut config = ReplicationConfig::new(&[2, 3]);
        config.transport.push(TransportSpec {
            entity: "S".to_string(),
            rate: TransportRate::PerAxis(vec![0.5, 0.0]),
        });

        let out = replicate(&model, &config).unwrap();
        // Only the 3 vertical pairs along axis 0 remain
        assert_eq!(out.coupling_reactions.len(), 3);
        for r in &out.coupling_reactions {
            assert_eq!(r.local_parameters[0].value, 0.5);
        }
    }

    #[test]
    fn test_transport_conserves_mass() {
        let model = diffusion_seed();
        let mut config = ReplicationConfig::new(&[3]);
        config.transport.push(TransportSpec::new("S", 0.5));

        let merged = replicate(&model, &config).unwrap().into_model();
        let stoich = merged.stoichiometry_matrix();
        // Transport columns come after the 3 decay columns and sum to zero
        for j in 3..merged.reactions.len() {
            let total: f64 = stoich.column(j).sum();
            assert_eq!(total, 0.0);
        }
    }

    #[test]
    fn test_global_transport_becomes_rate_terms() {
        let mut model = diffusion_seed();
        model.add_global_quantity(GlobalQuantity::new("temp", 37.0));
        let mut config = ReplicationConfig::new(&[3]);
        config.transport.push(TransportSpec::new("temp", 0.1));

        let out = replicate(&model, &config).unwrap();
        assert_eq!(out.global_couplings.len(), 2);
        assert!(out.coupling_reactions.is_empty());

        let merged = out.into_model();
        let edge = merged.get_global_quantity("temp_1").unwrap();
        assert_eq!(edge.status, SimulationType::Ode);
        assert_eq!(
            edge.expression.as_deref(),
            Some("0.1 * ([temp_2] - [temp_1])")
        );
        let middle = merged.get_global_quantity("temp_2").unwrap();
        assert_eq!(
            middle.expression.as_deref(),
            Some("0.1 * ([temp_1] - [temp_2]) + 0.1 * ([temp_3] - [temp_2])")
        );
    }

    #[test]
    fn test_transport_rejects_unsuitable_targets() {
        let model = models::enzyme_pulse();

        let mut config = ReplicationConfig::new(&[2]);
        config.transport.push(TransportSpec::new("cell", 0.5));
        assert!(matches!(
            replicate(&model, &config),
            Err(ReplicateError::Config(ConfigError::NotTransportable { .. }))
        ));

        let mut config = ReplicationConfig::new(&[2]);
        config.transport.push(TransportSpec::new("conversion", 0.5));
        assert!(matches!(
            replicate(&model, &config),
            Err(ReplicateError::Config(ConfigError::TransportStatus { .. }))
        ));

        let mut config = ReplicationConfig::new(&[2]);
        config.transport.push(TransportSpec::new("nothing", 0.5));
        assert!(matches!(
            replicate(&model, &config),
            Err(ReplicateError::Config(
                ConfigError::UnknownTransportTarget(_)
            ))
        ));

        let mut config = ReplicationConfig::new(&[2]);
        config.transport.push(TransportSpec::new("S", -1.0));
        assert!(matches!(
            replicate(&model, &config),
            Err(ReplicateError::Config(ConfigError::InvalidRate { .. }))
        ));
    }

    #[test]
    fn test_noise_is_reproducible() {
        let model = models::linear_chain();
        let mut config = ReplicationConfig::new(&[4]);
        config.seed = 42;
        config.noise.push(NoiseSpec::uniform(
            NoiseTarget::GlobalQuantity("k1".to_string()),
            0.1,
            NoiseMode::Relative,
        ));

        let a = replicate(&model, &config).unwrap();
        let b = replicate(&model, &config).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_noise_seed_matters() {
        let model = models::linear_chain();
        let mut config = ReplicationConfig::new(&[4]);
        config.seed = 42;
        config.noise.push(NoiseSpec::uniform(
            NoiseTarget::GlobalQuantity("k1".to_string()),
            0.1,
            NoiseMode::Relative,
        ));

        let a = replicate(&model, &config).unwrap();
        config.seed = 43;
        let b = replicate(&model, &config).unwrap();
        assert_ne!(
            serde_json::to_string(&a.model).unwrap(),
            serde_json::to_string(&b.model).unwrap()
        );
    }

    #[test]
    fn test_noise_stays_in_relative_bounds() {
        let model = models::linear_chain();
        let mut config = ReplicationConfig::new(&[16]);
        config.seed = 7;
        config.noise.push(NoiseSpec::uniform(
            NoiseTarget::GlobalQuantity("k1".to_string()),
            0.1,
            NoiseMode::Relative,
        ));

        let out = replicate(&model, &config).unwrap();
        let values: Vec<f64> = out
            .model
            .global_quantities
            .iter()
            .filter(|g| g.id.starts_with("k1_"))
            .map(|g| g.initial_value)
            .collect();
        assert_eq!(values.len(), 16);
        for v in &values {
            assert!(*v >= 0.1 * 0.9 && *v <= 0.1 * 1.1);
        }
        assert!(values.iter().any(|v| (v - values[0]).abs() > 0.0));
        // k2 was not a target and stays untouched
        assert!(out
            .model
            .global_quantities
            .iter()
            .filter(|g| g.id.starts_with("k2_"))
            .all(|g| g.initial_value == 0.05));
    }

    #[test]
    fn test_noise_zero_magnitude_changes_nothing() {
        let model = models::linear_chain();
        let mut config = ReplicationConfig::new(&[3]);
        config.noise.push(NoiseSpec::uniform(
            NoiseTarget::SpeciesConcentration("A".to_string()),
            0.0,
            NoiseMode::Absolute,
        ));

        let out = replicate(&model, &config).unwrap();
        for s in out.model.species.iter().filter(|s| s.id.starts_with("A_")) {
            assert_eq!(s.initial_concentration, 10.0);
        }
    }

    #[test]
    fn test_noise_rejects_bad_targets() {
        let model = models::enzyme_pulse();

        let mut config = ReplicationConfig::new(&[2]);
        config.noise.push(NoiseSpec::uniform(
            NoiseTarget::GlobalQuantity("conversion".to_string()),
            0.1,
            NoiseMode::Relative,
        ));
        assert!(matches!(
            replicate(&model, &config),
            Err(ReplicateError::Config(ConfigError::NoiseTargetNotFree { .. }))
        ));

        let mut config = ReplicationConfig::new(&[2]);
        config.noise.push(NoiseSpec::uniform(
            NoiseTarget::GlobalQuantity("nothing".to_string()),
            0.1,
            NoiseMode::Relative,
        ));
        assert!(matches!(
            replicate(&model, &config),
            Err(ReplicateError::Config(ConfigError::UnknownNoiseTarget(_)))
        ));

        let mut config = ReplicationConfig::new(&[2]);
        config.noise.push(NoiseSpec::uniform(
            NoiseTarget::GlobalQuantity("k1".to_string()),
            f64::NAN,
            NoiseMode::Relative,
        ));
        let model = models::linear_chain();
        assert!(matches!(
            replicate(&model, &config),
            Err(ReplicateError::Config(ConfigError::InvalidMagnitude { .. }))
        ));
    }

    #[test]
    fn test_events_split_by_trigger() {
        let model = models::enzyme_pulse();
        let out = replicate(&model, &ReplicationConfig::new(&[3])).unwrap();

        // product_brake references [P], so each unit owns a copy
        let brakes: Vec<_> = out
            .model
            .events
            .iter()
            .filter(|e| e.id.starts_with("product_brake"))
            .collect();
        assert_eq!(brakes.len(), 3);
        assert_eq!(brakes[0].trigger, "[P_1] > 8");

        // substrate_feed is time-only: one copy, assignments fanned out
        let feeds: Vec<_> = out
            .model
            .events
            .iter()
            .filter(|e| e.id == "substrate_feed")
            .collect();
        assert_eq!(feeds.len(), 1);
        let feed = feeds[0];
        assert_eq!(feed.trigger, "Time > 100");
        assert_eq!(feed.assignments.len(), 3);
        assert_eq!(feed.assignments[0].target, "S_1");
        assert_eq!(feed.assignments[0].expression, "[S_1] + 10");
        assert_eq!(feed.assignments[2].target, "S_3");
    }

    #[test]
    fn test_shared_event_id_collision_detected() {
        let mut model = diffusion_seed();
        let mut pulse = Event::new("S_1", "Time > 5");
        pulse.assignments.push(EventAssignment::new("S", "0"));
        model.add_event(pulse);

        let err = replicate(&model, &ReplicationConfig::new(&[2])).unwrap_err();
        assert!(matches!(
            err,
            ReplicateError::Config(ConfigError::IdCollision(id)) if id == "S_1"
        ));
    }

    #[test]
    fn test_invalid_style_id_rejected_up_front() {
        let mut model = diffusion_seed();
        model.add_global_quantity(GlobalQuantity::new("k deg", 0.1));

        let err = replicate(&model, &ReplicationConfig::new(&[2])).unwrap_err();
        assert!(matches!(
            err,
            ReplicateError::Config(ConfigError::InvalidGeneratedId { .. })
        ));

        // The display style accepts spaces
        let mut config = ReplicationConfig::new(&[2]);
        config.id_style = IdStyle::GridDisplay;
        assert!(replicate(&model, &config).is_ok());
    }

    #[test]
    fn test_single_unit_lattice_is_valid() {
        let model = models::linear_chain();
        let mut config = ReplicationConfig::new(&[1]);
        config.transport.push(TransportSpec::new("A", 0.5));

        let out = replicate(&model, &config).unwrap();
        assert_eq!(out.model.species.len(), 3);
        assert!(out.model.get_species("A_1").is_some());
        assert!(out.coupling_reactions.is_empty());
    }

    #[test]
    fn test_model_name_and_notes() {
        let model = models::linear_chain();
        let out = replicate(&model, &ReplicationConfig::new(&[2, 3])).unwrap();
        assert_eq!(out.description, "a set of 6 (2x3) replicas");
        assert_eq!(out.model.name, "a set of 6 (2x3) replicas of LinearChain");
        let notes = out.model.notes.unwrap();
        assert!(notes.starts_with("<body"));
        assert!(notes.contains("Processed with MEC to produce a set of 6 (2x3) replicas"));

        let mut noted = models::linear_chain();
        noted.notes = Some(
            "<body xmlns=\"http://www.w3.org/1999/xhtml\"><p>seed</p></body>".to_string(),
        );
        let out = replicate(&noted, &ReplicationConfig::new(&[2])).unwrap();
        let notes = out.model.notes.unwrap();
        assert!(notes.contains("<p>seed</p><hr/>"));
        assert!(notes.ends_with("</body>"));

        let mut plain = models::linear_chain();
        plain.notes = Some("just text".to_string());
        let out = replicate(&plain, &ReplicationConfig::new(&[2])).unwrap();
        assert!(out
            .model
            .notes
            .unwrap()
            .starts_with("just text\n\nProcessed with MEC"));
    }

    #[test]
    fn test_into_model_appends_transport_after_unit_reactions() {
        let model = diffusion_seed();
        let mut config = ReplicationConfig::new(&[3]);
        config.transport.push(TransportSpec::new("S", 0.5));

        let merged = replicate(&model, &config).unwrap().into_model();
        assert_eq!(merged.reactions.len(), 5);
        assert_eq!(merged.reactions[0].id, "decay_1");
        assert_eq!(merged.reactions[3].id, "t_S_1_2");
        assert!(merged.validate().is_ok());
    }

    #[test]
    fn test_replicated_output_validates() {
        let model = models::enzyme_pulse();
        let mut config = ReplicationConfig::new(&[2, 2]);
        config.transport.push(TransportSpec::new("S", 0.25));
        config.seed = 9;
        config.noise.push(NoiseSpec::normal(
            NoiseTarget::GlobalQuantity("km".to_string()),
            0.05,
            NoiseMode::Relative,
        ));

        let merged = replicate(&model, &config).unwrap().into_model();
        assert!(merged.validate().is_ok());
        assert_eq!(merged.species.len(), 8);
        assert_eq!(merged.reactions.len(), 4 + 4);
    }

    #[test]
    fn test_config_json_defaults() {
        let config: ReplicationConfig = serde_json::from_str(r#"{"shape": [2, 3]}"#).unwrap();
        assert_eq!(config.shape, vec![2, 3]);
        assert!(config.boundary.is_empty());
        assert_eq!(config.id_style, IdStyle::Underscored);
        assert!(config.transport.is_empty());
        assert_eq!(config.seed, 0);

        let config: ReplicationConfig = serde_json::from_str(
            r#"{"shape": [3], "boundary": ["wrapped"], "transport": [{"entity": "S", "rate": 0.5}]}"#,
        )
        .unwrap();
        assert_eq!(config.boundary, vec![BoundaryMode::Wrapped]);
        match &config.transport[0].rate {
            TransportRate::Uniform(k) => assert_eq!(*k, 0.5),
            other => panic!("unexpected rate {other:?}"),
        }
    }
}
