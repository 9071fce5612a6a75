//! # MEC-CORE
//!
//! Abstract biochemical network models for MEC (Model Extender for COPASI).
//!
//! ## History
//!
//! MEC began as a Python companion script to COPASI written by Pedro Mendes
//! at UConn Health (2024). It takes one biochemical model and replicates it
//! as a set of sub-models which can exist side-by-side or be connected in
//! different ways, for example as a diffusion grid of cells.
//!
//! ## Scope
//!
//! This crate holds the model representation shared by the replication
//! engine and the CLI:
//!
//! 1. **Elements**: compartments, species, global quantities, reactions, events
//! 2. **Simulation types**: fixed, assignment, ODE, reactions
//! 3. **Expressions**: infix strings with `[bracketed]` element references
//! 4. **Validation**: referential integrity for whole models

use ndarray::Array2;
use pest::Parser as _;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================

/// Structural model errors
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Duplicate identifier: {0}")]
    DuplicateId(String),

    #[error("Invalid identifier '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("{referrer}: unknown reference '{target}'")]
    UnknownReference { referrer: String, target: String },

    #[error("{referrer}: '{target}' is a {found}, expected {expected}")]
    WrongKind {
        referrer: String,
        target: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{id}: {status} status requires an expression")]
    MissingExpression { id: String, status: &'static str },

    #[error("{class} '{id}' cannot have {status} status")]
    InvalidStatus {
        id: String,
        class: &'static str,
        status: &'static str,
    },

    #[error("Reaction '{reaction}': stoichiometry {value} for '{species}' must be positive and finite")]
    InvalidStoichiometry {
        reaction: String,
        species: String,
        value: f64,
    },

    #[error("{id}: {attribute} is not finite")]
    NonFiniteValue { id: String, attribute: &'static str },

    #[error("Expression error: {0}")]
    ExpressionSyntax(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;

// =============================================================================
// MODEL ELEMENTS
// =============================================================================

/// How an element's value evolves during simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationType {
    /// Constant value
    Fixed,
    /// Value follows an algebraic expression
    Assignment,
    /// Value follows an explicit rate expression
    Ode,
    /// Value determined by reaction fluxes (species only)
    Reactions,
}

impl SimulationType {
    pub fn label(self) -> &'static str {
        match self {
            SimulationType::Fixed => "fixed",
            SimulationType::Assignment => "assignment",
            SimulationType::Ode => "ode",
            SimulationType::Reactions => "reactions",
        }
    }
}

/// Element classes that share the model namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Compartment,
    Species,
    GlobalQuantity,
    Reaction,
}

impl EntityKind {
    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Compartment => "compartment",
            EntityKind::Species => "species",
            EntityKind::GlobalQuantity => "global quantity",
            EntityKind::Reaction => "reaction",
        }
    }
}

/// Model-wide units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUnits {
    pub quantity: String,
    pub time: String,
    pub volume: String,
    pub area: String,
    pub length: String,
}

impl Default for ModelUnits {
    fn default() -> Self {
        Self {
            quantity: "mmol".to_string(),
            time: "s".to_string(),
            volume: "l".to_string(),
            area: "m^2".to_string(),
            length: "m".to_string(),
        }
    }
}

/// Compartment (reaction container)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compartment {
    pub id: String,
    pub status: SimulationType,
    pub initial_size: f64,
    pub initial_expression: Option<String>,
    pub expression: Option<String>,
    #[serde(default = "default_dimensionality")]
    pub dimensionality: u8,
    pub unit: Option<String>,
}

fn default_dimensionality() -> u8 {
    3
}

impl Compartment {
    pub fn new(id: &str, initial_size: f64) -> Self {
        Self {
            id: id.to_string(),
            status: SimulationType::Fixed,
            initial_size,
            initial_expression: None,
            expression: None,
            dimensionality: 3,
            unit: None,
        }
    }
}

/// Species (molecule, protein, metabolite)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Species {
    pub id: String,
    pub compartment: String,
    pub status: SimulationType,
    pub initial_concentration: f64,
    pub initial_expression: Option<String>,
    pub expression: Option<String>,
    pub unit: Option<String>,
}

impl Species {
    pub fn new(id: &str, compartment: &str, initial_concentration: f64) -> Self {
        Self {
            id: id.to_string(),
            compartment: compartment.to_string(),
            status: SimulationType::Reactions,
            initial_concentration,
            initial_expression: None,
            expression: None,
            unit: None,
        }
    }
}

/// Global quantity (model-level parameter)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalQuantity {
    pub id: String,
    pub status: SimulationType,
    pub initial_value: f64,
    pub initial_expression: Option<String>,
    pub expression: Option<String>,
    pub unit: Option<String>,
}

impl GlobalQuantity {
    pub fn new(id: &str, initial_value: f64) -> Self {
        Self {
            id: id.to_string(),
            status: SimulationType::Fixed,
            initial_value,
            initial_expression: None,
            expression: None,
            unit: None,
        }
    }

    /// Quantity whose value follows an algebraic expression
    pub fn assignment(id: &str, expression: &str) -> Self {
        Self {
            id: id.to_string(),
            status: SimulationType::Assignment,
            initial_value: 0.0,
            initial_expression: None,
            expression: Some(expression.to_string()),
            unit: None,
        }
    }
}

/// Species reference in a reaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeciesReference {
    pub species: String,
    pub stoichiometry: f64,
}

impl SpeciesReference {
    pub fn new(species: &str, stoichiometry: f64) -> Self {
        Self {
            species: species.to_string(),
            stoichiometry,
        }
    }
}

/// Reaction-local parameter (plain value, not visible outside the reaction)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalParameter {
    pub id: String,
    pub value: f64,
}

impl LocalParameter {
    pub fn new(id: &str, value: f64) -> Self {
        Self {
            id: id.to_string(),
            value,
        }
    }
}

/// Kinetic law expression
///
/// String fields bind a rate parameter by name, either to a reaction-local
/// parameter or to a model element. Local parameters shadow model elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KineticLaw {
    /// Mass action: k * [A]^a * [B]^b
    MassAction { rate_constant: String },
    /// Reversible mass action: kf * products([A]) - kr * products([B])
    MassActionReversible { kf: String, kr: String },
    /// Michaelis-Menten: Vmax * [S] / (Km + [S])
    MichaelisMenten {
        vmax: String,
        km: String,
        substrate: String,
    },
    /// Hill equation: Vmax * [S]^n / (K^n + [S]^n)
    Hill {
        vmax: String,
        k: String,
        substrate: String,
        n: f64,
    },
    /// Custom infix expression
    Custom(String),
}

/// Reaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    #[serde(default)]
    pub reversible: bool,
    pub reactants: Vec<SpeciesReference>,
    pub products: Vec<SpeciesReference>,
    #[serde(default)]
    pub modifiers: Vec<String>,
    pub kinetic_law: KineticLaw,
    #[serde(default)]
    pub local_parameters: Vec<LocalParameter>,
}

impl Reaction {
    /// Create a simple A -> B mass action reaction
    pub fn mass_action(id: &str, reactant: &str, product: &str, rate_constant: &str) -> Self {
        Self {
            id: id.to_string(),
            reversible: false,
            reactants: vec![SpeciesReference::new(reactant, 1.0)],
            products: vec![SpeciesReference::new(product, 1.0)],
            modifiers: Vec::new(),
            kinetic_law: KineticLaw::MassAction {
                rate_constant: rate_constant.to_string(),
            },
            local_parameters: Vec::new(),
        }
    }

    /// Create an enzymatic reaction with Michaelis-Menten kinetics
    pub fn enzymatic(id: &str, substrate: &str, product: &str, vmax: &str, km: &str) -> Self {
        Self {
            id: id.to_string(),
            reversible: false,
            reactants: vec![SpeciesReference::new(substrate, 1.0)],
            products: vec![SpeciesReference::new(product, 1.0)],
            modifiers: Vec::new(),
            kinetic_law: KineticLaw::MichaelisMenten {
                vmax: vmax.to_string(),
                km: km.to_string(),
                substrate: substrate.to_string(),
            },
            local_parameters: Vec::new(),
        }
    }
}

/// Event (discrete state change)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub trigger: String,
    pub delay: Option<String>,
    #[serde(default)]
    pub assignments: Vec<EventAssignment>,
}

impl Event {
    pub fn new(id: &str, trigger: &str) -> Self {
        Self {
            id: id.to_string(),
            trigger: trigger.to_string(),
            delay: None,
            assignments: Vec::new(),
        }
    }
}

/// Event assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventAssignment {
    pub target: String,
    pub expression: String,
}

impl EventAssignment {
    pub fn new(target: &str, expression: &str) -> Self {
        Self {
            target: target.to_string(),
            expression: expression.to_string(),
        }
    }
}

// =============================================================================
// MODEL
// =============================================================================

/// Complete biochemical network model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    pub notes: Option<String>,
    #[serde(default)]
    pub units: ModelUnits,
    pub compartments: Vec<Compartment>,
    pub species: Vec<Species>,
    pub global_quantities: Vec<GlobalQuantity>,
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Model {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            notes: None,
            units: ModelUnits::default(),
            compartments: Vec::new(),
            species: Vec::new(),
            global_quantities: Vec::new(),
            reactions: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Add a compartment
    pub fn add_compartment(&mut self, compartment: Compartment) {
        self.compartments.push(compartment);
    }

    /// Add a species
    pub fn add_species(&mut self, species: Species) {
        self.species.push(species);
    }

    /// Add a global quantity
    pub fn add_global_quantity(&mut self, quantity: GlobalQuantity) {
        self.global_quantities.push(quantity);
    }

    /// Add a reaction
    pub fn add_reaction(&mut self, reaction: Reaction) {
        self.reactions.push(reaction);
    }

    /// Add an event
    pub fn add_event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Get compartment by ID
    pub fn get_compartment(&self, id: &str) -> Option<&Compartment> {
        self.compartments.iter().find(|c| c.id == id)
    }

    /// Get species by ID
    pub fn get_species(&self, id: &str) -> Option<&Species> {
        self.species.iter().find(|s| s.id == id)
    }

    /// Get global quantity by ID
    pub fn get_global_quantity(&self, id: &str) -> Option<&GlobalQuantity> {
        self.global_quantities.iter().find(|g| g.id == id)
    }

    /// Get reaction by ID
    pub fn get_reaction(&self, id: &str) -> Option<&Reaction> {
        self.reactions.iter().find(|r| r.id == id)
    }

    /// Count elements broken down by simulation type
    pub fn summary(&self) -> ModelSummary {
        let mut summary = ModelSummary {
            reactions: self.reactions.len(),
            events: self.events.len(),
            ..ModelSummary::default()
        };
        for s in &self.species {
            summary.species.tally(s.status);
        }
        for c in &self.compartments {
            summary.compartments.tally(c.status);
        }
        for g in &self.global_quantities {
            summary.global_quantities.tally(g.status);
        }
        summary
    }

    /// Build stoichiometry matrix (species rows, reaction columns)
    pub fn stoichiometry_matrix(&self) -> Array2<f64> {
        let n_species = self.species.len();
        let n_reactions = self.reactions.len();
        let mut matrix = Array2::zeros((n_species, n_reactions));

        let species_index: HashMap<_, _> = self
            .species
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        for (j, reaction) in self.reactions.iter().enumerate() {
            // Reactants (negative stoichiometry)
            for sr in &reaction.reactants {
                if let Some(&i) = species_index.get(&sr.species) {
                    matrix[[i, j]] -= sr.stoichiometry;
                }
            }
            // Products (positive stoichiometry)
            for sr in &reaction.products {
                if let Some(&i) = species_index.get(&sr.species) {
                    matrix[[i, j]] += sr.stoichiometry;
                }
            }
        }

        matrix
    }

    /// Check referential integrity of the whole model
    ///
    /// Verifies that identifiers are unique and well formed, that every
    /// structural reference points at an element of the right class, and
    /// that every `[bracketed]` expression reference resolves.
    pub fn validate(&self) -> Result<()> {
        let index = EntityIndex::build(self)?;

        for c in &self.compartments {
            let referrer = format!("compartment '{}'", c.id);
            check_finite(&c.id, "initial size", c.initial_size)?;
            if c.status == SimulationType::Reactions {
                return Err(ModelError::InvalidStatus {
                    id: c.id.clone(),
                    class: "compartment",
                    status: c.status.label(),
                });
            }
            self.check_rule_expressions(
                &index,
                &referrer,
                &c.id,
                c.status,
                c.initial_expression.as_deref(),
                c.expression.as_deref(),
            )?;
        }

        for s in &self.species {
            let referrer = format!("species '{}'", s.id);
            check_finite(&s.id, "initial concentration", s.initial_concentration)?;
            match index.kind(&s.compartment) {
                Some(EntityKind::Compartment) => {}
                Some(kind) => {
                    return Err(ModelError::WrongKind {
                        referrer,
                        target: s.compartment.clone(),
                        expected: "compartment",
                        found: kind.label(),
                    })
                }
                None => {
                    return Err(ModelError::UnknownReference {
                        referrer,
                        target: s.compartment.clone(),
                    })
                }
            }
            self.check_rule_expressions(
                &index,
                &referrer,
                &s.id,
                s.status,
                s.initial_expression.as_deref(),
                s.expression.as_deref(),
            )?;
        }

        for g in &self.global_quantities {
            let referrer = format!("global quantity '{}'", g.id);
            check_finite(&g.id, "initial value", g.initial_value)?;
            if g.status == SimulationType::Reactions {
                return Err(ModelError::InvalidStatus {
                    id: g.id.clone(),
                    class: "global quantity",
                    status: g.status.label(),
                });
            }
            self.check_rule_expressions(
                &index,
                &referrer,
                &g.id,
                g.status,
                g.initial_expression.as_deref(),
                g.expression.as_deref(),
            )?;
        }

        for r in &self.reactions {
            self.validate_reaction(&index, r)?;
        }

        for e in &self.events {
            self.validate_event(&index, e)?;
        }

        Ok(())
    }

    fn check_rule_expressions(
        &self,
        index: &EntityIndex,
        referrer: &str,
        id: &str,
        status: SimulationType,
        initial_expression: Option<&str>,
        expression: Option<&str>,
    ) -> Result<()> {
        if let Some(expr) = initial_expression {
            check_expression(index, referrer, expr)?;
        }
        match status {
            SimulationType::Assignment | SimulationType::Ode => match expression {
                Some(expr) => check_expression(index, referrer, expr)?,
                None => {
                    return Err(ModelError::MissingExpression {
                        id: id.to_string(),
                        status: status.label(),
                    })
                }
            },
            SimulationType::Fixed | SimulationType::Reactions => {}
        }
        Ok(())
    }

    fn validate_reaction(&self, index: &EntityIndex, r: &Reaction) -> Result<()> {
        let referrer = format!("reaction '{}'", r.id);

        let mut local_ids = HashSet::new();
        for lp in &r.local_parameters {
            check_finite(&format!("{}.{}", r.id, lp.id), "value", lp.value)?;
            if !local_ids.insert(lp.id.as_str()) {
                return Err(ModelError::DuplicateId(format!("{}.{}", r.id, lp.id)));
            }
        }

        for sr in r.reactants.iter().chain(r.products.iter()) {
            check_species_ref(index, &referrer, &sr.species)?;
            if !sr.stoichiometry.is_finite() || sr.stoichiometry <= 0.0 {
                return Err(ModelError::InvalidStoichiometry {
                    reaction: r.id.clone(),
                    species: sr.species.clone(),
                    value: sr.stoichiometry,
                });
            }
        }
        for m in &r.modifiers {
            check_species_ref(index, &referrer, m)?;
        }

        let check_value = |name: &str| check_value_binding(index, &local_ids, &referrer, name);
        match &r.kinetic_law {
            KineticLaw::MassAction { rate_constant } => check_value(rate_constant)?,
            KineticLaw::MassActionReversible { kf, kr } => {
                check_value(kf)?;
                check_value(kr)?;
            }
            KineticLaw::MichaelisMenten {
                vmax,
                km,
                substrate,
            } => {
                check_value(vmax)?;
                check_value(km)?;
                check_species_ref(index, &referrer, substrate)?;
            }
            KineticLaw::Hill {
                vmax,
                k,
                substrate,
                n,
            } => {
                check_value(vmax)?;
                check_value(k)?;
                check_species_ref(index, &referrer, substrate)?;
                check_finite(&r.id, "Hill coefficient", *n)?;
            }
            KineticLaw::Custom(expr) => check_expression(index, &referrer, expr)?,
        }
        Ok(())
    }

    fn validate_event(&self, index: &EntityIndex, e: &Event) -> Result<()> {
        let referrer = format!("event '{}'", e.id);
        check_expression(index, &referrer, &e.trigger)?;
        if let Some(delay) = &e.delay {
            check_expression(index, &referrer, delay)?;
        }
        for a in &e.assignments {
            match index.kind(&a.target) {
                Some(EntityKind::Reaction) => {
                    return Err(ModelError::WrongKind {
                        referrer,
                        target: a.target.clone(),
                        expected: "assignable element",
                        found: "reaction",
                    })
                }
                Some(_) => {}
                None => {
                    return Err(ModelError::UnknownReference {
                        referrer,
                        target: a.target.clone(),
                    })
                }
            }
            check_expression(index, &referrer, &a.expression)?;
        }
        Ok(())
    }
}

fn check_finite(id: &str, attribute: &'static str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ModelError::NonFiniteValue {
            id: id.to_string(),
            attribute,
        })
    }
}

fn check_species_ref(index: &EntityIndex, referrer: &str, id: &str) -> Result<()> {
    match index.kind(id) {
        Some(EntityKind::Species) => Ok(()),
        Some(kind) => Err(ModelError::WrongKind {
            referrer: referrer.to_string(),
            target: id.to_string(),
            expected: "species",
            found: kind.label(),
        }),
        None => Err(ModelError::UnknownReference {
            referrer: referrer.to_string(),
            target: id.to_string(),
        }),
    }
}

fn check_value_binding(
    index: &EntityIndex,
    locals: &HashSet<&str>,
    referrer: &str,
    name: &str,
) -> Result<()> {
    if locals.contains(name) {
        return Ok(());
    }
    match index.kind(name) {
        Some(EntityKind::Reaction) => Err(ModelError::WrongKind {
            referrer: referrer.to_string(),
            target: name.to_string(),
            expected: "parameter or element value",
            found: "reaction",
        }),
        Some(_) => Ok(()),
        None => Err(ModelError::UnknownReference {
            referrer: referrer.to_string(),
            target: name.to_string(),
        }),
    }
}

fn check_expression(index: &EntityIndex, referrer: &str, expr: &str) -> Result<()> {
    for r in expression_references(expr)? {
        if r.bracketed && index.kind(&r.name).is_none() {
            return Err(ModelError::UnknownReference {
                referrer: referrer.to_string(),
                target: r.name,
            });
        }
    }
    Ok(())
}

/// Element counts broken down by simulation type
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub fixed: usize,
    pub assignment: usize,
    pub ode: usize,
    pub reactions: usize,
}

impl StatusCounts {
    fn tally(&mut self, status: SimulationType) {
        match status {
            SimulationType::Fixed => self.fixed += 1,
            SimulationType::Assignment => self.assignment += 1,
            SimulationType::Ode => self.ode += 1,
            SimulationType::Reactions => self.reactions += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.fixed + self.assignment + self.ode + self.reactions
    }
}

/// Model element counts
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelSummary {
    pub reactions: usize,
    pub events: usize,
    pub species: StatusCounts,
    pub compartments: StatusCounts,
    pub global_quantities: StatusCounts,
}

// =============================================================================
// ENTITY INDEX
// =============================================================================

/// Lookup table from identifier to element class
///
/// Compartments, species, global quantities and reactions share one
/// namespace. Event identifiers live in the same namespace but are not
/// referencable from expressions, so they are checked for collisions
/// without being indexed.
#[derive(Debug, Clone)]
pub struct EntityIndex {
    kinds: HashMap<String, EntityKind>,
}

impl EntityIndex {
    /// Index all elements of a model, rejecting duplicate identifiers
    pub fn build(model: &Model) -> Result<Self> {
        let mut kinds = HashMap::new();

        for c in &model.compartments {
            insert_unique(&mut kinds, &c.id, EntityKind::Compartment)?;
        }
        for s in &model.species {
            insert_unique(&mut kinds, &s.id, EntityKind::Species)?;
        }
        for g in &model.global_quantities {
            insert_unique(&mut kinds, &g.id, EntityKind::GlobalQuantity)?;
        }
        for r in &model.reactions {
            insert_unique(&mut kinds, &r.id, EntityKind::Reaction)?;
        }

        let mut event_ids = HashSet::new();
        for e in &model.events {
            check_id(&e.id)?;
            if kinds.contains_key(&e.id) || !event_ids.insert(e.id.as_str()) {
                return Err(ModelError::DuplicateId(e.id.clone()));
            }
        }

        Ok(Self { kinds })
    }

    /// Element class for an identifier, if it names an element
    pub fn kind(&self, id: &str) -> Option<EntityKind> {
        self.kinds.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.kinds.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

fn insert_unique(
    kinds: &mut HashMap<String, EntityKind>,
    id: &str,
    kind: EntityKind,
) -> Result<()> {
    check_id(id)?;
    if kinds.insert(id.to_string(), kind).is_some() {
        return Err(ModelError::DuplicateId(id.to_string()));
    }
    Ok(())
}

fn check_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ModelError::InvalidId {
            id: id.to_string(),
            reason: "empty".to_string(),
        });
    }
    if id.contains('[') || id.contains(']') {
        return Err(ModelError::InvalidId {
            id: id.to_string(),
            reason: "brackets are reserved for expression references".to_string(),
        });
    }
    if id.contains('"') || id.contains(';') {
        return Err(ModelError::InvalidId {
            id: id.to_string(),
            reason: "quotes and semicolons are not allowed".to_string(),
        });
    }
    if id.chars().any(|c| c.is_control()) {
        return Err(ModelError::InvalidId {
            id: id.to_string(),
            reason: "contains control characters".to_string(),
        });
    }
    if id.trim() != id {
        return Err(ModelError::InvalidId {
            id: id.to_string(),
            reason: "leading or trailing whitespace".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// EXPRESSIONS
// =============================================================================

/// Lexer for infix expressions
///
/// Expressions are kept as strings. The lexer only distinguishes the parts
/// that matter for renaming: `[bracketed]` element references, bare names
/// (identifiers and attribute prefixes like `R1.Flux`), and everything else
/// verbatim. Numbers are lexed separately so `1e3` is never mistaken for a
/// name.
#[derive(Parser)]
#[grammar_inline = r#"
expression = { SOI ~ token* ~ EOI }
token      = _{ reference | number | name | other }
reference  =  { "[" ~ target ~ "]" }
target     = @{ (!"]" ~ ANY)* }
number     = @{ ASCII_DIGIT+ ~ ("." ~ ASCII_DIGIT*)? ~ (^"e" ~ ("+" | "-")? ~ ASCII_DIGIT+)? }
name       = @{ (ASCII_ALPHA | "_") ~ (ASCII_ALPHANUMERIC | "_")* }
other      = @{ ANY }
"#]
pub struct ExprParser;

enum Token<'a> {
    Reference(&'a str),
    Name(&'a str),
    Raw(&'a str),
}

fn lex(expr: &str) -> Result<Vec<Token<'_>>> {
    let mut pairs = ExprParser::parse(Rule::expression, expr)
        .map_err(|e| ModelError::ExpressionSyntax(e.to_string()))?;
    let root = match pairs.next() {
        Some(p) => p,
        None => return Ok(Vec::new()),
    };

    let mut tokens = Vec::new();
    for pair in root.into_inner() {
        match pair.as_rule() {
            Rule::reference => {
                let target = pair.into_inner().next().map(|p| p.as_str()).unwrap_or("");
                tokens.push(Token::Reference(target));
            }
            Rule::name => tokens.push(Token::Name(pair.as_str())),
            Rule::number | Rule::other => tokens.push(Token::Raw(pair.as_str())),
            Rule::EOI => {}
            _ => {}
        }
    }
    Ok(tokens)
}

/// A name found in an expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprRef {
    pub name: String,
    /// True for `[name]`, false for a bare name
    pub bracketed: bool,
}

/// All names an expression mentions, in order of appearance
pub fn expression_references(expr: &str) -> Result<Vec<ExprRef>> {
    Ok(lex(expr)?
        .into_iter()
        .filter_map(|t| match t {
            Token::Reference(name) => Some(ExprRef {
                name: name.to_string(),
                bracketed: true,
            }),
            Token::Name(name) => Some(ExprRef {
                name: name.to_string(),
                bracketed: false,
            }),
            Token::Raw(_) => None,
        })
        .collect())
}

/// Rewrite element references in an expression
///
/// `rename` maps an element identifier to its replacement, or None for
/// names that are not elements. Bracketed references must resolve; a bare
/// name that does not resolve passes through verbatim. Everything outside
/// the renamed references is preserved byte for byte.
pub fn rewrite_expression<F>(expr: &str, referrer: &str, mut rename: F) -> Result<String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(expr.len());
    for token in lex(expr)? {
        match token {
            Token::Reference(name) => match rename(name) {
                Some(new) => {
                    out.push('[');
                    out.push_str(&new);
                    out.push(']');
                }
                None => {
                    return Err(ModelError::UnknownReference {
                        referrer: referrer.to_string(),
                        target: name.to_string(),
                    })
                }
            },
            Token::Name(name) => match rename(name) {
                Some(new) => out.push_str(&new),
                None => out.push_str(name),
            },
            Token::Raw(raw) => out.push_str(raw),
        }
    }
    Ok(out)
}

// =============================================================================
// STANDARD MODELS
// =============================================================================

pub mod models {
    use super::*;

    /// Two-step linear pathway: A -> B -> C
    pub fn linear_chain() -> Model {
        let mut model = Model::new("LinearChain");

        model.add_compartment(Compartment::new("cell", 1.0));
        model.add_species(Species::new("A", "cell", 10.0));
        model.add_species(Species::new("B", "cell", 0.0));
        model.add_species(Species::new("C", "cell", 0.0));

        model.add_global_quantity(GlobalQuantity::new("k1", 0.1));
        model.add_global_quantity(GlobalQuantity::new("k2", 0.05));

        model.add_reaction(Reaction::mass_action("step_1", "A", "B", "k1"));
        model.add_reaction(Reaction::mass_action("step_2", "B", "C", "k2"));

        model
    }

    /// Enzymatic turnover with a substrate feed event
    ///
    /// S is consumed by Michaelis-Menten kinetics, topped up by a timed
    /// feed, and the reaction is slowed once enough product accumulates.
    pub fn enzyme_pulse() -> Model {
        let mut model = Model::new("EnzymePulse");

        model.add_compartment(Compartment::new("cell", 1.0));
        model.add_species(Species::new("S", "cell", 10.0));
        model.add_species(Species::new("P", "cell", 0.0));

        model.add_global_quantity(GlobalQuantity::new("vmax", 1.0));
        model.add_global_quantity(GlobalQuantity::new("km", 0.5));
        model.add_global_quantity(GlobalQuantity::assignment(
            "conversion",
            "[P] / ([S] + [P])",
        ));

        model.add_reaction(Reaction::enzymatic("turnover", "S", "P", "vmax", "km"));

        let mut feed = Event::new("substrate_feed", "Time > 100");
        feed.assignments.push(EventAssignment::new("S", "[S] + 10"));
        model.add_event(feed);

        let mut brake = Event::new("product_brake", "[P] > 8");
        brake
            .assignments
            .push(EventAssignment::new("vmax", "vmax / 2"));
        model.add_event(brake);

        model
    }
}

// =============================================================================
// TESTS
// =============================================================================
