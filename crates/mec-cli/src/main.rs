//! # MEC CLI
//!
//! Command-line interface for MEC (Model Extender for COPASI).

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use mec_core::{models, Model};
use mec_replicate::{
    replicate, BoundaryMode, IdStyle, NoiseMode, NoiseSpec, NoiseTarget, ReplicationConfig,
    TransportRate, TransportSpec,
};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "mec")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Model Extender for COPASI - replicate models over coupled lattices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate a model over a lattice of coupled units
    Replicate(ReplicateArgs),

    /// Show a summary of a model file
    Info {
        /// Model file
        model: PathBuf,
    },

    /// Write one of the built-in demo models
    Demo {
        /// Demo name (pathway, enzyme)
        #[arg(default_value = "pathway")]
        name: String,
        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ReplicateArgs {
    /// Original model file
    model: PathBuf,

    /// Load the replication setup from a JSON config file instead of the
    /// lattice/transport/noise flags
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Lattice rows
    #[arg(default_value_t = 2)]
    rows: usize,

    /// Lattice columns
    #[arg(default_value_t = 1)]
    columns: usize,

    /// Lattice layers (third axis)
    #[arg(short, long, default_value_t = 1)]
    layers: usize,

    /// Close every axis into a ring
    #[arg(short, long)]
    wrap: bool,

    /// Transport a species or global quantity between neighbors,
    /// NAME=RATE or NAME=R0,R1[,R2] for per-axis rates
    #[arg(short, long)]
    transport: Vec<String>,

    /// Perturb a value independently in every unit,
    /// NAME=AMOUNT or NAME=PERCENT%
    #[arg(short, long)]
    noise: Vec<String>,

    /// Like --noise but with normally distributed samples
    #[arg(long)]
    normal_noise: Vec<String>,

    /// Seed for the noise generator
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Suffix names for display (S_1,2) instead of SBML-safe (S_1_2)
    #[arg(long)]
    display_names: bool,

    /// Output file (default: input name with the lattice size appended)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Suppress information messages
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Replicate(args) => cmd_replicate(args),
        Commands::Info { model } => cmd_info(&model),
        Commands::Demo { name, output } => cmd_demo(&name, output),
    }
}

fn cmd_replicate(args: ReplicateArgs) -> Result<()> {
    // Resolve the lattice before touching the model file
    let file_config = args.config.as_deref().map(load_config).transpose()?;
    let shape = match &file_config {
        Some(config) => config.shape.clone(),
        None => {
            if args.rows == 0 || args.columns == 0 || args.layers == 0 {
                bail!("rows, columns and layers must be positive");
            }
            lattice_shape(args.rows, args.columns, args.layers)
        }
    };
    if shape.iter().product::<usize>() == 1 {
        println!();
        println!(
            "{}",
            "Nothing to do, one copy only is the same as the original model!".yellow()
        );
        println!("At least one of rows, columns or layers must be larger than 1.");
        println!();
        return Ok(());
    }

    let model = load_model(&args.model)?;
    if !args.quiet {
        println!("{} {}", "Processing".green().bold(), args.model.display());
        println!();
        print_summary(&model);
        println!();
    }

    let config = match file_config {
        Some(config) => config,
        None => {
            let mut noise = parse_noise(&model, &args.noise, false)?;
            noise.extend(parse_noise(&model, &args.normal_noise, true)?);
            ReplicationConfig {
                shape: shape.clone(),
                boundary: if args.wrap {
                    vec![BoundaryMode::Wrapped; shape.len()]
                } else {
                    Vec::new()
                },
                id_style: if args.display_names {
                    IdStyle::GridDisplay
                } else {
                    IdStyle::Underscored
                },
                transport: parse_transport(&args.transport)?,
                noise,
                seed: args.seed,
            }
        }
    };

    let replicated = replicate(&model, &config)?;
    let description = replicated.description.clone();
    let merged = replicated.into_model();

    let out_path = args
        .output
        .unwrap_or_else(|| default_output(&args.model, &shape));
    write_model(&merged, &out_path)?;
    if !args.quiet {
        println!(
            "{} {} with {} of {}",
            "created new model".green().bold(),
            out_path.display(),
            description,
            args.model.display()
        );
    }
    Ok(())
}

fn cmd_info(path: &Path) -> Result<()> {
    let model = load_model(path)?;
    model.validate()?;
    println!("{} {}", "Model:".green().bold(), model.name);
    println!();
    print_summary(&model);
    Ok(())
}

fn cmd_demo(name: &str, output: Option<PathBuf>) -> Result<()> {
    let model = match name {
        "pathway" => models::linear_chain(),
        "enzyme" => models::enzyme_pulse(),
        other => bail!("unknown demo '{other}', available: pathway, enzyme"),
    };
    let path = output.unwrap_or_else(|| PathBuf::from(format!("{name}.json")));
    write_model(&model, &path)?;
    println!(
        "{} {} ({})",
        "wrote demo model".green().bold(),
        path.display(),
        model.name
    );
    Ok(())
}

/// Lattice shape from the three axis arguments, axes of size 1 dropped
fn lattice_shape(rows: usize, columns: usize, layers: usize) -> Vec<usize> {
    [rows, columns, layers]
        .into_iter()
        .filter(|&n| n > 1)
        .collect()
}

fn parse_transport(args: &[String]) -> Result<Vec<TransportSpec>> {
    args.iter()
        .map(|arg| {
            let (entity, value) = arg
                .split_once('=')
                .with_context(|| format!("expected NAME=RATE, got '{arg}'"))?;
            let rate = if value.contains(',') {
                let rates = value
                    .split(',')
                    .map(|part| part.trim().parse::<f64>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .with_context(|| format!("invalid rate list '{value}' for '{entity}'"))?;
                TransportRate::PerAxis(rates)
            } else {
                TransportRate::Uniform(
                    value
                        .parse()
                        .with_context(|| format!("invalid rate '{value}' for '{entity}'"))?,
                )
            };
            Ok(TransportSpec {
                entity: entity.to_string(),
                rate,
            })
        })
        .collect()
}

fn parse_noise(model: &Model, args: &[String], normal: bool) -> Result<Vec<NoiseSpec>> {
    args.iter()
        .map(|arg| {
            let (name, value) = arg
                .split_once('=')
                .with_context(|| format!("expected NAME=AMOUNT, got '{arg}'"))?;
            let (magnitude, mode) = match value.strip_suffix('%') {
                Some(percent) => (
                    percent
                        .parse::<f64>()
                        .with_context(|| format!("invalid percentage '{value}' for '{name}'"))?
                        / 100.0,
                    NoiseMode::Relative,
                ),
                None => (
                    value
                        .parse::<f64>()
                        .with_context(|| format!("invalid amount '{value}' for '{name}'"))?,
                    NoiseMode::Absolute,
                ),
            };
            let target = noise_target(model, name)?;
            Ok(if normal {
                NoiseSpec::normal(target, magnitude, mode)
            } else {
                NoiseSpec::uniform(target, magnitude, mode)
            })
        })
        .collect()
}

/// Resolve a noise target name against the model
///
/// A dotted name addresses a reaction-local parameter; anything else must
/// name a compartment, species or global quantity.
fn noise_target(model: &Model, name: &str) -> Result<NoiseTarget> {
    if let Some((reaction, parameter)) = name.split_once('.') {
        return Ok(NoiseTarget::LocalParameter {
            reaction: reaction.to_string(),
            parameter: parameter.to_string(),
        });
    }
    if model.get_global_quantity(name).is_some() {
        Ok(NoiseTarget::GlobalQuantity(name.to_string()))
    } else if model.get_compartment(name).is_some() {
        Ok(NoiseTarget::CompartmentSize(name.to_string()))
    } else if model.get_species(name).is_some() {
        Ok(NoiseTarget::SpeciesConcentration(name.to_string()))
    } else {
        bail!("no compartment, species or global quantity named '{name}'")
    }
}

/// Input name with the lattice size appended, e.g. model_2x3.json
fn default_output(input: &Path, shape: &[usize]) -> PathBuf {
    let dims: Vec<String> = shape.iter().map(|n| n.to_string()).collect();
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("model");
    let name = match input.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}_{}.{ext}", dims.join("x")),
        None => format!("{stem}_{}", dims.join("x")),
    };
    input.with_file_name(name)
}

fn load_model(path: &Path) -> Result<Model> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let model: Model = serde_json::from_str(&text)
        .with_context(|| format!("cannot parse {}", path.display()))?;
    Ok(model)
}

fn load_config(path: &Path) -> Result<ReplicationConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let config: ReplicationConfig = serde_json::from_str(&text)
        .with_context(|| format!("cannot parse {}", path.display()))?;
    Ok(config)
}

fn write_model(model: &Model, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(model)?;
    fs::write(path, text).with_context(|| format!("cannot write {}", path.display()))?;
    Ok(())
}

fn print_summary(model: &Model) {
    let summary = model.summary();
    println!("Reactions:         {}", summary.reactions);
    println!(
        "Species:           {}\t(Reactions: {}, Fixed: {}, Assignment: {}, ODE: {})",
        summary.species.total(),
        summary.species.reactions,
        summary.species.fixed,
        summary.species.assignment,
        summary.species.ode
    );
    println!(
        "Compartments:      {}\t(Fixed: {}, Assignment: {}, ODE: {})",
        summary.compartments.total(),
        summary.compartments.fixed,
        summary.compartments.assignment,
        summary.compartments.ode
    );
    println!(
        "Global quantities: {}\t(Fixed: {}, Assignment: {}, ODE: {})",
        summary.global_quantities.total(),
        summary.global_quantities.fixed,
        summary.global_quantities.assignment,
        summary.global_quantities.ode
    );
    println!("Events:            {}", summary.events);
}
