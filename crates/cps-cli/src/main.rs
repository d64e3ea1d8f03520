//! clusterpower CLI

mod design_spec;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cps_core::Method;
use cps_power::{PowerConfig, ReferenceBackend, Workers};
use cps_prob::AdjustMethod;
use std::path::PathBuf;

use crate::design_spec::DesignSpec;

#[derive(Parser)]
#[command(name = "clusterpower")]
#[command(about = "clusterpower - Simulation-based power for multi-arm cluster-randomized trials")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate power by simulation
    Power {
        /// Design spec (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for the report (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Worker threads: a count or "all". Sequential when omitted.
        #[arg(long)]
        workers: Option<Workers>,

        /// Run seed. Random when neither this nor the design file sets one.
        #[arg(long)]
        seed: Option<u64>,

        /// Number of simulated trials
        #[arg(long)]
        nsim: Option<usize>,

        /// Fitting method (glmm, gee)
        #[arg(long, value_parser = parse_method)]
        method: Option<Method>,

        /// Multiple-comparison adjustment (holm, hochberg, hommel, bonferroni, BH, BY, fdr, none)
        #[arg(long)]
        adjust: Option<AdjustMethod>,

        /// Keep every simulated dataset in the report
        #[arg(long)]
        keep_raw_data: bool,

        /// Do not stop on a high non-convergence / singular-fit rate
        #[arg(long)]
        poor_fit_override: bool,

        /// Do not stop on low running power
        #[arg(long)]
        low_power_override: bool,

        /// Skip the warm-up run-time projection
        #[arg(long)]
        time_limit_override: bool,
    },

    /// Simulate one dataset from a design spec
    Generate {
        /// Design spec (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Seed
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Output file (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print version
    Version,
}

fn parse_method(s: &str) -> std::result::Result<Method, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown method '{s}' (expected glmm or gee)"))
}

/// Run-setting flags; each one overrides the design file when given.
struct PowerFlags {
    workers: Option<Workers>,
    seed: Option<u64>,
    nsim: Option<usize>,
    method: Option<Method>,
    adjust: Option<AdjustMethod>,
    keep_raw_data: bool,
    poor_fit_override: bool,
    low_power_override: bool,
    time_limit_override: bool,
}

impl PowerFlags {
    fn apply(self, cfg: &mut PowerConfig) {
        if let Some(w) = self.workers {
            cfg.workers = w;
        }
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
        if let Some(n) = self.nsim {
            cfg.nsim = n;
        }
        if let Some(m) = self.method {
            cfg.method = m;
        }
        if let Some(a) = self.adjust {
            cfg.adjust = a;
        }
        cfg.keep_raw_data |= self.keep_raw_data;
        cfg.overrides.poor_fit |= self.poor_fit_override;
        cfg.overrides.low_power |= self.low_power_override;
        cfg.overrides.time_limit |= self.time_limit_override;
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Power {
            input,
            output,
            workers,
            seed,
            nsim,
            method,
            adjust,
            keep_raw_data,
            poor_fit_override,
            low_power_override,
            time_limit_override,
        } => {
            let flags = PowerFlags {
                workers,
                seed,
                nsim,
                method,
                adjust,
                keep_raw_data,
                poor_fit_override,
                low_power_override,
                time_limit_override,
            };
            cmd_power(&input, output.as_ref(), flags)
        }
        Commands::Generate { input, seed, output } => cmd_generate(&input, seed, output.as_ref()),
        Commands::Version => {
            println!("clusterpower {}", cps_core::VERSION);
            Ok(())
        }
    }
}

fn load_spec(input: &PathBuf) -> Result<DesignSpec> {
    tracing::info!(path = %input.display(), "loading design spec");
    let json = std::fs::read_to_string(input)?;
    Ok(DesignSpec::from_json(&json)?)
}

fn cmd_power(input: &PathBuf, output: Option<&PathBuf>, flags: PowerFlags) -> Result<()> {
    let mut spec = load_spec(input)?;
    flags.apply(&mut spec.run);
    let (design, cfg) = spec.into_parts()?;

    let report = cps_power::run_power(&design, &cfg, &ReferenceBackend::new())?;
    tracing::info!(
        status = ?report.status,
        completed = report.nsim_completed,
        wall_s = report.wall_s,
        "power run complete"
    );

    // The partial report is written before an abort is surfaced as an error.
    write_json(output, serde_json::to_value(&report)?)?;
    report.into_result()?;
    Ok(())
}

fn cmd_generate(input: &PathBuf, seed: u64, output: Option<&PathBuf>) -> Result<()> {
    let (design, _) = load_spec(input)?.into_parts()?;
    let data = cps_power::generate(&design, seed)?;
    tracing::info!(observations = data.len(), clusters = data.n_clusters, "dataset generated");
    write_json(output, serde_json::to_value(&data)?)
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
