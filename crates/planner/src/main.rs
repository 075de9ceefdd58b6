use anyhow::{Context, Result};
use clap::Parser;
use nalgebra::DMatrix;
use planner::{Case, Config, DoseMean, DosePercent, Label, Prescription, export};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

const TUMOR: Label = 0;
const OAR: Label = 1;

#[derive(Parser)]
#[command(author, version, about = "Plan a synthetic tumour/organ-at-risk case", long_about = None)]
struct Args {
    /// Planner configuration file (falls back to $PLANNER_CONFIG, then defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tumour voxels
    #[arg(long, default_value_t = 100)]
    targets: usize,

    /// Organ-at-risk voxels
    #[arg(long, default_value_t = 400)]
    oars: usize,

    /// Beams
    #[arg(long, default_value_t = 50)]
    beams: usize,

    /// Seed for the random influence matrix
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Run the exact second pass
    #[arg(long)]
    two_pass: bool,

    /// Enforce every constraint without slack
    #[arg(long)]
    no_slack: bool,

    /// Write DVH curves as CSV
    #[arg(long)]
    dvh_out: Option<PathBuf>,

    /// Write the dose summary as CSV
    #[arg(long)]
    summary_out: Option<PathBuf>,

    /// Write the plan report as JSON
    #[arg(long)]
    json: Option<PathBuf>,
}

/// Tumour rows uniform in [0, 1), organ-at-risk rows in [0, 0.5).
fn synthetic_case(args: &Args) -> Result<Case> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let m = args.targets + args.oars;
    let a = DMatrix::from_fn(m, args.beams, |i, _| {
        let scale = if i < args.targets { 1.0 } else { 0.5 };
        scale * rng.gen_range(0.0..1.0)
    });

    let mut labels = vec![TUMOR; args.targets];
    labels.extend(std::iter::repeat_n(OAR, args.oars));

    let rx = [
        Prescription {
            label: TUMOR,
            name: "tumor".to_string(),
            is_target: true,
            dose: 1.0,
        },
        Prescription {
            label: OAR,
            name: "oar".to_string(),
            is_target: false,
            dose: 0.0,
        },
    ];
    Ok(Case::new(a, &labels, &[TUMOR, OAR], &rx)?)
}

fn main() -> Result<()> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
    let args = Args::parse();

    // 1. configuration
    let config = match &args.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_env()?,
    };
    config.debug_print();
    let mut options = config.to_plan_options();
    if args.two_pass {
        options.use_2pass = true;
    }
    if args.no_slack {
        options.use_slack = false;
    }

    // 2. case + constraints
    let mut case = synthetic_case(&args)?;
    case.add_dvh_constraint(TUMOR, DosePercent(30.0).at_most(1.05)?)?;
    case.add_dvh_constraint(TUMOR, DosePercent(20.0).at_least(0.8)?)?;
    case.add_dvh_constraint(OAR, DosePercent(50.0).at_most(0.5)?)?;
    case.add_dvh_constraint(OAR, DoseMean.at_most(0.5)?)?;

    // 3. plan
    let report = case.plan(options)?;
    println!("objective: {:.6}", report.objective);
    if let Some(p2) = &report.pass2 {
        println!(
            "pass 1 objective: {:.6}, pass 2 objective: {:.6}",
            report.pass1.objective, p2.objective
        );
    }
    print!("{}", case.summary());

    // 4. outputs
    if let Some(path) = &args.dvh_out {
        export::write_dvh_csv(path, case.structures())?;
    }
    if let Some(path) = &args.summary_out {
        export::write_summary_csv(path, case.structures())?;
    }
    if let Some(path) = &args.json {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}
