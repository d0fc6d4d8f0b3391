//! CLI that applies chosen score cutoffs back to a VCF on standard output

use clap::Parser;
use env_logger::Env;
use somfilt::apply::{self, ApplyOptions, Region};
use somfilt::{SomError, SomResult};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "som_apply")]
#[command(about = "Annotate a VCF with PASS/FailSOM filters from scored sites files")]
#[command(long_about = "
Streams a VCF in lockstep with the sites files produced by som_eval and
writes the annotated VCF to standard output. Two header lines are added:

  ##FILTER=<ID=FailSOM,...>  with the chosen cutoffs
  ##INFO=<ID=FiltScore,Number=1,Type=Float,...>

Every record found in a sites file gets its FiltScore INFO value and FILTER
set to PASS when the score is at or below the cutoff, FailSOM otherwise.
SNPs and indels use separate sites files and cutoffs; pick the cutoffs from
the som_eval threshold table.
")]
struct Args {
    /// Input VCF, optionally gzip-compressed
    #[arg(value_name = "FILE")]
    vcf: PathBuf,

    /// Filter SNPs at the given score threshold
    #[arg(short = 's', long, value_name = "FLOAT", requires = "snp_sites")]
    snp_threshold: Option<f64>,

    /// Scored sites file for SNPs
    #[arg(long, value_name = "FILE", requires = "snp_threshold")]
    snp_sites: Option<PathBuf>,

    /// Filter indels at the given score threshold
    #[arg(short = 'i', long, value_name = "FLOAT", requires = "indel_sites")]
    indel_threshold: Option<f64>,

    /// Scored sites file for indels
    #[arg(long, value_name = "FILE", requires = "indel_threshold")]
    indel_sites: Option<PathBuf>,

    /// Apply filtering in this region only (chr or chr:from-to)
    #[arg(short, long, value_name = "REGION")]
    region: Option<String>,

    /// Set FILTER of records absent from the sites files to "."
    #[arg(short, long)]
    unset_unknowns: bool,

    /// Output type: 'v' uncompressed VCF, 'z' gzip-compressed VCF
    #[arg(short = 'O', long, default_value = "v", value_name = "v|z")]
    output_type: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn run() -> SomResult<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    let snp = match (args.snp_threshold, &args.snp_sites) {
        (Some(th), Some(path)) => Some((th, path.clone())),
        _ => None,
    };
    let indel = match (args.indel_threshold, &args.indel_sites) {
        (Some(th), Some(path)) => Some((th, path.clone())),
        _ => None,
    };
    if snp.is_none() && indel.is_none() {
        return Err(SomError::InvalidConfig(
            "expected --snp-threshold or --indel-threshold with the matching sites file"
                .to_string(),
        ));
    }
    let compress_output = match args.output_type.as_str() {
        "v" => false,
        "z" => true,
        other => {
            return Err(SomError::InvalidConfig(format!(
                "the output type \"{}\" not recognised, expected v or z",
                other
            )))
        }
    };
    let region = match &args.region {
        Some(s) => Some(Region::parse(s)?),
        None => None,
    };

    let opts = ApplyOptions {
        snp,
        indel,
        region,
        unset_unknowns: args.unset_unknowns,
        compress_output,
        command: std::env::args().collect::<Vec<_>>().join(" "),
    };

    let stdout = std::io::stdout();
    apply::apply_filters(&args.vcf, &opts, stdout.lock())?;
    Ok(())
}

/// Handle application errors and provide user-friendly messages
fn handle_error(error: SomError) -> ! {
    match error {
        SomError::FileNotFound(path) => {
            eprintln!("Error: File not found: {}", path);
            eprintln!("Please check that the file exists and is readable.");
        }
        SomError::SitesOutOfSync(msg) => {
            eprintln!("Error: Sites file out of sync: {}", msg);
            eprintln!("The sites files must come from the same call set, in the same order.");
        }
        SomError::InvalidConfig(msg) => {
            eprintln!("Error: Invalid configuration: {}", msg);
        }
        other => {
            eprintln!("Error: {}", other);
        }
    }
    std::process::exit(1);
}

fn main() {
    if let Err(e) = run() {
        handle_error(e);
    }
}
