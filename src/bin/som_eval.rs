//! CLI that trains the map ensemble, scores all sites and emits the
//! threshold-sweep table

use clap::Parser;
use env_logger::Env;
use rand::rngs::StdRng;
use rand::SeedableRng;
use somfilt::filter::FilterSet;
use somfilt::reader::{Catalog, TableReader};
use somfilt::score::{FastaContext, IndelContext};
use somfilt::som::{parse_ntrain, Som, SomParams};
use somfilt::{dists, eval, parse_mask, score, sort, train, SomError, SomResult, VariantType};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Parser)]
#[command(name = "som_eval")]
#[command(about = "Train a SOM on known-good sites, score all sites and sweep the filtering threshold")]
#[command(long_about = "
Reads a tab-delimited annotation table (CHROM, POS, MASK, REF, ALT followed
by numeric annotations, '.' for missing values, optionally gzip-compressed),
rescales every annotation into [0,1] using exact percentile clamps, trains a
self-organizing map ensemble on the known-good sites, and scores every site
by its distance from the trained manifold.

Three files are produced under the output prefix:
  <prefix>.n         per-annotation distribution summary (re-used when present)
  <prefix>.sites.gz  per-site score, variant class, filter mask, chrom, pos
  <prefix>.tab       quality metric vs. sensitivity as the threshold grows

The metric is the transition/transversion ratio for SNPs and the
repeat-consistency fraction for indels; the latter needs a faidx-indexed
reference sequence. Chosen cutoffs are applied to a VCF with som_apply.
")]
struct Args {
    /// Annotation table, tab-delimited and optionally gzip-compressed
    #[arg(value_name = "FILE")]
    table: PathBuf,

    /// Comma-separated list of annotations (default: all annotations)
    #[arg(short, long, value_name = "LIST")]
    annots: Option<String>,

    /// Prefix of output files (default: the table path)
    #[arg(short = 'p', long, value_name = "PREFIX")]
    output_prefix: Option<String>,

    /// Variant type to evaluate: SNP or INDEL
    #[arg(short = 't', long = "type", default_value = "SNP", value_name = "TYPE")]
    variant_type: String,

    /// faidx-indexed reference sequence, required to classify indels
    #[arg(short = 'F', long, value_name = "FILE")]
    fasta_ref: Option<PathBuf>,

    /// Mask recognising good variants in the MASK column
    #[arg(short, long, default_value = "010", value_name = "MASK")]
    good_mask: String,

    /// Map parameters: bins,learn-rate,activation-threshold,ensemble-size
    #[arg(short, long, default_value = "20,0.1,0.2,1", value_name = "INT,FLOAT,FLOAT,INT")]
    map_params: String,

    /// Number of training sites and the fraction taken from learning-filter
    /// sites (0 means all available good sites)
    #[arg(short = 'n', long, default_value = "0,0", value_name = "INT,FLOAT")]
    ntrain_sites: String,

    /// Filters selecting training sites among non-good rows (scaled values)
    #[arg(short = 'l', long, value_name = "EXPR")]
    learning_filters: Option<String>,

    /// Fixed threshold filters recorded in the sites file (absolute values)
    #[arg(short = 'f', long, value_name = "EXPR")]
    fixed_filter: Option<String>,

    /// Random seed, 0 to seed from the current time
    #[arg(short = 'R', long, default_value_t = 1)]
    random_seed: u64,

    /// Percentile defining the low scaling clamp
    #[arg(long, default_value_t = 0.1, value_name = "FLOAT")]
    lo_pctl: f64,

    /// Percentile defining the high scaling clamp
    #[arg(long, default_value_t = 99.9, value_name = "FLOAT")]
    hi_pctl: f64,

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

    let command = std::env::args().collect::<Vec<_>>().join(" ");
    let vtype: VariantType = args.variant_type.parse()?;
    if vtype == VariantType::Indel && args.fasta_ref.is_none() {
        return Err(SomError::InvalidConfig(
            "expected --fasta-ref with --type INDEL".to_string(),
        ));
    }
    if !args.table.exists() {
        return Err(SomError::FileNotFound(
            args.table.to_string_lossy().to_string(),
        ));
    }

    let prefix = args
        .output_prefix
        .clone()
        .unwrap_or_else(|| args.table.to_string_lossy().into_owned());
    if let Some(parent) = Path::new(&prefix).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let sort_args = sort::sort_args_from_env()?;
    let seed = if args.random_seed == 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(1);
        log::warn!("Random seed {}", now);
        now
    } else {
        args.random_seed
    };
    let map_params = SomParams::parse(&args.map_params)?;
    let (ntrain_req, learn_frac) = parse_ntrain(&args.ntrain_sites)?;
    let good_mask = parse_mask(&args.good_mask);

    let table_reader = TableReader::open(&args.table)?;
    let colnames = table_reader.colnames().to_vec();
    drop(table_reader);
    let annots: Option<Vec<String>> = args
        .annots
        .as_ref()
        .map(|s| s.split(',').map(str::to_string).collect());
    let mut catalog = Catalog::new(&colnames, annots.as_deref())?;

    let dists = dists::load_or_create(
        &args.table,
        &prefix,
        &catalog,
        good_mask,
        args.lo_pctl,
        args.hi_pctl,
        &sort_args,
    )?;

    // annotations referenced only by filters become filter-only slots
    let learn_filter = match &args.learning_filters {
        Some(expr) => Some(FilterSet::parse(expr, &mut catalog, None)?),
        None => None,
    };
    let fixed_filter = match &args.fixed_filter {
        Some(expr) => Some(FilterSet::parse(expr, &mut catalog, Some(&dists))?),
        None => None,
    };

    log::info!("Initializing and training...");
    let ntrain = if ntrain_req == 0 || ntrain_req > dists.ngood as usize {
        dists.ngood as usize
    } else {
        ntrain_req
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let mut som = Som::new(&map_params, catalog.nsom(), ntrain);
    som.randomize(&mut rng);

    let good_cap = (ntrain as f64 * (1.0 - learn_frac)) as usize;
    let learn_cap = (ntrain as f64 * learn_frac) as usize;
    let training = train::sample_training(
        &args.table,
        &catalog,
        &dists,
        good_mask,
        good_cap,
        learn_cap,
        learn_filter.as_ref(),
        &mut rng,
    )?;
    train::train_som(&mut som, &training, &mut rng);

    let ctx = match (vtype, &args.fasta_ref) {
        (VariantType::Indel, Some(path)) => Some(FastaContext::open(path)?),
        _ => None,
    };
    let counts = score::score_sites(
        &args.table,
        &prefix,
        &catalog,
        &dists,
        &som,
        vtype,
        good_mask,
        fixed_filter.as_ref(),
        ctx.as_ref().map(|c| c as &dyn IndelContext),
    )?;

    eval::evaluate(&prefix, vtype, counts.nall, counts.ngood, &sort_args, &command)?;
    log::info!("Threshold table written to {}.tab", prefix);
    Ok(())
}

/// Handle application errors and provide user-friendly messages
fn handle_error(error: SomError) -> ! {
    match error {
        SomError::FileNotFound(path) => {
            eprintln!("Error: File not found: {}", path);
            eprintln!("Please check that the file exists and is readable.");
        }
        SomError::InvalidTable(msg) => {
            eprintln!("Error: Invalid annotation table: {}", msg);
            eprintln!("Was the table produced with the expected fixed columns and [N] header?");
        }
        SomError::InvalidFilter(msg) => {
            eprintln!("Error: Invalid filter expression: {}", msg);
            eprintln!("Expected predicates like 'QUAL>=0.6', joined with '&'.");
        }
        SomError::DegenerateAnnotation(name) => {
            eprintln!("Error: The annotation {} does not look good, please leave it out.", name);
        }
        SomError::InvalidConfig(msg) => {
            eprintln!("Error: Invalid configuration: {}", msg);
        }
        SomError::Sort(msg) => {
            eprintln!("Error: External sort failed: {}", msg);
            eprintln!("Check that the sort utility is on PATH and SORT_ARGS is valid.");
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
