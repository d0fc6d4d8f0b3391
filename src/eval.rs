//! Threshold sweep over the scored sites
//!
//! The sites file is externally sorted by score; a single scan then sweeps
//! the threshold upward, tracking the class counters and emitting a table
//! row whenever the quality metric drifts.

use crate::sort::spawn_sort;
use crate::{SomError, SomResult, VariantType};
use rust_htslib::bgzf;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};

/// Minimum metric drift between emitted rows.
const METRIC_STEP: f64 = 0.005;

/// Fraction of rows consumed before any row is emitted.
const WARMUP_FRACTION: f64 = 0.1;

fn metric_of(vtype: VariantType, nclass: &[u64; 3]) -> f64 {
    match vtype {
        VariantType::Snp => nclass[1] as f64 / nclass[0] as f64,
        VariantType::Indel => nclass[1] as f64 / (nclass[1] + nclass[0]) as f64,
    }
}

/// Sweep the score threshold over `<prefix>.sites.gz` and write the
/// metric-vs-sensitivity table `<prefix>.tab`.
pub fn evaluate(
    prefix: &str,
    vtype: VariantType,
    nall: u32,
    ngood: u32,
    sort_args: &[String],
    command: &str,
) -> SomResult<()> {
    log::info!("Evaluating...");
    let sites_path = format!("{}.sites.gz", prefix);

    let mut child = spawn_sort(sort_args, None)?;
    {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SomError::Sort("sort accepted no input handle".to_string()))?;
        let gz = bgzf::Reader::from_path(&sites_path)?;
        for line in BufReader::new(gz).lines() {
            let line = line?;
            if line.starts_with('#') {
                continue;
            }
            // score, class and mask are all the sweep needs
            let mut fields = line.splitn(4, '\t');
            let (score, class, mask) = match (fields.next(), fields.next(), fields.next()) {
                (Some(s), Some(c), Some(m)) => (s, c, m),
                _ => {
                    return Err(SomError::InvalidTable(format!(
                        "malformed sites line in {}: [{}]",
                        sites_path, line
                    )))
                }
            };
            writeln!(stdin, "{}\t{}\t{}", score, class, mask)?;
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SomError::Sort("sort produced no output handle".to_string()))?;

    let tab_path = format!("{}.tab", prefix);
    let mut out = BufWriter::new(File::create(&tab_path)?);
    match vtype {
        VariantType::Snp => writeln!(
            out,
            "# [1]ts/tv (all)\t[2]nAll\t[3]sensitivity\t[4]ts/tv (novel)\t[5]threshold"
        )?,
        VariantType::Indel => writeln!(
            out,
            "# [1]repeat consistency (all)\t[2]nAll\t[3]sensitivity\t[4]repeat consistency (novel)\t[5]threshold"
        )?,
    }
    writeln!(out, "# somfilt_version={}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "# somfilt_command={}", command)?;

    let mut prev_metric = -1.0f64;
    let mut nall_read = 0u32;
    let mut ngood_read = 0u32;
    let mut nclass = [0u64; 3];
    let mut nclass_novel = [0u64; 3];

    for line in BufReader::new(stdout).lines() {
        let line = line?;
        let mut fields = line.split('\t');
        let parse_err =
            || SomError::InvalidTable(format!("malformed sorted sites line: [{}]", line));
        let threshold: f64 = fields.next().ok_or_else(parse_err)?.parse().map_err(|_| parse_err())?;
        let class: usize = fields.next().ok_or_else(parse_err)?.parse().map_err(|_| parse_err())?;
        let mask: u64 = fields.next().ok_or_else(parse_err)?.parse().map_err(|_| parse_err())?;
        if class > 2 {
            return Err(parse_err());
        }

        nall_read += 1;
        nclass[class] += 1;
        if mask & 1 != 0 {
            ngood_read += 1;
        } else if ngood > 0 {
            nclass_novel[class] += 1;
        }

        if (nall_read as f64) < WARMUP_FRACTION * nall as f64 {
            continue;
        }

        let metric = metric_of(vtype, &nclass);
        if prev_metric == -1.0 || (prev_metric - metric).abs() > METRIC_STEP {
            let metric_novel = if nclass_novel[0] == 0 {
                0.0
            } else {
                metric_of(vtype, &nclass_novel)
            };
            let sensitivity = if ngood > 0 {
                100.0 * ngood_read as f64 / ngood as f64
            } else {
                0.0
            };
            writeln!(
                out,
                "{:.3}\t{}\t{:.2}\t{:.3}\t{:e}",
                metric, nall_read, sensitivity, metric_novel, threshold
            )?;
            prev_metric = metric;
        }
    }
    out.flush()?;

    let status = child.wait()?;
    if !status.success() {
        return Err(SomError::Sort(format!("sort exited with {}", status)));
    }
    Ok(())
}
