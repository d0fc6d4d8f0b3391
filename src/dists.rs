//! Per-annotation distribution statistics and percentile-based rescaling
//!
//! A first full pass over the table collects per-column counts and extremes
//! and spools every finite value to a per-column file. Each file is then run
//! through the external sort utility to find exact percentile clamps, and the
//! result is persisted to a sidecar `<prefix>.n` that later runs re-use.

use crate::reader::{Catalog, TableReader};
use crate::sort::spawn_sort;
use crate::{is_good, SomError, SomResult, NFIXED};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Distribution summary of one annotation column.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DistStats {
    pub nall: u32,
    pub ngood: u32,
    pub nmissing: u32,
    pub good_min: f64,
    pub good_max: f64,
    pub all_min: f64,
    pub all_max: f64,
    pub scale_lo: f64,
    pub scale_hi: f64,
}

/// One row of the sidecar file, in on-disk column order.
#[derive(Debug, Deserialize)]
struct DistRow {
    nall: u32,
    ngood: u32,
    nmissing: u32,
    good_min: f64,
    good_max: f64,
    all_min: f64,
    all_max: f64,
    scale_lo: f64,
    scale_hi: f64,
    name: String,
}

/// Loaded distribution stats, indexed by table column.
#[derive(Debug, Clone)]
pub struct DistSummary {
    per_col: Vec<DistStats>,
    /// Minimum count of finite values across all annotation columns.
    pub nall: u32,
    /// Minimum count of good-site values across all annotation columns.
    pub ngood: u32,
}

impl DistSummary {
    pub fn new(per_col: Vec<DistStats>, nall: u32, ngood: u32) -> Self {
        DistSummary { per_col, nall, ngood }
    }

    pub fn stats(&self, col: usize) -> &DistStats {
        &self.per_col[col]
    }

    /// Scale a raw value of the given column into [0,1].
    pub fn scale(&self, col: usize, value: f64) -> f64 {
        let d = &self.per_col[col];
        scale_value(value, d.scale_lo, d.scale_hi)
    }
}

/// Map a raw value into [0,1] using the percentile clamps.
pub fn scale_value(value: f64, lo: f64, hi: f64) -> f64 {
    if value < lo {
        0.0
    } else if value > hi {
        1.0
    } else {
        (value - lo) / (hi - lo)
    }
}

fn sidecar_path(prefix: &str) -> String {
    format!("{}.n", prefix)
}

/// Build `<prefix>.n` with one streaming pass over the table followed by one
/// external sort per annotation column.
pub fn create_dists(
    table: &Path,
    prefix: &str,
    good_mask: u32,
    lo_pctl: f64,
    hi_pctl: f64,
    sort_args: &[String],
) -> SomResult<()> {
    log::info!(
        "Sorting annotations and creating distribution stats: {}",
        sidecar_path(prefix)
    );

    let mut reader = TableReader::open(table)?;
    let colnames = reader.colnames().to_vec();
    let catalog = Catalog::new(&colnames, None)?;
    let nann = catalog.nann();

    let mut stats = vec![DistStats::default(); nann];
    let mut spools = Vec::with_capacity(nann);
    for slot in 0..nann {
        let path = format!("{}.{}", prefix, catalog.name(slot));
        spools.push(BufWriter::new(File::create(&path)?));
    }

    while reader.next_record(&catalog, None, good_mask)? {
        let rec = &reader.record;
        let good = is_good(rec.mask);
        for slot in 0..nann {
            let d = &mut stats[slot];
            if rec.missing[slot] {
                d.nmissing += 1;
                continue;
            }
            let v = rec.raw_vals[slot];
            if good {
                if d.ngood == 0 {
                    d.good_min = v;
                    d.good_max = v;
                }
                d.good_min = d.good_min.min(v);
                d.good_max = d.good_max.max(v);
                d.ngood += 1;
            }
            if d.nall == 0 {
                d.all_min = v;
                d.all_max = v;
            }
            d.all_min = d.all_min.min(v);
            d.all_max = d.all_max.max(v);
            d.nall += 1;
            writeln!(spools[slot], "{:e}\t{}", v, if good { 1 } else { 0 })?;
        }
    }
    for spool in &mut spools {
        spool.flush()?;
    }
    drop(spools);

    // exact percentile clamps from the sorted value streams
    for slot in 0..nann {
        let path = format!("{}.{}", prefix, catalog.name(slot));
        let mut child = spawn_sort(sort_args, Some(Path::new(&path)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SomError::Sort("sort produced no output handle".to_string()))?;

        let d = &mut stats[slot];
        d.scale_lo = f64::INFINITY;
        d.scale_hi = f64::INFINITY;
        let mut count = 0u32;
        let mut last = f64::NAN;
        for line in BufReader::new(stdout).lines() {
            let line = line?;
            let field = line.split('\t').next().unwrap_or("");
            let value: f64 = field.parse().map_err(|_| {
                SomError::InvalidTable(format!("could not parse sorted value \"{}\"", field))
            })?;
            count += 1;
            let pctl = 100.0 * count as f64 / d.nall as f64;
            if d.scale_lo.is_infinite() || pctl < lo_pctl {
                d.scale_lo = value;
            }
            if d.scale_hi.is_infinite() && pctl > hi_pctl {
                d.scale_hi = value;
            }
            last = value;
        }
        if d.scale_hi.is_infinite() {
            d.scale_hi = last;
        }
        let status = child.wait()?;
        if !status.success() {
            return Err(SomError::Sort(format!(
                "sort exited with {} while processing {}",
                status, path
            )));
        }
        std::fs::remove_file(&path)?;
    }

    let mut out = BufWriter::new(File::create(sidecar_path(prefix))?);
    writeln!(
        out,
        "# [1]nAll\t[2]nGood\t[3]nMissing\t[4]minGood\t[5]maxGood\t[6]minAll\t[7]maxAll\t[8]{:.6} percentile\t[9]{:.6} percentile\t[10]Annotation",
        lo_pctl, hi_pctl
    )?;
    for slot in 0..nann {
        let d = &stats[slot];
        writeln!(
            out,
            "{}\t{}\t{}\t{:e}\t{:e}\t{:e}\t{:e}\t{:e}\t{:e}\t{}",
            d.nall,
            d.ngood,
            d.nmissing,
            d.good_min,
            d.good_max,
            d.all_min,
            d.all_max,
            d.scale_lo,
            d.scale_hi,
            catalog.name(slot)
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Load `<prefix>.n`, building it first if absent.
#[allow(clippy::too_many_arguments)]
pub fn load_or_create(
    table: &Path,
    prefix: &str,
    catalog: &Catalog,
    good_mask: u32,
    lo_pctl: f64,
    hi_pctl: f64,
    sort_args: &[String],
) -> SomResult<DistSummary> {
    let sidecar = sidecar_path(prefix);
    if Path::new(&sidecar).exists() {
        log::warn!("Re-using {}...", sidecar);
    } else {
        create_dists(table, prefix, good_mask, lo_pctl, hi_pctl, sort_args)?;
    }
    load(Path::new(&sidecar), catalog)
}

/// Read a sidecar summary, match its rows to the catalog columns and check
/// the selected annotations for degenerate scaling clamps.
pub fn load(path: &Path, catalog: &Catalog) -> SomResult<DistSummary> {
    let file = File::open(path)
        .map_err(|_| SomError::FileNotFound(path.to_string_lossy().to_string()))?;
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .comment(Some(b'#'))
        .from_reader(file);

    let mut per_col = vec![DistStats::default(); catalog.ncols()];
    for row in rdr.deserialize::<DistRow>() {
        let row = row?;
        let Some(col) = catalog.find_col(&row.name) else {
            continue;
        };
        per_col[col] = DistStats {
            nall: row.nall,
            ngood: row.ngood,
            nmissing: row.nmissing,
            good_min: row.good_min,
            good_max: row.good_max,
            all_min: row.all_min,
            all_max: row.all_max,
            scale_lo: row.scale_lo,
            scale_hi: row.scale_hi,
        };
        if !catalog.is_ignored(col) && row.scale_lo == row.scale_hi {
            return Err(SomError::DegenerateAnnotation(row.name));
        }
    }

    let mut nall = u32::MAX;
    let mut ngood = u32::MAX;
    for col in NFIXED..catalog.ncols() {
        let d = &per_col[col];
        if d.nall == 0 && d.nmissing == 0 {
            return Err(SomError::InvalidTable(format!(
                "no extremes found for the annotation {} in {}",
                catalog.colname(col),
                path.display()
            )));
        }
        nall = nall.min(d.nall);
        ngood = ngood.min(d.ngood);
    }
    Ok(DistSummary { per_col, nall, ngood })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    const HEADER: &str = "# [1]CHROM\t[2]POS\t[3]MASK\t[4]REF\t[5]ALT\t[6]QUAL\t[7]FLAT";

    fn write_table(dir: &Path, rows: &[String]) -> std::path::PathBuf {
        let path = dir.join("annots.tab");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{}", HEADER).unwrap();
        for row in rows {
            writeln!(file, "{}", row).unwrap();
        }
        path
    }

    #[test]
    fn test_scale_value_boundaries() {
        assert_eq!(scale_value(1.0, 1.0, 3.0), 0.0);
        assert_eq!(scale_value(3.0, 1.0, 3.0), 1.0);
        assert_eq!(scale_value(2.0, 1.0, 3.0), 0.5);
        assert_eq!(scale_value(0.0, 1.0, 3.0), 0.0);
        assert_eq!(scale_value(10.0, 1.0, 3.0), 1.0);
    }

    #[test]
    fn test_scale_roundtrip_within_clamps() {
        let (lo, hi) = (2.0, 10.0);
        for v in [2.0, 3.5, 7.25, 10.0] {
            let s = scale_value(v, lo, hi);
            assert!((lo + s * (hi - lo) - v).abs() < 1e-12);
        }
    }

    #[test]
    fn test_create_and_load() {
        let dir = tempdir().unwrap();
        let rows: Vec<String> = (0..10)
            .map(|i| {
                let mask = if i % 2 == 0 { "010" } else { "000" };
                format!("chr1\t{}\t{}\tA\tG\t{}\t{}", 100 + i, mask, i as f64, 5.0 - i as f64)
            })
            .collect();
        let table = write_table(dir.path(), &rows);
        let prefix = dir.path().join("out").to_string_lossy().to_string();

        create_dists(&table, &prefix, crate::parse_mask("010"), 0.1, 99.9, &[]).unwrap();

        let mut reader = TableReader::open(&table).unwrap();
        let colnames = reader.colnames().to_vec();
        let catalog = Catalog::new(&colnames, None).unwrap();
        drop(reader);

        let dists = load(Path::new(&format!("{}.n", prefix)), &catalog).unwrap();
        let qual = dists.stats(5);
        assert_eq!(qual.nall, 10);
        assert_eq!(qual.ngood, 5);
        assert_eq!(qual.nmissing, 0);
        assert_eq!(qual.all_min, 0.0);
        assert_eq!(qual.all_max, 9.0);
        assert_eq!(qual.good_min, 0.0);
        assert_eq!(qual.good_max, 8.0);
        // 10 rows: every rank percentile is a multiple of 10, so the clamps
        // collapse to the column extremes
        assert_eq!(qual.scale_lo, 0.0);
        assert_eq!(qual.scale_hi, 9.0);
        assert_eq!(dists.nall, 10);
        assert_eq!(dists.ngood, 5);
    }

    #[test]
    fn test_constant_annotation_rejected() {
        let dir = tempdir().unwrap();
        let rows: Vec<String> = (0..8)
            .map(|i| format!("chr1\t{}\t010\tA\tG\t{}\t1.0", 100 + i, i as f64))
            .collect();
        let table = write_table(dir.path(), &rows);
        let prefix = dir.path().join("out").to_string_lossy().to_string();

        create_dists(&table, &prefix, crate::parse_mask("010"), 0.1, 99.9, &[]).unwrap();

        let mut reader = TableReader::open(&table).unwrap();
        let colnames = reader.colnames().to_vec();
        let catalog = Catalog::new(&colnames, None).unwrap();
        drop(reader);

        let err = load(Path::new(&format!("{}.n", prefix)), &catalog).unwrap_err();
        assert!(err.to_string().contains("FLAT"));
    }

    #[test]
    fn test_degenerate_ignored_when_not_selected() {
        let dir = tempdir().unwrap();
        let rows: Vec<String> = (0..8)
            .map(|i| format!("chr1\t{}\t010\tA\tG\t{}\t1.0", 100 + i, i as f64))
            .collect();
        let table = write_table(dir.path(), &rows);
        let prefix = dir.path().join("out").to_string_lossy().to_string();

        create_dists(&table, &prefix, crate::parse_mask("010"), 0.1, 99.9, &[]).unwrap();

        let mut reader = TableReader::open(&table).unwrap();
        let colnames = reader.colnames().to_vec();
        // FLAT left out of the selection: its degenerate clamps do not matter
        let catalog = Catalog::new(&colnames, Some(&["QUAL".to_string()])).unwrap();
        drop(reader);

        assert!(load(Path::new(&format!("{}.n", prefix)), &catalog).is_ok());
    }

    #[test]
    fn test_missing_values_counted() {
        let dir = tempdir().unwrap();
        let rows = vec![
            "chr1\t100\t010\tA\tG\t1.0\t2.0".to_string(),
            "chr1\t101\t000\tA\tG\t.\t3.0".to_string(),
            "chr1\t102\t000\tA\tG\t2.0\t4.0".to_string(),
        ];
        let table = write_table(dir.path(), &rows);
        let prefix = dir.path().join("out").to_string_lossy().to_string();
        create_dists(&table, &prefix, crate::parse_mask("010"), 0.1, 99.9, &[]).unwrap();

        let mut reader = TableReader::open(&table).unwrap();
        let colnames = reader.colnames().to_vec();
        let catalog = Catalog::new(&colnames, None).unwrap();
        drop(reader);

        let dists = load(Path::new(&format!("{}.n", prefix)), &catalog).unwrap();
        assert_eq!(dists.stats(5).nmissing, 1);
        assert_eq!(dists.stats(5).nall, 2);
        // nall is the minimum across columns
        assert_eq!(dists.nall, 2);
    }
}
