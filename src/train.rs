//! Reservoir sampling of training vectors and the one-shot map build

use crate::dists::DistSummary;
use crate::filter::FilterSet;
use crate::reader::{Catalog, TableReader};
use crate::som::Som;
use crate::{is_good, SomResult};
use rand::rngs::StdRng;
use rand::Rng;
use std::path::Path;

/// Training vectors drawn from the table, stored flat with a `kdim` stride.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub good: Vec<f64>,
    pub learned: Vec<f64>,
    kdim: usize,
}

impl TrainingSet {
    pub fn ngood(&self) -> usize {
        self.good.len() / self.kdim
    }

    pub fn nlearned(&self) -> usize {
        self.learned.len() / self.kdim
    }

    pub fn len(&self) -> usize {
        self.ngood() + self.nlearned()
    }

    pub fn is_empty(&self) -> bool {
        self.good.is_empty() && self.learned.is_empty()
    }

    pub fn kdim(&self) -> usize {
        self.kdim
    }
}

fn reservoir_push(buf: &mut Vec<f64>, cap: usize, kdim: usize, vec: &[f64], rng: &mut StdRng) {
    if buf.len() / kdim < cap {
        buf.extend_from_slice(vec);
    } else {
        let idx = rng.gen_range(0..cap);
        buf[idx * kdim..(idx + 1) * kdim].copy_from_slice(vec);
    }
}

/// Stream the table and reservoir-sample complete records into two pools:
/// GOOD sites, and non-good sites passing the learning filter. Records with
/// any selected annotation missing never train.
#[allow(clippy::too_many_arguments)]
pub fn sample_training(
    table: &Path,
    catalog: &Catalog,
    dists: &DistSummary,
    good_mask: u32,
    good_cap: usize,
    learn_cap: usize,
    learn_filter: Option<&FilterSet>,
    rng: &mut StdRng,
) -> SomResult<TrainingSet> {
    let kdim = catalog.nsom();
    let nann = catalog.nann();
    let mut good = Vec::with_capacity(good_cap * kdim);
    let mut learned = Vec::with_capacity(learn_cap * kdim);

    let mut reader = TableReader::open(table)?;
    while reader.next_record(catalog, Some(dists), good_mask)? {
        let rec = &reader.record;
        if !rec.is_complete(nann) {
            continue;
        }
        let vec = &rec.vals[..kdim];
        if is_good(rec.mask) {
            if good_cap == 0 {
                continue;
            }
            reservoir_push(&mut good, good_cap, kdim, vec, rng);
        } else {
            let Some(filter) = learn_filter else {
                continue;
            };
            if learn_cap == 0 || filter.evaluate(&rec.vals) != 0 {
                continue;
            }
            reservoir_push(&mut learned, learn_cap, kdim, vec, rng);
        }
    }
    Ok(TrainingSet { good, learned, kdim })
}

/// Feed the sampled vectors to the ensemble: GOOD sites first, then the
/// learning-filter selections, then normalize the influence accumulators.
/// The training budget is capped to the available vector count.
pub fn train_som(som: &mut Som, set: &TrainingSet, rng: &mut StdRng) {
    if set.len() < som.ntrain() {
        log::warn!(
            "Only {} training vectors available, capping the requested {}",
            set.len(),
            som.ntrain()
        );
        som.set_ntrain(set.len());
    }
    log::info!(
        "Selected {} training vectors: {} from good sites, {} from learning-filter sites",
        som.ntrain(),
        set.ngood(),
        set.nlearned()
    );
    for vec in set.good.chunks_exact(set.kdim) {
        som.train(vec, rng);
    }
    for vec in set.learned.chunks_exact(set.kdim) {
        som.train(vec, rng);
    }
    som.normalize();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dists::DistStats;
    use crate::reader::parse_header;
    use crate::som::SomParams;
    use rand::SeedableRng;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    const HEADER: &str = "# [1]CHROM\t[2]POS\t[3]MASK\t[4]REF\t[5]ALT\t[6]QUAL\t[7]DP";

    fn identity_dists(ncols: usize) -> DistSummary {
        let mut per_col = vec![DistStats::default(); ncols];
        for d in per_col.iter_mut() {
            d.scale_lo = 0.0;
            d.scale_hi = 1.0;
            d.nall = 1;
        }
        DistSummary::new(per_col, 1, 1)
    }

    /// ngood rows flagged good, nbad rows not, one row with a missing value.
    fn write_table(dir: &Path, ngood: usize, nbad: usize) -> std::path::PathBuf {
        let path = dir.join("annots.tab");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{}", HEADER).unwrap();
        let mut pos = 1;
        for _ in 0..ngood {
            writeln!(file, "chr1\t{}\t010\tA\tG\t0.8\t0.5", pos).unwrap();
            pos += 1;
        }
        for _ in 0..nbad {
            writeln!(file, "chr1\t{}\t000\tA\tG\t0.7\t0.5", pos).unwrap();
            pos += 1;
        }
        writeln!(file, "chr1\t{}\t010\tA\tG\t.\t0.5", pos).unwrap();
        path
    }

    #[test]
    fn test_reservoir_respects_caps_and_fraction() {
        let dir = tempdir().unwrap();
        let table = write_table(dir.path(), 400, 1000);
        let names = parse_header(HEADER, &table).unwrap();
        let mut catalog = Catalog::new(&names, None).unwrap();
        let dists = identity_dists(catalog.ncols());
        let filter = FilterSet::parse("QUAL>0.5", &mut catalog, None).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        // ntrain 1000 at fraction 0.3
        let (good_cap, learn_cap) = (700, 300);
        let set = sample_training(
            &table,
            &catalog,
            &dists,
            crate::parse_mask("010"),
            good_cap,
            learn_cap,
            Some(&filter),
            &mut rng,
        )
        .unwrap();
        assert!(set.ngood() <= 700);
        assert!(set.nlearned() <= 300);
        assert_eq!(set.ngood(), 400);
        assert_eq!(set.nlearned(), 300);

        // with only 400 good available the budget is capped to 400 + 300
        let mut som = Som::new(&SomParams::default(), catalog.nsom(), 1000);
        som.randomize(&mut rng);
        train_som(&mut som, &set, &mut rng);
        assert_eq!(som.ntrain(), 700);
        assert_eq!(som.updates().iter().sum::<u32>() as usize, 700);
    }

    #[test]
    fn test_learning_sites_skipped_without_filter() {
        let dir = tempdir().unwrap();
        let table = write_table(dir.path(), 10, 50);
        let names = parse_header(HEADER, &table).unwrap();
        let catalog = Catalog::new(&names, None).unwrap();
        let dists = identity_dists(catalog.ncols());
        let mut rng = StdRng::seed_from_u64(1);

        let set = sample_training(
            &table,
            &catalog,
            &dists,
            crate::parse_mask("010"),
            100,
            100,
            None,
            &mut rng,
        )
        .unwrap();
        assert_eq!(set.ngood(), 10);
        assert_eq!(set.nlearned(), 0);
    }

    #[test]
    fn test_missing_annotation_never_trains() {
        let dir = tempdir().unwrap();
        // only the trailing missing-value row is good here
        let table = write_table(dir.path(), 0, 3);
        let names = parse_header(HEADER, &table).unwrap();
        let catalog = Catalog::new(&names, None).unwrap();
        let dists = identity_dists(catalog.ncols());
        let mut rng = StdRng::seed_from_u64(1);

        let set = sample_training(
            &table,
            &catalog,
            &dists,
            crate::parse_mask("010"),
            10,
            0,
            None,
            &mut rng,
        )
        .unwrap();
        assert_eq!(set.ngood(), 0);
    }

    #[test]
    fn test_reservoir_replacement_keeps_size() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut buf = Vec::new();
        for i in 0..50 {
            reservoir_push(&mut buf, 8, 2, &[i as f64, 0.0], &mut rng);
        }
        assert_eq!(buf.len(), 16);
    }
}
