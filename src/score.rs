//! Variant classification and the scoring pass
//!
//! The second streaming pass over the table: every complete record is scored
//! against the trained ensemble, classified (transition/transversion for
//! SNPs, repeat consistency for indels) and appended to the bgzf-compressed
//! `<prefix>.sites.gz` handed to the evaluator and the apply stage.

use crate::dists::DistSummary;
use crate::filter::FilterSet;
use crate::reader::{Catalog, TableReader};
use crate::som::Som;
use crate::{is_good, SomResult, VariantType};
use rust_htslib::{bgzf, faidx};
use std::io::Write;
use std::path::Path;

fn acgt_code(base: u8) -> i32 {
    match base.to_ascii_uppercase() {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => -5,
    }
}

/// SNP class: 1 for a transition, 0 for a transversion.
pub fn snp_class(ref_allele: &str, alt_allele: &str) -> u8 {
    let r = acgt_code(ref_allele.bytes().next().unwrap_or(b'N'));
    let a = acgt_code(alt_allele.bytes().next().unwrap_or(b'N'));
    if (r - a).abs() == 2 {
        1
    } else {
        0
    }
}

/// Repeat context of an indel: number of consecutive repeat-unit copies in
/// the reference, the unit length, and the net length change of the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatInfo {
    pub nrep: i32,
    pub nlen: i32,
    pub ndel: i32,
}

/// Access to the local tandem-repeat structure of the reference at a site.
pub trait IndelContext {
    fn repeat_info(
        &self,
        chrom: &str,
        pos: u32,
        ref_allele: &str,
        alt_allele: &str,
    ) -> Option<RepeatInfo>;
}

/// Indel class: 1 repeat-consistent, 0 repeat-inconsistent, 2 not applicable.
pub fn indel_class(info: Option<RepeatInfo>) -> u8 {
    let Some(info) = info else { return 2 };
    if info.nlen <= 1 || info.nrep <= 1 {
        return 2;
    }
    if info.ndel.abs() % info.nlen == 0 {
        1
    } else {
        0
    }
}

/// Smallest unit that tiles the sequence.
fn min_period(seq: &[u8]) -> usize {
    for period in 1..seq.len() {
        if seq.len() % period != 0 {
            continue;
        }
        if seq.iter().enumerate().all(|(i, &b)| b == seq[i % period]) {
            return period;
        }
    }
    seq.len().max(1)
}

/// Repeat context backed by a faidx-indexed reference sequence.
pub struct FastaContext {
    reader: faidx::Reader,
}

impl FastaContext {
    pub fn open<P: AsRef<Path>>(path: P) -> SomResult<Self> {
        Ok(FastaContext {
            reader: faidx::Reader::from_path(path)?,
        })
    }
}

impl IndelContext for FastaContext {
    fn repeat_info(
        &self,
        chrom: &str,
        pos: u32,
        ref_allele: &str,
        alt_allele: &str,
    ) -> Option<RepeatInfo> {
        let ndel = alt_allele.len() as i32 - ref_allele.len() as i32;
        if ndel == 0 || pos == 0 {
            return None;
        }
        let (short, long) = if ndel > 0 {
            (ref_allele, alt_allele)
        } else {
            (alt_allele, ref_allele)
        };
        // complex allele pairs carry no usable repeat unit
        if !long.starts_with(short) {
            return None;
        }
        let indel_seq = long.as_bytes()[short.len()..].to_ascii_uppercase();
        let nlen = min_period(&indel_seq);
        let unit = &indel_seq[..nlen];

        // start scanning where the unit phase aligns with the repeat run
        let start = pos as usize - 1 + short.len() % nlen;
        let window = nlen * 100;
        let seq = self
            .reader
            .fetch_seq(chrom, start, start + window - 1)
            .ok()?
            .to_ascii_uppercase();
        let mut nrep = 0usize;
        while (nrep + 1) * nlen <= seq.len() && seq[nrep * nlen..(nrep + 1) * nlen] == *unit {
            nrep += 1;
        }
        Some(RepeatInfo {
            nrep: nrep as i32,
            nlen: nlen as i32,
            ndel,
        })
    }
}

/// Class of one record under the configured variant type.
pub fn variant_class(
    vtype: VariantType,
    chrom: &str,
    pos: u32,
    ref_allele: &str,
    alt_allele: &str,
    ctx: Option<&dyn IndelContext>,
) -> u8 {
    match vtype {
        VariantType::Snp => snp_class(ref_allele, alt_allele),
        VariantType::Indel => {
            indel_class(ctx.and_then(|c| c.repeat_info(chrom, pos, ref_allele, alt_allele)))
        }
    }
}

/// Outcome counters of the scoring pass.
#[derive(Debug, Clone, Copy)]
pub struct ScoreCounts {
    pub nall: u32,
    pub ngood: u32,
}

/// Score every complete record and write `<prefix>.sites.gz`.
#[allow(clippy::too_many_arguments)]
pub fn score_sites(
    table: &Path,
    prefix: &str,
    catalog: &Catalog,
    dists: &DistSummary,
    som: &Som,
    vtype: VariantType,
    good_mask: u32,
    fixed_filter: Option<&FilterSet>,
    ctx: Option<&dyn IndelContext>,
) -> SomResult<ScoreCounts> {
    log::info!("Classifying...");
    let sites_path = format!("{}.sites.gz", prefix);
    let mut out = bgzf::Writer::from_path(&sites_path)?;
    out.write_all(
        b"# [1]score\t[2]variant class\t[3]filter mask, good(&1)\t[4]chromosome\t[5]position\n",
    )?;

    let mut reader = TableReader::open(table)?;
    let nann = catalog.nann();
    let max_dist = som.kdim() as f64;
    let mut counts = ScoreCounts { nall: 0, ngood: 0 };

    while reader.next_record(catalog, Some(dists), good_mask)? {
        let rec = &reader.record;
        if !rec.is_complete(nann) {
            continue;
        }
        let score = som.distance(&rec.vals[..som.kdim()]) / max_dist;
        let good = is_good(rec.mask);
        counts.nall += 1;
        if good {
            counts.ngood += 1;
        }
        let class = variant_class(vtype, &rec.chrom, rec.pos, &rec.ref_allele, &rec.alt_allele, ctx);
        let flt_mask = fixed_filter.map(|f| f.evaluate(&rec.vals)).unwrap_or(0);
        let mask = (flt_mask << 1) | u64::from(good);
        writeln!(
            out,
            "{:e}\t{}\t{}\t{}\t{}",
            score, class, mask, rec.chrom, rec.pos
        )?;
    }
    Ok(counts)
}
