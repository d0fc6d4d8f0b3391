//! Apply chosen score cutoffs back to a variant-call file
//!
//! Streams a VCF in lockstep with one or two scored sites files, adds the
//! FailSOM FILTER and FiltScore INFO headers, and stamps every matched
//! record with its score and a PASS/FailSOM verdict.

use crate::reader::is_gzipped;
use crate::{SomError, SomResult};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rust_htslib::bgzf;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Genomic region restriction, `chr` or `chr:from-to`.
#[derive(Debug, Clone)]
pub struct Region {
    chrom: String,
    from: u32,
    to: u32,
}

impl Region {
    pub fn parse(s: &str) -> SomResult<Self> {
        let bad = || SomError::InvalidConfig(format!("could not parse the region \"{}\"", s));
        match s.split_once(':') {
            None => {
                if s.is_empty() {
                    return Err(bad());
                }
                Ok(Region {
                    chrom: s.to_string(),
                    from: 1,
                    to: u32::MAX,
                })
            }
            Some((chrom, range)) => {
                let (from, to) = range.split_once('-').ok_or_else(bad)?;
                Ok(Region {
                    chrom: chrom.to_string(),
                    from: from.parse().map_err(|_| bad())?,
                    to: to.parse().map_err(|_| bad())?,
                })
            }
        }
    }

    pub fn contains(&self, chrom: &str, pos: u32) -> bool {
        chrom == self.chrom && pos >= self.from && pos <= self.to
    }
}

#[derive(Debug, Clone)]
struct SiteLine {
    score: f64,
    chrom: String,
    pos: u32,
}

/// Streaming reader over a scored sites file, kept position-synchronised
/// with the VCF being annotated.
pub struct SitesReader {
    reader: BufReader<bgzf::Reader>,
    buffered: Option<SiteLine>,
    region: Option<Region>,
    path: String,
}

impl SitesReader {
    pub fn open(path: &Path, region: Option<Region>) -> SomResult<Self> {
        let reader = bgzf::Reader::from_path(path)?;
        Ok(SitesReader {
            reader: BufReader::new(reader),
            buffered: None,
            region,
            path: path.to_string_lossy().to_string(),
        })
    }

    fn fill(&mut self) -> SomResult<()> {
        let mut line = String::new();
        while self.buffered.is_none() {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(());
            }
            let trimmed = line.trim_end();
            if trimmed.starts_with('#') || trimmed.is_empty() {
                continue;
            }
            let fields: Vec<&str> = trimmed.split('\t').collect();
            if fields.len() < 5 {
                return Err(SomError::InvalidTable(format!(
                    "malformed sites line in {}: [{}]",
                    self.path, trimmed
                )));
            }
            let score: f64 = fields[0].parse().map_err(|_| {
                SomError::InvalidTable(format!("could not parse the score: [{}]", trimmed))
            })?;
            let pos: u32 = fields[4].parse().map_err(|_| {
                SomError::InvalidTable(format!("could not parse the position: [{}]", trimmed))
            })?;
            if let Some(region) = &self.region {
                if !region.contains(fields[3], pos) {
                    continue;
                }
            }
            self.buffered = Some(SiteLine {
                score,
                chrom: fields[3].to_string(),
                pos,
            });
        }
        Ok(())
    }

    /// Score of the site matching the current VCF record, consuming it.
    /// Returns `None` when the record has no scored counterpart yet; a
    /// record that has overtaken the buffered site is fatal.
    pub fn match_site(&mut self, chrom: &str, pos: u32) -> SomResult<Option<f64>> {
        self.fill()?;
        let Some(site) = &self.buffered else {
            return Ok(None);
        };
        if site.chrom != chrom {
            return Err(SomError::SitesOutOfSync(format!(
                "{} positioned on a different chromosome ({} vs {}), did you want a region restriction?",
                self.path, site.chrom, chrom
            )));
        }
        if pos < site.pos {
            return Ok(None);
        }
        if pos > site.pos {
            return Err(SomError::SitesOutOfSync(format!(
                "{}: was it created from a different VCF? The conflicting site is {}:{} vs {}",
                self.path, chrom, site.pos, pos
            )));
        }
        let score = site.score;
        self.buffered = None;
        Ok(Some(score))
    }
}

fn has_snp(ref_allele: &str, alts: &str) -> bool {
    ref_allele.len() == 1 && alts.split(',').any(|a| a.len() == 1 && a != ".")
}

fn has_indel(ref_allele: &str, alts: &str) -> bool {
    alts.split(',').any(|a| a != "." && a.len() != ref_allele.len())
}

fn stamp(cols: &mut [String], score: f64, pass: bool) {
    cols[6] = if pass { "PASS" } else { "FailSOM" }.to_string();
    if cols[7] == "." || cols[7].is_empty() {
        cols[7] = format!("FiltScore={}", score);
    } else {
        cols[7] = format!("{};FiltScore={}", cols[7], score);
    }
}

/// What to apply and how.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub snp: Option<(f64, PathBuf)>,
    pub indel: Option<(f64, PathBuf)>,
    pub region: Option<Region>,
    /// Reset FILTER of records absent from the sites files to `.`.
    pub unset_unknowns: bool,
    /// Gzip-compress the output stream.
    pub compress_output: bool,
    pub command: String,
}

fn filter_header(opts: &ApplyOptions) -> String {
    let mut desc = String::from("Failed SOM filter (lower is better):");
    if let Some((th, _)) = &opts.snp {
        desc.push_str(&format!(" SNP cutoff {:e}", th));
        if opts.indel.is_some() {
            desc.push(';');
        }
    }
    if let Some((th, _)) = &opts.indel {
        desc.push_str(&format!(" INDEL cutoff {:e}", th));
    }
    desc.push('.');
    format!("##FILTER=<ID=FailSOM,Description=\"{}\">", desc)
}

/// Annotate a VCF stream with PASS/FailSOM and FiltScore.
pub fn apply_filters<W: Write>(vcf_path: &Path, opts: &ApplyOptions, out: W) -> SomResult<()> {
    let mut snp_sites = match &opts.snp {
        Some((_, path)) => Some(SitesReader::open(path, opts.region.clone())?),
        None => None,
    };
    let mut indel_sites = match &opts.indel {
        Some((_, path)) => Some(SitesReader::open(path, opts.region.clone())?),
        None => None,
    };

    let file = File::open(vcf_path)
        .map_err(|_| SomError::FileNotFound(vcf_path.to_string_lossy().to_string()))?;
    let reader: Box<dyn BufRead> = if is_gzipped(vcf_path)? {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut out: Box<dyn Write + '_> = if opts.compress_output {
        Box::new(GzEncoder::new(out, Compression::default()))
    } else {
        Box::new(out)
    };

    for line in reader.lines() {
        let line = line?;

        if line.starts_with("#CHROM") {
            writeln!(out, "{}", filter_header(opts))?;
            writeln!(
                out,
                "##INFO=<ID=FiltScore,Number=1,Type=Float,Description=\"SOM Filtering Score\">"
            )?;
            writeln!(out, "##somfilt_version={}", env!("CARGO_PKG_VERSION"))?;
            writeln!(out, "##somfilt_command={}", opts.command)?;
            writeln!(out, "{}", line)?;
            continue;
        }
        if line.starts_with('#') {
            writeln!(out, "{}", line)?;
            continue;
        }
        if line.is_empty() {
            continue;
        }

        let mut cols: Vec<String> = line.split('\t').map(str::to_string).collect();
        if cols.len() < 8 {
            writeln!(out, "{}", line)?;
            continue;
        }
        let chrom = cols[0].clone();
        let pos: u32 = cols[1].parse().map_err(|_| {
            SomError::InvalidTable(format!("could not parse the position: [{}]", line))
        })?;
        if let Some(region) = &opts.region {
            if !region.contains(&chrom, pos) {
                continue;
            }
        }
        let is_snp = has_snp(&cols[3], &cols[4]);
        let is_indel = has_indel(&cols[3], &cols[4]);

        let mut matched = false;
        if let (Some((th, _)), Some(sites)) = (&opts.snp, snp_sites.as_mut()) {
            if is_snp {
                if let Some(score) = sites.match_site(&chrom, pos)? {
                    stamp(&mut cols, score, score <= *th);
                    matched = true;
                }
            }
        }
        if !matched {
            if let (Some((th, _)), Some(sites)) = (&opts.indel, indel_sites.as_mut()) {
                if is_indel {
                    if let Some(score) = sites.match_site(&chrom, pos)? {
                        stamp(&mut cols, score, score <= *th);
                        matched = true;
                    }
                }
            }
        }
        if !matched && opts.unset_unknowns {
            cols[6] = ".".to_string();
        }
        writeln!(out, "{}", cols.join("\t"))?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn write_sites(path: &Path, lines: &[&str]) {
        let mut out = bgzf::Writer::from_path(path).unwrap();
        out.write_all(
            b"# [1]score\t[2]variant class\t[3]filter mask, good(&1)\t[4]chromosome\t[5]position\n",
        )
        .unwrap();
        for line in lines {
            writeln!(out, "{}", line).unwrap();
        }
    }

    fn write_vcf(path: &Path, records: &[&str]) {
        let mut file = File::create(path).unwrap();
        writeln!(file, "##fileformat=VCFv4.2").unwrap();
        writeln!(
            file,
            "##INFO=<ID=DP,Number=1,Type=Integer,Description=\"Total Depth\">"
        )
        .unwrap();
        writeln!(file, "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO").unwrap();
        for rec in records {
            writeln!(file, "{}", rec).unwrap();
        }
    }

    #[test]
    fn test_region_parse() {
        let r = Region::parse("chr1:100-200").unwrap();
        assert!(r.contains("chr1", 100));
        assert!(r.contains("chr1", 200));
        assert!(!r.contains("chr1", 99));
        assert!(!r.contains("chr2", 150));

        let whole = Region::parse("chrX").unwrap();
        assert!(whole.contains("chrX", 1_000_000));
        assert!(Region::parse("chr1:100").is_err());
    }

    #[test]
    fn test_apply_thresholds() {
        let dir = tempdir().unwrap();
        let sites = dir.path().join("snp.sites.gz");
        write_sites(
            &sites,
            &["4e-3\t1\t1\tchr1\t100", "6e-3\t0\t0\tchr1\t200"],
        );
        let vcf = dir.path().join("in.vcf");
        write_vcf(
            &vcf,
            &[
                "chr1\t100\t.\tA\tG\t50\t.\tDP=30",
                "chr1\t200\t.\tC\tA\t40\t.\tDP=20",
            ],
        );

        let opts = ApplyOptions {
            snp: Some((0.005, sites)),
            indel: None,
            region: None,
            unset_unknowns: false,
            compress_output: false,
            command: "som_apply test".to_string(),
        };
        let mut out = Vec::new();
        apply_filters(&vcf, &opts, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains("##FILTER=<ID=FailSOM,"));
        assert!(out.contains("##INFO=<ID=FiltScore,Number=1,Type=Float"));
        let records: Vec<&str> = out.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(records.len(), 2);

        let first: Vec<&str> = records[0].split('\t').collect();
        assert_eq!(first[6], "PASS");
        assert_eq!(first[7], "DP=30;FiltScore=0.004");

        let second: Vec<&str> = records[1].split('\t').collect();
        assert_eq!(second[6], "FailSOM");
        assert_eq!(second[7], "DP=20;FiltScore=0.006");
    }

    #[test]
    fn test_unset_unknowns() {
        let dir = tempdir().unwrap();
        let sites = dir.path().join("snp.sites.gz");
        write_sites(&sites, &["4e-3\t1\t1\tchr1\t100"]);
        let vcf = dir.path().join("in.vcf");
        write_vcf(
            &vcf,
            &[
                "chr1\t100\t.\tA\tG\t50\tq10\tDP=30",
                "chr1\t150\t.\tAT\tA\t40\tq10\tDP=20",
            ],
        );

        let opts = ApplyOptions {
            snp: Some((0.005, sites)),
            indel: None,
            region: None,
            unset_unknowns: true,
            compress_output: false,
            command: String::new(),
        };
        let mut out = Vec::new();
        apply_filters(&vcf, &opts, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let records: Vec<&str> = out.lines().filter(|l| !l.starts_with('#')).collect();
        // the indel record has no SNP sites entry: FILTER is reset
        assert_eq!(records[1].split('\t').nth(6).unwrap(), ".");
    }

    #[test]
    fn test_out_of_sync_is_fatal() {
        let dir = tempdir().unwrap();
        let sites = dir.path().join("snp.sites.gz");
        write_sites(&sites, &["4e-3\t1\t1\tchr1\t100"]);
        let vcf = dir.path().join("in.vcf");
        write_vcf(&vcf, &["chr1\t200\t.\tA\tG\t50\t.\tDP=30"]);

        let opts = ApplyOptions {
            snp: Some((0.005, sites)),
            indel: None,
            region: None,
            unset_unknowns: false,
            compress_output: false,
            command: String::new(),
        };
        let err = apply_filters(&vcf, &opts, &mut Vec::<u8>::new()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("100") && msg.contains("200"));
    }

    #[test]
    fn test_region_restriction() {
        let dir = tempdir().unwrap();
        let sites = dir.path().join("snp.sites.gz");
        write_sites(
            &sites,
            &["4e-3\t1\t1\tchr1\t100", "6e-3\t0\t0\tchr1\t200"],
        );
        let vcf = dir.path().join("in.vcf");
        write_vcf(
            &vcf,
            &[
                "chr1\t100\t.\tA\tG\t50\t.\tDP=30",
                "chr1\t200\t.\tC\tA\t40\t.\tDP=20",
            ],
        );

        let opts = ApplyOptions {
            snp: Some((0.005, sites)),
            indel: None,
            region: Some(Region::parse("chr1:150-250").unwrap()),
            unset_unknowns: false,
            compress_output: false,
            command: String::new(),
        };
        let mut out = Vec::new();
        apply_filters(&vcf, &opts, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let records: Vec<&str> = out.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(records.len(), 1);
        assert!(records[0].starts_with("chr1\t200"));
        assert!(records[0].contains("FailSOM"));
    }

    #[test]
    fn test_indel_sites_matching() {
        let dir = tempdir().unwrap();
        let sites = dir.path().join("indel.sites.gz");
        write_sites(&sites, &["2e-3\t1\t1\tchr1\t150"]);
        let vcf = dir.path().join("in.vcf");
        write_vcf(&vcf, &["chr1\t150\t.\tAT\tA\t40\t.\tDP=20"]);

        let opts = ApplyOptions {
            snp: None,
            indel: Some((0.005, sites)),
            region: None,
            unset_unknowns: false,
            compress_output: false,
            command: String::new(),
        };
        let mut out = Vec::new();
        apply_filters(&vcf, &opts, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let record = out.lines().find(|l| !l.starts_with('#')).unwrap();
        assert!(record.contains("PASS"));
        assert!(record.contains("FiltScore=0.002"));
    }
}
