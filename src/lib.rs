//! # somfilt - SOM-based variant quality filtering
//!
//! Learns the shape of known-good variant sites from a table of per-site
//! numeric annotations using an ensemble of Self-Organizing Maps, scores
//! every site by its distance from the trained manifold, and evaluates the
//! score threshold against a quality metric (ts/tv for SNPs, repeat
//! consistency for indels). Chosen cutoffs can then be applied back to a
//! variant-call file as a PASS/FailSOM filter.

pub mod apply;
pub mod dists;
pub mod eval;
pub mod filter;
pub mod reader;
pub mod score;
pub mod som;
pub mod sort;
pub mod train;

use serde::{Deserialize, Serialize};

/// Number of fixed leading columns in the annotation table:
/// CHROM, POS, MASK, REF, ALT.
pub const NFIXED: usize = 5;

/// Maximum number of selectable annotation slots, limited by the bits
/// available in the per-record presence mask.
pub const MAX_SLOTS: usize = 62;

/// Bit in the per-record mask marking a known-good site.
pub const MASK_GOOD: u8 = 2;

/// True if the record mask marks a known-good site.
pub fn is_good(mask: u8) -> bool {
    mask & MASK_GOOD != 0
}

/// Parse a 0/1 pattern string (e.g. "010") into a bitmask; bit i is set when
/// the i-th character is '1'.
pub fn parse_mask(s: &str) -> u32 {
    let mut mask = 0;
    for (i, c) in s.chars().enumerate().take(32) {
        if c == '1' {
            mask |= 1 << i;
        }
    }
    mask
}

/// True if the row mask string has a '1' in any bit position that is also
/// set in `mask`. Scanning stops at the first character that is not 0 or 1.
pub fn str_mask_set(s: &str, mask: u32) -> bool {
    for (i, c) in s.chars().enumerate().take(32) {
        match c {
            '1' if mask & (1 << i) != 0 => return true,
            '0' | '1' => {}
            _ => break,
        }
    }
    false
}

/// Variant type the evaluation metric is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariantType {
    Snp,
    Indel,
}

impl std::str::FromStr for VariantType {
    type Err = SomError;

    fn from_str(s: &str) -> SomResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SNP" => Ok(VariantType::Snp),
            "INDEL" => Ok(VariantType::Indel),
            _ => Err(SomError::InvalidConfig(format!(
                "the variant type \"{}\" not recognised, expected SNP or INDEL",
                s
            ))),
        }
    }
}

/// Error types for the somfilt library
#[derive(Debug, thiserror::Error)]
pub enum SomError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTSlib error: {0}")]
    Htslib(#[from] rust_htslib::errors::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid table format: {0}")]
    InvalidTable(String),

    #[error("Invalid filter expression: {0}")]
    InvalidFilter(String),

    #[error("The annotation {0} does not look good, please leave it out")]
    DegenerateAnnotation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("External sort failed: {0}")]
    Sort(String),

    #[error("Sites file out of sync: {0}")]
    SitesOutOfSync(String),
}

pub type SomResult<T> = Result<T, SomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mask() {
        assert_eq!(parse_mask("010"), 0b010);
        assert_eq!(parse_mask("000"), 0);
        assert_eq!(parse_mask("101"), 0b101);
        assert_eq!(parse_mask("1"), 1);
        assert_eq!(parse_mask(""), 0);
    }

    #[test]
    fn test_good_mask_intersection() {
        let good = parse_mask("010");
        assert!(str_mask_set("0100", good));
        assert!(!str_mask_set("1001", good));
        assert!(str_mask_set("0110", good));
    }

    #[test]
    fn test_zero_mask_never_good() {
        let good = parse_mask("000");
        assert!(!str_mask_set("111", good));
        assert!(!str_mask_set("010", good));
    }

    #[test]
    fn test_mask_scan_stops_at_non_binary() {
        // the '1' after the '.' must not count
        assert!(!str_mask_set("0.1", parse_mask("001")));
    }

    #[test]
    fn test_variant_type_parse() {
        assert_eq!("SNP".parse::<VariantType>().unwrap(), VariantType::Snp);
        assert_eq!("indel".parse::<VariantType>().unwrap(), VariantType::Indel);
        assert!("MNP".parse::<VariantType>().is_err());
    }

    #[test]
    fn test_is_good() {
        assert!(is_good(3));
        assert!(is_good(2));
        assert!(!is_good(1));
    }
}
