//! Streaming reader for the tab-delimited annotation table

use crate::dists::DistSummary;
use crate::{str_mask_set, SomError, SomResult, MASK_GOOD, MAX_SLOTS, NFIXED};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Required names of the fixed leading columns.
pub const FIXED_COLS: [&str; NFIXED] = ["CHROM", "POS", "MASK", "REF", "ALT"];

/// Check if a file is gzip compressed
pub fn is_gzipped<P: AsRef<Path>>(path: P) -> SomResult<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0; 2];

    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1f, 0x8b]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(SomError::Io(e)),
    }
}

/// Parse the decorated header line (`# [1]CHROM\t[2]POS\t...`) into stripped
/// column names, checking the fixed prefix, uniqueness and the slot budget.
pub fn parse_header(line: &str, path: &Path) -> SomResult<Vec<String>> {
    if !line.starts_with('#') {
        return Err(SomError::InvalidTable(format!(
            "missing header line in {}",
            path.display()
        )));
    }

    let mut colnames = Vec::new();
    for field in line.split('\t') {
        let name = match field.find(']') {
            Some(i) => &field[i + 1..],
            None => {
                return Err(SomError::InvalidTable(format!(
                    "malformed header field \"{}\" in {}",
                    field,
                    path.display()
                )))
            }
        };
        colnames.push(name.to_string());
    }

    if colnames.len() < NFIXED || colnames[..NFIXED] != FIXED_COLS {
        return Err(SomError::InvalidTable(format!(
            "header mismatch in {}: expected the fixed columns {}",
            path.display(),
            FIXED_COLS.join(",")
        )));
    }
    if colnames.len() - NFIXED > MAX_SLOTS {
        return Err(SomError::InvalidTable(format!(
            "too many columns in {} ({}), currently limited to {} annotations",
            path.display(),
            colnames.len(),
            MAX_SLOTS
        )));
    }
    for i in 0..colnames.len() {
        for j in 0..i {
            if colnames[i] == colnames[j] {
                return Err(SomError::InvalidTable(format!(
                    "duplicate column name in {} [{}]",
                    path.display(),
                    colnames[i]
                )));
            }
        }
    }
    Ok(colnames)
}

/// Mapping between table columns and selected annotation slots.
///
/// The first `nsom()` slots are the user-selected annotations fed to the map
/// ensemble; slots added later by filter expressions are used for filtering
/// only.
#[derive(Debug, Clone)]
pub struct Catalog {
    colnames: Vec<String>,
    names: Vec<String>,
    col2slot: Vec<Option<usize>>,
    slot2col: Vec<usize>,
    ignore: Vec<bool>,
    nsom: usize,
}

impl Catalog {
    /// Select annotations by name, or all table annotations when `annots` is
    /// `None`.
    pub fn new(colnames: &[String], annots: Option<&[String]>) -> SomResult<Self> {
        let ncols = colnames.len();
        let mut catalog = Catalog {
            colnames: colnames.to_vec(),
            names: Vec::new(),
            col2slot: vec![None; ncols],
            slot2col: Vec::new(),
            ignore: vec![true; ncols],
            nsom: 0,
        };
        for col in 0..NFIXED {
            catalog.ignore[col] = false;
        }

        match annots {
            None => {
                for col in NFIXED..ncols {
                    let slot = catalog.names.len();
                    catalog.names.push(colnames[col].clone());
                    catalog.col2slot[col] = Some(slot);
                    catalog.slot2col.push(col);
                    catalog.ignore[col] = false;
                }
            }
            Some(requested) => {
                if requested.len() > MAX_SLOTS {
                    return Err(SomError::InvalidConfig(format!(
                        "too many annotations requested ({}), limited to {}",
                        requested.len(),
                        MAX_SLOTS
                    )));
                }
                for name in requested {
                    let col = catalog.find_col(name).ok_or_else(|| {
                        SomError::InvalidConfig(format!(
                            "the requested annotation \"{}\" is not in the table",
                            name
                        ))
                    })?;
                    if catalog.col2slot[col].is_some() {
                        return Err(SomError::InvalidConfig(format!(
                            "the annotation \"{}\" given multiple times?",
                            name
                        )));
                    }
                    let slot = catalog.names.len();
                    catalog.names.push(name.clone());
                    catalog.col2slot[col] = Some(slot);
                    catalog.slot2col.push(col);
                    catalog.ignore[col] = false;
                }
            }
        }
        catalog.nsom = catalog.names.len();
        Ok(catalog)
    }

    /// Add an annotation used only for filtering, returning its slot.
    pub fn add_extra(&mut self, name: &str) -> SomResult<usize> {
        let col = self.find_col(name).ok_or_else(|| {
            SomError::InvalidFilter(format!("the annotation \"{}\" is not available", name))
        })?;
        if let Some(slot) = self.col2slot[col] {
            return Ok(slot);
        }
        if self.names.len() >= MAX_SLOTS {
            return Err(SomError::InvalidFilter(format!(
                "cannot add \"{}\": the {}-slot budget is exhausted",
                name, MAX_SLOTS
            )));
        }
        let slot = self.names.len();
        self.names.push(name.to_string());
        self.col2slot[col] = Some(slot);
        self.slot2col.push(col);
        self.ignore[col] = false;
        Ok(slot)
    }

    /// Column index of a named annotation, if present in the table.
    pub fn find_col(&self, name: &str) -> Option<usize> {
        (NFIXED..self.colnames.len()).find(|&col| self.colnames[col] == name)
    }

    /// Slot of a named annotation, if selected.
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.find_col(name).and_then(|col| self.col2slot[col])
    }

    pub fn ncols(&self) -> usize {
        self.colnames.len()
    }

    /// Number of selected annotation slots, filter-only slots included.
    pub fn nann(&self) -> usize {
        self.names.len()
    }

    /// Number of slots fed to the map ensemble.
    pub fn nsom(&self) -> usize {
        self.nsom
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, slot: usize) -> &str {
        &self.names[slot]
    }

    pub fn colname(&self, col: usize) -> &str {
        &self.colnames[col]
    }

    pub fn is_ignored(&self, col: usize) -> bool {
        self.ignore[col]
    }

    pub fn col2slot(&self, col: usize) -> Option<usize> {
        self.col2slot[col]
    }

    pub fn slot2col(&self, slot: usize) -> usize {
        self.slot2col[slot]
    }
}

/// One parsed table row. String fields remain valid until the next call to
/// `TableReader::next_record`, which overwrites them in place.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub chrom: String,
    pub pos: u32,
    pub mask: u8,
    pub ref_allele: String,
    pub alt_allele: String,
    /// Per-slot values, scaled to [0,1] when scaling is active.
    pub vals: Vec<f64>,
    /// Per-slot values as read from the table.
    pub raw_vals: Vec<f64>,
    pub missing: Vec<bool>,
    /// Number of non-missing selected slots.
    pub nset: usize,
    /// Bit per non-missing slot.
    pub nset_mask: u64,
}

impl Record {
    /// True when every selected annotation is present.
    pub fn is_complete(&self, nann: usize) -> bool {
        self.nset == nann
    }
}

/// Annotation table reader that handles both compressed and uncompressed
/// files. The header is consumed and validated on open.
pub struct TableReader {
    reader: Box<dyn BufRead>,
    line: String,
    lineno: u64,
    colnames: Vec<String>,
    pub record: Record,
}

impl TableReader {
    pub fn open<P: AsRef<Path>>(path: P) -> SomResult<Self> {
        let file = File::open(&path)
            .map_err(|_| SomError::FileNotFound(path.as_ref().to_string_lossy().to_string()))?;

        let mut reader: Box<dyn BufRead> = if is_gzipped(&path)? {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let mut line = String::new();
        reader.read_line(&mut line)?;
        let colnames = parse_header(line.trim_end(), path.as_ref())?;

        Ok(TableReader {
            reader,
            line: String::new(),
            lineno: 1,
            colnames,
            record: Record::default(),
        })
    }

    pub fn colnames(&self) -> &[String] {
        &self.colnames
    }

    /// Read the next row into `self.record`. Returns false at end of input.
    ///
    /// With `dists` supplied, `vals` holds percentile-scaled values;
    /// otherwise it mirrors `raw_vals`. A field of `.`, or a value that
    /// parses to NaN or infinity, sets the slot's missing flag.
    pub fn next_record(
        &mut self,
        catalog: &Catalog,
        dists: Option<&DistSummary>,
        good_mask: u32,
    ) -> SomResult<bool> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(false);
        }
        self.lineno += 1;
        let lineno = self.lineno;

        let nann = catalog.nann();
        let rec = &mut self.record;
        rec.vals.resize(nann, 0.0);
        rec.raw_vals.resize(nann, 0.0);
        rec.missing.clear();
        rec.missing.resize(nann, false);
        rec.nset = 0;
        rec.nset_mask = 0;

        let line = self.line.trim_end_matches(|c| c == '\n' || c == '\r');
        let mut fields = line.split('\t');

        let chrom = fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| SomError::InvalidTable(format!("could not parse CHROM at line {}", lineno)))?;
        rec.chrom.clear();
        rec.chrom.push_str(chrom);

        let pos = fields
            .next()
            .ok_or_else(|| SomError::InvalidTable(format!("could not parse POS at line {}", lineno)))?;
        rec.pos = pos.parse().map_err(|_| {
            SomError::InvalidTable(format!("could not parse POS \"{}\" at line {}", pos, lineno))
        })?;

        let mask = fields
            .next()
            .ok_or_else(|| SomError::InvalidTable(format!("could not parse MASK at line {}", lineno)))?;
        rec.mask = 1 | if good_mask != 0 && str_mask_set(mask, good_mask) {
            MASK_GOOD
        } else {
            0
        };

        let ref_allele = fields
            .next()
            .ok_or_else(|| SomError::InvalidTable(format!("could not parse REF at line {}", lineno)))?;
        rec.ref_allele.clear();
        rec.ref_allele.push_str(ref_allele);

        let alt_allele = fields
            .next()
            .ok_or_else(|| SomError::InvalidTable(format!("could not parse ALT at line {}", lineno)))?;
        rec.alt_allele.clear();
        rec.alt_allele.push_str(alt_allele);

        for col in NFIXED..catalog.ncols() {
            let field = fields.next().ok_or_else(|| {
                SomError::InvalidTable(format!(
                    "truncated line {}: expected {} columns",
                    lineno,
                    catalog.ncols()
                ))
            })?;
            if catalog.is_ignored(col) {
                continue;
            }
            let Some(slot) = catalog.col2slot(col) else {
                continue;
            };
            if field == "." {
                rec.missing[slot] = true;
                continue;
            }
            let value: f64 = field.parse().map_err(|_| {
                SomError::InvalidTable(format!(
                    "could not parse the {} field \"{}\" at line {}",
                    catalog.colname(col),
                    field,
                    lineno
                ))
            })?;
            if !value.is_finite() {
                rec.missing[slot] = true;
                continue;
            }
            rec.raw_vals[slot] = value;
            rec.vals[slot] = match dists {
                Some(d) => d.scale(col, value),
                None => value,
            };
            rec.nset += 1;
            rec.nset_mask |= 1 << slot;
        }
        Ok(true)
    }
}
