//! Comparison-predicate filter expressions over named annotations
//!
//! Grammar: `predicate ('&' predicate)*` with `predicate := NAME OP NUMBER |
//! NUMBER OP NAME` and `OP` one of `<`, `<=`, `==` (or `=`), `>=`, `>`.
//! Evaluation yields a bitmask with one bit per violated predicate.

use crate::dists::DistSummary;
use crate::reader::Catalog;
use crate::{SomError, SomResult};

/// Maximum number of predicates across one expression; the failure mask
/// shares a 64-bit word with the good bit.
pub const MAX_PREDICATES: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl CmpOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Le),
            "=" | "==" => Some(CmpOp::Eq),
            ">=" => Some(CmpOp::Ge),
            ">" => Some(CmpOp::Gt),
            _ => None,
        }
    }

    /// The operator seen from the other side of the comparison.
    fn mirror(self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ge => CmpOp::Le,
            CmpOp::Gt => CmpOp::Lt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Predicate {
    pub slot: usize,
    pub op: CmpOp,
    pub value: f64,
    pub desc: String,
}

/// A parsed conjunction of predicates.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    preds: Vec<Predicate>,
}

impl FilterSet {
    /// Parse an expression against the catalog. Annotations referenced by a
    /// predicate but not yet selected are added as filter-only slots. With
    /// `dists` supplied the thresholds are given in raw units and stored
    /// post-scaling; otherwise they are stored as written.
    pub fn parse(
        expr: &str,
        catalog: &mut Catalog,
        dists: Option<&DistSummary>,
    ) -> SomResult<Self> {
        let stripped: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
        let mut preds = Vec::new();

        for token in stripped.split('&').filter(|t| !t.is_empty()) {
            let is_op_char = |c: char| c == '<' || c == '>' || c == '=';
            let op_start = token.find(is_op_char).ok_or_else(|| {
                SomError::InvalidFilter(format!("could not parse \"{}\"", token))
            })?;
            let op_len = token[op_start..]
                .chars()
                .take_while(|&c| is_op_char(c))
                .count();
            let left = &token[..op_start];
            let op_str = &token[op_start..op_start + op_len];
            let right = &token[op_start + op_len..];
            if left.is_empty() || right.is_empty() {
                return Err(SomError::InvalidFilter(format!(
                    "could not parse \"{}\"",
                    token
                )));
            }

            let mut op = CmpOp::parse(op_str).ok_or_else(|| {
                SomError::InvalidFilter(format!("unknown operator \"{}\" in \"{}\"", op_str, token))
            })?;

            let (name, value_str) = if catalog.find_col(left).is_some() {
                (left, right)
            } else if catalog.find_col(right).is_some() {
                op = op.mirror();
                (right, left)
            } else {
                return Err(SomError::InvalidFilter(format!(
                    "no such annotation is available: \"{}\"",
                    token
                )));
            };

            let value: f64 = value_str.parse().map_err(|_| {
                SomError::InvalidFilter(format!(
                    "could not parse the threshold \"{}\" in \"{}\"",
                    value_str, token
                ))
            })?;

            let slot = match catalog.slot_of(name) {
                Some(slot) => slot,
                None => catalog.add_extra(name)?,
            };
            let value = match dists {
                Some(d) => d.scale(catalog.slot2col(slot), value),
                None => value,
            };

            preds.push(Predicate {
                slot,
                op,
                value,
                desc: token.to_string(),
            });
        }

        if preds.is_empty() {
            return Err(SomError::InvalidFilter(format!(
                "no predicates found in \"{}\"",
                expr
            )));
        }
        if preds.len() > MAX_PREDICATES {
            return Err(SomError::InvalidFilter(format!(
                "too many predicates ({}), limited to {}",
                preds.len(),
                MAX_PREDICATES
            )));
        }
        Ok(FilterSet { preds })
    }

    /// Failure bitmask over the per-slot values: bit k is set iff the k-th
    /// predicate is violated.
    pub fn evaluate(&self, vals: &[f64]) -> u64 {
        let mut failed = 0u64;
        for (k, p) in self.preds.iter().enumerate() {
            let v = vals[p.slot];
            let fail = match p.op {
                CmpOp::Ge => v < p.value,
                CmpOp::Gt => v <= p.value,
                CmpOp::Eq => v != p.value,
                CmpOp::Lt => v >= p.value,
                CmpOp::Le => v > p.value,
            };
            if fail {
                failed |= 1 << k;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.preds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.preds
    }
}
