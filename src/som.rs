//! Ensemble of 2-D self-organizing maps
//!
//! Each map is a square grid of weight vectors trained online with an
//! exponentially decaying neighborhood radius and learning rate. Every
//! training update goes to one randomly chosen map of the ensemble; scoring
//! takes the minimum distance over all sufficiently trained cells of all
//! maps.

use crate::{SomError, SomResult};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Tunables of the map ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SomParams {
    /// Grid cells per side.
    pub nbin: usize,
    /// Initial learning rate.
    pub learn: f64,
    /// Activation threshold: cells whose normalized influence stays below it
    /// never contribute to a score.
    pub th: f64,
    /// Number of independently initialized maps.
    pub nsom: usize,
}

impl Default for SomParams {
    fn default() -> Self {
        SomParams {
            nbin: 20,
            learn: 0.1,
            th: 0.2,
            nsom: 1,
        }
    }
}

impl SomParams {
    /// Parse the `bins,learn-rate,threshold,ensemble-size` option value.
    pub fn parse(s: &str) -> SomResult<Self> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 4 {
            return Err(SomError::InvalidConfig(format!(
                "could not parse map parameters \"{}\", expected nbin,learn,th,nsom",
                s
            )));
        }
        let bad = |s: &str| SomError::InvalidConfig(format!("could not parse map parameter \"{}\"", s));
        Ok(SomParams {
            nbin: parts[0].parse().map_err(|_| bad(parts[0]))?,
            learn: parts[1].parse().map_err(|_| bad(parts[1]))?,
            th: parts[2].parse().map_err(|_| bad(parts[2]))?,
            nsom: parts[3].parse().map_err(|_| bad(parts[3]))?,
        })
    }
}

/// Parse the `ntrain,fraction` option value; a fraction above 1 is taken as
/// a percentage.
pub fn parse_ntrain(s: &str) -> SomResult<(usize, f64)> {
    let (n, frac) = s.split_once(',').ok_or_else(|| {
        SomError::InvalidConfig(format!(
            "could not parse training sites \"{}\", expected ntrain,fraction",
            s
        ))
    })?;
    let n: usize = n
        .parse()
        .map_err(|_| SomError::InvalidConfig(format!("could not parse \"{}\"", n)))?;
    let mut frac: f64 = frac
        .parse()
        .map_err(|_| SomError::InvalidConfig(format!("could not parse \"{}\"", frac)))?;
    if frac > 1.0 {
        frac *= 0.01;
    }
    Ok((n, frac))
}

/// A trained (or in-training) map ensemble.
#[derive(Debug, Clone)]
pub struct Som {
    nbin: usize,
    nsom: usize,
    kdim: usize,
    learn: f64,
    th: f64,
    ntrain: usize,
    /// nsom * nbin * nbin weight vectors of dimension kdim.
    weights: Vec<f64>,
    /// Per-cell accumulated learning influence, normalized to [0,1] after
    /// training.
    influence: Vec<f64>,
    /// Per-map update counters.
    updates: Vec<u32>,
}

impl Som {
    pub fn new(params: &SomParams, kdim: usize, ntrain: usize) -> Self {
        let ncell = params.nbin * params.nbin;
        Som {
            nbin: params.nbin,
            nsom: params.nsom,
            kdim,
            learn: params.learn,
            th: params.th,
            ntrain,
            weights: vec![0.0; params.nsom * ncell * kdim],
            influence: vec![0.0; params.nsom * ncell],
            updates: vec![0; params.nsom],
        }
    }

    /// Draw all weights uniformly from [0,1].
    pub fn randomize(&mut self, rng: &mut StdRng) {
        for w in &mut self.weights {
            *w = rng.gen::<f64>();
        }
    }

    pub fn kdim(&self) -> usize {
        self.kdim
    }

    pub fn ntrain(&self) -> usize {
        self.ntrain
    }

    pub fn set_ntrain(&mut self, ntrain: usize) {
        self.ntrain = ntrain;
    }

    pub fn updates(&self) -> &[u32] {
        &self.updates
    }

    pub fn influence(&self, map: usize) -> &[f64] {
        let ncell = self.nbin * self.nbin;
        &self.influence[map * ncell..(map + 1) * ncell]
    }

    /// One online training update with the given input vector.
    pub fn train(&mut self, vec: &[f64], rng: &mut StdRng) {
        if self.ntrain == 0 {
            return;
        }
        let jsom = if self.nsom == 1 {
            0
        } else {
            rng.gen_range(0..self.nsom)
        };
        let ncell = self.nbin * self.nbin;
        let wbase = jsom * ncell * self.kdim;
        let cbase = jsom * ncell;

        // best-matching unit; ties go to the first cell in row-major order
        let mut min_dist = f64::INFINITY;
        let (mut imin, mut jmin) = (0usize, 0usize);
        for i in 0..self.nbin {
            for j in 0..self.nbin {
                let off = wbase + (i * self.nbin + j) * self.kdim;
                let dist: f64 = self.weights[off..off + self.kdim]
                    .iter()
                    .zip(vec)
                    .map(|(w, v)| (v - w) * (v - w))
                    .sum();
                if dist < min_dist {
                    min_dist = dist;
                    imin = i;
                    jmin = j;
                }
            }
        }

        // the time counter advances before the update is applied
        let t = self.updates[jsom] as f64 * self.nsom as f64;
        self.updates[jsom] += 1;
        let decay = (-t / self.ntrain as f64).exp();
        let radius = self.nbin as f64 * decay;
        let radius2 = radius * radius;
        let rate = self.learn * decay;

        for i in 0..self.nbin {
            for j in 0..self.nbin {
                let di = i as f64 - imin as f64;
                let dj = j as f64 - jmin as f64;
                let d2 = di * di + dj * dj;
                if d2 > radius2 {
                    continue;
                }
                // fourth-power kernel; the default activation threshold is
                // tuned to this shape
                let alpha = (-d2 * d2 * 0.5 / radius2).exp() * rate;
                let off = wbase + (i * self.nbin + j) * self.kdim;
                for k in 0..self.kdim {
                    let w = &mut self.weights[off + k];
                    *w += alpha * (vec[k] - *w);
                }
                self.influence[cbase + i * self.nbin + j] += alpha;
            }
        }
    }

    /// Rescale each map's influence accumulator by its maximum, turning it
    /// into a [0,1]-valued activation mass.
    pub fn normalize(&mut self) {
        let ncell = self.nbin * self.nbin;
        for m in 0..self.nsom {
            let cells = &mut self.influence[m * ncell..(m + 1) * ncell];
            let max = cells.iter().cloned().fold(0.0f64, f64::max);
            if max > 0.0 {
                for c in cells {
                    *c /= max;
                }
            }
        }
    }

    /// Minimum squared distance from the vector to any cell whose activation
    /// mass reaches the threshold, over all maps of the ensemble.
    pub fn distance(&self, vec: &[f64]) -> f64 {
        let ncell = self.nbin * self.nbin;
        let mut best = f64::INFINITY;
        for cell in 0..self.nsom * ncell {
            if self.influence[cell] < self.th {
                continue;
            }
            let off = cell * self.kdim;
            let dist: f64 = self.weights[off..off + self.kdim]
                .iter()
                .zip(vec)
                .map(|(w, v)| (v - w) * (v - w))
                .sum();
            if dist < best {
                best = dist;
            }
        }
        best
    }

    /// Distance normalized by the maximum possible squared distance for
    /// inputs in [0,1]^kdim, yielding a score in [0,1].
    pub fn score(&self, vec: &[f64]) -> f64 {
        self.distance(vec) / self.kdim as f64
    }
}
