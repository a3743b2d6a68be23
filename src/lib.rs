// lib.rs
pub mod blockvec;
pub mod dense;
pub mod filter;
pub mod input;
pub mod iteration;
pub mod mpiutils;
pub mod operator;
pub mod ortho;
pub mod projector;
pub mod residual;
pub mod utils;

#[cfg(test)]
pub mod testsupport;

use std::time::Duration;

use thiserror::Error;

// Pipeline stage reported alongside every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Filter,
    Orthonormalization,
    Projection,
    Residual,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Filter => "filter",
            Stage::Orthonormalization => "orthonormalization",
            Stage::Projection => "projection",
            Stage::Residual => "residual",
        };
        write!(f, "{name}")
    }
}

/// Failure taxonomy of the filtered subspace iteration. Numerical degeneracy
/// of the trial subspace is the only condition with a local recovery path
/// (strategy fallback in the orthonormalizer); everything else aborts the
/// current iteration and surfaces to the driver.
#[derive(Debug, Error)]
pub enum SolverError {
    /// The overlap matrix of the trial block lost numerical rank: an
    /// eigenvalue came out not-a-number or below the degeneracy threshold.
    #[error("{stage} stage: degenerate trial subspace, overlap eigenvalue {min_eigenvalue:.3e}")]
    DegenerateSubspace { stage: Stage, min_eigenvalue: f64 },

    /// A requested option combination this build cannot serve, detected
    /// before any computation runs.
    #[error("unsupported configuration: {detail}")]
    UnsupportedConfiguration { detail: String },

    /// The dense eigendecomposition backend reported failure.
    #[error("{stage} stage: dense eigensolve failed: {detail}")]
    DenseSolveFailure { stage: Stage, detail: String },

    /// A vector block arrived with a column count or distributed layout that
    /// does not match what the callee was configured for.
    #[error("{stage} stage: block width {found} does not match expected width {expected}")]
    LayoutMismatch {
        stage: Stage,
        expected: usize,
        found: usize,
    },
}

// Wall time accumulated per pipeline stage over one or more iterations.
#[derive(Default, Debug, Clone)]
pub struct StageTimings {
    pub filter: Duration,
    pub orthonormalization: Duration,
    pub projection_assembly: Duration,
    pub dense_solve: Duration,
    pub subspace_rotation: Duration,
    pub residual: Duration,
}

/// Side channel handed through every solver call: verbosity-gated printing
/// and stage timings live here instead of in process-wide state, so the
/// solver core stays reentrant.
pub struct RunContext {
    pub verbose: bool,
    pub is_root: bool,
    pub timings: StageTimings,
}

impl RunContext {
    /// Create a context. `is_root` should be true on exactly one rank so
    /// tables are printed once.
    /// # Arguments:
    ///     `verbose`: bool, whether progress lines are printed at all.
    ///     `is_root`: bool, whether this rank prints.
    pub fn new(verbose: bool, is_root: bool) -> Self {
        Self {
            verbose,
            is_root,
            timings: StageTimings::default(),
        }
    }

    /// Print a progress line on the printing rank when verbose.
    pub fn log(&self, message: &str) {
        if self.verbose && self.is_root {
            println!("{message}");
        }
    }
}
