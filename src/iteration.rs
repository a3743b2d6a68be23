// iteration.rs
use std::time::Instant;

use mpi::topology::Communicator;

use crate::blockvec::BlockVector;
use crate::filter::{chebyshev_filter, FilterParameters};
use crate::input::SolverOptions;
use crate::operator::Operator;
use crate::ortho::{self, OrthoStrategy};
use crate::projector;
use crate::residual;
use crate::{RunContext, SolverError, Stage};

// Terminal verdict of one filtered iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Converged,
    NeedsAnotherIteration,
}

// Result of one pass through the filter → orthonormalize → project →
// evaluate pipeline.
#[derive(Debug, Clone)]
pub struct IterationOutput {
    /// Ascending eigenvalues, paired 1:1 with the rotated block columns.
    /// Covers every state, or only the valence range [n_core, n) when
    /// spectrum splitting is active.
    pub eigenvalues: Vec<f64>,
    /// Residual norms matched to `eigenvalues`.
    pub residual_norms: Vec<f64>,
    pub outcome: IterationOutcome,
    pub ortho_strategy_used: OrthoStrategy,
}

/// One self-consistency iteration of the filtered subspace solver:
/// Filtering → Orthonormalizing → Projecting → Evaluating. The
/// orthonormalization stage retries once with the fallback strategy on a
/// degenerate overlap when configured; any other failure aborts the
/// iteration. The block is refined in place and carries over as the next
/// iteration's trial subspace.
/// # Arguments:
///     `op`: Operator, the discretized Hamiltonian action.
///     `x`: BlockVector, trial block from the previous iteration.
///     `filter_params`: FilterParameters, suppression band, shift, degree.
///     `options`: SolverOptions, strategy and precision switches.
///     `ctx`: RunContext, verbosity and timing side channel.
///     `world`: Communicator, domain communicator.
///     `interband`: Communicator, inter-band-group communicator.
pub fn run_chebyshev_filtered_iteration<O: Operator>(
    op: &O,
    x: &mut BlockVector,
    filter_params: &FilterParameters,
    options: &SolverOptions,
    ctx: &mut RunContext,
    world: &impl Communicator,
    interband: &impl Communicator,
) -> Result<IterationOutput, SolverError> {
    let width = x.n_vectors();

    // Eager validation, before any computation runs.
    if x.layout != *op.layout() {
        return Err(SolverError::LayoutMismatch {
            stage: Stage::Filter,
            expected: op.layout().local_rows,
            found: x.layout.local_rows,
        });
    }
    if options.use_spectrum_split {
        if !options.use_process_grid {
            return Err(SolverError::UnsupportedConfiguration {
                detail: "spectrum splitting requires the process-grid dense eigensolver, \
                         which is not configured"
                    .to_string(),
            });
        }
        if options.n_core_states >= width {
            return Err(SolverError::UnsupportedConfiguration {
                detail: format!(
                    "core state count {} must stay below the block width {width}",
                    options.n_core_states
                ),
            });
        }
    }

    // Filtering.
    let t = Instant::now();
    chebyshev_filter(op, x, width, filter_params, options.use_mixed_precision_filter);
    ctx.timings.filter += t.elapsed();

    // Orthonormalizing, with the one-shot strategy retry inside.
    let t = Instant::now();
    let ortho_strategy_used = ortho::orthonormalize(x, width, options, ctx, world)?;
    ctx.timings.orthonormalization += t.elapsed();

    // Projecting. The split path rotates the valence states into a separate
    // block and leaves the core columns untouched; the refined valence
    // columns are copied back so the block carries forward as one unit.
    let eigenvalues = if options.use_spectrum_split {
        let n_core = options.n_core_states;
        let mut valence = op.reinit(width - n_core);
        let values = projector::rayleigh_ritz_spectrum_split(
            op, x, &mut valence, width, n_core, options, ctx, world, interband,
        )?;
        x.columns_mut(n_core, width).assign(&valence.local);
        values
    } else {
        projector::rayleigh_ritz(op, x, width, options, ctx, world, interband)?
    };

    // Evaluating.
    let t = Instant::now();
    let residual_norms = if options.use_spectrum_split {
        let n_core = options.n_core_states;
        let mut valence = op.reinit(width - n_core);
        valence.local.assign(&x.columns(n_core, width));
        residual::compute_eigen_residual_norms(
            op,
            &valence,
            &eigenvalues,
            options.residual_block_width,
            world,
        )?
    } else {
        residual::compute_eigen_residual_norms(
            op,
            x,
            &eigenvalues,
            options.residual_block_width,
            world,
        )?
    };
    ctx.timings.residual += t.elapsed();

    let outcome = if residual_norms.iter().all(|&r| r < options.tolerance) {
        IterationOutcome::Converged
    } else {
        IterationOutcome::NeedsAnotherIteration
    };

    Ok(IterationOutput {
        eigenvalues,
        residual_norms,
        outcome,
        ortho_strategy_used,
    })
}
