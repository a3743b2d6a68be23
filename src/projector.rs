// projector.rs
use std::time::Instant;

use mpi::topology::Communicator;
use ndarray::Array2;

use crate::blockvec::BlockVector;
use crate::dense::{self, ProcessGrid};
use crate::input::SolverOptions;
use crate::mpiutils;
use crate::operator::Operator;
use crate::{RunContext, SolverError, Stage};

/// Push the dense solve results from rank 0 of a communicator to all its
/// ranks so every holder of the same logical eigenpair band rotates with
/// bit-identical factors. Used once over the domain communicator and once
/// over the inter-band-group communicator, since the vector block and the
/// dense matrix can be partitioned along independent process dimensions.
fn broadcast_eigenpairs(
    comm: &impl Communicator,
    values: &mut Vec<f64>,
    rotation: &mut Array2<f64>,
) {
    let dim = rotation.dim();
    let mut payload = (
        std::mem::take(values),
        rotation.iter().copied().collect::<Vec<f64>>(),
    );
    mpiutils::broadcast(comm, &mut payload);
    *values = payload.0;
    *rotation = Array2::from_shape_vec(dim, payload.1).unwrap();
}

/// Rayleigh-Ritz step: project the operator onto the orthonormal block,
/// eigendecompose the projected matrix and rotate the block, X ← X·Q. With
/// the band-contiguous local storage this product is the transposed update
/// Xᵗ ← QᵗXᵗ over each owned basis row. Output eigenvalues ascend and the
/// rotated columns pair with them in order.
/// # Arguments:
///     `op`: Operator, the discretized Hamiltonian action.
///     `x`: BlockVector, orthonormal trial block, rotated in place.
///     `width`: usize, number of columns.
///     `options`: SolverOptions, grid and mixed-precision switches.
///     `ctx`: RunContext, verbosity and timing side channel.
///     `world`: Communicator, domain communicator.
///     `interband`: Communicator, inter-band-group communicator.
pub fn rayleigh_ritz<O: Operator>(
    op: &O,
    x: &mut BlockVector,
    width: usize,
    options: &SolverOptions,
    ctx: &mut RunContext,
    world: &impl Communicator,
    interband: &impl Communicator,
) -> Result<Vec<f64>, SolverError> {
    if x.n_vectors() != width {
        return Err(SolverError::LayoutMismatch {
            stage: Stage::Projection,
            expected: width,
            found: x.n_vectors(),
        });
    }

    let mut values;
    let mut rotation;

    if options.use_process_grid {
        let grid = ProcessGrid::new(width, world);
        let mixed_core = options
            .use_mixed_precision_projection
            .then_some(options.n_core_states.min(width));

        let t = Instant::now();
        let owned = op.project_grid(x, width, mixed_core, &grid, world);
        ctx.timings.projection_assembly += t.elapsed();

        let t = Instant::now();
        let (grid_values, grid_rotation) =
            dense::eigh_grid_by_index_range(world, &grid, &owned, 0, width, Stage::Projection)?;
        values = grid_values;
        rotation = grid_rotation;
        broadcast_eigenpairs(interband, &mut values, &mut rotation);
        ctx.timings.dense_solve += t.elapsed();
    } else {
        let t = Instant::now();
        let projected = if options.use_mixed_precision_projection {
            op.project_mixed(x, width, options.n_core_states.min(width), world)
        } else {
            op.project(x, width, world)
        };
        ctx.timings.projection_assembly += t.elapsed();

        let t = Instant::now();
        let (dense_values, dense_rotation) = dense::eigh_dc(&projected, Stage::Projection)?;
        values = dense_values.to_vec();
        rotation = dense_rotation;
        broadcast_eigenpairs(world, &mut values, &mut rotation);
        broadcast_eigenpairs(interband, &mut values, &mut rotation);
        ctx.timings.dense_solve += t.elapsed();
    }

    let t = Instant::now();
    x.local = x.local.dot(&rotation);
    ctx.timings.subspace_rotation += t.elapsed();
    Ok(values)
}

/// Spectrum-split Rayleigh-Ritz: the leading `n_core` already-converged
/// states are excluded from the dense solve, which runs only over the index
/// range [n_core, width). The valence rotation lands in the separate output
/// block Y = X·Q[:, n_core..] and X is left untouched. Requires the
/// process-grid dense eigensolver; the request is rejected before any
/// computation otherwise. Returned eigenvalues cover the valence range only.
/// # Arguments:
///     `op`: Operator, the discretized Hamiltonian action.
///     `x`: BlockVector, orthonormal trial block, read only.
///     `y`: BlockVector, valence output block of width `width - n_core`.
///     `width`: usize, number of columns of `x`.
///     `n_core`: usize, leading converged state count, below `width`.
///     `options`: SolverOptions, grid and mixed-precision switches.
///     `ctx`: RunContext, verbosity and timing side channel.
///     `world`: Communicator, domain communicator.
///     `interband`: Communicator, inter-band-group communicator.
#[allow(clippy::too_many_arguments)]
pub fn rayleigh_ritz_spectrum_split<O: Operator>(
    op: &O,
    x: &BlockVector,
    y: &mut BlockVector,
    width: usize,
    n_core: usize,
    options: &SolverOptions,
    ctx: &mut RunContext,
    world: &impl Communicator,
    interband: &impl Communicator,
) -> Result<Vec<f64>, SolverError> {
    if !options.use_process_grid {
        return Err(SolverError::UnsupportedConfiguration {
            detail: "spectrum splitting requires the process-grid dense eigensolver, \
                     which is not configured"
                .to_string(),
        });
    }
    if n_core >= width {
        return Err(SolverError::UnsupportedConfiguration {
            detail: format!("core state count {n_core} must stay below the block width {width}"),
        });
    }
    if x.n_vectors() != width {
        return Err(SolverError::LayoutMismatch {
            stage: Stage::Projection,
            expected: width,
            found: x.n_vectors(),
        });
    }
    if y.n_vectors() != width - n_core {
        return Err(SolverError::LayoutMismatch {
            stage: Stage::Projection,
            expected: width - n_core,
            found: y.n_vectors(),
        });
    }

    let grid = ProcessGrid::new(width, world);
    let mixed_core = options.use_mixed_precision_projection.then_some(n_core);

    let t = Instant::now();
    let owned = op.project_grid(x, width, mixed_core, &grid, world);
    ctx.timings.projection_assembly += t.elapsed();

    let t = Instant::now();
    let (mut values, mut rotation) =
        dense::eigh_grid_by_index_range(world, &grid, &owned, n_core, width, Stage::Projection)?;
    broadcast_eigenpairs(interband, &mut values, &mut rotation);
    ctx.timings.dense_solve += t.elapsed();

    let t = Instant::now();
    y.local = x.local.dot(&rotation);
    ctx.timings.subspace_rotation += t.elapsed();
    Ok(values)
}
