// residual.rs
use mpi::topology::Communicator;
use mpi::traits::*;
use ndarray::s;

use crate::blockvec::BlockVector;
use crate::mpiutils;
use crate::operator::Operator;
use crate::{SolverError, Stage};

/// Per-eigenpair residual norms ‖HXᵢ − λᵢXᵢ‖, evaluated over fixed-width
/// column blocks so the extra H·X storage never exceeds `block_width`
/// columns regardless of how many eigenpairs are held. Local squared
/// contributions are reduced over the distributed dimension once at the
/// end. No convergence decision is taken here; that is the caller's policy.
/// # Arguments:
///     `op`: Operator, the discretized Hamiltonian action.
///     `x`: BlockVector, rotated eigenvector block.
///     `eigenvalues`: [f64], eigenvalues matched to the columns of `x`.
///     `block_width`: usize, number of columns processed at a time.
///     `world`: Communicator, MPI communicator object.
pub fn compute_eigen_residual_norms<O: Operator>(
    op: &O,
    x: &BlockVector,
    eigenvalues: &[f64],
    block_width: usize,
    world: &impl Communicator,
) -> Result<Vec<f64>, SolverError> {
    let total = eigenvalues.len();
    if x.n_vectors() != total {
        return Err(SolverError::LayoutMismatch {
            stage: Stage::Residual,
            expected: total,
            found: x.n_vectors(),
        });
    }

    let width = block_width.clamp(1, total.max(1));
    let local_rows = x.layout.local_rows;
    let mut residual_sq = vec![0.0f64; total];

    let mut x_block = op.reinit(width);
    let mut hx_block = op.reinit(width);

    let mut jvec = 0;
    while jvec < total {
        // Correct the block width when the last block goes off the edge.
        let b = width.min(total - jvec);
        if b != x_block.n_vectors() {
            x_block = op.reinit(b);
            hx_block = op.reinit(b);
        }

        x_block
            .local
            .assign(&x.local.slice(s![.., jvec..jvec + b]));
        world.barrier();
        hx_block.fill_zero();
        op.apply(&x_block, b, false, 1.0, false, &mut hx_block);

        for i in 0..local_rows {
            for k in 0..b {
                let diff = hx_block.local[(i, k)] - eigenvalues[jvec + k] * x_block.local[(i, k)];
                residual_sq[jvec + k] += diff * diff;
            }
        }
        jvec += b;
    }

    mpiutils::sum_in_place(world, &mut residual_sq);
    Ok(residual_sq.iter().map(|v| v.sqrt()).collect())
}
