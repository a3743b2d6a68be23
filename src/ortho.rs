// ortho.rs
use mpi::topology::Communicator;
use mpi::traits::*;
use ndarray::{s, Array1};

use crate::blockvec::BlockVector;
use crate::dense;
use crate::input::SolverOptions;
use crate::mpiutils;
use crate::{RunContext, SolverError, Stage};

// Overlap eigenvalues below this are treated as loss of numerical rank.
pub const OVERLAP_DEGENERACY_THRESHOLD: f64 = 1e-10;
// The complex-field rendition of this kernel uses a tighter cut.
pub const OVERLAP_DEGENERACY_THRESHOLD_COMPLEX: f64 = 1e-13;

// Orthonormalization strategy for the filtered trial block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrthoStrategy {
    GramSchmidt,
    Lowdin,
}

/// Compute D^{-1/4} of the overlap eigenvalues, flagging the degeneracy
/// condition: a value that is not-a-number after the inverse fourth root or
/// an eigenvalue below the threshold. Also reports the smallest eigenvalue
/// seen for diagnostics.
fn inverse_fourth_root(values: &Array1<f64>) -> (Array1<f64>, bool, f64) {
    let mut inv = Array1::zeros(values.len());
    let mut degenerate = false;
    let mut min_value = f64::INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v < min_value || min_value.is_infinite() {
            min_value = v;
        }
        inv[i] = 1.0 / v.powf(0.25);
        if !inv[i].is_finite() || v < OVERLAP_DEGENERACY_THRESHOLD {
            degenerate = true;
        }
    }
    (inv, degenerate, min_value)
}

/// Loewdin symmetric orthonormalization of the block in place:
/// S = XᵀX, S = Q D Qᵀ, S^{-1/2} = (Q D^{-1/4})(Q D^{-1/4})ᵀ, X ← X S^{-1/2}.
/// On a degenerate overlap, optionally retries the decomposition with the
/// robust backend before reporting the degeneracy.
/// # Arguments:
///     `x`: BlockVector, trial block, rotated in place.
///     `width`: usize, number of columns.
///     `robust_fallback`: bool, retry the overlap decomposition with the
///     robust backend when the divide-and-conquer path reports degeneracy.
///     `world`: Communicator, MPI communicator object.
pub fn lowdin_orthonormalization(
    x: &mut BlockVector,
    width: usize,
    robust_fallback: bool,
    world: &impl Communicator,
) -> Result<(), SolverError> {
    debug_assert_eq!(x.n_vectors(), width);

    // Local overlap contribution over the owned rows, then the reduction
    // over the distributed dimension. The barrier keeps every local
    // contribution committed before the sum is consumed.
    let mut overlap = x.local.t().dot(&x.local);
    world.barrier();
    mpiutils::sum_in_place(world, overlap.as_slice_mut().unwrap());

    let (values, mut q) = dense::eigh_dc(&overlap, Stage::Orthonormalization)?;
    let (mut inv_fourth, degenerate, mut min_value) = inverse_fourth_root(&values);

    // Vote so every rank takes the same branch even if one rank's
    // decomposition disagrees in the last bit.
    if mpiutils::max_flag(world, u32::from(degenerate)) == 1 {
        if !robust_fallback {
            return Err(SolverError::DegenerateSubspace {
                stage: Stage::Orthonormalization,
                min_eigenvalue: min_value,
            });
        }
        let (robust_values, robust_q) = dense::eigh_robust_psd(&overlap, Stage::Orthonormalization)?;
        q = robust_q;
        let retry = inverse_fourth_root(&robust_values);
        inv_fourth = retry.0;
        min_value = retry.2;
        if mpiutils::max_flag(world, u32::from(retry.1)) == 1 {
            return Err(SolverError::DegenerateSubspace {
                stage: Stage::Orthonormalization,
                min_eigenvalue: min_value,
            });
        }
    }

    // Q D^{-1/4}, squared into S^{-1/2}, then the rotation X ← X S^{-1/2}.
    for (i, &scale) in inv_fourth.iter().enumerate() {
        q.column_mut(i).mapv_inplace(|v| v * scale);
    }
    let inv_sqrt_overlap = q.dot(&q.t());
    x.local = x.local.dot(&inv_sqrt_overlap);
    Ok(())
}

/// Classical Gram-Schmidt with one reorthogonalization pass, column by
/// column over the distributed rows: per pass one reduction for the
/// projection coefficients against all previous columns, then one for the
/// norm. The communication-heavier but more robust strategy. Fails only on
/// an exactly vanishing column, matching the block-orthogonalizer this
/// mirrors; near-duplicate columns come out normalized along whatever
/// direction survives the projections.
/// # Arguments:
///     `x`: BlockVector, trial block, orthonormalized in place.
///     `width`: usize, number of columns.
///     `world`: Communicator, MPI communicator object.
pub fn gram_schmidt_orthonormalization(
    x: &mut BlockVector,
    width: usize,
    world: &impl Communicator,
) -> Result<(), SolverError> {
    debug_assert_eq!(x.n_vectors(), width);

    for j in 0..width {
        if j > 0 {
            for _pass in 0..2 {
                let vj = x.local.column(j).to_owned();
                let mut coefficients = x.local.slice(s![.., ..j]).t().dot(&vj).to_vec();
                mpiutils::sum_in_place(world, &mut coefficients);
                for (i, &ci) in coefficients.iter().enumerate() {
                    let vi = x.local.column(i).to_owned();
                    x.local.column_mut(j).scaled_add(-ci, &vi);
                }
            }
        }
        let mut norm_sq = [x.local.column(j).dot(&x.local.column(j))];
        mpiutils::sum_in_place(world, &mut norm_sq);
        if !norm_sq[0].is_finite() || norm_sq[0] == 0.0 {
            return Err(SolverError::DegenerateSubspace {
                stage: Stage::Orthonormalization,
                min_eigenvalue: norm_sq[0],
            });
        }
        let inv_norm = 1.0 / norm_sq[0].sqrt();
        x.local.column_mut(j).mapv_inplace(|v| v * inv_norm);
    }
    Ok(())
}

/// Orthonormalize under the configured strategy, retrying once with
/// Gram-Schmidt when Loewdin reports a degenerate subspace and the fallback
/// switch is enabled. The strategy fallback takes precedence over the
/// robust-solver fallback when both are configured. Returns the strategy
/// that produced the result.
/// # Arguments:
///     `x`: BlockVector, trial block, orthonormalized in place.
///     `width`: usize, number of columns.
///     `options`: SolverOptions, strategy and fallback switches.
///     `ctx`: RunContext, verbosity and timing side channel.
///     `world`: Communicator, MPI communicator object.
pub fn orthonormalize(
    x: &mut BlockVector,
    width: usize,
    options: &SolverOptions,
    ctx: &RunContext,
    world: &impl Communicator,
) -> Result<OrthoStrategy, SolverError> {
    if x.n_vectors() != width {
        return Err(SolverError::LayoutMismatch {
            stage: Stage::Orthonormalization,
            expected: width,
            found: x.n_vectors(),
        });
    }

    match options.ortho_strategy {
        OrthoStrategy::Lowdin => {
            let robust =
                options.robust_overlap_fallback && !options.switch_to_fallback_on_degeneracy;
            match lowdin_orthonormalization(x, width, robust, world) {
                Ok(()) => Ok(OrthoStrategy::Lowdin),
                Err(SolverError::DegenerateSubspace { min_eigenvalue, .. })
                    if options.switch_to_fallback_on_degeneracy =>
                {
                    ctx.log(&format!(
                        "Degenerate overlap (eigenvalue {min_eigenvalue:.3e}): switching to Gram-Schmidt."
                    ));
                    gram_schmidt_orthonormalization(x, width, world)?;
                    Ok(OrthoStrategy::GramSchmidt)
                }
                Err(e) => Err(e),
            }
        }
        OrthoStrategy::GramSchmidt => {
            gram_schmidt_orthonormalization(x, width, world)?;
            Ok(OrthoStrategy::GramSchmidt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockvec::BlockLayout;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_block(rows: usize, cols: usize, seed: u64) -> BlockVector {
        let mut rng = StdRng::seed_from_u64(seed);
        let layout = BlockLayout::serial(rows);
        let mut x = BlockVector::zeros(&layout, cols);
        x.local.mapv_inplace(|_| rng.gen_range(-1.0..1.0));
        x
    }

    fn orthonormality_defect(x: &BlockVector) -> f64 {
        let n = x.n_vectors();
        let gram = x.local.t().dot(&x.local);
        let identity = Array2::<f64>::eye(n);
        (&gram - &identity).iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    #[test]
    fn lowdin_produces_an_orthonormal_block() {
        crate::testsupport::with_world(|world| {
            let mut x = random_block(40, 6, 3);
            lowdin_orthonormalization(&mut x, 6, false, world).unwrap();
            assert!(orthonormality_defect(&x) < 1e-10);
        });
    }

    #[test]
    fn gram_schmidt_produces_an_orthonormal_block() {
        crate::testsupport::with_world(|world| {
            let mut x = random_block(40, 6, 4);
            gram_schmidt_orthonormalization(&mut x, 6, world).unwrap();
            assert!(orthonormality_defect(&x) < 1e-10);
        });
    }

    #[test]
    fn orthonormalization_is_idempotent() {
        crate::testsupport::with_world(|world| {
            let mut x = random_block(30, 4, 5);
            lowdin_orthonormalization(&mut x, 4, false, world).unwrap();
            let first = x.local.clone();

            lowdin_orthonormalization(&mut x, 4, false, world).unwrap();
            let drift: f64 = (&x.local - &first).iter().map(|v| v * v).sum::<f64>().sqrt();
            assert!(drift < 1e-10, "second Loewdin application drifted by {drift}");

            // An orthonormal block is a fixed point of Gram-Schmidt as well.
            gram_schmidt_orthonormalization(&mut x, 4, world).unwrap();
            let drift: f64 = (&x.local - &first).iter().map(|v| v * v).sum::<f64>().sqrt();
            assert!(drift < 1e-10, "Gram-Schmidt moved an orthonormal block by {drift}");
        });
    }

    /// Two near-identical columns: Loewdin must report the degeneracy, and
    /// the dispatcher must recover through Gram-Schmidt when the fallback
    /// switch is on.
    #[test]
    fn degenerate_columns_trigger_the_strategy_fallback() {
        fn nearly_dependent_block() -> BlockVector {
            let mut x = random_block(25, 3, 6);
            let perturbed = x.local.column(0).mapv(|v| v + 1e-13);
            x.local.column_mut(2).assign(&perturbed);
            x
        }

        crate::testsupport::with_world(|world| {
            let mut x = nearly_dependent_block();
            let err = lowdin_orthonormalization(&mut x, 3, false, world).unwrap_err();
            assert!(matches!(err, SolverError::DegenerateSubspace { .. }));

            let mut x = nearly_dependent_block();
            let options = SolverOptions {
                ortho_strategy: OrthoStrategy::Lowdin,
                switch_to_fallback_on_degeneracy: true,
                ..SolverOptions::default()
            };
            let ctx = RunContext::new(false, true);
            let used = orthonormalize(&mut x, 3, &options, &ctx, world).unwrap();
            assert_eq!(used, OrthoStrategy::GramSchmidt);
            assert!(orthonormality_defect(&x) < 1e-8);
        });
    }

    #[test]
    fn degeneracy_is_fatal_without_any_fallback() {
        crate::testsupport::with_world(|world| {
            let mut x = random_block(25, 3, 7);
            let duplicate = x.local.column(1).to_owned();
            x.local.column_mut(2).assign(&duplicate);
            let options = SolverOptions {
                ortho_strategy: OrthoStrategy::Lowdin,
                switch_to_fallback_on_degeneracy: false,
                ..SolverOptions::default()
            };
            let ctx = RunContext::new(false, true);
            let err = orthonormalize(&mut x, 3, &options, &ctx, world).unwrap_err();
            assert!(matches!(err, SolverError::DegenerateSubspace { .. }));
        });
    }

    #[test]
    fn width_mismatch_is_detected_eagerly() {
        crate::testsupport::with_world(|world| {
            let mut x = random_block(10, 2, 8);
            let options = SolverOptions::default();
            let ctx = RunContext::new(false, true);
            let err = orthonormalize(&mut x, 3, &options, &ctx, world).unwrap_err();
            assert!(matches!(
                err,
                SolverError::LayoutMismatch {
                    expected: 3,
                    found: 2,
                    ..
                }
            ));
        });
    }
}
