// operator.rs
use mpi::topology::{Communicator, SimpleCommunicator};
use mpi::traits::*;
use ndarray::{s, Array1, Array2, Axis};
use rayon::prelude::*;

use crate::blockvec::{BlockLayout, BlockVector};
use crate::dense::{self, ProcessGrid};
use crate::input::{ModelOptions, PotentialKind};
use crate::mpiutils;

/// Contract consumed from the external collaborator that owns the
/// discretized Hamiltonian: apply the operator to a block of vectors and
/// assemble projected dense matrices. The operator is never materialized as
/// a dense matrix; only its action is available. Any communication the
/// action needs (halo exchange, constraint handling) is the operator's own
/// business.
pub trait Operator {
    /// Distributed row layout the operator acts on.
    fn layout(&self) -> &BlockLayout;

    /// Accumulate scalar·H·x into y over the local rows. With `scale_flag`
    /// false the destination is overwritten; with true the destination
    /// carries prior contributions that are preserved and added to. With
    /// `mixed_precision` the action may be evaluated in single precision.
    /// # Arguments:
    ///     `x`: BlockVector, input block.
    ///     `width`: usize, number of columns of `x` to act on.
    ///     `scale_flag`: bool, accumulate into `y` instead of overwriting.
    ///     `scalar`: f64, multiplier applied to the operator action.
    ///     `mixed_precision`: bool, permit reduced precision application.
    ///     `y`: BlockVector, output block.
    fn apply(
        &self,
        x: &BlockVector,
        width: usize,
        scale_flag: bool,
        scalar: f64,
        mixed_precision: bool,
        y: &mut BlockVector,
    );

    /// Fresh zeroed block with this operator's layout and the given width.
    fn reinit(&self, width: usize) -> BlockVector {
        BlockVector::zeros(self.layout(), width)
    }

    /// Projected matrix XᵀHX, replicated on every rank. One operator
    /// application, a local dense accumulation, a barrier separating local
    /// assembly from the commit, and a global sum reduction.
    /// # Arguments:
    ///     `x`: BlockVector, orthonormal trial block.
    ///     `width`: usize, number of columns.
    ///     `world`: Communicator, MPI communicator object.
    fn project(&self, x: &BlockVector, width: usize, world: &impl Communicator) -> Array2<f64>
    where
        Self: Sized,
    {
        let mut hx = self.reinit(width);
        self.apply(x, width, false, 1.0, false, &mut hx);
        let mut projected = x.local.t().dot(&hx.local);
        world.barrier();
        mpiutils::sum_in_place(world, projected.as_slice_mut().unwrap());
        projected
    }

    /// XᵀHX with the valence block (rows and columns at index ≥ n_core)
    /// accumulated in single precision; everything touching a core state
    /// stays in full precision.
    /// # Arguments:
    ///     `x`: BlockVector, orthonormal trial block.
    ///     `width`: usize, number of columns.
    ///     `n_core`: usize, leading column count kept in full precision.
    ///     `world`: Communicator, MPI communicator object.
    fn project_mixed(
        &self,
        x: &BlockVector,
        width: usize,
        n_core: usize,
        world: &impl Communicator,
    ) -> Array2<f64>
    where
        Self: Sized,
    {
        let mut hx = self.reinit(width);
        self.apply(x, width, false, 1.0, false, &mut hx);
        let mut projected = x.local.t().dot(&hx.local);

        let x32 = x.local.slice(s![.., n_core..]).mapv(|v| v as f32);
        let hx32 = hx.local.slice(s![.., n_core..]).mapv(|v| v as f32);
        let valence = x32.t().dot(&hx32);
        projected
            .slice_mut(s![n_core.., n_core..])
            .assign(&valence.mapv(f64::from));

        world.barrier();
        mpiutils::sum_in_place(world, projected.as_slice_mut().unwrap());
        projected
    }

    /// XᵀHX committed to a process grid: each rank ends up holding the row
    /// block of the projected matrix it owns. With `mixed_core` set, the
    /// valence block of the local contribution is accumulated in single
    /// precision before the commit.
    /// # Arguments:
    ///     `x`: BlockVector, orthonormal trial block.
    ///     `width`: usize, number of columns.
    ///     `mixed_core`: Option<usize>, full-precision core count, if mixed.
    ///     `grid`: ProcessGrid, row ownership map for the projected matrix.
    ///     `world`: Communicator, MPI communicator object.
    fn project_grid(
        &self,
        x: &BlockVector,
        width: usize,
        mixed_core: Option<usize>,
        grid: &ProcessGrid,
        world: &impl Communicator,
    ) -> Array2<f64>
    where
        Self: Sized,
    {
        let mut hx = self.reinit(width);
        self.apply(x, width, false, 1.0, false, &mut hx);
        let mut local = x.local.t().dot(&hx.local);
        if let Some(n_core) = mixed_core {
            let x32 = x.local.slice(s![.., n_core..]).mapv(|v| v as f32);
            let hx32 = hx.local.slice(s![.., n_core..]).mapv(|v| v as f32);
            let valence = x32.t().dot(&hx32);
            local
                .slice_mut(s![n_core.., n_core..])
                .assign(&valence.mapv(f64::from));
        }
        dense::commit_to_grid(world, grid, &local)
    }
}

/// Synthetic operator that is diagonal in the basis, with a prescribed
/// spectrum. No inter-rank coupling, which makes it the reference operator
/// for unit tests and filter calibration.
pub struct DiagonalOperator {
    layout: BlockLayout,
    local_diagonal: Array1<f64>,
}

impl DiagonalOperator {
    /// Distribute the given spectrum over the communicator.
    /// # Arguments:
    ///     `spectrum`: [f64], global diagonal entries.
    ///     `world`: Communicator, MPI communicator object.
    pub fn new(spectrum: &[f64], world: &impl Communicator) -> Self {
        let layout = BlockLayout::partition(spectrum.len(), world);
        let local_diagonal = Array1::from_iter(
            spectrum[layout.row_offset..layout.row_offset + layout.local_rows]
                .iter()
                .copied(),
        );
        Self {
            layout,
            local_diagonal,
        }
    }

    /// Serial variant owning the full diagonal.
    pub fn serial(spectrum: &[f64]) -> Self {
        Self {
            layout: BlockLayout::serial(spectrum.len()),
            local_diagonal: Array1::from_iter(spectrum.iter().copied()),
        }
    }
}

impl Operator for DiagonalOperator {
    fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    fn apply(
        &self,
        x: &BlockVector,
        width: usize,
        scale_flag: bool,
        scalar: f64,
        mixed_precision: bool,
        y: &mut BlockVector,
    ) {
        debug_assert_eq!(x.n_vectors(), width);
        debug_assert_eq!(y.n_vectors(), width);
        for i in 0..self.layout.local_rows {
            let d = self.local_diagonal[i];
            for j in 0..width {
                let action = if mixed_precision {
                    f64::from(d as f32 * x.local[(i, j)] as f32)
                } else {
                    d * x.local[(i, j)]
                };
                let value = scalar * action;
                if scale_flag {
                    y.local[(i, j)] += value;
                } else {
                    y.local[(i, j)] = value;
                }
            }
        }
    }
}

/// Model Hamiltonian -½Δ + V on a uniform 1-D grid with zero boundary
/// values, rows distributed contiguously. The off-diagonal coupling is
/// nearest neighbour only, so applying the operator needs one halo row from
/// each side, exchanged here with phased blocking sends so neighbours never
/// wait on each other.
pub struct Laplacian1D {
    layout: BlockLayout,
    comm: SimpleCommunicator,
    inv_h2: f64,
    local_potential: Array1<f64>,
}

impl Laplacian1D {
    /// Build the model operator from driver options.
    /// # Arguments:
    ///     `model`: ModelOptions, grid size, box length and potential shape.
    ///     `world`: Communicator, MPI communicator object.
    pub fn new(model: &ModelOptions, world: &impl Communicator) -> Self {
        let n = model.grid_points;
        let layout = BlockLayout::partition(n, world);
        assert!(
            layout.local_rows >= 1,
            "model grid must have at least one row per rank"
        );
        let h = model.box_length / (n as f64 + 1.0);
        let inv_h2 = 1.0 / (h * h);

        let mut local_potential = Array1::zeros(layout.local_rows);
        for i in 0..layout.local_rows {
            let xi = (layout.row_offset + i + 1) as f64 * h;
            local_potential[i] = match model.potential {
                // Harmonic well centred in the box.
                PotentialKind::Harmonic => {
                    let d = xi - 0.5 * model.box_length;
                    0.5 * model.potential_strength * d * d
                }
                // Square well over the middle third of the box.
                PotentialKind::Well => {
                    if xi > model.box_length / 3.0 && xi < 2.0 * model.box_length / 3.0 {
                        -model.potential_strength
                    } else {
                        0.0
                    }
                }
            };
        }

        Self {
            layout,
            comm: world.duplicate(),
            inv_h2,
            local_potential,
        }
    }

    /// Exchange the first and last owned rows with the neighbouring ranks.
    /// Returns (lower_halo, upper_halo); global boundary rows stay zero.
    fn exchange_halos(&self, x: &BlockVector, width: usize) -> (Vec<f64>, Vec<f64>) {
        let mut lower_halo = vec![0.0f64; width];
        let mut upper_halo = vec![0.0f64; width];
        let rank = self.comm.rank();
        let size = self.comm.size();
        if size == 1 {
            return (lower_halo, upper_halo);
        }

        let first_row: Vec<f64> = x.local.row(0).to_vec();
        let last_row: Vec<f64> = x.local.row(self.layout.local_rows - 1).to_vec();

        // Even ranks talk upward first, odd ranks downward first, so every
        // blocking send meets a partner that is already receiving.
        if rank % 2 == 0 {
            if rank + 1 < size {
                let next = self.comm.process_at_rank(rank + 1);
                next.send(&last_row[..]);
                next.receive_into(&mut upper_halo[..]);
            }
            if rank > 0 {
                let prev = self.comm.process_at_rank(rank - 1);
                prev.send(&first_row[..]);
                prev.receive_into(&mut lower_halo[..]);
            }
        } else {
            let prev = self.comm.process_at_rank(rank - 1);
            prev.receive_into(&mut lower_halo[..]);
            prev.send(&first_row[..]);
            if rank + 1 < size {
                let next = self.comm.process_at_rank(rank + 1);
                next.receive_into(&mut upper_halo[..]);
                next.send(&last_row[..]);
            }
        }
        (lower_halo, upper_halo)
    }
}

impl Operator for Laplacian1D {
    fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    fn apply(
        &self,
        x: &BlockVector,
        width: usize,
        scale_flag: bool,
        scalar: f64,
        mixed_precision: bool,
        y: &mut BlockVector,
    ) {
        debug_assert_eq!(x.n_vectors(), width);
        debug_assert_eq!(y.n_vectors(), width);
        let (lower_halo, upper_halo) = self.exchange_halos(x, width);

        let local_rows = self.layout.local_rows;
        let local = &x.local;
        let potential = &self.local_potential;
        let inv_h2 = self.inv_h2;

        let mut contribution = Array2::zeros((local_rows, width));
        contribution
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(i, mut row)| {
                for j in 0..width {
                    let below = if i > 0 { local[(i - 1, j)] } else { lower_halo[j] };
                    let above = if i + 1 < local_rows {
                        local[(i + 1, j)]
                    } else {
                        upper_halo[j]
                    };
                    let centre = local[(i, j)];
                    let action = if mixed_precision {
                        let kinetic = -0.5f32
                            * inv_h2 as f32
                            * (below as f32 - 2.0 * centre as f32 + above as f32);
                        f64::from(kinetic + potential[i] as f32 * centre as f32)
                    } else {
                        -0.5 * inv_h2 * (below - 2.0 * centre + above) + potential[i] * centre
                    };
                    row[j] = scalar * action;
                }
            });

        if scale_flag {
            y.local += &contribution;
        } else {
            y.local.assign(&contribution);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn diagonal_apply_scales_rows_by_the_spectrum() {
        let op = DiagonalOperator::serial(&[1.0, 2.0, 3.0]);
        let mut x = op.reinit(2);
        x.local.fill(1.0);
        let mut y = op.reinit(2);
        op.apply(&x, 2, false, 2.0, false, &mut y);
        assert_abs_diff_eq!(y.local[(0, 0)], 2.0, epsilon = 1e-14);
        assert_abs_diff_eq!(y.local[(2, 1)], 6.0, epsilon = 1e-14);

        // Accumulation path adds on top of the previous result.
        op.apply(&x, 2, true, 1.0, false, &mut y);
        assert_abs_diff_eq!(y.local[(2, 1)], 9.0, epsilon = 1e-14);
    }

    #[test]
    fn mixed_precision_apply_stays_close_to_full_precision() {
        let op = DiagonalOperator::serial(&[0.1, 1.7, 4.3]);
        let mut x = op.reinit(1);
        x.local[(0, 0)] = 0.3;
        x.local[(1, 0)] = -1.1;
        x.local[(2, 0)] = 0.7;
        let mut full = op.reinit(1);
        let mut reduced = op.reinit(1);
        op.apply(&x, 1, false, 1.0, false, &mut full);
        op.apply(&x, 1, false, 1.0, true, &mut reduced);
        for i in 0..3 {
            assert_abs_diff_eq!(full.local[(i, 0)], reduced.local[(i, 0)], epsilon = 1e-5);
        }
    }

    #[test]
    fn projection_of_orthonormal_basis_reproduces_the_diagonal() {
        crate::testsupport::with_world(|world| {
            let spectrum = [1.0, 2.0, 5.0, 9.0];
            let op = DiagonalOperator::new(&spectrum, world);
            // Unit columns are an exact invariant basis of the diagonal operator.
            let mut x = op.reinit(4);
            for j in 0..4 {
                x.local[(j, j)] = 1.0;
            }
            let projected = op.project(&x, 4, world);
            for i in 0..4 {
                for j in 0..4 {
                    let expected = if i == j { spectrum[i] } else { 0.0 };
                    assert_abs_diff_eq!(projected[(i, j)], expected, epsilon = 1e-12);
                }
            }
        });
    }

    #[test]
    fn mixed_projection_matches_full_projection_loosely() {
        crate::testsupport::with_world(|world| {
            let spectrum = [0.5, 1.5, 2.5, 3.5];
            let op = DiagonalOperator::new(&spectrum, world);
            let mut x = op.reinit(4);
            for j in 0..4 {
                x.local[(j, j)] = 1.0;
            }
            let full = op.project(&x, 4, world);
            let mixed = op.project_mixed(&x, 4, 2, world);
            for i in 0..4 {
                for j in 0..4 {
                    assert_abs_diff_eq!(full[(i, j)], mixed[(i, j)], epsilon = 1e-5);
                }
            }
        });
    }

    #[test]
    fn laplacian_ground_state_energy_is_positive_for_harmonic_well() {
        crate::testsupport::with_world(|world| {
            let model = ModelOptions {
                grid_points: 64,
                box_length: 10.0,
                potential: PotentialKind::Harmonic,
                potential_strength: 1.0,
                seed: 1,
            };
            let op = Laplacian1D::new(&model, world);
            let mut x = op.reinit(1);
            // Positive trial vector: the Rayleigh quotient of -½Δ + V ≥ 0.
            x.local.fill(1.0);
            let projected = op.project(&x, 1, world);
            assert!(projected[(0, 0)] > 0.0);
        });
    }
}
