// blockvec.rs
use mpi::topology::Communicator;
use ndarray::{s, Array2, ArrayView2, ArrayViewMut2};

/// Distributed row layout shared by every vector in a block. Rank r of p
/// owns the contiguous global row range [row_offset, row_offset + local_rows).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    pub global_rows: usize,
    pub local_rows: usize,
    pub row_offset: usize,
}

impl BlockLayout {
    /// Balanced contiguous partition of `global_rows` over the ranks of a
    /// communicator. The first `global_rows % size` ranks hold one extra row.
    /// # Arguments:
    ///     `global_rows`: usize, global basis dimension.
    ///     `world`: Communicator, MPI communicator object.
    pub fn partition(global_rows: usize, world: &impl Communicator) -> Self {
        let size = world.size() as usize;
        let rank = world.rank() as usize;
        let base = global_rows / size;
        let remainder = global_rows % size;
        let local_rows = base + usize::from(rank < remainder);
        let row_offset = rank * base + rank.min(remainder);
        Self {
            global_rows,
            local_rows,
            row_offset,
        }
    }

    /// Layout owning every row, for serial use.
    pub fn serial(global_rows: usize) -> Self {
        Self {
            global_rows,
            local_rows: global_rows,
            row_offset: 0,
        }
    }
}

/// A block of basis vectors distributed over ranks by rows. The local piece
/// is stored with shape (local_rows, n_vectors) and the vector index fastest
/// in memory, so one basis row holds all vectors contiguously. Every
/// operation applies to the whole block under one layout.
#[derive(Debug, Clone)]
pub struct BlockVector {
    pub layout: BlockLayout,
    pub local: Array2<f64>,
}

impl BlockVector {
    /// Zeroed block with `n_vectors` columns against a reference layout.
    /// # Arguments:
    ///     `layout`: BlockLayout, reference distributed layout.
    ///     `n_vectors`: usize, number of columns.
    pub fn zeros(layout: &BlockLayout, n_vectors: usize) -> Self {
        Self {
            layout: layout.clone(),
            local: Array2::zeros((layout.local_rows, n_vectors)),
        }
    }

    pub fn n_vectors(&self) -> usize {
        self.local.ncols()
    }

    /// Reset every entry to zero, keeping layout and width.
    pub fn fill_zero(&mut self) {
        self.local.fill(0.0);
    }

    /// In-place scaling X ← alpha X.
    pub fn scale(&mut self, alpha: f64) {
        self.local *= alpha;
    }

    /// Axpy update X ← X + alpha Y over the whole block.
    /// # Arguments:
    ///     `alpha`: f64, scalar multiplier.
    ///     `other`: BlockVector, block with the same layout and width.
    pub fn add_scaled(&mut self, alpha: f64, other: &BlockVector) {
        debug_assert_eq!(self.layout, other.layout);
        debug_assert_eq!(self.n_vectors(), other.n_vectors());
        self.local.scaled_add(alpha, &other.local);
    }

    /// Exchange contents with another block of identical shape.
    pub fn swap(&mut self, other: &mut BlockVector) {
        debug_assert_eq!(self.layout, other.layout);
        debug_assert_eq!(self.n_vectors(), other.n_vectors());
        std::mem::swap(&mut self.local, &mut other.local);
    }

    /// Copy the contents of another block of identical shape.
    pub fn assign(&mut self, other: &BlockVector) {
        debug_assert_eq!(self.layout, other.layout);
        debug_assert_eq!(self.n_vectors(), other.n_vectors());
        self.local.assign(&other.local);
    }

    /// View of the local rows of columns [lo, hi).
    pub fn columns(&self, lo: usize, hi: usize) -> ArrayView2<'_, f64> {
        self.local.slice(s![.., lo..hi])
    }

    /// Mutable view of the local rows of columns [lo, hi).
    pub fn columns_mut(&mut self, lo: usize, hi: usize) -> ArrayViewMut2<'_, f64> {
        self.local.slice_mut(s![.., lo..hi])
    }
}
