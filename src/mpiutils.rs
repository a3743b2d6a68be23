// mpiutils.rs
use mpi::collective::SystemOperation;
use mpi::topology::Communicator;
use mpi::traits::*;
use serde::{de::DeserializeOwned, Serialize};

/// Broadcast a serialisable value of arbitrary (provided it is serialisable)
/// type T from rank 0 to all MPI ranks. Used to hand the dense eigensolve
/// results (eigenvalues plus rotation matrix) to every rank so the subspace
/// rotation runs with bit-identical factors everywhere.
/// # Arguments:
///     `world`: Communicator, MPI communicator object.
///     `value`: If rank 0 this is the value to broadcast. Any other rank recieves value from 0.
pub fn broadcast<T>(world: &impl Communicator, value: &mut T)
where
    // Function can broadcast any type provided that it can be converted to bytes and consequently
    // reconstructed from bytes.
    T: Serialize + DeserializeOwned,
{
    let irank = world.rank();
    let root = world.process_at_rank(0);

    // On rank 0 convert the given value into binary, on all other ranks create an empty buffer
    // to recieve the value.
    let mut bytes: Vec<u8> = if irank == 0 {
        bincode::serialize(value).unwrap()
    } else {
        Vec::new()
    };

    // Broadcast the number of bytes that will be sent from rank 0.
    let mut len: u64 = bytes.len() as u64;
    root.broadcast_into(&mut len);

    // All ranks except 0 allocate the recieve buffer to be the correct size.
    if irank != 0 {
        bytes.resize(len as usize, 0u8);
    }

    // Send value from rank 0 to all other ranks in chunks to avoid overflow.
    const CHUNK: usize = 256 * 1024 * 1024;
    let mut off = 0usize;
    while off < bytes.len() {
        let end = (off + CHUNK).min(bytes.len());
        root.broadcast_into(&mut bytes[off..end]);
        off = end;
    }

    // On all ranks except 0 deserialise the value and put it back into T.
    if irank != 0 {
        *value = bincode::deserialize(&bytes).unwrap();
    }
}

/// Element-wise global sum over all ranks, in place. This is the reduction
/// behind overlap-matrix assembly, projected-Hamiltonian assembly, and the
/// residual-norm accumulation.
/// # Arguments:
///     `world`: Communicator, MPI communicator object.
///     `values`: [f64], local contributions, replaced by the global sums.
pub fn sum_in_place(world: &impl Communicator, values: &mut [f64]) {
    let local = values.to_vec();
    world.all_reduce_into(&local[..], values, SystemOperation::sum());
}

/// Global maximum of a per-rank flag. Used to vote on the degeneracy
/// condition during Loewdin orthonormalization so every rank takes the same
/// branch afterwards.
/// # Arguments:
///     `world`: Communicator, MPI communicator object.
///     `flag`: u32, local flag value.
pub fn max_flag(world: &impl Communicator, flag: u32) -> u32 {
    let mut global = 0u32;
    world.all_reduce_into(&flag, &mut global, SystemOperation::max());
    global
}
