// testsupport.rs
use std::sync::Mutex;

use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use once_cell::sync::Lazy;

// One MPI universe shared by every unit test in the crate. MPI may only be
// initialized once per process, and concurrent collectives on the same
// communicator are not thread safe, so tests that touch MPI serialize on
// this lock.
static UNIVERSE: Lazy<Mutex<Universe>> = Lazy::new(|| {
    let (universe, _threading) = mpi::initialize_with_threading(mpi::Threading::Multiple)
        .expect("MPI was already initialized");
    Mutex::new(universe)
});

/// Run `f` against the world communicator of the shared test universe.
pub fn with_world<R>(f: impl FnOnce(&SimpleCommunicator) -> R) -> R {
    let guard = UNIVERSE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let world = guard.world();
    f(&world)
}
