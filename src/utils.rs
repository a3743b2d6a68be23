// utils.rs
use crate::StageTimings;

/// Print eigenvalues and matched residual norms as an indexed table.
/// # Arguments
///     `eigenvalues`: [f64], ascending eigenvalues.
///     `residual_norms`: [f64], residual norm per eigenpair.
pub fn print_eigen_table(eigenvalues: &[f64], residual_norms: &[f64]) {
    println!("{:>6} {:>18} {:>14}", "state", "eigenvalue", "residual");
    for (i, (e, r)) in eigenvalues.iter().zip(residual_norms.iter()).enumerate() {
        println!("{:6} {:18.10} {:14.4e}", i, e, r);
    }
}

/// Print the per stage wall times accumulated over a run.
/// # Arguments
///     `timings`: StageTimings, accumulated stage durations.
pub fn print_timing_summary(timings: &StageTimings) {
    println!("Chebyshev filter:     {:?}", timings.filter);
    println!("Orthonormalization:   {:?}", timings.orthonormalization);
    println!("Projection assembly:  {:?}", timings.projection_assembly);
    println!("Dense eigensolve:     {:?}", timings.dense_solve);
    println!("Subspace rotation:    {:?}", timings.subspace_rotation);
    println!("Residual evaluation:  {:?}", timings.residual);
}
