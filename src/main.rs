// main.rs
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

use mpi::topology::{Color, Communicator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use chefsi_rs::filter::{estimate_spectral_upper_bound, FilterParameters};
use chefsi_rs::input::load_input;
use chefsi_rs::iteration::{run_chebyshev_filtered_iteration, IterationOutcome};
use chefsi_rs::operator::{Laplacian1D, Operator};
use chefsi_rs::ortho;
use chefsi_rs::projector;
use chefsi_rs::utils::{print_eigen_table, print_timing_summary};
use chefsi_rs::{RunContext, SolverError};

fn abort(error: SolverError) -> ! {
    eprintln!("{error}");
    std::process::exit(1);
}

fn main() {
    let t_total = Instant::now();
    let input_path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("Usage: chefsi-rs <input.lua>");
            std::process::exit(1);
        }
    };
    let input = load_input(&input_path);

    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank();
    // Stand-in for the band-group dimension of the process layout: every
    // rank sits alone in its band group, so the inter-band broadcast of the
    // dense solve results is a local no-op until band parallelism is wired
    // up by a larger driver.
    let interband = world.split_by_color(Color::with_value(rank)).unwrap();

    let n = input.solver.n_states;
    let op = Laplacian1D::new(&input.model, &world);
    let mut ctx = RunContext::new(input.write.verbose, rank == 0);

    ctx.log(&format!(
        "Solving for the lowest {} states of a {}-point model Hamiltonian on {} rank(s).",
        n,
        input.model.grid_points,
        world.size()
    ));

    // Random trial subspace, decorrelated across ranks through the row offset.
    let mut rng = StdRng::seed_from_u64(
        input.model.seed.wrapping_add(op.layout().row_offset as u64),
    );
    let mut x = op.reinit(n);
    x.local.mapv_inplace(|_| rng.gen_range(-0.5..0.5));

    // Top of the suppression band from a short power iteration.
    let t_bounds = Instant::now();
    let upper_bound = estimate_spectral_upper_bound(&op, &world, input.model.seed, 30);
    ctx.log(&format!(
        "Estimated spectral upper bound {:.6} in {:?}.",
        upper_bound,
        t_bounds.elapsed()
    ));

    // Bootstrap Ritz values: orthonormalize the random block and project
    // once, so the first filter pass has a band to work with.
    if let Err(e) = ortho::orthonormalize(&mut x, n, &input.solver, &ctx, &world) {
        abort(e);
    }
    let mut eigenvalues = match projector::rayleigh_ritz(
        &op, &mut x, n, &input.solver, &mut ctx, &world, &interband,
    ) {
        Ok(v) => v,
        Err(e) => abort(e),
    };
    let mut residual_norms = vec![f64::INFINITY; n];

    ctx.log(&format!(
        "{:>5} {:>16} {:>16} {:>14} {:>10}",
        "iter", "e_min", "e_max", "max resid", "time"
    ));

    let mut converged = false;
    for iter in 1..=input.solver.max_outer_iterations {
        let t_iter = Instant::now();

        // Suppression band [a, b] above the wanted spectrum; the shift a0
        // sits at the current lowest Ritz value, nudged down for safety.
        let a = eigenvalues[n - 1];
        let a0 = eigenvalues[0] - 1e-2 * (upper_bound - eigenvalues[0]).abs() - 1e-6;
        let params = FilterParameters {
            a,
            b: upper_bound,
            a0,
            degree: input.solver.chebyshev_degree,
        };

        // Spectrum splitting needs a converged core, so the first pass
        // always re-diagonalizes the full block.
        let mut options = input.solver.clone();
        if options.use_spectrum_split && iter == 1 {
            options.use_spectrum_split = false;
        }

        let out = match run_chebyshev_filtered_iteration(
            &op, &mut x, &params, &options, &mut ctx, &world, &interband,
        ) {
            Ok(out) => out,
            Err(e) => abort(e),
        };

        if options.use_spectrum_split {
            // Valence range only: splice behind the retained core states.
            let n_core = options.n_core_states;
            for (k, v) in out.eigenvalues.iter().enumerate() {
                eigenvalues[n_core + k] = *v;
            }
            for (k, r) in out.residual_norms.iter().enumerate() {
                residual_norms[n_core + k] = *r;
            }
        } else {
            eigenvalues.copy_from_slice(&out.eigenvalues);
            residual_norms.copy_from_slice(&out.residual_norms);
        }

        let max_residual = out
            .residual_norms
            .iter()
            .cloned()
            .fold(0.0f64, f64::max);
        ctx.log(&format!(
            "{:5} {:16.8} {:16.8} {:14.4e} {:>10.2?}",
            iter,
            eigenvalues[0],
            eigenvalues[n - 1],
            max_residual,
            t_iter.elapsed()
        ));

        if out.outcome == IterationOutcome::Converged {
            converged = true;
            break;
        }
    }

    if rank == 0 {
        println!("{}", "=".repeat(72));
        if converged {
            println!("Converged to tolerance {:.1e}.", input.solver.tolerance);
        } else {
            println!(
                "Not converged after {} iterations; reporting current estimates.",
                input.solver.max_outer_iterations
            );
        }
        print_eigen_table(&eigenvalues, &residual_norms);
        println!("{}", "=".repeat(72));
        print_timing_summary(&ctx.timings);

        if input.write.write_spectrum {
            let file = File::create(&input.write.spectrum_file).unwrap();
            let mut writer = BufWriter::new(file);
            for (i, (e, r)) in eigenvalues.iter().zip(residual_norms.iter()).enumerate() {
                writeln!(writer, "{:4} {:.12e} {:.4e}", i, e, r).unwrap();
            }
            println!("Wrote spectrum to {}.", input.write.spectrum_file);
        }

        println!("Total wall time: {:?}", t_total.elapsed());
    }
}
