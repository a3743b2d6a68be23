// input.rs
use std::fs;

use rlua::{Lua, Table};

use crate::ortho::OrthoStrategy;

// Shape of the model potential for the driver's 1-D Hamiltonian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PotentialKind {
    Harmonic,
    Well,
}

// Storage for solver options.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    // Number of wanted eigenpairs, which is also the trial block width.
    pub n_states: usize,
    // Chebyshev filter degree: sharpness/cost trade-off.
    pub chebyshev_degree: usize,
    pub ortho_strategy: OrthoStrategy,
    // Retry once with Gram-Schmidt when Loewdin reports a degenerate overlap.
    pub switch_to_fallback_on_degeneracy: bool,
    // Retry the overlap decomposition with the robust dense backend before
    // giving up, when the strategy fallback is not taken.
    pub robust_overlap_fallback: bool,
    pub use_mixed_precision_filter: bool,
    pub use_mixed_precision_projection: bool,
    pub use_spectrum_split: bool,
    // Leading converged states excluded from the split dense solve.
    pub n_core_states: usize,
    // Distribute the projected matrix over a process grid.
    pub use_process_grid: bool,
    // Column block width of the residual evaluation.
    pub residual_block_width: usize,
    // Residual norm below which an eigenpair counts as converged.
    pub tolerance: f64,
    pub max_outer_iterations: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            n_states: 8,
            chebyshev_degree: 10,
            ortho_strategy: OrthoStrategy::Lowdin,
            switch_to_fallback_on_degeneracy: true,
            robust_overlap_fallback: false,
            use_mixed_precision_filter: false,
            use_mixed_precision_projection: false,
            use_spectrum_split: false,
            n_core_states: 0,
            use_process_grid: false,
            residual_block_width: 32,
            tolerance: 1e-6,
            max_outer_iterations: 30,
        }
    }
}

// Storage for model problem options.
#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub grid_points: usize,
    pub box_length: f64,
    pub potential: PotentialKind,
    pub potential_strength: f64,
    pub seed: u64,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            grid_points: 400,
            box_length: 20.0,
            potential: PotentialKind::Harmonic,
            potential_strength: 1.0,
            seed: 7,
        }
    }
}

// Storage for output options.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub verbose: bool,
    pub write_spectrum: bool,
    pub spectrum_file: String,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            verbose: true,
            write_spectrum: false,
            spectrum_file: "spectrum.dat".to_string(),
        }
    }
}

/// Storage for input file parameters.
#[derive(Debug, Clone, Default)]
pub struct Input {
    pub solver: SolverOptions,
    pub model: ModelOptions,
    pub write: WriteOptions,
}

/// Read input parameters from lua file and assign to Input object. Absent
/// keys keep their defaults; malformed enum values abort with a message.
/// # Arguments
///     `path`: str, file path to input file.
pub fn load_input(path: &str) -> Input {
    let src = fs::read_to_string(path).unwrap();
    let lua = Lua::new();

    let ctx = lua;
    ctx.load(&src).exec().unwrap();
    let globals = ctx.globals();

    let mut input = Input::default();

    // Solver table.
    if let Ok(solver_tbl) = globals.get::<_, Table>("solver") {
        let d = SolverOptions::default();
        input.solver.n_states = solver_tbl.get("n_states").unwrap_or(d.n_states);
        input.solver.chebyshev_degree = solver_tbl.get("degree").unwrap_or(d.chebyshev_degree);
        let ortho: String = solver_tbl.get("ortho").unwrap_or_else(|_| "lowdin".to_string());
        input.solver.ortho_strategy = match ortho.as_str() {
            "lowdin" => OrthoStrategy::Lowdin,
            "gram_schmidt" => OrthoStrategy::GramSchmidt,
            _ => {
                eprintln!("solver.ortho must be 'lowdin' or 'gram_schmidt'");
                std::process::exit(1);
            }
        };
        input.solver.switch_to_fallback_on_degeneracy = solver_tbl
            .get("switch_to_gs")
            .unwrap_or(d.switch_to_fallback_on_degeneracy);
        input.solver.robust_overlap_fallback = solver_tbl
            .get("robust_overlap_fallback")
            .unwrap_or(d.robust_overlap_fallback);
        input.solver.use_mixed_precision_filter = solver_tbl
            .get("mixed_prec_filter")
            .unwrap_or(d.use_mixed_precision_filter);
        input.solver.use_mixed_precision_projection = solver_tbl
            .get("mixed_prec_projection")
            .unwrap_or(d.use_mixed_precision_projection);
        input.solver.use_spectrum_split = solver_tbl
            .get("spectrum_split")
            .unwrap_or(d.use_spectrum_split);
        input.solver.n_core_states = solver_tbl.get("core_states").unwrap_or(d.n_core_states);
        input.solver.use_process_grid = solver_tbl
            .get("process_grid")
            .unwrap_or(d.use_process_grid);
        input.solver.residual_block_width = solver_tbl
            .get("residual_block_width")
            .unwrap_or(d.residual_block_width);
        input.solver.tolerance = solver_tbl.get("tolerance").unwrap_or(d.tolerance);
        input.solver.max_outer_iterations = solver_tbl
            .get("max_iterations")
            .unwrap_or(d.max_outer_iterations);
    }

    // Model table.
    if let Ok(model_tbl) = globals.get::<_, Table>("model") {
        let d = ModelOptions::default();
        input.model.grid_points = model_tbl.get("grid_points").unwrap_or(d.grid_points);
        input.model.box_length = model_tbl.get("box_length").unwrap_or(d.box_length);
        let potential: String = model_tbl
            .get("potential")
            .unwrap_or_else(|_| "harmonic".to_string());
        input.model.potential = match potential.as_str() {
            "harmonic" => PotentialKind::Harmonic,
            "well" => PotentialKind::Well,
            _ => {
                eprintln!("model.potential must be 'harmonic' or 'well'");
                std::process::exit(1);
            }
        };
        input.model.potential_strength = model_tbl
            .get("potential_strength")
            .unwrap_or(d.potential_strength);
        input.model.seed = model_tbl.get("seed").unwrap_or(d.seed);
    }

    // Write table.
    if let Ok(write_tbl) = globals.get::<_, Table>("write") {
        let d = WriteOptions::default();
        input.write.verbose = write_tbl.get("verbose").unwrap_or(d.verbose);
        input.write.write_spectrum = write_tbl.get("write_spectrum").unwrap_or(d.write_spectrum);
        input.write.spectrum_file = write_tbl
            .get("spectrum_file")
            .unwrap_or_else(|_| d.spectrum_file.clone());
    }

    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_when_tables_are_absent() {
        let mut file = tempfile_path("empty");
        writeln!(file.1, "-- no tables at all").unwrap();
        drop(file.1);
        let input = load_input(&file.0);
        assert_eq!(input.solver.n_states, 8);
        assert_eq!(input.solver.ortho_strategy, OrthoStrategy::Lowdin);
        assert!(input.solver.switch_to_fallback_on_degeneracy);
    }

    #[test]
    fn solver_table_overrides_defaults() {
        let mut file = tempfile_path("solver");
        writeln!(
            file.1,
            "solver = {{ n_states = 12, degree = 25, ortho = 'gram_schmidt', \
             spectrum_split = true, core_states = 3, process_grid = true, \
             tolerance = 1e-8 }}"
        )
        .unwrap();
        drop(file.1);
        let input = load_input(&file.0);
        assert_eq!(input.solver.n_states, 12);
        assert_eq!(input.solver.chebyshev_degree, 25);
        assert_eq!(input.solver.ortho_strategy, OrthoStrategy::GramSchmidt);
        assert!(input.solver.use_spectrum_split);
        assert_eq!(input.solver.n_core_states, 3);
        assert!(input.solver.use_process_grid);
        assert!((input.solver.tolerance - 1e-8).abs() < 1e-20);
    }

    #[test]
    fn model_table_selects_the_potential() {
        let mut file = tempfile_path("model");
        writeln!(
            file.1,
            "model = {{ grid_points = 128, box_length = 12.5, potential = 'well', \
             potential_strength = 4.0 }}"
        )
        .unwrap();
        drop(file.1);
        let input = load_input(&file.0);
        assert_eq!(input.model.grid_points, 128);
        assert_eq!(input.model.potential, PotentialKind::Well);
        assert!((input.model.box_length - 12.5).abs() < 1e-14);
    }

    fn tempfile_path(tag: &str) -> (String, std::fs::File) {
        let path = std::env::temp_dir().join(format!("chefsi_input_{tag}_{}.lua", std::process::id()));
        let path = path.to_string_lossy().to_string();
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
