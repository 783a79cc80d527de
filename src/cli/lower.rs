use std::fmt::Write as _;
use std::path::PathBuf;
use std::process;

use rayon::prelude::*;

use taskmesh::{lower_reference, module_hash, Diagnostic, PipelineState, Simulator};

use super::load_state;

/// Lower one pipeline and describe the result.
fn lower_one(state: &PipelineState, print: bool, hash: bool, run: Option<[u32; 3]>) -> Result<String, Diagnostic> {
    let (pair, summary) = lower_reference(state)?;
    let mut out = String::new();

    if let Some(layout) = &summary.layout {
        let _ = writeln!(out, "  lds: {} bytes", layout.total_size());
    }
    if let Some(ring) = &summary.ring {
        let _ = writeln!(out, "  ring: {} entries", ring.entry_count);
    }
    if hash {
        let _ = writeln!(out, "  hash: {}", module_hash(&pair.module).to_hex());
    }
    if print {
        let _ = writeln!(out, "{}", pair.module);
    }
    if let Some(dims) = run {
        let mut sim = Simulator::new(&pair.module, state);
        let result = sim.run_pipeline(pair.task, pair.mesh, dims)?;
        let vertices: usize = result.mesh_workgroups.iter().map(|w| w.vertices.len()).sum();
        let primitives: usize = result.mesh_workgroups.iter().map(|w| w.primitives.len()).sum();
        let _ = writeln!(
            out,
            "  run {:?}: {} launches, {} mesh workgroups, {} vertices, {} primitives",
            dims,
            result.launches.len(),
            result.mesh_workgroups.len(),
            vertices,
            primitives
        );
        if let Some(stats) = result.stats {
            let _ = writeln!(
                out,
                "  stats: task threads {}, mesh threads {}, mesh primitives {}",
                stats.num_task_threads, stats.num_mesh_threads, stats.num_mesh_primitives
            );
        }
    }
    Ok(out)
}

pub fn cmd_lower(configs: Vec<PathBuf>, print: bool, hash: bool, run: Option<[u32; 3]>) {
    let states: Vec<(PathBuf, PipelineState)> = configs
        .into_iter()
        .map(|path| {
            let state = load_state(&path);
            (path, state)
        })
        .collect();

    let results: Vec<_> = states
        .par_iter()
        .map(|(_, state)| lower_one(state, print, hash, run))
        .collect();

    let mut failed = false;
    for ((path, _), result) in states.iter().zip(results) {
        match result {
            Ok(report) => {
                println!("{}", path.display());
                print!("{}", report);
            }
            Err(diag) => {
                eprintln!("{}:", path.display());
                diag.render();
                failed = true;
            }
        }
    }
    if failed {
        process::exit(1);
    }
}
