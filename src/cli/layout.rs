use std::path::PathBuf;
use std::process;

use taskmesh::samples::reference_pair;
use taskmesh::MeshTaskShader;

use super::load_state;

pub fn cmd_layout(config: PathBuf) {
    let state = load_state(&config);
    let result = reference_pair(&state).and_then(|pair| {
        let mesh = pair
            .module
            .function(pair.mesh)
            .ok_or_else(|| taskmesh::Diagnostic::internal("reference mesh shader missing".to_string()))?;
        MeshTaskShader::new(&state).layout_mesh_shader_lds(mesh)
    });
    match result {
        Ok(layout) => {
            eprintln!("Layout: {}", config.display());
            println!("{}", layout);
        }
        Err(diag) => {
            diag.render();
            process::exit(1);
        }
    }
}
