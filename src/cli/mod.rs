pub mod layout;
pub mod lower;

use std::path::Path;
use std::process;

use taskmesh::PipelineState;

/// Load a pipeline configuration or exit with its diagnostic.
pub fn load_state(path: &Path) -> PipelineState {
    match PipelineState::load(path) {
        Ok(state) => state,
        Err(diag) => {
            diag.render();
            process::exit(1);
        }
    }
}

/// Parse `X,Y,Z` dispatch dimensions.
pub fn parse_dims(text: &str) -> Result<[u32; 3], String> {
    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    let [x, y, z] = parts.as_slice() else {
        return Err(format!("expected X,Y,Z, got '{}'", text));
    };
    let parse = |s: &str| {
        s.parse::<u32>()
            .map_err(|e| format!("invalid dimension '{}': {}", s, e))
    };
    let dims = [parse(x)?, parse(y)?, parse(z)?];
    if dims.contains(&0) {
        return Err("dispatch dimensions must be non-zero".to_string());
    }
    Ok(dims)
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "[{}] {}: {}",
                record.level().as_str().to_lowercase(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

pub fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
