use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::config::HostConfig;

/// Optional persistence targets for one compilation, independent of each
/// other. Both unset means nothing is cached and every request recompiles.
#[derive(Clone, Debug, Default)]
pub struct CompileParams {
    pub lua_path: Option<PathBuf>,
    pub luac_path: Option<PathBuf>,
}

/// Staleness rule: no cached chunk, or one we cannot stat, forces
/// recompilation; otherwise the cache is reusable only when the source is
/// strictly older. Equal timestamps recompile.
pub fn needs_recompilation(source_mtime: SystemTime, luac_path: Option<&Path>) -> bool {
    let Some(path) = luac_path else {
        return true;
    };
    match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(cache_mtime) => !(source_mtime < cache_mtime),
        Err(_) => true,
    }
}

/// Mirrors the source's directory structure under the cache root and derives
/// the per-kind artifact paths. A source outside the document root gets no
/// cache paths at all.
pub fn derive_cache_paths(
    config: &HostConfig,
    document_root: &Path,
    source_path: &Path,
) -> io::Result<CompileParams> {
    let Some(cache_dir) = config.cache_dir.as_deref() else {
        return Ok(CompileParams::default());
    };
    if !config.cache_lua && !config.cache_luac {
        return Ok(CompileParams::default());
    }
    let Ok(relative) = source_path.strip_prefix(document_root) else {
        return Ok(CompileParams::default());
    };

    let mirrored = cache_dir.join(relative);
    if let Some(parent) = mirrored.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut params = CompileParams::default();
    if config.cache_lua {
        params.lua_path = Some(append_extension(&mirrored, ".lua"));
    }
    if config.cache_luac {
        params.luac_path = Some(append_extension(&mirrored, ".luac"));
    }
    Ok(params)
}

fn append_extension(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
