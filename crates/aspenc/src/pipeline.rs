use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::Path;

use memmap2::Mmap;

use crate::cache::{self, CompileParams};
use crate::engine::PageRuntime;
use crate::translate::TemplateTranslator;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug)]
pub enum PageError {
    /// Source stat/map failure. Fatal for the request.
    Io(io::Error),
    /// The runtime rejected the generated or cached chunk.
    Load(String),
    /// The loaded page raised while running.
    Run(String),
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageError::Io(err) => write!(f, "{err}"),
            PageError::Load(message) => write!(f, "{message}"),
            PageError::Run(message) => write!(f, "{message}"),
        }
    }
}

/// Compiled-chunk bytes: freshly generated and heap-owned, or a read-only
/// view over an existing cache file. Consumed exactly once by the loader.
enum Artifact {
    Generated(Vec<u8>),
    Cached(Mmap),
}

impl Artifact {
    fn bytes(&self) -> &[u8] {
        match self {
            Artifact::Generated(buf) => buf,
            Artifact::Cached(map) => map,
        }
    }
}

/// Translates `source_path` into a script chunk, optionally persisting the
/// generated source to `lua_path` (best effort).
fn generate_chunk(
    source_path: &Path,
    lua_path: Option<&Path>,
    translator: &mut dyn TemplateTranslator,
) -> Result<Vec<u8>, PageError> {
    let file = File::open(source_path).map_err(PageError::Io)?;
    let len = file.metadata().map_err(PageError::Io)?.len();

    let map;
    let mut content: &[u8] = if len == 0 {
        // Mapping a zero-length file fails on most platforms.
        &[]
    } else {
        map = unsafe { Mmap::map(&file) }.map_err(PageError::Io)?;
        &map
    };
    if content.starts_with(UTF8_BOM) {
        content = &content[UTF8_BOM.len()..];
    }

    // Literal spans expand roughly 4x when quoted into write calls.
    let mut out = Vec::with_capacity(content.len().saturating_mul(4));
    {
        let mut sink = |bytes: &[u8]| out.extend_from_slice(bytes);
        translator.emit_prolog(&mut sink);
        translator.parse_source(content, &mut sink);
        translator.emit_epilog(&mut sink);
    }

    if let Some(path) = lua_path {
        if let Err(err) = fs::write(path, &out) {
            aspen_rt::log::warn(&format!(
                "could not persist generated source {}: {err}",
                path.display()
            ));
        }
    }

    Ok(out)
}

/// Compiles `source_path`, reusing the cached chunk when it is fresh, and
/// loads the result into `runtime` under the source path's name. With `run`
/// set the loaded page is invoked immediately; without it the call is a
/// precompile that only refreshes the cache.
pub fn compile_page<R: PageRuntime>(
    runtime: &R,
    source_path: &Path,
    params: &CompileParams,
    translator: &mut dyn TemplateTranslator,
    run: bool,
) -> Result<(), PageError> {
    let source_mtime = fs::metadata(source_path)
        .and_then(|meta| meta.modified())
        .map_err(PageError::Io)?;

    let recompile = cache::needs_recompilation(source_mtime, params.luac_path.as_deref());

    let cached_path = if recompile {
        None
    } else {
        params.luac_path.as_deref()
    };
    let artifact = match cached_path {
        Some(luac_path) => {
            let file = File::open(luac_path).map_err(PageError::Io)?;
            Artifact::Cached(unsafe { Mmap::map(&file) }.map_err(PageError::Io)?)
        }
        None => Artifact::Generated(generate_chunk(
            source_path,
            params.lua_path.as_deref(),
            translator,
        )?),
    };

    let name = source_path.display().to_string();
    let program = runtime
        .load(artifact.bytes(), &name)
        .map_err(PageError::Load)?;
    // The chunk's job ends the moment it is loaded.
    drop(artifact);

    if recompile {
        if let Some(luac_path) = params.luac_path.as_deref() {
            persist_bytecode(luac_path, &runtime.serialize(&program));
        }
    }

    if run {
        runtime.run(&program).map_err(PageError::Run)?;
    }
    Ok(())
}

/// Best-effort cache write. The bytes land in a temp file first and move into
/// place with a rename, so concurrent recompiles of the same page never leave
/// a torn chunk for a third reader.
fn persist_bytecode(path: &Path, bytes: &[u8]) {
    let Some(parent) = path.parent() else {
        return;
    };
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return;
    };
    let Ok(tag) = getrandom::u64() else {
        return;
    };
    let tmp = parent.join(format!(".{file_name}.{tag:016x}.tmp"));
    if let Err(err) = fs::write(&tmp, bytes) {
        aspen_rt::log::warn(&format!(
            "could not persist chunk cache {}: {err}",
            path.display()
        ));
        return;
    }
    if fs::rename(&tmp, path).is_err() {
        let _ = fs::remove_file(&tmp);
    }
}
