use std::cell::RefCell;
use std::fs::{self, File, FileTimes};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aspenc::cache::CompileParams;
use aspenc::engine::PageRuntime;
use aspenc::pipeline::{PageError, compile_page};
use aspenc::translate::{LuaTranslator, Sink, TemplateTranslator};

fn temp_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("aspen_pipeline_test_{tag}_{nanos}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn age_file(path: &Path, seconds_back: u64) {
    let file = File::options().write(true).open(path).expect("open for times");
    let past = SystemTime::now() - Duration::from_secs(seconds_back);
    file.set_times(FileTimes::new().set_modified(past))
        .expect("set mtime");
}

/// Counts translation passes so cache hits are observable.
struct CountingTranslator {
    inner: LuaTranslator,
    parses: usize,
}

impl CountingTranslator {
    fn new() -> Self {
        Self {
            inner: LuaTranslator::new(),
            parses: 0,
        }
    }
}

impl TemplateTranslator for CountingTranslator {
    fn emit_prolog(&mut self, sink: &mut Sink<'_>) {
        self.inner.emit_prolog(sink);
    }

    fn parse_source(&mut self, source: &[u8], sink: &mut Sink<'_>) {
        self.parses += 1;
        self.inner.parse_source(source, sink);
    }

    fn emit_epilog(&mut self, sink: &mut Sink<'_>) {
        self.inner.emit_epilog(sink);
    }
}

/// Deterministic runtime double: programs are the chunk bytes themselves.
#[derive(Default)]
struct FakeRuntime {
    loads: RefCell<Vec<Vec<u8>>>,
    runs: RefCell<usize>,
}

impl PageRuntime for FakeRuntime {
    type Program = Vec<u8>;

    fn load(&self, chunk: &[u8], _name: &str) -> Result<Vec<u8>, String> {
        self.loads.borrow_mut().push(chunk.to_vec());
        Ok(chunk.to_vec())
    }

    fn run(&self, _program: &Vec<u8>) -> Result<(), String> {
        *self.runs.borrow_mut() += 1;
        Ok(())
    }

    fn serialize(&self, program: &Vec<u8>) -> Vec<u8> {
        program.clone()
    }
}

struct RejectingRuntime;

impl PageRuntime for RejectingRuntime {
    type Program = ();

    fn load(&self, _chunk: &[u8], name: &str) -> Result<(), String> {
        Err(format!("{name}: bad chunk"))
    }

    fn run(&self, _program: &()) -> Result<(), String> {
        Ok(())
    }

    fn serialize(&self, _program: &()) -> Vec<u8> {
        Vec::new()
    }
}

#[test]
fn missing_source_is_fatal() {
    let runtime = FakeRuntime::default();
    let mut translator = CountingTranslator::new();
    let err = compile_page(
        &runtime,
        Path::new("/nonexistent/page.asp"),
        &CompileParams::default(),
        &mut translator,
        false,
    )
    .unwrap_err();
    assert!(matches!(err, PageError::Io(_)));
    assert_eq!(translator.parses, 0);
}

#[test]
fn second_compile_reuses_fresh_cache() {
    let dir = temp_dir("cachehit");
    let source = dir.join("page.asp");
    fs::write(&source, b"<p><%= 1 %></p>").expect("write source");

    let params = CompileParams {
        lua_path: None,
        luac_path: Some(dir.join("page.asp.luac")),
    };

    let runtime = FakeRuntime::default();
    let mut translator = CountingTranslator::new();
    compile_page(&runtime, &source, &params, &mut translator, false).expect("first compile");
    assert_eq!(translator.parses, 1);
    let luac_path = params.luac_path.as_deref().unwrap();
    let first_bytes = fs::read(luac_path).expect("first cache bytes");
    assert!(!first_bytes.is_empty());

    // Make the source strictly older than the cached chunk.
    age_file(&source, 60);

    compile_page(&runtime, &source, &params, &mut translator, false).expect("second compile");
    assert_eq!(translator.parses, 1);
    let second_bytes = fs::read(luac_path).expect("second cache bytes");
    assert_eq!(first_bytes, second_bytes);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn equal_timestamps_recompile() {
    let dir = temp_dir("equal");
    let source = dir.join("page.asp");
    fs::write(&source, b"<p>x</p>").expect("write source");

    let params = CompileParams {
        lua_path: None,
        luac_path: Some(dir.join("page.asp.luac")),
    };

    let runtime = FakeRuntime::default();
    let mut translator = CountingTranslator::new();
    compile_page(&runtime, &source, &params, &mut translator, false).expect("first compile");

    // Pin both mtimes to the same second.
    let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    for path in [&source, &params.luac_path.clone().unwrap()] {
        let file = File::options().write(true).open(path).expect("open");
        file.set_times(FileTimes::new().set_modified(stamp)).expect("set mtime");
    }

    compile_page(&runtime, &source, &params, &mut translator, false).expect("second compile");
    assert_eq!(translator.parses, 2);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn modified_source_invalidates_cache() {
    let dir = temp_dir("stale");
    let source = dir.join("page.asp");
    fs::write(&source, b"old").expect("write source");

    let params = CompileParams {
        lua_path: None,
        luac_path: Some(dir.join("page.asp.luac")),
    };

    let runtime = FakeRuntime::default();
    let mut translator = CountingTranslator::new();
    compile_page(&runtime, &source, &params, &mut translator, false).expect("first compile");
    age_file(&source, 60);
    compile_page(&runtime, &source, &params, &mut translator, false).expect("cache hit");
    assert_eq!(translator.parses, 1);

    // A rewrite bumps the source mtime past the cached chunk.
    fs::write(&source, b"new").expect("rewrite source");
    compile_page(&runtime, &source, &params, &mut translator, false).expect("recompile");
    assert_eq!(translator.parses, 2);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn generated_source_is_persisted_best_effort() {
    let dir = temp_dir("genlua");
    let source = dir.join("page.asp");
    fs::write(&source, b"<p>hi</p>").expect("write source");

    let params = CompileParams {
        lua_path: Some(dir.join("page.asp.lua")),
        luac_path: None,
    };

    let runtime = FakeRuntime::default();
    let mut translator = CountingTranslator::new();
    compile_page(&runtime, &source, &params, &mut translator, false).expect("compile");

    let generated = fs::read_to_string(dir.join("page.asp.lua")).expect("generated source");
    assert!(generated.contains("asp.write(\"<p>hi</p>\")"));

    // An unwritable target does not fail the compilation.
    let params = CompileParams {
        lua_path: Some(dir.join("missing_dir").join("page.asp.lua")),
        luac_path: None,
    };
    compile_page(&runtime, &source, &params, &mut translator, false)
        .expect("compile without persist");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn bom_is_stripped_before_translation() {
    let dir = temp_dir("bom");
    let source = dir.join("page.asp");
    fs::write(&source, b"\xEF\xBB\xBF<p>bom</p>").expect("write source");

    let runtime = FakeRuntime::default();
    let mut translator = CountingTranslator::new();
    compile_page(
        &runtime,
        &source,
        &CompileParams::default(),
        &mut translator,
        false,
    )
    .expect("compile");

    let loads = runtime.loads.borrow();
    assert_eq!(loads.len(), 1);
    assert!(!loads[0].starts_with(b"\xEF\xBB\xBF"));
    let text = String::from_utf8_lossy(&loads[0]);
    assert!(text.contains("asp.write(\"<p>bom</p>\")"));
}

#[test]
fn run_flag_invokes_the_loaded_page() {
    let dir = temp_dir("run");
    let source = dir.join("page.asp");
    fs::write(&source, b"x").expect("write source");

    let runtime = FakeRuntime::default();
    let mut translator = CountingTranslator::new();
    compile_page(
        &runtime,
        &source,
        &CompileParams::default(),
        &mut translator,
        false,
    )
    .expect("precompile");
    assert_eq!(*runtime.runs.borrow(), 0);

    compile_page(
        &runtime,
        &source,
        &CompileParams::default(),
        &mut translator,
        true,
    )
    .expect("compile and run");
    assert_eq!(*runtime.runs.borrow(), 1);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn load_failure_surfaces_the_runtime_message() {
    let dir = temp_dir("loadfail");
    let source = dir.join("page.asp");
    fs::write(&source, b"x").expect("write source");

    let mut translator = CountingTranslator::new();
    let err = compile_page(
        &RejectingRuntime,
        &source,
        &CompileParams::default(),
        &mut translator,
        true,
    )
    .unwrap_err();
    match err {
        PageError::Load(message) => assert!(message.contains("bad chunk")),
        other => panic!("expected load error, got {other:?}"),
    }

    let _ = fs::remove_dir_all(&dir);
}
