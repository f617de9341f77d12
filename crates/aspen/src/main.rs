use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use serde::Deserialize;

use aspenc::cache;
use aspenc::config::HostConfig;
use aspenc::engine::LuaEngine;
use aspenc::pipeline::compile_page;
use aspenc::translate::LuaTranslator;

mod server;

const USAGE: &str = r#"usage: aspen <command> [options] [file]

commands:
  serve       Serve pages from the document root
  precompile  Translate a page and refresh its cache artifacts

options:
  --manifest-path <path>  Path to aspen.toml (defaults to ./aspen.toml)
  --listen <addr>         Listen address override (serve)
  --root <dir>            Document root override
  --set <key=value>       Host option override (cache_lua, cache_luac,
                          cache_dir, upload_dir)
"#;

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    server: Option<ServerSection>,
    #[serde(default)]
    host: Option<HostConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerSection {
    listen: Option<String>,
    root: Option<String>,
}

fn main() {
    process::exit(run(env::args().skip(1)));
}

fn run<I>(args: I) -> i32
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut command = None;
    let mut manifest_path: Option<PathBuf> = None;
    let mut listen = None;
    let mut root = None;
    let mut overrides: Vec<(String, String)> = Vec::new();
    let mut file = None;

    while let Some(arg) = args.next() {
        if arg == "--manifest-path" {
            let Some(path) = args.next() else {
                eprintln!("--manifest-path expects a path");
                eprintln!("{USAGE}");
                return 1;
            };
            manifest_path = Some(PathBuf::from(path));
            continue;
        }
        if arg == "--listen" {
            let Some(addr) = args.next() else {
                eprintln!("--listen expects an address");
                eprintln!("{USAGE}");
                return 1;
            };
            listen = Some(addr);
            continue;
        }
        if arg == "--root" {
            let Some(dir) = args.next() else {
                eprintln!("--root expects a directory");
                eprintln!("{USAGE}");
                return 1;
            };
            root = Some(PathBuf::from(dir));
            continue;
        }
        if arg == "--set" {
            let Some(pair) = args.next() else {
                eprintln!("--set expects key=value");
                eprintln!("{USAGE}");
                return 1;
            };
            let Some((key, value)) = pair.split_once('=') else {
                eprintln!("--set expects key=value, got {pair}");
                return 1;
            };
            overrides.push((key.to_string(), value.to_string()));
            continue;
        }
        if command.is_none() {
            command = Some(arg);
        } else if file.is_none() {
            file = Some(PathBuf::from(arg));
        } else {
            eprintln!("unexpected argument: {arg}");
            eprintln!("{USAGE}");
            return 1;
        }
    }

    let Some(command) = command else {
        eprintln!("{USAGE}");
        return 1;
    };

    let manifest = match load_manifest(manifest_path.as_deref()) {
        Ok(manifest) => manifest,
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };

    let mut host = manifest.host.unwrap_or_default();
    for (key, value) in &overrides {
        if !host.set_option(key, value) {
            eprintln!("unknown host option: {key}");
            return 1;
        }
    }

    let section = manifest.server.unwrap_or_default();
    let listen = listen
        .or(section.listen)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let document_root = root
        .or(section.root.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    match command.as_str() {
        "serve" => {
            let config = server::ServerConfig {
                listen,
                document_root,
                host,
            };
            if let Err(err) = server::serve(config) {
                eprintln!("{err}");
                return 1;
            }
            0
        }
        "precompile" => {
            let Some(file) = file else {
                eprintln!("precompile expects a page file");
                eprintln!("{USAGE}");
                return 1;
            };
            precompile(&file, &document_root, &host)
        }
        other => {
            eprintln!("unknown command: {other}");
            eprintln!("{USAGE}");
            1
        }
    }
}

fn load_manifest(path: Option<&Path>) -> Result<Manifest, String> {
    let path = path.unwrap_or_else(|| Path::new("aspen.toml"));
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) if path == Path::new("aspen.toml") => return Ok(Manifest::default()),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };
    toml::from_str(&text).map_err(|err| format!("failed to parse {}: {err}", path.display()))
}

fn precompile(file: &Path, document_root: &Path, host: &HostConfig) -> i32 {
    let source = match file.canonicalize() {
        Ok(path) => path,
        Err(err) => {
            eprintln!("failed to resolve {}: {err}", file.display());
            return 1;
        }
    };
    let root = document_root
        .canonicalize()
        .unwrap_or_else(|_| document_root.to_path_buf());

    let params = match cache::derive_cache_paths(host, &root, &source) {
        Ok(params) => params,
        Err(err) => {
            eprintln!("cache setup failed: {err}");
            return 1;
        }
    };
    if params.lua_path.is_none() && params.luac_path.is_none() {
        eprintln!(
            "nothing to cache for {}: enable cache_lua or cache_luac and keep the page under the document root",
            source.display()
        );
        return 1;
    }

    let engine = LuaEngine::new();
    let mut translator = LuaTranslator::new();
    match compile_page(&engine, &source, &params, &mut translator, false) {
        Ok(()) => {
            if let Some(path) = &params.luac_path {
                println!("cached chunk {}", path.display());
            }
            if let Some(path) = &params.lua_path {
                println!("cached source {}", path.display());
            }
            0
        }
        Err(err) => {
            eprintln!("precompile failed: {err}");
            1
        }
    }
}
