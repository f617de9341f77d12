use std::path::{Path, PathBuf};

use aspen_rt::collections::{FileCollection, NameValueCollection};
use aspen_rt::posted::PostedFile;

use crate::cache::{self, CompileParams};
use crate::config::HostConfig;
use crate::engine::LuaEngine;
use crate::multipart::FormItem;
use crate::pipeline;
use crate::translate::TemplateTranslator;

/// Host-side capabilities the executing page can reach.
pub trait ServerAdapter {
    /// Maps a request uri to a filesystem path. An empty uri maps to the
    /// document root.
    fn map_path(&self, uri: &str) -> PathBuf;
    fn on_error(&self, text: &str);
    fn write_log(&self, text: &str);
}

pub trait RequestAdapter {
    fn uri(&self) -> String;
    fn query_string(&self) -> String;
    fn method(&self) -> String;
    fn header(&self, name: &str) -> Option<String>;
}

pub trait ResponseAdapter {
    fn write(&self, data: &[u8]);
    fn respond_405(&self, allow: &str, extra: &str);
    fn respond_415(&self, content_type: &str);
}

/// Everything one request execution needs: configuration, the host adapters,
/// and the decoded form data.
pub struct PageContext<'a> {
    pub config: &'a HostConfig,
    pub server: &'a dyn ServerAdapter,
    pub request: &'a dyn RequestAdapter,
    pub response: &'a dyn ResponseAdapter,
    pub form: NameValueCollection,
    pub files: FileCollection,
}

impl<'a> PageContext<'a> {
    pub fn new(
        config: &'a HostConfig,
        server: &'a dyn ServerAdapter,
        request: &'a dyn RequestAdapter,
        response: &'a dyn ResponseAdapter,
    ) -> Self {
        Self {
            config,
            server,
            request,
            response,
            form: NameValueCollection::new(),
            files: FileCollection::new(),
        }
    }

    /// Partitions decoded multipart items into the field and file
    /// collections, preserving multi-value order for repeated names.
    pub fn absorb_form_items(&mut self, items: Vec<FormItem>) {
        for item in items {
            if item.is_file {
                let Some(path) = item.stored_path else {
                    continue;
                };
                self.files.add(
                    &item.name,
                    PostedFile::new(item.file_name, item.content_length, item.content_type, path),
                );
            } else {
                self.form
                    .add(&item.name, String::from_utf8_lossy(&item.value).into_owned());
            }
        }
    }
}

/// Compiles and runs one page against `ctx`. The `asp` global carries the
/// host callbacks and request data for the duration of the call; compile and
/// run errors are routed to the server's error callback rather than the
/// caller.
pub fn execute_page(
    engine: &LuaEngine,
    source_path: &Path,
    ctx: &PageContext<'_>,
    translator: &mut dyn TemplateTranslator,
) {
    let lua = engine.lua();
    let outcome = lua.scope(|scope| {
        let asp = lua.create_table()?;

        let response = ctx.response;
        asp.set(
            "write",
            scope.create_function(move |_, text: mlua::String| {
                response.write(&text.as_bytes());
                Ok(())
            })?,
        )?;

        let server = ctx.server;
        asp.set(
            "error",
            scope.create_function(move |_, text: String| {
                server.on_error(&text);
                Ok(())
            })?,
        )?;
        asp.set(
            "log",
            scope.create_function(move |_, text: String| {
                server.write_log(&text);
                Ok(())
            })?,
        )?;
        asp.set(
            "map_path",
            scope.create_function(move |_, uri: Option<String>| {
                let mapped = server.map_path(uri.as_deref().unwrap_or(""));
                Ok(mapped.display().to_string())
            })?,
        )?;

        let request = lua.create_table()?;
        let vars = lua.create_table()?;
        vars.set("QUERY_STRING", ctx.request.query_string())?;
        vars.set("HTTP_METHOD", ctx.request.method())?;
        vars.set("REQUEST_METHOD", ctx.request.method())?;
        request.set("server_variables", vars)?;

        let files = lua.create_table()?;
        let mut index = 1i64;
        for pos in 0..ctx.files.len() {
            let Some(key) = ctx.files.key_at(pos) else {
                continue;
            };
            let Some(posted) = ctx.files.get_multiple(key) else {
                continue;
            };
            for file in posted {
                files.set(index, file.stored_path().display().to_string())?;
                index += 1;
            }
        }
        request.set("files", files)?;

        let form = lua.create_table()?;
        for pos in 0..ctx.form.len() {
            let Some(key) = ctx.form.key_at(pos) else {
                continue;
            };
            if let Some(value) = ctx.form.get_at(pos) {
                form.set(key, value)?;
            }
        }
        request.set("form", form)?;

        asp.set("request", request)?;
        lua.globals().set("asp", asp)?;

        // Cache-path derivation is best effort; a failure here only costs
        // the cache, not the request.
        let mut params = CompileParams::default();
        let document_root = ctx.server.map_path("");
        if !document_root.as_os_str().is_empty() {
            match cache::derive_cache_paths(ctx.config, &document_root, source_path) {
                Ok(derived) => params = derived,
                Err(err) => {
                    aspen_rt::log::warn(&format!("cache setup failed: {err}"));
                }
            }
        }

        Ok(pipeline::compile_page(
            engine,
            source_path,
            &params,
            translator,
            true,
        ))
    });

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => ctx.server.on_error(&err.to_string()),
        Err(err) => ctx.server.on_error(&err.to_string()),
    }
}
