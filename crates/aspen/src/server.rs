use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use aspen_rt::strings::find_subsequence;
use aspenc::config::HostConfig;
use aspenc::context::{PageContext, RequestAdapter, ResponseAdapter, ServerAdapter, execute_page};
use aspenc::dispatch;
use aspenc::engine::LuaEngine;
use aspenc::multipart::RandomNames;
use aspenc::translate::LuaTranslator;

pub struct ServerConfig {
    pub listen: String,
    pub document_root: PathBuf,
    pub host: HostConfig,
}

struct ParsedRequest {
    method: String,
    uri: String,
    query: String,
    headers: Vec<(String, String)>,
    body_prefix: Vec<u8>,
}

struct HttpServerAdapter {
    document_root: PathBuf,
}

impl ServerAdapter for HttpServerAdapter {
    fn map_path(&self, uri: &str) -> PathBuf {
        self.document_root.join(uri.trim_start_matches('/'))
    }

    fn on_error(&self, text: &str) {
        aspen_rt::log::error(text);
    }

    fn write_log(&self, text: &str) {
        aspen_rt::log::info(text);
    }
}

struct HttpRequestAdapter {
    method: String,
    uri: String,
    query: String,
    headers: Vec<(String, String)>,
}

impl RequestAdapter for HttpRequestAdapter {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn query_string(&self) -> String {
        self.query.clone()
    }

    fn method(&self) -> String {
        self.method.clone()
    }

    fn header(&self, name: &str) -> Option<String> {
        // Later duplicates win, as with the reverse scan in most servers.
        self.headers
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }
}

struct HttpResponseAdapter<'a> {
    stream: &'a TcpStream,
    header_sent: std::cell::Cell<bool>,
}

impl<'a> HttpResponseAdapter<'a> {
    fn new(stream: &'a TcpStream) -> Self {
        Self {
            stream,
            header_sent: std::cell::Cell::new(false),
        }
    }

    fn send(&self, bytes: &[u8]) {
        let mut stream = self.stream;
        if let Err(err) = stream.write_all(bytes) {
            aspen_rt::log::warn(&format!("response write failed: {err}"));
        }
    }
}

impl ResponseAdapter for HttpResponseAdapter<'_> {
    fn write(&self, data: &[u8]) {
        if !self.header_sent.get() {
            self.header_sent.set(true);
            self.send(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n");
        }
        self.send(data);
    }

    fn respond_405(&self, allow: &str, extra: &str) {
        self.header_sent.set(true);
        self.send(
            format!(
                "HTTP/1.1 405 Method Not Allowed\r\nContent-Length: {}\r\nAllow: {allow}\r\nConnection: close\r\n\r\n{extra}",
                extra.len()
            )
            .as_bytes(),
        );
    }

    fn respond_415(&self, content_type: &str) {
        self.header_sent.set(true);
        let body = format!("content type {content_type} not allowed");
        self.send(
            format!(
                "HTTP/1.1 415 Unsupported Media Type\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .as_bytes(),
        );
    }
}

/// Body reader handed to the multipart decoder: drains the bytes that arrived
/// with the request head, then pulls from the socket up to Content-Length.
struct BodyReader<'a> {
    prefix: Vec<u8>,
    pos: usize,
    stream: &'a TcpStream,
    remaining: u64,
}

impl Read for BodyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos < self.prefix.len() {
            let take = (self.prefix.len() - self.pos).min(buf.len());
            buf[..take].copy_from_slice(&self.prefix[self.pos..self.pos + take]);
            self.pos += take;
            return Ok(take);
        }
        if self.remaining == 0 {
            return Ok(0);
        }
        let cap = buf.len().min(self.remaining as usize);
        let mut stream = self.stream;
        let read = stream.read(&mut buf[..cap])?;
        self.remaining -= read as u64;
        Ok(read)
    }
}

pub fn serve(config: ServerConfig) -> Result<(), String> {
    let listener = TcpListener::bind(&config.listen)
        .map_err(|err| format!("bind {} failed: {err}", config.listen))?;
    aspen_rt::log::info(&format!("listening on {}", config.listen));

    let config = Arc::new(config);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let config = Arc::clone(&config);
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &config) {
                        aspen_rt::log::warn(&format!("request failed: {err}"));
                    }
                });
            }
            Err(err) => aspen_rt::log::warn(&format!("accept failed: {err}")),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, config: &ServerConfig) -> Result<(), String> {
    let parsed = read_request(&mut stream)?;

    let server = HttpServerAdapter {
        document_root: config.document_root.clone(),
    };
    let response = HttpResponseAdapter::new(&stream);
    let request = HttpRequestAdapter {
        method: parsed.method,
        uri: parsed.uri,
        query: parsed.query,
        headers: parsed.headers,
    };

    let mut ctx = PageContext::new(&config.host, &server, &request, &response);

    let mut upload_dir: Option<PathBuf> = None;
    match request.method.as_str() {
        "POST" => {
            let upload_root = config
                .host
                .upload_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            let request_dir = create_request_upload_dir(&upload_root)
                .map_err(|err| format!("upload dir setup failed: {err}"))?;

            let content_length = request
                .header("Content-Length")
                .and_then(|value| value.trim().parse::<u64>().ok())
                .unwrap_or(0);
            let already = parsed.body_prefix.len() as u64;
            let mut body = BodyReader {
                prefix: parsed.body_prefix,
                pos: 0,
                stream: &stream,
                remaining: content_length.saturating_sub(already),
            };

            let mut names = RandomNames;
            let items =
                dispatch::process_post_request(&request, &mut body, &response, &request_dir, &mut names);
            ctx.absorb_form_items(items);
            upload_dir = Some(request_dir);
        }
        "GET" => {}
        _ => {
            response.respond_405("GET, POST", "");
            return Ok(());
        }
    }

    let page_path = server.map_path(&request.uri);
    if !page_path.is_file() {
        let body = "not found";
        response.send(
            format!(
                "HTTP/1.1 404 Not Found\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .as_bytes(),
        );
    } else {
        let engine = LuaEngine::new();
        let mut translator = LuaTranslator::new();
        execute_page(&engine, &page_path, &ctx, &mut translator);
    }

    // Uploads the page did not save elsewhere die with the request.
    if let Some(dir) = upload_dir {
        let _ = fs::remove_dir_all(dir);
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<ParsedRequest, String> {
    let mut buffer = Vec::new();
    let mut temp = [0u8; 4096];
    let mut header_end = None;
    loop {
        let read = stream
            .read(&mut temp)
            .map_err(|err| format!("failed to read request: {err}"))?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&temp[..read]);
        if let Some(pos) = find_subsequence(&buffer, b"\r\n\r\n") {
            header_end = Some(pos);
            break;
        }
        if buffer.len() > 1024 * 1024 {
            return Err("request header too large".to_string());
        }
    }
    let header_end = header_end.ok_or_else(|| "invalid HTTP request: missing headers".to_string())?;

    let header_text = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
    let mut lines = header_text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| "invalid HTTP request line".to_string())?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| "invalid HTTP request line".to_string())?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| "invalid HTTP request line".to_string())?
        .to_string();
    let (uri, query) = match target.split_once('?') {
        Some((uri, query)) => (uri.to_string(), query.to_string()),
        None => (target, String::new()),
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(ParsedRequest {
        method,
        uri,
        query,
        headers,
        body_prefix: buffer[header_end + 4..].to_vec(),
    })
}

fn create_request_upload_dir(root: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(root)?;
    let mut last_err = std::io::Error::other("no attempts made");
    for attempt in 0..50 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = root.join(format!("req{nanos:x}{attempt:02}"));
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                last_err = err;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err)
}
