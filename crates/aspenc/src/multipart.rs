use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use aspen_rt::strings::{find_subsequence, tokenize, unquote};

const READ_CHUNK: usize = 0x4000;

/// One decoded multipart section. Field items carry their bytes in `value`;
/// file items were streamed to `stored_path` as they arrived.
#[derive(Debug, Default)]
pub struct FormItem {
    pub name: String,
    pub content_type: String,
    pub content_disposition: String,
    /// Client-supplied file name, or a generated one when the part gave none.
    pub file_name: String,
    /// Final on-disk location, present only for file items.
    pub stored_path: Option<PathBuf>,
    pub value: Vec<u8>,
    pub content_length: u64,
    pub is_file: bool,
}

/// Source of unique names for uploads that arrive without a file name.
pub trait NameSource {
    fn next_name(&mut self) -> String;
}

/// Random hex names, safe across concurrent requests sharing an upload dir.
#[derive(Default)]
pub struct RandomNames;

impl NameSource for RandomNames {
    fn next_name(&mut self) -> String {
        match getrandom::u64() {
            Ok(tag) => format!("file{tag:016x}"),
            Err(_) => "file0000000000000000".to_string(),
        }
    }
}

/// Deterministic names for tests.
#[derive(Default)]
pub struct SequentialNames {
    next: u32,
}

impl NameSource for SequentialNames {
    fn next_name(&mut self) -> String {
        let name = format!("file{:08}", self.next);
        self.next += 1;
        name
    }
}

/// Content sink for the part currently being decoded. Field bytes accumulate
/// in memory; file bytes stream to disk as they arrive.
enum Sink {
    Memory(Vec<u8>),
    File(Option<File>),
}

impl Sink {
    fn append(&mut self, data: &[u8]) -> u64 {
        match self {
            Sink::Memory(buf) => {
                buf.extend_from_slice(data);
                data.len() as u64
            }
            Sink::File(file) => {
                if let Some(handle) = file {
                    if let Err(err) = handle.write_all(data) {
                        aspen_rt::log::warn(&format!("upload write failed: {err}"));
                        *file = None;
                        return 0;
                    }
                    return data.len() as u64;
                }
                0
            }
        }
    }
}

struct OpenPart {
    item: FormItem,
    sink: Sink,
}

impl OpenPart {
    fn append(&mut self, data: &[u8]) {
        self.item.content_length += self.sink.append(data);
    }

    fn finish(mut self) -> FormItem {
        if let Sink::Memory(buf) = self.sink {
            self.item.value = buf;
        }
        self.item
    }
}

fn extract_content_disposition(data: &str, item: &mut FormItem) {
    let mut params = tokenize(data, "; ");
    if params.is_empty() {
        return;
    }
    let disposition = params.remove(0);
    item.content_disposition = disposition.to_string();
    if disposition != "form-data" {
        // Other dispositions are rejected without parameter extraction.
        return;
    }
    for param in params {
        let pair = tokenize(param, "=");
        if pair.len() != 2 {
            continue;
        }
        match pair[0] {
            "name" => item.name = unquote(pair[1]).to_string(),
            "filename" => {
                item.file_name = unquote(pair[1]).to_string();
                item.is_file = true;
            }
            _ => {}
        }
    }
}

fn process_part_headers(block: &[u8], item: &mut FormItem) {
    let text = String::from_utf8_lossy(block);
    for line in text.split("\r\n") {
        if let Some(rest) = line.strip_prefix("Content-Disposition:") {
            extract_content_disposition(rest, item);
        } else if let Some(rest) = line.strip_prefix("Content-Type:") {
            if let Some(parsed) = crate::dispatch::parse_content_type_header(rest) {
                // A boundary parameter here would mean nested multipart,
                // which is not supported; the value is parsed and dropped.
                item.content_type = parsed.media_type;
            }
        }
    }
}

fn open_part(
    mut item: FormItem,
    upload_dir: &Path,
    names: &mut dyn NameSource,
) -> OpenPart {
    let sink = if item.is_file {
        if item.file_name.is_empty() {
            item.file_name = names.next_name();
        }
        let path = upload_dir.join(&item.file_name);
        let file = match File::create(&path) {
            Ok(file) => Some(file),
            Err(err) => {
                aspen_rt::log::warn(&format!(
                    "could not create upload file {}: {err}",
                    path.display()
                ));
                None
            }
        };
        item.stored_path = Some(path);
        Sink::File(file)
    } else {
        Sink::Memory(Vec::new())
    };
    OpenPart { item, sink }
}

/// Incremental multipart/form-data decoder. Reads the body through `reader`,
/// splitting on `--boundary` delimiters, and returns the decoded items in
/// part order. Malformed input stops the loop early; everything decoded up to
/// that point is still returned.
pub fn decode_multipart(
    reader: &mut dyn Read,
    boundary: &str,
    upload_dir: &Path,
    names: &mut dyn NameSource,
) -> Vec<FormItem> {
    let delimiter = format!("\r\n--{boundary}").into_bytes();
    let mut items = Vec::new();
    let mut current: Option<OpenPart> = None;

    // The CRLF before the first boundary was consumed with the request
    // headers upstream, so stuff it back in front of the stream.
    let mut buf: Vec<u8> = b"\r\n".to_vec();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let read = reader.read(&mut chunk).unwrap_or(0);
        if read == 0 && buf.is_empty() {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);

        match find_subsequence(&buf, &delimiter) {
            Some(offset) if offset > 0 && current.is_some() => {
                // Body bytes before the boundary belong to the open part.
                if let Some(part) = current.as_mut() {
                    part.append(&buf[..offset]);
                }
                buf.drain(..offset);
            }
            Some(offset) => {
                // offset > 0 with no open part: leading garbage, drop it.
                let after = offset + delimiter.len();
                if buf.len() < after + 2 {
                    if read == 0 {
                        break;
                    }
                    continue;
                }
                if let Some(part) = current.take() {
                    items.push(part.finish());
                }
                if &buf[after..after + 2] == b"--" {
                    // Closing boundary marker.
                    break;
                }
                if &buf[after..after + 2] != b"\r\n" {
                    // Malformed: a boundary must end with -- or CRLF.
                    break;
                }
                let headers_start = after + 2;
                let Some(headers_len) =
                    find_subsequence(&buf[headers_start..], b"\r\n\r\n")
                else {
                    // Header block did not fit the buffered bytes.
                    break;
                };

                let mut item = FormItem::default();
                if headers_len > 0 {
                    process_part_headers(
                        &buf[headers_start..headers_start + headers_len],
                        &mut item,
                    );
                }
                current = Some(open_part(item, upload_dir, names));
                buf.drain(..headers_start + headers_len + 4);
            }
            None => {
                if read == 0 {
                    // Stream ended without a closing boundary: hand the
                    // remainder to the open part and stop.
                    if let Some(part) = current.as_mut() {
                        part.append(&buf);
                    }
                    buf.clear();
                    break;
                }
                // Keep a delimiter-sized tail; the boundary may straddle
                // this read and the next one.
                if buf.len() > delimiter.len() {
                    let keep_from = buf.len() - delimiter.len();
                    if let Some(part) = current.as_mut() {
                        part.append(&buf[..keep_from]);
                    }
                    buf.drain(..keep_from);
                }
            }
        }
    }

    if let Some(part) = current.take() {
        items.push(part.finish());
    }
    items
}
