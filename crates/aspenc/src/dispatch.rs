use std::io::Read;
use std::path::Path;

use aspen_rt::strings::{tokenize, unquote};

use crate::context::{RequestAdapter, ResponseAdapter};
use crate::multipart::{self, FormItem, NameSource};

pub struct ContentType {
    pub media_type: String,
    pub boundary: Option<String>,
}

/// Parses a Content-Type header value into the media type and an optional
/// boundary parameter. Assumes surrounding whitespace and the trailing CRLF
/// were already stripped.
pub fn parse_content_type_header(value: &str) -> Option<ContentType> {
    let tokens = tokenize(value, "; ");
    let media_type = tokens.first()?.to_string();
    let mut boundary = None;
    for token in &tokens[1..] {
        let pair = tokenize(token, "=");
        if pair.len() == 2 && pair[0] == "boundary" {
            boundary = Some(unquote(pair[1]).to_string());
            break;
        }
    }
    Some(ContentType {
        media_type,
        boundary,
    })
}

/// Inspects the request's Content-Type and decodes the body accordingly.
/// Requests without a Content-Type carry no body semantics and decode to
/// nothing.
pub fn process_post_request(
    request: &dyn RequestAdapter,
    body: &mut dyn Read,
    response: &dyn ResponseAdapter,
    upload_dir: &Path,
    names: &mut dyn NameSource,
) -> Vec<FormItem> {
    let Some(header) = request.header("Content-Type") else {
        return Vec::new();
    };
    let Some(content_type) = parse_content_type_header(&header) else {
        return Vec::new();
    };
    match content_type.media_type.as_str() {
        "multipart/form-data" => {
            let boundary = content_type.boundary.unwrap_or_default();
            multipart::decode_multipart(body, &boundary, upload_dir, names)
        }
        "application/x-www-form-urlencoded" => {
            // TODO: decode urlencoded pairs into form items.
            Vec::new()
        }
        _ => {
            response.respond_415(&header);
            Vec::new()
        }
    }
}
