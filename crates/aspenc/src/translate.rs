/// Byte sink fed by the translator callbacks. The pipeline appends whatever
/// arrives here to its output buffer without interpreting it.
pub type Sink<'a> = dyn FnMut(&[u8]) + 'a;

/// Template-to-script translation, driven as prolog, body chunks, epilog.
pub trait TemplateTranslator {
    fn emit_prolog(&mut self, sink: &mut Sink<'_>);
    fn parse_source(&mut self, source: &[u8], sink: &mut Sink<'_>);
    fn emit_epilog(&mut self, sink: &mut Sink<'_>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkKind {
    Literal,
    Code,
    Expression,
}

/// Default translator: literal markup becomes `asp.write(..)` calls,
/// `<% .. %>` spans pass through as Lua statements, `<%= .. %>` spans render
/// through `tostring`. Each template line maps to one generated line so chunk
/// line numbers stay meaningful in runtime errors.
#[derive(Default)]
pub struct LuaTranslator;

impl LuaTranslator {
    pub fn new() -> Self {
        Self
    }

    fn emit_chunk(&self, kind: ChunkKind, text: &[u8], sink: &mut Sink<'_>) {
        match kind {
            ChunkKind::Literal => {
                if text.is_empty() {
                    return;
                }
                sink(b"asp.write(\"");
                let mut quoted = Vec::with_capacity(text.len() + 2);
                for &byte in text {
                    match byte {
                        b'"' => quoted.extend_from_slice(b"\\\""),
                        b'\\' => quoted.extend_from_slice(b"\\\\"),
                        b'\r' => quoted.extend_from_slice(b"\\r"),
                        b'\n' => quoted.extend_from_slice(b"\\n"),
                        b'\t' => quoted.extend_from_slice(b"\\t"),
                        0x20..=0x7e => quoted.push(byte),
                        other => quoted.extend_from_slice(format!("\\{other}").as_bytes()),
                    }
                }
                sink(&quoted);
                sink(b"\")");
            }
            ChunkKind::Code => sink(text),
            ChunkKind::Expression => {
                sink(b"asp.write(tostring(");
                sink(text);
                sink(b"))");
            }
        }
    }

    fn emit_line_breaks(&self, text: &[u8], sink: &mut Sink<'_>) {
        for &byte in text {
            if byte == b'\n' {
                sink(b"\n");
            }
        }
    }
}

impl TemplateTranslator for LuaTranslator {
    fn emit_prolog(&mut self, sink: &mut Sink<'_>) {
        sink(b"local asp = asp ");
    }

    fn parse_source(&mut self, source: &[u8], sink: &mut Sink<'_>) {
        let mut rest = source;
        loop {
            let Some(open) = aspen_rt::strings::find_subsequence(rest, b"<%") else {
                self.emit_chunk(ChunkKind::Literal, rest, sink);
                self.emit_line_breaks(rest, sink);
                return;
            };
            let literal = &rest[..open];
            self.emit_chunk(ChunkKind::Literal, literal, sink);
            self.emit_line_breaks(literal, sink);
            sink(b" ");

            let mut span = &rest[open + 2..];
            let kind = if span.first() == Some(&b'=') {
                span = &span[1..];
                ChunkKind::Expression
            } else {
                ChunkKind::Code
            };

            let Some(close) = aspen_rt::strings::find_subsequence(span, b"%>") else {
                // Unterminated tag: treat the remainder as the span body.
                self.emit_chunk(kind, span, sink);
                return;
            };
            let body = &span[..close];
            self.emit_chunk(kind, body, sink);
            sink(b" ");
            rest = &span[close + 2..];
        }
    }

    fn emit_epilog(&mut self, sink: &mut Sink<'_>) {
        sink(b"\n");
    }
}

#[cfg(test)]
mod tests {
    use super::{LuaTranslator, TemplateTranslator};

    fn translate(source: &[u8]) -> String {
        let mut translator = LuaTranslator::new();
        let mut out = Vec::new();
        let mut sink = |bytes: &[u8]| out.extend_from_slice(bytes);
        translator.emit_prolog(&mut sink);
        translator.parse_source(source, &mut sink);
        translator.emit_epilog(&mut sink);
        String::from_utf8(out).expect("generated chunk is not utf-8")
    }

    #[test]
    fn literal_markup_becomes_write_calls() {
        let chunk = translate(b"<p>hi</p>");
        assert!(chunk.contains("asp.write(\"<p>hi</p>\")"));
    }

    #[test]
    fn expression_spans_render_through_tostring() {
        let chunk = translate(b"<%= 1 + 2 %>");
        assert!(chunk.contains("asp.write(tostring( 1 + 2 ))"));
    }

    #[test]
    fn code_spans_pass_through() {
        let chunk = translate(b"<% local x = 1 %><%= x %>");
        assert!(chunk.contains("local x = 1"));
        assert!(chunk.contains("asp.write(tostring( x ))"));
    }

    #[test]
    fn quotes_and_newlines_are_escaped() {
        let chunk = translate(b"a\"b\r\nc");
        assert!(chunk.contains("asp.write(\"a\\\"b\\r\\nc\")"));
    }

    #[test]
    fn generated_lines_track_template_lines() {
        let chunk = translate(b"one\ntwo\n<% local x = 1\nlocal y = 2 %>\n");
        assert_eq!(chunk.matches('\n').count(), 5);
    }
}
