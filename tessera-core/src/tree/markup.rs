//! Markup Parsing and Escaping
//!
//! A tolerant parser for the HTML subset the engine renders: elements with
//! quoted, unquoted or bare attributes, void elements, self-closing syntax,
//! comments, `<!...>` declarations, raw text inside `script`/`style`, and
//! the basic character references. Unclosed elements are closed at the end
//! of input; stray end tags are ignored.

use indexmap::IndexMap;

use crate::error::{EngineError, Result};

/// Elements that never have children or an end tag.
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

/// A parsed markup node, before it is placed in an arena.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Markup {
    Element {
        tag: String,
        attributes: IndexMap<String, String>,
        children: Vec<Markup>,
    },
    Text(String),
    Comment(String),
    Declaration(String),
}

/// Whether `tag` is a void element.
pub fn is_void(tag: &str) -> bool {
    VOID_ELEMENTS.contains(&tag)
}

struct OpenElement {
    tag: String,
    attributes: IndexMap<String, String>,
    children: Vec<Markup>,
}

impl OpenElement {
    fn close(self) -> Markup {
        Markup::Element {
            tag: self.tag,
            attributes: self.attributes,
            children: self.children,
        }
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    stack: Vec<OpenElement>,
    top: Vec<Markup>,
}

/// Parse a markup fragment into a list of top-level nodes.
pub(crate) fn parse(input: &str) -> Result<Vec<Markup>> {
    Parser {
        input,
        pos: 0,
        stack: Vec::new(),
        top: Vec::new(),
    }
    .run()
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn error(&self, cause: impl Into<String>) -> EngineError {
        EngineError::Markup {
            offset: self.pos,
            cause: cause.into(),
        }
    }

    fn push(&mut self, node: Markup) {
        match self.stack.last_mut() {
            Some(open) => open.children.push(node),
            None => self.top.push(node),
        }
    }

    fn run(mut self) -> Result<Vec<Markup>> {
        while self.pos < self.input.len() {
            let rest = self.rest();
            if rest.starts_with("<!--") {
                self.comment()?;
            } else if rest.starts_with("</") {
                self.end_tag()?;
            } else if rest.starts_with("<!") {
                self.declaration()?;
            } else if rest.starts_with('<')
                && rest[1..].starts_with(|c: char| c.is_ascii_alphabetic())
            {
                self.start_tag()?;
            } else {
                self.text();
            }
        }

        while let Some(open) = self.stack.pop() {
            let node = open.close();
            self.push(node);
        }
        Ok(self.top)
    }

    fn text(&mut self) {
        let rest = self.rest();
        // A '<' that does not open a tag is literal text.
        let skip = usize::from(rest.starts_with('<'));
        let len = rest[skip..].find('<').map(|i| i + skip).unwrap_or(rest.len());
        let raw = &rest[..len];
        self.pos += len;
        self.push(Markup::Text(decode_entities(raw)));
    }

    fn comment(&mut self) -> Result<()> {
        let body_start = self.pos + 4;
        let end = self.input[body_start..]
            .find("-->")
            .ok_or_else(|| self.error("unterminated comment"))?;
        let body = self.input[body_start..body_start + end].to_string();
        self.pos = body_start + end + 3;
        self.push(Markup::Comment(body));
        Ok(())
    }

    fn declaration(&mut self) -> Result<()> {
        let end = self
            .rest()
            .find('>')
            .ok_or_else(|| self.error("unterminated declaration"))?;
        let body = self.input[self.pos + 2..self.pos + end].to_string();
        self.pos += end + 1;
        self.push(Markup::Declaration(body));
        Ok(())
    }

    fn end_tag(&mut self) -> Result<()> {
        let end = self
            .rest()
            .find('>')
            .ok_or_else(|| self.error("unterminated end tag"))?;
        let tag = self.input[self.pos + 2..self.pos + end]
            .trim()
            .to_ascii_lowercase();
        self.pos += end + 1;

        if let Some(depth) = self.stack.iter().rposition(|open| open.tag == tag) {
            while self.stack.len() > depth {
                if let Some(open) = self.stack.pop() {
                    let node = open.close();
                    self.push(node);
                }
            }
        }
        Ok(())
    }

    fn name(&mut self, stop: impl Fn(char) -> bool) -> &'a str {
        let rest = self.rest();
        let len = rest.find(|c: char| stop(c)).unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn start_tag(&mut self) -> Result<()> {
        self.pos += 1;
        let tag = self
            .name(|c| c.is_whitespace() || c == '>' || c == '/')
            .to_ascii_lowercase();
        let mut attributes = IndexMap::new();

        let self_closing = loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.is_empty() {
                return Err(self.error(format!("unterminated start tag <{}>", tag)));
            }
            if rest.starts_with("/>") {
                self.pos += 2;
                break true;
            }
            if rest.starts_with('>') {
                self.pos += 1;
                break false;
            }
            if rest.starts_with('/') {
                self.pos += 1;
                continue;
            }

            let name = self
                .name(|c| c.is_whitespace() || c == '=' || c == '>' || c == '/')
                .to_string();
            self.skip_whitespace();
            let value = if self.rest().starts_with('=') {
                self.pos += 1;
                self.skip_whitespace();
                self.attribute_value()?
            } else {
                String::new()
            };
            attributes.entry(name).or_insert(value);
        };

        if self_closing || is_void(&tag) {
            self.push(Markup::Element {
                tag,
                attributes,
                children: Vec::new(),
            });
        } else if RAW_TEXT_ELEMENTS.contains(&tag.as_str()) {
            let close = format!("</{}", tag);
            let rest = self.rest();
            let len = rest
                .to_ascii_lowercase()
                .find(&close)
                .unwrap_or(rest.len());
            let children = if len > 0 {
                vec![Markup::Text(rest[..len].to_string())]
            } else {
                Vec::new()
            };
            self.pos += len;
            if let Some(end) = self.rest().find('>') {
                self.pos += end + 1;
            }
            self.push(Markup::Element {
                tag,
                attributes,
                children,
            });
        } else {
            self.stack.push(OpenElement {
                tag,
                attributes,
                children: Vec::new(),
            });
        }
        Ok(())
    }

    fn attribute_value(&mut self) -> Result<String> {
        let rest = self.rest();
        match rest.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let end = rest[1..]
                    .find(quote)
                    .ok_or_else(|| self.error("unterminated attribute value"))?;
                let raw = &rest[1..1 + end];
                self.pos += end + 2;
                Ok(decode_entities(raw))
            }
            _ => {
                let raw = self.name(|c| c.is_whitespace() || c == '>');
                Ok(decode_entities(raw))
            }
        }
    }
}

/// Decode the character references the serializer produces, plus numeric
/// references. Unknown references are kept verbatim.
pub fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').and_then(|semi| {
            let name = &rest[1..semi];
            let ch = match name {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" | "#39" => Some('\''),
                _ if name.starts_with("#x") || name.starts_with("#X") => {
                    u32::from_str_radix(&name[2..], 16).ok().and_then(char::from_u32)
                }
                _ if name.starts_with('#') => name[1..].parse().ok().and_then(char::from_u32),
                _ => None,
            };
            ch.map(|c| (c, semi))
        });
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escape text content.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape a double-quoted attribute value.
pub fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}
