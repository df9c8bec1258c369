//! Plain-text fallback for HTML message bodies.
//!
//! Clients that do not render `org.matrix.custom.html` show `body` instead,
//! so it carries the same text with markup removed: tags stripped, line
//! breaks and block ends turned into newlines, link targets appended after
//! their text, and common entities decoded. Elements that never render
//! (`script`, `style`, `head`, `title`) are dropped with their contents.

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "li", "ul", "ol", "tr", "table", "blockquote", "pre", "h1", "h2", "h3", "h4",
    "h5", "h6",
];

const HIDDEN_TAGS: &[&str] = &["script", "style", "head", "title"];

/// Entities longer than this are not looked for.
const MAX_ENTITY_LEN: usize = 10;

/// Reduce an HTML fragment to readable plain text.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut link: Option<(String, usize)> = None;
    let mut rest = html;

    while let Some(start) = rest.find(['<', '&']) {
        out.push_str(&rest[..start]);
        rest = &rest[start..];

        if rest.starts_with('&') {
            let (decoded, consumed) = decode_entity(rest);
            out.push_str(&decoded);
            rest = &rest[consumed..];
            continue;
        }

        let Some(end) = rest.find('>') else {
            out.push_str(rest);
            rest = "";
            break;
        };
        let tag = Tag::parse(&rest[1..end]);
        rest = &rest[end + 1..];

        match (tag.name.as_str(), tag.closing) {
            (name, false) if HIDDEN_TAGS.contains(&name) => rest = skip_element(rest, name),
            ("br", _) => out.push('\n'),
            ("li", false) => {
                start_line(&mut out);
                out.push_str("* ");
            },
            ("a", false) => link = tag.href.map(|href| (href, out.len())),
            ("a", true) => {
                if let Some((href, text_start)) = link.take() {
                    if out[text_start..].trim() != href {
                        out.push_str(" (");
                        out.push_str(&href);
                        out.push(')');
                    }
                }
            },
            (name, _) if BLOCK_TAGS.contains(&name) => start_line(&mut out),
            _ => {},
        }
    }
    out.push_str(rest);

    tidy(&out)
}

/// The input after the closing tag of `name`; an unclosed element runs to
/// the end.
fn skip_element<'a>(rest: &'a str, name: &str) -> &'a str {
    let lower = rest.to_ascii_lowercase();
    let Some(close) = lower.find(&format!("</{name}")) else {
        return "";
    };

    match rest[close..].find('>') {
        Some(end) => &rest[close + end + 1..],
        None => "",
    }
}

fn start_line(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

struct Tag {
    name: String,
    closing: bool,
    href: Option<String>,
}

impl Tag {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim().trim_end_matches('/');
        let (closing, raw) = match raw.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        let name_end = raw.find(char::is_whitespace).unwrap_or(raw.len());
        let name = raw[..name_end].to_ascii_lowercase();
        let href = attribute(&raw[name_end..], "href");

        Self { name, closing, href }
    }
}

fn attribute(attrs: &str, name: &str) -> Option<String> {
    let lower = attrs.to_ascii_lowercase();
    let at = lower.find(&format!("{name}="))?;
    let value = &attrs[at + name.len() + 1..];

    let (quote, value) = match value.chars().next()? {
        q @ ('"' | '\'') => (Some(q), &value[1..]),
        _ => (None, value),
    };
    let end = match quote {
        Some(q) => value.find(q)?,
        None => value.find(char::is_whitespace).unwrap_or(value.len()),
    };

    Some(decode_entities(&value[..end]))
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let (decoded, consumed) = decode_entity(&rest[start..]);
        out.push_str(&decoded);
        rest = &rest[start + consumed..];
    }
    out.push_str(rest);
    out
}

/// Decode the entity at the start of `text`. Unknown entities pass through.
fn decode_entity(text: &str) -> (String, usize) {
    let Some(end) = text.bytes().take(MAX_ENTITY_LEN + 1).position(|b| b == b';') else {
        return ("&".to_string(), 1);
    };
    let entity = &text[1..end];

    let decoded = match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => entity.strip_prefix('#').and_then(|code| {
            let value = match code.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => code.parse().ok(),
            };
            value.and_then(char::from_u32)
        }),
    };

    match decoded {
        Some(c) => (c.to_string(), end + 1),
        None => ("&".to_string(), 1),
    }
}

/// Trim trailing spaces per line and collapse runs of blank lines.
fn tidy(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut blank = false;

    for line in text.lines().map(str::trim_end) {
        if line.is_empty() {
            if !blank && !lines.is_empty() {
                lines.push(line);
            }
            blank = true;
        } else {
            lines.push(line);
            blank = false;
        }
    }

    lines.join("\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(html_to_text("hello world"), "hello world");
    }

    #[test]
    fn tags_are_stripped() {
        assert_eq!(html_to_text("<b>build</b> <i>passed</i>"), "build passed");
    }

    #[test]
    fn line_breaks_and_blocks_become_newlines() {
        assert_eq!(html_to_text("one<br>two<br/>three"), "one\ntwo\nthree");
        assert_eq!(html_to_text("<p>first</p><p>second</p>"), "first\nsecond");
    }

    #[test]
    fn list_items_get_bullets() {
        assert_eq!(html_to_text("<ul><li>a</li><li>b</li></ul>"), "* a\n* b");
    }

    #[test]
    fn entities_are_decoded() {
        assert_eq!(html_to_text("a &lt;b&gt; &amp; &#39;c&#x27;"), "a <b> & 'c'");
        assert_eq!(html_to_text("AT&T"), "AT&T");
    }

    #[test]
    fn link_target_follows_text() {
        assert_eq!(
            html_to_text(r#"see <a href="https://ci.example/42">build 42</a>"#),
            "see build 42 (https://ci.example/42)"
        );
        assert_eq!(
            html_to_text(r#"<a href="https://x.org">https://x.org</a>"#),
            "https://x.org"
        );
    }

    #[test]
    fn hidden_elements_are_dropped_with_their_contents() {
        assert_eq!(
            html_to_text("<style>p{color:red}</style><script>alert(1)</script>hi"),
            "hi"
        );
        assert_eq!(
            html_to_text("<head><title>Report</title></head><p>body</p>"),
            "body"
        );
        assert_eq!(html_to_text("a<SCRIPT type=\"x\">b</Script >c"), "ac");
        assert_eq!(html_to_text("a<script>never closed"), "a");
    }

    #[test]
    fn ampersand_heavy_input_stays_intact() {
        let input = format!("{};", "&".repeat(5000));
        assert_eq!(html_to_text(&input), input);
    }

    #[test]
    fn blank_lines_collapse() {
        assert_eq!(html_to_text("a<br><br><br><br>b"), "a\n\nb");
    }
}
