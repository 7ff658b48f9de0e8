//! Plain-text extraction from HTML markup.
//!
//! This is a readability pass, not a parser: script, style and head content
//! is dropped, remaining tags are stripped, common entities are decoded, and
//! whitespace collapses to single spaces. Block-level tags become word
//! boundaries; inline tags vanish without one.

/// Elements whose text content is never user-visible.
const SKIPPED_ELEMENTS: [&str; 4] = ["script", "style", "head", "noscript"];

/// Tags that separate words when stripped. Everything else (b, i, em, span,
/// a, ...) is inline and joins its surrounding text.
const BLOCK_TAGS: [&str; 25] = [
    "html", "body", "h1", "h2", "h3", "h4", "h5", "h6", "p", "div", "br", "li", "ul", "ol",
    "table", "tr", "td", "th", "section", "article", "header", "footer", "nav", "blockquote",
    "pre",
];

pub fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 4);
    let mut chars = html.char_indices().peekable();
    let mut skip_until: Option<&str> = None;

    while let Some((index, ch)) = chars.next() {
        if ch != '<' {
            if skip_until.is_none() {
                out.push(ch);
            }
            continue;
        }

        let rest = &html[index..];
        if let Some(element) = skip_until {
            // Inside a skipped element; only its closing tag matters.
            let closing = format!("</{element}");
            if starts_with_ignore_case(rest, &closing) {
                skip_until = None;
            }
            advance_past_tag(&mut chars);
            continue;
        }

        for element in SKIPPED_ELEMENTS {
            let opening = format!("<{element}");
            if starts_with_ignore_case(rest, &opening)
                && rest[opening.len()..]
                    .chars()
                    .next()
                    .is_some_and(|next| next == '>' || next.is_whitespace() || next == '/')
            {
                skip_until = Some(element);
                break;
            }
        }
        if is_block_tag(tag_name(rest)) {
            out.push(' ');
        }
        advance_past_tag(&mut chars);
    }

    collapse_whitespace(&decode_entities(&out))
}

/// ASCII-case-insensitive prefix test that stays byte-wise, so a multibyte
/// character straddling the prefix length cannot panic the slice.
fn starts_with_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .as_bytes()
        .get(..needle.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Name of the tag starting at `rest` (which begins with `<`), without a
/// leading `/`. Empty for anything that is not an ASCII element name.
fn tag_name(rest: &str) -> &str {
    let inner = rest[1..].strip_prefix('/').unwrap_or(&rest[1..]);
    let end = inner
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(inner.len());
    &inner[..end]
}

fn is_block_tag(name: &str) -> bool {
    !name.is_empty()
        && BLOCK_TAGS
            .iter()
            .any(|block| block.eq_ignore_ascii_case(name))
}

fn advance_past_tag(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) {
    for (_, ch) in chars.by_ref() {
        if ch == '>' {
            break;
        }
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(ch);
        }
    }
    out
}
