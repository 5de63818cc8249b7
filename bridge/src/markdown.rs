//! Markdown → chat-surface rich text (HTML parse-mode), spec.md §4.5, §8 "Markdown round-trips".
//!
//! Code-fence content is escaped but never otherwise transformed; everything outside a
//! fence goes through inline-emphasis conversion after its own HTML-metacharacter escape.

/// Converts `&`, `<`, `>` to entities. Applied to every run of plain text, inside and
/// outside code, before any markup is introduced.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Splits `source` into alternating non-code / fenced-code segments on ``` delimiters,
/// converts non-code segments with [`convert_inline`], and wraps code segments in `<pre>`
/// (with an optional `<code class="language-x">`) after escaping their content verbatim.
pub fn convert_markdown_to_html(source: &str) -> String {
    let mut out = String::new();
    let mut rest = source;
    loop {
        match rest.find("```") {
            None => {
                out.push_str(&convert_inline(rest));
                break;
            }
            Some(start) => {
                out.push_str(&convert_inline(&rest[..start]));
                let after_open = &rest[start + 3..];
                let lang_end = after_open.find('\n').unwrap_or(0);
                let lang = after_open[..lang_end].trim();
                let body_start = lang_end.min(after_open.len());
                let body_and_rest = &after_open[body_start..];
                match body_and_rest.find("```") {
                    Some(close) => {
                        let code = body_and_rest[..close].trim_matches('\n');
                        out.push_str(&render_code_block(code, lang));
                        rest = &body_and_rest[close + 3..];
                    }
                    None => {
                        // Unterminated fence: treat the rest of the input as code.
                        let code = body_and_rest.trim_matches('\n');
                        out.push_str(&render_code_block(code, lang));
                        rest = "";
                    }
                }
            }
        }
        if rest.is_empty() {
            break;
        }
    }
    out
}

fn render_code_block(code: &str, lang: &str) -> String {
    let escaped = escape_html(code);
    if lang.is_empty() {
        format!("<pre><code>{escaped}</code></pre>")
    } else {
        format!("<pre><code class=\"language-{lang}\">{escaped}</code></pre>")
    }
}

/// Converts inline emphasis in a non-code segment: inline code, bold, italic,
/// strikethrough, links, headings (collapsed to bold), blockquotes. The segment is
/// HTML-escaped first so user text containing `<`/`>`/`&` can't inject markup.
fn convert_inline(segment: &str) -> String {
    let mut lines_out = Vec::new();
    for line in segment.split('\n') {
        lines_out.push(convert_line(line));
    }
    lines_out.join("\n")
}

fn convert_line(line: &str) -> String {
    if let Some(heading) = line.strip_prefix("### ").or_else(|| line.strip_prefix("## ")).or_else(|| line.strip_prefix("# ")) {
        return format!("<b>{}</b>", convert_spans(heading));
    }
    if let Some(quote) = line.strip_prefix("> ") {
        return format!("<blockquote>{}</blockquote>", convert_spans(quote));
    }
    convert_spans(line)
}

/// Inline code first (its content must not itself be re-escaped or re-emphasized), then
/// emphasis, then links, over HTML-escaped plain text.
fn convert_spans(text: &str) -> String {
    let mut out = String::new();
    let mut chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '`' {
            if let Some(end) = find_closing(&chars, i + 1, '`', 1) {
                let code: String = chars[i + 1..end].iter().collect();
                out.push_str(&format!("<code>{}</code>", escape_html(&code)));
                i = end + 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    let escaped = escape_html_preserving_code_tags(&out);
    apply_emphasis(&escaped)
}

/// `convert_spans` builds `out` with literal `<code>...</code>` tags already inserted
/// alongside raw (unescaped) plain-text characters; this escapes only the plain-text runs.
fn escape_html_preserving_code_tags(marked: &str) -> String {
    let mut result = String::new();
    let mut rest = marked;
    loop {
        match rest.find("<code>") {
            None => {
                result.push_str(&escape_html(rest));
                break;
            }
            Some(start) => {
                result.push_str(&escape_html(&rest[..start]));
                match rest[start..].find("</code>") {
                    Some(end_rel) => {
                        let end = start + end_rel + "</code>".len();
                        result.push_str(&rest[start..end]);
                        rest = &rest[end..];
                    }
                    None => {
                        result.push_str(&escape_html(&rest[start..]));
                        break;
                    }
                }
            }
        }
    }
    result
}

fn find_closing(chars: &[char], from: usize, delim: char, run: usize) -> Option<usize> {
    let mut i = from;
    while i + run <= chars.len() {
        if chars[i..i + run].iter().all(|&c| c == delim) {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn apply_emphasis(text: &str) -> String {
    let text = convert_delim(text, "**", "<b>", "</b>");
    let text = convert_delim(&text, "__", "<b>", "</b>");
    let text = convert_delim(&text, "~~", "<s>", "</s>");
    let text = convert_word_bounded(&text, '*', "<i>", "</i>");
    let text = convert_word_bounded(&text, '_', "<i>", "</i>");
    convert_links(&text)
}

fn convert_delim(text: &str, delim: &str, open_tag: &str, close_tag: &str) -> String {
    let mut out = String::new();
    let mut rest = text;
    loop {
        match rest.find(delim) {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => match rest[start + delim.len()..].find(delim) {
                Some(end_rel) => {
                    out.push_str(&rest[..start]);
                    out.push_str(open_tag);
                    out.push_str(&rest[start + delim.len()..start + delim.len() + end_rel]);
                    out.push_str(close_tag);
                    rest = &rest[start + delim.len() + end_rel + delim.len()..];
                }
                None => {
                    out.push_str(rest);
                    break;
                }
            },
        }
    }
    out
}

/// Single `*`/`_` emphasis, guarded so it doesn't fire inside a word (e.g. `a*b*c`) and
/// requires non-whitespace immediately inside the delimiters.
fn convert_word_bounded(text: &str, delim: char, open_tag: &str, close_tag: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == delim
            && i + 1 < chars.len()
            && !chars[i + 1].is_whitespace()
            && (i == 0 || !chars[i - 1].is_alphanumeric())
        {
            if let Some(end) = find_closing(&chars, i + 1, delim, 1) {
                if end > i + 1 && !chars[end - 1].is_whitespace() {
                    out.push_str(open_tag);
                    out.push_str(&chars[i + 1..end].iter().collect::<String>());
                    out.push_str(close_tag);
                    i = end + 1;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn convert_links(text: &str) -> String {
    let mut out = String::new();
    let mut rest = text;
    loop {
        match rest.find('[') {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                let Some(close_bracket) = rest[start..].find(']') else {
                    out.push_str(rest);
                    break;
                };
                let close_bracket = start + close_bracket;
                if rest.as_bytes().get(close_bracket + 1) != Some(&b'(') {
                    out.push_str(&rest[..=close_bracket]);
                    rest = &rest[close_bracket + 1..];
                    continue;
                }
                let Some(close_paren_rel) = rest[close_bracket + 2..].find(')') else {
                    out.push_str(&rest[..=close_bracket]);
                    rest = &rest[close_bracket + 1..];
                    continue;
                };
                let close_paren = close_bracket + 2 + close_paren_rel;
                let label = &rest[start + 1..close_bracket];
                let url = &rest[close_bracket + 2..close_paren];
                out.push_str(&rest[..start]);
                out.push_str(&format!("<a href=\"{url}\">{label}</a>"));
                rest = &rest[close_paren + 1..];
            }
        }
    }
    out
}

/// Cuts `html` to at most `max_len` characters, never inside a tag, and closes any tags
/// still open at the cut (spec.md §4.5, §8).
pub fn truncate_preserving_tags(html: &str, max_len: usize) -> String {
    if html.chars().count() <= max_len {
        return html.to_string();
    }
    let chars: Vec<char> = html.chars().collect();
    let mut cut = max_len.min(chars.len());
    // Never cut inside a tag: if we land inside `<...>`, back up to before the `<`.
    if let Some(open) = chars[..cut].iter().rposition(|&c| c == '<') {
        if chars[open..cut].iter().all(|&c| c != '>') {
            cut = open;
        }
    }
    let mut out: String = chars[..cut].iter().collect();
    let mut open_tags = Vec::new();
    let mut scan = out.as_str();
    while let Some(lt) = scan.find('<') {
        let Some(gt) = scan[lt..].find('>') else { break };
        let tag = &scan[lt + 1..lt + gt];
        if let Some(name) = tag.strip_prefix('/') {
            if open_tags.last().map(String::as_str) == Some(name) {
                open_tags.pop();
            }
        } else {
            let name = tag.split_whitespace().next().unwrap_or(tag);
            open_tags.push(name.to_string());
        }
        scan = &scan[lt + gt + 1..];
    }
    for tag in open_tags.into_iter().rev() {
        out.push_str(&format!("</{tag}>"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_fence_preserves_special_characters_verbatim() {
        let md = "before\n```\nif a < b && c > \"d\"\n```\nafter";
        let html = convert_markdown_to_html(md);
        assert!(html.contains("<pre><code>if a &lt; b &amp;&amp; c &gt; \"d\"</code></pre>"));
    }

    #[test]
    fn bold_and_italic_convert() {
        let html = convert_markdown_to_html("**bold** and *italic* and _also italic_");
        assert!(html.contains("<b>bold</b>"));
        assert!(html.contains("<i>italic</i>"));
        assert!(html.contains("<i>also italic</i>"));
    }

    #[test]
    fn strikethrough_and_inline_code_convert() {
        let html = convert_markdown_to_html("~~gone~~ and `code`");
        assert!(html.contains("<s>gone</s>"));
        assert!(html.contains("<code>code</code>"));
    }

    #[test]
    fn links_convert_to_anchor_tags() {
        let html = convert_markdown_to_html("[rust](https://rust-lang.org)");
        assert_eq!(html, "<a href=\"https://rust-lang.org\">rust</a>");
    }

    #[test]
    fn headings_collapse_to_bold() {
        let html = convert_markdown_to_html("# Title\nbody");
        assert!(html.starts_with("<b>Title</b>"));
    }

    #[test]
    fn blockquote_wraps_line() {
        let html = convert_markdown_to_html("> quoted");
        assert_eq!(html, "<blockquote>quoted</blockquote>");
    }

    #[test]
    fn plain_text_emphasis_guard_skips_mid_word_asterisks() {
        let html = convert_markdown_to_html("a*b*c 5*6=30");
        assert!(!html.contains("<i>"));
    }

    #[test]
    fn truncate_closes_open_tags_at_the_cut() {
        let html = "<b>hello world this keeps going</b>";
        let truncated = truncate_preserving_tags(html, 10);
        assert!(truncated.ends_with("</b>"));
        assert!(truncated.starts_with("<b>"));
    }

    #[test]
    fn truncate_is_noop_when_under_the_limit() {
        let html = "<b>short</b>";
        assert_eq!(truncate_preserving_tags(html, 100), html);
    }
}
