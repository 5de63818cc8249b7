//! Progress-bubble text formatting (spec.md §4.5 "Formatted progress bubble").

use crate::markdown::{convert_markdown_to_html, truncate_preserving_tags};
use crate::state::StreamingState;

/// Roughly the surface's single-message length limit (Telegram's is 4096).
const SURFACE_MESSAGE_LIMIT: usize = 4000;
const PREVIEW_TAIL_CHARS: usize = 400;

fn status_word(state: &StreamingState) -> &'static str {
    if state.error.is_some() {
        "Done"
    } else if state.is_processing {
        "Working"
    } else {
        "Thinking"
    }
}

fn elapsed_label(state: &StreamingState) -> String {
    let secs = state.started_at.elapsed().as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

fn tokens_label(state: &StreamingState) -> String {
    format!("{}↑ {}↓", state.tokens.input, state.tokens.output)
}

fn status_line(state: &StreamingState) -> String {
    format!(
        "{} • {} • {}",
        status_word(state),
        elapsed_label(state),
        tokens_label(state)
    )
}

fn tools_checklist(state: &StreamingState) -> String {
    state
        .tools
        .iter()
        .map(|t| {
            let mark = if t.completed_at.is_some() { "✅" } else { "⏳" };
            let label = t.title.as_deref().unwrap_or(&t.name);
            format!("{mark} {label}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Non-streaming mode: status line, tools checklist, trailing `Response:` preview of the
/// last N characters of running text (spec.md §4.5).
pub fn format_progress_bubble(state: &StreamingState) -> String {
    let mut parts = vec![status_line(state)];
    let checklist = tools_checklist(state);
    if !checklist.is_empty() {
        parts.push(checklist);
    }
    if !state.current_text.is_empty() {
        let tail: String = tail_chars(&state.current_text, PREVIEW_TAIL_CHARS);
        parts.push(format!("Response:\n{}", convert_markdown_to_html(&tail)));
    }
    let joined = parts.join("\n\n");
    truncate_preserving_tags(&joined, SURFACE_MESSAGE_LIMIT)
}

/// Streaming mode: compact status line followed by the full text, tail-truncated to the
/// surface's message length limit (spec.md §4.5).
pub fn format_streaming_update(state: &StreamingState) -> String {
    let status = status_line(state);
    let body = convert_markdown_to_html(&state.current_text);
    let joined = format!("{status}\n\n{body}");
    truncate_preserving_tags(&joined, SURFACE_MESSAGE_LIMIT)
}

/// The final, formatted reply posted (or edited in) on `session.idle`.
pub fn format_final_text(state: &StreamingState) -> String {
    truncate_preserving_tags(&convert_markdown_to_html(&state.current_text), SURFACE_MESSAGE_LIMIT)
}

fn tail_chars(text: &str, n: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= n {
        text.to_string()
    } else {
        chars[chars.len() - n..].iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_bubble_includes_status_and_preview() {
        let mut state = StreamingState::new("s1");
        state.is_processing = true;
        state.current_text = "hello world".into();
        let bubble = format_progress_bubble(&state);
        assert!(bubble.contains("Working"));
        assert!(bubble.contains("Response:"));
        assert!(bubble.contains("hello world"));
    }

    #[test]
    fn tools_checklist_marks_running_vs_completed() {
        let mut state = StreamingState::new("s1");
        state.tools.push(crate::state::ToolCall {
            name: "bash".into(),
            call_id: "c1".into(),
            started_at: 0,
            completed_at: None,
            title: Some("Running ls".into()),
        });
        let bubble = format_progress_bubble(&state);
        assert!(bubble.contains("⏳ Running ls"));
    }

    #[test]
    fn streaming_update_truncates_to_surface_limit() {
        let mut state = StreamingState::new("s1");
        state.current_text = "x".repeat(10_000);
        let update = format_streaming_update(&state);
        assert!(update.chars().count() <= SURFACE_MESSAGE_LIMIT);
    }
}
