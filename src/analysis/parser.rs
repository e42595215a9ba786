//! Incremental parsing of tag-delimited model responses.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";
pub const SCRIPT_OPEN: &str = "<script>";
pub const SCRIPT_CLOSE: &str = "</script>";
pub const REPORT_OPEN: &str = "<report>";
pub const REPORT_CLOSE: &str = "</report>";

pub const PROGRESS_TAIL_CHARS: usize = 20;

static REASONING_SPAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());
static REPORT_SPAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<report>(.*?)</report>").unwrap());

/// Remove every closed reasoning span. An unclosed `<think>` is left alone.
pub fn strip_reasoning(text: &str) -> Cow<'_, str> {
    REASONING_SPAN.replace_all(text, "")
}

/// Script text between the first script markers outside reasoning spans.
/// A missing close marker takes the rest of the text.
pub fn extract_script(text: &str) -> Option<String> {
    let stripped = strip_reasoning(text);
    let (_, after) = stripped.split_once(SCRIPT_OPEN)?;
    let script = after.split_once(SCRIPT_CLOSE).map_or(after, |(script, _)| script);
    Some(script.to_string())
}

/// Replace the first script span of `text` with `script`.
pub fn splice_script(text: &str, script: &str) -> String {
    let (Some(open), Some(close)) = (text.find(SCRIPT_OPEN), text.find(SCRIPT_CLOSE)) else {
        return text.to_string();
    };
    if close < open {
        return text.to_string();
    }
    format!(
        "{}{SCRIPT_OPEN}{script}{SCRIPT_CLOSE}{}",
        &text[..open],
        &text[close + SCRIPT_CLOSE.len()..]
    )
}

/// Body of the first report span, or the whole text when there is none.
pub fn report_span(text: &str) -> &str {
    REPORT_SPAN
        .captures(text)
        .and_then(|c| c.get(1))
        .map_or(text, |m| m.as_str())
}

/// Last `n` characters of `text`.
pub fn tail(text: &str, n: usize) -> &str {
    let skip = text.chars().count().saturating_sub(n);
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    Progress(String),
    /// Both script markers have arrived; carries the extracted script.
    ScriptReady(String),
    /// The report marker has arrived without its close marker.
    ReportOpened,
}

/// Accumulates streamed chunks and reports structural milestones.
#[derive(Debug, Default)]
pub struct ResponseStreamParser {
    buffer: String,
    script_dispatched: bool,
    report_opened: bool,
}

impl ResponseStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_buffer(self) -> String {
        self.buffer
    }

    pub fn script_dispatched(&self) -> bool {
        self.script_dispatched
    }

    /// True while a report span is open and not yet closed.
    pub fn in_report(&self) -> bool {
        self.buffer.contains(REPORT_OPEN) && !self.buffer.contains(REPORT_CLOSE)
    }

    /// The partial report text while the report span is still open.
    pub fn provisional_report(&self) -> Option<String> {
        if !self.in_report() {
            return None;
        }
        let stripped = strip_reasoning(&self.buffer);
        stripped
            .split_once(REPORT_OPEN)
            .map(|(_, after)| after.to_string())
    }

    pub fn push(&mut self, chunk: &str) -> Vec<ParserEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        let script_open = self.buffer.contains(SCRIPT_OPEN);
        let script_closed = self.buffer.contains(SCRIPT_CLOSE);

        if self.in_report() {
            events.push(ParserEvent::Progress("Generating report...".to_string()));
        } else if script_open && !script_closed {
            events.push(ParserEvent::Progress("Executing script...".to_string()));
        } else if !script_open {
            events.push(ParserEvent::Progress(format!(
                "Thinking... {}",
                tail(&self.buffer, PROGRESS_TAIL_CHARS)
            )));
        }

        if !self.script_dispatched && script_closed {
            if let Some(script) = extract_script(&self.buffer) {
                self.script_dispatched = true;
                events.push(ParserEvent::ScriptReady(script));
            }
        }

        if !self.report_opened && self.in_report() {
            self.report_opened = true;
            events.push(ParserEvent::ReportOpened);
        }

        events
    }
}
