//! Email template rendering
//!
//! A template is free text with an optional `{SUBJECT: ...}` line. The
//! subject is everything between the marker and the last `}` on that line;
//! the line and any whitespace following it are dropped from the body.

use tenrol_config::SUBJECT_MARKER;
use tenrol_host_api::RenderedEmail;

/// Values available to a template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderContext {
    /// First name of the assigning user
    pub teacher: String,
    pub student_first: String,
    pub student_last: String,
    pub student_full: String,
    /// Course full name
    pub course: String,
    /// Unix seconds
    pub time_end: i64,
    /// Unix seconds
    pub now: i64,
}

impl RenderContext {
    fn placeholders(&self) -> [(&'static str, String); 8] {
        let remaining = self.time_end.saturating_sub(self.now);
        [
            ("{TEACHER}", self.teacher.clone()),
            ("{STUDENTFIRST}", self.student_first.clone()),
            ("{STUDENTLAST}", self.student_last.clone()),
            ("{STUDENTFULL}", self.student_full.clone()),
            ("{COURSE}", self.course.clone()),
            (
                "{TIMELEFT}",
                tenrol_util::days_left(self.time_end, self.now).to_string(),
            ),
            (
                "{MINUTESLEFT}",
                tenrol_util::minutes_left(self.time_end, self.now).to_string(),
            ),
            ("{SECONDSLEFT}", remaining.to_string()),
        ]
    }
}

/// Render a template into a subject and body
pub fn render(template: &str, ctx: &RenderContext) -> RenderedEmail {
    let values = ctx.placeholders();
    let (subject, body) = split_subject(template);

    RenderedEmail {
        subject: substitute(subject, &values),
        body: substitute(&body, &values),
    }
}

/// Separate the subject line from the body.
///
/// Without a subject line the subject is empty and the body is the whole text.
fn split_subject(template: &str) -> (&str, String) {
    let Some(start) = template.find(SUBJECT_MARKER) else {
        return ("", template.to_string());
    };

    let line_end = template[start..]
        .find('\n')
        .map(|i| start + i)
        .unwrap_or(template.len());
    let line = &template[start..line_end];

    let Some(close) = line.rfind('}') else {
        return ("", template.to_string());
    };
    if close < SUBJECT_MARKER.len() {
        return ("", template.to_string());
    }

    let subject = &line[SUBJECT_MARKER.len()..close];
    let after = &template[start + close + 1..];
    let mut body = String::with_capacity(template.len());
    body.push_str(&template[..start]);
    body.push_str(after.trim_start());

    (subject, body)
}

/// Replace placeholders in one left-to-right pass.
///
/// Replacement text is never rescanned and unknown `{...}` sequences are kept.
fn substitute(text: &str, values: &[(&'static str, String)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match values.iter().find(|(key, _)| tail.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}
