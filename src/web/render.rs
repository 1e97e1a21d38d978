//! HTML for the console page and the `/exec` fragment
//!
//! The page drives itself with intercooler.js: submitting the form posts
//! to `/exec` and swaps the response into `#stdout`.

use crate::executor::ExecutionOutcome;
use std::fmt::Write;

/// Returned instead of an empty fragment
///
/// intercooler.js treats an empty body or a single space as "leave the
/// target alone"; two spaces clear it.
pub const EMPTY_FRAGMENT: &str = "  ";

const STYLE: &str = "\
* { font-family: Verdana; }
#loading { display: none; }
#exec_label { color: #888; display: none; }
#exec_input { font-size: 1.6em; width: 20em; max-width: 100%; height: 1.8em; padding: 0; margin: 0; }
#exec_submit { font-size: 1.2em; padding: 0.85em 0.5em 0.5em 0.5em; margin: 0; border: 0; }
li { padding-top: 0.2em; }
#exec_form { text-align: center; padding: 1em 1em; border-bottom: 1px #d0d0d0 dashed; }
label { padding: 1em 1em; }
textarea { height: 100%; width: 100%; border: none; }
";

/// Escape text for element content and attribute values
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Output shown in a read-only text area
pub fn render_stdout(text: &str) -> String {
    format!("<textarea readonly>{}</textarea>", escape(text))
}

/// Body of a `/exec` response
///
/// `None` means nothing was run.
pub fn render_fragment(text: Option<&str>) -> String {
    match text {
        Some(text) => render_stdout(text),
        None => EMPTY_FRAGMENT.to_string(),
    }
}

/// Text to display for an outcome
///
/// Failures are labelled so the page never shows a blank result for a run
/// that went wrong.
pub fn outcome_text(outcome: &ExecutionOutcome) -> String {
    match outcome {
        ExecutionOutcome::Success(output) => output.clone(),
        ExecutionOutcome::CreationFailed(msg) => format!("Error: could not create jail: {}", msg),
        ExecutionOutcome::ProvisionFailed(msg) => {
            format!("Error: could not provision jail: {}", msg)
        }
        ExecutionOutcome::ExecutionFailed(msg) => format!("Error: command failed: {}", msg),
    }
}

/// The full console page, optionally with output already filled in
pub fn render_index(stdout: Option<&str>) -> String {
    let mut page = String::with_capacity(2048);

    page.push_str("<!DOCTYPE html>\n<html>\n<head>\n");
    page.push_str("<meta charset=\"utf-8\">\n");
    page.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    page.push_str("<title>Skiff</title>\n");
    let _ = write!(page, "<style>\n{}</style>\n", STYLE);
    page.push_str("</head>\n<body>\n");

    page.push_str(
        "<form id=\"exec_form\" title=\"Type a command to run in a jail.\" \
         ic-post-to=\"/exec\" ic-target=\"#stdout\" ic-indicator=\"#loading\">\n",
    );
    page.push_str(
        "<label for=\"exec_input\" id=\"exec_label\">Execute in one-shot jail:</label>\n",
    );
    page.push_str(
        "<input id=\"exec_input\" name=\"command\" autofocus ic-indicator=\"#loading\">\n",
    );
    page.push_str("<input id=\"exec_submit\" type=\"submit\" value=\"exec\">\n");
    page.push_str(
        "<img src=\"/static/images/loader.gif\" alt=\"loading...\" id=\"loading\">\n",
    );
    page.push_str("</form>\n");

    page.push_str("<div id=\"stdout\">");
    if let Some(text) = stdout.filter(|t| !t.is_empty()) {
        page.push_str(&render_stdout(text));
    }
    page.push_str("</div>\n");

    page.push_str(
        "<script src=\"/static/js/jquery-3.3.1.min.js\" type=\"text/javascript\"></script>\n",
    );
    page.push_str(
        "<script src=\"/static/js/intercooler-1.2.1.min.js\" type=\"text/javascript\"></script>\n",
    );
    page.push_str("</body>\n</html>\n");

    page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(
            escape("<script>alert(\"x\" & 'y')</script>"),
            "&lt;script&gt;alert(&quot;x&quot; &amp; &#x27;y&#x27;)&lt;/script&gt;"
        );
        assert_eq!(escape("plain text\n"), "plain text\n");
    }

    #[test]
    fn test_blank_fragment_is_two_spaces() {
        assert_eq!(render_fragment(None), "  ");
    }

    #[test]
    fn test_fragment_escapes_output() {
        assert_eq!(
            render_fragment(Some("</textarea><b>")),
            "<textarea readonly>&lt;/textarea&gt;&lt;b&gt;</textarea>"
        );
        // Empty output from a run still replaces the target
        assert_eq!(render_fragment(Some("")), "<textarea readonly></textarea>");
    }

    #[test]
    fn test_index_page() {
        let page = render_index(None);
        assert!(page.contains("<title>Skiff</title>"));
        assert!(page.contains("ic-post-to=\"/exec\""));
        assert!(page.contains("ic-target=\"#stdout\""));
        assert!(page.contains("name=\"command\" autofocus"));
        assert!(page.contains("/static/js/intercooler-1.2.1.min.js"));
        assert!(page.contains("<div id=\"stdout\"></div>"));
    }

    #[test]
    fn test_index_with_output() {
        let page = render_index(Some("a < b"));
        assert!(page.contains("<div id=\"stdout\"><textarea readonly>a &lt; b</textarea></div>"));
    }

    #[test]
    fn test_outcome_text_never_blank_on_failure() {
        let failures = [
            ExecutionOutcome::CreationFailed(String::new()),
            ExecutionOutcome::ProvisionFailed(String::new()),
            ExecutionOutcome::ExecutionFailed(String::new()),
        ];
        for outcome in &failures {
            assert!(outcome_text(outcome).starts_with("Error:"));
        }
        assert_eq!(outcome_text(&ExecutionOutcome::Success("ok\n".into())), "ok\n");
    }
}
