// src/generate/cleanup.rs
//! Removal of the model's `<think>…</think>` scratch regions.

use once_cell::sync::Lazy;
use regex::Regex;

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"));

/// Deletes every closed `<think>` region in one pass. Text outside the regions
/// is untouched and an unterminated `<think>` stays as is. Applied once to the
/// assembled generation, never to already-cleaned text.
pub fn strip_reasoning(text: &str) -> String {
    THINK_RE.replace_all(text, "").into_owned()
}

/// Final form of a generated text: regions stripped, outer whitespace trimmed.
pub fn clean_output(text: &str) -> String {
    strip_reasoning(text).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_multiline_region() {
        let raw = "<think>\nplan the answer\n</think>\n\nFinal text.";
        assert_eq!(strip_reasoning(raw), "\n\nFinal text.");
        assert_eq!(clean_output(raw), "Final text.");
    }

    #[test]
    fn removes_every_region_non_greedily() {
        let raw = "a<think>x</think>b<think>y</think>c";
        assert_eq!(strip_reasoning(raw), "abc");
    }

    #[test]
    fn applying_twice_equals_once() {
        let samples = [
            "plain",
            "  <think>t</think> keep  ",
            "<think>unterminated",
            "</think>stray close",
        ];
        for s in samples {
            let once = strip_reasoning(s);
            assert_eq!(strip_reasoning(&once), once, "input: {s:?}");
            let cleaned = clean_output(s);
            assert_eq!(clean_output(&cleaned), cleaned, "input: {s:?}");
        }
    }

    #[test]
    fn removal_stays_inside_the_region() {
        // the tag spliced together by the removal is ordinary text
        assert_eq!(
            strip_reasoning("a<thi<think>x</think>nk>y</think>b"),
            "a<think>y</think>b"
        );
    }

    #[test]
    fn text_without_region_is_unchanged() {
        let s = "  spaces, <b>tags</b> and </think> stay  ";
        assert_eq!(strip_reasoning(s), s);
    }

    #[test]
    fn unterminated_region_is_left_alone() {
        assert_eq!(strip_reasoning("<think>never closed"), "<think>never closed");
    }
}
