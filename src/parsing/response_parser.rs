use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

/// Likert sanity bound, applied regardless of the instrument's declared scale.
pub const MIN_LIKERT: u8 = 1;
pub const MAX_LIKERT: u8 = 10;

fn likert_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Whole numeric tokens, sign and decimals included, so "-3" and "3.5" are never split.
    RE.get_or_init(|| Regex::new(r"-?\b\d+(?:\.\d+)*\b").expect("static regex"))
}

fn in_bounds(value: i64) -> Option<u8> {
    if (i64::from(MIN_LIKERT)..=i64::from(MAX_LIKERT)).contains(&value) {
        Some(value as u8)
    } else {
        None
    }
}

/// First in-range integer token on each non-blank line, in line order.
fn values_per_line(text: &str) -> Vec<u8> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            line.split_whitespace().find_map(|token| {
                token
                    .trim_end_matches(|c: char| c.is_ascii_punctuation())
                    .parse::<i64>()
                    .ok()
                    .and_then(in_bounds)
            })
        })
        .collect()
}

fn values_anywhere(text: &str) -> Vec<u8> {
    likert_token_re()
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<i64>().ok().and_then(in_bounds))
        .collect()
}

/// Extracts exactly `expected_count` Likert answers from free-form model output.
///
/// Line-oriented extraction is tried first; if it yields fewer values than
/// expected, the whole text is scanned for integer tokens in 1-10 instead.
/// Missing slots are `None`, surplus values are dropped. Never fails.
pub fn parse_likert_responses(response_text: &str, expected_count: usize) -> Vec<Option<u8>> {
    let mut values = values_per_line(response_text);
    if values.len() < expected_count {
        let scanned = values_anywhere(response_text);
        debug!(
            line_values = values.len(),
            scanned_values = scanned.len(),
            expected_count,
            "Falling back to whole-text numeric scan"
        );
        values = scanned;
    }

    let mut parsed: Vec<Option<u8>> = values.into_iter().take(expected_count).map(Some).collect();
    parsed.resize(expected_count, None);
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_value_per_line() {
        assert_eq!(parse_likert_responses("4\n5\n3", 3), vec![Some(4), Some(5), Some(3)]);
    }

    #[test]
    fn out_of_range_numerals_are_rejected_by_both_strategies() {
        assert_eq!(
            parse_likert_responses("I think the answer is 11 and 3", 2),
            vec![Some(3), None]
        );
    }

    #[test]
    fn trailing_punctuation_is_stripped_and_first_valid_token_wins() {
        let text = "Q1: I'd say 4.\nQ2: maybe 7, or 8\n\n   \nQ3: 10!";
        assert_eq!(parse_likert_responses(text, 3), vec![Some(4), Some(7), Some(10)]);
    }

    #[test]
    fn falls_back_to_document_scan_when_lines_are_short() {
        // single line, three answers: line pass finds only the first one
        assert_eq!(
            parse_likert_responses("My answers: 2, 6 and 9", 3),
            vec![Some(2), Some(6), Some(9)]
        );
    }

    #[test]
    fn negative_and_decimal_tokens_are_not_split_into_digits() {
        assert_eq!(parse_likert_responses("3.5\n4.5", 2), vec![None, None]);
        assert_eq!(parse_likert_responses("-3\n-4", 2), vec![None, None]);
        assert_eq!(parse_likert_responses("Q3\nQ4", 2), vec![None, None]);
        assert_eq!(
            parse_likert_responses("Scores: -3, 3.5 and 6", 2),
            vec![Some(6), None]
        );
    }

    #[test]
    fn truncates_surplus_and_pads_missing() {
        assert_eq!(parse_likert_responses("1\n2\n3\n4", 2), vec![Some(1), Some(2)]);
        assert_eq!(parse_likert_responses("", 2), vec![None, None]);
        assert_eq!(parse_likert_responses("no numbers at all", 1), vec![None]);
        assert!(parse_likert_responses("5", 0).is_empty());
    }

    #[test]
    fn zero_and_large_values_never_appear() {
        let text = "0\n100\n-3\n7 out of 10\n12";
        for value in parse_likert_responses(text, 6).into_iter().flatten() {
            assert!((MIN_LIKERT..=MAX_LIKERT).contains(&value));
        }
    }

    #[test]
    fn always_returns_expected_length() {
        let samples = ["", "4", "1 2 3 4 5 6 7 8 9 10", "eleven\n11\n", "3\n\n\n5"];
        for text in samples {
            for n in 0..6 {
                assert_eq!(parse_likert_responses(text, n).len(), n, "text={:?} n={}", text, n);
            }
        }
    }
}
