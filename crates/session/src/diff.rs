//! Screen diff: the text present in a later snapshot but not in an earlier
//! one, in order.

use std::collections::HashMap;

use crate::classify::MarkerTable;

fn normalize(screen: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = screen.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

fn has_content(lines: &[&str]) -> bool {
    lines.iter().any(|l| !l.trim().is_empty())
}

/// Smallest shift `s` such that `before[s..]` is a non-blank prefix of
/// `after`: the screen scrolled by `s` lines and new output was appended.
fn scroll_overlap(before: &[&str], after: &[&str]) -> Option<usize> {
    (0..before.len()).find_map(|s| {
        let overlap = &before[s..];
        (overlap.len() <= after.len() && has_content(overlap) && after.starts_with(overlap))
            .then_some(overlap.len())
    })
}

fn multiset_difference<'a>(before: &[&str], after: &[&'a str]) -> Vec<&'a str> {
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    for line in before {
        *remaining.entry(*line).or_default() += 1;
    }
    after
        .iter()
        .filter(|line| match remaining.get_mut(**line) {
            Some(n) if *n > 0 => {
                *n -= 1;
                false
            }
            _ => true,
        })
        .copied()
        .collect()
}

fn trim_blank_edges(mut lines: Vec<&str>) -> Vec<&str> {
    while lines.first().is_some_and(|l| l.trim().is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    lines
}

/// Lines of `after` that are not in `before`, order preserved.
///
/// Tried in order:
/// 1. `before`'s tail is a prefix of `after` (pure append, with or without
///    scrolling);
/// 2. same, ignoring `before`'s last line (a prompt line redrawn in place);
/// 3. order-preserving multiset difference.
///
/// Trailing whitespace is ignored and blank edges are trimmed.
pub fn diff_screens(before: &str, after: &str) -> String {
    let b = normalize(before);
    let a = normalize(after);

    if a == b {
        return String::new();
    }
    if !has_content(&b) {
        return trim_blank_edges(a).join("\n");
    }

    let new_lines: Vec<&str> = if let Some(n) = scroll_overlap(&b, &a) {
        a[n..].to_vec()
    } else if let Some(n) = scroll_overlap(&b[..b.len() - 1], &a) {
        a[n..].to_vec()
    } else {
        multiset_difference(&b, &a)
    };

    trim_blank_edges(new_lines).join("\n")
}

/// Strip UI chrome from a diff: the echoed prompt at the top, and any
/// idle-prompt or thinking-status lines.
pub fn extract_response(diff: &str, prompt: &str, markers: &MarkerTable) -> String {
    let prompt_lines: Vec<&str> = prompt
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let is_echo = |line: &str| {
        let bare = line
            .trim()
            .trim_start_matches(['>', '❯', '│', '$'])
            .trim();
        bare.is_empty() || prompt_lines.iter().any(|p| *p == bare)
    };

    let lines: Vec<&str> = diff
        .lines()
        .skip_while(|l| is_echo(*l))
        .filter(|l| !markers.is_idle_line(l) && !markers.is_thinking_line(l))
        .collect();

    trim_blank_edges(lines).join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appended_lines() {
        assert_eq!(diff_screens("A\nB", "A\nB\nC\nD"), "C\nD");
    }

    #[test]
    fn identical_screens() {
        assert_eq!(diff_screens("A\nB\n", "A\nB"), "");
        assert_eq!(diff_screens("", ""), "");
    }

    #[test]
    fn empty_before_returns_everything() {
        assert_eq!(diff_screens("\n\n", "\nhello\nworld\n"), "hello\nworld");
    }

    #[test]
    fn scrolled_screen() {
        let before = "l1\nl2\nl3\nl4";
        let after = "l3\nl4\nnew1\nnew2";
        assert_eq!(diff_screens(before, after), "new1\nnew2");
    }

    #[test]
    fn redrawn_prompt_line() {
        let before = "history\n> ";
        let after = "history\n> what time is it\nIt is noon.\n> ";
        assert_eq!(
            diff_screens(before, after),
            "> what time is it\nIt is noon.\n>"
        );
    }

    #[test]
    fn blank_overlap_does_not_count() {
        // Only a blank line is shared; fall through to the multiset path.
        let before = "x\n\ny";
        let after = "\nz";
        assert_eq!(diff_screens(before, after), "z");
    }

    #[test]
    fn multiset_fallback_keeps_order_and_duplicates() {
        let before = "╭──╮\n│ > │\n╰──╯";
        let after = "ok\n> hi\nok\n╭──╮\n│ > │\n╰──╯";
        assert_eq!(diff_screens(before, after), "ok\n> hi\nok");
    }

    #[test]
    fn trailing_whitespace_is_ignored() {
        assert_eq!(diff_screens("A  \nB", "A\nB   \nC"), "C");
    }

    #[test]
    fn extract_drops_echo_and_chrome() {
        let markers = MarkerTable::new(
            &[r"(?i)working\.\.\.".into()],
            &[r"^\s*>\s*$".into()],
            4,
        )
        .unwrap();
        let diff = "> what time is it\n\nWorking...\nIt is noon.\nEnjoy lunch.\n>";
        assert_eq!(
            extract_response(diff, "what time is it", &markers),
            "It is noon.\nEnjoy lunch."
        );
    }

    #[test]
    fn extract_handles_multiline_prompt_echo() {
        let markers = MarkerTable::new(&[], &[r"^>$".into()], 4).unwrap();
        let diff = "> first line\n  second line\nAnswer";
        assert_eq!(
            extract_response(diff, "first line\nsecond line", &markers),
            "Answer"
        );
    }
}
