//! Deterministic text normalization applied before detection.
//!
//! The pipeline, in order: lowercase fold, zero-width removal, combining-mark
//! strip, halfwidth/fullwidth and ligature compatibility fold, bounded leet
//! fold, whitespace collapse. UTF-8 repair happens upstream at decode time
//! (lossy), so every input here is already valid UTF-8.
//!
//! The whole pipeline is idempotent: `normalize(normalize(x)) == normalize(x)`.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Zero-width characters stripped outright.
const ZERO_WIDTH: [char; 4] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

/// Normalizes an utterance for scanning.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let no_zero_width: String = lowered.chars().filter(|c| !ZERO_WIDTH.contains(c)).collect();
    // Marks are stripped on the NFKD form: compatibility ligatures can hide
    // precomposed marks that a plain NFD pass would not surface.
    let no_marks: String = no_zero_width
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect();
    // NFKC recomposition can surface uppercase (e.g. modifier capitals), so
    // the fold stays case-insensitive.
    let folded: String = no_marks.nfkc().flat_map(char::to_lowercase).collect();
    let leeted = leet_fold(&folded);
    collapse_whitespace(&leeted)
}

fn leet_char(c: char) -> Option<char> {
    match c {
        '0' => Some('o'),
        '1' => Some('i'),
        '3' => Some('e'),
        '4' => Some('a'),
        '5' => Some('s'),
        '7' => Some('t'),
        '@' => Some('a'),
        '$' => Some('s'),
        '!' => Some('i'),
        _ => None,
    }
}

/// Bounded leet substitution.
///
/// The text is split into maximal runs of letters and leet characters. A run
/// containing at least one genuine letter has all its leet characters folded;
/// a run without one (a standalone number like `2015`, a bare `!!`) is left
/// alone. Folding is therefore a fixpoint after one pass.
fn leet_fold(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if !c.is_alphabetic() && leet_char(c).is_none() {
            out.push(c);
            i += 1;
            continue;
        }
        let start = i;
        let mut has_letter = false;
        while i < chars.len() && (chars[i].is_alphabetic() || leet_char(chars[i]).is_some()) {
            has_letter |= chars[i].is_alphabetic();
            i += 1;
        }
        for &run_char in &chars[start..i] {
            match leet_char(run_char) {
                Some(folded) if has_letter => out.push(folded),
                _ => out.push(run_char),
            }
        }
    }
    out
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_collapses() {
        assert_eq!(normalize("  This IS   Fine \n\t ok "), "this is fine ok");
    }

    #[test]
    fn strips_zero_width_and_marks() {
        assert_eq!(normalize("ga\u{200B}rbage"), "garbage");
        assert_eq!(normalize("ge\u{0301}nial"), "genial");
        assert_eq!(normalize("\u{FEFF}hello"), "hello");
    }

    #[test]
    fn folds_width_and_ligatures() {
        assert_eq!(normalize("ＧＡＲＢＡＧＥ"), "garbage");
        assert_eq!(normalize("ﬂoppy"), "floppy");
    }

    #[test]
    fn leet_folds_inside_words_only() {
        assert_eq!(normalize("h3llo"), "hello");
        assert_eq!(normalize("sh!t"), "shit");
        assert_eq!(normalize("g@rb4ge"), "garbage");
        assert_eq!(normalize("released in 2015"), "released in 2015");
        assert_eq!(normalize("100"), "100");
        assert_eq!(normalize("!!"), "!!");
    }

    #[test]
    fn leet_folds_whole_run_when_letters_present() {
        assert_eq!(normalize("damn!!"), "damnii");
        assert_eq!(normalize("4ss"), "ass");
    }

    #[test]
    fn idempotent_on_fixtures() {
        let fixtures = [
            "This IS   Fine",
            "ga\u{200B}rbage",
            "ＧＡＲＢＡＧＥ ﬂoppy",
            "h3llo w0rld released in 2015",
            "damn!! 100 !$a",
            "ge\u{0301}nial \u{FEFF}x",
            "ᴷelvin ᵀest ǅungla",
            "> quoted\n```\ncode\n```",
            "",
            "   ",
        ];
        for fixture in fixtures {
            let once = normalize(fixture);
            let twice = normalize(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", fixture);
        }
    }

    #[test]
    fn empty_and_blank_map_to_empty() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize(" \t\n"), "");
    }
}
