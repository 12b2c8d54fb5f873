//! Text overlap scoring used to spot near-duplicate cards

/// Case-folded, trimmed form of a card text
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Length in chars of the longest common substring of `a` and `b`.
///
/// Classic O(n*m) dynamic programme with a single rolling row.
pub fn longest_common_substring(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut row = vec![0usize; b.len() + 1];
    let mut best = 0;
    for &ca in a {
        // Walk backwards so row[j - 1] still holds the previous row's value
        for j in (1..=b.len()).rev() {
            if ca == b[j - 1] {
                row[j] = row[j - 1] + 1;
                best = best.max(row[j]);
            } else {
                row[j] = 0;
            }
        }
    }
    best
}

/// Overlap score in [0, 1] between two texts.
///
/// Both texts are normalized first. The score is the longest common substring
/// divided by the length of the shorter text, so a text fully contained in the
/// other scores 1.0. Two empty texts are identical (1.0); an empty text against
/// a non-empty one scores 0.0.
pub fn overlap_score(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    let (shorter, longer) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };

    if shorter.is_empty() {
        return if longer.is_empty() { 1.0 } else { 0.0 };
    }
    if longer.contains(shorter.as_str()) {
        return 1.0;
    }

    let s: Vec<char> = shorter.chars().collect();
    let l: Vec<char> = longer.chars().collect();
    longest_common_substring(&s, &l) as f64 / s.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_texts_score_one() {
        assert_eq!(overlap_score("Follow PEP 8", "follow pep 8  "), 1.0);
    }

    #[test]
    fn containment_is_maximal() {
        assert_eq!(overlap_score("type hints", "Consider adding type hints"), 1.0);
    }

    #[test]
    fn shared_prefix_counts_against_shorter_text() {
        // "consider adding type " is 21 of the 26 chars of the shorter text
        let score = overlap_score("Consider adding type hints", "Consider adding type annotations");
        assert!((score - 21.0 / 26.0).abs() < 1e-9, "score was {score}");
    }

    #[test]
    fn unrelated_texts_score_low() {
        assert!(overlap_score("Follow PEP 8", "Consider adding type hints") < 0.5);
    }

    #[test]
    fn empty_texts() {
        assert_eq!(overlap_score("", "   "), 1.0);
        assert_eq!(overlap_score("", "anything"), 0.0);
    }

    #[test]
    fn lcs_handles_multibyte_chars() {
        let a: Vec<char> = "naïve café".chars().collect();
        let b: Vec<char> = "a café here".chars().collect();
        assert_eq!(longest_common_substring(&a, &b), " café".chars().count());
    }
}
