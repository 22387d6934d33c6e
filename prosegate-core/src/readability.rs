//! Flesch Reading Ease, computed locally on the generated text.

/// Flesch Reading Ease of `text`, clamped to 0–100. Empty text scores 0.
pub fn score(text: &str) -> f64 {
    let words: Vec<&str> = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return 0.0;
    }

    let sentences = count_sentences(text).max(1) as f64;
    let syllables: usize = words.iter().map(|w| count_syllables(w)).sum();
    let word_count = words.len() as f64;

    let ease = 206.835 - 1.015 * (word_count / sentences) - 84.6 * (syllables as f64 / word_count);
    ease.clamp(0.0, 100.0)
}

fn count_sentences(text: &str) -> usize {
    let mut count = 0;
    let mut in_terminator = false;
    for c in text.chars() {
        if matches!(c, '.' | '!' | '?') {
            if !in_terminator {
                count += 1;
            }
            in_terminator = true;
        } else if !c.is_whitespace() {
            in_terminator = false;
        }
    }
    // Trailing fragment without a terminator still counts.
    let trimmed = text.trim_end();
    if !trimmed.is_empty() && !trimmed.ends_with(['.', '!', '?']) {
        count += 1;
    }
    count
}

/// Vowel-group heuristic with a silent trailing `e`.
fn count_syllables(word: &str) -> usize {
    let lower = word.to_lowercase();
    if lower.chars().all(|c| c.is_ascii_digit()) {
        return 1;
    }

    let mut groups = 0;
    let mut prev_vowel = false;
    for c in lower.chars() {
        let vowel = matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');
        if vowel && !prev_vowel {
            groups += 1;
        }
        prev_vowel = vowel;
    }

    if lower.ends_with('e') && !lower.ends_with("le") && groups > 1 {
        groups -= 1;
    }
    groups.max(1)
}
