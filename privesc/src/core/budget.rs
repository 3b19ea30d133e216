//! Token budget helpers.

/// Tokens kept free in every prompt for the completion itself.
pub const SAFETY_MARGIN: usize = 128;

/// Counts tokens the way the reasoning provider does.
pub trait TokenCounter {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Character-based estimate: one token per four characters, rounded up.
///
/// Monotonic in the length of the text, which is all trimming relies on.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// Token budget left for history once the fixed prompt parts are accounted for.
pub fn history_budget(
    context_size: usize,
    safety_margin: usize,
    static_prompt_tokens: usize,
    strategy_overhead_tokens: usize,
) -> usize {
    context_size
        .saturating_sub(safety_margin)
        .saturating_sub(static_prompt_tokens)
        .saturating_sub(strategy_overhead_tokens)
}

/// Drop text from the front until it fits `budget` tokens.
///
/// The newest content is kept. When the cut lands inside a line, the partial
/// line is dropped as well as long as something remains after it.
pub fn trim_front<C: TokenCounter + ?Sized>(counter: &C, budget: usize, text: &str) -> String {
    let mut current = counter.count_tokens(text);
    if current <= budget {
        return text.to_string();
    }
    if budget == 0 {
        return String::new();
    }

    let mut start = 0usize;
    while current > budget {
        let rest = text.len() - start;
        let excess = current - budget;
        let step = (rest * excess).div_ceil(current).max(1);
        let mut cut = (start + step).min(text.len());
        while !text.is_char_boundary(cut) {
            cut += 1;
        }
        start = cut;
        current = counter.count_tokens(&text[start..]);
    }

    let kept = &text[start..];
    if start > 0
        && !text[..start].ends_with('\n')
        && let Some(newline) = kept.find('\n')
        && newline + 1 < kept.len()
    {
        return kept[newline + 1..].to_string();
    }
    kept.to_string()
}
