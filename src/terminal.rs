//! A small cycling palette for per-container log-line prefixes, so output
//! from several containers interleaved on one terminal stays visually
//! distinguishable (console rendering itself is out of scope, §1/§6, but the
//! engine still needs to hand the renderer a stable color per container).
//!
//! Reconstructed from the call sites in `api_docker::container_runner`
//! (`next_terminal_color()` used to build the stdout/stderr line prefixes) —
//! the function's own definition was not present in the retrieval pack's
//! slice of the nested crate.

use std::sync::atomic::{AtomicUsize, Ordering};

use owo_colors::AnsiColors;

const PALETTE: &[AnsiColors] = &[
    AnsiColors::Cyan,
    AnsiColors::Magenta,
    AnsiColors::Yellow,
    AnsiColors::Green,
    AnsiColors::Blue,
    AnsiColors::Red,
];

static NEXT: AtomicUsize = AtomicUsize::new(0);

/// Returns the next color in the palette, cycling back to the start once
/// exhausted. Each call advances the shared cursor, so callers that want a
/// stable per-container color should call this once per container and keep
/// the result, not call it per line.
pub fn next_terminal_color() -> AnsiColors {
    let index = NEXT.fetch_add(1, Ordering::Relaxed) % PALETTE.len();
    PALETTE[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_through_the_whole_palette() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..PALETTE.len() {
            seen.insert(format!("{:?}", next_terminal_color()));
        }
        assert_eq!(seen.len(), PALETTE.len());
    }
}
