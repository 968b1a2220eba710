// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Which substrings get rewritten, and where.

/// Context given to untrusted apps by seapp_contexts for the first user.
const PRIV_APP: &[u8] = b"tcontext=u:r:priv_app:s0:c512,c768";

/// Root manager domains, most common first.
pub static SELINUX_CONTEXTS: TokenSet<'static> = TokenSet::new(&[
    TokenPair::new(b"tcontext=u:r:su:s0", PRIV_APP),
    TokenPair::new(b"tcontext=u:r:magisk:s0", PRIV_APP),
]);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenPair<'a> {
    pub source: &'a [u8],
    pub target: &'a [u8],
}

impl<'a> TokenPair<'a> {
    pub const fn new(source: &'a [u8], target: &'a [u8]) -> TokenPair<'a> {
        TokenPair { source, target }
    }
}

/// Ordered candidates. Earlier pairs are tried first and the first accepted
/// one is the only rewrite applied.
#[derive(Clone, Copy, Debug)]
pub struct TokenSet<'a> {
    pairs: &'a [TokenPair<'a>],
}

impl<'a> TokenSet<'a> {
    pub const fn new(pairs: &'a [TokenPair<'a>]) -> TokenSet<'a> {
        TokenSet { pairs }
    }

    pub fn pairs(&self) -> &'a [TokenPair<'a>] {
        self.pairs
    }
}

/// An accepted occurrence of `pair.source` starting at byte `at`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Match<'a> {
    pub at: usize,
    pub pair: TokenPair<'a>,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A quoted occurrence is some other field of the line (e.g. `name="..."`),
/// so anything with a quote after it is not ours to touch.
fn has_quote_after(rest: &[u8]) -> bool {
    rest.contains(&b'"')
}

/// Looks at the first occurrence of each source in order and returns the
/// first one that is not followed by a quote.
pub fn find_match<'a>(haystack: &[u8], set: &TokenSet<'a>) -> Option<Match<'a>> {
    set.pairs().iter().find_map(|pair| {
        let at = find(haystack, pair.source)?;
        if has_quote_after(&haystack[at + pair.source.len()..]) {
            tracing::trace!(at, "skipping quoted match");
            return None;
        }
        Some(Match { at, pair: *pair })
    })
}
