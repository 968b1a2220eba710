// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Rewriting of formatted strings on their way out of `vasprintf`.
//!
//! The audit lines logd builds contain the SELinux context of the target of
//! a denial (`tcontext=...`). When that context belongs to a root manager
//! we swap it for an ordinary untrusted app context, leaving the rest of the
//! line alone.

pub mod buf;
mod intercept;
pub mod tokens;

pub use buf::{AllocError, MallocBuf};
pub use intercept::{intercept, intercept_with, VaListRef, Vasprintf};
pub use tokens::{find_match, Match, TokenPair, TokenSet, SELINUX_CONTEXTS};

/// Builds the rewritten copy of `haystack` for the first accepted match in
/// `set`, or returns `None` when nothing should change.
///
/// The new buffer holds exactly the rewritten string plus its terminator
/// when the replacement grows the string.
pub fn rewrite(haystack: &[u8], set: &TokenSet<'_>) -> Result<Option<MallocBuf>, AllocError> {
    rewrite_with(haystack, set, MallocBuf::try_with_capacity)
}

/// [`rewrite`], getting the new buffer from `alloc` (called with the
/// capacity needed, at most once).
pub fn rewrite_with<A>(
    haystack: &[u8],
    set: &TokenSet<'_>,
    alloc: A,
) -> Result<Option<MallocBuf>, AllocError>
where
    A: FnOnce(usize) -> Result<MallocBuf, AllocError>,
{
    let Some(m) = find_match(haystack, set) else {
        return Ok(None);
    };

    let source_len = m.pair.source.len();
    let extra = m.pair.target.len().saturating_sub(source_len);

    let mut out = alloc(haystack.len() + extra + 1)?;
    out.copy_from(haystack);
    out.splice(m.at, source_len, m.pair.target);

    Ok(Some(out))
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    const TARGET: &str = "tcontext=u:r:priv_app:s0:c512,c768";

    fn run(input: &str) -> Option<String> {
        rewrite(input.as_bytes(), &SELINUX_CONTEXTS)
            .unwrap()
            .map(|b| String::from_utf8(b.as_bytes().to_vec()).unwrap())
    }

    #[test]
    fn test_rewrite_su() {
        expect_test::expect![[r#"
            Some(
                "avc: denied { read } scontext=u:r:untrusted_app:s0 tcontext=u:r:priv_app:s0:c512,c768 tclass=fd",
            )
        "#]]
        .assert_debug_eq(&run(
            "avc: denied { read } scontext=u:r:untrusted_app:s0 tcontext=u:r:su:s0 tclass=fd",
        ));
    }

    #[test]
    fn test_rewrite_magisk() {
        assert_eq!(
            run("avc: denied { call } tcontext=u:r:magisk:s0 tclass=binder").as_deref(),
            Some("avc: denied { call } tcontext=u:r:priv_app:s0:c512,c768 tclass=binder")
        );
    }

    #[test]
    fn test_quoted_is_left_alone() {
        assert_eq!(run("avc: denied comm=\"x\" tcontext=\"u:r:su:s0\" tclass=fd"), None);
        assert_eq!(run("tcontext=u:r:su:s0 name=\"su\""), None);
    }

    #[test]
    fn test_no_match() {
        assert_eq!(run("avc: denied tcontext=u:r:shell:s0 tclass=fd"), None);
        assert_eq!(run(""), None);
    }

    #[test]
    fn test_match_at_end() {
        assert_eq!(run("tcontext=u:r:su:s0").as_deref(), Some(TARGET));
    }

    #[test]
    fn test_only_first_occurrence_per_pair() {
        // the first su is followed by a quote, and that decides the whole pair
        assert_eq!(
            run("tcontext=u:r:su:s0 comm=\"sh\" tcontext=u:r:su:s0"),
            None
        );
    }

    #[test]
    fn test_later_pair_after_excluded_earlier_pair() {
        assert_eq!(
            run("a tcontext=u:r:su:s0 b=\"c\" tcontext=u:r:magisk:s0").as_deref(),
            Some("a tcontext=u:r:su:s0 b=\"c\" tcontext=u:r:priv_app:s0:c512,c768")
        );
    }

    #[test]
    fn test_earlier_pair_wins() {
        assert_eq!(
            run("tcontext=u:r:magisk:s0 tcontext=u:r:su:s0").as_deref(),
            Some("tcontext=u:r:magisk:s0 tcontext=u:r:priv_app:s0:c512,c768")
        );
    }

    #[test]
    fn test_shrinking_replacement() {
        let pairs = [TokenPair::new(b"a-long-token", b"s")];
        let set = TokenSet::new(&pairs);
        let out = rewrite(b"x a-long-token y", &set).unwrap().unwrap();
        assert_eq!(out.as_bytes(), b"x s y");
        assert_eq!(out.as_bytes_with_nul(), b"x s y\0");
        assert_eq!(out.capacity(), "x a-long-token y".len() + 1);
    }

    #[test]
    fn test_growing_capacity_is_tight() {
        let input = "tcontext=u:r:su:s0";
        let out = rewrite(input.as_bytes(), &SELINUX_CONTEXTS).unwrap().unwrap();
        assert_eq!(out.capacity(), TARGET.len() + 1);
        assert_eq!(out.len(), TARGET.len());
    }

    // no ':' so the filler can never contain a source on its own
    const FILLER: &str = "[a-z0-9 =,{}]{0,40}";

    fn source() -> impl Strategy<Value = &'static [u8]> {
        prop::sample::select(
            SELINUX_CONTEXTS
                .pairs()
                .iter()
                .map(|p| p.source)
                .collect::<Vec<_>>(),
        )
    }

    proptest! {
        #[test]
        fn unquoted_match_is_replaced(prefix in FILLER, suffix in FILLER, source in source()) {
            let mut input = prefix.clone().into_bytes();
            input.extend_from_slice(source);
            input.extend_from_slice(suffix.as_bytes());

            let out = rewrite(&input, &SELINUX_CONTEXTS).unwrap().unwrap();

            let expected = format!("{prefix}{TARGET}{suffix}");
            prop_assert_eq!(out.as_bytes(), expected.as_bytes());
            prop_assert_eq!(out.len(), input.len() - source.len() + TARGET.len());
            prop_assert_eq!(out.as_bytes_with_nul().last(), Some(&0u8));
        }

        #[test]
        fn quote_after_match_prevents_rewrite(
            prefix in FILLER,
            mid in FILLER,
            suffix in FILLER,
            source in source(),
        ) {
            let mut input = prefix.into_bytes();
            input.extend_from_slice(source);
            input.extend_from_slice(mid.as_bytes());
            input.push(b'"');
            input.extend_from_slice(suffix.as_bytes());

            prop_assert!(rewrite(&input, &SELINUX_CONTEXTS).unwrap().is_none());
        }

        #[test]
        fn no_source_means_no_rewrite(input in "[a-z0-9 =,:\"]{0,80}") {
            prop_assert!(rewrite(input.as_bytes(), &SELINUX_CONTEXTS).unwrap().is_none());
        }

        #[test]
        fn rewriting_is_idempotent(prefix in FILLER, suffix in FILLER, source in source()) {
            let mut input = prefix.into_bytes();
            input.extend_from_slice(source);
            input.extend_from_slice(suffix.as_bytes());

            let once = rewrite(&input, &SELINUX_CONTEXTS).unwrap().unwrap();
            prop_assert!(rewrite(once.as_bytes(), &SELINUX_CONTEXTS).unwrap().is_none());
        }
    }
}
