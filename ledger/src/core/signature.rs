//! Failure signature normalization.
//!
//! A signature collapses superficially different error text from one root cause
//! into one comparable string. The default policy:
//!
//! 1. Take the first non-empty line (`unknown` if there is none), lowercased.
//! 2. Keep `category:detail` tokens such as `timeout:build` verbatim.
//! 3. Otherwise mask UUIDs as `<uuid>`, `0x` hex as `<hex>`, paths as `<path>`
//!    and remaining digit runs as `<n>`, in that order.
//! 4. Collapse whitespace and truncate to [`MAX_SIGNATURE_CHARS`] characters.

use std::sync::LazyLock;

use regex::Regex;

pub const MAX_SIGNATURE_CHARS: usize = 160;

/// Pluggable normalization policy. Implementations must be pure.
pub trait SignatureNormalizer: Send + Sync {
    fn normalize(&self, raw_error: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNormalizer;

static CATEGORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_.-]+:[a-z0-9_./-]+$").unwrap());
static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").unwrap()
});
static HEX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b0x[0-9a-f]+\b").unwrap());
static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\.{1,2})?[\w.-]*(?:/[\w.-]+)+/?").unwrap());
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

impl SignatureNormalizer for DefaultNormalizer {
    fn normalize(&self, raw_error: &str) -> String {
        let Some(line) = raw_error.lines().map(str::trim).find(|line| !line.is_empty()) else {
            return "unknown".to_string();
        };
        let line = line.to_lowercase();
        if CATEGORY_RE.is_match(&line) {
            return truncate(&line);
        }

        let masked = UUID_RE.replace_all(&line, "<uuid>");
        let masked = HEX_RE.replace_all(&masked, "<hex>");
        let masked = PATH_RE.replace_all(&masked, "<path>");
        let masked = NUMBER_RE.replace_all(&masked, "<n>");
        let collapsed = SPACE_RE.replace_all(&masked, " ");
        truncate(collapsed.trim())
    }
}

fn truncate(value: &str) -> String {
    value.chars().take(MAX_SIGNATURE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(raw: &str) -> String {
        DefaultNormalizer.normalize(raw)
    }

    #[test]
    fn category_tokens_are_kept_verbatim() {
        assert_eq!(sig("timeout:build"), "timeout:build");
        assert_eq!(sig("  Timeout:Build\n"), "timeout:build");
    }

    #[test]
    fn same_input_yields_same_signature() {
        let raw = "error: linker `cc` not found\n  = note: No such file";
        assert_eq!(sig(raw), sig(raw));
    }

    #[test]
    fn volatile_details_collapse_to_one_signature() {
        let a = sig("Timeout after 30s at /tmp/build-1234/out.log");
        let b = sig("timeout after 45s at /tmp/build-9/out.log");
        assert_eq!(a, b);
        assert_eq!(a, "timeout after <n>s at <path>");
    }

    #[test]
    fn masks_hex_and_uuid() {
        assert_eq!(
            sig("segfault at 0x7ffd1234 in job 123e4567-e89b-12d3-a456-426614174000"),
            "segfault at <hex> in job <uuid>"
        );
    }

    #[test]
    fn only_first_non_empty_line_counts() {
        assert_eq!(
            sig("\n\nbuild failed\nstack frame 1\nstack frame 2"),
            "build failed"
        );
    }

    #[test]
    fn relative_paths_are_masked() {
        assert_eq!(
            sig("cannot open src/main.rs"),
            sig("cannot open ./lib/other.rs")
        );
    }

    #[test]
    fn blank_input_is_unknown() {
        assert_eq!(sig("   \n\t"), "unknown");
    }

    #[test]
    fn long_lines_are_truncated() {
        let raw = "x".repeat(500);
        assert_eq!(sig(&raw).chars().count(), MAX_SIGNATURE_CHARS);
    }
}
