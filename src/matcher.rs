//! Verification-code extraction from message content.
//!
//! [`Matcher`] is the extension point; [`VerificationCodeMatcher`] is the built-in
//! extractor the polling engine runs over every newly cached message.
//!
//! # Example
//!
//! ```
//! use tempmail_hub::matcher::extract_verification_code;
//!
//! assert_eq!(extract_verification_code("您的验证码：123456", "").as_deref(), Some("123456"));
//! assert_eq!(extract_verification_code("your code is 4821", ""), Some("4821".into()));
//! assert_eq!(extract_verification_code("order #12 shipped", ""), None);
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

/// Trait for matching and extracting content from message text.
pub trait Matcher: Send + Sync {
    /// Attempts to find and extract matching content from the text.
    fn find_match<'a>(&self, text: &'a str) -> Option<Cow<'a, str>>;

    /// Returns a human-readable description of what this matcher looks for.
    fn description(&self) -> &str;
}

/// Regex-based matcher that extracts the first capture group.
///
/// ```
/// use tempmail_hub::matcher::{Matcher, RegexMatcher};
///
/// let matcher = RegexMatcher::new(r"token=([a-f0-9]+)").unwrap();
/// assert_eq!(matcher.find_match("?token=abc123&x=1").as_deref(), Some("abc123"));
/// ```
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    regex: Regex,
    description: String,
}

impl RegexMatcher {
    /// Creates a matcher; the first capture group is the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the regex pattern is invalid.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Self::with_description(pattern, format!("regex pattern: {pattern}"))
    }

    /// Creates a matcher with a custom description.
    ///
    /// # Errors
    ///
    /// Returns an error if the regex pattern is invalid.
    pub fn with_description(
        pattern: &str,
        description: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            description: description.into(),
        })
    }
}

impl Matcher for RegexMatcher {
    fn find_match<'a>(&self, text: &'a str) -> Option<Cow<'a, str>> {
        self.regex
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| Cow::Borrowed(m.as_str()))
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// First 4-8 digit run inside a labeled match.
static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9]{4,8}").expect("valid regex"));

/// Patterns in precedence order. Boundaries are ASCII-only, so a CJK label glued to
/// the digits still counts as a boundary.
static CODE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?:^|[^0-9A-Za-z_])[0-9]{6}(?:[^0-9A-Za-z_]|$)",
        r"(?:^|[^0-9A-Za-z_])[0-9]{5}(?:[^0-9A-Za-z_]|$)",
        r"(?:^|[^0-9A-Za-z_])[0-9]{4}(?:[^0-9A-Za-z_]|$)",
        r"验证码[：:\s]*[0-9]{4,8}",
        r"code[：:\s]*[0-9]{4,8}",
        r"verification[：:\s]*[0-9]{4,8}",
        r"您的.*码.*?[0-9]{4,8}",
        r"your.*code.*?[0-9]{4,8}",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

/// Ordered-pattern extractor for one-time verification codes.
///
/// Bare 6-, 5- and 4-digit runs are tried first, then labeled forms (`验证码`,
/// `code`, `verification`, `您的…码`, `your…code`). The first pattern that
/// matches wins even when a later one would pick a different number.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerificationCodeMatcher;

impl VerificationCodeMatcher {
    /// Creates the matcher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Scans `text` and `subject` together (lowercased) for a code.
    #[must_use]
    pub fn extract(&self, text: &str, subject: &str) -> Option<String> {
        if text.is_empty() && subject.is_empty() {
            return None;
        }
        let content = format!("{text} {subject}").to_lowercase();
        self.find_match(&content).map(Cow::into_owned)
    }
}

impl Matcher for VerificationCodeMatcher {
    fn find_match<'a>(&self, text: &'a str) -> Option<Cow<'a, str>> {
        CODE_PATTERNS.iter().find_map(|pattern| {
            let hit = pattern.find(text)?;
            let start = hit.start();
            DIGIT_RUN
                .find(hit.as_str())
                .map(|digits| Cow::Borrowed(&text[start + digits.start()..start + digits.end()]))
        })
    }

    fn description(&self) -> &str {
        "verification code"
    }
}

/// Extracts a verification code from a message body and subject.
#[must_use]
pub fn extract_verification_code(text: &str, subject: &str) -> Option<String> {
    VerificationCodeMatcher.extract(text, subject)
}
