//! Failure classification against a fixed tag vocabulary.
//!
//! The classifier is the only place error tags are matched. Classification is
//! pure: it looks at the error's stable tag, never at runtime state.

/// Exposes the stable tag the classifier matches on.
///
/// Implement this on application error types; the tag should be a short
/// machine-readable identifier, not the human-readable message.
pub trait ErrorTag {
    fn tag(&self) -> &str;
}

impl ErrorTag for String {
    fn tag(&self) -> &str {
        self
    }
}

/// Outcome of classifying an operation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The retry engine may try again.
    Retryable,
    /// Surface on first occurrence.
    NonRetryable,
}

/// How configured tags are compared to an error's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMatch {
    /// The error tag must equal a configured tag.
    Exact,
    /// A configured tag must occur within the error tag.
    Substring,
}

/// Maps failures to retryable / non-retryable by matching a finite tag set.
#[derive(Debug, Clone, PartialEq)]
pub struct Classifier {
    retryable: Vec<String>,
    mode: TagMatch,
}

impl Classifier {
    /// Classifier that retries errors whose tag equals one of `tags`.
    pub fn exact<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { retryable: tags.into_iter().map(Into::into).collect(), mode: TagMatch::Exact }
    }

    /// Classifier that retries errors whose tag contains one of `tags`.
    pub fn substring<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { retryable: tags.into_iter().map(Into::into).collect(), mode: TagMatch::Substring }
    }

    /// Classifier with an empty retryable set; every failure is fatal.
    pub fn none() -> Self {
        Self { retryable: Vec::new(), mode: TagMatch::Exact }
    }

    /// Classify a single failure.
    pub fn classify<E: ErrorTag>(&self, error: &E) -> FailureKind {
        if self.matches(error.tag()) {
            FailureKind::Retryable
        } else {
            FailureKind::NonRetryable
        }
    }

    fn matches(&self, tag: &str) -> bool {
        match self.mode {
            TagMatch::Exact => self.retryable.iter().any(|t| t == tag),
            TagMatch::Substring => self.retryable.iter().any(|t| tag.contains(t.as_str())),
        }
    }
}
