//! URN values: scheme + path pairs naming a messaging endpoint.
//!
//! The canonical *identity* string (`scheme:path`) is what uniqueness is
//! enforced on, per org. Display names ride along but never participate
//! in identity.

use serde::{Deserialize, Serialize};

/// Scheme for telephone numbers.
pub const TEL_SCHEME: &str = "tel";

/// Scheme for Telegram user IDs.
pub const TELEGRAM_SCHEME: &str = "telegram";

/// A parsed URN such as `tel:+15551234`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Urn {
    scheme: String,
    path: String,
    display: Option<String>,
}

impl Urn {
    /// Build a URN from a scheme and path, lowercasing the scheme.
    pub fn new(scheme: &str, path: &str) -> Self {
        Self {
            scheme: scheme.to_lowercase(),
            path: path.trim().to_owned(),
            display: None,
        }
    }

    /// Build a telephone URN, normalizing common formatting noise.
    ///
    /// Spaces, dots, dashes and parentheses are stripped and a leading
    /// `00` international prefix becomes `+`. Full E.164 parsing against
    /// a channel country is the handler's job; the courier only needs a
    /// stable identity.
    pub fn tel(number: &str) -> Self {
        let mut path: String = number
            .chars()
            .filter(|c| !matches!(c, ' ' | '.' | '-' | '(' | ')'))
            .collect();
        if let Some(rest) = path.strip_prefix("00") {
            path = format!("+{rest}");
        }
        Self {
            scheme: TEL_SCHEME.to_owned(),
            path,
            display: None,
        }
    }

    /// Build a Telegram URN from a numeric user ID.
    pub fn telegram(user_id: i64) -> Self {
        Self {
            scheme: TELEGRAM_SCHEME.to_owned(),
            path: user_id.to_string(),
            display: None,
        }
    }

    /// Attach a display name, dropping empty strings.
    pub fn with_display(mut self, display: &str) -> Self {
        let trimmed = display.trim();
        self.display = (!trimmed.is_empty()).then(|| trimmed.to_owned());
        self
    }

    /// The canonical identity string, unique per org.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.scheme, self.path)
    }

    /// The URN scheme (e.g. `tel`).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The scheme-specific path (e.g. `+15551234`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Optional human-readable display name.
    pub fn display(&self) -> Option<&str> {
        self.display.as_deref()
    }
}

impl std::fmt::Display for Urn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)
    }
}
