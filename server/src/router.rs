//! Maps an incoming `app_id` to the backend configured for it.
//!
//! Configured app ids may be literal or glob patterns (`*`, `?`). A device
//! whose app id matches more than one configured entry is rejected rather
//! than routed to an arbitrary winner.

use globset::{GlobBuilder, GlobMatcher};

use crate::error::SetupError;

enum RouteKey {
    Literal(String),
    Pattern(GlobMatcher),
}

impl RouteKey {
    fn matches(&self, app_id: &str) -> bool {
        match self {
            Self::Literal(key) => key == app_id,
            Self::Pattern(glob) => glob.is_match(app_id),
        }
    }
}

/// Result of resolving an app id.
#[derive(Debug, PartialEq)]
pub enum Resolution<T> {
    Unique(T),
    NoMatch,
    Ambiguous,
}

/// Read-only after startup; built once from the `apps` config section.
pub struct AppIdRouter<T> {
    routes: Vec<(RouteKey, T)>,
}

impl<T: Clone> AppIdRouter<T> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn insert(&mut self, app_id: &str, target: T) -> Result<(), SetupError> {
        let key = if app_id.contains('*') || app_id.contains('?') {
            let glob = GlobBuilder::new(app_id)
                .build()
                .map_err(|e| SetupError::backend(app_id, format!("invalid app id pattern: {e}")))?;
            RouteKey::Pattern(glob.compile_matcher())
        } else {
            RouteKey::Literal(app_id.to_string())
        };
        self.routes.push((key, target));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn resolve(&self, app_id: &str) -> Resolution<T> {
        let mut matches = self
            .routes
            .iter()
            .filter(|(key, _)| key.matches(app_id))
            .map(|(_, target)| target);

        match (matches.next(), matches.next()) {
            (None, _) => Resolution::NoMatch,
            (Some(target), None) => Resolution::Unique(target.clone()),
            (Some(_), Some(_)) => Resolution::Ambiguous,
        }
    }
}

impl<T: Clone> Default for AppIdRouter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(entries: &[&str]) -> AppIdRouter<String> {
        let mut router = AppIdRouter::new();
        for entry in entries {
            router.insert(entry, entry.to_string()).unwrap();
        }
        router
    }

    #[test]
    fn test_exact_match() {
        let router = router(&["com.example.apns", "com.example.gcm"]);
        assert_eq!(
            router.resolve("com.example.apns"),
            Resolution::Unique("com.example.apns".to_string())
        );
    }

    #[test]
    fn test_no_match() {
        let router = router(&["com.example.apns"]);
        assert_eq!(router.resolve("org.other.app"), Resolution::NoMatch);
    }

    #[test]
    fn test_star_pattern() {
        let router = router(&["com.example.*"]);
        assert_eq!(
            router.resolve("com.example.apns"),
            Resolution::Unique("com.example.*".to_string())
        );
    }

    #[test]
    fn test_question_mark_pattern() {
        let router = router(&["com.example.apns?"]);
        assert_eq!(
            router.resolve("com.example.apns2"),
            Resolution::Unique("com.example.apns?".to_string())
        );
        assert_eq!(router.resolve("com.example.apns"), Resolution::NoMatch);
    }

    #[test]
    fn test_ambiguous_patterns_rejected() {
        let router = router(&["*.example.*", "com.example.a*"]);
        assert_eq!(router.resolve("com.example.apns2"), Resolution::Ambiguous);
    }

    #[test]
    fn test_literal_and_pattern_both_matching_is_ambiguous() {
        let router = router(&["com.example.apns", "com.example.*"]);
        assert_eq!(router.resolve("com.example.apns"), Resolution::Ambiguous);
    }

    #[test]
    fn test_invalid_pattern_fails_setup() {
        let mut router: AppIdRouter<String> = AppIdRouter::new();
        assert!(router.insert("com.example.[", "x".to_string()).is_err());
    }
}
