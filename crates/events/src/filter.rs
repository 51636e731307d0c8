//! Topic filters with MQTT-style wildcards.
//!
//! Topics and filters are `/`-delimited segment sequences:
//!
//! - `+` matches exactly one segment (including an empty one)
//! - `#` matches zero or more remaining segments and must be the last segment
//!
//! Empty segments (`a//b`) are real, distinct segments and are never skipped.
//! `"a/#"` matches `"a"`: the multi-level wildcard absorbs zero trailing
//! segments as well as many.

use thiserror::Error;

const SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Registration-time validation failure for a topic filter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidFilterError {
    #[error("topic filter must not be empty")]
    Empty,

    /// `#` appeared before the final segment (e.g. `a/#/c`).
    #[error("multi-level wildcard '#' must be the last segment of '{filter}'")]
    MultiLevelNotLast { filter: String },

    /// `#` appeared more than once (e.g. `a/#/#`).
    #[error("multi-level wildcard '#' appears more than once in '{filter}'")]
    MultiLevelDuplicated { filter: String },

    /// A wildcard shares a segment with other characters (e.g. `a/b+`).
    #[error("wildcard must occupy a whole segment, found '{segment}' in '{filter}'")]
    WildcardNotAlone { filter: String, segment: String },
}

/// Decide whether `filter` matches the concrete `topic`.
///
/// This is the raw matching walk; it does not validate `filter`. Use
/// [`TopicFilter::parse`] to reject malformed filters up front.
pub fn matches(filter: &str, topic: &str) -> bool {
    matches_segments(filter.split(SEPARATOR), topic)
}

fn matches_segments<'a>(filter: impl IntoIterator<Item = &'a str>, topic: &str) -> bool {
    let mut topic_segments = topic.split(SEPARATOR);

    for filter_segment in filter {
        if filter_segment == MULTI_LEVEL {
            return true;
        }

        let Some(topic_segment) = topic_segments.next() else {
            return false;
        };

        if filter_segment != SINGLE_LEVEL && filter_segment != topic_segment {
            return false;
        }
    }

    // No implicit trailing `#`.
    topic_segments.next().is_none()
}

/// A validated topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    raw: String,
    segments: Vec<String>,
    has_wildcards: bool,
}

impl TopicFilter {
    /// Parse and validate a filter pattern.
    pub fn parse(pattern: impl Into<String>) -> Result<Self, InvalidFilterError> {
        let raw = pattern.into();
        if raw.is_empty() {
            return Err(InvalidFilterError::Empty);
        }

        let segments: Vec<String> = raw.split(SEPARATOR).map(str::to_owned).collect();

        if segments.iter().filter(|s| s.as_str() == MULTI_LEVEL).count() > 1 {
            return Err(InvalidFilterError::MultiLevelDuplicated { filter: raw });
        }

        let last = segments.len() - 1;
        let mut has_wildcards = false;
        for (i, segment) in segments.iter().enumerate() {
            match segment.as_str() {
                MULTI_LEVEL if i != last => {
                    return Err(InvalidFilterError::MultiLevelNotLast { filter: raw });
                }
                MULTI_LEVEL | SINGLE_LEVEL => has_wildcards = true,
                s if s.contains(['+', '#']) => {
                    return Err(InvalidFilterError::WildcardNotAlone {
                        segment: s.to_owned(),
                        filter: raw,
                    });
                }
                _ => {}
            }
        }

        Ok(Self {
            raw,
            segments,
            has_wildcards,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_wildcards(&self) -> bool {
        self.has_wildcards
    }

    /// Match against a concrete topic using the pre-split segments.
    pub fn matches(&self, topic: &str) -> bool {
        if !self.has_wildcards {
            return self.raw == topic;
        }
        matches_segments(self.segments.iter().map(String::as_str), topic)
    }
}

impl core::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl core::str::FromStr for TopicFilter {
    type Err = InvalidFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_level_wildcard_matches_exactly_one_segment() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(!matches("a/+/c", "a/b/x/c"));
        assert!(!matches("a/+/c", "a/c"));
    }

    #[test]
    fn single_level_wildcard_matches_empty_segment() {
        assert!(matches("a/+/c", "a//c"));
        assert!(matches("+", ""));
    }

    #[test]
    fn multi_level_wildcard_absorbs_remaining_segments() {
        assert!(matches("a/#", "a/b/c"));
        assert!(matches("a/#", "a/b"));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("a/#", "b/c"));
    }

    #[test]
    fn multi_level_wildcard_matches_zero_trailing_segments() {
        assert!(matches("a/#", "a"));
        assert!(TopicFilter::parse("a/#").unwrap().matches("a"));
    }

    #[test]
    fn combined_wildcards() {
        assert!(matches("a/+/c/#", "a/x/c/y/z"));
        assert!(matches("a/+/c/#", "a/x/c"));
        assert!(!matches("a/+/c/#", "a/x/d/y"));
    }

    #[test]
    fn no_implicit_trailing_wildcard() {
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
    }

    #[test]
    fn empty_segments_are_distinct() {
        assert!(matches("a//b", "a//b"));
        assert!(!matches("a/b", "a//b"));
        assert!(!matches("a//b", "a/b"));
        assert!(matches("a/", "a/"));
        assert!(!matches("a", "a/"));
    }

    #[test]
    fn parse_rejects_multi_level_mid_pattern() {
        assert_eq!(
            TopicFilter::parse("a/#/c"),
            Err(InvalidFilterError::MultiLevelNotLast {
                filter: "a/#/c".into()
            })
        );
    }

    #[test]
    fn parse_rejects_duplicated_multi_level() {
        assert!(matches!(
            TopicFilter::parse("#/#"),
            Err(InvalidFilterError::MultiLevelDuplicated { .. })
        ));
    }

    #[test]
    fn parse_rejects_wildcards_inside_segments() {
        assert!(matches!(
            TopicFilter::parse("a/b+"),
            Err(InvalidFilterError::WildcardNotAlone { .. })
        ));
        assert!(matches!(
            TopicFilter::parse("a/#b"),
            Err(InvalidFilterError::WildcardNotAlone { .. })
        ));
    }

    #[test]
    fn parse_rejects_empty() {
        assert_eq!(TopicFilter::parse(""), Err(InvalidFilterError::Empty));
    }

    #[test]
    fn parse_accepts_valid_filters() {
        for f in ["#", "+", "a/+/c/#", "site/+/temp", "a//b", "/leading"] {
            assert!(TopicFilter::parse(f).is_ok(), "{f} should be valid");
        }
        assert!(!TopicFilter::parse("a/b").unwrap().has_wildcards());
        assert!(TopicFilter::parse("a/+").unwrap().has_wildcards());
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-z0-9]{0,4}"
    }

    fn topic() -> impl Strategy<Value = String> {
        prop::collection::vec(segment(), 1..6)
            .prop_map(|s| s.join("/"))
            .prop_filter("filters must not be empty", |t| !t.is_empty())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a filter without wildcards matches exactly the identical topic.
        #[test]
        fn exact_filter_matches_iff_equal(f in topic(), t in topic()) {
            prop_assert_eq!(matches(&f, &t), f == t);
            let parsed = TopicFilter::parse(f.clone()).unwrap();
            prop_assert_eq!(parsed.matches(&t), f == t);
        }

        /// Property: `#` alone matches every topic.
        #[test]
        fn hash_matches_everything(t in topic()) {
            prop_assert!(matches("#", &t));
        }

        /// Property: `prefix/#` matches the prefix and every extension of it.
        #[test]
        fn prefix_hash_matches_extensions(prefix in topic(), rest in topic()) {
            let filter = format!("{prefix}/#");
            prop_assert!(matches(&filter, &prefix));
            let extended = format!("{prefix}/{rest}");
            prop_assert!(matches(&filter, &extended));
        }

        /// Property: the validated filter agrees with the raw walk.
        #[test]
        fn parsed_filter_agrees_with_raw_walk(t in topic(), wild in 0usize..6) {
            let segments: Vec<&str> = t.split('/').collect();
            let mut pattern: Vec<String> = segments.iter().map(|s| s.to_string()).collect();
            let idx = wild % pattern.len();
            pattern[idx] = "+".to_string();
            let pattern = pattern.join("/");
            let parsed = TopicFilter::parse(pattern.clone()).unwrap();
            prop_assert_eq!(parsed.matches(&t), matches(&pattern, &t));
            prop_assert!(parsed.matches(&t));
        }
    }
}
