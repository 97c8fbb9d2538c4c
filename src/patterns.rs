// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Routing Patterns
//!
//! Builders for topic exchange binding keys. Segments are joined with `.`; `*` matches
//! exactly one segment and `#` matches zero or more trailing segments.

use crate::errors::AmqpError;

/// Wildcard matching exactly one segment.
pub const SINGLE_WORD: &str = "*";
/// Wildcard matching zero or more segments.
pub const MULTIPLE_WORDS: &str = "#";
/// Segment separator.
pub const SEPARATOR: &str = ".";

pub struct TopicPatternBuilder;

impl TopicPatternBuilder {
    /// Replaces the segment at `position` (0-based) with `*`.
    ///
    /// An out-of-range position leaves every segment unchanged;
    /// [`TopicPatternBuilder::try_exact_position`] rejects it instead.
    pub fn exact_position<S: AsRef<str>>(parts: &[S], position: usize) -> String {
        parts
            .iter()
            .enumerate()
            .map(|(index, part)| {
                if index == position {
                    SINGLE_WORD
                } else {
                    part.as_ref()
                }
            })
            .collect::<Vec<_>>()
            .join(SEPARATOR)
    }

    /// Keeps the segments before `start_position` and appends `#`.
    ///
    /// A start position past the end keeps every segment.
    pub fn anything_after<S: AsRef<str>>(parts: &[S], start_position: usize) -> String {
        let end = start_position.min(parts.len());

        parts[..end]
            .iter()
            .map(|part| part.as_ref())
            .chain(std::iter::once(MULTIPLE_WORDS))
            .collect::<Vec<_>>()
            .join(SEPARATOR)
    }

    /// `<service>.#`, or `<service>.<event_type>.#`. An empty event type counts as none.
    pub fn service_events(service: &str, event_type: Option<&str>) -> String {
        match event_type.filter(|event_type| !event_type.is_empty()) {
            Some(event_type) => format!("{service}.{event_type}.{MULTIPLE_WORDS}"),
            None => format!("{service}.{MULTIPLE_WORDS}"),
        }
    }

    /// `*.<entity>.*`, or `*.<entity>.<action>`. An empty action counts as none.
    pub fn entity_events(entity: &str, action: Option<&str>) -> String {
        match action.filter(|action| !action.is_empty()) {
            Some(action) => format!("{SINGLE_WORD}.{entity}.{action}"),
            None => format!("{SINGLE_WORD}.{entity}.{SINGLE_WORD}"),
        }
    }

    /// Like [`TopicPatternBuilder::exact_position`], failing when `position` does not
    /// name a segment.
    pub fn try_exact_position<S: AsRef<str>>(
        parts: &[S],
        position: usize,
    ) -> Result<String, AmqpError> {
        if position >= parts.len() {
            return Err(AmqpError::InvalidPattern(format!(
                "position {} is out of range for {} segments",
                position,
                parts.len()
            )));
        }

        Ok(Self::exact_position(parts, position))
    }

    /// Like [`TopicPatternBuilder::anything_after`], failing when `start_position` is
    /// past the last segment.
    pub fn try_anything_after<S: AsRef<str>>(
        parts: &[S],
        start_position: usize,
    ) -> Result<String, AmqpError> {
        if start_position > parts.len() {
            return Err(AmqpError::InvalidPattern(format!(
                "start position {} is out of range for {} segments",
                start_position,
                parts.len()
            )));
        }

        Ok(Self::anything_after(parts, start_position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_position_replaces_one_segment() {
        assert_eq!(TopicPatternBuilder::exact_position(&["a", "b", "c"], 1), "a.*.c");
        assert_eq!(TopicPatternBuilder::exact_position(&["a", "b", "c"], 0), "*.b.c");
    }

    #[test]
    fn exact_position_out_of_range_is_unchanged() {
        assert_eq!(TopicPatternBuilder::exact_position(&["a", "b", "c"], 3), "a.b.c");
        assert!(matches!(
            TopicPatternBuilder::try_exact_position(&["a", "b", "c"], 3),
            Err(AmqpError::InvalidPattern(_))
        ));
        assert_eq!(
            TopicPatternBuilder::try_exact_position(&["a", "b", "c"], 2).unwrap(),
            "a.b.*"
        );
    }

    #[test]
    fn anything_after_keeps_prefix() {
        assert_eq!(TopicPatternBuilder::anything_after(&["a", "b", "c"], 1), "a.#");
        assert_eq!(TopicPatternBuilder::anything_after(&["a", "b", "c"], 0), "#");
        assert_eq!(TopicPatternBuilder::anything_after(&["a", "b", "c"], 3), "a.b.c.#");
    }

    #[test]
    fn anything_after_out_of_range() {
        assert_eq!(TopicPatternBuilder::anything_after(&["a", "b"], 5), "a.b.#");
        assert!(TopicPatternBuilder::try_anything_after(&["a", "b"], 2).is_ok());
        assert!(matches!(
            TopicPatternBuilder::try_anything_after(&["a", "b"], 3),
            Err(AmqpError::InvalidPattern(_))
        ));
    }

    #[test]
    fn service_and_entity_events() {
        assert_eq!(TopicPatternBuilder::service_events("orders", None), "orders.#");
        assert_eq!(
            TopicPatternBuilder::service_events("orders", Some("created")),
            "orders.created.#"
        );
        assert_eq!(TopicPatternBuilder::entity_events("user", None), "*.user.*");
        assert_eq!(
            TopicPatternBuilder::entity_events("user", Some("deleted")),
            "*.user.deleted"
        );
    }

    #[test]
    fn empty_event_type_and_action_are_omitted() {
        assert_eq!(TopicPatternBuilder::service_events("orders", Some("")), "orders.#");
        assert_eq!(TopicPatternBuilder::entity_events("user", Some("")), "*.user.*");
    }

    #[test]
    fn accepts_owned_segments() {
        let parts = vec!["billing".to_owned(), "invoice".to_owned(), "paid".to_owned()];
        assert_eq!(
            TopicPatternBuilder::exact_position(&parts, 2),
            "billing.invoice.*"
        );
    }
}
