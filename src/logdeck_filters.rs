//! Multi-dimensional display filtering: level set, free-text/regex search,
//! file and line-range membership, and required predicate checks.

use std::collections::{BTreeSet, HashMap};

use regex::{Regex, RegexBuilder};
use thiserror::Error;

use crate::logdeck_checks::{CheckRegistry, ResultCache};
use crate::logdeck_core::{Level, LogEntry};

/// Inclusive 1-based line span within a selected file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn contains(&self, line: u32) -> bool {
        line >= self.start && line <= self.end
    }
}

/// Current display predicate configuration. Pure: never mutates entries or
/// checks.
#[derive(Clone, Debug)]
pub struct FilterState {
    pub levels: BTreeSet<Level>,
    pub query: String,
    pub query_is_regex: bool,
    pub files: BTreeSet<String>,
    pub line_ranges: HashMap<String, Vec<LineRange>>,
    pub required_checks: BTreeSet<u64>,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            levels: Level::ALL.into_iter().collect(),
            query: String::new(),
            query_is_regex: false,
            files: BTreeSet::new(),
            line_ranges: HashMap::new(),
            required_checks: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid regex pattern `{pattern}`: {message}")]
    InvalidRegex { pattern: String, message: String },
}

/// Compiled search term. Substring matching is case-insensitive; regex
/// patterns match exactly as the user wrote them.
#[derive(Clone, Debug)]
pub enum QueryMatcher {
    Substring(String),
    Regex(Regex),
}

impl QueryMatcher {
    /// Substring matching and highlighting share one case-folded scan, so
    /// a match always carries its highlight ranges.
    pub fn is_match(&self, text: &str) -> bool {
        match self {
            QueryMatcher::Substring(_) => !self.find_ranges(text).is_empty(),
            QueryMatcher::Regex(regex) => regex.is_match(text),
        }
    }

    /// Non-overlapping leftmost match byte ranges, used by the search
    /// highlight pass.
    pub fn find_ranges(&self, text: &str) -> Vec<(usize, usize)> {
        match self {
            QueryMatcher::Substring(needle) => {
                let needle_chars: Vec<char> = needle.chars().collect();
                if needle_chars.is_empty() {
                    return Vec::new();
                }
                let chars: Vec<(usize, char)> = text.char_indices().collect();
                let mut ranges = Vec::new();
                let mut idx = 0;
                while idx + needle_chars.len() <= chars.len() {
                    let hit = needle_chars
                        .iter()
                        .enumerate()
                        .all(|(off, nc)| chars[idx + off].1.to_lowercase().eq(nc.to_lowercase()));
                    if hit {
                        let start = chars[idx].0;
                        let end_idx = idx + needle_chars.len();
                        let end =
                            chars.get(end_idx).map(|(pos, _)| *pos).unwrap_or(text.len());
                        ranges.push((start, end));
                        idx = end_idx;
                    } else {
                        idx += 1;
                    }
                }
                ranges
            }
            QueryMatcher::Regex(regex) => {
                regex.find_iter(text).map(|found| (found.start(), found.end())).collect()
            }
        }
    }
}

impl FilterState {
    /// Compiles the search term. `Ok(None)` means no active query; an
    /// invalid regex is reported so callers can fail closed with a visible
    /// input-state indicator.
    pub fn compile_query(&self) -> Result<Option<QueryMatcher>, FilterError> {
        let query = self.query.trim();
        if query.is_empty() {
            return Ok(None);
        }
        if self.query_is_regex {
            let pattern = strip_regex_delimiters(query).unwrap_or(query);
            return Ok(Some(QueryMatcher::Regex(compile_regex(pattern)?)));
        }
        Ok(Some(QueryMatcher::Substring(query.to_lowercase())))
    }
}

fn strip_regex_delimiters(query: &str) -> Option<&str> {
    query.strip_prefix('/').and_then(|inner| inner.strip_suffix('/'))
}

fn compile_regex(pattern: &str) -> Result<Regex, FilterError> {
    RegexBuilder::new(pattern).build().map_err(|error| FilterError::InvalidRegex {
        pattern: pattern.to_string(),
        message: error.to_string(),
    })
}

/// Filter state plus its compiled query, kept in sync by `set_query`. An
/// invalid regex leaves `query_error` set and fails every match (closed).
#[derive(Debug, Default)]
pub struct FilterPipeline {
    pub state: FilterState,
    matcher: Option<QueryMatcher>,
    query_error: Option<String>,
}

impl FilterPipeline {
    pub fn new(state: FilterState) -> Self {
        let mut pipeline = Self { state, matcher: None, query_error: None };
        pipeline.recompile();
        pipeline
    }

    pub fn set_query(&mut self, query: &str) {
        self.state.query = query.to_string();
        self.recompile();
    }

    pub fn set_regex_mode(&mut self, regex: bool) {
        self.state.query_is_regex = regex;
        self.recompile();
    }

    pub fn matcher(&self) -> Option<&QueryMatcher> {
        self.matcher.as_ref()
    }

    pub fn query_error(&self) -> Option<&str> {
        self.query_error.as_deref()
    }

    fn recompile(&mut self) {
        match self.state.compile_query() {
            Ok(matcher) => {
                self.matcher = matcher;
                self.query_error = None;
            }
            Err(error) => {
                self.matcher = None;
                self.query_error = Some(error.to_string());
            }
        }
    }

    /// The composed display test, evaluated cheapest dimension first:
    /// level, text, file/line-range, required checks.
    ///
    /// `search_text` is the entry's fully rendered argument text. Check
    /// evaluation goes through the shared cache, so chips already rendered
    /// for this entry make stage four free.
    pub fn should_display(
        &self,
        entry: &LogEntry,
        search_text: &str,
        registry: &mut CheckRegistry,
        cache: &mut ResultCache,
    ) -> bool {
        if !self.state.levels.contains(&entry.level) {
            return false;
        }

        if !self.state.query.trim().is_empty() {
            match &self.matcher {
                Some(matcher) => {
                    if !matcher.is_match(search_text) {
                        return false;
                    }
                }
                // Invalid regex: fail closed rather than throw into the
                // render path.
                None => return false,
            }
        }

        if !self.state.files.is_empty() {
            let Some(origin) = entry.origin_parts() else {
                return false;
            };
            if !self.state.files.contains(&origin.file) {
                return false;
            }
            if let Some(ranges) = self.state.line_ranges.get(&origin.file) {
                if !ranges.is_empty() && !ranges.iter().any(|range| range.contains(origin.line))
                {
                    return false;
                }
            }
        }

        self.state
            .required_checks
            .iter()
            .all(|check_id| registry.run_check(*check_id, entry, cache).passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::{fixture, rstest};
    use serde_json::json;

    fn entry(level: Level, origin: Option<&str>, text: &str) -> LogEntry {
        LogEntry {
            id: 1,
            level,
            timestamp: Utc::now(),
            origin: origin.map(str::to_string),
            args: vec![json!(text)],
            bound_data: serde_json::Map::new(),
            is_new: false,
        }
    }

    fn passes(pipeline: &FilterPipeline, entry: &LogEntry, text: &str) -> bool {
        let mut registry = CheckRegistry::default();
        let mut cache = ResultCache::default();
        pipeline.should_display(entry, text, &mut registry, &mut cache)
    }

    #[fixture]
    fn pipeline() -> FilterPipeline {
        FilterPipeline::default()
    }

    #[rstest]
    fn default_state_displays_everything(pipeline: FilterPipeline) {
        let entry = entry(Level::Silly, None, "anything");
        assert!(passes(&pipeline, &entry, "anything"));
    }

    #[rstest]
    fn level_membership_gates_first(mut pipeline: FilterPipeline) {
        pipeline.state.levels.remove(&Level::Debug);
        let shown = entry(Level::Info, None, "text");
        let hidden = entry(Level::Debug, None, "text");
        assert!(passes(&pipeline, &shown, "text"));
        assert!(!passes(&pipeline, &hidden, "text"));
    }

    #[rstest]
    fn substring_search_is_case_insensitive(mut pipeline: FilterPipeline) {
        pipeline.set_query("ERROR");
        let hit = entry(Level::Info, None, "error 1");
        let miss = entry(Level::Info, None, "warn 2");
        assert!(passes(&pipeline, &hit, "error 1"));
        assert!(!passes(&pipeline, &miss, "warn 2"));
    }

    #[rstest]
    fn regex_search_matches_as_written(mut pipeline: FilterPipeline) {
        pipeline.set_regex_mode(true);
        pipeline.set_query("err(or)?\\s+\\d");
        let hit = entry(Level::Info, None, "error 1");
        assert!(passes(&pipeline, &hit, "error 1"));
        assert!(pipeline.query_error().is_none());
    }

    #[rstest]
    fn invalid_regex_fails_closed_with_error(mut pipeline: FilterPipeline) {
        pipeline.set_regex_mode(true);
        pipeline.set_query("[unclosed");
        let entry = entry(Level::Info, None, "anything");
        assert!(!passes(&pipeline, &entry, "anything"));
        assert!(pipeline.query_error().is_some());

        // Back to a valid pattern clears the indicator.
        pipeline.set_query("any");
        assert!(pipeline.query_error().is_none());
        assert!(passes(&pipeline, &entry, "anything"));
    }

    #[rstest]
    fn file_selection_requires_origin_membership(mut pipeline: FilterPipeline) {
        pipeline.state.files.insert("src/app.js".to_string());
        let inside = entry(Level::Info, Some("src/app.js:10"), "x");
        let outside = entry(Level::Info, Some("src/db.js:10"), "x");
        let missing = entry(Level::Info, None, "x");
        assert!(passes(&pipeline, &inside, "x"));
        assert!(!passes(&pipeline, &outside, "x"));
        assert!(!passes(&pipeline, &missing, "x"));
    }

    #[rstest]
    fn line_ranges_are_inclusive(mut pipeline: FilterPipeline) {
        pipeline.state.files.insert("src/app.js".to_string());
        pipeline.state.line_ranges.insert(
            "src/app.js".to_string(),
            vec![LineRange { start: 10, end: 20 }, LineRange { start: 40, end: 40 }],
        );
        for (line, expected) in [(9, false), (10, true), (20, true), (21, false), (40, true)] {
            let entry = entry(Level::Info, Some(&format!("src/app.js:{line}")), "x");
            assert_eq!(passes(&pipeline, &entry, "x"), expected, "line {line}");
        }
    }

    #[rstest]
    fn empty_range_list_admits_all_lines(mut pipeline: FilterPipeline) {
        pipeline.state.files.insert("src/app.js".to_string());
        pipeline.state.line_ranges.insert("src/app.js".to_string(), Vec::new());
        let entry = entry(Level::Info, Some("src/app.js:9999"), "x");
        assert!(passes(&pipeline, &entry, "x"));
    }

    #[rstest]
    fn required_checks_must_all_pass(mut pipeline: FilterPipeline) {
        let mut registry = CheckRegistry::default();
        let mut cache = ResultCache::default();
        let passing = registry.add("yes", "true").expect("add");
        let failing = registry.add("no", "false").expect("add");

        let entry = entry(Level::Info, None, "x");
        pipeline.state.required_checks.insert(passing);
        assert!(pipeline.should_display(&entry, "x", &mut registry, &mut cache));

        pipeline.state.required_checks.insert(failing);
        assert!(!pipeline.should_display(&entry, "x", &mut registry, &mut cache));
    }

    #[rstest]
    fn disabling_a_level_never_admits_new_entries(mut pipeline: FilterPipeline) {
        // Monotonicity: matches with the smaller level set are a subset.
        pipeline.set_query("err");
        let entries: Vec<LogEntry> = [
            (Level::Error, "error 1"),
            (Level::Warn, "err warn"),
            (Level::Info, "clean"),
        ]
        .into_iter()
        .map(|(level, text)| entry(level, None, text))
        .collect();

        let texts = ["error 1", "err warn", "clean"];
        let before: Vec<bool> = entries
            .iter()
            .zip(texts)
            .map(|(entry, text)| passes(&pipeline, entry, text))
            .collect();

        pipeline.state.levels.remove(&Level::Warn);
        let after: Vec<bool> = entries
            .iter()
            .zip(texts)
            .map(|(entry, text)| passes(&pipeline, entry, text))
            .collect();

        for (was, is) in before.iter().zip(after.iter()) {
            assert!(!is || *was, "filter tightened, result widened");
        }
    }

    #[rstest]
    #[case("error", "big ERROR here", vec![(4, 9)])]
    #[case("o", "foo bar", vec![(1, 2), (2, 3)])]
    #[case("zz", "foo", vec![])]
    fn substring_ranges_are_leftmost_nonoverlapping(
        #[case] needle: &str,
        #[case] haystack: &str,
        #[case] expected: Vec<(usize, usize)>,
    ) {
        let matcher = QueryMatcher::Substring(needle.to_lowercase());
        assert_eq!(matcher.find_ranges(haystack), expected);
    }

    #[test]
    fn unicode_case_folds_the_same_for_match_and_highlight() {
        let matcher = QueryMatcher::Substring("école".to_lowercase());
        let text = "ÉCOLE ouverte";
        assert!(matcher.is_match(text));
        assert_eq!(matcher.find_ranges(text), vec![(0, 6)]);
    }

    #[test]
    fn regex_mode_strips_slash_delimiters() {
        let mut pipeline = FilterPipeline::default();
        pipeline.set_regex_mode(true);
        pipeline.set_query("/^abc$/");
        let entry = entry(Level::Info, None, "abc");
        assert!(passes(&pipeline, &entry, "abc"));
    }
}
