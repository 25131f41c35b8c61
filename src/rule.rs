//! Assertion rules
//!
//! A rule compares one captured [`Field`] against one or more expected values.
//! The comparison itself lives in [`Comparator`]; what differs between fields
//! is only how the actual and expected values are normalized before comparing,
//! so the error field plugs in the [`ErrorMessage`] normalizer instead of
//! subclassing anything.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use similar::TextDiff;

use crate::error::HarnessError;
use crate::launch::LaunchError;
use crate::state::ProcessResult;

/// A captured attribute of the process outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Stdout,
    Stderr,
    /// Exit code
    Code,
    /// Launch error
    Error,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Stdout => "stdout",
            Field::Stderr => "stderr",
            Field::Code => "code",
            Field::Error => "error",
        }
    }

    fn actual(self, result: &ProcessResult) -> Actual<'_> {
        match self {
            Field::Stdout => Actual::Text(Cow::Borrowed(&result.stdout)),
            Field::Stderr => Actual::Text(Cow::Borrowed(&result.stderr)),
            Field::Code => result.code.map_or(Actual::Absent, Actual::Code),
            Field::Error => result.error.as_ref().map_or(Actual::Absent, Actual::Error),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Field::Stdout),
            "stderr" => Ok(Field::Stderr),
            "code" | "exit-code" => Ok(Field::Code),
            "error" => Ok(Field::Error),
            other => Err(HarnessError::usage(
                &format!("field {:?}", other),
                "one of stdout, stderr, code, error",
            )),
        }
    }
}

// ──────────────────────────────────────────────────────────
// Expected values
// ──────────────────────────────────────────────────────────

/// One expected value
#[derive(Debug, Clone)]
pub enum Expected {
    Text(String),
    Code(i32),
    Pattern(Regex),
    /// An error-like value, carried as its message
    Error(String),
    /// The field holds nothing (no exit code, no launch error)
    Absent,
}

impl Expected {
    /// An error-like expectation, compared on its message only.
    pub fn error(err: impl fmt::Display) -> Self {
        Expected::Error(err.to_string())
    }

    /// Compile `pattern` into a pattern expectation.
    pub fn pattern(pattern: &str) -> Result<Self, HarnessError> {
        compile_regex(pattern).map(Expected::Pattern)
    }

    fn render(&self) -> String {
        match self {
            Expected::Text(s) => format!("{:?}", s),
            Expected::Code(n) => n.to_string(),
            Expected::Pattern(re) => format!("/{}/", re.as_str()),
            Expected::Error(msg) => format!("Error({:?})", msg),
            Expected::Absent => "<absent>".to_string(),
        }
    }
}

impl From<&str> for Expected {
    fn from(s: &str) -> Self {
        Expected::Text(s.to_string())
    }
}

impl From<String> for Expected {
    fn from(s: String) -> Self {
        Expected::Text(s)
    }
}

impl From<&String> for Expected {
    fn from(s: &String) -> Self {
        Expected::Text(s.clone())
    }
}

impl From<i32> for Expected {
    fn from(n: i32) -> Self {
        Expected::Code(n)
    }
}

impl From<Regex> for Expected {
    fn from(re: Regex) -> Self {
        Expected::Pattern(re)
    }
}

impl From<&Regex> for Expected {
    fn from(re: &Regex) -> Self {
        Expected::Pattern(re.clone())
    }
}

impl From<LaunchError> for Expected {
    fn from(err: LaunchError) -> Self {
        Expected::Error(err.message)
    }
}

impl From<std::io::Error> for Expected {
    fn from(err: std::io::Error) -> Self {
        Expected::error(err)
    }
}

/// A conjunction of expected values: every one of them must hold
#[derive(Debug, Clone)]
pub struct Expectation(Vec<Expected>);

impl Expectation {
    pub fn values(&self) -> &[Expected] {
        &self.0
    }

    /// Parse an expectation from text, as given on the command line.
    ///
    /// - `/re/` is a pattern
    /// - `none` is an absent value
    /// - for `code`, an integer
    /// - anything else is literal text, with `\n`, `\t`, `\r`, `\\` unescaped
    pub fn parse(field: Field, raw: &str) -> Result<Self, HarnessError> {
        if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
            return Expected::pattern(&raw[1..raw.len() - 1]).map(Expectation::from);
        }
        if raw == "none" {
            return Ok(Expected::Absent.into());
        }
        match field {
            Field::Code => raw
                .trim()
                .parse::<i32>()
                .map(Expectation::from)
                .map_err(|_| HarnessError::usage(&format!("exit code {:?}", raw), "an integer, none or /re/")),
            _ => Ok(Expected::Text(unescape(raw)).into()),
        }
    }
}

impl From<Expected> for Expectation {
    fn from(e: Expected) -> Self {
        Expectation(vec![e])
    }
}

impl From<&str> for Expectation {
    fn from(s: &str) -> Self {
        Expected::from(s).into()
    }
}

impl From<String> for Expectation {
    fn from(s: String) -> Self {
        Expected::from(s).into()
    }
}

impl From<i32> for Expectation {
    fn from(n: i32) -> Self {
        Expected::from(n).into()
    }
}

impl From<Regex> for Expectation {
    fn from(re: Regex) -> Self {
        Expected::from(re).into()
    }
}

impl From<LaunchError> for Expectation {
    fn from(err: LaunchError) -> Self {
        Expected::from(err).into()
    }
}

impl From<std::io::Error> for Expectation {
    fn from(err: std::io::Error) -> Self {
        Expected::from(err).into()
    }
}

impl<E: Into<Expected>> From<Vec<E>> for Expectation {
    fn from(list: Vec<E>) -> Self {
        Expectation(list.into_iter().map(Into::into).collect())
    }
}

impl<E: Into<Expected>, const N: usize> From<[E; N]> for Expectation {
    fn from(list: [E; N]) -> Self {
        Expectation(list.into_iter().map(Into::into).collect())
    }
}

// ──────────────────────────────────────────────────────────
// Actual values and normalization
// ──────────────────────────────────────────────────────────

/// A captured value as seen by a comparator
#[derive(Debug)]
pub(crate) enum Actual<'a> {
    Text(Cow<'a, str>),
    Code(i32),
    Error(&'a LaunchError),
    Absent,
}

impl Actual<'_> {
    /// Text coercion for pattern matching. Absent values never match.
    fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Actual::Text(s) => Some(Cow::Borrowed(&**s)),
            Actual::Code(n) => Some(Cow::Owned(n.to_string())),
            Actual::Error(e) => Some(Cow::Borrowed(e.message())),
            Actual::Absent => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Actual::Text(s) => format!("{:?}", s),
            Actual::Code(n) => n.to_string(),
            Actual::Error(e) => format!("LaunchError({:?})", e.message()),
            Actual::Absent => "<absent>".to_string(),
        }
    }
}

fn strict_equal(actual: &Actual<'_>, expected: &Expected) -> bool {
    match (actual, expected) {
        (Actual::Text(a), Expected::Text(e)) => &**a == e.as_str(),
        (Actual::Code(a), Expected::Code(e)) => a == e,
        (Actual::Absent, Expected::Absent) => true,
        _ => false,
    }
}

/// Hook applied to both sides before comparing
pub(crate) trait Normalize {
    fn actual<'a>(&self, actual: Actual<'a>) -> Actual<'a>;
    fn expected<'e>(&self, expected: &'e Expected) -> Cow<'e, Expected>;
}

/// Compare values as captured
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Raw;

impl Normalize for Raw {
    fn actual<'a>(&self, actual: Actual<'a>) -> Actual<'a> {
        actual
    }

    fn expected<'e>(&self, expected: &'e Expected) -> Cow<'e, Expected> {
        Cow::Borrowed(expected)
    }
}

/// Reduce errors on either side to their message text
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ErrorMessage;

impl Normalize for ErrorMessage {
    fn actual<'a>(&self, actual: Actual<'a>) -> Actual<'a> {
        match actual {
            Actual::Error(e) => Actual::Text(Cow::Borrowed(e.message())),
            other => other,
        }
    }

    fn expected<'e>(&self, expected: &'e Expected) -> Cow<'e, Expected> {
        match expected {
            Expected::Error(msg) => Cow::Owned(Expected::Text(msg.clone())),
            other => Cow::Borrowed(other),
        }
    }
}

/// Strict-equality / pattern comparator over one field
#[derive(Debug, Clone)]
pub(crate) struct Comparator<N> {
    field: Field,
    expected: Vec<Expected>,
    negated: bool,
    normalize: N,
}

impl<N: Normalize> Comparator<N> {
    fn new(field: Field, expectation: Expectation, negated: bool, normalize: N) -> Self {
        Self {
            field,
            expected: expectation.0,
            negated,
            normalize,
        }
    }

    fn validate(&self, result: &ProcessResult) -> Result<(), HarnessError> {
        for expected in &self.expected {
            let actual = self.normalize.actual(self.field.actual(result));
            let expected = self.normalize.expected(expected);
            self.check(&actual, &expected)?;
        }
        Ok(())
    }

    fn check(&self, actual: &Actual<'_>, expected: &Expected) -> Result<(), HarnessError> {
        if let Expected::Pattern(re) = expected {
            let matched = actual.as_text().map_or(false, |text| re.is_match(&text));
            if matched != self.negated {
                return Ok(());
            }
            let verb = if self.negated { "not to match" } else { "to match" };
            let message = format!("Expected {} {} {}", expected.render(), verb, actual.render());
            return Err(self.failure(message, actual, expected));
        }

        if strict_equal(actual, expected) != self.negated {
            return Ok(());
        }

        let message = if self.negated {
            format!(
                "Expected \"actual\" to be strictly unequal to: {}",
                expected.render()
            )
        } else {
            let mut msg = format!(
                "Expected values to be strictly equal:\n\n{} !== {}\n",
                actual.render(),
                expected.render()
            );
            if let (Actual::Text(a), Expected::Text(e)) = (actual, expected) {
                if a.contains('\n') || e.contains('\n') {
                    let diff = TextDiff::from_lines(e.as_str(), &**a);
                    msg.push_str(&format!(
                        "\n{}",
                        diff.unified_diff().header("expected", "actual")
                    ));
                }
            }
            msg
        };
        Err(self.failure(message, actual, expected))
    }

    fn failure(&self, message: String, actual: &Actual<'_>, expected: &Expected) -> HarnessError {
        HarnessError::assertion(self.field, message)
            .with_values(actual.render(), expected.render())
            .negated(self.negated)
    }
}

/// A registered expectation, with its comparator picked by field
#[derive(Debug, Clone)]
pub(crate) enum Rule {
    Plain(Comparator<Raw>),
    Error(Comparator<ErrorMessage>),
}

impl Rule {
    pub(crate) fn new(field: Field, expectation: Expectation, negated: bool) -> Self {
        match field {
            Field::Stdout | Field::Stderr | Field::Code => {
                Rule::Plain(Comparator::new(field, expectation, negated, Raw))
            }
            Field::Error => Rule::Error(Comparator::new(field, expectation, negated, ErrorMessage)),
        }
    }

    pub(crate) fn field(&self) -> Field {
        match self {
            Rule::Plain(c) => c.field,
            Rule::Error(c) => c.field,
        }
    }

    pub(crate) fn validate(&self, result: &ProcessResult) -> Result<(), HarnessError> {
        match self {
            Rule::Plain(c) => c.validate(result),
            Rule::Error(c) => c.validate(result),
        }
    }
}

// ──────────────────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────────────────

/// Compile a regex with a size limit to keep hostile patterns cheap.
pub(crate) fn compile_regex(pattern: &str) -> Result<Regex, HarnessError> {
    regex::RegexBuilder::new(pattern)
        .size_limit(1 << 20)
        .build()
        .map_err(|e| HarnessError::usage(&format!("pattern /{}/", pattern), &format!("a valid regex ({})", e)))
}

/// Interpret `\n`, `\t`, `\r`, `\\` and `\0`; unknown escapes are kept as-is.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(stdout: &str, code: Option<i32>) -> ProcessResult {
        ProcessResult {
            stdout: stdout.to_string(),
            stderr: String::new(),
            code,
            error: None,
        }
    }

    fn rule(field: Field, e: impl Into<Expectation>) -> Rule {
        Rule::new(field, e.into(), false)
    }

    fn not_rule(field: Field, e: impl Into<Expectation>) -> Rule {
        Rule::new(field, e.into(), true)
    }

    fn re(p: &str) -> Regex {
        Regex::new(p).unwrap()
    }

    #[test]
    fn test_text_equality() {
        let r = result("write to stdout", Some(0));
        assert!(rule(Field::Stdout, "write to stdout").validate(&r).is_ok());
        let err = rule(Field::Stdout, "__write to stdout__").validate(&r).unwrap_err();
        assert!(err.is_assertion());
        assert_eq!(err.name(), "AssertionError");
        assert_eq!(err.field, Some(Field::Stdout));
    }

    #[test]
    fn test_code_equality_is_strict() {
        let r = result("0", Some(0));
        assert!(rule(Field::Code, 0).validate(&r).is_ok());
        // text "0" is not the integer 0
        assert!(rule(Field::Stdout, 0).validate(&r).is_err());
        assert!(rule(Field::Code, "0").validate(&r).is_err());
    }

    #[test]
    fn test_negated_equality() {
        let r = result("", Some(0));
        assert!(not_rule(Field::Code, 1).validate(&r).is_ok());
        let err = not_rule(Field::Code, 0).validate(&r).unwrap_err();
        assert!(err.negated);
        assert!(err.message.contains("strictly unequal"));
    }

    #[test]
    fn test_list_is_conjunction() {
        let r = result("write to stdout", Some(0));
        assert!(rule(Field::Stdout, [re("write"), re("to stdout")]).validate(&r).is_ok());
        assert!(rule(Field::Stdout, [re("write"), re("to stderr")]).validate(&r).is_err());
    }

    #[test]
    fn test_negation_applies_per_element() {
        let r = result("write to stdout", Some(0));
        // neither pattern matches: passes
        assert!(not_rule(Field::Stdout, [re("foo"), re("bar")]).validate(&r).is_ok());
        // one pattern matches: the whole rule fails
        let err = not_rule(Field::Stdout, [re("foo"), re("write")]).validate(&r).unwrap_err();
        assert!(err.message.contains("not to match"));
    }

    #[test]
    fn test_pattern_matches_code_as_text() {
        let r = result("", Some(127));
        assert!(rule(Field::Code, re("^12")).validate(&r).is_ok());
    }

    #[test]
    fn test_absent_never_matches_pattern() {
        let r = result("", None);
        assert!(rule(Field::Error, re(".*")).validate(&r).is_err());
        assert!(not_rule(Field::Error, re("ENOENT")).validate(&r).is_ok());
        assert!(rule(Field::Code, Expected::Absent).validate(&r).is_ok());
    }

    #[test]
    fn test_error_rule_compares_messages() {
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        let launch = LaunchError::spawn("/x/unknown.sh", &io);
        let r = ProcessResult {
            error: Some(launch.clone()),
            ..result("", None)
        };

        assert!(rule(Field::Error, re("ENOENT")).validate(&r).is_ok());
        assert!(rule(Field::Error, "spawn /x/unknown.sh ENOENT").validate(&r).is_ok());
        assert!(rule(Field::Error, launch).validate(&r).is_ok());
        assert!(rule(Field::Error, Expected::error("spawn /x/unknown.sh ENOENT")).validate(&r).is_ok());

        let other = LaunchError::timeout(Duration::from_millis(10));
        assert!(rule(Field::Error, other).validate(&r).is_err());
    }

    #[test]
    fn test_error_like_value_on_plain_field_never_equal() {
        let r = result("boom", Some(0));
        assert!(rule(Field::Stdout, Expected::error("boom")).validate(&r).is_err());
    }

    #[test]
    fn test_multiline_mismatch_has_diff() {
        let r = result("a\nb\nc\n", Some(0));
        let err = rule(Field::Stdout, "a\nB\nc\n").validate(&r).unwrap_err();
        assert!(err.message.contains("--- expected"));
        assert!(err.message.contains("+b"));
    }

    #[test]
    fn test_field_from_str() {
        assert_eq!("stdout".parse::<Field>().unwrap(), Field::Stdout);
        assert_eq!("exit-code".parse::<Field>().unwrap(), Field::Code);
        let err = "stdin".parse::<Field>().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Usage);
    }

    #[test]
    fn test_parse_expectation() {
        let e = Expectation::parse(Field::Stdout, "/wri+te/").unwrap();
        assert!(matches!(e.values()[0], Expected::Pattern(_)));

        let e = Expectation::parse(Field::Code, "3").unwrap();
        assert!(matches!(e.values()[0], Expected::Code(3)));

        let e = Expectation::parse(Field::Stdout, "1\\n2").unwrap();
        assert!(matches!(&e.values()[0], Expected::Text(s) if s == "1\n2"));

        let e = Expectation::parse(Field::Error, "none").unwrap();
        assert!(matches!(e.values()[0], Expected::Absent));

        assert!(Expectation::parse(Field::Code, "zero").is_err());
        assert!(Expectation::parse(Field::Stdout, "/(/").is_err());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"a\tb\\c\q"), "a\tb\\c\\q");
        assert_eq!(unescape(r"trailing\"), "trailing\\");
    }
}
