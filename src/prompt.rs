//! Interactive prompt driver
//!
//! Scans the child's stdout for a queue of questions and writes the paired
//! answer (plus a newline) to its stdin whenever the current question shows
//! up. Once the last answer is written the driver reports
//! [`Progress::Exhausted`] and stays inert; the controller then closes stdin.

use std::collections::VecDeque;
use std::io::{self, Write};

use regex::Regex;
use tracing::debug;

/// What the driver waits for
#[derive(Debug, Clone)]
pub enum Question {
    /// Output (trimmed and accumulated) must end with this text
    Text(String),
    /// Accumulated output must match this pattern anywhere
    Pattern(Regex),
}

impl Question {
    fn matches(&self, buf: &str) -> bool {
        match self {
            Question::Text(q) => buf.ends_with(q.as_str()),
            Question::Pattern(re) => re.is_match(buf),
        }
    }
}

impl From<&str> for Question {
    fn from(s: &str) -> Self {
        Question::Text(s.to_string())
    }
}

impl From<String> for Question {
    fn from(s: String) -> Self {
        Question::Text(s)
    }
}

impl From<Regex> for Question {
    fn from(re: Regex) -> Self {
        Question::Pattern(re)
    }
}

/// A question and the answer to send back
#[derive(Debug, Clone)]
pub struct Prompt {
    pub question: Question,
    pub answer: String,
}

impl Prompt {
    pub fn new(question: impl Into<Question>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// One prompt or a list of them
#[derive(Debug, Clone, Default)]
pub struct Prompts(pub Vec<Prompt>);

impl From<Prompt> for Prompts {
    fn from(p: Prompt) -> Self {
        Prompts(vec![p])
    }
}

impl From<Vec<Prompt>> for Prompts {
    fn from(list: Vec<Prompt>) -> Self {
        Prompts(list)
    }
}

impl<const N: usize> From<[Prompt; N]> for Prompts {
    fn from(list: [Prompt; N]) -> Self {
        Prompts(list.into())
    }
}

/// Result of feeding one output chunk to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Current question not seen yet
    Waiting,
    /// An answer was written, more questions remain
    Answered,
    /// The last answer was written; close stdin and detach
    Exhausted,
}

/// Stateful question/answer scanner
#[derive(Debug)]
pub struct PromptDriver {
    queue: VecDeque<Prompt>,
    current: Option<Prompt>,
    buf: String,
    exhausted: bool,
}

impl PromptDriver {
    pub fn new(prompts: impl IntoIterator<Item = Prompt>) -> Self {
        let queue: VecDeque<Prompt> = prompts.into_iter().collect();
        let exhausted = queue.is_empty();
        Self {
            queue,
            current: None,
            buf: String::new(),
            exhausted,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Feed a chunk of stdout; writes to `input` when the current question matches.
    pub fn feed(&mut self, chunk: &str, input: &mut dyn Write) -> io::Result<Progress> {
        if self.exhausted {
            return Ok(Progress::Exhausted);
        }

        self.buf.push_str(chunk.trim());

        if self.current.is_none() {
            self.current = self.queue.pop_front();
        }
        let prompt = match self.current {
            Some(ref p) => p,
            None => {
                self.exhausted = true;
                return Ok(Progress::Exhausted);
            }
        };

        if !prompt.question.matches(&self.buf) {
            return Ok(Progress::Waiting);
        }

        input.write_all(prompt.answer.as_bytes())?;
        input.write_all(b"\n")?;
        input.flush()?;
        debug!(answer = %prompt.answer, remaining = self.queue.len(), "prompt answered");
        self.current = None;

        if self.queue.is_empty() {
            self.exhausted = true;
            Ok(Progress::Exhausted)
        } else {
            Ok(Progress::Answered)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_question_answers_on_suffix() {
        let mut driver = PromptDriver::new([Prompt::new("Are you waiting?", "yes")]);
        let mut input = Vec::new();

        assert_eq!(driver.feed("Are you ", &mut input).unwrap(), Progress::Waiting);
        assert!(input.is_empty());
        assert_eq!(driver.feed("waiting? ", &mut input).unwrap(), Progress::Exhausted);
        assert_eq!(input, b"yes\n");
    }

    #[test]
    fn test_no_match_leaves_input_untouched() {
        let mut driver = PromptDriver::new([Prompt::new("Name?", "bob")]);
        let mut input = Vec::new();
        assert_eq!(driver.feed("Age?", &mut input).unwrap(), Progress::Waiting);
        assert_eq!(driver.feed("Name? trailing", &mut input).unwrap(), Progress::Waiting);
        assert!(input.is_empty());
    }

    #[test]
    fn test_queue_advances_in_order() {
        let mut driver = PromptDriver::new(vec![
            Prompt::new("Q1?", "A1"),
            Prompt::new(Regex::new(r"Q\d: second").unwrap(), "A2"),
        ]);
        let mut input = Vec::new();

        assert_eq!(driver.feed("Q1?", &mut input).unwrap(), Progress::Answered);
        assert_eq!(input, b"A1\n");
        assert_eq!(driver.feed("nothing yet", &mut input).unwrap(), Progress::Waiting);
        assert_eq!(driver.feed("Q2: second", &mut input).unwrap(), Progress::Exhausted);
        assert_eq!(input, b"A1\nA2\n");
    }

    #[test]
    fn test_no_writes_after_exhaustion() {
        let mut driver = PromptDriver::new([Prompt::new("go?", "ok")]);
        let mut input = Vec::new();
        driver.feed("go?", &mut input).unwrap();
        assert!(driver.is_exhausted());

        assert_eq!(driver.feed("go?", &mut input).unwrap(), Progress::Exhausted);
        assert_eq!(input, b"ok\n");
    }

    #[test]
    fn test_empty_queue_is_exhausted_from_start() {
        let driver = PromptDriver::new(Vec::new());
        assert!(driver.is_exhausted());
    }

    #[test]
    fn test_chunks_are_trimmed_before_buffering() {
        let mut driver = PromptDriver::new([Prompt::new("a:b", "x")]);
        let mut input = Vec::new();
        // "a:\n" trimmed to "a:", then "  b " trimmed to "b"
        driver.feed("a:\n", &mut input).unwrap();
        assert_eq!(driver.feed("  b ", &mut input).unwrap(), Progress::Exhausted);
    }
}
