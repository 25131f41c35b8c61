//! emx-proctest CLI
//!
//! Run one command or script, check its outcome, report.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use emx_proctest::{
    fork_with, logging, spawn_with, unescape, DebugLevel, Expectation, Field, Finished, LaunchOptions, Process,
    Prompt, Question, Regex,
};

#[derive(Parser, Debug)]
#[command(name = "emx-proctest")]
#[command(author = "nzinfo <li.monan@gmail.com>")]
#[command(version)]
#[command(about = "Run a command and check its stdout, stderr, exit code and launch error")]
struct Cli {
    /// Run COMMAND as a script through the interpreter
    #[arg(long)]
    fork: bool,

    /// Interpreter for --fork [default: $PROCTEST_INTERPRETER or sh]
    #[arg(long)]
    interpreter: Option<String>,

    /// Working directory of the child
    #[arg(short = 'C', long)]
    cwd: Option<PathBuf>,

    /// Environment variables to set (KEY=VALUE)
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    env_vars: Vec<String>,

    /// Expectation: stdout, stderr, code or error, then `=` and a value.
    /// `/re/` is a pattern, `none` an absent value, anything else literal text.
    #[arg(long = "expect", value_name = "FIELD=VALUE")]
    expect: Vec<String>,

    /// Negated expectation, same syntax as --expect
    #[arg(long = "not-expect", value_name = "FIELD=VALUE")]
    not_expect: Vec<String>,

    /// Text written to stdin at launch (`\n` and friends are unescaped)
    #[arg(long = "write", value_name = "TEXT")]
    write: Vec<String>,

    /// Answer a question printed on stdout; `/re/` questions are patterns
    #[arg(long = "prompt", value_name = "QUESTION=>ANSWER")]
    prompt: Vec<String>,

    /// Kill the child after this many milliseconds
    #[arg(long = "timeout-ms", value_name = "N")]
    timeout_ms: Option<u64>,

    /// Echo child output: 0, 1 (stdout), 2 (stderr), true or false
    #[arg(long, value_name = "LEVEL")]
    debug: Option<String>,

    /// Only report failures
    #[arg(short, long)]
    quiet: bool,

    /// Command (or script with --fork) to run
    command: String,

    /// Arguments passed to the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    let process = match build(&cli) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let quiet = cli.quiet;
    let mut status = ExitCode::FAILURE;
    process.end_with(|this, outcome| match outcome {
        Ok(_) => {
            println!("PASS  {}", describe(this));
            if !quiet {
                report(this);
            }
            status = ExitCode::SUCCESS;
        }
        Err(err) => {
            println!("FAIL  {}", describe(this));
            for line in err.to_string().lines() {
                println!("      {}", line);
            }
            report(this);
        }
    });
    status
}

fn build(cli: &Cli) -> Result<Process> {
    let mut options = LaunchOptions::new();
    if let Some(ref dir) = cli.cwd {
        options = options.cwd(dir.clone());
    }
    for kv in &cli.env_vars {
        let (k, v) = kv
            .split_once('=')
            .with_context(|| format!("invalid --env {:?}: expected KEY=VALUE", kv))?;
        options = options.env(k, v);
    }
    if let Some(ref interpreter) = cli.interpreter {
        options = options.interpreter(interpreter.clone());
    }
    if let Some(ms) = cli.timeout_ms {
        options = options.timeout(Duration::from_millis(ms));
    }

    let mut process = if cli.fork {
        fork_with(cli.command.as_str(), &cli.args, &options)
    } else {
        spawn_with(cli.command.as_str(), &cli.args, &options)
    };

    if let Some(ref level) = cli.debug {
        let level = DebugLevel::parse(level).with_context(|| format!("invalid --debug {:?}", level))?;
        process = process.debug(level);
    }
    for text in &cli.write {
        process = process.write(unescape(text));
    }
    for raw in &cli.prompt {
        process = process.prompt(parse_prompt(raw)?);
    }
    for raw in &cli.expect {
        let (field, expectation) = parse_expectation(raw)?;
        process = process.expect(field, expectation);
    }
    for raw in &cli.not_expect {
        let (field, expectation) = parse_expectation(raw)?;
        process = process.not_expect(field, expectation);
    }
    Ok(process)
}

fn parse_expectation(raw: &str) -> Result<(Field, Expectation)> {
    let (field, value) = raw
        .split_once('=')
        .with_context(|| format!("invalid expectation {:?}: expected FIELD=VALUE", raw))?;
    let field: Field = field.trim().parse()?;
    let expectation = Expectation::parse(field, value)?;
    Ok((field, expectation))
}

fn parse_prompt(raw: &str) -> Result<Prompt> {
    let (question, answer) = raw
        .split_once("=>")
        .with_context(|| format!("invalid prompt {:?}: expected QUESTION=>ANSWER", raw))?;
    let question = if question.len() >= 2 && question.starts_with('/') && question.ends_with('/') {
        let pattern = &question[1..question.len() - 1];
        Question::Pattern(Regex::new(pattern).with_context(|| format!("invalid prompt pattern /{}/", pattern))?)
    } else {
        Question::Text(question.to_string())
    };
    Ok(Prompt::new(question, answer))
}

fn describe(this: &Finished) -> String {
    let mut line = format!("{} {}", this.method(), this.command());
    for arg in this.args() {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

fn report(this: &Finished) {
    println!("      stdout: {:?}", this.stdout);
    println!("      stderr: {:?}", this.stderr);
    match this.code {
        Some(code) => println!("      code:   {}", code),
        None => println!("      code:   none"),
    }
    if let Some(ref err) = this.error {
        println!("      error:  {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emx_proctest::Expected;

    #[test]
    fn test_parse_expectation_pattern() {
        let (field, e) = parse_expectation("error=/ENOENT/").unwrap();
        assert_eq!(field, Field::Error);
        assert!(matches!(e.values()[0], Expected::Pattern(_)));
    }

    #[test]
    fn test_parse_expectation_keeps_equals_in_value() {
        let (field, e) = parse_expectation("stdout=a=b").unwrap();
        assert_eq!(field, Field::Stdout);
        assert!(matches!(&e.values()[0], Expected::Text(s) if s == "a=b"));
    }

    #[test]
    fn test_parse_expectation_rejects_unknown_field() {
        assert!(parse_expectation("stdin=x").is_err());
        assert!(parse_expectation("no-separator").is_err());
    }

    #[test]
    fn test_parse_prompt() {
        let p = parse_prompt("Are you waiting?=>yes").unwrap();
        assert!(matches!(p.question, Question::Text(ref q) if q == "Are you waiting?"));
        assert_eq!(p.answer, "yes");

        let p = parse_prompt("/name:?/=>bob").unwrap();
        assert!(matches!(p.question, Question::Pattern(_)));
        assert!(parse_prompt("missing arrow").is_err());
    }

    #[test]
    fn test_cli_collects_trailing_args() {
        let cli = Cli::try_parse_from(["emx-proctest", "--fork", "--expect", "code=0", "s.sh", "y", "-x"]).unwrap();
        assert!(cli.fork);
        assert_eq!(cli.command, "s.sh");
        assert_eq!(cli.args, vec!["y", "-x"]);
        assert!(build(&cli).is_ok());
    }
}
