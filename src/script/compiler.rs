//! Script compiler.
//!
//! Turns script text into a [`CommandSchedule`]:
//!
//! ```text
//! TIME 10
//! # comment
//! WAIT
//! LASER:rfSet(%) 23, 24
//! 	LASER:rrSet(%) 10, 1
//! ```
//!
//! The first line sets the step interval in seconds. Every other line is a
//! command template followed by an optional argument list; a template with
//! a placeholder expands once per argument. `WAIT` is one empty step.
//!
//! Indentation nests: the block indented below a line plays inside each of
//! that line's expansions. The block's first step runs together with the
//! expansion, its remaining steps follow before the next expansion. The
//! example above compiles to five steps:
//!
//! ```text
//! []
//! [LASER:rfSet(23), LASER:rrSet(10)]
//! [LASER:rrSet(1)]
//! [LASER:rfSet(24), LASER:rrSet(10)]
//! [LASER:rrSet(1)]
//! ```

use std::fmt;

use super::CommandSchedule;

/// Characters with special meaning in a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptSyntax {
    /// Replaced by each argument in a command template.
    pub placeholder: char,
    /// One leading occurrence is one level of nesting.
    pub indent: char,
    /// Lines starting with this (after indentation) are ignored.
    pub comment: char,
}

impl Default for ScriptSyntax {
    fn default() -> Self {
        Self {
            placeholder: '%',
            indent: '\t',
            comment: '#',
        }
    }
}

/// A script that cannot be compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// 1-based source line.
    pub line: usize,
    /// Offending line with indentation removed.
    pub text: String,
    /// What is wrong with it.
    pub message: String,
}

impl CompileError {
    fn new(line: usize, text: &str, message: impl Into<String>) -> Self {
        Self {
            line,
            text: text.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Line {}: \"{}\": {}", self.line, self.text, self.message)
    }
}

impl std::error::Error for CompileError {}

/// Compile `script` with the default syntax.
pub fn compile(script: &str) -> Result<CommandSchedule, CompileError> {
    compile_with(script, &ScriptSyntax::default())
}

/// Compile `script` with custom special characters.
pub fn compile_with(script: &str, syntax: &ScriptSyntax) -> Result<CommandSchedule, CompileError> {
    let mut lines = script
        .lines()
        .enumerate()
        .map(|(i, raw)| (i + 1, raw.trim_end()))
        .filter(|(_, raw)| !raw.trim().is_empty());

    let Some((time_line, time_text)) = lines.next() else {
        return Err(CompileError::new(1, "", "Empty script"));
    };
    let interval = parse_time(time_line, time_text.trim())?;

    let mut parsed = Vec::new();
    for (number, raw) in lines {
        let body = raw.trim_start_matches(syntax.indent);
        let indent = raw.chars().take_while(|&c| c == syntax.indent).count();
        let body = body.trim_start();
        if body.is_empty() || body.starts_with(syntax.comment) {
            continue;
        }
        parsed.push(ScriptLine {
            number,
            indent,
            expansions: expand(number, body, syntax)?,
        });
    }

    let mut pos = 0;
    let roots = parse_block(&parsed, &mut pos, 0);
    let steps = roots.iter().flat_map(Node::flatten).collect();

    Ok(CommandSchedule::new(interval, steps))
}

fn parse_time(number: usize, text: &str) -> Result<f64, CompileError> {
    let expected = || CompileError::new(number, text, "\"TIME <seconds>\" is expected");
    let mut tokens = text.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(keyword), Some(seconds), None) if keyword.eq_ignore_ascii_case("TIME") => {
            let interval: f64 = seconds.parse().map_err(|_| expected())?;
            if interval.is_finite() && interval > 0.0 {
                Ok(interval)
            } else {
                Err(CompileError::new(number, text, "interval must be a positive number of seconds"))
            }
        }
        _ => Err(expected()),
    }
}

/// One slot a line contributes to its level: a command, or `None` for `WAIT`.
type Expansion = Option<String>;

struct ScriptLine {
    number: usize,
    indent: usize,
    expansions: Vec<Expansion>,
}

fn expand(number: usize, body: &str, syntax: &ScriptSyntax) -> Result<Vec<Expansion>, CompileError> {
    let (template, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
    let joined: String = rest.chars().filter(|c| !c.is_whitespace()).collect();
    let args: Vec<&str> = if joined.is_empty() {
        Vec::new()
    } else {
        joined.split(',').collect()
    };

    if template.eq_ignore_ascii_case("TIME") {
        return Err(CompileError::new(number, body, "TIME already set in the first line"));
    }

    if template.eq_ignore_ascii_case("WAIT") {
        if !args.is_empty() {
            return Err(CompileError::new(number, body, "WAIT takes no arguments"));
        }
        return Ok(vec![None]);
    }

    let placeholder = syntax.placeholder;
    if template.contains(placeholder) {
        if args.is_empty() {
            return Err(CompileError::new(
                number,
                body,
                format!("\"{placeholder}\" in function, but no arguments are given"),
            ));
        }
        if args.iter().any(|a| a.is_empty()) {
            return Err(CompileError::new(number, body, "empty argument in argument list"));
        }
        let mut buf = [0u8; 4];
        let placeholder: &str = placeholder.encode_utf8(&mut buf);
        return Ok(args
            .iter()
            .map(|arg| Some(template.replace(placeholder, arg)))
            .collect());
    }

    if !args.is_empty() {
        return Err(CompileError::new(
            number,
            body,
            format!("arguments were given, but no \"{placeholder}\" in function"),
        ));
    }
    Ok(vec![Some(template.to_string())])
}

struct Node<'a> {
    line: &'a ScriptLine,
    children: Vec<Node<'a>>,
}

/// Collect consecutive lines indented at least `min_indent`; each line
/// adopts the deeper lines that follow it.
fn parse_block<'a>(lines: &'a [ScriptLine], pos: &mut usize, min_indent: usize) -> Vec<Node<'a>> {
    let mut nodes = Vec::new();
    while let Some(line) = lines.get(*pos) {
        if line.indent < min_indent {
            break;
        }
        *pos += 1;
        let children = parse_block(lines, pos, line.indent + 1);
        nodes.push(Node { line, children });
    }
    nodes
}

impl Node<'_> {
    fn flatten(&self) -> Vec<Vec<String>> {
        let body: Vec<Vec<String>> = self.children.iter().flat_map(Node::flatten).collect();
        let mut steps = Vec::with_capacity(self.line.expansions.len() * body.len().max(1));
        for expansion in &self.line.expansions {
            let mut rest = body.iter();
            let mut first: Vec<String> = expansion.iter().cloned().collect();
            if let Some(head) = rest.next() {
                first.extend(head.iter().cloned());
            }
            steps.push(first);
            steps.extend(rest.cloned());
        }
        log::trace!(
            "[ScriptCompiler] line {} expands to {} step(s)",
            self.line.number,
            steps.len()
        );
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LASER_SCRIPT: &str = "TIME 10\nWAIT\nLASER:rfSet(%) 23, 24\n\tLASER:rrSet(%) 10, 1\n";

    fn steps(script: &str) -> Vec<Vec<String>> {
        compile(script).unwrap().steps().to_vec()
    }

    fn err(script: &str) -> CompileError {
        compile(script).unwrap_err()
    }

    #[test]
    fn test_laser_example() {
        let schedule = compile(LASER_SCRIPT).unwrap();
        assert!((schedule.interval_secs() - 10.0).abs() < f64::EPSILON);
        assert_eq!(
            schedule.steps(),
            &[
                vec![],
                vec!["LASER:rfSet(23)".to_string(), "LASER:rrSet(10)".to_string()],
                vec!["LASER:rrSet(1)".to_string()],
                vec!["LASER:rfSet(24)".to_string(), "LASER:rrSet(10)".to_string()],
                vec!["LASER:rrSet(1)".to_string()],
            ]
        );
    }

    #[test]
    fn test_comments_and_blank_lines_are_skipped() {
        let script = "time 0.5\n\n# setup\nA:on()\n   \n\t# nested comment\nA:off()\n";
        assert_eq!(steps(script), vec![vec!["A:on()"], vec!["A:off()"]]);
    }

    #[test]
    fn test_compile_is_deterministic() {
        assert_eq!(compile(LASER_SCRIPT), compile(LASER_SCRIPT));
    }

    #[test]
    fn test_time_line_errors() {
        assert_eq!(err("").message, "Empty script");
        assert_eq!(err("WAIT\n").line, 1);
        assert!(err("TIME\n").message.contains("TIME <seconds>"));
        assert!(err("TIME ten\n").message.contains("TIME <seconds>"));
        assert!(err("TIME 1 2\n").message.contains("TIME <seconds>"));
        assert!(err("TIME 0\n").message.contains("positive"));
        assert!(err("TIME -3\n").message.contains("positive"));
    }

    #[test]
    fn test_line_errors_carry_source_line() {
        let second_time = err("TIME 1\n\nTIME 2\n");
        assert_eq!(second_time.line, 3);
        assert_eq!(second_time.to_string(), "Line 3: \"TIME 2\": TIME already set in the first line");

        assert!(err("TIME 1\nA:set(%)\n").message.contains("no arguments"));
        assert!(err("TIME 1\nA:set(1) 2\n").message.contains("no \"%\""));
        assert!(err("TIME 1\nWAIT 3\n").message.contains("WAIT"));
        assert_eq!(err("TIME 1\nA:set(%) 1,,2\n").line, 2);
    }

    #[test]
    fn test_argument_whitespace_is_dropped() {
        assert_eq!(
            steps("TIME 1\nA:set(%) 1 ,  2,3\n"),
            vec![vec!["A:set(1)"], vec!["A:set(2)"], vec!["A:set(3)"]]
        );
    }

    #[test]
    fn test_custom_syntax() {
        let syntax = ScriptSyntax {
            placeholder: '$',
            indent: '>',
            comment: ';',
        };
        let schedule = compile_with("TIME 2\n; note\nA:v($) 1,2\n>B:w()\n", &syntax).unwrap();
        assert_eq!(
            schedule.steps(),
            &[vec!["A:v(1)".to_string(), "B:w()".to_string()], vec!["A:v(2)".to_string(), "B:w()".to_string()]]
        );
    }

    #[test]
    fn test_wait_inside_nested_block() {
        // Each outer command is followed by one idle step.
        let script = "TIME 1\nA:x(%) 1,2\n\tWAIT\n\tWAIT\n";
        assert_eq!(
            steps(script),
            vec![vec!["A:x(1)"], vec![], vec!["A:x(2)"], vec![]]
        );
    }
}
