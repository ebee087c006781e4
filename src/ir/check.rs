//! FileCheck-style test validation for IR files.
//!
//! Test files carry their expectations in comments: `; RUN:` lines name the
//! driver flags to apply and `; CHECK...:` lines describe the expected
//! printed output, similar to LLVM's FileCheck.

use std::collections::VecDeque;

use bumpalo::Bump;

use super::Module;
use crate::amx::{AmxOptions, ConvertDotToAmx};
use crate::core::session::PassSession;

/// A CHECK directive extracted from a test file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDirective {
    /// CHECK: pattern - Match pattern on some following line
    Check(String),
    /// CHECK-LABEL: pattern - Label for a section
    CheckLabel(String),
    /// CHECK-NEXT: pattern - Match on the next line
    CheckNext(String),
    /// CHECK-NOT: pattern - Pattern absent until the next positive match
    CheckNot(String),
    /// CHECK-EMPTY - Match empty line
    CheckEmpty,
    /// COM: comment - Comment, ignored
    Comment(String),
}

/// A RUN directive specifying how to execute the test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirective {
    pub command: String,
    pub args: Vec<String>,
}

/// Test specification extracted from a test file
#[derive(Debug)]
pub struct TestSpec {
    pub run_directives: Vec<RunDirective>,
    pub check_directives: Vec<CheckDirective>,
    pub ir_content: String,
}

impl TestSpec {
    /// Split a test file into directives and IR text.
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut run_directives = Vec::new();
        let mut check_directives = Vec::new();
        let mut ir_lines = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();

            if let Some(run_cmd) = trimmed.strip_prefix("; RUN:") {
                let parts: Vec<&str> = run_cmd.split_whitespace().collect();
                match parts.split_first() {
                    Some((command, args)) => run_directives.push(RunDirective {
                        command: command.to_string(),
                        args: args.iter().map(|s| s.to_string()).collect(),
                    }),
                    None => return Err("empty RUN directive".to_string()),
                }
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-LABEL:") {
                check_directives.push(CheckDirective::CheckLabel(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-NEXT:") {
                check_directives.push(CheckDirective::CheckNext(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-NOT:") {
                check_directives.push(CheckDirective::CheckNot(pattern.trim().to_string()));
            } else if trimmed.starts_with("; CHECK-EMPTY") {
                check_directives.push(CheckDirective::CheckEmpty);
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK:") {
                check_directives.push(CheckDirective::Check(pattern.trim().to_string()));
            } else if let Some(comment) = trimmed.strip_prefix("; COM:") {
                check_directives.push(CheckDirective::Comment(comment.trim().to_string()));
            } else {
                ir_lines.push(line);
            }
        }

        Ok(TestSpec {
            run_directives,
            check_directives,
            ir_content: ir_lines.join("\n"),
        })
    }
}

/// Test runner that applies the pass to a test file and validates the output
pub struct TestRunner {
    verbose: bool,
}

impl TestRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Run every RUN line of `spec` and validate its output.
    pub fn run_test(&self, spec: &TestSpec) -> Result<(), String> {
        if spec.run_directives.is_empty() {
            return Err("test has no RUN directive".to_string());
        }
        for run_dir in &spec.run_directives {
            let output = self.execute_command(&spec.ir_content, run_dir)?;
            if self.verbose {
                println!("{}", output);
            }
            self.validate_output(&output, &spec.check_directives)?;
        }
        Ok(())
    }

    /// Parse the IR, run the pass with the flags of `run_dir` and return the
    /// printed module, followed by the statistics with `--stats`.
    fn execute_command(&self, ir: &str, run_dir: &RunDirective) -> Result<String, String> {
        let mut options = AmxOptions::default();
        let mut print_stats = false;

        let mut args = run_dir.args.iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--int8" => options.convert_int8 = true,
                "--fp16" => options.convert_fp16 = true,
                "--bf16" => options.convert_bf16 = true,
                "--all" => options = AmxOptions::all(),
                "--stats" => print_stats = true,
                "--options" => {
                    let value = args.next().ok_or("--options expects a value")?;
                    options = value.parse().map_err(|e| format!("{}", e))?;
                }
                "%s" => {}
                other => return Err(format!("unknown RUN argument '{}'", other)),
            }
        }

        let mut module = Module::parse(ir).map_err(|e| e.to_string())?;
        let arena = Bump::new();
        let session = PassSession::new(&arena);
        ConvertDotToAmx::new(options).run(&mut module, &session);

        let mut output = module.print();
        if print_stats {
            output.push_str(&session.stats().to_string());
        }
        Ok(output)
    }

    /// Validate output against CHECK directives
    pub fn validate_output(
        &self,
        output: &str,
        directives: &[CheckDirective],
    ) -> Result<(), String> {
        let output_lines: VecDeque<_> = output.lines().collect();
        let mut line_idx = 0;
        let mut pending_not: Vec<&str> = Vec::new();

        // CHECK-NOT patterns must not appear between the previous match and
        // the next one (or the end of output).
        let check_not = |pending: &mut Vec<&str>, from: usize, to: usize| -> Result<(), String> {
            for pattern in pending.drain(..) {
                let mut window = output_lines.range(from..to);
                if let Some(line) = window.find(|line| line.contains(pattern)) {
                    return Err(format!("CHECK-NOT: pattern '{}' found in '{}'", pattern, line));
                }
            }
            Ok(())
        };

        for directive in directives {
            match directive {
                CheckDirective::Comment(_) => continue,

                CheckDirective::CheckNot(pattern) => pending_not.push(pattern),

                CheckDirective::Check(pattern) | CheckDirective::CheckLabel(pattern) => {
                    let kind = match directive {
                        CheckDirective::Check(_) => "CHECK",
                        _ => "CHECK-LABEL",
                    };
                    let found = output_lines
                        .iter()
                        .skip(line_idx)
                        .position(|line| line.contains(pattern.as_str()));

                    match found {
                        Some(idx) => {
                            check_not(&mut pending_not, line_idx, line_idx + idx)?;
                            line_idx += idx + 1;
                            if self.verbose {
                                println!("{}: '{}' found at line {}", kind, pattern, line_idx - 1);
                            }
                        }
                        None => {
                            return Err(format!(
                                "{}: pattern '{}' not found in output",
                                kind, pattern
                            ));
                        }
                    }
                }

                CheckDirective::CheckNext(pattern) => {
                    if line_idx >= output_lines.len() {
                        return Err(format!("CHECK-NEXT: no more lines, expected '{}'", pattern));
                    }

                    let line = output_lines[line_idx];
                    if !line.contains(pattern.as_str()) {
                        return Err(format!(
                            "CHECK-NEXT: expected '{}' but got '{}'",
                            pattern, line
                        ));
                    }

                    if self.verbose {
                        println!("CHECK-NEXT: '{}' matches at line {}", pattern, line_idx);
                    }
                    line_idx += 1;
                }

                CheckDirective::CheckEmpty => {
                    if line_idx >= output_lines.len() {
                        continue; // End of output counts as empty
                    }

                    let line = output_lines[line_idx];
                    if !line.trim().is_empty() {
                        return Err(format!("CHECK-EMPTY: expected empty line but got '{}'", line));
                    }
                    line_idx += 1;
                }
            }
        }

        check_not(&mut pending_not, line_idx, output_lines.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directives() {
        let content = r#"; RUN: amx-legalize --bf16 %s
; CHECK-LABEL: func @f
; CHECK-NEXT: const 0
; CHECK-NOT: dot
; COM: This is a comment
func @f() {
  %c0 = const 0 : index
  return
}"#;

        let spec = TestSpec::parse(content).unwrap();
        assert_eq!(spec.run_directives.len(), 1);
        assert_eq!(spec.run_directives[0].args, vec!["--bf16", "%s"]);
        assert_eq!(spec.check_directives.len(), 4);
        assert!(spec.ir_content.contains("func @f()"));
    }

    #[test]
    fn test_check_matching() {
        let runner = TestRunner::new(false);
        let output = "func @f() {\n  %0 = const 0 : index\n  return\n}\n";

        let directives = vec![
            CheckDirective::CheckLabel("func @f".to_string()),
            CheckDirective::CheckNext("const 0".to_string()),
            CheckDirective::CheckNot("dot".to_string()),
            CheckDirective::Check("return".to_string()),
        ];

        runner.validate_output(output, &directives).unwrap();
    }

    #[test]
    fn test_check_next_failure() {
        let runner = TestRunner::new(false);
        let output = "Line 1\nLine 2\nLine 3\n";

        let directives = vec![
            CheckDirective::Check("Line 1".to_string()),
            CheckDirective::CheckNext("Line 3".to_string()), // Should fail
        ];

        let result = runner.validate_output(output, &directives);
        assert!(result.unwrap_err().contains("CHECK-NEXT"));
    }

    #[test]
    fn test_check_not_failure() {
        let runner = TestRunner::new(false);
        let output = "a\ndot\nb\n";

        let not_dot = CheckDirective::CheckNot("dot".to_string());
        let b = CheckDirective::Check("b".to_string());
        let directives = vec![not_dot.clone(), b.clone()];
        assert!(runner.validate_output(output, &directives).unwrap_err().contains("CHECK-NOT"));

        let trailing = vec![b, not_dot];
        runner.validate_output(output, &trailing).unwrap();
    }

    #[test]
    fn test_run_rejected_dot_untouched() {
        let content = r#"; RUN: amx-legalize --all --stats %s
; CHECK: dot
; CHECK: Rejected: 1
func @f(%x: memref<4x4xf32>) {
  %c0 = const 0 : index
  %s = read %x[%c0, %c0] : vector<4x4xf32>
  %t = dot %s, %s, %s : vector<4x4xf32>
  write %t, %x[%c0, %c0]
  return
}"#;
        let spec = TestSpec::parse(content).unwrap();
        TestRunner::new(false).run_test(&spec).unwrap();
    }
}
