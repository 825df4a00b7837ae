//! Scripted tool runner for exercising backend command sequences on any host.

use crate::error::Result;
use crate::tool::{ToolCommand, ToolOutput, ToolRunner};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct Rule {
    program: String,
    contains: Option<String>,
    output: ToolOutput,
    once: bool,
}

/// Records every command. One-shot rules answer first, in the order they were added,
/// and are consumed when matched; otherwise the most recently added standing rule
/// answers. Commands without a matching rule succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<ToolCommand>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, program: &str, contains: Option<&str>, code: i32, stdout: &str) -> &Self {
        self.push(program, contains, success_output(code, stdout), false)
    }

    /// Answers the next matching call only, for tools whose output changes between calls.
    pub fn respond_once(&self, program: &str, contains: Option<&str>, code: i32, stdout: &str) -> &Self {
        self.push(program, contains, success_output(code, stdout), true)
    }

    pub fn fail(&self, program: &str, contains: Option<&str>) -> &Self {
        let output = ToolOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: format!("{} scripted failure", program),
        };
        self.push(program, contains, output, false)
    }

    fn push(&self, program: &str, contains: Option<&str>, output: ToolOutput, once: bool) -> &Self {
        lock(&self.rules).push(Rule {
            program: program.to_string(),
            contains: contains.map(str::to_string),
            output,
            once,
        });
        self
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        lock(&self.calls).clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(ToolCommand::display_line).collect()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.program).collect()
    }
}

impl ToolRunner for ScriptedRunner {
    fn execute(&self, command: &ToolCommand) -> Result<ToolOutput> {
        lock(&self.calls).push(command.clone());
        let line = command.display_line();
        let mut rules = lock(&self.rules);
        let matches = |rule: &Rule| {
            rule.program == command.program
                && rule
                    .contains
                    .as_deref()
                    .map(|needle| line.contains(needle))
                    .unwrap_or(true)
        };
        if let Some(index) = rules.iter().position(|rule| rule.once && matches(rule)) {
            return Ok(rules.remove(index).output);
        }
        Ok(rules
            .iter()
            .rev()
            .find(|rule| !rule.once && matches(rule))
            .map(|rule| rule.output.clone())
            .unwrap_or(ToolOutput {
                code: Some(0),
                ..ToolOutput::default()
            }))
    }
}

fn success_output(code: i32, stdout: &str) -> ToolOutput {
    ToolOutput {
        code: Some(code),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_rules_answer_in_order_before_standing_rules() {
        let runner = ScriptedRunner::new();
        runner
            .respond("lsblk", None, 0, "standing")
            .respond_once("lsblk", None, 0, "first")
            .respond_once("lsblk", None, 0, "second");
        let command = ToolCommand::new("lsblk").arg("-J");
        let outputs: Vec<String> = (0..3)
            .map(|_| runner.execute(&command).unwrap().stdout)
            .collect();
        assert_eq!(outputs, vec!["first", "second", "standing"]);
    }

    #[test]
    fn unmatched_commands_succeed_quietly() {
        let runner = ScriptedRunner::new();
        runner.respond_once("parted", Some("print"), 0, "BYT;");
        let output = runner.execute(&ToolCommand::new("parted").arg("mkpart")).unwrap();
        assert_eq!(output.code, Some(0));
        assert!(output.stdout.is_empty());
        assert_eq!(runner.command_lines(), vec!["parted mkpart"]);
    }
}
