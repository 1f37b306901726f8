//! Scripted in-memory channel for exercising the engine without a host.

use crate::channel::{Channel, ExecOutput, StreamKind};
use crate::error::{BerthError, Result};
use std::cell::RefCell;

struct Rule {
    needle: String,
    outputs: Vec<ExecOutput>,
    hits: usize,
}

/// A `Channel` that answers from a rule table and records every call.
///
/// Rules match in insertion order on a substring of the command (or of the
/// uploaded script body). A rule added with `on` repeats its output forever;
/// `on_seq` steps through its outputs and then repeats the last one. An
/// output with exit code 255 is surfaced as a transport error, mirroring
/// `SshChannel`.
pub struct ScriptedChannel {
    rules: RefCell<Vec<Rule>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self {
            rules: RefCell::new(Vec::new()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn on(self, needle: &str, output: ExecOutput) -> Self {
        self.on_seq(needle, vec![output])
    }

    pub fn on_seq(self, needle: &str, outputs: Vec<ExecOutput>) -> Self {
        assert!(!outputs.is_empty(), "a rule needs at least one output");
        self.rules.borrow_mut().push(Rule {
            needle: needle.to_string(),
            outputs,
            hits: 0,
        });
        self
    }

    /// Every command/script this channel has seen, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl Channel for ScriptedChannel {
    fn run_streaming(
        &self,
        command: &str,
        stdin: Option<&str>,
        sink: &mut dyn FnMut(StreamKind, &str),
    ) -> Result<ExecOutput> {
        let key = match stdin {
            Some(body) => format!("{command}\n{body}"),
            None => command.to_string(),
        };
        self.calls.borrow_mut().push(key.clone());

        let mut rules = self.rules.borrow_mut();
        let Some(rule) = rules.iter_mut().find(|r| key.contains(&r.needle)) else {
            // Unmatched commands succeed silently; tests assert on `calls`.
            return Ok(ExecOutput::ok(""));
        };
        let idx = rule.hits.min(rule.outputs.len() - 1);
        rule.hits += 1;
        let output = rule.outputs[idx].clone();

        if output.exit_code == 255 {
            return Err(BerthError::Transport {
                host: "scripted".into(),
                message: output.stderr_tail(),
            });
        }
        for line in output.stdout.lines() {
            sink(StreamKind::Stdout, line);
        }
        for line in output.stderr.lines() {
            sink(StreamKind::Stderr, line);
        }
        Ok(output)
    }
}
