//! Command-line syntax for one output command: `module/output/operation`.
//!
//! Operations: `on`, `off`, `raise`, `lower`, `stop`, or a dim level as
//! `level=<percent>` (also `<percent>%`).

use std::str::FromStr;

use ipcom_core::Operation;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub module: u8,
    pub output: u8,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid command {0}")]
pub struct ParseCommandError(String);

impl FromStr for CommandSpec {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| ParseCommandError(format!("{s:?}: {why}"));
        let mut parts = s.trim().split('/');
        let (Some(module), Some(output), Some(op), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad("expected module/output/operation"));
        };
        let module = module.parse().map_err(|_| bad("module must be 0-255"))?;
        let output = output.parse().map_err(|_| bad("output must be 0-255"))?;
        let operation = parse_operation(op).ok_or_else(|| bad("unknown operation"))?;
        Ok(Self {
            module,
            output,
            operation,
        })
    }
}

fn parse_operation(op: &str) -> Option<Operation> {
    let op = op.trim().to_ascii_lowercase();
    let level = op
        .strip_prefix("level=")
        .or_else(|| op.strip_suffix('%'));
    if let Some(level) = level {
        let percent: u8 = level.parse().ok()?;
        return Operation::set_level(percent).ok();
    }
    match op.as_str() {
        "on" => Some(Operation::On),
        "off" => Some(Operation::Off),
        "raise" | "up" => Some(Operation::Raise),
        "lower" | "down" => Some(Operation::Lower),
        "stop" => Some(Operation::Stop),
        _ => None,
    }
}
