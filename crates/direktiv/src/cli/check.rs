use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use console::style;

use direktiv_core::CompiledWorkflow;

/// Validate a workflow definition without running it.
#[derive(Parser)]
pub struct CheckCommand {
    /// Workflow YAML file.
    pub workflow: PathBuf,
}

impl CheckCommand {
    pub fn execute(self) -> Result<()> {
        let source = std::fs::read_to_string(&self.workflow)
            .with_context(|| format!("Failed to read {}", self.workflow.display()))?;

        let problems = lint_source(&source)?;
        if problems.is_empty() {
            println!(
                "  {} {} is valid",
                style("✓").green(),
                self.workflow.display()
            );
            return Ok(());
        }

        for problem in &problems {
            println!("  {} {}", style("✗").red(), problem);
        }
        anyhow::bail!(
            "{} has {} problem(s)",
            self.workflow.display(),
            problems.len()
        )
    }
}

/// Compile `source` and collect the problems found in it.
fn lint_source(source: &str) -> Result<Vec<String>> {
    let compiled = CompiledWorkflow::from_yaml(source)?;
    Ok(compiled.workflow().lint())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_workflow_has_no_problems() {
        let source = "states:\n  - id: a\n    type: noop\n    transition: b\n  - id: b\n    type: noop\n";
        assert!(lint_source(source).unwrap().is_empty());
    }

    #[test]
    fn test_dangling_transition_is_reported() {
        let source = "states:\n  - id: a\n    type: noop\n    transition: missing\n";
        let problems = lint_source(source).unwrap();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("missing"));
    }

    #[test]
    fn test_unparseable_workflow_is_an_error() {
        assert!(lint_source("states: 5").is_err());
    }
}
