//! Workflow graph loading
//!
//! Workflow files are small markdown documents: `# Class` opens an agent
//! class, `## Workflow` opens one of its workflows, and `- LABEL: text`
//! lines are the steps the oracle walks through. Key lines (`startup:`,
//! `trigger:`) configure the enclosing block.
//!
//! ```text
//! # Buyer
//! Buys things at a good price.
//!
//! ## Main
//! trigger: begin
//! - 01: Greet the seller
//! - 02: Ask for a quote and return it
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::error::{WorkflowError, WorkflowResult};
use super::state::InstructionPointer;

/// When a workflow runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trigger {
    /// Entered once when a fresh agent starts
    Begin,
    /// Entered for every incoming message
    Message,
    /// Only entered through `Call`
    #[default]
    Call,
}

/// One step of a workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Label used in instruction pointers
    pub label: String,
    /// Line in the source file
    pub source_line: u32,
    /// Natural-language instruction
    pub text: String,
}

/// A named sequence of steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    /// Workflow name
    pub name: String,
    /// Trigger
    pub trigger: Trigger,
    /// Free text between the header and the steps
    pub description: String,
    /// Steps in order
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Position of the first step
    pub fn first_position(&self) -> InstructionPointer {
        match self.steps.first() {
            Some(step) => InstructionPointer::new(&self.name, &step.label, step.source_line),
            None => InstructionPointer::new(&self.name, "00", 0),
        }
    }

    /// Step with the given label
    pub fn locate(&self, label: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.label == label)
    }

    /// Steps rendered for an oracle prompt
    pub fn instructions(&self) -> String {
        let mut out = format!("## {}\n", self.name);
        if !self.description.is_empty() {
            out.push_str(&self.description);
            out.push('\n');
        }
        for step in &self.steps {
            out.push_str(&format!("- {}:{}: {}\n", self.name, step.label, step.text));
        }
        out
    }
}

/// An agent class and its workflows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    /// Class name
    pub name: String,
    /// Free-text description
    pub description: String,
    /// Whether one instance is created when the program starts
    pub startup: bool,
    /// Workflows by name
    pub workflows: BTreeMap<String, Workflow>,
}

impl ClassDef {
    /// Workflow entered at begin-of-life
    pub fn entry_workflow(&self) -> Option<&Workflow> {
        self.workflows.values().find(|wf| wf.trigger == Trigger::Begin)
    }

    /// Workflow entered for each incoming message
    pub fn message_workflow(&self) -> Option<&Workflow> {
        self.workflows.values().find(|wf| wf.trigger == Trigger::Message)
    }

    /// Workflow by name
    pub fn workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }
}

/// The resolved workflow graph of a program
#[derive(Debug, Clone, Default)]
pub struct WorkflowSet {
    classes: BTreeMap<String, ClassDef>,
    paths: Vec<PathBuf>,
}

impl WorkflowSet {
    /// Load and merge workflow files
    pub fn load(paths: &[PathBuf]) -> WorkflowResult<Self> {
        let mut set = Self::default();
        for path in paths {
            let source = fs::read_to_string(path)?;
            set.merge(parse_source(path, &source)?)?;
            set.paths.push(path.clone());
        }
        tracing::debug!(classes = set.classes.len(), files = paths.len(), "workflows loaded");
        Ok(set)
    }

    /// Build a set from in-memory source
    pub fn from_source(source: &str) -> WorkflowResult<Self> {
        let mut set = Self::default();
        set.merge(parse_source(Path::new("<inline>"), source)?)?;
        Ok(set)
    }

    fn merge(&mut self, classes: Vec<ClassDef>) -> WorkflowResult<()> {
        for class in classes {
            if self.classes.contains_key(&class.name) {
                return Err(WorkflowError::DuplicateClass(class.name));
            }
            self.classes.insert(class.name.clone(), class);
        }
        Ok(())
    }

    /// Class by name
    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.classes.get(name)
    }

    /// All classes in name order
    pub fn classes(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.values()
    }

    /// Files the set was loaded from
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_source(path: &Path, source: &str) -> WorkflowResult<Vec<ClassDef>> {
    let error = |line: usize, message: String| WorkflowError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    };

    let mut classes: Vec<ClassDef> = Vec::new();
    let mut current_workflow: Option<Workflow> = None;

    fn close_workflow(classes: &mut [ClassDef], workflow: Option<Workflow>) {
        if let (Some(class), Some(workflow)) = (classes.last_mut(), workflow) {
            class.workflows.insert(workflow.name.clone(), workflow);
        }
    }

    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix("## ") {
            let name = name.trim();
            if classes.is_empty() {
                return Err(error(line_no, format!("workflow '{}' outside of a class", name)));
            }
            if !is_identifier(name) {
                return Err(error(line_no, format!("invalid workflow name '{}'", name)));
            }
            close_workflow(&mut classes, current_workflow.take());
            if classes.last().is_some_and(|class| class.workflows.contains_key(name)) {
                return Err(error(line_no, format!("workflow '{}' defined twice", name)));
            }
            current_workflow = Some(Workflow {
                name: name.to_string(),
                trigger: Trigger::default(),
                description: String::new(),
                steps: Vec::new(),
            });
        } else if let Some(name) = line.strip_prefix("# ") {
            let name = name.trim();
            if !is_identifier(name) {
                return Err(error(line_no, format!("invalid class name '{}'", name)));
            }
            close_workflow(&mut classes, current_workflow.take());
            classes.push(ClassDef {
                name: name.to_string(),
                description: String::new(),
                startup: true,
                workflows: BTreeMap::new(),
            });
        } else if let Some(value) = line.strip_prefix("trigger:") {
            let workflow = current_workflow
                .as_mut()
                .ok_or_else(|| error(line_no, "`trigger:` outside of a workflow".to_string()))?;
            workflow.trigger = match value.trim() {
                "begin" => Trigger::Begin,
                "message" => Trigger::Message,
                "call" => Trigger::Call,
                other => return Err(error(line_no, format!("unknown trigger '{}'", other))),
            };
        } else if let Some(value) = line.strip_prefix("startup:") {
            let class = classes
                .last_mut()
                .ok_or_else(|| error(line_no, "`startup:` outside of a class".to_string()))?;
            class.startup = match value.trim() {
                "true" | "yes" => true,
                "false" | "no" => false,
                other => return Err(error(line_no, format!("invalid startup value '{}'", other))),
            };
        } else if let Some(step) = line.strip_prefix("- ") {
            let workflow = current_workflow
                .as_mut()
                .ok_or_else(|| error(line_no, "step outside of a workflow".to_string()))?;
            let (label, text) = step
                .split_once(':')
                .ok_or_else(|| error(line_no, "steps look like `- 01: instruction`".to_string()))?;
            let label = label.trim();
            if label.is_empty() || !label.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(error(line_no, format!("invalid step label '{}'", label)));
            }
            if workflow.locate(label).is_some() {
                return Err(error(line_no, format!("duplicate step label '{}'", label)));
            }
            workflow.steps.push(Step {
                label: label.to_string(),
                source_line: line_no as u32,
                text: text.trim().to_string(),
            });
        } else if let Some(workflow) = current_workflow.as_mut() {
            append_line(&mut workflow.description, line);
        } else if let Some(class) = classes.last_mut() {
            append_line(&mut class.description, line);
        } else {
            return Err(error(line_no, "text before the first `# Class` header".to_string()));
        }
    }

    close_workflow(&mut classes, current_workflow.take());
    Ok(classes)
}

fn append_line(target: &mut String, line: &str) {
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(line);
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
# Buyer
Buys things.

## Main
trigger: begin
- 01: Greet the seller
- 02: Ask for a quote

## OnMessage
trigger: message
- 01: Answer

# Seller
startup: false

## Quote
- 01: Quote a price
";

    #[test]
    fn parses_classes_workflows_and_steps() {
        let set = WorkflowSet::from_source(SOURCE).unwrap();
        let buyer = set.class("Buyer").unwrap();
        assert!(buyer.startup);
        assert_eq!(buyer.description, "Buys things.");
        let main = buyer.entry_workflow().unwrap();
        assert_eq!(main.name, "Main");
        assert_eq!(main.first_position(), InstructionPointer::new("Main", "01", 6));
        assert_eq!(main.locate("02").unwrap().source_line, 7);
        assert_eq!(buyer.message_workflow().unwrap().name, "OnMessage");

        let seller = set.class("Seller").unwrap();
        assert!(!seller.startup);
        assert!(seller.entry_workflow().is_none());
        assert_eq!(seller.workflow("Quote").unwrap().trigger, Trigger::Call);
        assert!(main.instructions().contains("- Main:02: Ask for a quote"));
    }

    #[test]
    fn reports_malformed_lines() {
        let err = WorkflowSet::from_source("## Orphan\n").unwrap_err();
        assert!(err.to_string().contains("outside of a class"));

        let err = WorkflowSet::from_source("# A\n## W\n- 01 missing colon\n").unwrap_err();
        assert!(matches!(err, WorkflowError::Parse { line: 3, .. }));

        let err = WorkflowSet::from_source("# A\n## W\ntrigger: sometimes\n").unwrap_err();
        assert!(err.to_string().contains("unknown trigger"));
    }

    #[test]
    fn duplicate_classes_are_rejected() {
        let err = WorkflowSet::from_source("# A\n# A\n").unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateClass(name) if name == "A"));
    }
}
