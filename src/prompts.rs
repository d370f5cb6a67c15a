//! Prompt library: plain text files loaded verbatim from a known directory,
//! one per pipeline phase, with built-in fallbacks so a fresh checkout runs
//! without any prompt files on disk.

use std::path::Path;

const DEFAULT_CLASSIFIER: &str = include_str!("prompts/classifier.md");
const DEFAULT_INTERPRET: &str = include_str!("prompts/interpret.md");
const DEFAULT_PLAN: &str = include_str!("prompts/plan.md");
const DEFAULT_POLICY: &str = include_str!("prompts/policy.md");
const DEFAULT_EXECUTE: &str = include_str!("prompts/execute.md");
const DEFAULT_VERIFY: &str = include_str!("prompts/verify.md");
const DEFAULT_REPORT: &str = include_str!("prompts/report.md");

#[derive(Debug, Clone)]
pub struct PromptLibrary {
    pub classifier: String,
    pub interpret: String,
    pub plan: String,
    pub policy: String,
    pub execute: String,
    pub verify: String,
    pub report: String,
}

impl PromptLibrary {
    /// Load prompts from `dir`, falling back to the built-in text for any
    /// missing file. Prompt files are used verbatim.
    pub fn load(dir: &Path) -> Self {
        Self {
            classifier: load_or(dir, "classifier.md", DEFAULT_CLASSIFIER),
            interpret: load_or(dir, "interpret.md", DEFAULT_INTERPRET),
            plan: load_or(dir, "plan.md", DEFAULT_PLAN),
            policy: load_or(dir, "policy.md", DEFAULT_POLICY),
            execute: load_or(dir, "execute.md", DEFAULT_EXECUTE),
            verify: load_or(dir, "verify.md", DEFAULT_VERIFY),
            report: load_or(dir, "report.md", DEFAULT_REPORT),
        }
    }

    pub fn for_phase(&self, phase: &str) -> Option<&str> {
        match phase {
            "classifier" => Some(self.classifier.as_str()),
            "interpret" => Some(self.interpret.as_str()),
            "plan" => Some(self.plan.as_str()),
            "policy" => Some(self.policy.as_str()),
            "execute" => Some(self.execute.as_str()),
            "verify" => Some(self.verify.as_str()),
            "report" => Some(self.report.as_str()),
            _ => None,
        }
    }
}

fn load_or(dir: &Path, file: &str, default: &str) -> String {
    match std::fs::read_to_string(dir.join(file)) {
        Ok(content) if !content.trim().is_empty() => content,
        _ => default.to_string(),
    }
}
