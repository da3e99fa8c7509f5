use super::signature::Signature;
use anyhow::{bail, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const PLACEHOLDER_OPEN: &str = "{{";
const PLACEHOLDER_CLOSE: &str = "}}";

/// One scripted interaction: a text template plus its precomputed signature.
#[derive(Debug, Clone)]
pub struct Step {
    template: String,
    signature: Signature,
}

impl Step {
    pub fn new(template: impl Into<String>) -> Self {
        let template = template.into();
        let signature = Signature::from_text(&strip_placeholders(&template));
        Self {
            template,
            signature,
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Substitutes `{{name}}` placeholders. Unknown names render as empty text.
    pub fn render(&self, variables: &BTreeMap<String, String>) -> String {
        render_template(&self.template, variables)
    }
}

/// Signatures of a script's steps, indexed by 0-based step position.
#[derive(Debug, Clone, Default)]
pub struct SignatureCatalog {
    entries: Vec<Signature>,
}

impl SignatureCatalog {
    pub fn new(entries: Vec<Signature>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Signature> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Signature)> {
        self.entries.iter().enumerate()
    }
}

impl FromIterator<Signature> for SignatureCatalog {
    fn from_iter<I: IntoIterator<Item = Signature>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Ordered, immutable sequence of steps shared by every run of a category.
#[derive(Debug)]
pub struct Script {
    category: String,
    steps: Vec<Step>,
    signatures: SignatureCatalog,
}

impl Script {
    pub fn new<I, S>(category: impl Into<String>, templates: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let category = category.into();
        if category.trim().is_empty() {
            bail!("script category cannot be empty");
        }

        let steps: Vec<Step> = templates.into_iter().map(Step::new).collect();
        if steps.is_empty() {
            bail!("script {category} must contain at least one step");
        }

        for (index, step) in steps.iter().enumerate() {
            if step.signature().is_empty() {
                tracing::warn!(
                    category = %category,
                    step_index = index,
                    "step template has an empty signature; position detection cannot match it"
                );
            }
        }

        let signatures = steps.iter().map(|step| step.signature().clone()).collect();
        Ok(Self {
            category,
            steps,
            signatures,
        })
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Steps still to run when resuming at `from`.
    pub fn remaining(&self, from: usize) -> &[Step] {
        &self.steps[from.min(self.steps.len())..]
    }

    pub fn signatures(&self) -> &SignatureCatalog {
        &self.signatures
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 == self.steps.len()
    }
}

/// Scripts keyed by run category.
#[derive(Debug, Clone, Default)]
pub struct ScriptCatalog {
    scripts: HashMap<String, Arc<Script>>,
}

impl ScriptCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, script: Script) -> Self {
        self.insert(script);
        self
    }

    pub fn insert(&mut self, script: Script) {
        self.scripts
            .insert(script.category().to_owned(), Arc::new(script));
    }

    pub fn get(&self, category: &str) -> Option<Arc<Script>> {
        self.scripts.get(category).cloned()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Scripts in category order, so scans over the catalog are deterministic.
    pub fn ordered(&self) -> Vec<Arc<Script>> {
        let mut scripts: Vec<Arc<Script>> = self.scripts.values().cloned().collect();
        scripts.sort_by(|a, b| a.category().cmp(b.category()));
        scripts
    }
}

fn render_template(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find(PLACEHOLDER_OPEN) {
        let after_open = &rest[open + PLACEHOLDER_OPEN.len()..];
        let Some(close) = after_open.find(PLACEHOLDER_CLOSE) else {
            break;
        };

        rendered.push_str(&rest[..open]);
        let name = after_open[..close].trim();
        match variables.get(name) {
            Some(value) => rendered.push_str(value),
            None => tracing::debug!(placeholder = name, "no value for template placeholder"),
        }
        rest = &after_open[close + PLACEHOLDER_CLOSE.len()..];
    }

    rendered.push_str(rest);
    rendered
}

fn strip_placeholders(template: &str) -> String {
    render_template(template, &BTreeMap::new())
}
