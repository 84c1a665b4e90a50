//! Pipeline configuration from JSON or YAML

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Top-level pipeline configuration (a pipeline resource document)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionConfig {
    /// Pipeline name
    #[serde(default)]
    pub name: String,

    /// Declared pipeline inputs and outputs
    #[serde(default)]
    pub metadata: Option<IoMetadata>,

    /// Stages in execution order
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// Stage configuration as written in the pipeline document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name, unique in the pipeline (generated when omitted)
    #[serde(default)]
    pub name: Option<String>,

    /// Activity reference resolved through the activity registry
    #[serde(rename = "ref")]
    pub activity_ref: String,

    /// Settings handed to the activity factory
    #[serde(default)]
    pub settings: Map<String, Value>,

    /// Input bindings (activity input name -> expression)
    #[serde(default)]
    pub input: BTreeMap<String, Value>,

    /// Output bindings (pipeline value name -> expression)
    #[serde(default)]
    pub output: BTreeMap<String, Value>,
}

impl StageConfig {
    pub fn new(activity_ref: impl Into<String>) -> Self {
        Self {
            activity_ref: activity_ref.into(),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn setting(mut self, name: impl Into<String>, value: Value) -> Self {
        self.settings.insert(name.into(), value);
        self
    }

    pub fn input(mut self, name: impl Into<String>, expr: impl Into<Value>) -> Self {
        self.input.insert(name.into(), expr.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>, expr: impl Into<Value>) -> Self {
        self.output.insert(name.into(), expr.into());
        self
    }

    /// Configured name, or `<last ref segment>_<index>`
    pub fn stage_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => {
                let base = self
                    .activity_ref
                    .rsplit(['/', ':'])
                    .next()
                    .filter(|s| !s.is_empty())
                    .unwrap_or("stage");
                format!("{}_{}", base, index)
            }
        }
    }
}

/// Declared pipeline-level inputs and outputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IoMetadata {
    #[serde(default)]
    pub input: Vec<Attribute>,

    #[serde(default)]
    pub output: Vec<Attribute>,
}

/// A named, typed pipeline attribute with an optional default value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: AttributeType,

    /// Default applied to the partition scope when the input is absent
    #[serde(default)]
    pub value: Option<Value>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, kind: AttributeType) -> Self {
        Self {
            name: name.into(),
            kind,
            value: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }
}

/// Attribute value types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    #[default]
    Any,
    String,
    Integer,
    #[serde(alias = "float", alias = "double")]
    Number,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "params", alias = "map")]
    Object,
    Array,
}

impl AttributeType {
    /// Whether a JSON value conforms to this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            AttributeType::Any => true,
            AttributeType::String => value.is_string(),
            AttributeType::Integer => value.is_i64() || value.is_u64(),
            AttributeType::Number => value.is_number(),
            AttributeType::Boolean => value.is_boolean(),
            AttributeType::Object => value.is_object(),
            AttributeType::Array => value.is_array(),
        }
    }
}

impl DefinitionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_metadata(mut self, metadata: IoMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Load pipeline configuration from a file. `.json` files are parsed as
    /// JSON, everything else as YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let parsed = if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        };
        parsed.with_context(|| format!("Invalid pipeline file {}", path.display()))
    }

    /// Parse pipeline configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DefinitionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse pipeline configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: DefinitionConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Pipeline name must not be empty");
        }

        let mut seen_names = HashSet::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.activity_ref.trim().is_empty() {
                anyhow::bail!("Stage {} has an empty activity reference", index);
            }
            if let Some(name) = &stage.name {
                if !seen_names.insert(name.as_str()) {
                    anyhow::bail!("Duplicate stage name: {}", name);
                }
            }
        }

        if let Some(metadata) = &self.metadata {
            check_attributes("input", &metadata.input)?;
            check_attributes("output", &metadata.output)?;
        }

        Ok(())
    }

    pub fn input_attributes(&self) -> &[Attribute] {
        self.metadata.as_ref().map_or(&[], |m| m.input.as_slice())
    }

    pub fn output_attributes(&self) -> &[Attribute] {
        self.metadata.as_ref().map_or(&[], |m| m.output.as_slice())
    }
}

fn check_attributes(direction: &str, attributes: &[Attribute]) -> Result<()> {
    let mut seen = HashSet::new();
    for attr in attributes {
        if attr.name.trim().is_empty() {
            anyhow::bail!("Pipeline {} attribute with an empty name", direction);
        }
        if !seen.insert(attr.name.as_str()) {
            anyhow::bail!("Duplicate pipeline {} attribute: {}", direction, attr.name);
        }
        if let Some(default) = &attr.value {
            if !attr.kind.accepts(default) {
                anyhow::bail!(
                    "Default of {} attribute '{}' is not of type {:?}",
                    direction,
                    attr.name,
                    attr.kind
                );
            }
        }
    }
    Ok(())
}
