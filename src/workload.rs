use crate::error::{Result, SandboxError};
use crate::substitution::{SubstitutionContext, SubstitutionResolver, Template};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A single entry of a workload's runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parameter {
    Value { name: String, value: Template },
    File { file: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remapping {
    pub from: Template,
    pub to: Template,
}

/// Immutable description of one runnable unit to place inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadDescriptor {
    package: Template,
    executable: Template,
    name: Option<Template>,
    namespace: Template,
    parameters: Option<Vec<Parameter>>,
    remappings: Option<Vec<Remapping>>,
}

impl WorkloadDescriptor {
    pub fn builder(
        package: impl Into<Template>,
        executable: impl Into<Template>,
    ) -> WorkloadDescriptorBuilder {
        WorkloadDescriptorBuilder {
            package: package.into(),
            executable: executable.into(),
            name: None,
            namespace: Template::default(),
            parameters: None,
            remappings: None,
        }
    }

    /// Shorthand for a workload without name, namespace, parameters or remappings.
    pub fn new(package: impl Into<Template>, executable: impl Into<Template>) -> Result<Self> {
        Self::builder(package, executable).build()
    }

    pub fn package(&self) -> &Template {
        &self.package
    }

    pub fn executable(&self) -> &Template {
        &self.executable
    }

    pub fn name(&self) -> Option<&Template> {
        self.name.as_ref()
    }

    pub fn namespace(&self) -> &Template {
        &self.namespace
    }

    pub fn parameters(&self) -> Option<&[Parameter]> {
        self.parameters.as_deref()
    }

    pub fn remappings(&self) -> Option<&[Remapping]> {
        self.remappings.as_deref()
    }

    /// Label used in logs before the templates are resolved.
    pub fn label(&self) -> String {
        format!("{}/{}", self.package, self.executable)
    }

    /// Resolves every templated field against the current launch configurations.
    pub fn resolve(
        &self,
        resolver: &dyn SubstitutionResolver,
        context: &SubstitutionContext,
    ) -> Result<ResolvedWorkload> {
        let field = |field: &str, template: &Template| {
            resolver.resolve(template, context).map_err(|e| SandboxError::Injection {
                workload: self.label(),
                reason: format!("field `{}`: {}", field, e),
            })
        };

        let package = field("package", &self.package)?;
        let executable = field("executable", &self.executable)?;
        let name = self.name.as_ref().map(|n| field("name", n)).transpose()?;
        let namespace = field("namespace", &self.namespace)?;

        let mut parameters = Vec::new();
        for parameter in self.parameters.iter().flatten() {
            parameters.push(match parameter {
                Parameter::Value { name, value } => ResolvedParameter::Value {
                    name: name.clone(),
                    value: field("parameters", value)?,
                },
                Parameter::File { file } => ResolvedParameter::File(file.clone()),
            });
        }

        let mut remappings = Vec::new();
        for rule in self.remappings.iter().flatten() {
            remappings.push((field("remappings", &rule.from)?, field("remappings", &rule.to)?));
        }

        Ok(ResolvedWorkload {
            package,
            executable,
            name,
            namespace,
            parameters,
            remappings,
        })
    }
}

pub struct WorkloadDescriptorBuilder {
    package: Template,
    executable: Template,
    name: Option<Template>,
    namespace: Template,
    parameters: Option<Vec<Parameter>>,
    remappings: Option<Vec<Remapping>>,
}

impl WorkloadDescriptorBuilder {
    pub fn name(mut self, name: impl Into<Template>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<Template>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Template>) -> Self {
        self.parameters.get_or_insert_with(Vec::new).push(Parameter::Value {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn parameter_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.parameters
            .get_or_insert_with(Vec::new)
            .push(Parameter::File { file: file.into() });
        self
    }

    pub fn remap(mut self, from: impl Into<Template>, to: impl Into<Template>) -> Self {
        self.remappings.get_or_insert_with(Vec::new).push(Remapping {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn build(self) -> Result<WorkloadDescriptor> {
        if self.package.is_empty() {
            return Err(SandboxError::configuration("workload package must not be empty"));
        }
        if self.executable.is_empty() {
            return Err(SandboxError::configuration(format!(
                "workload executable must not be empty (package {})",
                self.package
            )));
        }
        if let Some(Parameter::Value { name, .. }) = self
            .parameters
            .iter()
            .flatten()
            .find(|p| matches!(p, Parameter::Value { name, .. } if name.trim().is_empty()))
        {
            return Err(SandboxError::configuration(format!(
                "parameter name '{}' is invalid for workload {}/{}",
                name, self.package, self.executable
            )));
        }

        Ok(WorkloadDescriptor {
            package: self.package,
            executable: self.executable,
            name: self.name,
            namespace: self.namespace,
            parameters: self.parameters,
            remappings: self.remappings,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedParameter {
    Value { name: String, value: String },
    File(PathBuf),
}

/// A workload with every template substituted, ready to become a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWorkload {
    pub package: String,
    pub executable: String,
    pub name: Option<String>,
    pub namespace: String,
    pub parameters: Vec<ResolvedParameter>,
    pub remappings: Vec<(String, String)>,
}

impl ResolvedWorkload {
    pub fn label(&self) -> String {
        format!("{}/{}", self.package, self.executable)
    }

    /// `ros2 run <package> <executable> [--ros-args ...]`
    pub fn command(&self) -> Vec<String> {
        let mut cmd = vec![
            "ros2".to_string(),
            "run".to_string(),
            self.package.clone(),
            self.executable.clone(),
        ];

        let mut ros_args = Vec::new();
        if let Some(name) = &self.name {
            ros_args.push("-r".to_string());
            ros_args.push(format!("__node:={}", name));
        }
        if !self.namespace.is_empty() {
            ros_args.push("-r".to_string());
            ros_args.push(format!("__ns:={}", self.namespace));
        }
        for parameter in &self.parameters {
            match parameter {
                ResolvedParameter::Value { name, value } => {
                    ros_args.push("-p".to_string());
                    ros_args.push(format!("{}:={}", name, value));
                }
                ResolvedParameter::File(path) => {
                    ros_args.push("--params-file".to_string());
                    ros_args.push(path.display().to_string());
                }
            }
        }
        for (from, to) in &self.remappings {
            ros_args.push("-r".to_string());
            ros_args.push(format!("{}:={}", from, to));
        }

        if !ros_args.is_empty() {
            cmd.push("--ros-args".to_string());
            cmd.extend(ros_args);
        }
        cmd
    }
}
