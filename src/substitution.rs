use crate::error::{Result, SandboxError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// `$(kind argument)` as used by launch files, e.g. `$(var robot_name)`.
fn substitution_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\(\s*([A-Za-z][\w-]*)(?:\s+([^)]*?))?\s*\)").expect("valid substitution regex")
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    Text(String),
    Substitution { kind: String, argument: String },
}

/// A textual field whose final value is only known once the launch
/// configurations are available.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in substitution_pattern().captures_iter(source) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.start() > last {
                segments.push(Segment::Text(source[last..whole.start()].to_string()));
            }
            segments.push(Segment::Substitution {
                kind: caps[1].to_string(),
                argument: caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
            });
            last = whole.end();
        }

        if last < source.len() {
            segments.push(Segment::Text(source[last..].to_string()));
        }

        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Text(t) if t.is_empty()))
    }

    /// Returns the text if the template contains no substitutions.
    pub fn as_literal(&self) -> Option<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Substitution { .. } => return None,
            }
        }
        Some(out)
    }
}

impl From<&str> for Template {
    fn from(s: &str) -> Self {
        Template::parse(s)
    }
}

impl From<String> for Template {
    fn from(s: String) -> Self {
        Template::parse(&s)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => f.write_str(t)?,
                Segment::Substitution { kind, argument } if argument.is_empty() => {
                    write!(f, "$({})", kind)?
                }
                Segment::Substitution { kind, argument } => write!(f, "$({} {})", kind, argument)?,
            }
        }
        Ok(())
    }
}

impl Serialize for Template {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Template::parse(&s))
    }
}

/// Launch configurations visible to substitutions at the time workloads are injected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstitutionContext {
    launch_configurations: BTreeMap<String, String>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_var(name, value);
        self
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.launch_configurations.insert(name.into(), value.into());
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.launch_configurations.get(name).map(String::as_str)
    }
}

pub trait SubstitutionResolver: Send + Sync {
    fn resolve(&self, template: &Template, context: &SubstitutionContext) -> Result<String>;
}

/// Resolves `$(var NAME)` against launch configurations and `$(env NAME)`
/// against the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver;

impl SubstitutionResolver for DefaultResolver {
    fn resolve(&self, template: &Template, context: &SubstitutionContext) -> Result<String> {
        let mut out = String::new();
        for segment in template.segments() {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Substitution { kind, argument } => match kind.as_str() {
                    "var" => {
                        let value = context.var(argument).ok_or_else(|| {
                            SandboxError::configuration(format!(
                                "launch configuration '{}' does not exist",
                                argument
                            ))
                        })?;
                        out.push_str(value);
                    }
                    "env" => {
                        let value = std::env::var(argument).map_err(|_| {
                            SandboxError::configuration(format!(
                                "environment variable '{}' does not exist",
                                argument
                            ))
                        })?;
                        out.push_str(&value);
                    }
                    other => {
                        return Err(SandboxError::configuration(format!(
                            "unknown substitution '{}'",
                            other
                        )))
                    }
                },
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_template() {
        let template = Template::parse("prefix_$(var robot)_$(env USER)");
        assert_eq!(
            template.segments(),
            &[
                Segment::Text("prefix_".into()),
                Segment::Substitution {
                    kind: "var".into(),
                    argument: "robot".into()
                },
                Segment::Text("_".into()),
                Segment::Substitution {
                    kind: "env".into(),
                    argument: "USER".into()
                },
            ]
        );
        assert_eq!(template.to_string(), "prefix_$(var robot)_$(env USER)");
        assert_eq!(template.as_literal(), None);
    }

    #[test]
    fn test_literal_template() {
        let template = Template::from("demo_nodes_cpp");
        assert_eq!(template.as_literal().as_deref(), Some("demo_nodes_cpp"));
        assert!(!template.is_empty());
        assert!(Template::from("").is_empty());
    }

    #[test]
    fn test_resolve_launch_configuration() {
        let ctx = SubstitutionContext::new().with_var("pkg", "demo_nodes_py");
        let resolved = DefaultResolver
            .resolve(&Template::parse("$(var pkg)"), &ctx)
            .unwrap();
        assert_eq!(resolved, "demo_nodes_py");
    }

    #[test]
    fn test_unknown_launch_configuration_fails() {
        let err = DefaultResolver
            .resolve(&Template::parse("$(var missing)"), &SubstitutionContext::new())
            .unwrap_err();
        assert!(err.to_string().contains("missing"));

        let err = DefaultResolver
            .resolve(&Template::parse("$(find-pkg-share x)"), &SubstitutionContext::new())
            .unwrap_err();
        assert!(err.to_string().contains("find-pkg-share"));
    }
}
