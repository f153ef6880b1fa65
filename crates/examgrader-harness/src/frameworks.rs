//! Unit-test framework registry.
//!
//! A framework is a named link recipe: the flags appended after a unit-test suite's sources,
//! an optional compiler override, and the arguments the built suite runs with by default.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameworkSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler: Option<String>,
    #[serde(default)]
    pub link_flags: Vec<String>,
    #[serde(default)]
    pub default_args: Vec<String>,
}

impl FrameworkSpec {
    /// googletest linked from the system library path.
    #[must_use]
    pub fn gtest() -> Self {
        Self {
            name: "gtest".to_string(),
            compiler: None,
            link_flags: vec!["-lgtest".to_string(), "-lpthread".to_string()],
            default_args: vec!["--gtest_color=no".to_string()],
        }
    }

    /// Check link flags: only `-l<lib>` and `-L<existing dir>` are accepted.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let fail = |message: String| HarnessError::Framework {
            name: self.name.clone(),
            message,
        };
        if self.name.trim().is_empty() {
            return Err(fail("framework name must not be empty".to_string()));
        }
        for flag in &self.link_flags {
            if let Some(dir) = flag.strip_prefix("-L") {
                if dir.is_empty() || !Path::new(dir).is_dir() {
                    return Err(fail(format!("link directory '{dir}' does not exist")));
                }
            } else if !flag.starts_with("-l") || flag.len() == 2 {
                return Err(fail(format!(
                    "link flag '{flag}' must be -l<library> or -L<directory>"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FrameworkRegistry {
    frameworks: BTreeMap<String, FrameworkSpec>,
}

impl FrameworkRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(
        specs: impl IntoIterator<Item = FrameworkSpec>,
    ) -> Result<Self, HarnessError> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, spec: FrameworkSpec) -> Result<(), HarnessError> {
        spec.validate()?;
        if self.frameworks.contains_key(&spec.name) {
            return Err(HarnessError::Framework {
                name: spec.name,
                message: "registered twice".to_string(),
            });
        }
        self.frameworks.insert(spec.name.clone(), spec);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FrameworkSpec> {
        self.frameworks.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.frameworks.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frameworks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frameworks.is_empty()
    }
}
