// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Absolute object paths.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// An absolute path to a node in the service namespace.
///
/// Paths begin with `//` and are otherwise opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YPath(String);

impl YPath {
    /// Validates and wraps a path string.
    pub fn new(path: impl Into<String>) -> Result<Self, Error> {
        let path = path.into();
        if !path.starts_with("//") {
            return Err(Error::InvalidArgument(format!(
                "path {:?} is not absolute (must begin with \"//\")",
                path
            )));
        }
        if path.len() == 2 {
            return Err(Error::InvalidArgument("path must name a node below the root".into()));
        }
        Ok(Self(path))
    }

    /// Returns the path string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the path of an attribute of this node (`<path>/@<name>`).
    pub fn attribute(&self, name: &str) -> String {
        format!("{}/@{}", self.0, name)
    }
}

impl TryFrom<String> for YPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        YPath::new(value)
    }
}

impl TryFrom<&str> for YPath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        YPath::new(value)
    }
}

impl From<YPath> for String {
    fn from(path: YPath) -> Self {
        path.0
    }
}

impl AsRef<str> for YPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for YPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
