use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

static PERM_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:/+-]*$").expect("permId pattern compiles")
});

/// Record kinds exposed by the openBIS query API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum EntityKind {
    Sample,
    #[value(name = "dataset")]
    DataSet,
    Experiment,
    #[value(name = "dataset-file")]
    DataSetFile,
}

impl EntityKind {
    /// Type name as the external system spells it in queries.
    pub fn type_name(&self) -> &'static str {
        match self {
            EntityKind::Sample => "Sample",
            EntityKind::DataSet => "DataSet",
            EntityKind::Experiment => "Experiment",
            EntityKind::DataSetFile => "DataSetFile",
        }
    }

    /// Key of the record array in a query response.
    pub fn json_key(&self) -> &'static str {
        match self {
            EntityKind::Sample => "samples",
            EntityKind::DataSet => "datasets",
            EntityKind::Experiment => "experiments",
            EntityKind::DataSetFile => "datasetfiles",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermId(String);

impl PermId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PermId {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !PERM_ID_PATTERN.is_match(normalized) {
            return Err(MirrorError::InvalidPermId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for PermId {
    type Error = MirrorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PermId> for String {
    fn from(value: PermId) -> Self {
        value.0
    }
}

/// Identifier of a locally persisted mirror record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(u64);

impl LocalId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.trim().parse().map(Self)
    }
}

/// The local object (an assay) that mirrors are attached to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
