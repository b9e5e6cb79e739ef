//! Build and builder identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::Error;

/// A 64-bit build identifier.
///
/// Ids are time-sortable: a larger id belongs to an older build, so sorting
/// ids in descending order approximates descending creation time.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct BuildId(i64);

impl BuildId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for BuildId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<BuildId> for i64 {
    fn from(id: BuildId) -> Self {
        id.0
    }
}

impl std::str::FromStr for BuildId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifies a builder: the `(project, bucket, builder)` composite key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{project}/{bucket}/{builder}")]
pub struct BuilderId {
    pub project: String,
    pub bucket: String,
    pub builder: String,
}

impl BuilderId {
    pub fn new(
        project: impl Into<String>,
        bucket: impl Into<String>,
        builder: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            bucket: bucket.into(),
            builder: builder.into(),
        }
    }

    /// `project/bucket`.
    pub fn bucket_id(&self) -> String {
        format!("{}/{}", self.project, self.bucket)
    }

    /// Checks that every component is present and contains no `/`.
    pub fn validate(&self) -> crate::Result<()> {
        for (name, value) in [
            ("project", &self.project),
            ("bucket", &self.bucket),
            ("builder", &self.builder),
        ] {
            if value.is_empty() {
                return Err(Error::invalid(format!("{name} must be specified")));
            }
            if value.contains('/') {
                return Err(Error::invalid(format!("{name} must not contain '/'")));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for BuilderId {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(project), Some(bucket), Some(builder)) => {
                let id = Self::new(project, bucket, builder);
                id.validate()?;
                Ok(id)
            }
            _ => Err(Error::invalid(format!(
                "builder id {s:?} must look like project/bucket/builder"
            ))),
        }
    }
}
