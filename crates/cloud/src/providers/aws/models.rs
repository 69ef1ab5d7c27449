//! AWS CLI request and response models.

use serde::{Deserialize, Serialize};

// ============================================================================
// IAM
// ============================================================================

/// An IAM policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<PolicyStatement>,
}

/// A single IAM policy statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyStatement {
    pub effect: String,
    pub action: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl PolicyDocument {
    /// A 2012-10-17 policy document with the given statements.
    #[must_use]
    pub fn new(statement: Vec<PolicyStatement>) -> Self {
        Self {
            version: "2012-10-17".to_string(),
            statement,
        }
    }
}

impl PolicyStatement {
    /// An `Allow` statement over `resource`.
    #[must_use]
    pub fn allow(actions: &[&str], resource: impl Into<String>) -> Self {
        Self {
            effect: "Allow".to_string(),
            action: actions.iter().map(ToString::to_string).collect(),
            principal: None,
            resource: Some(resource.into()),
        }
    }
}

// ============================================================================
// STS
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct CallerIdentity {
    pub account: String,
}

// ============================================================================
// EC2
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DescribeInstanceTypesResponse {
    pub instance_types: Vec<InstanceTypeInfo>,
}

/// Hardware description of an EC2 instance type.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceTypeInfo {
    pub instance_type: String,
    pub v_cpu_info: VCpuInfo,
    pub memory_info: MemoryInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VCpuInfo {
    pub default_v_cpus: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemoryInfo {
    #[serde(rename = "SizeInMiB")]
    pub size_in_mib: u32,
}

// ============================================================================
// S3
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ListObjectsResponse {
    #[serde(default)]
    pub contents: Vec<S3Object>,
}

/// An object in an S3 bucket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct S3Object {
    pub key: String,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub size: u64,
}
