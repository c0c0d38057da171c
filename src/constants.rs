//! Provider constants: availability zones, instance-type classes and
//! control-plane endpoints.

use crate::error::{Error, Result};

pub const AVAILABILITY_ZONES: &[&str] = &[
    "us-east-1a",
    "us-east-1b",
    "us-east-1c",
    "us-east-1d",
    "us-west-1a",
    "us-west-1b",
    "us-west-1c",
    "eu-west-1a",
    "eu-west-1b",
    "eu-west-1c",
    "ap-southeast-1a",
    "ap-southeast-1b",
    "ap-northeast-1a",
    "ap-northeast-1b",
];

pub const INSTANCE_TYPES_32_BIT: &[&str] = &["m1.small", "c1.medium", "t1.micro"];

pub const INSTANCE_TYPES_64_BIT: &[&str] = &[
    "m1.small",
    "m1.medium",
    "m1.large",
    "m1.xlarge",
    "m2.xlarge",
    "m2.2xlarge",
    "m2.4xlarge",
    "c1.medium",
    "c1.xlarge",
    "cc1.4xlarge",
    "cc2.8xlarge",
    "t1.micro",
];

/// Machine-image architecture class
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Architecture {
    I686,
    X86_64,
}

impl Architecture {
    /// Architecture class for an instance type. Types present in both the
    /// 32-bit and 64-bit lists resolve to `X86_64`.
    pub fn for_instance_type(instance_type: &str) -> Result<Architecture> {
        if INSTANCE_TYPES_64_BIT.contains(&instance_type) {
            Ok(Architecture::X86_64)
        } else if INSTANCE_TYPES_32_BIT.contains(&instance_type) {
            Ok(Architecture::I686)
        } else {
            Err(Error::ValidationError(format!(
                "unknown instance type: {instance_type}"
            )))
        }
    }
}

/// Strip the trailing zone letter: `eu-west-1a` -> `eu-west-1`
pub fn zone_to_region(zone: &str) -> Result<String> {
    if !AVAILABILITY_ZONES.contains(&zone) {
        return Err(Error::ValidationError(format!(
            "unknown availability zone: {zone}"
        )));
    }
    Ok(zone[..zone.len() - 1].to_string())
}

pub fn validate_zone(zone: &str) -> Result<()> {
    zone_to_region(zone).map(|_| ())
}

pub fn validate_instance_type(instance_type: &str) -> Result<()> {
    Architecture::for_instance_type(instance_type).map(|_| ())
}
