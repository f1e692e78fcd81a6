//! Static table of profile types

use super::aws::AwsProfile;
use super::aws_session::AwsSessionProfile;
use super::token::TokenProfile;
use super::Profile;
use crate::error::{Error, Result};

struct Registration {
    kind: &'static str,
    description: &'static str,
    build: fn() -> Box<dyn Profile>,
}

const REGISTRY: &[Registration] = &[
    Registration {
        kind: AwsProfile::KIND,
        description: "Long-lived AWS IAM access key pair. Supports verify and rotate.",
        build: AwsProfile::boxed,
    },
    Registration {
        kind: AwsSessionProfile::KIND,
        description: "Temporary AWS STS credentials with a session token. \
                      Supports mount (as aws/credentials) and verify.",
        build: AwsSessionProfile::boxed,
    },
    Registration {
        kind: TokenProfile::KIND,
        description: "Static API token for a named service. Supports mount (as tokens/<name>).",
        build: TokenProfile::boxed,
    },
];

fn lookup(kind: &str) -> Result<&'static Registration> {
    REGISTRY
        .iter()
        .find(|r| r.kind == kind)
        .ok_or_else(|| Error::UnknownType(kind.to_string()))
}

/// Registered type tags, in registration order
pub fn list() -> Vec<&'static str> {
    REGISTRY.iter().map(|r| r.kind).collect()
}

pub fn describe(kind: &str) -> Result<&'static str> {
    lookup(kind).map(|r| r.description)
}

/// An empty profile of the given type
pub fn new_profile(kind: &str) -> Result<Box<dyn Profile>> {
    lookup(kind).map(|r| (r.build)())
}
