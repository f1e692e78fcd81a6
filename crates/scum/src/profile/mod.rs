//! Credential profiles: the typed contents of a bag entry
//!
//! Every variant is registered under a type tag in [`registry`]. The set is
//! closed; dispatch happens through the [`Profile`] trait object returned by
//! [`registry::new_profile`].

pub mod aws;
pub mod aws_session;
pub mod registry;
pub mod token;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use zeroize::Zeroizing;

use crate::error::{Error, IssuerError, Result};
use crate::issuer::{AwsAuthority, AwsCredentials, Authorities};
use crate::prompt::Prompter;

pub use registry::{describe, list, new_profile};

/// What a profile type supports beyond storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub mount: bool,
    pub verify: bool,
    pub rotate: bool,
}

/// Content a profile contributes to one file of the mount tree
pub struct MountSnippet {
    /// Path relative to the mountpoint
    pub path: String,
    pub content: Zeroizing<Vec<u8>>,
}

/// Outcome of checking credentials with their issuing authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub ok: bool,
    pub message: String,
}

/// Replacement material produced by a successful rotation
pub struct Rotated {
    /// The profile to store in place of the old one
    pub serialized: Zeroizing<Vec<u8>>,
    /// Human readable summary, free of secret material
    pub summary: String,
}

/// A credential profile
pub trait Profile: fmt::Display {
    /// Entry name, unique within the bag
    fn name(&self) -> &str;

    /// Registered type tag
    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Populate every field interactively.
    ///
    /// All fields are validated before this returns `Ok`; on error the
    /// profile must not be serialized.
    fn prompt(&mut self, prompter: &mut dyn Prompter) -> Result<()>;

    fn serialize(&self) -> Result<Zeroizing<Vec<u8>>>;

    /// Replace this profile's fields with a stored payload
    fn deserialize(&mut self, data: &[u8]) -> Result<()>;

    /// File content for the mount tree, `None` if the type does not mount
    fn mount_snippet(&self) -> Option<MountSnippet> {
        None
    }

    fn verify(&self, _authorities: &Authorities) -> Result<Verification> {
        Err(unsupported(self.kind(), "verification"))
    }

    fn rotate(&self, _authorities: &Authorities) -> Result<Rotated> {
        Err(unsupported(self.kind(), "key rotation"))
    }
}

fn unsupported(kind: &str, what: &str) -> Error {
    Error::Profile(format!("type {} does not support {}", kind, what))
}

pub(crate) fn to_json<T: Serialize>(profile: &T) -> Result<Zeroizing<Vec<u8>>> {
    serde_json::to_vec(profile)
        .map(Zeroizing::new)
        .map_err(|e| Error::Profile(format!("failed to serialize profile: {}", e)))
}

pub(crate) fn from_json<T: DeserializeOwned>(kind: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data)
        .map_err(|e| Error::Profile(format!("stored {} profile is malformed: {}", kind, e)))
}

/// Prompt for a field that may not be left empty
pub(crate) fn required(prompter: &mut dyn Prompter, label: &str, secret: bool) -> Result<String> {
    let value = prompter.field(label, secret)?;
    if value.is_empty() {
        return Err(Error::Profile(format!("{} must not be empty", label)));
    }
    Ok(value)
}

/// Prompt for the profile name, which doubles as the bag entry name
pub(crate) fn prompt_name(prompter: &mut dyn Prompter) -> Result<String> {
    let name = required(prompter, "Name", false)?;
    crate::bag::validate_name(&name)?;
    Ok(name)
}

/// Check AWS credentials with STS GetCallerIdentity.
///
/// A rejection by AWS is a failed verification; any other fault is an error.
pub(crate) fn verify_caller(
    aws: &dyn AwsAuthority,
    creds: AwsCredentials<'_>,
) -> Result<Verification> {
    match aws.caller_identity(creds) {
        Ok(identity) => Ok(Verification {
            ok: true,
            message: format!("valid for {} (account {})", identity.arn, identity.account),
        }),
        Err(IssuerError::Rejected { code, message }) => Ok(Verification {
            ok: false,
            message: format!("{}: {}", code, message),
        }),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::fake::FakeAws;

    #[test]
    fn test_verify_caller_maps_rejection_to_not_ok() {
        let fake = FakeAws::with_key("AKIAOK", "good");
        let good = AwsCredentials {
            access_key_id: "AKIAOK",
            secret_access_key: "good",
            session_token: None,
        };
        let bad = AwsCredentials {
            secret_access_key: "bad",
            ..good
        };

        let verified = verify_caller(&fake, good).unwrap();
        assert!(verified.ok);
        assert!(verified.message.contains("123456789012"));

        let rejected = verify_caller(&fake, bad).unwrap();
        assert!(!rejected.ok);
        assert!(rejected.message.starts_with("InvalidClientTokenId"));

        fake.account.borrow_mut().offline = true;
        assert!(matches!(
            verify_caller(&fake, good),
            Err(Error::Issuer(IssuerError::Transport { .. }))
        ));
    }
}
