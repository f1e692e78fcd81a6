//! Long-lived IAM access keys

use std::fmt;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use super::{
    from_json, prompt_name, required, to_json, verify_caller, Capabilities, Profile,
    Rotated, Verification,
};
use crate::error::Result;
use crate::issuer::{AwsCredentials, Authorities};
use crate::prompt::Prompter;

pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AwsProfile {
    pub name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

impl AwsProfile {
    pub const KIND: &'static str = "aws";

    pub(crate) fn boxed() -> Box<dyn Profile> {
        Box::new(Self::default())
    }

    fn credentials(&self) -> AwsCredentials<'_> {
        AwsCredentials {
            access_key_id: &self.access_key_id,
            secret_access_key: &self.secret_access_key,
            session_token: None,
        }
    }
}

impl Drop for AwsProfile {
    fn drop(&mut self) {
        self.secret_access_key.zeroize();
    }
}

impl Profile for AwsProfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            mount: false,
            verify: true,
            rotate: true,
        }
    }

    fn prompt(&mut self, prompter: &mut dyn Prompter) -> Result<()> {
        let name = prompt_name(prompter)?;
        let access_key_id = required(prompter, "Access key ID", false)?;
        let secret_access_key = Zeroizing::new(required(prompter, "Secret access key", true)?);
        let region = prompter.field(&format!("Region [{}]", DEFAULT_REGION), false)?;

        self.name = name;
        self.access_key_id = access_key_id;
        self.secret_access_key = secret_access_key.to_string();
        self.region = if region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            region
        };
        Ok(())
    }

    fn serialize(&self) -> Result<Zeroizing<Vec<u8>>> {
        to_json(self)
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        *self = from_json(Self::KIND, data)?;
        Ok(())
    }

    fn verify(&self, authorities: &Authorities) -> Result<Verification> {
        verify_caller(authorities.aws.as_ref(), self.credentials())
    }

    /// Issue a new key signed with the old one, then delete the old key
    /// signed with the new one.
    fn rotate(&self, authorities: &Authorities) -> Result<Rotated> {
        let issued = authorities.aws.create_access_key(self.credentials())?;
        debug!(profile = %self.name, new_key = %issued.access_key_id, "issued access key");

        let mut next = self.clone();
        next.access_key_id = issued.access_key_id.clone();
        next.secret_access_key = issued.secret_access_key.clone();

        let summary = match authorities
            .aws
            .delete_access_key(next.credentials(), &self.access_key_id)
        {
            Ok(()) => format!(
                "replaced access key {} with {}",
                self.access_key_id, next.access_key_id
            ),
            // Keep the new key even if the old one survives
            Err(e) => {
                warn!(profile = %self.name, old_key = %self.access_key_id, "failed to delete old access key: {}", e);
                format!(
                    "issued access key {}, but old key {} is still active: {}",
                    next.access_key_id, self.access_key_id, e
                )
            }
        };

        let mut issued = issued;
        issued.secret_access_key.zeroize();

        Ok(Rotated {
            serialized: next.serialize()?,
            summary,
        })
    }
}

impl fmt::Display for AwsProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Name: {}", self.name)?;
        writeln!(f, "Type: {}", Self::KIND)?;
        writeln!(f, "Access key ID: {}", self.access_key_id)?;
        writeln!(f, "Secret access key: {}", self.secret_access_key)?;
        write!(f, "Region: {}", self.region)
    }
}
