//! Temporary STS credentials

use chrono::{DateTime, Utc};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

use super::aws::DEFAULT_REGION;
use super::{
    from_json, prompt_name, required, to_json, verify_caller, Capabilities, MountSnippet,
    Profile, Verification,
};
use crate::error::{Error, Result};
use crate::issuer::{AwsCredentials, Authorities};
use crate::prompt::Prompter;

/// Mount path shared by every session profile, one INI section each
pub const CREDENTIALS_FILE: &str = "aws/credentials";

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AwsSessionProfile {
    pub name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub region: String,
    pub expiration: Option<DateTime<Utc>>,
}

impl AwsSessionProfile {
    pub const KIND: &'static str = "aws-session";

    pub(crate) fn boxed() -> Box<dyn Profile> {
        Box::new(Self::default())
    }

    fn credentials(&self) -> AwsCredentials<'_> {
        AwsCredentials {
            access_key_id: &self.access_key_id,
            secret_access_key: &self.secret_access_key,
            session_token: Some(&self.session_token),
        }
    }

    fn expired_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expiration.filter(|expiration| *expiration <= now)
    }
}

impl Drop for AwsSessionProfile {
    fn drop(&mut self) {
        self.secret_access_key.zeroize();
        self.session_token.zeroize();
    }
}

impl Profile for AwsSessionProfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            mount: true,
            verify: true,
            rotate: false,
        }
    }

    fn prompt(&mut self, prompter: &mut dyn Prompter) -> Result<()> {
        let name = prompt_name(prompter)?;
        let access_key_id = required(prompter, "Access key ID", false)?;
        let secret_access_key = Zeroizing::new(required(prompter, "Secret access key", true)?);
        let session_token = Zeroizing::new(required(prompter, "Session token", true)?);
        let region = prompter.field(&format!("Region [{}]", DEFAULT_REGION), false)?;
        let expiration = required(prompter, "Expiration (RFC 3339)", false)?;
        let expiration = DateTime::parse_from_rfc3339(&expiration)
            .map_err(|e| Error::Profile(format!("invalid expiration '{}': {}", expiration, e)))?
            .with_timezone(&Utc);

        self.name = name;
        self.access_key_id = access_key_id;
        self.secret_access_key = secret_access_key.to_string();
        self.session_token = session_token.to_string();
        self.region = if region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            region
        };
        self.expiration = Some(expiration);
        Ok(())
    }

    fn serialize(&self) -> Result<Zeroizing<Vec<u8>>> {
        to_json(self)
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        *self = from_json(Self::KIND, data)?;
        Ok(())
    }

    fn mount_snippet(&self) -> Option<MountSnippet> {
        let section = format!(
            "[{}]\naws_access_key_id = {}\naws_secret_access_key = {}\naws_session_token = {}\nregion = {}\n\n",
            self.name, self.access_key_id, self.secret_access_key, self.session_token, self.region
        );

        Some(MountSnippet {
            path: CREDENTIALS_FILE.to_string(),
            content: Zeroizing::new(section.into_bytes()),
        })
    }

    fn verify(&self, authorities: &Authorities) -> Result<Verification> {
        if let Some(expiration) = self.expired_at(Utc::now()) {
            return Ok(Verification {
                ok: false,
                message: format!("expired at {}", expiration.to_rfc3339()),
            });
        }
        verify_caller(authorities.aws.as_ref(), self.credentials())
    }
}

impl fmt::Display for AwsSessionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Name: {}", self.name)?;
        writeln!(f, "Type: {}", Self::KIND)?;
        writeln!(f, "Access key ID: {}", self.access_key_id)?;
        writeln!(f, "Secret access key: {}", self.secret_access_key)?;
        writeln!(f, "Session token: {}", self.session_token)?;
        writeln!(f, "Region: {}", self.region)?;
        match self.expiration {
            Some(expiration) => write!(f, "Expiration: {}", expiration.to_rfc3339()),
            None => write!(f, "Expiration: unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::fake::FakeAws;
    use crate::prompt::scripted::ScriptedPrompter;
    use chrono::TimeZone;

    fn sample(expiration: DateTime<Utc>) -> AwsSessionProfile {
        AwsSessionProfile {
            name: "dev".to_string(),
            access_key_id: "ASIADEV".to_string(),
            secret_access_key: "dev-secret".to_string(),
            session_token: "dev-token".to_string(),
            region: "us-west-2".to_string(),
            expiration: Some(expiration),
        }
    }

    fn future() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2999, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_serialize_roundtrip() {
        let profile = sample(future());
        let mut restored = AwsSessionProfile::default();
        restored.deserialize(&profile.serialize().unwrap()).unwrap();
        assert_eq!(restored, profile);
    }

    #[test]
    fn test_prompt_parses_expiration() {
        let mut prompter = ScriptedPrompter::new(
            &["dev", "ASIADEV", "dev-secret", "dev-token", "", "2030-05-01T12:00:00+02:00"],
            "unused",
        );
        let mut profile = AwsSessionProfile::default();
        profile.prompt(&mut prompter).unwrap();

        assert_eq!(profile.region, DEFAULT_REGION);
        assert_eq!(
            profile.expiration,
            Some(Utc.with_ymd_and_hms(2030, 5, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_prompt_rejects_bad_expiration() {
        let mut prompter = ScriptedPrompter::new(
            &["dev", "ASIADEV", "dev-secret", "dev-token", "", "tomorrow"],
            "unused",
        );
        let mut profile = AwsSessionProfile::default();
        assert!(matches!(
            profile.prompt(&mut prompter),
            Err(Error::Profile(_))
        ));
        assert_eq!(profile, AwsSessionProfile::default());
    }

    #[test]
    fn test_mount_snippet() {
        let snippet = sample(future()).mount_snippet().unwrap();
        assert_eq!(snippet.path, CREDENTIALS_FILE);

        let content = String::from_utf8(snippet.content.to_vec()).unwrap();
        assert!(content.starts_with("[dev]\n"));
        assert!(content.contains("aws_secret_access_key = dev-secret\n"));
        assert!(content.contains("aws_session_token = dev-token\n"));
        assert!(content.contains("region = us-west-2\n"));
    }

    #[test]
    fn test_verify_expired_is_offline() {
        let fake = FakeAws::with_key("ASIADEV", "dev-secret");
        fake.account.borrow_mut().offline = true;

        let past = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let verified = sample(past).verify(&fake.authorities()).unwrap();
        assert!(!verified.ok);
        assert!(verified.message.starts_with("expired at 2000-01-01"));
    }

    #[test]
    fn test_verify_live_calls_sts() {
        let fake = FakeAws::with_key("ASIADEV", "dev-secret");
        assert!(sample(future()).verify(&fake.authorities()).unwrap().ok);
    }
}
