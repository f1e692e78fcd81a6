//! Issuing authorities - the external services that validate or reissue
//! credential material
//!
//! Each credential family talks to its authority through a trait so the
//! profile logic can be exercised without network access.

pub mod aws;

use crate::error::IssuerError;

/// Credentials used to sign a request to AWS
#[derive(Debug, Clone, Copy)]
pub struct AwsCredentials<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub session_token: Option<&'a str>,
}

/// Result of STS GetCallerIdentity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
    pub user_id: String,
}

/// A freshly issued IAM access key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedAccessKey {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Operations scum needs from AWS
pub trait AwsAuthority {
    /// Who do these credentials belong to
    fn caller_identity(&self, creds: AwsCredentials<'_>) -> Result<CallerIdentity, IssuerError>;

    /// Issue a new access key for the calling IAM user
    fn create_access_key(&self, creds: AwsCredentials<'_>)
        -> Result<IssuedAccessKey, IssuerError>;

    /// Delete an access key of the calling IAM user
    fn delete_access_key(
        &self,
        creds: AwsCredentials<'_>,
        access_key_id: &str,
    ) -> Result<(), IssuerError>;
}

/// The set of authorities available to verify and rotate operations
pub struct Authorities {
    pub aws: Box<dyn AwsAuthority>,
}

impl Authorities {
    /// Authorities backed by the real services
    pub fn live() -> Result<Self, IssuerError> {
        Ok(Self {
            aws: Box::new(aws::AwsClient::new()?),
        })
    }
}

/// In-memory authorities for tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    /// Shared state of the fake AWS account
    #[derive(Debug, Default)]
    pub(crate) struct FakeAccount {
        /// access key id -> secret
        pub(crate) keys: Vec<(String, String)>,
        pub(crate) deleted: BTreeSet<String>,
        pub(crate) issued: usize,
        pub(crate) offline: bool,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeAws {
        pub(crate) account: Rc<RefCell<FakeAccount>>,
    }

    impl FakeAws {
        pub(crate) fn with_key(access_key_id: &str, secret: &str) -> Self {
            let fake = Self::default();
            fake.account
                .borrow_mut()
                .keys
                .push((access_key_id.to_string(), secret.to_string()));
            fake
        }

        pub(crate) fn authorities(&self) -> Authorities {
            Authorities {
                aws: Box::new(self.clone()),
            }
        }

        fn check(&self, creds: AwsCredentials<'_>) -> Result<(), IssuerError> {
            let account = self.account.borrow();
            if account.offline {
                return Err(IssuerError::Transport {
                    endpoint: "https://fake.amazonaws.com/".to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            let valid = account
                .keys
                .iter()
                .any(|(id, secret)| id == creds.access_key_id && secret == creds.secret_access_key);
            if valid {
                Ok(())
            } else {
                Err(IssuerError::Rejected {
                    code: "InvalidClientTokenId".to_string(),
                    message: "The security token included in the request is invalid.".to_string(),
                })
            }
        }
    }

    impl AwsAuthority for FakeAws {
        fn caller_identity(&self, creds: AwsCredentials<'_>) -> Result<CallerIdentity, IssuerError> {
            self.check(creds)?;
            Ok(CallerIdentity {
                account: "123456789012".to_string(),
                arn: "arn:aws:iam::123456789012:user/alice".to_string(),
                user_id: "AIDAEXAMPLE".to_string(),
            })
        }

        fn create_access_key(
            &self,
            creds: AwsCredentials<'_>,
        ) -> Result<IssuedAccessKey, IssuerError> {
            self.check(creds)?;
            let mut account = self.account.borrow_mut();
            account.issued += 1;
            let key = IssuedAccessKey {
                access_key_id: format!("AKIANEW{:09}", account.issued),
                secret_access_key: format!("new-secret-{}", account.issued),
            };
            account
                .keys
                .push((key.access_key_id.clone(), key.secret_access_key.clone()));
            Ok(key)
        }

        fn delete_access_key(
            &self,
            creds: AwsCredentials<'_>,
            access_key_id: &str,
        ) -> Result<(), IssuerError> {
            self.check(creds)?;
            let mut account = self.account.borrow_mut();
            account.keys.retain(|(id, _)| id != access_key_id);
            account.deleted.insert(access_key_id.to_string());
            Ok(())
        }
    }
}
