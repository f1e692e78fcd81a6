//! Static API tokens

use std::fmt;
use zeroize::{Zeroize, Zeroizing};

use super::{from_json, prompt_name, required, to_json, Capabilities, MountSnippet, Profile};
use crate::error::Result;
use crate::prompt::Prompter;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenProfile {
    pub name: String,
    pub token: String,
    pub service: String,
}

impl TokenProfile {
    pub const KIND: &'static str = "token";

    pub(crate) fn boxed() -> Box<dyn Profile> {
        Box::new(Self::default())
    }
}

impl Drop for TokenProfile {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

impl Profile for TokenProfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            mount: true,
            verify: false,
            rotate: false,
        }
    }

    fn prompt(&mut self, prompter: &mut dyn Prompter) -> Result<()> {
        let name = prompt_name(prompter)?;
        let service = required(prompter, "Service", false)?;
        let token = Zeroizing::new(required(prompter, "Token", true)?);

        self.name = name;
        self.service = service;
        self.token = token.to_string();
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
        let mut content = Zeroizing::new(Vec::with_capacity(self.token.len() + 1));
        content.extend_from_slice(self.token.as_bytes());
        content.push(b'\n');

        Some(MountSnippet {
            path: format!("tokens/{}", self.name),
            content,
        })
    }
}

impl fmt::Display for TokenProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Name: {}", self.name)?;
        writeln!(f, "Type: {}", Self::KIND)?;
        writeln!(f, "Service: {}", self.service)?;
        write!(f, "Token: {}", self.token)
    }
}
