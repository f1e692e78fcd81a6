//! One invocation's worth of bag operations
//!
//! A [`Session`] opens the bag and the key pair on first use and asks for
//! the passphrase at most once, and only when an entry actually needs
//! decrypting. Batch operations report per entry; a fault in one entry does
//! not stop the others unless it means no entry could succeed.

use age::secrecy::SecretString;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::bag::Bag;
use crate::config::Config;
use crate::crypt::{keygen, Crypt};
use crate::error::{Error, Result};
use crate::issuer::Authorities;
use crate::mount::{self, CancelToken, MountBackend, MountFiles, MountOptions, MountOutcome};
use crate::profile::{self, Profile, Verification};
use crate::prompt::Prompter;

/// What happened to one entry of a batch
#[derive(Debug)]
pub enum EntryOutcome {
    /// Rendered profile, for `show`
    Shown(String),
    /// Contributed to the mount tree at `path`
    Mounted { path: String },
    Verified(Verification),
    Rotated { summary: String },
    /// New credentials were issued but could not be stored
    RotatedNotPersisted { summary: String, error: Error },
    /// The entry's type lacks the capability the operation needs
    Skipped { capability: &'static str },
    Failed(Error),
}

impl EntryOutcome {
    /// Whether this outcome should make the invocation exit non-zero
    pub fn is_failure(&self) -> bool {
        match self {
            EntryOutcome::Verified(v) => !v.ok,
            EntryOutcome::RotatedNotPersisted { .. } | EntryOutcome::Failed(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct EntryReport {
    pub name: String,
    pub kind: String,
    pub outcome: EntryOutcome,
}

/// Files to mount plus what happened to each matched entry
pub struct MountPlan {
    pub files: MountFiles,
    pub reports: Vec<EntryReport>,
}

/// Type reported for entries whose record cannot be read
pub const UNREADABLE_KIND: &str = "unknown";

pub struct Session<P: Prompter> {
    config: Config,
    prompter: P,
    authorities: Option<Authorities>,
    bag: Option<Bag>,
    crypt: Option<Crypt>,
    passphrase: Option<SecretString>,
}

impl<P: Prompter> Session<P> {
    pub fn new(config: Config, prompter: P) -> Self {
        Self {
            config,
            prompter,
            authorities: None,
            bag: None,
            crypt: None,
            passphrase: None,
        }
    }

    /// Use these authorities instead of the live services
    pub fn with_authorities(mut self, authorities: Authorities) -> Self {
        self.authorities = Some(authorities);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn prompter(&self) -> &P {
        &self.prompter
    }

    pub fn prompter_mut(&mut self) -> &mut P {
        &mut self.prompter
    }

    fn bag(&mut self) -> Result<&Bag> {
        if self.bag.is_none() {
            self.bag = Some(Bag::open(&self.config.bag_path)?);
        }
        self.bag
            .as_ref()
            .ok_or_else(|| Error::Storage("bag is not open".to_string()))
    }

    fn crypt(&mut self) -> Result<&Crypt> {
        if self.crypt.is_none() {
            self.crypt = Some(Crypt::new(
                &self.config.public_key,
                &self.config.private_key,
            )?);
        }
        self.crypt
            .as_ref()
            .ok_or_else(|| Error::InvalidKey("key pair is not loaded".to_string()))
    }

    fn authorities(&mut self) -> Result<&Authorities> {
        if self.authorities.is_none() {
            self.authorities = Some(Authorities::live()?);
        }
        self.authorities
            .as_ref()
            .ok_or_else(|| Error::Profile("no issuing authorities".to_string()))
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.crypt()?;
        if self.passphrase.is_none() {
            let key = self.config.private_key.display().to_string();
            self.passphrase = Some(self.prompter.passphrase(&key)?);
        }

        let (Some(crypt), Some(passphrase)) = (&self.crypt, &self.passphrase) else {
            return Err(Error::InvalidKey("key pair is not loaded".to_string()));
        };

        match crypt.decrypt(ciphertext, passphrase) {
            Ok(plaintext) => Ok(Zeroizing::new(plaintext)),
            Err(e @ Error::Authentication(_)) => {
                // Ask again next time
                self.passphrase = None;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Decrypt and deserialize one entry
    fn load(&mut self, name: &str, kind: &str) -> Result<Box<dyn Profile>> {
        let mut profile = profile::new_profile(kind)?;
        let ciphertext = self.bag()?.read(name, kind)?;
        let plaintext = self.decrypt(&ciphertext)?;
        profile.deserialize(&plaintext)?;

        if profile.name() != name {
            return Err(Error::Profile(format!(
                "entry {} holds profile {}",
                name,
                profile.name()
            )));
        }
        Ok(profile)
    }

    /// Encrypt and store a serialized profile
    fn persist(&mut self, name: &str, kind: &str, serialized: &[u8]) -> Result<()> {
        let ciphertext = self.crypt()?.encrypt(serialized)?;
        self.bag()?.write(name, kind, &ciphertext)
    }

    /// Generate the key pair and create the bag
    pub fn init_keys(&mut self) -> Result<String> {
        let key = self.config.private_key.display().to_string();
        let passphrase = self.prompter.new_passphrase(&key)?;
        let public = keygen::generate(
            &self.config.public_key,
            &self.config.private_key,
            &passphrase,
        )?;
        self.bag()?;
        Ok(public)
    }

    /// Prompt for a new profile of type `kind` and store it.
    ///
    /// An existing entry with the same name is replaced.
    pub fn add(&mut self, kind: &str) -> Result<String> {
        let mut profile = profile::new_profile(kind)?;
        profile.prompt(&mut self.prompter)?;

        let name = profile.name().to_string();
        let serialized = profile.serialize()?;
        self.persist(&name, kind, &serialized)?;

        debug!(name = %name, kind, "added entry");
        Ok(name)
    }

    /// Matching entries, name -> type
    pub fn list(&mut self, patterns: &[String]) -> Result<BTreeMap<String, String>> {
        self.bag()?.list(patterns)
    }

    /// Registered types with their descriptions
    pub fn list_types(&self) -> Vec<(&'static str, &'static str)> {
        profile::list()
            .into_iter()
            .filter_map(|kind| profile::describe(kind).ok().map(|d| (kind, d)))
            .collect()
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        self.bag()?.remove(name)?;
        debug!(name, "removed entry");
        Ok(())
    }

    pub fn show(&mut self, patterns: &[String]) -> Result<Vec<EntryReport>> {
        self.each(patterns, None, |session, name, kind| {
            let profile = session.load(name, kind)?;
            Ok(EntryOutcome::Shown(profile.to_string()))
        })
    }

    /// Collect the mount snippets of every matching mountable entry
    pub fn prepare_mount(&mut self, patterns: &[String]) -> Result<MountPlan> {
        let mut files = MountFiles::new();
        let reports = self.each(patterns, Some("mount"), |session, name, kind| {
            let profile = session.load(name, kind)?;
            let snippet = profile
                .mount_snippet()
                .ok_or_else(|| Error::Profile(format!("{} produced nothing to mount", name)))?;

            files
                .entry(snippet.path.clone())
                .or_insert_with(|| Zeroizing::new(Vec::new()))
                .extend_from_slice(&snippet.content);
            Ok(EntryOutcome::Mounted { path: snippet.path })
        })?;

        Ok(MountPlan { files, reports })
    }

    /// Mount a plan through FUSE until it times out or `cancel` fires
    pub fn mount(
        &self,
        plan: MountPlan,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<MountOutcome> {
        mount::run(&self.mount_options(timeout), plan.files, cancel)
    }

    pub fn mount_with<B: MountBackend>(
        &self,
        backend: &mut B,
        plan: MountPlan,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<MountOutcome> {
        mount::run_with(backend, &self.mount_options(timeout), plan.files, cancel)
    }

    fn mount_options(&self, timeout: Option<Duration>) -> MountOptions {
        MountOptions {
            mountpoint: self.config.mountpoint.clone(),
            timeout: timeout.unwrap_or_else(|| self.config.mount_timeout()),
            debug: self.config.debug,
        }
    }

    pub fn verify(&mut self, patterns: &[String]) -> Result<Vec<EntryReport>> {
        self.each(patterns, Some("verify"), |session, name, kind| {
            let profile = session.load(name, kind)?;
            let verification = profile.verify(session.authorities()?)?;
            Ok(EntryOutcome::Verified(verification))
        })
    }

    /// Reissue credentials and store the replacements.
    ///
    /// Entries whose type cannot rotate are left untouched.
    pub fn rotate(&mut self, patterns: &[String]) -> Result<Vec<EntryReport>> {
        self.each(patterns, Some("rotate"), |session, name, kind| {
            let profile = session.load(name, kind)?;
            let rotated = profile.rotate(session.authorities()?)?;
            let persisted = session.persist(name, kind, &rotated.serialized);
            Ok(rotation_outcome(rotated.summary, persisted))
        })
    }

    /// Run `op` on every matching entry that has `capability`
    fn each<F>(
        &mut self,
        patterns: &[String],
        capability: Option<&'static str>,
        mut op: F,
    ) -> Result<Vec<EntryReport>>
    where
        F: FnMut(&mut Self, &str, &str) -> Result<EntryOutcome>,
    {
        let entries = self.bag()?.scan(patterns)?;
        let mut reports = Vec::with_capacity(entries.len());

        for (name, kind) in entries {
            let kind = match kind {
                Ok(kind) => kind,
                Err(e) => {
                    reports.push(EntryReport {
                        name,
                        kind: UNREADABLE_KIND.to_string(),
                        outcome: EntryOutcome::Failed(e),
                    });
                    continue;
                }
            };
            let outcome = match capability.map(|c| has_capability(&kind, c)) {
                Some(Ok(false)) => {
                    debug!(name = %name, kind = %kind, capability, "skipping entry");
                    EntryOutcome::Skipped {
                        capability: capability.unwrap_or_default(),
                    }
                }
                Some(Err(e)) => EntryOutcome::Failed(e),
                Some(Ok(true)) | None => match op(self, &name, &kind) {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_structural() => return Err(e),
                    Err(e) => {
                        debug!(name = %name, error = %e, "entry failed");
                        EntryOutcome::Failed(e)
                    }
                },
            };
            reports.push(EntryReport { name, kind, outcome });
        }

        Ok(reports)
    }
}

fn has_capability(kind: &str, capability: &str) -> Result<bool> {
    let caps = profile::new_profile(kind)?.capabilities();
    Ok(match capability {
        "mount" => caps.mount,
        "verify" => caps.verify,
        "rotate" => caps.rotate,
        _ => false,
    })
}

fn rotation_outcome(summary: String, persisted: Result<()>) -> EntryOutcome {
    match persisted {
        Ok(()) => EntryOutcome::Rotated { summary },
        Err(error) => {
            warn!(summary = %summary, error = %error, "rotated credentials were not stored");
            EntryOutcome::RotatedNotPersisted { summary, error }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::tests::PASSPHRASE;
    use crate::issuer::fake::FakeAws;
    use crate::prompt::scripted::ScriptedPrompter;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config {
            public_key: dir.path().join("keys/scum.pub"),
            private_key: dir.path().join("keys/scum.key"),
            bag_path: dir.path().join("bag"),
            mountpoint: dir.path().join("mnt"),
            mount_timeout: 1,
            debug: false,
        }
    }

    /// A session with a fresh key pair and an empty bag
    fn fixture(fake: &FakeAws) -> (Session<ScriptedPrompter>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut session = Session::new(config(&dir), ScriptedPrompter::new(&[], PASSPHRASE))
            .with_authorities(fake.authorities());
        session.init_keys().unwrap();
        session.prompter_mut().passphrase_requests = 0;
        (session, dir)
    }

    fn add(session: &mut Session<ScriptedPrompter>, kind: &str, fields: &[&str]) {
        session.prompter_mut().push_fields(fields);
        session.add(kind).unwrap();
    }

    fn all() -> Vec<String> {
        Vec::new()
    }

    fn entry_bytes(dir: &TempDir, name: &str) -> Vec<u8> {
        std::fs::read(dir.path().join("bag").join(format!("{}.entry", name))).unwrap()
    }

    #[test]
    fn test_add_show_with_right_and_wrong_passphrase() {
        let fake = FakeAws::default();
        let (mut session, dir) = fixture(&fake);
        add(&mut session, "token", &["github", "github.com", "ghp_supersecret"]);
        add(&mut session, "token", &["npm", "npmjs.com", "npm_supersecret"]);
        assert_eq!(session.prompter().passphrase_requests, 0);

        // Stored encrypted
        let raw = String::from_utf8_lossy(&entry_bytes(&dir, "github")).to_string();
        assert!(!raw.contains("ghp_supersecret"));

        let reports = session.show(&all()).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].name, "github");
        match &reports[0].outcome {
            EntryOutcome::Shown(rendered) => {
                assert!(rendered.contains("Service: github.com"));
                assert!(rendered.contains("Token: ghp_supersecret"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(session.prompter().passphrase_requests, 1);

        let mut wrong = Session::new(
            session.config().clone(),
            ScriptedPrompter::new(&[], "not the passphrase"),
        );
        assert!(matches!(
            wrong.show(&all()),
            Err(Error::Authentication(_))
        ));
        assert_eq!(wrong.prompter().passphrase_requests, 1);
    }

    #[test]
    fn test_show_prints_stored_values() {
        let fake = FakeAws::default();
        let (mut session, _dir) = fixture(&fake);
        add(&mut session, "aws", &["prod-aws", "AKIAEXAMPLE", "xyz", ""]);

        let reports = session.show(&["prod-aws".to_string()]).unwrap();
        match &reports[0].outcome {
            EntryOutcome::Shown(rendered) => {
                let lines: Vec<&str> = rendered.lines().collect();
                assert!(lines.contains(&"Name: prod-aws"));
                assert!(lines.contains(&"Access key ID: AKIAEXAMPLE"));
                assert!(lines.contains(&"Secret access key: xyz"));
                assert!(lines.contains(&"Region: us-east-1"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_no_prompt_without_applicable_entries() {
        let fake = FakeAws::default();
        let (mut session, _dir) = fixture(&fake);
        add(&mut session, "token", &["github", "github.com", "ghp_x"]);

        assert!(session.show(&["no-such-*".to_string()]).unwrap().is_empty());

        let reports = session.verify(&all()).unwrap();
        assert!(matches!(
            reports[0].outcome,
            EntryOutcome::Skipped { capability: "verify" }
        ));
        assert_eq!(session.prompter().passphrase_requests, 0);
    }

    #[test]
    fn test_rotate_skips_non_rotatable_without_touching_it() {
        let fake = FakeAws::default();
        let (mut session, dir) = fixture(&fake);
        add(&mut session, "token", &["github", "github.com", "ghp_x"]);
        let before = entry_bytes(&dir, "github");

        let reports = session.rotate(&all()).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            reports[0].outcome,
            EntryOutcome::Skipped { capability: "rotate" }
        ));
        assert!(!reports[0].outcome.is_failure());
        assert_eq!(entry_bytes(&dir, "github"), before);
        assert_eq!(session.prompter().passphrase_requests, 0);
    }

    #[test]
    fn test_rotate_stores_new_key() {
        let fake = FakeAws::with_key("AKIAOLD", "old-secret");
        let (mut session, dir) = fixture(&fake);
        add(
            &mut session,
            "aws",
            &["prod-admin", "AKIAOLD", "old-secret", "eu-west-1"],
        );
        let before = entry_bytes(&dir, "prod-admin");

        let reports = session.rotate(&["prod-*".to_string()]).unwrap();
        assert!(matches!(reports[0].outcome, EntryOutcome::Rotated { .. }));
        assert_ne!(entry_bytes(&dir, "prod-admin"), before);
        assert!(fake.account.borrow().deleted.contains("AKIAOLD"));

        let shown = session.show(&all()).unwrap();
        match &shown[0].outcome {
            EntryOutcome::Shown(rendered) => {
                assert!(rendered.contains("Access key ID: AKIANEW000000001"));
                assert!(rendered.contains("Region: eu-west-1"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        // One passphrase for both operations
        assert_eq!(session.prompter().passphrase_requests, 1);
    }

    #[test]
    fn test_verify_reports_per_entry() {
        let fake = FakeAws::with_key("AKIAGOOD", "good-secret");
        let (mut session, _dir) = fixture(&fake);
        add(&mut session, "aws", &["good", "AKIAGOOD", "good-secret", ""]);
        add(&mut session, "aws", &["stale", "AKIASTALE", "stale-secret", ""]);

        let reports = session.verify(&all()).unwrap();
        let ok: Vec<(String, bool)> = reports
            .iter()
            .map(|r| match &r.outcome {
                EntryOutcome::Verified(v) => (r.name.clone(), v.ok),
                other => panic!("unexpected outcome {:?}", other),
            })
            .collect();
        assert_eq!(
            ok,
            vec![("good".to_string(), true), ("stale".to_string(), false)]
        );
        assert!(reports[1].outcome.is_failure());

        fake.account.borrow_mut().offline = true;
        let reports = session.verify(&["good".to_string()]).unwrap();
        assert!(matches!(
            reports[0].outcome,
            EntryOutcome::Failed(Error::Issuer(_))
        ));
    }

    #[test]
    fn test_prepare_mount_collects_snippets() {
        let fake = FakeAws::default();
        let (mut session, _dir) = fixture(&fake);
        add(&mut session, "token", &["github", "github.com", "ghp_x"]);
        add(&mut session, "aws", &["admin", "AKIA", "secret", ""]);
        add(
            &mut session,
            "aws-session",
            &["dev", "ASIA1", "s1", "t1", "", "2999-01-01T00:00:00Z"],
        );
        add(
            &mut session,
            "aws-session",
            &["prod", "ASIA2", "s2", "t2", "", "2999-01-01T00:00:00Z"],
        );

        let plan = session.prepare_mount(&all()).unwrap();
        let outcomes: Vec<(&str, bool)> = plan
            .reports
            .iter()
            .map(|r| {
                (
                    r.name.as_str(),
                    matches!(r.outcome, EntryOutcome::Mounted { .. }),
                )
            })
            .collect();
        assert_eq!(
            outcomes,
            vec![("admin", false), ("dev", true), ("github", true), ("prod", true)]
        );

        assert_eq!(plan.files.len(), 2);
        assert_eq!(plan.files["tokens/github"].as_slice(), b"ghp_x\n");
        let credentials = String::from_utf8(plan.files["aws/credentials"].to_vec()).unwrap();
        let dev = credentials.find("[dev]").unwrap();
        let prod = credentials.find("[prod]").unwrap();
        assert!(dev < prod);
    }

    #[test]
    fn test_unknown_type_fails_only_that_entry() {
        let fake = FakeAws::default();
        let (mut session, _dir) = fixture(&fake);
        add(&mut session, "token", &["github", "github.com", "ghp_x"]);
        session.bag().unwrap().write("legacy", "gcp", b"opaque").unwrap();

        let reports = session.show(&all()).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0].outcome, EntryOutcome::Shown(_)));
        assert!(matches!(
            reports[1].outcome,
            EntryOutcome::Failed(Error::UnknownType(_))
        ));
    }

    #[test]
    fn test_unreadable_entry_is_reported() {
        let fake = FakeAws::default();
        let (mut session, dir) = fixture(&fake);
        add(&mut session, "token", &["github", "github.com", "ghp_x"]);
        std::fs::write(dir.path().join("bag/broken.entry"), b"{ not json").unwrap();

        let reports = session.show(&all()).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].name, "broken");
        assert_eq!(reports[0].kind, UNREADABLE_KIND);
        assert!(matches!(
            reports[0].outcome,
            EntryOutcome::Failed(Error::Storage(_))
        ));
        assert!(matches!(reports[1].outcome, EntryOutcome::Shown(_)));

        let reports = session.verify(&["broken".to_string()]).unwrap();
        assert!(reports[0].outcome.is_failure());
    }

    #[test]
    fn test_add_unknown_type_and_remove() {
        let fake = FakeAws::default();
        let (mut session, _dir) = fixture(&fake);
        assert!(matches!(session.add("gcp"), Err(Error::UnknownType(_))));

        add(&mut session, "token", &["github", "github.com", "ghp_x"]);
        session.remove("github").unwrap();
        assert!(session.list(&all()).unwrap().is_empty());
        assert!(matches!(session.remove("github"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_rotate_reports_issued_key_that_was_not_stored() {
        let fake = FakeAws::with_key("AKIAOLD", "old-secret");
        let (mut session, dir) = fixture(&fake);
        add(&mut session, "aws", &["prod-admin", "AKIAOLD", "old-secret", ""]);
        let before = entry_bytes(&dir, "prod-admin");

        session.bag().unwrap();
        if let Some(bag) = session.bag.as_mut() {
            bag.fail_writes = true;
        }

        let reports = session.rotate(&all()).unwrap();
        match &reports[0].outcome {
            EntryOutcome::RotatedNotPersisted { summary, error } => {
                assert!(summary.contains("AKIANEW000000001"));
                assert!(matches!(error, Error::Storage(_)));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(reports[0].outcome.is_failure());

        let account = fake.account.borrow();
        assert_eq!(account.issued, 1);
        assert!(account.keys.iter().any(|(id, _)| id == "AKIANEW000000001"));
        drop(account);

        assert_eq!(entry_bytes(&dir, "prod-admin"), before);
        let shown = session.show(&all()).unwrap();
        match &shown[0].outcome {
            EntryOutcome::Shown(rendered) => assert!(rendered.contains("Access key ID: AKIAOLD")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_rotation_outcome_reports_unstored_credentials() {
        let outcome = rotation_outcome(
            "replaced access key A with B".to_string(),
            Err(Error::Storage("disk full".to_string())),
        );
        assert!(matches!(
            outcome,
            EntryOutcome::RotatedNotPersisted { ref summary, .. } if summary.contains("with B")
        ));
        assert!(outcome.is_failure());
    }

    #[test]
    fn test_list_types() {
        let fake = FakeAws::default();
        let dir = TempDir::new().unwrap();
        let session = Session::new(config(&dir), ScriptedPrompter::default())
            .with_authorities(fake.authorities());
        let kinds: Vec<&str> = session.list_types().into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec!["aws", "aws-session", "token"]);
    }
}
