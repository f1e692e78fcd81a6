//! CLI command definitions and handlers

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use scum::{
    CancelToken, Config, EntryOutcome, EntryReport, MountEnd, Session, TerminalPrompter,
};

/// Default profile type for `add`
const DEFAULT_TYPE: &str = "aws";

/// scum - Secret Credentials Utility/Manager
#[derive(Parser)]
#[command(name = "scum")]
#[command(version)]
#[command(about = "Secret Credentials Utility/Manager - encrypted credential profiles")]
#[command(after_help = "\
EXAMPLES:
    scum init                      Generate the key pair and create the bag
    scum add -t token              Store a new API token
    scum list 'prod-*'             List profiles matching a glob
    scum verify '*'                Check every verifiable profile
    scum mount dev --timeout 300   Expose 'dev' as files for five minutes

ENVIRONMENT:
    SCUM_PASSPHRASE    Passphrase for the private key (skips the prompt)
    RUST_LOG           Log filter, overrides --debug")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: ~/.config/scum/config.yml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging, including every mounted filesystem request
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate the key pair and create the bag
    Init,

    /// List the supported profile types
    Types,

    /// Print the effective configuration
    Config,

    /// Prompt for a new profile and store it
    Add {
        /// Profile type (see `scum types`)
        #[arg(short = 't', long = "type", default_value = DEFAULT_TYPE)]
        kind: String,
    },

    /// List stored profiles
    List {
        /// Glob patterns on profile names (default: all)
        patterns: Vec<String>,
    },

    /// Decrypt and print profiles
    Show {
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Expose profiles as files until the timeout expires or Ctrl-C
    Mount {
        #[arg(required = true)]
        patterns: Vec<String>,

        /// Seconds before unmounting (default: mount_timeout from config)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Check profiles with their issuing service
    Verify {
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Reissue credentials and store the replacements
    Rotate {
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Delete a profile
    Rm {
        name: String,
    },
}

/// Run the CLI. Returns whether every entry succeeded.
pub fn run(cli: Cli, mut config: Config) -> Result<bool> {
    config.debug |= cli.debug;

    let session = Session::new(config, TerminalPrompter::new());
    match cli.command {
        Commands::Init => cmd_init(session),
        Commands::Types => cmd_types(&session),
        Commands::Config => cmd_config(session.config()),
        Commands::Add { kind } => cmd_add(session, &kind),
        Commands::List { patterns } => cmd_list(session, &patterns),
        Commands::Show { patterns } => cmd_show(session, &patterns),
        Commands::Mount { patterns, timeout } => {
            cmd_mount(session, &patterns, timeout.map(Duration::from_secs))
        }
        Commands::Verify { patterns } => cmd_verify(session, &patterns),
        Commands::Rotate { patterns } => cmd_rotate(session, &patterns),
        Commands::Rm { name } => cmd_rm(session, &name),
    }
}

type TermSession = Session<TerminalPrompter>;

fn cmd_init(mut session: TermSession) -> Result<bool> {
    let public = session.init_keys().context("Failed to initialize")?;
    let config = session.config();

    println!("Public key: {}", public);
    println!("Private key written to {}", config.private_key.display());
    println!("Bag created at {}", config.bag_path.display());
    Ok(true)
}

fn cmd_types(session: &TermSession) -> Result<bool> {
    for (kind, description) in session.list_types() {
        println!("Profile Type \x1b[1m'{}'\x1b[0m\n", kind);
        println!("{}\n", description);
    }
    Ok(true)
}

fn cmd_config(config: &Config) -> Result<bool> {
    print!("---\n{}", config.to_yaml()?);
    Ok(true)
}

fn cmd_add(mut session: TermSession, kind: &str) -> Result<bool> {
    let name = session.add(kind)?;
    println!("Stored {} (type {})", name, kind);
    Ok(true)
}

fn cmd_list(mut session: TermSession, patterns: &[String]) -> Result<bool> {
    let entries = session.list(patterns)?;
    if entries.is_empty() {
        println!("No matches found");
        return Ok(true);
    }
    for (name, kind) in entries {
        println!("{} (type {})", name, kind);
    }
    Ok(true)
}

fn cmd_show(mut session: TermSession, patterns: &[String]) -> Result<bool> {
    let reports = session.show(patterns)?;
    if reports.is_empty() {
        println!("No matches found");
        return Ok(true);
    }

    for report in &reports {
        match &report.outcome {
            EntryOutcome::Shown(rendered) => println!("{}\n", rendered),
            _ => print_report(report),
        }
    }
    Ok(succeeded(&reports))
}

fn cmd_mount(mut session: TermSession, patterns: &[String], timeout: Option<Duration>) -> Result<bool> {
    let plan = session.prepare_mount(patterns)?;
    if plan.reports.is_empty() {
        println!("No matches found");
        return Ok(true);
    }

    for report in &plan.reports {
        if !matches!(report.outcome, EntryOutcome::Mounted { .. }) {
            print_report(report);
        }
    }
    let ok = succeeded(&plan.reports);
    if plan.files.is_empty() {
        println!("Nothing to mount");
        return Ok(ok);
    }

    let cancel = CancelToken::new();
    cancel.cancel_on_signals()?;

    println!("Mounting credentials at {}", session.config().mountpoint.display());
    let outcome = session.mount(plan, timeout, &cancel)?;
    match outcome.reason {
        MountEnd::Expired => println!("Timeout reached, unmounted {} files", outcome.files),
        MountEnd::Cancelled => println!("Interrupted, unmounted {} files", outcome.files),
    }
    Ok(ok)
}

fn cmd_verify(mut session: TermSession, patterns: &[String]) -> Result<bool> {
    let reports = session.verify(patterns)?;
    if reports.is_empty() {
        println!("No matches found");
        return Ok(true);
    }

    for report in &reports {
        print_report(report);
    }
    Ok(succeeded(&reports))
}

fn cmd_rotate(mut session: TermSession, patterns: &[String]) -> Result<bool> {
    let entries = session.list(patterns)?;
    if entries.is_empty() {
        println!("No matches found");
        return Ok(true);
    }

    println!("The following credentials are going to be rotated:");
    for (name, kind) in &entries {
        println!("\t{} (type {})", name, kind);
    }

    let reports = session.rotate(patterns)?;
    for report in &reports {
        print_report(report);
    }

    let lost: Vec<&str> = reports
        .iter()
        .filter(|r| matches!(r.outcome, EntryOutcome::RotatedNotPersisted { .. }))
        .map(|r| r.name.as_str())
        .collect();
    if !lost.is_empty() {
        bail!(
            "New credentials for {} were issued but not stored; revoke them with the issuer",
            lost.join(", ")
        );
    }
    Ok(succeeded(&reports))
}

fn cmd_rm(mut session: TermSession, name: &str) -> Result<bool> {
    session.remove(name)?;
    println!("Removed {}", name);
    Ok(true)
}

fn succeeded(reports: &[EntryReport]) -> bool {
    !reports.iter().any(|r| r.outcome.is_failure())
}

fn print_report(report: &EntryReport) {
    let EntryReport { name, kind, outcome } = report;
    match outcome {
        EntryOutcome::Shown(rendered) => println!("{}", rendered),
        EntryOutcome::Mounted { path } => println!("{} (type {}) -> {}", name, kind, path),
        EntryOutcome::Verified(v) => {
            let mark = if v.ok { "\u{2714}" } else { "\u{2718}" };
            println!("{}\t{} (type {}), message: {}", mark, name, kind, v.message);
        }
        EntryOutcome::Rotated { summary } => {
            println!("Rotated {} (type {}): {}", name, kind, summary)
        }
        EntryOutcome::RotatedNotPersisted { summary, error } => {
            eprintln!("Rotated {} (type {}) but failed to store it: {}", name, kind, error);
            eprintln!("\t{}", summary);
        }
        EntryOutcome::Skipped { capability } => println!("{}", skip_message(name, kind, capability)),
        EntryOutcome::Failed(error) => eprintln!("{} (type {}): {}", name, kind, error),
    }
}

fn skip_message(name: &str, kind: &str, capability: &str) -> String {
    let (verb, feature) = match capability {
        "mount" => ("mounted", "mount"),
        "verify" => ("verified", "verification"),
        "rotate" => ("rotated", "key rotation"),
        other => (other, other),
    };
    format!(
        "Profile '{}' cannot be {} because it is of type {} which does not support {}. Skipping...",
        name, verb, kind, feature
    )
}
