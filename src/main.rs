//! The `cryptopak` CLI: glues argument parsing, password prompting, and
//! logging onto the library's [`cryptopak::repository`] API. Everything
//! below this file is CLI glue -- out of scope per the spec's own §1 list
//! of external collaborators (arg parsing, password prompts, progress
//! reporting, the filesystem walker).

use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cryptopak::archiver::{self, Request};
use cryptopak::blob::Kind as BlobKind;
use cryptopak::config;
use cryptopak::counters;
use cryptopak::fs_tree::Skip;
use cryptopak::hashing::ObjectId;
use cryptopak::repository::{CancellationToken, Repository};
use cryptopak::restore;
use cryptopak::settings::{EnvPassword, PasswordProvider, TerminalPassword, first_available};
use cryptopak::tree::Tree;

const PASSWORD_ENV_VAR: &str = "CRYPTOPAK_PASSWORD";
/// Consulted only by `key add`, which needs a *second* password distinct
/// from the one that just unlocked the repository.
const NEW_PASSWORD_ENV_VAR: &str = "CRYPTOPAK_NEW_PASSWORD";

#[derive(Parser, Debug)]
#[command(name = "cryptopak", version, about = "A content-addressed, encrypted, deduplicating backup repository")]
struct Args {
    /// Verbosity (-v, -vv, -vvv, ...). Overridden by $RUST_LOG if set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Repository location: a path, `local:/path`, `sftp://...`,
    /// `s3:...`, `rest:...`, `gs://...`, or `mem:` (tests only).
    #[arg(short, long, global = true)]
    repository: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a fresh, empty repository.
    Init,
    /// Back up one or more paths into a new snapshot.
    Backup {
        paths: Vec<Utf8PathBuf>,
        /// Skip dedup against the most recent snapshot of the same path
        /// set, even if one exists.
        #[arg(long)]
        no_incremental: bool,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Regex matched against each entry's path; matching entries are
        /// left out of the tree entirely. May be given more than once.
        #[arg(long = "exclude")]
        excludes: Vec<String>,
    },
    /// Restore a snapshot's tree to a local directory.
    Restore {
        snapshot: String,
        #[arg(long, default_value = ".")]
        target: Utf8PathBuf,
    },
    /// List or inspect snapshots.
    Snapshots {
        /// Only show snapshots with this tag.
        #[arg(long)]
        tag: Option<String>,
    },
    /// Password (key) management.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Verify the repository's consistency: every index entry resolves,
    /// every pack's trailer matches what the index claims it holds, and
    /// (with `--read-data`) every blob actually decrypts and rehashes
    /// correctly. Also scans for packs the index doesn't know about and
    /// recovers their entries (§4.6 pack-header salvage).
    Check {
        /// Also decrypt and rehash every blob, not just the pack headers.
        #[arg(long)]
        read_data: bool,
    },
    /// Dump a decrypted repository object as JSON, for debugging.
    Cat {
        #[command(subcommand)]
        object: CatObject,
    },
}

#[derive(Subcommand, Debug)]
enum CatObject {
    /// The repository's immutable configuration object.
    Config,
    /// The full merged index.
    Index,
    /// One snapshot.
    Snapshot { id: String },
    /// One content-addressed blob.
    Blob {
        #[arg(value_enum)]
        kind: CatBlobKind,
        id: String,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CatBlobKind {
    Chunk,
    Tree,
}

impl From<CatBlobKind> for BlobKind {
    fn from(kind: CatBlobKind) -> Self {
        match kind {
            CatBlobKind::Chunk => BlobKind::Chunk,
            CatBlobKind::Tree => BlobKind::Tree,
        }
    }
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Add a new password wrapping the existing master key.
    Add {
        #[arg(long)]
        label: Option<String>,
    },
    /// Remove a password by its key object id.
    Remove { id: String },
    /// List every password's key object id and label.
    List,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let result = run(&args);
    counters::log_counts();
    result
}

fn run(args: &Args) -> Result<()> {
    let prefs = config::load_preferences().unwrap_or_default();

    match &args.command {
        Command::Init => cmd_init(&args.repository),
        Command::Backup { paths, no_incremental, tags, excludes } => {
            cmd_backup(&args.repository, prefs.parallelism, paths, !*no_incremental, tags, excludes)
        }
        Command::Restore { snapshot, target } => {
            cmd_restore(&args.repository, prefs.parallelism, snapshot, target)
        }
        Command::Snapshots { tag } => cmd_snapshots(&args.repository, prefs.parallelism, tag.as_deref()),
        Command::Key { action } => cmd_key(&args.repository, prefs.parallelism, action),
        Command::Check { read_data } => cmd_check(&args.repository, prefs.parallelism, *read_data),
        Command::Cat { object } => cmd_cat(&args.repository, prefs.parallelism, object),
    }
}

fn prompt_new_password() -> Result<zeroize::Zeroizing<Vec<u8>>> {
    let providers: [&dyn PasswordProvider; 2] =
        [&EnvPassword::new(PASSWORD_ENV_VAR), &TerminalPassword::with_confirmation("New repository password")];
    Ok(first_available(&providers)?)
}

fn prompt_unlock_password() -> Result<zeroize::Zeroizing<Vec<u8>>> {
    let providers: [&dyn PasswordProvider; 2] =
        [&EnvPassword::new(PASSWORD_ENV_VAR), &TerminalPassword::new("Repository password")];
    Ok(first_available(&providers)?)
}

/// The password a fresh [`KeyFile`](cryptopak::key::KeyFile) should wrap,
/// for `key add`. Never the same source as the password that unlocked the
/// repository in the first place.
fn prompt_additional_password() -> Result<zeroize::Zeroizing<Vec<u8>>> {
    let providers: [&dyn PasswordProvider; 2] = [
        &EnvPassword::new(NEW_PASSWORD_ENV_VAR),
        &TerminalPassword::with_confirmation("New password"),
    ];
    Ok(first_available(&providers)?)
}

fn cmd_init(location: &str) -> Result<()> {
    let password = prompt_new_password()?;
    let repo = Repository::init(location, &password, num_cpus::get().max(1))
        .with_context(|| format!("Couldn't initialize repository at {location}"))?;
    println!("Initialized repository {} at {}", repo.config.repository_id, location);
    Ok(())
}

fn open(location: &str, parallelism: usize) -> Result<Repository> {
    let password = prompt_unlock_password()?;
    let repo = Repository::open(location, &password, parallelism)
        .with_context(|| format!("Couldn't unlock repository at {location}"))?;
    repo.load_index().context("Couldn't load index")?;
    Ok(repo)
}

fn cmd_backup(
    location: &str,
    parallelism: usize,
    paths: &[Utf8PathBuf],
    incremental: bool,
    tags: &[String],
    excludes: &[String],
) -> Result<()> {
    if paths.is_empty() {
        bail!("backup needs at least one path");
    }
    let repo = open(location, parallelism)?;

    let parent = if incremental {
        archiver::find_parent(&repo, paths)?
    } else {
        None
    };

    let skip = Skip::compile(excludes).context("Invalid --exclude pattern")?;
    let request = Request {
        paths: paths.to_vec(),
        parent,
        tags: tags.to_vec(),
        skip,
    };

    let cancel = CancellationToken::new();
    let snapshot = archiver::archive(&repo, &request, &cancel)
        .context("Backup failed")?;
    println!("Saved snapshot {}", snapshot.id()?);
    Ok(())
}

fn cmd_restore(location: &str, parallelism: usize, snapshot: &str, target: &Utf8PathBuf) -> Result<()> {
    let repo = open(location, parallelism)?;
    let id: ObjectId = snapshot.parse().context("Invalid snapshot id")?;
    let snap = repo.load_snapshot(id).context("Couldn't load snapshot")?;
    restore::restore_snapshot(&repo, &snap, target, &CancellationToken::new())
        .context("Restore failed")?;
    println!("Restored snapshot {id} to {target}");
    Ok(())
}

fn cmd_snapshots(location: &str, parallelism: usize, tag: Option<&str>) -> Result<()> {
    let repo = open(location, parallelism)?;
    let mut ids = repo.list_snapshots().context("Couldn't list snapshots")?;
    ids.sort();

    for id in ids {
        let snapshot = repo.load_snapshot(id)?;
        if let Some(tag) = tag {
            if !snapshot.has_tag(tag) {
                continue;
            }
        }
        println!(
            "{} {} {}@{} {}",
            id,
            snapshot.time,
            snapshot.username,
            snapshot.hostname,
            snapshot
                .paths
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}

fn cmd_key(location: &str, parallelism: usize, action: &KeyAction) -> Result<()> {
    let repo = open(location, parallelism)?;
    match action {
        KeyAction::Add { label } => {
            let new_password = prompt_additional_password()?;
            let id = repo.add_password(&new_password, label.clone())?;
            println!("Added key {id}");
        }
        KeyAction::Remove { id } => {
            let id: ObjectId = id.parse().context("Invalid key id")?;
            repo.remove_password(id)?;
            println!("Removed key {id}");
        }
        KeyAction::List => {
            for (id, key_file) in repo.list_keys()? {
                match &key_file.label {
                    Some(label) => println!("{id} {label}"),
                    None => println!("{id}"),
                }
            }
        }
    }
    Ok(())
}

fn cmd_check(location: &str, parallelism: usize, read_data: bool) -> Result<()> {
    let repo = open(location, parallelism)?;

    let recovered = repo.salvage_orphan_packs().context("Salvage failed")?;
    if recovered > 0 {
        println!("Recovered {recovered} orphan pack(s)");
    }

    let report = repo.check(read_data).context("Check failed")?;
    println!(
        "Checked {} pack(s){}: {} error(s)",
        report.packs_checked,
        if read_data {
            format!(" and {} blob(s)", report.blobs_checked)
        } else {
            String::new()
        },
        report.errors
    );
    if !report.is_clean() {
        bail!("repository is not consistent");
    }
    Ok(())
}

fn cmd_cat(location: &str, parallelism: usize, object: &CatObject) -> Result<()> {
    let repo = open(location, parallelism)?;
    match object {
        CatObject::Config => {
            println!("{}", serde_json::to_string_pretty(&repo.config)?);
        }
        CatObject::Index => {
            let pack_ids = repo.index().known_packs();
            let file = repo.index().to_index_file(&pack_ids);
            println!("{}", serde_json::to_string_pretty(&file)?);
        }
        CatObject::Snapshot { id } => {
            let id: ObjectId = id.parse().context("Invalid snapshot id")?;
            let snapshot = repo.load_snapshot(id).context("Couldn't load snapshot")?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        CatObject::Blob { kind, id } => {
            let id: ObjectId = id.parse().context("Invalid blob id")?;
            let kind: BlobKind = (*kind).into();
            let bytes = repo.load_blob(kind, id).context("Couldn't load blob")?;
            match kind {
                BlobKind::Tree => {
                    let tree = Tree::from_slice(&bytes)?;
                    println!("{}", serde_json::to_string_pretty(&tree)?);
                }
                BlobKind::Chunk => {
                    use std::io::Write;
                    std::io::stdout().write_all(&bytes)?;
                }
            }
        }
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}
