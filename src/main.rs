//! rhizome CLI - Command line interface for rhizome_trees
//!
//! Every command opens the database file, does one thing and exits, printing
//! a single JSON document on stdout. Logs go to stderr.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use rhizome_trees::viz::VizCommit;
use rhizome_trees::{
    verify, Change, CommitInfo, Config, Database, DiffEntry, Hash, KeyOrdering, Proof,
    RetentionPolicy,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const AUTHOR: &str = "rhizome-cli";

#[derive(Parser)]
#[command(name = "rhizome")]
#[command(about = "Versioned, provable, prunable merkle trees")]
#[command(version)]
struct Cli {
    /// Path to the database file
    #[arg(short, long, default_value = ".rhizome")]
    database: PathBuf,

    /// Output format (json or text)
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,

    /// Config file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the key ordering
    #[arg(long)]
    ordering: Option<KeyOrdering>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new database
    Init,

    /// Set a key on a branch (commits and advances the branch)
    Put {
        key: String,
        value: String,
        #[arg(short, long, default_value = "main")]
        branch: String,
        /// Commit message
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Read a key
    Get {
        key: String,
        /// Branch name or commit hash
        #[arg(short = 'r', long = "ref", default_value = "main")]
        reference: String,
    },

    /// Remove a key from a branch (commits and advances the branch)
    Delete {
        key: String,
        #[arg(short, long, default_value = "main")]
        branch: String,
        #[arg(short, long)]
        message: Option<String>,
    },

    /// List keys, optionally under a prefix
    List {
        #[arg(short, long, default_value = "")]
        prefix: String,
        #[arg(short = 'r', long = "ref", default_value = "main")]
        reference: String,
    },

    /// Manage branches
    Branch {
        #[command(subcommand)]
        action: BranchAction,
    },

    /// Show commit history
    Log {
        #[arg(short = 'r', long = "ref", default_value = "main")]
        reference: String,
        /// Maximum number of commits to show
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Record a merge of <from> into branch <into> and advance it
    Merge {
        into: String,
        from: String,
        /// Root of the merged tree (defaults to <from>'s tree)
        #[arg(long)]
        root: Option<String>,
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Produce a merkle proof for a key
    Prove {
        key: String,
        #[arg(short = 'r', long = "ref", default_value = "main")]
        reference: String,
    },

    /// Check a proof against a root without opening any database
    Verify {
        /// Trusted root hash
        root: String,
        key: String,
        /// Proof as printed by `prove`
        proof: String,
        /// Expected value; omit to check absence
        #[arg(long)]
        value: Option<String>,
    },

    /// Show diff between two refs
    Diff { from: String, to: String },

    /// Delete history outside the retention set
    Prune {
        /// Branch or commit to retain (repeatable)
        #[arg(long = "keep")]
        keep: Vec<String>,
        /// Retain every branch head
        #[arg(long)]
        all_branches: bool,
        /// Keep at most this many parent hops of history
        #[arg(long)]
        depth: Option<usize>,
        /// Drop ancestors with a logical timestamp below this
        #[arg(long)]
        min_timestamp: Option<u64>,
    },

    /// Print versions as a Graphviz digraph
    Dot {
        #[arg(short = 'r', long = "ref", default_value = "main")]
        reference: Vec<String>,
    },

    /// Rewrite the database file without dead records
    Compact,
}

#[derive(Subcommand)]
enum BranchAction {
    /// Create a branch at a ref
    Create {
        name: String,
        #[arg(long, default_value = "main")]
        at: String,
    },
    /// Delete a branch
    Delete { name: String },
    /// List all branches
    List,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Init => {
            if cli.database.exists() {
                bail!("{} already exists", cli.database.display());
            }
            let db = Database::create(&cli.database, config)?;
            db.flush()?;
            output(
                cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "message": format!("Created database at {}", cli.database.display()),
                    "ordering": db.config().ordering,
                }),
            )?;
        }

        Commands::Put {
            key,
            value,
            branch,
            message,
        } => {
            let db = open_db(&cli.database, config)?;
            let info = commit_info(message.clone(), || format!("put {}", key));
            let change = Change::Put(key.as_bytes().to_vec(), value.as_bytes().to_vec());
            let commit = db.apply(branch, &[change], info)?;
            db.flush()?;
            output(
                cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "branch": branch,
                    "commit": commit.to_hex(),
                    "root": db.root_of(&commit)?.to_hex(),
                }),
            )?;
        }

        Commands::Get { key, reference } => {
            let db = open_db(&cli.database, config)?;
            let root = db.root_of(&db.resolve(reference)?)?;
            let value = db.get(root, key.as_bytes())?;
            output(
                cli.format,
                &serde_json::json!({
                    "key": key,
                    "found": value.is_some(),
                    "value": value.as_deref().map(String::from_utf8_lossy),
                }),
            )?;
        }

        Commands::Delete {
            key,
            branch,
            message,
        } => {
            let db = open_db(&cli.database, config)?;
            let info = commit_info(message.clone(), || format!("delete {}", key));
            let commit = db.apply(branch, &[Change::Delete(key.as_bytes().to_vec())], info)?;
            db.flush()?;
            output(
                cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "branch": branch,
                    "commit": commit.to_hex(),
                    "root": db.root_of(&commit)?.to_hex(),
                }),
            )?;
        }

        Commands::List { prefix, reference } => {
            let db = open_db(&cli.database, config)?;
            let root = db.root_of(&db.resolve(reference)?)?;
            let entries = db.tree().list_prefix(root, prefix.as_bytes())?;
            let items: Vec<_> = entries
                .iter()
                .map(|(k, v)| {
                    serde_json::json!({
                        "key": String::from_utf8_lossy(k),
                        "value": String::from_utf8_lossy(v),
                    })
                })
                .collect();
            output(
                cli.format,
                &serde_json::json!({
                    "count": items.len(),
                    "entries": items
                }),
            )?;
        }

        Commands::Branch { action } => {
            let db = open_db(&cli.database, config)?;
            match action {
                BranchAction::Create { name, at } => {
                    let commit = db.resolve(at)?;
                    db.branches().create(name, commit)?;
                    output(
                        cli.format,
                        &serde_json::json!({
                            "status": "ok",
                            "branch": name,
                            "commit": commit.to_hex()
                        }),
                    )?;
                }
                BranchAction::Delete { name } => {
                    db.branches().delete(name)?;
                    output(
                        cli.format,
                        &serde_json::json!({
                            "status": "ok",
                            "deleted": name
                        }),
                    )?;
                }
                BranchAction::List => {
                    let items: Vec<_> = db
                        .branches()
                        .list()?
                        .iter()
                        .map(|(name, hash)| {
                            serde_json::json!({
                                "name": name,
                                "commit": hash.to_hex()
                            })
                        })
                        .collect();
                    output(cli.format, &serde_json::json!({ "branches": items }))?;
                }
            }
            db.flush()?;
        }

        Commands::Log { reference, limit } => {
            let db = open_db(&cli.database, config)?;
            let head = db.resolve(reference)?;
            let commits: Vec<VizCommit> = db
                .graph()
                .log(&head, *limit)?
                .iter()
                .map(|(id, commit)| VizCommit::new(id, commit))
                .collect();
            output(
                cli.format,
                &serde_json::json!({
                    "count": commits.len(),
                    "commits": commits
                }),
            )?;
        }

        Commands::Merge {
            into,
            from,
            root,
            message,
        } => {
            let db = open_db(&cli.database, config)?;
            let head = db.branches().head(into)?;
            let other = db.resolve(from)?;
            let merge_root = match root {
                Some(hex) => parse_hash(hex)?,
                None => db.root_of(&other)?,
            };
            let info = commit_info(message.clone(), || format!("merge {} into {}", from, into));
            let commit = db.merge(head, other, merge_root, info)?;
            db.branches().advance(into, commit)?;
            db.flush()?;
            output(
                cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "branch": into,
                    "commit": commit.to_hex(),
                    "root": merge_root.to_hex(),
                }),
            )?;
        }

        Commands::Prove { key, reference } => {
            let db = open_db(&cli.database, config)?;
            let root = db.root_of(&db.resolve(reference)?)?;
            let proof = db.prove(root, key.as_bytes())?;
            output(
                cli.format,
                &serde_json::json!({
                    "root": root.to_hex(),
                    "key": key,
                    "inclusion": proof.is_inclusion(),
                    "proof": hex::encode(proof.to_bytes()?),
                }),
            )?;
        }

        Commands::Verify {
            root,
            key,
            proof,
            value,
        } => {
            let root = parse_hash(root)?;
            let bytes = hex::decode(proof).context("proof is not hex")?;
            let valid = Proof::from_bytes(&bytes)
                .map(|p| verify(&p, root, key.as_bytes(), value.as_deref().map(str::as_bytes)))
                .unwrap_or(false);
            output(
                cli.format,
                &serde_json::json!({
                    "valid": valid,
                    "root": root.to_hex(),
                    "key": key,
                }),
            )?;
            if !valid {
                bail!("proof does not verify");
            }
        }

        Commands::Diff { from, to } => {
            let db = open_db(&cli.database, config)?;
            let from_root = db.root_of(&db.resolve(from)?)?;
            let to_root = db.root_of(&db.resolve(to)?)?;

            let diff = db.diff(from_root, to_root)?;
            let entries: Vec<_> = diff
                .entries
                .iter()
                .map(|e| match e {
                    DiffEntry::Added { key, value } => {
                        serde_json::json!({
                            "type": "added",
                            "key": String::from_utf8_lossy(key),
                            "value": String::from_utf8_lossy(value)
                        })
                    }
                    DiffEntry::Removed { key, value } => {
                        serde_json::json!({
                            "type": "removed",
                            "key": String::from_utf8_lossy(key),
                            "value": String::from_utf8_lossy(value)
                        })
                    }
                    DiffEntry::Modified {
                        key,
                        old_value,
                        new_value,
                    } => {
                        serde_json::json!({
                            "type": "modified",
                            "key": String::from_utf8_lossy(key),
                            "old_value": String::from_utf8_lossy(old_value),
                            "new_value": String::from_utf8_lossy(new_value)
                        })
                    }
                })
                .collect();
            output(
                cli.format,
                &serde_json::json!({
                    "from": from_root.to_hex(),
                    "to": to_root.to_hex(),
                    "added": diff.added_count(),
                    "removed": diff.removed_count(),
                    "modified": diff.modified_count(),
                    "entries": entries
                }),
            )?;
        }

        Commands::Prune {
            keep,
            all_branches,
            depth,
            min_timestamp,
        } => {
            let db = open_db(&cli.database, config)?;
            if keep.is_empty() && !all_branches {
                bail!("nothing to retain: pass --keep <ref> or --all-branches");
            }
            let commits = keep
                .iter()
                .map(|r| db.resolve(r))
                .collect::<rhizome_trees::Result<Vec<Hash>>>()?;
            let policy = RetentionPolicy {
                commits,
                branches: Vec::new(),
                all_branches: *all_branches,
                max_depth: *depth,
                min_timestamp: *min_timestamp,
            };
            let report = db.prune(&policy)?;
            output(cli.format, &serde_json::to_value(&report)?)?;
        }

        Commands::Dot { reference } => {
            let db = open_db(&cli.database, config)?;
            let mut versions = Vec::new();
            for r in reference {
                versions.push((r.clone(), db.root_of(&db.resolve(r)?)?));
            }
            print!("{}", db.to_dot(&versions)?);
        }

        Commands::Compact => {
            let db = open_db(&cli.database, config)?;
            let reclaimed = db.compact()?.unwrap_or(0);
            output(
                cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "reclaimed_bytes": reclaimed
                }),
            )?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => match Config::default_path() {
            Ok(path) => Config::load_or_default(path)?,
            Err(_) => Config::default(),
        },
    };
    if let Some(ordering) = cli.ordering {
        config.ordering = ordering;
    }
    Ok(config)
}

fn open_db(path: &Path, config: Config) -> anyhow::Result<Database> {
    if !path.exists() {
        return Err(anyhow!(
            "no database at {} (run `rhizome init` first)",
            path.display()
        ));
    }
    Ok(Database::open(path, config)?)
}

fn commit_info(message: Option<String>, default: impl FnOnce() -> String) -> CommitInfo {
    CommitInfo::message(message.unwrap_or_else(default)).with_author(AUTHOR)
}

fn parse_hash(s: &str) -> anyhow::Result<Hash> {
    Hash::from_hex(s).map_err(|_| anyhow!("Invalid hash: {}", s))
}

fn output(format: OutputFormat, value: &serde_json::Value) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(value)?);
        }
        OutputFormat::Text => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
    }
    Ok(())
}
