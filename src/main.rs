use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use log::{info, warn, Level, LevelFilter};
use similar::udiff::unified_diff;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use vpatch::{
    apply_commit, identify_files_added, identify_files_needed, patch_to_commit, split_patch_text,
    text_to_patch, Commit, DiffError, FileChange,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Apply model-emitted patches from a file or standard input.",
    long_about = "Applies patches in the '*** Begin Patch' block format, repairing trivially safe\n\
                  defects (whitespace drift, Unicode look-alikes, malformed hunk headers,\n\
                  surrounding narration) and failing loudly on anything ambiguous."
)]
struct Args {
    /// Path to the patch input; use '-' or omit to read standard input.
    input: Option<PathBuf>,

    #[arg(
        short = 'C',
        long = "directory",
        default_value = ".",
        help = "Directory the patch paths are resolved against."
    )]
    target_dir: PathBuf,

    #[arg(short = 'n', long, help = "Show what would be done, but don't modify files.")]
    dry_run: bool,

    /// Increase logging verbosity. Can be used multiple times (e.g., -v, -vv).
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        long_help = "Increase logging verbosity.\n-v for info, -vv for debug, -vvv for trace.\nBy default, only warnings and errors are shown."
    )]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // --- Logger Initialization ---
    let log_level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            match record.level() {
                Level::Error => writeln!(buf, "{} {}", "error:".red().bold(), record.args()),
                Level::Warn => writeln!(buf, "{} {}", "warning:".yellow().bold(), record.args()),
                Level::Info => writeln!(buf, "{}", record.args()),
                Level::Debug => writeln!(buf, "{} {}", "debug:".blue().bold(), record.args()),
                Level::Trace => writeln!(buf, "{} {}", "trace:".cyan().bold(), record.args()),
            }
        })
        .init();

    if !args.target_dir.is_dir() {
        anyhow::bail!(
            "Target directory '{}' not found or is not a directory.",
            args.target_dir.display()
        );
    }

    let text = match args.input.as_deref() {
        None => read_stdin()?,
        Some(path) if path == Path::new("-") => read_stdin()?,
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read patch input '{}'", path.display()))?,
    };

    let blocks = split_patch_text(&text)?;
    if blocks.is_empty() {
        anyhow::bail!("No patch blocks found in the input.");
    }
    info!("Found {} patch block(s) to apply.", blocks.len());

    for (i, block) in blocks.iter().enumerate() {
        info!(">>> Block {}/{}", i + 1, blocks.len());
        apply_block(block, &args)
            .with_context(|| format!("Failed to apply patch block {}", i + 1))?;
    }

    if args.dry_run {
        println!("DRY RUN completed. No files were modified.");
    }
    println!("Done!");
    Ok(())
}

fn read_stdin() -> Result<String> {
    let mut text = String::new();
    io::stdin()
        .read_to_string(&mut text)
        .context("Failed to read the patch from standard input")?;
    Ok(text)
}

fn apply_block(block: &str, args: &Args) -> Result<()> {
    // Load a snapshot of every file the block will read. Added paths are
    // probed too, so adding an existing file fails during the parse.
    let mut originals: HashMap<String, String> = HashMap::new();
    for path in identify_files_needed(block) {
        let content = resolve_patch_path(&args.target_dir, &path)
            .and_then(fs::read_to_string)
            .map_err(|_| DiffError::FileNotFound(path.clone()))?;
        originals.insert(path, content);
    }
    for path in identify_files_added(block) {
        if let Ok(full) = resolve_patch_path(&args.target_dir, &path) {
            if let Ok(content) = fs::read_to_string(full) {
                originals.insert(path, content);
            }
        }
    }

    let (patch, fuzz) = text_to_patch(block, &originals)?;
    if fuzz > 0 {
        warn!("Patch matched with fuzz {}; the tolerated deviations were repaired.", fuzz);
    }
    let commit = patch_to_commit(&patch, &originals)?;
    if commit.changes.is_empty() {
        info!("Nothing to change.");
        return Ok(());
    }

    if args.dry_run {
        print_proposed_changes(&commit);
        return Ok(());
    }

    let root = args.target_dir.as_path();
    apply_commit(
        &commit,
        |path, content| {
            let full = resolve_patch_path(root, path)?;
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(full, content)
        },
        |path| fs::remove_file(resolve_patch_path(root, path)?),
    )?;
    Ok(())
}

/// Joins a patch-relative path onto the target directory. Absolute paths
/// and paths that climb out of the target directory are refused.
fn resolve_patch_path(root: &Path, relative: &str) -> io::Result<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("path '{relative}' resolves outside the target directory"),
        ));
    }
    Ok(root.join(rel))
}

/// Prints a unified diff of each change in the commit instead of applying it.
fn print_proposed_changes(commit: &Commit) {
    for (path, change) in &commit.changes {
        let (old, new, heading) = match change {
            FileChange::Add { new_content } => {
                (String::new(), new_content.clone(), path.clone())
            }
            FileChange::Delete { old_content } => {
                (old_content.clone(), String::new(), path.clone())
            }
            FileChange::Update {
                old_content,
                new_content,
                move_path,
            } => {
                let heading = match move_path {
                    Some(dest) => format!("{} (moving to {})", path, dest),
                    None => path.clone(),
                };
                (old_content.clone(), new_content.clone(), heading)
            }
        };

        let diff = unified_diff(similar::Algorithm::default(), &old, &new, 3, Some(("a", "b")));
        println!("----- Proposed changes for {} -----", heading);
        print!("{}", diff);
        println!("------------------------------------");
    }
}
