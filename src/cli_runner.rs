//! Runs a parsed command line: sets up logging, turns flags into [`CreateOptions`], and drives
//! archive creation.

use crate::archive::Destination;
use crate::cli::{self, Commands, CommonArgs};
use crate::common::EntryType;
use crate::create::{self, CreateOptions, ErrorPolicy, ExistingEntry, ExistingHeaders};
use crate::header::IdentityPolicy;
use crate::progress::{ProgressCallback, ProgressState};
use crate::ArchiverError;

use chrono::{DateTime, Local};
use tracing_subscriber::EnvFilter;

/// Public entry for running CLI logic.
pub fn run_cli_app() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let command = cli::run()?;

    match &command {
        Commands::Create { common } => {
            run_create(common, false, None, false)?;
        }
        Commands::Append { common, existing_index, skip_existing } => {
            let destination = Destination::from_path(&common.file);
            if existing_index.is_none() && create::destination_has_data(&destination) {
                let msg = format!(
                    "'{destination}' already holds data; appending to it needs --existing-index \
                     so new entries replace its end-of-archive marker"
                );
                return Err(ArchiverError::Other(msg.into()).into());
            }
            let existing = existing_index.as_deref().map(create::load_index).transpose()?;
            run_create(common, true, existing, *skip_existing)?;
        }
    }

    Ok(())
}

/// Installs a stderr `fmt` subscriber. Standard output may carry the archive itself, so
/// nothing but archive bytes ever goes there.
fn init_logging() {
    let filter = EnvFilter::try_from_env(cli::LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_create(
    common: &CommonArgs,
    append: bool,
    existing: Option<Vec<ExistingEntry>>,
    skip_existing: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = CreateOptions {
        error_policy: if common.keep_going { ErrorPolicy::Continue } else { ErrorPolicy::Abort },
        identity_policy: if common.strict_ids { IdentityPolicy::Strict } else { IdentityPolicy::Fallback },
        skip_existing,
        progress: match common.verbose {
            0 => None,
            1 => Some(Box::new(|state: &ProgressState<'_>| eprintln!("{}", member_name(state))) as Box<ProgressCallback>),
            _ => Some(Box::new(|state: &ProgressState<'_>| eprintln!("{}", long_listing(state))) as Box<ProgressCallback>),
        },
    };

    let existing = existing.as_ref().map(|e| e as &dyn ExistingHeaders);
    create::create(&common.inputs, Destination::from_path(&common.file), append, existing, options)?;
    Ok(())
}

fn member_name(state: &ProgressState<'_>) -> String {
    let mut name = String::from_utf8_lossy(&state.entry.path).into_owned();
    if state.entry.entry_type() == Some(EntryType::Directory) {
        name.push('/');
    }
    name
}

/// `ls -l` style line: type and permissions, owner/group, size, mtime, name.
fn long_listing(state: &ProgressState<'_>) -> String {
    let entry = state.entry;
    let owner = name_or_id(state.header.uname(), entry.uid);
    let group = name_or_id(state.header.gname(), entry.gid);
    let mtime = DateTime::from_timestamp(entry.mtime, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| entry.mtime.to_string());

    let mut line = format!(
        "{} {}/{} {:>8} {} {}",
        mode_string(entry.entry_type(), entry.mode),
        owner,
        group,
        entry.data_size(),
        mtime,
        member_name(state)
    );
    if let Some(target) = &entry.link_target {
        line.push_str(" -> ");
        line.push_str(&String::from_utf8_lossy(target));
    }
    line
}

fn name_or_id(name: &[u8], id: u32) -> String {
    if name.is_empty() {
        id.to_string()
    } else {
        String::from_utf8_lossy(name).into_owned()
    }
}

fn mode_string(entry_type: Option<EntryType>, mode: u32) -> String {
    let kind = match entry_type {
        Some(EntryType::Regular) => '-',
        Some(EntryType::Symlink) => 'l',
        Some(EntryType::CharDevice) => 'c',
        Some(EntryType::BlockDevice) => 'b',
        Some(EntryType::Directory) => 'd',
        Some(EntryType::Fifo) => 'p',
        None => '?',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for (shift, special, special_char) in [(6, 0o4000, 's'), (3, 0o2000, 's'), (0, 0o1000, 't')] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        let exec = bits & 0o1 != 0;
        out.push(match (mode & special != 0, exec) {
            (true, true) => special_char,
            (true, false) => special_char.to_ascii_uppercase(),
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_strings() {
        assert_eq!(mode_string(Some(EntryType::Regular), 0o644), "-rw-r--r--");
        assert_eq!(mode_string(Some(EntryType::Directory), 0o755), "drwxr-xr-x");
        assert_eq!(mode_string(Some(EntryType::Regular), 0o4755), "-rwsr-xr-x");
        assert_eq!(mode_string(Some(EntryType::Directory), 0o1777), "drwxrwxrwt");
        assert_eq!(mode_string(Some(EntryType::Fifo), 0o2640), "prw-r-S---");
    }

    #[test]
    fn missing_names_show_ids() {
        assert_eq!(name_or_id(b"", 1234), "1234");
        assert_eq!(name_or_id(b"root", 0), "root");
    }
}
