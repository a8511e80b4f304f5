use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::time::UNIX_EPOCH;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;

use crate::config::DeployMethod;
use crate::core::{FileRecord, FileSet};
use crate::engine::TaskContext;
use crate::utils::copy_rec;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Nothing to deploy, '{0}' doesn't exist")]
    MissingOutput(Utf8PathBuf),

    #[error("Refusing to deploy into '{0}', it overlaps the project or its output")]
    UnsafeTarget(Utf8PathBuf),

    #[error("Couldn't clear deploy target '{path}'.\n{source}")]
    Clear { path: Utf8PathBuf, source: io::Error },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] crate::error::ConfigError),
}

/// Name of the archive published for `environment` at `time`. Hour, minute,
/// month and day are not padded.
pub fn archive_name(name: &str, environment: &str, time: &NaiveDateTime, extension: &str) -> String {
    format!(
        "{name}_{environment}_deployment_{}{}_{}-{}-{}.{extension}",
        time.hour(),
        time.minute(),
        time.year(),
        time.month(),
        time.day(),
    )
}

/// Publishes the output directory to the target of the configured
/// environment.
pub(crate) fn deploy(ctx: &TaskContext<'_>) -> Result<FileSet, DeployError> {
    let config = ctx.config();
    let dist = config.dist();
    let environment = &config.environment;

    if !dist.is_dir() {
        return Err(DeployError::MissingOutput(dist));
    }

    let (method, target) = config.deploy_target(environment)?;
    check_target(method, &target, &config.root, &dist)?;

    let record = match method {
        DeployMethod::Copy => {
            let count = publish_copy(&dist, &target)?;
            tracing::info!(%target, "deployed {count} file(s) to {environment}");
            FileRecord::source(environment, target)
        }
        DeployMethod::Archive => {
            let now = Local::now().naive_local();
            let name = archive_name(&config.name, environment, &now, "tar.gz");
            let path = target.join(&name);
            fs::create_dir_all(&target)?;
            write_archive(&dist, &path)?;
            tracing::info!(archive = %path, "deployed {environment} archive");
            FileRecord::source(name, path)
        }
    };

    Ok([record].into_iter().collect())
}

/// Rejects targets that would destroy the project or be read while being
/// written. A copy target must not contain the project root or the output
/// directory, and no target may lie inside the output directory.
fn check_target(method: DeployMethod, target: &Utf8Path, root: &Utf8Path, dist: &Utf8Path) -> Result<(), DeployError> {
    let target = lexical(target);
    let root = lexical(root);
    let dist = lexical(dist);

    let inside_dist = target.starts_with(&dist);
    let clears_tree = method == DeployMethod::Copy && (root.starts_with(&target) || dist.starts_with(&target));

    if inside_dist || clears_tree {
        return Err(DeployError::UnsafeTarget(target));
    }

    Ok(())
}

/// Resolves `.` and `..` without touching the filesystem.
fn lexical(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();

    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_str()),
        }
    }

    out
}

/// Replaces `target` with a copy of `dist`.
fn publish_copy(dist: &Utf8Path, target: &Utf8Path) -> Result<u64, DeployError> {
    match fs::remove_dir_all(target) {
        Ok(()) => tracing::debug!(%target, "removed previous deployment"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(DeployError::Clear {
                path: target.to_path_buf(),
                source,
            });
        }
    }

    Ok(copy_rec(dist, target)?)
}

/// Packs the tree below `dist` into a gzipped tarball at `path`. Entries
/// are sorted, directories are world writable.
pub(crate) fn write_archive(dist: &Utf8Path, path: &Utf8Path) -> io::Result<()> {
    let file = BufWriter::new(File::create(path)?);
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    append_dir(&mut builder, dist, Utf8Path::new(""))?;

    let mut file = builder.into_inner()?.finish()?;
    io::Write::flush(&mut file)
}

fn append_dir<W: io::Write>(
    builder: &mut tar::Builder<W>,
    dir: &Utf8Path,
    prefix: &Utf8Path,
) -> io::Result<()> {
    let mut entries = dir.read_dir_utf8()?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by(|a, b| a.file_name().cmp(b.file_name()));

    for entry in entries {
        let name = prefix.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o777);
            header.set_size(0);
            header.set_mtime(modified_secs(&entry.metadata()?));
            builder.append_data(&mut header, &name, io::empty())?;
            append_dir(builder, entry.path(), &name)?;
        } else {
            let mut file = File::open(entry.path())?;
            builder.append_file(name.as_str(), &mut file)?;
        }
    }

    Ok(())
}

fn modified_secs(metadata: &fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}
