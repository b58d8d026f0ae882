// SPDX-License-Identifier: GPL-3.0-only

//! Management of per-export files under `/etc/exports.d`.
//!
//! Each binding owns one file. The first line is a marker comment naming the
//! dataset and export so the backend can be listed back without consulting
//! any other state:
//!
//! ```text
//! # zshare dataset=tank/media export=media
//! "/tank/media" 10.0.0.0/24(rw,root_squash,sync)
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use zshare_types::{ActualExport, DatasetKey, ExportBinding, ExportOptions};

use crate::command::run_capture;
use crate::{Result, SysError};

pub const DEFAULT_EXPORTS_DIR: &str = "/etc/exports.d";
pub const EXPORTFS: &str = "exportfs";

const FILE_PREFIX: &str = "zshare-";
const FILE_SUFFIX: &str = ".exports";
const MARKER: &str = "# zshare";

/// `-` is encoded so the `--` separator cannot occur inside a component.
const NAME_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'.').remove(b'_');

/// File name owned by a given (dataset, export) pair. Distinct pairs never
/// share a file.
pub fn file_name(dataset: &DatasetKey, export_name: &str) -> String {
    format!(
        "{FILE_PREFIX}{}--{}{FILE_SUFFIX}",
        utf8_percent_encode(&dataset.name(), NAME_COMPONENT),
        utf8_percent_encode(export_name, NAME_COMPONENT)
    )
}

fn quote_path(path: &str) -> String {
    format!("\"{}\"", path.replace('"', "\\\""))
}

/// Render the exports file of `binding`. Bindings that would not come out as
/// a single marker line plus one export line are refused.
pub fn render_file(binding: &ExportBinding, mountpoint: &str) -> Result<String> {
    binding.validate().map_err(SysError::InvalidArgument)?;
    if mountpoint.is_empty() || mountpoint.chars().any(char::is_control) {
        return Err(SysError::InvalidArgument(format!(
            "invalid mountpoint {mountpoint:?}"
        )));
    }

    let mut contents = format!(
        "{MARKER} dataset={} export={}\n",
        binding.dataset, binding.name
    );
    if let Some(comment) = &binding.options.comment {
        contents.push_str(&format!("# {comment}\n"));
    }
    contents.push_str(&format!(
        "{} {}({})\n",
        quote_path(mountpoint),
        binding.options.client,
        binding.options.render()
    ));
    Ok(contents)
}

fn parse_marker(line: &str) -> Option<(DatasetKey, String)> {
    let rest = line.strip_prefix(MARKER)?.trim();
    // The export name runs to the end of the line and may contain spaces.
    let (dataset, export) = rest.split_once(" export=")?;
    let dataset = DatasetKey::parse(dataset.strip_prefix("dataset=")?)?;
    let export = export.trim();
    if export.is_empty() {
        return None;
    }

    Some((dataset, export.to_string()))
}

fn parse_export_line(line: &str) -> Option<ExportOptions> {
    let line = line.trim();
    let rest = if let Some(quoted) = line.strip_prefix('"') {
        let end = quoted.find('"')?;
        &quoted[end + 1..]
    } else {
        line.split_once(char::is_whitespace)?.1
    };

    let spec = rest.trim();
    let open = spec.find('(')?;
    let close = spec.rfind(')')?;
    if close < open {
        return None;
    }

    Some(ExportOptions::parse(&spec[..open], &spec[open + 1..close]))
}

/// Parse a file written by [`render_file`].
pub fn parse_file(contents: &str) -> Option<ActualExport> {
    let mut lines = contents.lines();
    let (dataset, name) = parse_marker(lines.next()?)?;

    let mut comment = None;
    let mut options = None;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(text) = line.strip_prefix('#') {
            comment = Some(text.trim().to_string());
            continue;
        }
        options = parse_export_line(line);
        break;
    }

    let mut options = options?;
    options.comment = comment;
    Some(ActualExport {
        dataset,
        name,
        options,
    })
}

/// Reads and writes binding files inside one exports directory.
#[derive(Debug, Clone)]
pub struct ExportsDir {
    dir: PathBuf,
    limit: Duration,
}

impl ExportsDir {
    pub fn new(dir: impl Into<PathBuf>, limit: Duration) -> Self {
        Self {
            dir: dir.into(),
            limit,
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, dataset: &DatasetKey, export_name: &str) -> PathBuf {
        self.dir.join(file_name(dataset, export_name))
    }

    /// Write the binding file. Returns `false` when the file already had this content.
    pub async fn write(&self, binding: &ExportBinding, mountpoint: &str) -> Result<bool> {
        let path = self.file_path(&binding.dataset, &binding.name);
        let contents = render_file(binding, mountpoint)?;

        match tokio::fs::read_to_string(&path).await {
            Ok(existing) if existing == contents => return Ok(false),
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(SysError::PathIo { path, source }),
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| SysError::PathIo {
                path: self.dir.clone(),
                source,
            })?;

        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, contents)
            .await
            .map_err(|source| SysError::PathIo {
                path: staging.clone(),
                source,
            })?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|source| SysError::PathIo {
                path: path.clone(),
                source,
            })?;

        Ok(true)
    }

    /// Remove the binding file. Returns `false` when it was already absent.
    pub async fn remove(&self, dataset: &DatasetKey, export_name: &str) -> Result<bool> {
        let path = self.file_path(dataset, export_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(SysError::PathIo { path, source }),
        }
    }

    /// All bindings currently owned by zshare in this directory.
    pub async fn list(&self) -> Result<Vec<ActualExport>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SysError::PathIo {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut exports = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            // Only touch files we created.
            if !file_name.starts_with(FILE_PREFIX) || !file_name.ends_with(FILE_SUFFIX) {
                continue;
            }

            let contents = tokio::fs::read_to_string(entry.path()).await?;
            match parse_file(&contents) {
                Some(export) => exports.push(export),
                None => tracing::warn!("Ignoring unparseable exports file {}", file_name),
            }
        }

        exports.sort_by(|a, b| (&a.dataset, &a.name).cmp(&(&b.dataset, &b.name)));
        Ok(exports)
    }

    /// Ask the NFS server to re-read its exports.
    pub async fn reload(&self) -> Result<()> {
        run_capture(EXPORTFS, &["-ra"], self.limit).await?;
        Ok(())
    }
}
