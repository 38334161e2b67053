use std::{
    ffi::OsString,
    fs::{self, OpenOptions},
    io::{Read, Write},
    path::{Component, Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{
    blocking::{Client, RequestBuilder, Response},
    header, StatusCode,
};
use serde::Deserialize;
use tracing::debug;

use super::metadata::compute_sha256;

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
pub const DEFAULT_REVISION: &str = "main";

const STAGING_SUFFIX: &str = "partial";
const INCOMPLETE_SUFFIX: &str = "incomplete";
const CHUNK_SIZE: usize = 256 * 1024;

/// Bulk download of a whole remote repository into a local directory.
pub trait SnapshotSource: Send + Sync {
    fn fetch_snapshot(
        &self,
        repo_id: &str,
        destination: &Path,
        token: Option<&str>,
    ) -> Result<SnapshotOutcome>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub files: usize,
    pub skipped: usize,
    pub bytes_downloaded: u64,
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<RepoFile>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
struct RepoFile {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<LfsPointer>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
struct LfsPointer {
    sha256: String,
    size: u64,
}

impl RepoFile {
    fn expected_size(&self) -> Option<u64> {
        self.lfs.as_ref().map(|lfs| lfs.size).or(self.size)
    }
}

/// Snapshot download from a Hugging Face compatible hub.
///
/// Files are staged next to the destination in `<dir>.partial/` and only
/// moved into the destination once every file has been fetched and checked,
/// so an interrupted run never leaves a half-populated model directory.
/// Interrupted files resume with a `Range` request on the next attempt.
pub struct HubSnapshot {
    client: Client,
    endpoint: String,
    revision: String,
}

impl HubSnapshot {
    pub fn new(endpoint: impl Into<String>, revision: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("model-preflight/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Option::<Duration>::None)
            .build()
            .context("create http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            revision: revision.into(),
        })
    }

    fn list_files(&self, repo_id: &str, token: Option<&str>) -> Result<Vec<RepoFile>> {
        let url = format!(
            "{}/api/models/{}/revision/{}?blobs=true",
            self.endpoint, repo_id, self.revision
        );
        let info: RepoInfo = authorized(self.client.get(&url), token)
            .send()
            .with_context(|| format!("request {url}"))?
            .error_for_status()
            .with_context(|| format!("list files of {repo_id}"))?
            .json()
            .with_context(|| format!("parse file listing of {repo_id}"))?;
        Ok(info.siblings)
    }

    fn download_file(
        &self,
        repo_id: &str,
        file: &RepoFile,
        target: &Path,
        token: Option<&str>,
    ) -> Result<u64> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let partial = with_suffix(target, INCOMPLETE_SUFFIX);
        let mut resume_from = fs::metadata(&partial).map(|meta| meta.len()).unwrap_or(0);

        // A run that died between the last byte and the rename leaves a full-length partial.
        if resume_from > 0 && file.expected_size().is_some_and(|size| resume_from >= size) {
            if verify_file(file, &partial).is_ok() {
                debug!(file = %file.rfilename, "partial download already complete");
                fs::rename(&partial, target)
                    .with_context(|| format!("move {} into place", file.rfilename))?;
                return Ok(0);
            }
            debug!(file = %file.rfilename, "discarding unusable partial download");
            let _ = fs::remove_file(&partial);
            resume_from = 0;
        }

        let mut response = self.request_file(repo_id, file, token, resume_from)?;
        if resume_from > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!(file = %file.rfilename, resume_from, "range rejected, restarting file");
            let _ = fs::remove_file(&partial);
            resume_from = 0;
            response = self.request_file(repo_id, file, token, resume_from)?;
        }
        let url = response.url().to_string();
        let mut response = response
            .error_for_status()
            .with_context(|| format!("download {url}"))?;

        let append = resume_from > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        let mut output = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&partial)
            .with_context(|| format!("open {}", partial.display()))?;

        let downloaded = stream_to(&mut response, &mut output)?;
        output.flush().context("flush download")?;
        drop(output);

        verify_file(file, &partial).map_err(|error| {
            let _ = fs::remove_file(&partial);
            error
        })?;
        fs::rename(&partial, target)
            .with_context(|| format!("move {} into place", file.rfilename))?;
        Ok(downloaded)
    }

    fn request_file(
        &self,
        repo_id: &str,
        file: &RepoFile,
        token: Option<&str>,
        resume_from: u64,
    ) -> Result<Response> {
        let url = format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint, repo_id, self.revision, file.rfilename
        );
        let mut request = authorized(self.client.get(&url), token);
        if resume_from > 0 {
            debug!(file = %file.rfilename, resume_from, "resuming partial download");
            request = request.header(header::RANGE, format!("bytes={resume_from}-"));
        }
        request.send().with_context(|| format!("request {url}"))
    }
}

impl SnapshotSource for HubSnapshot {
    fn fetch_snapshot(
        &self,
        repo_id: &str,
        destination: &Path,
        token: Option<&str>,
    ) -> Result<SnapshotOutcome> {
        let files = self.list_files(repo_id, token)?;
        if files.is_empty() {
            bail!("repository {repo_id} lists no files");
        }

        let staging = staging_dir(destination);
        let mut outcome = SnapshotOutcome {
            files: files.len(),
            ..SnapshotOutcome::default()
        };
        let mut staged = Vec::with_capacity(files.len());

        for file in &files {
            let relative = sanitize_relative(&file.rfilename)?;
            if is_complete(&destination.join(&relative), file.expected_size()) {
                outcome.skipped += 1;
                continue;
            }
            let target = staging.join(&relative);
            if !is_complete(&target, file.expected_size()) {
                debug!(repo = repo_id, file = %file.rfilename, "downloading file");
                outcome.bytes_downloaded += self.download_file(repo_id, file, &target, token)?;
            }
            staged.push(relative);
        }

        promote(&staging, destination, &staged)?;
        Ok(outcome)
    }
}

fn authorized(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

fn stream_to<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> Result<u64> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let read = reader.read(&mut buffer).context("read download chunk")?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .context("write download chunk")?;
        written += read as u64;
    }
    Ok(written)
}

fn verify_file(file: &RepoFile, path: &Path) -> Result<()> {
    let size = fs::metadata(path).context("stat downloaded file")?.len();
    if let Some(expected) = file.expected_size() {
        if size != expected {
            return Err(anyhow!(
                "size mismatch for {}: expected {} bytes, got {}",
                file.rfilename,
                expected,
                size
            ));
        }
    }
    if let Some(lfs) = &file.lfs {
        let checksum = compute_sha256(path)?;
        if !checksum.eq_ignore_ascii_case(&lfs.sha256) {
            return Err(anyhow!(
                "checksum mismatch for {}: expected {}, got {}",
                file.rfilename,
                lfs.sha256,
                checksum
            ));
        }
    }
    Ok(())
}

fn promote(staging: &Path, destination: &Path, staged: &[PathBuf]) -> Result<()> {
    for relative in staged {
        let from = staging.join(relative);
        let to = destination.join(relative);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::rename(&from, &to)
            .with_context(|| format!("move {} to {}", from.display(), to.display()))?;
    }
    if staging.exists() {
        fs::remove_dir_all(staging)
            .with_context(|| format!("remove staging directory {}", staging.display()))?;
    }
    Ok(())
}

fn is_complete(path: &Path, expected_size: Option<u64>) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => expected_size.map_or(true, |size| meta.len() == size),
        _ => false,
    }
}

fn sanitize_relative(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let safe = path
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if name.is_empty() || !safe {
        bail!("refusing to write remote file {name:?} outside the destination");
    }
    Ok(path.to_path_buf())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("snapshot"));
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn staging_dir(destination: &Path) -> PathBuf {
    with_suffix(destination, STAGING_SUFFIX)
}
