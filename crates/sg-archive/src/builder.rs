use flate2::{write::GzEncoder, Compression};
use fs2::FileExt;
use futures::StreamExt;
use std::future::Future;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tar::Header;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::error::BuildError;
use crate::index::IndexQuery;
use crate::ledger::ArchiveLedger;
use crate::metadata::{tsv_header, AnalysisRecord};
use crate::model::{archive_filename, fasta_entry_name, metadata_entry_name, BuildRequest};
use crate::store::ObjectStore;

#[derive(Debug, Clone, Copy)]
pub struct BuildLimits {
    pub index_timeout: Duration,
    pub download_timeout: Duration,
}

/// Scratch space under the download directory. Artifacts are renamed out of
/// it, so it must live on the same filesystem.
pub const STAGING_DIR: &str = ".building";

/// Local files belonging to one archive build. Everything except the final
/// artifact lives in the staging directory and belongs to whoever holds the
/// archive's lock file.
#[derive(Debug, Clone)]
pub struct FileBundle {
    staging_dir: PathBuf,
    lock_path: PathBuf,
    work_dir: PathBuf,
    metadata_path: PathBuf,
    fasta_path: PathBuf,
    metadata_entry: String,
    fasta_entry: String,
    artifact_path: PathBuf,
    partial_path: PathBuf,
}

impl FileBundle {
    pub fn new(download_dir: &Path, archive_id: Uuid) -> Self {
        let staging_dir = download_dir.join(STAGING_DIR);
        let work_dir = staging_dir.join(format!("files-archive-{archive_id}"));
        let metadata_entry = metadata_entry_name(archive_id);
        let fasta_entry = fasta_entry_name(archive_id);
        let artifact_name = archive_filename(archive_id);
        Self {
            lock_path: staging_dir.join(format!("files-archive-{archive_id}.lock")),
            partial_path: staging_dir.join(format!("{artifact_name}.partial")),
            metadata_path: work_dir.join(&metadata_entry),
            fasta_path: work_dir.join(&fasta_entry),
            staging_dir,
            work_dir,
            metadata_entry,
            fasta_entry,
            artifact_path: download_dir.join(artifact_name),
        }
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Claims the bundle for this build. `None` means another builder, in
    /// this process or another one, holds it.
    async fn try_lock(&self) -> io::Result<Option<BundleLock>> {
        let staging_dir = self.staging_dir.clone();
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || BundleLock::try_acquire(&staging_dir, &lock_path))
            .await
            .map_err(io::Error::other)?
    }

    /// Clears leftovers of an interrupted attempt and creates the working
    /// directory. Only called while holding the bundle lock.
    async fn prepare(&self) -> io::Result<()> {
        remove_dir_if_exists(&self.work_dir).await?;
        remove_file_if_exists(&self.partial_path).await?;
        fs::create_dir_all(&self.work_dir).await
    }

    /// Packs the metadata table and the fasta payload, in that order, and
    /// moves the result to its final name.
    async fn seal(&self) -> Result<(), BuildError> {
        let partial = self.partial_path.clone();
        let entries = vec![
            (self.metadata_path.clone(), self.metadata_entry.clone()),
            (self.fasta_path.clone(), self.fasta_entry.clone()),
        ];
        tokio::task::spawn_blocking(move || write_tarball(&partial, &entries))
            .await
            .map_err(|err| BuildError::Compression(err.to_string()))?
            .map_err(|err| BuildError::Compression(err.to_string()))?;
        fs::rename(&self.partial_path, &self.artifact_path).await?;
        remove_dir_if_exists(&self.work_dir).await?;
        Ok(())
    }

    /// Removes this attempt's scratch files. A finished artifact is never
    /// touched: it may belong to an earlier, successful build.
    async fn discard(&self) {
        for result in [
            remove_dir_if_exists(&self.work_dir).await,
            remove_file_if_exists(&self.partial_path).await,
        ] {
            if let Err(err) = result {
                tracing::warn!(
                    work_dir = %self.work_dir.display(),
                    error = %err,
                    "failed to clean up archive build files"
                );
            }
        }
    }
}

/// Advisory exclusive lock on a bundle's lock file. The OS drops it when the
/// file is closed, including when the holding process dies. The file itself
/// stays in place so every builder locks the same inode.
#[derive(Debug)]
struct BundleLock {
    _file: std::fs::File,
}

impl BundleLock {
    fn try_acquire(staging_dir: &Path, lock_path: &Path) -> io::Result<Option<Self>> {
        std::fs::create_dir_all(staging_dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(Self { _file: file })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn write_tarball(path: &Path, entries: &[(PathBuf, String)]) -> io::Result<()> {
    let file = std::fs::File::create(path)?;
    let encoder = GzEncoder::new(io::BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (source, name) in entries {
        let file = std::fs::File::open(source)?;
        let mut header = Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(file.metadata()?.len());
        builder.append_data(&mut header, name, file)?;
    }
    builder.finish()?;
    let mut writer = builder.into_inner()?.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn within<T, E>(
    operation: &'static str,
    limit: Duration,
    future: impl Future<Output = Result<T, E>>,
) -> Result<Result<T, E>, BuildError> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| BuildError::Timeout {
            operation,
            seconds: limit.as_secs(),
        })
}

/// Turns a build request into a downloadable artifact and completes the
/// archive. A failed build leaves the archive BUILDING and nothing but its
/// lock file behind.
#[derive(Clone)]
pub struct ArchiveBuilder {
    index: Arc<dyn IndexQuery>,
    store: Arc<dyn ObjectStore>,
    ledger: ArchiveLedger,
    download_dir: PathBuf,
}

impl ArchiveBuilder {
    pub fn new(
        index: Arc<dyn IndexQuery>,
        store: Arc<dyn ObjectStore>,
        ledger: ArchiveLedger,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            index,
            store,
            ledger,
            download_dir,
        }
    }

    pub fn bundle(&self, archive_id: Uuid) -> FileBundle {
        FileBundle::new(&self.download_dir, archive_id)
    }

    /// Returns the artifact's file name.
    pub async fn build(
        &self,
        request: &BuildRequest,
        limits: BuildLimits,
    ) -> Result<String, BuildError> {
        let archive_id = request.archive.id;
        let bundle = self.bundle(archive_id);
        let Some(_lock) = bundle.try_lock().await? else {
            return Err(BuildError::AlreadyBuilding(archive_id));
        };
        if let Some(done) = self.ledger.find_completed(archive_id).await? {
            tracing::debug!(archive_id = %archive_id, "archive already complete, skipping build");
            let filename = done.filename();
            return Ok(done.object_id.unwrap_or(filename));
        }

        let records = within(
            "membership enumeration",
            limits.index_timeout,
            self.index.enumerate(&request.membership_query),
        )
        .await?
        .map_err(BuildError::Index)?;
        tracing::info!(archive_id = %archive_id, records = records.len(), "building archive");

        if let Err(err) = self.assemble(&bundle, &records, limits).await {
            bundle.discard().await;
            return Err(err);
        }

        let filename = archive_filename(archive_id);
        let num_of_samples = i32::try_from(records.len()).unwrap_or(i32::MAX);
        self.ledger
            .mark_complete(archive_id, &filename, num_of_samples)
            .await?;
        Ok(filename)
    }

    async fn assemble(
        &self,
        bundle: &FileBundle,
        records: &[AnalysisRecord],
        limits: BuildLimits,
    ) -> Result<(), BuildError> {
        bundle.prepare().await?;
        {
            let mut metadata = BufWriter::new(fs::File::create(&bundle.metadata_path).await?);
            let mut fasta = BufWriter::new(fs::File::create(&bundle.fasta_path).await?);
            metadata.write_all(tsv_header().as_bytes()).await?;
            for record in records {
                self.append_object(&mut fasta, &record.object_id, limits.download_timeout)
                    .await?;
                metadata.write_all(record.tsv_row().as_bytes()).await?;
            }
            metadata.flush().await?;
            fasta.flush().await?;
        }
        bundle.seal().await
    }

    /// Streams one object into the payload chunk by chunk. Objects that do not
    /// end with a newline get one so the next record starts on its own line.
    async fn append_object<W>(
        &self,
        out: &mut W,
        object_id: &str,
        limit: Duration,
    ) -> Result<(), BuildError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let download = async {
            let mut stream = self.store.get_object_stream(object_id).await?;
            let mut last_byte = None;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if let Some(byte) = chunk.last() {
                    last_byte = Some(*byte);
                }
                out.write_all(&chunk).await?;
            }
            if matches!(last_byte, Some(byte) if byte != b'\n') {
                out.write_all(b"\n").await?;
            }
            Ok::<(), anyhow::Error>(())
        };
        within("object download", limit, download)
            .await?
            .map_err(|source| BuildError::Download {
                object_id: object_id.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepare_clears_previous_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = FileBundle::new(dir.path(), Uuid::new_v4());
        fs::create_dir_all(&bundle.work_dir).await.unwrap();
        fs::write(bundle.work_dir.join("stale.txt"), b"old").await.unwrap();
        fs::write(&bundle.partial_path, b"half").await.unwrap();
        fs::write(&bundle.artifact_path, b"finished").await.unwrap();

        bundle.prepare().await.unwrap();

        assert!(bundle.work_dir.is_dir());
        assert!(!bundle.work_dir.join("stale.txt").exists());
        assert!(!bundle.partial_path.exists());
        assert_eq!(fs::read(&bundle.artifact_path).await.unwrap(), b"finished");
    }

    #[tokio::test]
    async fn discard_keeps_finished_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = FileBundle::new(dir.path(), Uuid::new_v4());
        bundle.prepare().await.unwrap();
        fs::write(&bundle.partial_path, b"half").await.unwrap();
        fs::write(&bundle.artifact_path, b"finished").await.unwrap();

        bundle.discard().await;

        assert!(!bundle.work_dir.exists());
        assert!(!bundle.partial_path.exists());
        assert!(bundle.artifact_path.exists());
    }

    #[tokio::test]
    async fn bundle_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let archive_id = Uuid::new_v4();
        let first = FileBundle::new(dir.path(), archive_id);
        let second = FileBundle::new(dir.path(), archive_id);

        let held = first.try_lock().await.unwrap();
        assert!(held.is_some());
        assert!(second.try_lock().await.unwrap().is_none());

        drop(held);
        assert!(second.try_lock().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn seal_writes_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let archive_id = Uuid::new_v4();
        let bundle = FileBundle::new(dir.path(), archive_id);
        bundle.prepare().await.unwrap();
        fs::write(&bundle.metadata_path, b"object_id\n").await.unwrap();
        fs::write(&bundle.fasta_path, b">a\nACGT\n").await.unwrap();

        bundle.seal().await.unwrap();

        assert!(!bundle.work_dir.exists());
        assert!(!bundle.partial_path.exists());
        let file = std::fs::File::open(bundle.artifact_path()).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(
            names,
            vec![metadata_entry_name(archive_id), fasta_entry_name(archive_id)]
        );
    }
}
