use flate2::read::GzDecoder;
use serde_json::json;
use sg_core::service_config;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::builder::{ArchiveBuilder, BuildLimits, STAGING_DIR};
use crate::channel::BuildRequestChannel;
use crate::error::BuildError;
use crate::ledger::ArchiveLedger;
use crate::metadata::TSV_COLUMNS;
use crate::model::{archive_filename, ArchiveStatus, SetDocument};
use crate::repository::{ArchiveRepository, MemoryArchiveRepository};
use crate::service::ArchiveService;
use crate::test_support::{FakeIndex, FakeStore};
use crate::worker;

const LIMITS: BuildLimits = BuildLimits {
    index_timeout: Duration::from_secs(5),
    download_timeout: Duration::from_secs(5),
};

struct Harness {
    service: ArchiveService,
    builder: ArchiveBuilder,
    repository: MemoryArchiveRepository,
    index: FakeIndex,
    set: SetDocument,
}

fn harness(object_ids: &[&str], store: FakeStore, download_dir: &Path) -> Harness {
    let set = SetDocument {
        set_id: Uuid::new_v4(),
        sqon: json!({"op": "in", "content": {"field": "object_id", "value": object_ids}}),
        size: object_ids.len() as i64,
    };
    let index = FakeIndex::with_objects(object_ids, "t1").with_set(set.clone());
    let repository = MemoryArchiveRepository::new();
    let ledger = ArchiveLedger::new(Arc::new(repository.clone()), BuildRequestChannel::new(16));
    let builder = ArchiveBuilder::new(
        Arc::new(index.clone()),
        Arc::new(store),
        ledger.clone(),
        download_dir.to_path_buf(),
    );
    let service = ArchiveService::new(
        Arc::new(index.clone()),
        ledger,
        service_config::static_handle(json!({})),
        download_dir.to_path_buf(),
    );
    Harness {
        service,
        builder,
        repository,
        index,
        set,
    }
}

fn read_entries(path: &Path) -> Vec<(String, String)> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            (name, body)
        })
        .collect()
}

/// Everything under `dir` except lock files.
fn leftover_files(dir: &Path) -> Vec<String> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == STAGING_DIR {
            found.extend(
                leftover_files(&entry.path())
                    .into_iter()
                    .map(|nested| format!("{STAGING_DIR}/{nested}")),
            );
        } else if !name.ends_with(".lock") {
            found.push(name);
        }
    }
    found
}

#[tokio::test]
async fn set_archive_is_built_once_and_reused() {
    let dir = tempfile::tempdir().unwrap();
    let objects = ["obj-1", "obj-2", "obj-3"];
    let h = harness(&objects, FakeStore::with_fasta(&objects), dir.path());
    let mut requests = h.service.ledger().channel().subscribe();

    let archive = h.service.get_or_create_set_archive(h.set.set_id).await.unwrap();
    assert_eq!(archive.status, ArchiveStatus::Building);

    let request = requests.try_recv().unwrap();
    assert_eq!(request.archive.id, archive.id);
    let filename = h.builder.build(&request, LIMITS).await.unwrap();
    assert_eq!(filename, archive_filename(archive.id));

    let completed = h.service.get_completed_archive(archive.id).await.unwrap();
    assert_eq!(completed.status, ArchiveStatus::Complete);
    assert_eq!(completed.object_id.as_deref(), Some(filename.as_str()));
    assert_eq!(completed.meta.num_of_samples, 3);

    let entries = read_entries(&dir.path().join(&filename));
    assert_eq!(entries.len(), 2);
    let (tsv_name, tsv) = &entries[0];
    let (fasta_name, fasta) = &entries[1];
    assert_eq!(tsv_name, &format!("1-files-archive-{}.tsv", archive.id));
    assert_eq!(fasta_name, &format!("2-files-archive-{}.fasta", archive.id));

    let lines: Vec<&str> = tsv.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], TSV_COLUMNS.join("\t"));
    for (line, object_id) in lines[1..].iter().zip(objects) {
        assert!(line.starts_with(&format!("{object_id}\tSTUDY-1\t2021-06-01\t")));
    }
    for object_id in objects {
        assert!(fasta.contains(&format!(">{object_id}\nACGTACGTAC\nGTACGT\n")));
    }
    assert_eq!(fasta.matches('>').count(), 3);

    let again = h.service.get_or_create_set_archive(h.set.set_id).await.unwrap();
    assert_eq!(again.id, archive.id);
    assert_eq!(again.status, ArchiveStatus::Complete);
    assert!(requests.try_recv().is_err());
    assert_eq!(h.index.enumerations(), 1);
    assert_eq!(h.repository.len().await, 1);

    let (_, path) = h.service.open_download(archive.id).await.unwrap();
    assert_eq!(path, dir.path().join(&filename));
    let counted = h.repository.find_by_id(archive.id).await.unwrap().unwrap();
    assert_eq!(counted.meta.num_of_downloads, 1);
}

#[tokio::test]
async fn failed_download_leaves_no_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let objects = ["obj-1", "obj-2", "obj-3"];
    let store = FakeStore::with_fasta(&objects).failing_on("obj-2");
    let h = harness(&objects, store, dir.path());
    let mut requests = h.service.ledger().channel().subscribe();

    let archive = h.service.get_or_create_set_archive(h.set.set_id).await.unwrap();
    let request = requests.try_recv().unwrap();
    let err = h.builder.build(&request, LIMITS).await.unwrap_err();
    assert!(matches!(err, BuildError::Download { ref object_id, .. } if object_id == "obj-2"));

    let leftovers = leftover_files(dir.path());
    assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
    assert!(!dir.path().join(archive_filename(archive.id)).exists());

    let stored = h.repository.find_by_id(archive.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ArchiveStatus::Building);
    assert!(h.service.get_completed_archive(archive.id).await.is_err());
}

#[tokio::test]
async fn worker_builds_emitted_requests() {
    let dir = tempfile::tempdir().unwrap();
    let objects = ["obj-1"];
    let h = harness(&objects, FakeStore::with_fasta(&objects), dir.path());
    let receiver = h.service.ledger().channel().subscribe();
    worker::spawn_build_worker(
        h.builder.clone(),
        receiver,
        service_config::static_handle(json!({})),
        1,
    );

    let archive = h.service.get_or_create_set_archive(h.set.set_id).await.unwrap();

    let mut status = ArchiveStatus::Building;
    for _ in 0..100 {
        status = h
            .repository
            .find_by_id(archive.id)
            .await
            .unwrap()
            .unwrap()
            .status;
        if status == ArchiveStatus::Complete {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, ArchiveStatus::Complete);
    assert!(dir.path().join(archive_filename(archive.id)).exists());
}

#[tokio::test]
async fn second_builder_on_same_directory_leaves_first_build_intact() {
    let dir = tempfile::tempdir().unwrap();
    let objects = ["obj-1", "obj-2", "obj-3"];
    let slow = FakeStore::with_fasta(&objects).with_chunk_delay(Duration::from_millis(20));
    let h = harness(&objects, slow.clone(), dir.path());
    let other = ArchiveBuilder::new(
        Arc::new(h.index.clone()),
        Arc::new(slow),
        h.service.ledger().clone(),
        dir.path().to_path_buf(),
    );
    let mut requests = h.service.ledger().channel().subscribe();

    let archive = h.service.get_or_create_set_archive(h.set.set_id).await.unwrap();
    let request = requests.try_recv().unwrap();

    let first = {
        let builder = h.builder.clone();
        let request = request.clone();
        tokio::spawn(async move { builder.build(&request, LIMITS).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = other.build(&request, LIMITS).await;
    assert!(matches!(second, Err(BuildError::AlreadyBuilding(id)) if id == archive.id));

    let filename = first.await.unwrap().unwrap();
    let artifact = dir.path().join(&filename);
    assert!(artifact.exists());
    assert_eq!(read_entries(&artifact).len(), 2);
    let stored = h.repository.find_by_id(archive.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ArchiveStatus::Complete);

    // Once the lock is free a late builder sees the completed row and
    // leaves the artifact where it is.
    assert_eq!(other.build(&request, LIMITS).await.unwrap(), filename);
    assert!(artifact.exists());
    assert_eq!(leftover_files(dir.path()), vec![filename]);
}
