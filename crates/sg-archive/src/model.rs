use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::fingerprint::SetQueryArchiveHashInfo;

/// Name of the downloadable artifact for an archive.
pub fn archive_filename(archive_id: Uuid) -> String {
    format!("files-archive-{archive_id}.tar.gz")
}

pub fn metadata_entry_name(archive_id: Uuid) -> String {
    format!("1-files-archive-{archive_id}.tsv")
}

pub fn fasta_entry_name(archive_id: Uuid) -> String {
    format!("2-files-archive-{archive_id}.fasta")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveStatus {
    Building,
    Complete,
    Failed,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveStatus::Building => "BUILDING",
            ArchiveStatus::Complete => "COMPLETE",
            ArchiveStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "BUILDING" => Ok(ArchiveStatus::Building),
            "COMPLETE" => Ok(ArchiveStatus::Complete),
            "FAILED" => Ok(ArchiveStatus::Failed),
            other => Err(format!("unknown archive status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveType {
    Set,
    All,
}

impl ArchiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveType::Set => "SET",
            ArchiveType::All => "ALL",
        }
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "SET" => Ok(ArchiveType::Set),
            "ALL" => Ok(ArchiveType::All),
            other => Err(format!("unknown archive type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveMeta {
    pub num_of_downloads: i32,
    pub num_of_samples: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Archive {
    pub id: Uuid,
    pub status: ArchiveStatus,
    #[serde(rename = "type")]
    pub archive_type: ArchiveType,
    pub hash: String,
    pub hash_info: String,
    pub set_id: Option<Uuid>,
    pub object_id: Option<String>,
    pub created_at: i64,
    pub build_attempts: i32,
    /// When a build request for this archive was last emitted.
    #[serde(skip)]
    pub offered_at: i64,
    pub meta: ArchiveMeta,
}

impl Archive {
    /// A fresh BUILDING archive keyed by the fingerprint's hash.
    pub fn building(
        hash_info: &SetQueryArchiveHashInfo,
        archive_type: ArchiveType,
        set_id: Option<Uuid>,
        created_at: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: ArchiveStatus::Building,
            archive_type,
            hash: hash_info.hash(),
            hash_info: hash_info.canonical(),
            set_id,
            object_id: None,
            created_at,
            build_attempts: 0,
            offered_at: created_at,
            meta: ArchiveMeta::default(),
        }
    }

    /// Rebuilds the membership query captured when the archive was requested.
    pub fn membership_query(&self) -> Option<MembershipQuery> {
        match self.archive_type {
            ArchiveType::All => Some(MembershipQuery::MatchAll),
            ArchiveType::Set => self
                .set_id
                .map(|set_id| MembershipQuery::SetTermsLookup { set_id }),
        }
    }

    pub fn filename(&self) -> String {
        archive_filename(self.id)
    }
}

/// Predicate selecting the index records that belong in an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipQuery {
    MatchAll,
    /// Records whose `_id` appears in the `ids` list of the set document.
    SetTermsLookup { set_id: Uuid },
}

impl MembershipQuery {
    pub fn to_query(&self, sets_index: &str) -> Value {
        match self {
            MembershipQuery::MatchAll => json!({ "match_all": {} }),
            MembershipQuery::SetTermsLookup { set_id } => json!({
                "terms": {
                    "_id": {
                        "index": sets_index,
                        "id": set_id.to_string(),
                        "path": "ids"
                    }
                }
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub archive: Archive,
    pub membership_query: MembershipQuery,
}

/// A stored set definition. Read only.
#[derive(Debug, Clone, PartialEq)]
pub struct SetDocument {
    pub set_id: Uuid,
    pub sqon: Value,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountAndLastUpdated {
    pub count: i64,
    pub last_updated: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    Status,
    Type,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::Status => "status",
            SortField::Type => "type",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn keyword(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveFilter {
    pub status: Option<ArchiveStatus>,
    pub archive_type: Option<ArchiveType>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
    pub page: u32,
    pub size: u32,
    pub sort_field: SortField,
    pub sort_direction: SortDirection,
}

impl ArchiveFilter {
    pub fn offset(&self) -> i64 {
        i64::from(self.page) * i64::from(self.size)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub total_elements: i64,
    pub page: u32,
    pub size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terms_lookup_targets_set_ids() {
        let set_id = Uuid::new_v4();
        let query = MembershipQuery::SetTermsLookup { set_id }.to_query("arranger-sets");
        assert_eq!(query["terms"]["_id"]["index"], "arranger-sets");
        assert_eq!(query["terms"]["_id"]["id"], set_id.to_string());
        assert_eq!(query["terms"]["_id"]["path"], "ids");
    }

    #[test]
    fn set_archive_without_set_id_has_no_membership() {
        let info = SetQueryArchiveHashInfo::for_all(&CountAndLastUpdated {
            count: 1,
            last_updated: "t".to_string(),
        });
        let mut archive = Archive::building(&info, ArchiveType::Set, None, 0);
        assert_eq!(archive.membership_query(), None);
        archive.archive_type = ArchiveType::All;
        assert_eq!(archive.membership_query(), Some(MembershipQuery::MatchAll));
    }

    #[test]
    fn artifact_names_follow_archive_id() {
        let id = Uuid::nil();
        assert_eq!(
            archive_filename(id),
            "files-archive-00000000-0000-0000-0000-000000000000.tar.gz"
        );
        assert!(metadata_entry_name(id).starts_with("1-files-archive-"));
        assert!(fasta_entry_name(id).ends_with(".fasta"));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("complete".parse::<ArchiveStatus>(), Ok(ArchiveStatus::Complete));
        assert!("DONE".parse::<ArchiveStatus>().is_err());
    }
}
