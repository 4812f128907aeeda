use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Metadata table columns, in output order.
pub const TSV_COLUMNS: [&str; 45] = [
    "object_id",
    "study_id",
    "first_published_at",
    "purpose_of_sequencing",
    "purpose_of_sequencing_details",
    "sequencing_instrument",
    "sequencing_protocol",
    "gisaid_accession",
    "host_age",
    "host_age_null_reason",
    "host_gender",
    "host_age_bin",
    "host_disease",
    "host_age_unit",
    "host_scientific_name",
    "gene_name",
    "diagnostic_pcr_ct_value",
    "diagnostic_pcr_ct_value_null_reason",
    "isolate",
    "fasta_header_name",
    "organism",
    "body_product",
    "anatomical_part",
    "geo_loc_country",
    "geo_loc_province",
    "collection_device",
    "collection_method",
    "environmental_site",
    "anatomical_material",
    "purpose_of_sampling",
    "sample_collected_by",
    "sequence_submitted_by",
    "environmental_material",
    "sample_collection_date",
    "purpose_of_sampling_details",
    "sample_collection_date_null_reason",
    "consensus_sequence_software_name",
    "consensus_sequence_software_version",
    "dehosting_method",
    "breadth_of_coverage",
    "depth_of_coverage",
    "reference_genome_accession",
    "raw_sequence_data_processing_method",
    "bioinformatics_protocol",
    "submitter_donor_id",
];

/// Index fields fetched for each record; order mirrors [`TSV_COLUMNS`].
pub const SOURCE_FIELDS: [&str; 45] = [
    "object_id",
    "study_id",
    "analysis.first_published_at",
    "analysis.experiment.purpose_of_sequencing",
    "analysis.experiment.purpose_of_sequencing_details",
    "analysis.experiment.sequencing_instrument",
    "analysis.experiment.sequencing_protocol",
    "analysis.database_identifiers.gisaid_accession",
    "analysis.host.host_age",
    "analysis.host.host_age_null_reason",
    "analysis.host.host_gender",
    "analysis.host.host_age_bin",
    "analysis.host.host_disease",
    "analysis.host.host_age_unit",
    "analysis.host.host_scientific_name",
    "analysis.pathogen_diagnostic_testing.gene_name",
    "analysis.pathogen_diagnostic_testing.diagnostic_pcr_ct_value",
    "analysis.pathogen_diagnostic_testing.diagnostic_pcr_ct_value_null_reason",
    "analysis.sample_collection.isolate",
    "analysis.sample_collection.fasta_header_name",
    "analysis.sample_collection.organism",
    "analysis.sample_collection.body_product",
    "analysis.sample_collection.anatomical_part",
    "analysis.sample_collection.geo_loc_country",
    "analysis.sample_collection.geo_loc_province",
    "analysis.sample_collection.collection_device",
    "analysis.sample_collection.collection_method",
    "analysis.sample_collection.environmental_site",
    "analysis.sample_collection.anatomical_material",
    "analysis.sample_collection.purpose_of_sampling",
    "analysis.sample_collection.sample_collected_by",
    "analysis.sample_collection.sequence_submitted_by",
    "analysis.sample_collection.environmental_material",
    "analysis.sample_collection.sample_collection_date",
    "analysis.sample_collection.purpose_of_sampling_details",
    "analysis.sample_collection.sample_collection_date_null_reason",
    "analysis.sequence_analysis.consensus_sequence_software_name",
    "analysis.sequence_analysis.consensus_sequence_software_version",
    "analysis.sequence_analysis.dehosting_method",
    "analysis.sequence_analysis.metrics.breadth_of_coverage",
    "analysis.sequence_analysis.metrics.depth_of_coverage",
    "analysis.sequence_analysis.reference_genome_accession",
    "analysis.sequence_analysis.raw_sequence_data_processing_method",
    "analysis.sequence_analysis.bioinformatics_protocol",
    "donors.submitter_donor_id",
];

/// One row of the metadata table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisRecord {
    pub object_id: String,
    pub study_id: String,
    pub first_published_at: String,
    pub purpose_of_sequencing: Option<String>,
    pub purpose_of_sequencing_details: Option<String>,
    pub sequencing_instrument: Option<String>,
    pub sequencing_protocol: Option<String>,
    pub gisaid_accession: Option<String>,
    pub host_age: Option<String>,
    pub host_age_null_reason: Option<String>,
    pub host_gender: Option<String>,
    pub host_age_bin: Option<String>,
    pub host_disease: Option<String>,
    pub host_age_unit: Option<String>,
    pub host_scientific_name: Option<String>,
    pub gene_name: Option<String>,
    pub diagnostic_pcr_ct_value: Option<String>,
    pub diagnostic_pcr_ct_value_null_reason: Option<String>,
    pub isolate: Option<String>,
    pub fasta_header_name: Option<String>,
    pub organism: Option<String>,
    pub body_product: Option<String>,
    pub anatomical_part: Option<String>,
    pub geo_loc_country: Option<String>,
    pub geo_loc_province: Option<String>,
    pub collection_device: Option<String>,
    pub collection_method: Option<String>,
    pub environmental_site: Option<String>,
    pub anatomical_material: Option<String>,
    pub purpose_of_sampling: Option<String>,
    pub sample_collected_by: Option<String>,
    pub sequence_submitted_by: Option<String>,
    pub environmental_material: Option<String>,
    pub sample_collection_date: Option<String>,
    pub purpose_of_sampling_details: Option<String>,
    pub sample_collection_date_null_reason: Option<String>,
    pub consensus_sequence_software_name: Option<String>,
    pub consensus_sequence_software_version: Option<String>,
    pub dehosting_method: Option<String>,
    pub breadth_of_coverage: Option<String>,
    pub depth_of_coverage: Option<String>,
    pub reference_genome_accession: Option<String>,
    pub raw_sequence_data_processing_method: Option<String>,
    pub bioinformatics_protocol: Option<String>,
    /// Donor ids joined with `,`.
    pub submitter_donor_id: String,
}

impl AnalysisRecord {
    /// Flattens an index `_source` document.
    pub fn from_source(source: &Value) -> Result<Self, serde_json::Error> {
        let doc = SourceDocument::deserialize(source)?;
        let analysis = doc.analysis;
        let experiment = analysis.experiment;
        let host = analysis.host;
        let testing = analysis.pathogen_diagnostic_testing;
        let sample = analysis.sample_collection;
        let sequence = analysis.sequence_analysis;
        let donor_ids: Vec<String> = doc
            .donors
            .into_iter()
            .filter_map(|donor| text(donor.submitter_donor_id))
            .collect();

        Ok(Self {
            object_id: doc.object_id,
            study_id: doc.study_id,
            first_published_at: analysis
                .first_published_at
                .as_ref()
                .map(render_epoch_millis)
                .unwrap_or_default(),
            purpose_of_sequencing: text(experiment.purpose_of_sequencing),
            purpose_of_sequencing_details: text(experiment.purpose_of_sequencing_details),
            sequencing_instrument: text(experiment.sequencing_instrument),
            sequencing_protocol: text(experiment.sequencing_protocol),
            gisaid_accession: text(analysis.database_identifiers.gisaid_accession),
            host_age: text(host.host_age),
            host_age_null_reason: text(host.host_age_null_reason),
            host_gender: text(host.host_gender),
            host_age_bin: text(host.host_age_bin),
            host_disease: text(host.host_disease),
            host_age_unit: text(host.host_age_unit),
            host_scientific_name: text(host.host_scientific_name),
            gene_name: text(testing.gene_name),
            diagnostic_pcr_ct_value: text(testing.diagnostic_pcr_ct_value),
            diagnostic_pcr_ct_value_null_reason: text(testing.diagnostic_pcr_ct_value_null_reason),
            isolate: text(sample.isolate),
            fasta_header_name: text(sample.fasta_header_name),
            organism: text(sample.organism),
            body_product: text(sample.body_product),
            anatomical_part: text(sample.anatomical_part),
            geo_loc_country: text(sample.geo_loc_country),
            geo_loc_province: text(sample.geo_loc_province),
            collection_device: text(sample.collection_device),
            collection_method: text(sample.collection_method),
            environmental_site: text(sample.environmental_site),
            anatomical_material: text(sample.anatomical_material),
            purpose_of_sampling: text(sample.purpose_of_sampling),
            sample_collected_by: text(sample.sample_collected_by),
            sequence_submitted_by: text(sample.sequence_submitted_by),
            environmental_material: text(sample.environmental_material),
            sample_collection_date: text(sample.sample_collection_date),
            purpose_of_sampling_details: text(sample.purpose_of_sampling_details),
            sample_collection_date_null_reason: text(sample.sample_collection_date_null_reason),
            consensus_sequence_software_name: text(sequence.consensus_sequence_software_name),
            consensus_sequence_software_version: text(
                sequence.consensus_sequence_software_version,
            ),
            dehosting_method: text(sequence.dehosting_method),
            breadth_of_coverage: text(sequence.metrics.breadth_of_coverage),
            depth_of_coverage: text(sequence.metrics.depth_of_coverage),
            reference_genome_accession: text(sequence.reference_genome_accession),
            raw_sequence_data_processing_method: text(
                sequence.raw_sequence_data_processing_method,
            ),
            bioinformatics_protocol: text(sequence.bioinformatics_protocol),
            submitter_donor_id: donor_ids.join(","),
        })
    }

    fn values(&self) -> [&str; 45] {
        fn opt(value: &Option<String>) -> &str {
            value.as_deref().unwrap_or("")
        }
        [
            self.object_id.as_str(),
            self.study_id.as_str(),
            self.first_published_at.as_str(),
            opt(&self.purpose_of_sequencing),
            opt(&self.purpose_of_sequencing_details),
            opt(&self.sequencing_instrument),
            opt(&self.sequencing_protocol),
            opt(&self.gisaid_accession),
            opt(&self.host_age),
            opt(&self.host_age_null_reason),
            opt(&self.host_gender),
            opt(&self.host_age_bin),
            opt(&self.host_disease),
            opt(&self.host_age_unit),
            opt(&self.host_scientific_name),
            opt(&self.gene_name),
            opt(&self.diagnostic_pcr_ct_value),
            opt(&self.diagnostic_pcr_ct_value_null_reason),
            opt(&self.isolate),
            opt(&self.fasta_header_name),
            opt(&self.organism),
            opt(&self.body_product),
            opt(&self.anatomical_part),
            opt(&self.geo_loc_country),
            opt(&self.geo_loc_province),
            opt(&self.collection_device),
            opt(&self.collection_method),
            opt(&self.environmental_site),
            opt(&self.anatomical_material),
            opt(&self.purpose_of_sampling),
            opt(&self.sample_collected_by),
            opt(&self.sequence_submitted_by),
            opt(&self.environmental_material),
            opt(&self.sample_collection_date),
            opt(&self.purpose_of_sampling_details),
            opt(&self.sample_collection_date_null_reason),
            opt(&self.consensus_sequence_software_name),
            opt(&self.consensus_sequence_software_version),
            opt(&self.dehosting_method),
            opt(&self.breadth_of_coverage),
            opt(&self.depth_of_coverage),
            opt(&self.reference_genome_accession),
            opt(&self.raw_sequence_data_processing_method),
            opt(&self.bioinformatics_protocol),
            self.submitter_donor_id.as_str(),
        ]
    }

    /// Tab separated row terminated by `\n`.
    pub fn tsv_row(&self) -> String {
        join_row(self.values().iter().map(|value| sanitize(value)))
    }
}

pub fn tsv_header() -> String {
    join_row(TSV_COLUMNS.iter().map(|column| column.to_string()))
}

fn join_row(cells: impl Iterator<Item = String>) -> String {
    let mut line = cells.collect::<Vec<_>>().join("\t");
    line.push('\n');
    line
}

fn sanitize(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// Renders epoch milliseconds as a UTC `YYYY-MM-DD` date; anything else is empty.
fn render_epoch_millis(value: &Scalar) -> String {
    let millis = match value {
        Scalar::Number(number) => number.as_i64(),
        Scalar::Text(text) => text.trim().parse::<i64>().ok(),
        Scalar::Flag(_) => None,
    };
    match millis.and_then(DateTime::from_timestamp_millis) {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => {
            tracing::warn!(value = %value, "unparsable first_published_at");
            String::new()
        }
    }
}

fn text(value: Option<Scalar>) -> Option<String> {
    value.map(|scalar| scalar.to_string())
}

/// Leaf value in an index document. Numeric fields are sometimes mapped as
/// numbers and sometimes as keywords.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Text(value) => f.write_str(value),
            Scalar::Number(value) => write!(f, "{value}"),
            Scalar::Flag(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Deserialize)]
struct SourceDocument {
    object_id: String,
    study_id: String,
    #[serde(default)]
    analysis: SourceAnalysis,
    #[serde(default)]
    donors: Vec<SourceDonor>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SourceAnalysis {
    first_published_at: Option<Scalar>,
    experiment: SourceExperiment,
    database_identifiers: SourceDatabaseIdentifiers,
    host: SourceHost,
    pathogen_diagnostic_testing: SourceDiagnosticTesting,
    sample_collection: SourceSampleCollection,
    sequence_analysis: SourceSequenceAnalysis,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SourceExperiment {
    purpose_of_sequencing: Option<Scalar>,
    purpose_of_sequencing_details: Option<Scalar>,
    sequencing_instrument: Option<Scalar>,
    sequencing_protocol: Option<Scalar>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SourceDatabaseIdentifiers {
    gisaid_accession: Option<Scalar>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SourceHost {
    host_age: Option<Scalar>,
    host_age_null_reason: Option<Scalar>,
    host_gender: Option<Scalar>,
    host_age_bin: Option<Scalar>,
    host_disease: Option<Scalar>,
    host_age_unit: Option<Scalar>,
    host_scientific_name: Option<Scalar>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SourceDiagnosticTesting {
    gene_name: Option<Scalar>,
    diagnostic_pcr_ct_value: Option<Scalar>,
    diagnostic_pcr_ct_value_null_reason: Option<Scalar>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SourceSampleCollection {
    isolate: Option<Scalar>,
    fasta_header_name: Option<Scalar>,
    organism: Option<Scalar>,
    body_product: Option<Scalar>,
    anatomical_part: Option<Scalar>,
    geo_loc_country: Option<Scalar>,
    geo_loc_province: Option<Scalar>,
    collection_device: Option<Scalar>,
    collection_method: Option<Scalar>,
    environmental_site: Option<Scalar>,
    anatomical_material: Option<Scalar>,
    purpose_of_sampling: Option<Scalar>,
    sample_collected_by: Option<Scalar>,
    sequence_submitted_by: Option<Scalar>,
    environmental_material: Option<Scalar>,
    sample_collection_date: Option<Scalar>,
    purpose_of_sampling_details: Option<Scalar>,
    sample_collection_date_null_reason: Option<Scalar>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SourceSequenceAnalysis {
    consensus_sequence_software_name: Option<Scalar>,
    consensus_sequence_software_version: Option<Scalar>,
    dehosting_method: Option<Scalar>,
    metrics: SourceMetrics,
    reference_genome_accession: Option<Scalar>,
    raw_sequence_data_processing_method: Option<Scalar>,
    bioinformatics_protocol: Option<Scalar>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SourceMetrics {
    breadth_of_coverage: Option<Scalar>,
    depth_of_coverage: Option<Scalar>,
}

#[derive(Deserialize)]
struct SourceDonor {
    #[serde(default)]
    submitter_donor_id: Option<Scalar>,
}
