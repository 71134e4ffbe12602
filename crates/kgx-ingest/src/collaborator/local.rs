//! File based collaborators
//!
//! A minimal set that lets the binary run end to end without any network
//! access:
//!
//! - [`LocalFileLoader`] picks up `nodes.jsonl` / `edges.jsonl` drops from an
//!   inbox directory, versioned by a `VERSION` file
//! - [`PassthroughNormalizer`] checks required KGX fields and copies records
//! - [`NullSupplementer`] writes empty supplemental files

use async_trait::async_trait;
use kgx_common::checksum::sha256_file;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

use super::{
    CollaboratorError, CollaboratorResult, LoadResultMetadata, NormalizationRequest,
    NormalizationStats, Normalizer, SourceLoader, SupplementationRequest, SupplementationStats,
    Supplementer,
};

/// Records kept per file in test mode
pub const DEFAULT_SAMPLE_SIZE: usize = 100;

const VERSION_FILE: &str = "VERSION";
const NODES_FILE: &str = "nodes.jsonl";
const EDGES_FILE: &str = "edges.jsonl";

const NODE_FIELDS: &[&str] = &["id"];
const EDGE_FIELDS: &[&str] = &["subject", "object"];

fn read_error(path: &Path, e: std::io::Error) -> CollaboratorError {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            CollaboratorError::unrecoverable("Missing input file").with_detail(path.display().to_string())
        }
        std::io::ErrorKind::InvalidData => {
            CollaboratorError::unrecoverable(format!("Malformed input in {}", path.display()))
                .with_detail(e.to_string())
        }
        _ => CollaboratorError::recoverable(format!("Failed to read {}", path.display()))
            .with_detail(e.to_string()),
    }
}

fn write_error(path: &Path, e: std::io::Error) -> CollaboratorError {
    CollaboratorError::defect(format!("Failed to write {}", path.display())).with_detail(e.to_string())
}

async fn create(path: &Path) -> CollaboratorResult<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| write_error(parent, e))?;
    }
    let file = File::create(path).await.map_err(|e| write_error(path, e))?;
    Ok(BufWriter::new(file))
}

async fn finish(mut writer: BufWriter<File>, path: &Path) -> CollaboratorResult<()> {
    writer.flush().await.map_err(|e| write_error(path, e))?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(|e| write_error(path, e))
}

async fn write_line(writer: &mut BufWriter<File>, path: &Path, line: &str) -> CollaboratorResult<()> {
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| write_error(path, e))?;
    writer.write_all(b"\n").await.map_err(|e| write_error(path, e))
}

async fn checksum(path: PathBuf) -> CollaboratorResult<String> {
    let display = path.display().to_string();
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| CollaboratorError::defect("Checksum task panicked").with_detail(e.to_string()))?
        .map_err(|e| CollaboratorError::defect(format!("Failed to checksum {display}")).with_detail(e.to_string()))
}

// ============================================================================
// Loader
// ============================================================================

/// Loads a source from `<inbox>/<source_id>/`
#[derive(Debug, Clone)]
pub struct LocalFileLoader {
    source_id: String,
    source_dir: PathBuf,
    test_mode: bool,
    sample_size: usize,
    has_sequence_variants: bool,
}

impl LocalFileLoader {
    pub fn new(inbox: &Path, source_id: impl Into<String>) -> Self {
        let source_id = source_id.into();
        Self {
            source_dir: inbox.join(&source_id),
            source_id,
            test_mode: false,
            sample_size: DEFAULT_SAMPLE_SIZE,
            has_sequence_variants: false,
        }
    }

    /// Only copy the first `sample_size` records of each file
    pub fn test_mode(mut self, enabled: bool) -> Self {
        self.test_mode = enabled;
        self
    }

    pub fn sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn with_sequence_variants(mut self, enabled: bool) -> Self {
        self.has_sequence_variants = enabled;
        self
    }

    fn limit(&self) -> Option<usize> {
        self.test_mode.then_some(self.sample_size)
    }

    /// Copy non-empty lines from `input` to `output`, returning how many were copied
    async fn copy_records(&self, input: &Path, output: &Path) -> CollaboratorResult<u64> {
        let source = File::open(input).await.map_err(|e| read_error(input, e))?;
        let mut lines = BufReader::new(source).lines();
        let mut writer = create(output).await?;
        let limit = self.limit();
        let mut count: u64 = 0;

        while let Some(line) = lines.next_line().await.map_err(|e| read_error(input, e))? {
            if limit.is_some_and(|max| count >= max as u64) {
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            write_line(&mut writer, output, line).await?;
            count += 1;
        }

        finish(writer, output).await?;
        Ok(count)
    }
}

#[async_trait]
impl SourceLoader for LocalFileLoader {
    async fn get_latest_source_version(&self) -> CollaboratorResult<String> {
        let path = self.source_dir.join(VERSION_FILE);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            CollaboratorError::recoverable(format!("No version available for {}", self.source_id))
                .with_detail(format!("{}: {}", path.display(), e))
        })?;

        let version = content.trim();
        if version.is_empty() {
            return Err(CollaboratorError::unrecoverable(format!(
                "Empty version file for {}",
                self.source_id
            ))
            .with_detail(path.display().to_string()));
        }
        Ok(version.to_string())
    }

    async fn load(
        &self,
        nodes_output: &Path,
        edges_output: &Path,
    ) -> CollaboratorResult<LoadResultMetadata> {
        info!(
            source_id = %self.source_id,
            test_mode = self.test_mode,
            "Loading from inbox"
        );

        let node_count = self
            .copy_records(&self.source_dir.join(NODES_FILE), nodes_output)
            .await?;
        let edge_count = self
            .copy_records(&self.source_dir.join(EDGES_FILE), edges_output)
            .await?;

        let mut result = LoadResultMetadata {
            node_count,
            edge_count,
            ..Default::default()
        };
        result.details.insert(
            "nodes_sha256".to_string(),
            Value::String(checksum(nodes_output.to_path_buf()).await?),
        );
        result.details.insert(
            "edges_sha256".to_string(),
            Value::String(checksum(edges_output.to_path_buf()).await?),
        );
        result
            .details
            .insert("test_mode".to_string(), Value::Bool(self.test_mode));

        debug!(source_id = %self.source_id, node_count, edge_count, "Load complete");
        Ok(result)
    }

    fn has_sequence_variants(&self) -> bool {
        self.has_sequence_variants
    }
}

// ============================================================================
// Normalizer
// ============================================================================

/// Copies records that carry their required identifier fields
///
/// Lines that are not JSON objects always go to the failure log. Records
/// missing required fields go to the failure log in strict mode and are kept
/// otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughNormalizer;

impl PassthroughNormalizer {
    pub fn new() -> Self {
        Self
    }

    async fn filter_records(
        input: &Path,
        output: &Path,
        failure_log: &Path,
        required: &[&str],
        strict: bool,
    ) -> CollaboratorResult<(u64, u64)> {
        let source = File::open(input).await.map_err(|e| read_error(input, e))?;
        let mut lines = BufReader::new(source).lines();
        let mut writer = create(output).await?;
        let mut failures = create(failure_log).await?;
        let (mut passed, mut failed) = (0u64, 0u64);

        while let Some(line) = lines.next_line().await.map_err(|e| read_error(input, e))? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let keep = match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(record)) => {
                    let complete = required
                        .iter()
                        .all(|field| record.get(*field).is_some_and(Value::is_string));
                    complete || !strict
                }
                _ => false,
            };

            if keep {
                write_line(&mut writer, output, line).await?;
                passed += 1;
            } else {
                write_line(&mut failures, failure_log, line).await?;
                failed += 1;
            }
        }

        finish(writer, output).await?;
        finish(failures, failure_log).await?;
        Ok((passed, failed))
    }
}

#[async_trait]
impl Normalizer for PassthroughNormalizer {
    async fn normalize(
        &self,
        request: &NormalizationRequest,
    ) -> CollaboratorResult<NormalizationStats> {
        let (nodes_normalized, nodes_failed) = Self::filter_records(
            &request.source_nodes,
            &request.nodes_output,
            &request.node_failure_log,
            NODE_FIELDS,
            request.strict_normalization,
        )
        .await?;

        let (edges_normalized, edges_failed) = Self::filter_records(
            &request.source_edges,
            &request.edges_output,
            &request.edge_failure_log,
            EDGE_FIELDS,
            request.strict_normalization,
        )
        .await?;

        let mut stats = NormalizationStats {
            nodes_normalized,
            nodes_failed,
            edges_normalized,
            edges_failed,
            ..Default::default()
        };
        stats.details.insert(
            "strict".to_string(),
            Value::Bool(request.strict_normalization),
        );
        Ok(stats)
    }
}

// ============================================================================
// Supplementer
// ============================================================================

/// Produces no supplemental records
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSupplementer;

impl NullSupplementer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Supplementer for NullSupplementer {
    async fn supplement(
        &self,
        request: &SupplementationRequest,
    ) -> CollaboratorResult<SupplementationStats> {
        for path in [
            &request.nodes_output,
            &request.edges_output,
            &request.normalized_nodes_output,
            &request.normalized_edges_output,
        ] {
            let writer = create(path).await?;
            finish(writer, path).await?;
        }
        Ok(SupplementationStats::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::collaborator::ErrorKind;
    use tempfile::TempDir;

    fn inbox_with(source_id: &str, version: Option<&str>, nodes: &str, edges: &str) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let source_dir = dir.path().join(source_id);
        std::fs::create_dir_all(&source_dir).unwrap();
        if let Some(version) = version {
            std::fs::write(source_dir.join("VERSION"), version).unwrap();
        }
        std::fs::write(source_dir.join("nodes.jsonl"), nodes).unwrap();
        std::fs::write(source_dir.join("edges.jsonl"), edges).unwrap();
        dir
    }

    fn request(dir: &Path, strict: bool) -> NormalizationRequest {
        NormalizationRequest {
            source_id: "CTD".to_string(),
            version: "v1".to_string(),
            source_nodes: dir.join("nodes.jsonl"),
            source_edges: dir.join("edges.jsonl"),
            nodes_output: dir.join("out/norm_nodes.json"),
            edges_output: dir.join("out/norm_edges.json"),
            node_failure_log: dir.join("out/node_failures.log"),
            edge_failure_log: dir.join("out/edge_failures.log"),
            strict_normalization: strict,
            has_sequence_variants: false,
        }
    }

    #[tokio::test]
    async fn test_version_is_trimmed() {
        let inbox = inbox_with("CTD", Some("2024-01-01\n"), "", "");
        let loader = LocalFileLoader::new(inbox.path(), "CTD");
        assert_eq!(loader.get_latest_source_version().await.unwrap(), "2024-01-01");
    }

    #[tokio::test]
    async fn test_missing_version_is_recoverable() {
        let inbox = inbox_with("CTD", None, "", "");
        let loader = LocalFileLoader::new(inbox.path(), "CTD");
        let err = loader.get_latest_source_version().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Recoverable);
    }

    #[tokio::test]
    async fn test_empty_version_is_unrecoverable() {
        let inbox = inbox_with("CTD", Some("  \n"), "", "");
        let loader = LocalFileLoader::new(inbox.path(), "CTD");
        let err = loader.get_latest_source_version().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unrecoverable);
    }

    #[tokio::test]
    async fn test_load_copies_and_checksums() {
        let inbox = inbox_with(
            "CTD",
            Some("v1"),
            "{\"id\":\"A\"}\n\n{\"id\":\"B\"}\n",
            "{\"subject\":\"A\",\"object\":\"B\"}\n",
        );
        let out = tempfile::tempdir().unwrap();
        let nodes = out.path().join("nodes.json");
        let edges = out.path().join("edges.json");

        let result = LocalFileLoader::new(inbox.path(), "CTD")
            .load(&nodes, &edges)
            .await
            .unwrap();

        assert_eq!(result.node_count, 2);
        assert_eq!(result.edge_count, 1);
        assert_eq!(
            result.details["nodes_sha256"],
            Value::String(sha256_file(&nodes).unwrap())
        );
        assert_eq!(
            std::fs::read_to_string(&nodes).unwrap(),
            "{\"id\":\"A\"}\n{\"id\":\"B\"}\n"
        );
    }

    #[tokio::test]
    async fn test_load_in_test_mode_samples() {
        let nodes: String = (0..10).map(|i| format!("{{\"id\":\"N{i}\"}}\n")).collect();
        let inbox = inbox_with("CTD", Some("v1"), &nodes, "");
        let out = tempfile::tempdir().unwrap();

        let result = LocalFileLoader::new(inbox.path(), "CTD")
            .test_mode(true)
            .sample_size(3)
            .load(&out.path().join("n.json"), &out.path().join("e.json"))
            .await
            .unwrap();

        assert_eq!(result.node_count, 3);
        assert_eq!(result.edge_count, 0);
        assert_eq!(result.details["test_mode"], Value::Bool(true));
    }

    #[tokio::test]
    async fn test_load_invalid_utf8_is_unrecoverable() {
        let inbox = inbox_with("CTD", Some("v1"), "", "");
        std::fs::write(
            inbox.path().join("CTD").join("nodes.jsonl"),
            b"{\"id\":\"A\"}\n\xff\xfe\n",
        )
        .unwrap();
        let out = tempfile::tempdir().unwrap();

        let err = LocalFileLoader::new(inbox.path(), "CTD")
            .load(&out.path().join("n.json"), &out.path().join("e.json"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unrecoverable);
        assert!(err.message.starts_with("Malformed input"));
    }

    #[tokio::test]
    async fn test_load_missing_data_is_unrecoverable() {
        let inbox = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(inbox.path().join("CTD")).unwrap();
        let out = tempfile::tempdir().unwrap();

        let err = LocalFileLoader::new(inbox.path(), "CTD")
            .load(&out.path().join("n.json"), &out.path().join("e.json"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unrecoverable);
    }

    #[tokio::test]
    async fn test_normalizer_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("nodes.jsonl"),
            "{\"id\":\"A\"}\n{\"name\":\"no id\"}\nnot json\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("edges.jsonl"),
            "{\"subject\":\"A\",\"object\":\"B\"}\n{\"subject\":\"A\"}\n",
        )
        .unwrap();

        let req = request(dir.path(), true);
        let stats = PassthroughNormalizer::new().normalize(&req).await.unwrap();

        assert_eq!(stats.nodes_normalized, 1);
        assert_eq!(stats.nodes_failed, 2);
        assert_eq!(stats.edges_normalized, 1);
        assert_eq!(stats.edges_failed, 1);

        let failures = std::fs::read_to_string(&req.node_failure_log).unwrap();
        assert!(failures.contains("not json"));
    }

    #[tokio::test]
    async fn test_normalizer_lenient_mode_keeps_incomplete_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("nodes.jsonl"),
            "{\"id\":\"A\"}\n{\"name\":\"no id\"}\nnot json\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("edges.jsonl"), "").unwrap();

        let stats = PassthroughNormalizer::new()
            .normalize(&request(dir.path(), false))
            .await
            .unwrap();

        assert_eq!(stats.nodes_normalized, 2);
        assert_eq!(stats.nodes_failed, 1);
    }

    #[tokio::test]
    async fn test_normalizer_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = PassthroughNormalizer::new()
            .normalize(&request(dir.path(), true))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unrecoverable);
    }

    #[tokio::test]
    async fn test_null_supplementer_writes_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let req = SupplementationRequest {
            source_id: "GWAS".to_string(),
            version: "v1".to_string(),
            normalized_nodes: dir.path().join("norm_nodes.json"),
            nodes_output: dir.path().join("supp_nodes.json"),
            edges_output: dir.path().join("supp_edges.json"),
            normalized_nodes_output: dir.path().join("norm_supp_nodes.json"),
            normalized_edges_output: dir.path().join("norm_supp_edges.json"),
            node_failure_log: dir.path().join("f1.log"),
            edge_failure_log: dir.path().join("f2.log"),
            strict_normalization: true,
        };

        let stats = NullSupplementer::new().supplement(&req).await.unwrap();
        assert!(stats.is_empty());
        assert_eq!(std::fs::read(&req.nodes_output).unwrap().len(), 0);
        assert!(req.normalized_edges_output.exists());
    }
}
