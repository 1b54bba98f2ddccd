//! File descriptor extraction.
//!
//! Descriptors are what the structural record stores per data file:
//! identity (name, relative path), size, SHA-256 checksum, MIME type,
//! and OS timestamps. Checksumming streams in fixed chunks so multi-GB
//! files never pin memory, and honors the work-item budget between
//! chunks so one huge file cannot stall a worker indefinitely.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use fairmeta_core::{utc_string, FileDescriptor, MetaError, MetaResult};
use sha2::{Digest, Sha256};

/// Read granularity for checksumming and sniffing.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Build a descriptor for one data file inside a dataset.
///
/// `budget` bounds the whole extraction; `None` means unbounded (used by
/// synchronous API callers).
///
/// # Errors
///
/// `MetaError::Descriptor` when the file cannot be read,
/// `MetaError::Timeout` when the budget elapses mid-checksum.
pub fn extract(
    dataset_dir: &Path,
    file_path: &Path,
    budget: Option<Duration>,
) -> MetaResult<FileDescriptor> {
    let started = Instant::now();
    let metadata = fs::metadata(file_path).map_err(|source| MetaError::Descriptor {
        path: file_path.to_path_buf(),
        source,
    })?;

    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_owned();
    let relative_path = file_path
        .strip_prefix(dataset_dir)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| file_name.clone());
    let extension = file_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_owned();

    let (checksum_sha256, first_chunk) = checksum_and_head(file_path, budget, started)?;
    let mime_type = mime_type_for(&extension, &first_chunk);

    let modified = metadata.modified().map_err(|source| MetaError::Descriptor {
        path: file_path.to_path_buf(),
        source,
    })?;
    // Not every filesystem records a birth time; fall back to mtime.
    let created = metadata.created().unwrap_or(modified);

    Ok(FileDescriptor {
        file_name,
        relative_path,
        extension,
        size_bytes: metadata.len(),
        checksum_sha256,
        mime_type,
        created_utc: utc_string(created),
        modified_utc: utc_string(modified),
        role: "raw_data".to_owned(),
        description: String::new(),
    })
}

/// Stream the file through SHA-256, also returning the first chunk for
/// content sniffing.
fn checksum_and_head(
    path: &Path,
    budget: Option<Duration>,
    started: Instant,
) -> MetaResult<(String, Vec<u8>)> {
    let mut file = fs::File::open(path).map_err(|source| MetaError::Descriptor {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; CHUNK_SIZE];
    let mut head: Vec<u8> = Vec::new();

    loop {
        if let Some(budget) = budget {
            let elapsed = started.elapsed();
            if elapsed >= budget {
                return Err(MetaError::Timeout {
                    phase: "descriptor.checksum".into(),
                    elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
        let read = file.read(&mut buffer).map_err(|source| MetaError::Descriptor {
            path: path.to_path_buf(),
            source,
        })?;
        if read == 0 {
            break;
        }
        if head.is_empty() {
            head.extend_from_slice(&buffer[..read]);
        }
        hasher.update(&buffer[..read]);
    }

    Ok((format!("{:x}", hasher.finalize()), head))
}

/// MIME type from magic bytes first, extension second.
fn mime_type_for(extension: &str, head: &[u8]) -> String {
    if head.starts_with(&[0x1f, 0x8b]) {
        return "application/gzip".to_owned();
    }
    if head.starts_with(b"PK\x03\x04") {
        return "application/zip".to_owned();
    }
    if head.starts_with(&[0x89, b'P', b'N', b'G']) {
        return "image/png".to_owned();
    }
    if head.starts_with(b"%PDF") {
        return "application/pdf".to_owned();
    }

    match extension.to_ascii_lowercase().as_str() {
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" | "md" | "fasta" | "fastq" | "sam" | "vcf" | "bed" | "gff" => "text/plain",
        "tif" | "tiff" => "image/tiff",
        "jpg" | "jpeg" => "image/jpeg",
        "h5" | "hdf5" => "application/x-hdf5",
        "parquet" => "application/vnd.apache.parquet",
        _ => "application/octet-stream",
    }
    .to_owned()
}

/// Whether an existing descriptor can be reused without re-hashing.
///
/// Size plus mtime string equality is the cheap negative check: if both
/// match, the bytes are assumed unchanged.
#[must_use]
pub fn reusable(existing: &FileDescriptor, size_bytes: u64, modified_utc: &str) -> bool {
    existing.size_bytes == size_bytes && existing.modified_utc == modified_utc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn extract_produces_complete_descriptor() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dataset = tmp.path().join("d_a");
        fs::create_dir_all(dataset.join("sub")).expect("dirs");
        let file = dataset.join("sub").join("table.csv");
        fs::write(&file, b"a,b\n1,2\n").expect("write");

        let fd = extract(&dataset, &file, None).expect("extract");
        assert_eq!(fd.file_name, "table.csv");
        assert_eq!(fd.relative_path, "sub/table.csv");
        assert_eq!(fd.extension, "csv");
        assert_eq!(fd.size_bytes, 8);
        assert_eq!(fd.mime_type, "text/csv");
        assert_eq!(fd.role, "raw_data");
        assert_eq!(fd.checksum_sha256.len(), 64);
        assert!(fd.modified_utc.ends_with('Z'));
    }

    #[test]
    fn checksum_matches_known_vector() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("abc.txt");
        fs::write(&file, b"abc").expect("write");
        let fd = extract(tmp.path(), &file, None).expect("extract");
        assert_eq!(
            fd.checksum_sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn large_file_streams_across_chunks() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("big.bin");
        let mut handle = fs::File::create(&file).expect("create");
        let chunk = vec![0xAB_u8; CHUNK_SIZE];
        for _ in 0..3 {
            handle.write_all(&chunk).expect("write chunk");
        }
        handle.write_all(&[0xCD]).expect("tail");
        drop(handle);

        let fd = extract(tmp.path(), &file, None).expect("extract");
        assert_eq!(fd.size_bytes, (CHUNK_SIZE * 3 + 1) as u64);

        // Whole-file hash equals the streamed hash.
        let mut hasher = Sha256::new();
        hasher.update(&fs::read(&file).expect("read back"));
        assert_eq!(fd.checksum_sha256, format!("{:x}", hasher.finalize()));
    }

    #[test]
    fn gzip_magic_wins_over_extension() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("reads.fastq.gz");
        fs::write(&file, [0x1f_u8, 0x8b, 0x08, 0x00]).expect("write");
        let fd = extract(tmp.path(), &file, None).expect("extract");
        assert_eq!(fd.mime_type, "application/gzip");
        assert_eq!(fd.extension, "gz");
    }

    #[test]
    fn unknown_content_falls_back_to_octet_stream() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("blob.xyz");
        fs::write(&file, b"\x00\x01\x02").expect("write");
        let fd = extract(tmp.path(), &file, None).expect("extract");
        assert_eq!(fd.mime_type, "application/octet-stream");
    }

    #[test]
    fn exhausted_budget_times_out() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("f.bin");
        fs::write(&file, b"data").expect("write");
        let err = extract(tmp.path(), &file, Some(Duration::ZERO)).expect_err("no budget");
        assert!(matches!(err, MetaError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_file_reports_descriptor_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = extract(tmp.path(), &tmp.path().join("gone.csv"), None).expect_err("missing");
        assert!(matches!(err, MetaError::Descriptor { .. }));
    }

    #[test]
    fn reuse_check_compares_size_and_mtime() {
        let existing = FileDescriptor {
            file_name: "a.csv".into(),
            relative_path: "a.csv".into(),
            extension: "csv".into(),
            size_bytes: 10,
            checksum_sha256: "x".into(),
            mime_type: "text/csv".into(),
            created_utc: "2025-01-01T00:00:00.000000Z".into(),
            modified_utc: "2025-01-02T00:00:00.000000Z".into(),
            role: "raw_data".into(),
            description: String::new(),
        };
        assert!(reusable(&existing, 10, "2025-01-02T00:00:00.000000Z"));
        assert!(!reusable(&existing, 11, "2025-01-02T00:00:00.000000Z"));
        assert!(!reusable(&existing, 10, "2025-01-03T00:00:00.000000Z"));
    }
}
