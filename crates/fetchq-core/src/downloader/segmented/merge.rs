//! Sequential merge of part files, verification and atomic commit.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::checksum;
use crate::control::CancelToken;
use crate::error::FetchError;
use crate::resume::ResumeDescriptor;
use crate::storage::{self, StorageWriter, StorageWriterBuilder};

const COPY_BUF: usize = 256 * 1024;

/// Concatenates the parts of `desc` into `<dest>.merge`, checks size and hash,
/// then renames onto `dest`. Returns the SHA-256 of the committed file.
///
/// On any failure the merge temp is removed and the parts stay on disk.
pub(super) fn merge_parts(
    dest: &Path,
    desc: &ResumeDescriptor,
    expected_sha256: Option<&str>,
    token: &CancelToken,
) -> Result<String, FetchError> {
    for rec in &desc.segments {
        let on_disk = storage::file_len(&rec.part_path)?;
        let len = rec.end - rec.start + 1;
        if on_disk != len {
            return Err(FetchError::Integrity(format!(
                "segment {} part file has {} bytes, expected {}",
                rec.id, on_disk, len
            )));
        }
    }

    let merge_path = storage::merge_path(dest);
    let mut builder = StorageWriterBuilder::create(&merge_path)?;
    builder.preallocate(desc.total_size)?;
    let writer = builder.build();

    match copy_and_verify(&writer, desc, expected_sha256, token) {
        Ok(digest) => match writer.finalize(dest) {
            Ok(()) => Ok(digest),
            Err(e) => {
                let _ = storage::remove_if_exists(&merge_path);
                Err(e.into())
            }
        },
        Err(e) => {
            writer.discard();
            Err(e)
        }
    }
}

fn copy_and_verify(
    writer: &StorageWriter,
    desc: &ResumeDescriptor,
    expected_sha256: Option<&str>,
    token: &CancelToken,
) -> Result<String, FetchError> {
    let mut buf = vec![0u8; COPY_BUF];
    // Counted from the bytes actually copied: the preallocated temp file
    // always has the full length.
    let mut merged = 0u64;
    for rec in &desc.segments {
        token.check()?;
        let mut part = File::open(&rec.part_path)?;
        let mut offset = rec.start;
        loop {
            let n = part.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_at(offset, &buf[..n])?;
            offset += n as u64;
        }
        let copied = offset - rec.start;
        let len = rec.end - rec.start + 1;
        if copied != len {
            return Err(FetchError::Integrity(format!(
                "segment {} copied {} bytes, expected {}",
                rec.id, copied, len
            )));
        }
        merged += copied;
    }
    writer.sync()?;

    if merged != desc.total_size {
        return Err(FetchError::Integrity(format!(
            "merged file has {} bytes, expected {}",
            merged, desc.total_size
        )));
    }

    let digest = checksum::sha256_path(writer.temp_path())?;
    if let Some(expected) = expected_sha256 {
        if !checksum::digest_matches(&digest, expected) {
            return Err(FetchError::Integrity(format!(
                "sha256 mismatch: expected {}, got {}",
                expected.trim().to_ascii_lowercase(),
                digest
            )));
        }
    }
    // Cancel wins even after a complete merge.
    token.check()?;
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ServerCapability;
    use crate::segmenter::plan_segments;

    fn setup(body: &[u8], parts: usize) -> (tempfile::TempDir, std::path::PathBuf, ResumeDescriptor) {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let total = body.len() as u64;
        let plan = plan_segments(total, parts, 1);
        let desc = ResumeDescriptor::new("http://h/x", total, &ServerCapability::default(), &plan, &dest);
        for rec in &desc.segments {
            std::fs::write(&rec.part_path, &body[rec.start as usize..=rec.end as usize]).unwrap();
        }
        (dir, dest, desc)
    }

    #[test]
    fn merges_in_order_and_hashes() {
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (_dir, dest, desc) = setup(&body, 4);
        let expected = checksum::sha256_bytes(&body);
        let digest = merge_parts(&dest, &desc, Some(&expected.to_uppercase()), &CancelToken::new()).unwrap();
        assert_eq!(digest, expected);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!storage::merge_path(&dest).exists());
    }

    #[test]
    fn hash_mismatch_leaves_no_artifact() {
        let body = vec![7u8; 4096];
        let (_dir, dest, desc) = setup(&body, 2);
        let err = merge_parts(&dest, &desc, Some("00"), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, FetchError::Integrity(_)));
        assert!(!dest.exists());
        assert!(!storage::merge_path(&dest).exists());
        assert!(desc.segments[0].part_path.exists());
    }

    #[test]
    fn short_part_is_integrity_error() {
        let body = vec![1u8; 4096];
        let (_dir, dest, desc) = setup(&body, 2);
        std::fs::write(&desc.segments[1].part_path, b"short").unwrap();
        let err = merge_parts(&dest, &desc, None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, FetchError::Integrity(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn part_shrinking_after_size_check_is_caught() {
        let body = vec![5u8; 4096];
        let (_dir, dest, desc) = setup(&body, 2);
        let merge_path = storage::merge_path(&dest);
        let mut builder = StorageWriterBuilder::create(&merge_path).unwrap();
        builder.preallocate(desc.total_size).unwrap();
        let writer = builder.build();

        let part = std::fs::OpenOptions::new()
            .write(true)
            .open(&desc.segments[1].part_path)
            .unwrap();
        part.set_len(10).unwrap();

        let err = copy_and_verify(&writer, &desc, None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, FetchError::Integrity(_)), "got {err}");
        writer.discard();
        assert!(!merge_path.exists());
        assert!(!dest.exists());
    }

    #[test]
    fn cancelled_merge_commits_nothing() {
        let body = vec![3u8; 2048];
        let (_dir, dest, desc) = setup(&body, 2);
        let token = CancelToken::new();
        token.cancel();
        let err = merge_parts(&dest, &desc, None, &token).unwrap_err();
        assert!(matches!(err, FetchError::Interrupted(_)));
        assert!(!dest.exists());
    }
}
