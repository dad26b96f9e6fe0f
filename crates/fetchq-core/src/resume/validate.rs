//! Compares stored resume state with a fresh probe and with the disk.

use std::fmt;

use crate::error::FetchError;
use crate::probe::ServerCapability;
use crate::resume::{ResumeDescriptor, SegmentRecord};

#[derive(Debug)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
}

#[derive(Debug)]
pub enum ValidationErrorKind {
    UrlChanged,
    /// Remote ETag, Last-Modified, or size changed since the state was written.
    RemoteChanged {
        etag_changed: bool,
        last_modified_changed: bool,
        size_changed: bool,
    },
    /// Segments do not tile `[0, total_size)`.
    LayoutInvalid(String),
    /// A part file holds more bytes than its segment.
    PartOverflow { segment: usize, on_disk: u64, len: u64 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValidationErrorKind::UrlChanged => write!(f, "source URL changed"),
            ValidationErrorKind::RemoteChanged {
                etag_changed,
                last_modified_changed,
                size_changed,
            } => {
                let mut what = Vec::new();
                if *etag_changed {
                    what.push("ETag");
                }
                if *last_modified_changed {
                    what.push("Last-Modified");
                }
                if *size_changed {
                    what.push("size");
                }
                write!(f, "remote resource changed ({})", what.join(", "))
            }
            ValidationErrorKind::LayoutInvalid(msg) => write!(f, "segment layout invalid: {}", msg),
            ValidationErrorKind::PartOverflow {
                segment,
                on_disk,
                len,
            } => write!(
                f,
                "segment {} part file has {} bytes but the segment is {} bytes",
                segment, on_disk, len
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for FetchError {
    fn from(e: ValidationError) -> Self {
        FetchError::ResumeStateInvalid(e.to_string())
    }
}

fn field_changed(stored: Option<&str>, current: Option<&str>) -> bool {
    match (stored, current) {
        (None, None) => false,
        (Some(a), Some(b)) => a != b,
        _ => true,
    }
}

/// Ok(()) if the stored URL, size and validators match the current probe.
///
/// A validator present on only one side counts as changed.
pub fn validate_remote(
    url: &str,
    stored_url: &str,
    stored_size: Option<u64>,
    stored_etag: Option<&str>,
    stored_last_modified: Option<&str>,
    cap: &ServerCapability,
) -> Result<(), ValidationError> {
    if url != stored_url {
        return Err(ValidationError {
            kind: ValidationErrorKind::UrlChanged,
        });
    }

    let etag_changed = field_changed(stored_etag, cap.etag.as_deref());
    let last_modified_changed = field_changed(stored_last_modified, cap.last_modified.as_deref());
    let size_changed = match (stored_size, cap.content_length) {
        (None, None) => false,
        (Some(a), Some(b)) => a != b,
        _ => true,
    };

    if etag_changed || last_modified_changed || size_changed {
        return Err(ValidationError {
            kind: ValidationErrorKind::RemoteChanged {
                etag_changed,
                last_modified_changed,
                size_changed,
            },
        });
    }
    Ok(())
}

/// Checks that the descriptor's segments are ordered, contiguous and cover the whole file.
pub fn validate_layout(desc: &ResumeDescriptor) -> Result<(), ValidationError> {
    let invalid = |msg: String| ValidationError {
        kind: ValidationErrorKind::LayoutInvalid(msg),
    };
    if desc.segments.is_empty() {
        return Err(invalid("no segments".to_string()));
    }
    let mut next = 0u64;
    for (i, seg) in desc.segments.iter().enumerate() {
        if seg.id != i {
            return Err(invalid(format!("segment {} has id {}", i, seg.id)));
        }
        if seg.start != next || seg.end < seg.start {
            return Err(invalid(format!(
                "segment {} covers {}-{}, expected start {}",
                i, seg.start, seg.end, next
            )));
        }
        next = seg.end + 1;
    }
    if next != desc.total_size {
        return Err(invalid(format!(
            "segments end at {} but total size is {}",
            next, desc.total_size
        )));
    }
    Ok(())
}

/// Resume offset for a segment given the real part-file length.
///
/// The disk is authoritative: the recorded count lags behind the last
/// checkpoint, so bytes past it are kept as long as they fit the segment.
pub fn resume_offset(seg: &SegmentRecord, on_disk: u64) -> Result<u64, ValidationError> {
    let len = seg.end - seg.start + 1;
    if on_disk > len {
        return Err(ValidationError {
            kind: ValidationErrorKind::PartOverflow {
                segment: seg.id,
                on_disk,
                len,
            },
        });
    }
    if on_disk < seg.bytes_written {
        tracing::debug!(
            segment = seg.id,
            recorded = seg.bytes_written,
            on_disk,
            "part file shorter than recorded; resuming from disk length"
        );
    }
    Ok(on_disk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::plan_segments;
    use std::path::Path;

    const URL: &str = "https://example.com/file.bin";
    const LM: &str = "Wed, 21 Oct 2015 07:28:00 GMT";

    fn cap(size: Option<u64>, etag: Option<&str>, lm: Option<&str>) -> ServerCapability {
        ServerCapability {
            supports_range: true,
            content_length: size,
            etag: etag.map(String::from),
            last_modified: lm.map(String::from),
            content_type: None,
        }
    }

    fn record(start: u64, end: u64, written: u64) -> SegmentRecord {
        SegmentRecord {
            id: 0,
            start,
            end,
            part_path: "x.part0".into(),
            bytes_written: written,
            completed: false,
        }
    }

    #[test]
    fn same_validators_ok() {
        let c = cap(Some(1000), Some("e1"), Some(LM));
        assert!(validate_remote(URL, URL, Some(1000), Some("e1"), Some(LM), &c).is_ok());
    }

    #[test]
    fn no_validators_on_either_side_ok() {
        let c = cap(Some(1000), None, None);
        assert!(validate_remote(URL, URL, Some(1000), None, None, &c).is_ok());
    }

    #[test]
    fn url_changed_err() {
        let c = cap(Some(1000), None, None);
        let e = validate_remote(URL, "https://example.com/other", Some(1000), None, None, &c)
            .unwrap_err();
        assert!(matches!(e.kind, ValidationErrorKind::UrlChanged));
    }

    #[test]
    fn etag_changed_err() {
        let c = cap(Some(1000), Some("e2"), Some(LM));
        let e = validate_remote(URL, URL, Some(1000), Some("e1"), Some(LM), &c).unwrap_err();
        assert!(matches!(
            e.kind,
            ValidationErrorKind::RemoteChanged {
                etag_changed: true,
                last_modified_changed: false,
                size_changed: false,
            }
        ));
    }

    #[test]
    fn etag_disappeared_err() {
        let c = cap(Some(1000), None, None);
        assert!(validate_remote(URL, URL, Some(1000), Some("e1"), None, &c).is_err());
    }

    #[test]
    fn size_changed_err() {
        let c = cap(Some(2000), Some("e1"), None);
        let e = validate_remote(URL, URL, Some(1000), Some("e1"), None, &c).unwrap_err();
        assert!(e.to_string().contains("size"));
        let fe: FetchError = e.into();
        assert!(matches!(fe, FetchError::ResumeStateInvalid(_)));
    }

    #[test]
    fn layout_from_plan_is_valid() {
        let c = cap(Some(10_000), None, None);
        let d = ResumeDescriptor::new(
            URL,
            10_000,
            &c,
            &plan_segments(10_000, 4, 1000),
            Path::new("/tmp/f"),
        );
        assert!(validate_layout(&d).is_ok());
    }

    #[test]
    fn layout_with_gap_is_invalid() {
        let c = cap(Some(10_000), None, None);
        let mut d = ResumeDescriptor::new(
            URL,
            10_000,
            &c,
            &plan_segments(10_000, 4, 1000),
            Path::new("/tmp/f"),
        );
        d.segments[2].start += 1;
        assert!(validate_layout(&d).is_err());
        d.segments[2].start -= 1;
        d.total_size = 20_000;
        assert!(validate_layout(&d).is_err());
    }

    #[test]
    fn offset_follows_disk_length() {
        let rec = record(100, 199, 50);
        assert_eq!(resume_offset(&rec, 30).unwrap(), 30);
        assert_eq!(resume_offset(&rec, 70).unwrap(), 70);
        assert_eq!(resume_offset(&rec, 100).unwrap(), 100);
    }

    #[test]
    fn overflowing_part_is_invalid() {
        let rec = record(100, 199, 100);
        let e = resume_offset(&rec, 101).unwrap_err();
        assert!(matches!(e.kind, ValidationErrorKind::PartOverflow { .. }));
    }
}
