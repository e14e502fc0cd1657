//! Decoders for upstream payloads: GTFS Realtime protobuf, GTFS static CSV
//! files and the zip archive they are shipped in.

use bytes::Bytes;
use prost::Message;
use std::borrow::Cow;
use std::io::{Cursor, Read};
use std::sync::Arc;

use crate::error::ParseError;
use crate::feed::Feed;
use crate::gtfs_rt::FeedMessage;
use crate::model::{Dataset, Record, Schema};

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage, ParseError> {
    Ok(FeedMessage::decode(bytes)?)
}

/// Decodes a realtime payload into the [`Feed`] published in snapshots.
pub fn parse_realtime(bytes: &[u8]) -> Result<Feed, ParseError> {
    let message = parse_feed(bytes)?;
    Ok(Feed::from_message(&message))
}

/// Parses one GTFS static file (CSV with a header row).
///
/// When `expected` is given the header must match it exactly and the
/// returned dataset shares that schema instance, so a dataset's identity is
/// stable across refreshes.
pub fn parse_static(
    file_name: &str,
    bytes: &[u8],
    expected: Option<&Arc<Schema>>,
) -> Result<Dataset, ParseError> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(text.as_bytes());

    let csv_err = |source| ParseError::Csv {
        file: file_name.to_string(),
        source,
    };

    let header: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if header.is_empty() || header.iter().all(String::is_empty) {
        return Err(ParseError::Empty(file_name.to_string()));
    }

    let schema = match expected {
        Some(schema) if schema.fields() == header.as_slice() => schema.clone(),
        Some(schema) => {
            return Err(ParseError::Schema {
                file: file_name.to_string(),
                expected: schema.fields().join(","),
                found: header.join(","),
            });
        }
        None => Arc::new(Schema::new(file_name, header)),
    };

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_err)?;
        records.push(Record::new(
            schema.clone(),
            row.iter().map(str::to_string).collect(),
        ));
    }

    Ok(Dataset::new(schema, records))
}

/// UTF-8 with an optional BOM; anything else is read as Latin-1.
fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
    }
}

/// A dataset file extracted from the static archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub file_name: String,
    pub bytes: Bytes,
}

/// Extracts every `.txt`/`.csv` member of a GTFS zip archive. Directory
/// prefixes inside the archive are dropped.
pub fn unpack_archive(bytes: &[u8]) -> Result<Vec<ArchiveEntry>, ParseError> {
    let archive_err = |e: zip::result::ZipError| ParseError::Archive(e.to_string());
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(archive_err)?;

    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(archive_err)?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().rsplit('/').next().unwrap_or_default().to_string();
        if !(name.ends_with(".txt") || name.ends_with(".csv")) {
            continue;
        }

        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)
            .map_err(|e| ParseError::Archive(format!("{name}: {e}")))?;
        entries.push(ArchiveEntry {
            file_name: name,
            bytes: Bytes::from(buf),
        });
    }

    if entries.is_empty() {
        return Err(ParseError::Archive("archive holds no dataset files".into()));
    }

    Ok(entries)
}
