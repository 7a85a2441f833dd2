//! Fetches rendered artifacts and packs them into a single deliverable.

use std::collections::HashSet;
use std::io::{Cursor, Write};

use bytes::Bytes;
use slug::slugify;
use tracing::{info, warn};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::application::error::ExportError;
use crate::domain::types::{ArchiveEntry, Deliverable, RenderedArtifact};
use crate::util::names;

/// Aggregates surviving artifacts into one deliverable.
pub struct ArchiveAggregator {
    http: reqwest::Client,
}

impl ArchiveAggregator {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Fetch every artifact and pack the survivors.
    ///
    /// Individual fetch failures are logged and skipped. An empty survivor
    /// set is the one hard failure here: there is nothing to deliver.
    /// Exactly one survivor is returned raw with an extension-derived MIME
    /// type instead of as a one-entry archive.
    pub async fn collect(
        &self,
        label: &str,
        artifacts: &[RenderedArtifact],
    ) -> Result<Deliverable, ExportError> {
        let mut used_names = HashSet::new();
        let mut entries = Vec::with_capacity(artifacts.len());

        for artifact in artifacts {
            let bytes = match self.fetch(&artifact.artifact_url).await {
                Ok(bytes) => bytes,
                Err(reason) => {
                    warn!(
                        target = "application::archive::ArchiveAggregator",
                        ordinal = artifact.ordinal,
                        url = %artifact.artifact_url,
                        %reason,
                        "artifact fetch failed; entry dropped"
                    );
                    metrics::counter!("stampa_fetch_failure_total").increment(1);
                    continue;
                }
            };

            let name = names::unique_entry_name(&artifact.suggested_name, &mut used_names);
            entries.push(ArchiveEntry { name, bytes });
        }

        if entries.is_empty() {
            return Err(ExportError::NothingToDeliver);
        }

        if entries.len() == 1 {
            let entry = entries.remove(0);
            let mime_type = mime_guess::from_path(&entry.name)
                .first_or_octet_stream()
                .to_string();
            return Ok(Deliverable::Single {
                filename: entry.name,
                mime_type,
                bytes: entry.bytes,
            });
        }

        let filename = format!("{}-{}.zip", slugify(label), entries.len());
        let bytes = build_archive(&entries)?;
        metrics::histogram!("stampa_archive_bytes").record(bytes.len() as f64);
        info!(
            target = "application::archive::ArchiveAggregator",
            entries = entries.len(),
            size_bytes = bytes.len(),
            %filename,
            "archive assembled"
        );

        Ok(Deliverable::Archive { filename, bytes })
    }

    async fn fetch(&self, url: &str) -> Result<Bytes, String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| format!("fetch failed: {err}"))?
            .error_for_status()
            .map_err(|err| format!("artifact endpoint rejected fetch: {err}"))?;

        response
            .bytes()
            .await
            .map_err(|err| format!("artifact body could not be read: {err}"))
    }
}

fn build_archive(entries: &[ArchiveEntry]) -> Result<Bytes, ExportError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(6));

    for entry in entries {
        zip.start_file(&entry.name, options)?;
        zip.write_all(&entry.bytes)?;
    }

    let cursor = zip.finish()?;
    Ok(Bytes::from(cursor.into_inner()))
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use zip::ZipArchive;

    use super::*;

    fn entry(name: &str, payload: &[u8]) -> ArchiveEntry {
        ArchiveEntry {
            name: name.to_string(),
            bytes: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn built_archive_round_trips_entry_names_and_payloads() {
        let entries = vec![entry("a.png", b"first"), entry("b.png", b"second")];
        let bytes = build_archive(&entries).expect("archive builds");

        let mut archive = ZipArchive::new(Cursor::new(bytes.to_vec())).expect("archive parses");
        assert_eq!(archive.len(), 2);

        let mut payload = Vec::new();
        archive
            .by_name("b.png")
            .expect("entry present")
            .read_to_end(&mut payload)
            .expect("entry readable");
        assert_eq!(payload, b"second");
    }
}
