//! Ingestion pipeline: read once, hash, sniff, precheck quota.

use crate::error::{VaultError, VaultResult};
use crate::quota::QuotaLedger;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use vault_core::{ContentDigest, OwnerId, media};

const READ_CHUNK: usize = 64 * 1024;

/// Content read from an upload stream and validated.
#[derive(Debug, Clone)]
pub struct IngestedContent {
    pub digest: ContentDigest,
    pub size: u64,
    /// Media type sniffed from the leading bytes.
    pub detected_media_type: &'static str,
    pub bytes: Bytes,
}

/// Read `reader` to the end, hashing while buffering.
///
/// Fails with `PayloadTooLarge` as soon as more than `max_bytes` arrive;
/// the rest of the stream is never read.
pub async fn read_payload<R>(reader: R, max_bytes: u64) -> VaultResult<(ContentDigest, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut limited = reader.take(max_bytes.saturating_add(1));
    let mut hasher = ContentDigest::hasher();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buf.reserve(READ_CHUNK);
        let start = buf.len();
        let n = limited.read_buf(&mut buf).await.map_err(VaultError::Read)?;
        if n == 0 {
            break;
        }
        if buf.len() as u64 > max_bytes {
            return Err(VaultError::PayloadTooLarge { limit: max_bytes });
        }
        hasher.update(&buf[start..]);
    }

    Ok((hasher.finalize(), buf.freeze()))
}

/// Validates uploads before the dedup resolver sees them.
#[derive(Clone)]
pub struct IngestPipeline {
    quota: QuotaLedger,
    max_upload_bytes: u64,
}

impl IngestPipeline {
    pub fn new(quota: QuotaLedger, max_upload_bytes: u64) -> Self {
        Self {
            quota,
            max_upload_bytes,
        }
    }

    /// Consume `reader` and validate its content for `owner`.
    ///
    /// Nothing is written anywhere; every failure here leaves no trace.
    pub async fn ingest<R>(
        &self,
        owner: OwnerId,
        reader: R,
        declared_media_type: &str,
    ) -> VaultResult<IngestedContent>
    where
        R: AsyncRead + Unpin,
    {
        let (digest, bytes) = read_payload(reader, self.max_upload_bytes).await?;
        let size = bytes.len() as u64;

        let detected = media::sniff(&bytes);
        if !media::matches_declared(declared_media_type, detected) {
            return Err(VaultError::ContentTypeMismatch {
                declared: media::base_type(declared_media_type),
                detected: media::base_type(detected),
            });
        }

        self.quota.precheck(owner, size).await?;

        tracing::trace!(
            owner_id = %owner,
            digest = ?digest,
            size,
            media_type = detected,
            "Ingested upload"
        );

        Ok(IngestedContent {
            digest,
            size,
            detected_media_type: detected,
            bytes,
        })
    }
}
