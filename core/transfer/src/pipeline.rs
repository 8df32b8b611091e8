//! The transfer pipeline.

use futures::TryStreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transform::StreamTransform;
use vaultferry_common::{Error, Result, StorageLocation};
use vaultferry_storage::{ByteReader, DestinationProvider, SourceProvider, Wiring};

/// Outcome of one completed transfer.
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// Source object, or `None` for a caller-supplied stream.
    pub from: Option<StorageLocation>,
    pub to: StorageLocation,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.from {
            Some(from) => write!(f, "{} -> {}", from, self.to)?,
            None => write!(f, "upload -> {}", self.to)?,
        }
        write!(f, " ({} bytes in {} ms)", self.bytes_written, self.elapsed.as_millis())
    }
}

/// A batch stopped at its first failing pair.
#[derive(Debug, Error)]
#[error("transfer {from} -> {to} failed after {} completed: {error}", .completed.len())]
pub struct BatchFailure {
    /// Transfers that finished before the failure, in order.
    pub completed: Vec<TransferReport>,
    pub from: StorageLocation,
    pub to: StorageLocation,
    #[source]
    pub error: Error,
}

/// Moves objects from a source to a destination through an optional
/// transform.
///
/// Transfers are strictly sequential: read, transform and write of one
/// object finish before the next one starts. Nothing is rolled back when
/// a transfer fails.
pub struct TransferPipeline {
    source: Arc<dyn SourceProvider>,
    destination: Arc<dyn DestinationProvider>,
    transform: Option<Arc<dyn StreamTransform>>,
    shared_backend: bool,
}

impl TransferPipeline {
    pub fn new(source: Arc<dyn SourceProvider>, destination: Arc<dyn DestinationProvider>) -> Self {
        Self {
            source,
            destination,
            transform: None,
            shared_backend: false,
        }
    }

    /// Pipeline over adapters produced by [`Wiring::from_config`].
    pub fn from_wiring(wiring: Wiring) -> Self {
        let shared_backend = wiring.shares_backend();
        Self {
            shared_backend,
            ..Self::new(wiring.source, wiring.destination)
        }
    }

    /// Whether the wiring put one configured backend behind both roles.
    ///
    /// Only then can a source and a destination location name the same
    /// object. Pipelines built with [`new`](Self::new) never report a
    /// shared backend.
    pub fn shares_backend(&self) -> bool {
        self.shared_backend
    }

    /// Pass every stream through `transform`.
    pub fn with_transform(mut self, transform: Arc<dyn StreamTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn source(&self) -> &Arc<dyn SourceProvider> {
        &self.source
    }

    pub fn destination(&self) -> &Arc<dyn DestinationProvider> {
        &self.destination
    }

    fn transformed(&self, input: ByteReader) -> Result<ByteReader> {
        match &self.transform {
            Some(transform) => transform.apply(input),
            None => Ok(input),
        }
    }

    /// Open `from` on the source and apply the transform, without writing
    /// anywhere. The caller owns the returned stream.
    pub async fn open_transformed(&self, from: &StorageLocation) -> Result<ByteReader> {
        let input = self.source.open_read(from).await?;
        self.transformed(input)
    }

    /// Copy one object from the source to the destination.
    ///
    /// # Postconditions
    /// - On success `to` holds the (transformed) content of `from`
    /// - On failure `to` is left as it was before the call
    ///
    /// # Errors
    /// - Any source, transform or destination error, unchanged
    pub async fn transfer(&self, from: &StorageLocation, to: &StorageLocation) -> Result<TransferReport> {
        let started = Instant::now();
        let stream = self.open_transformed(from).await?;
        debug!(from = %from, to = %to, transform = self.transform_name(), "Transfer started");

        let bytes_written = self.destination.set_stream(stream, to).await?;
        let report = TransferReport {
            from: Some(from.clone()),
            to: to.clone(),
            bytes_written,
            elapsed: started.elapsed(),
        };
        info!(
            from = %from,
            to = %to,
            bytes = bytes_written,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Transfer complete"
        );
        Ok(report)
    }

    /// Transform a caller-supplied stream and write it to the destination.
    pub async fn deliver(&self, input: ByteReader, to: &StorageLocation) -> Result<TransferReport> {
        let started = Instant::now();
        let stream = self.transformed(input)?;

        let bytes_written = self.destination.set_stream(stream, to).await?;
        let report = TransferReport {
            from: None,
            to: to.clone(),
            bytes_written,
            elapsed: started.elapsed(),
        };
        info!(to = %to, bytes = bytes_written, elapsed_ms = report.elapsed.as_millis() as u64, "Upload complete");
        Ok(report)
    }

    /// Run transfers in order, stopping at the first failure.
    pub async fn transfer_all(
        &self,
        pairs: &[(StorageLocation, StorageLocation)],
    ) -> std::result::Result<Vec<TransferReport>, BatchFailure> {
        let mut completed = Vec::with_capacity(pairs.len());
        for (from, to) in pairs {
            match self.transfer(from, to).await {
                Ok(report) => completed.push(report),
                Err(error) => {
                    warn!(from = %from, to = %to, error = %error, "Transfer failed, stopping batch");
                    return Err(BatchFailure {
                        completed,
                        from: from.clone(),
                        to: to.clone(),
                        error,
                    });
                }
            }
        }
        Ok(completed)
    }

    /// Pair every source object matching `prefix` with a destination
    /// location in `target_container`, keeping the relative path and
    /// appending `suffix`.
    pub async fn plan(
        &self,
        container: &str,
        prefix: Option<&str>,
        target_container: &str,
        suffix: &str,
    ) -> Result<Vec<(StorageLocation, StorageLocation)>> {
        let paths: Vec<String> = self.source.list(container, prefix).try_collect().await?;

        paths
            .into_iter()
            .map(|path| {
                let from = StorageLocation::new(container, path.as_str())?;
                let to = StorageLocation::new(target_container, format!("{}{}", path, suffix))?;
                Ok((from, to))
            })
            .collect()
    }

    fn transform_name(&self) -> &str {
        self.transform.as_deref().map(|t| t.name()).unwrap_or("none")
    }
}
