//! Chunked file-data delivery from the source tree to the host.

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};
use crate::error::{ProviderError, Result};
use crate::handles::HandleCache;
use crate::traits::VirtualizationHost;
use crate::types::DataStreamId;

/// One transfer, as sent to the host's write-back primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub length: u32,
}

/// Splits `[offset, offset + length)` into chunks of at most `cap` bytes.
///
/// A chunk cut short by the cap ends on an `alignment` boundary; only the last
/// chunk may end anywhere. A cap below the alignment is raised to it.
pub fn plan_chunks(offset: u64, length: u32, alignment: u32, cap: u32) -> Result<Vec<Chunk>> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(ProviderError::invalid_parameter(format!(
            "write alignment {} is not a power of two",
            alignment
        )));
    }
    let end = offset
        .checked_add(u64::from(length))
        .ok_or_else(|| ProviderError::invalid_parameter("requested range overflows"))?;
    let cap = u64::from(cap.max(alignment));
    let mask = !(u64::from(alignment) - 1);

    let mut chunks = Vec::new();
    let mut start = offset;
    while start < end {
        let chunk_end = if end - start <= cap {
            end
        } else {
            (start + cap) & mask
        };
        // chunk_end - start never exceeds cap, which fits in u32.
        chunks.push(Chunk { offset: start, length: (chunk_end - start) as u32 });
        start = chunk_end;
    }
    Ok(chunks)
}

/// A single get-file-data request.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryRequest<'a> {
    pub source: &'a Path,
    pub stream: DataStreamId,
    pub offset: u64,
    pub length: u32,
}

/// How a delivery ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed { bytes: u64, chunks: usize },
    /// Stopped between chunks because the host cancelled the command.
    Cancelled { bytes: u64 },
}

/// Streams source-file ranges to the host in aligned chunks.
#[derive(Debug)]
pub struct FileDataDelivery {
    handles: Arc<HandleCache>,
    chunk_size: u32,
}

impl FileDataDelivery {
    pub fn new(handles: Arc<HandleCache>, chunk_size: u32) -> Self {
        Self { handles, chunk_size }
    }

    pub fn handles(&self) -> &Arc<HandleCache> {
        &self.handles
    }

    /// Delivers the requested range through `host`.
    ///
    /// Every transfer buffer is released before this returns, whichever way it
    /// returns. Fails with `NotFound` if the source is missing, with
    /// `InvalidParameter` if the range runs past its end, with
    /// `AllocationFailed` if the host allocator is exhausted, and with
    /// `TransferFailed` if the host rejects a chunk.
    pub fn deliver<H: VirtualizationHost>(
        &self,
        host: &H,
        request: &DeliveryRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<DeliveryOutcome> {
        let source = request.source;
        let handle = self.handles.open(source)?;
        let metadata_error = |e| ProviderError::SourceRead { path: source.to_path_buf(), source: e };

        if handle.is_dir().map_err(metadata_error)? {
            return Err(ProviderError::invalid_parameter(format!(
                "{} is a directory",
                source.display()
            )));
        }
        let file_len = handle.len().map_err(metadata_error)?;
        let requested_end = request.offset.saturating_add(u64::from(request.length));
        if requested_end > file_len {
            return Err(ProviderError::invalid_parameter(format!(
                "range {}..{} exceeds the {} bytes of {}",
                request.offset,
                requested_end,
                file_len,
                source.display()
            )));
        }
        if request.length == 0 {
            return Ok(DeliveryOutcome::Completed { bytes: 0, chunks: 0 });
        }

        let alignment = host
            .write_alignment()
            .map_err(|e| ProviderError::TransferFailed { offset: request.offset, source: e })?;
        let chunks = plan_chunks(request.offset, request.length, alignment, self.chunk_size)?;
        trace!(
            "Delivering {} bytes of {} in {} chunks",
            request.length,
            source.display(),
            chunks.len()
        );

        let mut bytes = 0u64;
        for chunk in &chunks {
            if cancel.is_cancelled() {
                debug!("Delivery of {} cancelled after {} bytes", source.display(), bytes);
                return Ok(DeliveryOutcome::Cancelled { bytes });
            }

            let size = chunk.length as usize;
            let mut buffer = host
                .allocate_buffer(size)
                .ok_or(ProviderError::AllocationFailed { size })?;
            handle
                .read_exact_at(&mut buffer[..size], chunk.offset)
                .map_err(|e| ProviderError::SourceRead { path: source.to_path_buf(), source: e })?;
            if let Err(e) = host.write_file_data(&request.stream, &buffer, chunk.offset) {
                error!("Host rejected {} bytes of {} at offset {}: {}", size, source.display(), chunk.offset, e);
                return Err(ProviderError::TransferFailed { offset: chunk.offset, source: e });
            }
            bytes += u64::from(chunk.length);
        }

        Ok(DeliveryOutcome::Completed { bytes, chunks: chunks.len() })
    }
}
