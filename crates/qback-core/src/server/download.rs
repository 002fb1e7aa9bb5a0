//! Download handler (server side).

use std::io::SeekFrom;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};

use super::{send_best_effort, ServerContext};
use crate::error::{Error, Result};
use crate::hash::hash_reader;
use crate::protocol::{
    ChunkPayload, DownloadRequest, DownloadResponse, FileMetadata, Framed, TransferResult,
    CHUNK_HEADER_SIZE,
};
use crate::storage::Backend;
use crate::transfer::{format_size, format_speed, throughput};

pub(super) async fn handle<S>(
    framed: &mut Framed<S>,
    context: &ServerContext,
    request: DownloadRequest,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = context.transport.idle_timeout;

    tracing::info!(
        "Download request tag={} name={} chunk_size={}",
        request.tag,
        request.name,
        request.chunk_size
    );

    let chunk_size = match usize::try_from(request.chunk_size) {
        Ok(size)
            if size > 0
                && size.saturating_add(CHUNK_HEADER_SIZE) <= framed.max_payload() =>
        {
            size
        }
        _ => return refuse(framed, context, "invalid chunksize").await,
    };

    let store = match &context.backend {
        Backend::Directory(store) => store,
        Backend::Memory(_) => {
            return refuse(framed, context, "download not supported in Memory Mode").await;
        }
    };

    let (mut file, size) = match store.open_object(&request.tag, &request.name).await {
        Ok(opened) => opened,
        Err(Error::NotFound(_)) => return refuse(framed, context, "file does not exist").await,
        Err(Error::InvalidInput(message)) => return refuse(framed, context, &message).await,
        Err(e) => {
            tracing::warn!("Cannot open {}/{}: {}", request.tag, request.name, e);
            return refuse(framed, context, "file read error").await;
        }
    };

    let hash = match hash_object(&mut file).await {
        Ok(hash) => hash,
        Err(e) => {
            tracing::warn!("Cannot hash {}/{}: {}", request.tag, request.name, e);
            return refuse(framed, context, "file read error").await;
        }
    };

    let meta = FileMetadata::new(request.tag, request.name, size, chunk_size as u64, hash);
    framed
        .send_timeout(
            &DownloadResponse::Metadata(meta.clone()),
            deadline,
            "download metadata",
        )
        .await?;

    let started = Instant::now();
    for sequence in 1..=meta.chunk_count {
        let Some((_, len)) = meta.chunk_bounds(sequence) else {
            break;
        };

        #[allow(clippy::cast_possible_truncation)]
        let mut data = vec![0u8; len as usize];
        if let Err(e) = file.read_exact(&mut data).await {
            tracing::warn!("Read of {} failed at chunk {}: {}", meta.name, sequence, e);
            send_best_effort(
                framed,
                &DownloadResponse::Result(TransferResult::failure("file read error")),
                deadline,
            )
            .await;
            return Err(e.into());
        }

        framed
            .send_timeout(
                &DownloadResponse::Chunk(ChunkPayload { sequence, data }),
                deadline,
                &format!("chunk {sequence}/{} send", meta.chunk_count),
            )
            .await?;
        tracing::debug!("{}: sent chunk {}/{}", meta.name, sequence, meta.chunk_count);
    }

    let elapsed = started.elapsed();
    tracing::info!(
        "Sent {}/{} ({}) in {:.2}s, {}",
        meta.tag,
        meta.name,
        format_size(meta.size),
        elapsed.as_secs_f64(),
        format_speed(throughput(meta.size, elapsed))
    );

    framed
        .send_timeout(
            &DownloadResponse::Result(TransferResult::success("download complete")),
            deadline,
            "download result",
        )
        .await
}

/// Hash the whole object, leaving the file positioned at its start.
async fn hash_object(file: &mut tokio::fs::File) -> Result<String> {
    let (hash, _) = hash_reader(file).await?;
    file.seek(SeekFrom::Start(0)).await?;
    Ok(hash)
}

/// Report a refused download. No metadata has been sent.
async fn refuse<S>(framed: &mut Framed<S>, context: &ServerContext, message: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::info!("Download refused: {}", message);
    framed
        .send_timeout(
            &DownloadResponse::Result(TransferResult::failure(message)),
            context.transport.idle_timeout,
            "download result",
        )
        .await
}
