//! Upload handler (server side).

use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{send_best_effort, ServerContext};
use crate::error::{Error, Result};
use crate::protocol::{FileMetadata, Framed, MetaAck, TransferResult, UploadRequest, UploadResponse};
use crate::storage::{validate_key, Lookup, StoreWriter};
use crate::transfer::{format_size, format_speed, throughput};

pub(super) async fn handle<S>(
    framed: &mut Framed<S>,
    context: &ServerContext,
    meta: FileMetadata,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = context.transport.idle_timeout;

    tracing::info!(
        "Upload request tag={} name={} size={} chunks={} x {} hash={}",
        meta.tag,
        meta.name,
        meta.size,
        meta.chunk_count,
        meta.chunk_size,
        meta.hash
    );

    if let Err(message) = admit(context, &meta).await {
        tracing::info!("Upload of {}/{} rejected: {}", meta.tag, meta.name, message);
        return framed
            .send_timeout(
                &UploadResponse::MetaAck(MetaAck::reject(message)),
                deadline,
                "admission reply",
            )
            .await;
    }

    let mut writer = match context.backend.create_writer(&meta).await {
        Ok(writer) => writer,
        Err(e) => {
            tracing::warn!("Cannot open write target for {}/{}: {}", meta.tag, meta.name, e);
            return framed
                .send_timeout(
                    &UploadResponse::MetaAck(MetaAck::reject(format!("Receive error: {e}"))),
                    deadline,
                    "admission reply",
                )
                .await;
        }
    };

    if let Err(e) = framed
        .send_timeout(
            &UploadResponse::MetaAck(MetaAck::allow("Ready to receive")),
            deadline,
            "admission reply",
        )
        .await
    {
        writer.discard().await;
        return Err(e);
    }

    let started = Instant::now();
    if let Err(e) = receive(framed, context, &meta, &mut writer).await {
        writer.discard().await;
        send_best_effort(
            framed,
            &UploadResponse::Result(TransferResult::failure(format!("Receive error: {e}"))),
            deadline,
        )
        .await;
        return Err(e);
    }

    let bytes = writer.written();
    if let Err(e) = writer.finalize(&meta).await {
        send_best_effort(
            framed,
            &UploadResponse::Result(TransferResult::failure(format!("Receive error: {e}"))),
            deadline,
        )
        .await;
        return Err(e);
    }

    let elapsed = started.elapsed();
    tracing::info!(
        "Received {}/{} ({}) in {:.2}s, {}",
        meta.tag,
        meta.name,
        format_size(bytes),
        elapsed.as_secs_f64(),
        format_speed(throughput(bytes, elapsed))
    );

    framed
        .send_timeout(
            &UploadResponse::Result(TransferResult::success("Receive complete")),
            deadline,
            "upload result",
        )
        .await
}

/// Decide whether an upload may proceed, returning the refusal message if not.
async fn admit(context: &ServerContext, meta: &FileMetadata) -> std::result::Result<(), String> {
    validate_key(&meta.tag, &meta.name).map_err(|e| e.to_string())?;

    match context.backend.lookup(&meta.tag, &meta.name).await {
        Ok(Lookup::Present { hash }) if hash.eq_ignore_ascii_case(&meta.hash) => {
            Err("File already exists".to_string())
        }
        Ok(Lookup::Present { .. }) => {
            tracing::info!(
                "{}/{} exists with different content, will replace on success",
                meta.tag,
                meta.name
            );
            Ok(())
        }
        Ok(Lookup::Absent | Lookup::Unsupported) => Ok(()),
        Err(e) => {
            tracing::warn!("Lookup of {}/{} failed: {}", meta.tag, meta.name, e);
            Err(format!("Lookup error: {e}"))
        }
    }
}

/// Append chunks to `writer` until the client signals the end of the upload.
async fn receive<S>(
    framed: &mut Framed<S>,
    context: &ServerContext,
    meta: &FileMetadata,
    writer: &mut StoreWriter,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let idle = context.transport.idle_timeout;

    loop {
        match framed.recv_timeout::<UploadRequest>(idle, "upload chunk").await? {
            Some(UploadRequest::Chunk(chunk)) => {
                if chunk.data.is_empty() {
                    continue;
                }
                if writer.written() + chunk.data.len() as u64 > meta.size {
                    return Err(Error::IntegrityMismatch {
                        name: meta.name.clone(),
                        reason: format!("received more than the declared {} bytes", meta.size),
                    });
                }

                writer.append(&chunk.data).await?;
                tracing::debug!(
                    "{}: chunk {}/{} ({} bytes)",
                    meta.name,
                    chunk.sequence,
                    meta.chunk_count,
                    chunk.data.len()
                );
            }
            Some(UploadRequest::End) => return Ok(()),
            Some(UploadRequest::Metadata(_)) => {
                return Err(Error::Protocol(
                    "metadata repeated during upload".to_string(),
                ));
            }
            None => {
                return Err(Error::ConnectionLost(
                    "client closed the stream before finishing the upload".to_string(),
                ));
            }
        }
    }
}
