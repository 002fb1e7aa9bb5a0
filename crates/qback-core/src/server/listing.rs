//! Listing handler.

use tokio::io::{AsyncRead, AsyncWrite};

use super::ServerContext;
use crate::error::{Error, Result};
use crate::protocol::{Framed, ListFilesRequest, ListFilesResponse};
use crate::storage::Backend;

pub(super) async fn handle<S>(
    framed: &mut Framed<S>,
    context: &ServerContext,
    request: ListFilesRequest,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::info!("List request tag={}", request.tag);

    let response = match &context.backend {
        Backend::Memory(_) => ListFilesResponse::failure("ListFiles not supported in Memory Mode"),
        Backend::Directory(store) => match store.list(&request.tag).await {
            Ok(files) => {
                tracing::debug!("Listed {} objects under {}", files.len(), request.tag);
                ListFilesResponse {
                    status: true,
                    message: "File list retrieved successfully".to_string(),
                    files,
                }
            }
            Err(Error::NotFound(_)) => {
                ListFilesResponse::failure("Get file list error: folder not exists")
            }
            Err(e) => {
                tracing::warn!("Listing {} failed: {}", request.tag, e);
                ListFilesResponse::failure(format!("Get file list error: {e}"))
            }
        },
    };

    framed
        .send_timeout(&response, context.transport.idle_timeout, "list response")
        .await
}
