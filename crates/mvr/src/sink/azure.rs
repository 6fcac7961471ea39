//! Azure Blob Storage sink: block-streaming upload in its own task.

use std::io::Write;
use std::sync::Arc;

use azure_storage::prelude::*;
use azure_storage::CloudLocation;
use azure_storage_blobs::blob::{BlobBlockType, BlockList};
use azure_storage_blobs::prelude::*;
use tracing::{debug, info};
use url::Url;

use crate::error::{MvrError, Result};

/// Staged block size for streaming uploads (4 MiB).
const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Where the blob endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobLocation {
    /// Azurite / local emulator endpoint.
    Emulator { host: String, port: u16 },
    /// Real storage account.
    Account(String),
}

/// Parsed blob target: endpoint, container, blob name and SAS token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureBlobTarget {
    pub location: BlobLocation,
    pub container: String,
    pub blob_name: String,
    pub sas_token: Option<String>,
}

fn split_container_blob(url: &Url) -> Result<(String, String)> {
    let mut segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    if segments.len() < 2 {
        return Err(MvrError::Sink(format!(
            "blob url must include container and blob name: {}",
            url.path()
        )));
    }
    let container = segments.remove(0).to_string();
    Ok((container, segments.join("/")))
}

/// The SAS token travels in the query string and is stripped before the
/// client sees the URL.
fn take_sas_token(url: &Url) -> Option<String> {
    url.query().filter(|q| !q.is_empty()).map(str::to_string)
}

/// Parse a development `azurite://host:port/container/blob[?sas]` URL.
pub fn parse_azurite_url(url: &Url) -> Result<AzureBlobTarget> {
    let host = url
        .host_str()
        .ok_or_else(|| MvrError::Sink("azurite url is missing a host".to_string()))?
        .to_string();
    let port = url.port().unwrap_or(10000);
    let (container, blob_name) = split_container_blob(url)?;
    Ok(AzureBlobTarget {
        location: BlobLocation::Emulator { host, port },
        container,
        blob_name,
        sas_token: take_sas_token(url),
    })
}

/// Parse `azure://account/container/blob[?sas]` or the
/// `https://<account>.blob.core.windows.net/container/blob[?sas]` form.
pub fn parse_azure_blob_url(url: &Url) -> Result<AzureBlobTarget> {
    let host = url
        .host_str()
        .ok_or_else(|| MvrError::Sink("azure blob url is missing a host".to_string()))?
        .to_string();

    let account = match url.scheme() {
        "azure" => host,
        "https" => {
            let lower = host.to_lowercase();
            if !lower.contains("blob.core.windows.net") {
                return Err(MvrError::Sink(
                    "only blob.core.windows.net hosts are supported for https".to_string(),
                ));
            }
            lower
                .split('.')
                .next()
                .unwrap_or_default()
                .to_string()
        }
        other => {
            return Err(MvrError::Sink(format!(
                "unsupported blob scheme: {}",
                other
            )))
        }
    };

    let (container, blob_name) = split_container_blob(url)?;
    Ok(AzureBlobTarget {
        location: BlobLocation::Account(account),
        container,
        blob_name,
        sas_token: take_sas_token(url),
    })
}

async fn build_blob_client(target: &AzureBlobTarget) -> Result<BlobClient> {
    let credentials = match (&target.sas_token, &target.location) {
        (Some(sas), _) => StorageCredentials::sas_token(sas.as_str())
            .map_err(|e| MvrError::Sink(format!("invalid SAS token: {}", e)))?,
        (None, BlobLocation::Emulator { .. }) => StorageCredentials::access_key(
            azure_storage::EMULATOR_ACCOUNT,
            azure_storage::EMULATOR_ACCOUNT_KEY.to_string(),
        ),
        (None, BlobLocation::Account(_)) => {
            let credential = azure_identity::create_default_credential()
                .map_err(|e| MvrError::Sink(format!("default azure credential: {}", e)))?;
            StorageCredentials::token_credential(credential)
        }
    };

    let builder = match &target.location {
        BlobLocation::Emulator { host, port } => ClientBuilder::with_location(
            CloudLocation::Emulator {
                address: host.clone(),
                port: *port,
            },
            credentials,
        ),
        BlobLocation::Account(account) => ClientBuilder::new(account.clone(), credentials),
    };

    Ok(builder.blob_client(&target.container, &target.blob_name))
}

/// A synchronous `Write` that pipes bytes to an upload task.
///
/// Blocks of [`BLOCK_SIZE`] are staged with `put_block` by a dedicated
/// tokio task; `close` sends the final partial block, commits the block
/// list and waits for the task, surfacing any upload error. Write and
/// close run on blocking threads, never on the async runtime itself.
pub struct AzureBlobWriter {
    tx: Option<tokio::sync::mpsc::Sender<Vec<u8>>>,
    done: Option<std::sync::mpsc::Receiver<std::result::Result<u64, String>>>,
    staged: Vec<u8>,
}

impl AzureBlobWriter {
    /// Spawn the upload task. Must be called from an async context.
    pub async fn open(target: AzureBlobTarget) -> Result<Self> {
        let client = build_blob_client(&target).await?;
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(4);
        let (done_tx, done_rx) = std::sync::mpsc::sync_channel(1);

        info!(
            container = %target.container,
            blob = %target.blob_name,
            "starting azure blob upload"
        );

        tokio::spawn(async move {
            let result = upload_blocks(client, &mut rx, Arc::new(target)).await;
            let _ = done_tx.send(result.map_err(|e| e.to_string()));
        });

        Ok(Self {
            tx: Some(tx),
            done: Some(done_rx),
            staged: Vec::with_capacity(BLOCK_SIZE),
        })
    }

    fn send_staged(&mut self) -> std::io::Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(&mut self.staged, Vec::with_capacity(BLOCK_SIZE));
        if let Some(tx) = &self.tx {
            tx.blocking_send(block).map_err(|_| {
                std::io::Error::other("azure upload task stopped accepting blocks")
            })?;
        }
        Ok(())
    }

    /// Finish the upload and surface any error from the task.
    pub fn close(&mut self) -> Result<()> {
        if self.tx.is_none() {
            return Ok(());
        }
        self.send_staged().map_err(|e| MvrError::Sink(e.to_string()))?;
        self.tx = None; // closes the channel, the task commits and exits

        if let Some(done) = self.done.take() {
            match done.recv() {
                Ok(Ok(bytes)) => {
                    debug!(bytes, "azure blob upload finished");
                    Ok(())
                }
                Ok(Err(e)) => Err(MvrError::Sink(format!("upload failed: {}", e))),
                Err(_) => Err(MvrError::Sink("upload task vanished".to_string())),
            }
        } else {
            Ok(())
        }
    }
}

impl Write for AzureBlobWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.staged.extend_from_slice(buf);
        if self.staged.len() >= BLOCK_SIZE {
            self.send_staged()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // blocks are flushed on size boundaries and at close; nothing to
        // force mid-stream without fragmenting the block list
        Ok(())
    }
}

async fn upload_blocks(
    client: BlobClient,
    rx: &mut tokio::sync::mpsc::Receiver<Vec<u8>>,
    target: Arc<AzureBlobTarget>,
) -> Result<u64> {
    let mut block_ids: Vec<Vec<u8>> = Vec::new();
    let mut total_bytes = 0u64;

    while let Some(block) = rx.recv().await {
        total_bytes += block.len() as u64;
        let block_id = format!("{:016}", block_ids.len()).into_bytes();
        client
            .put_block(block_id.clone(), block)
            .await
            .map_err(|e| {
                MvrError::Sink(format!(
                    "put_block for {}/{}: {}",
                    target.container, target.blob_name, e
                ))
            })?;
        block_ids.push(block_id);
    }

    if block_ids.is_empty() {
        client
            .put_block_blob(Vec::new())
            .await
            .map_err(|e| MvrError::Sink(format!("put_block_blob: {}", e)))?;
        return Ok(0);
    }

    let block_list = BlockList {
        blocks: block_ids
            .into_iter()
            .map(|id| BlobBlockType::new_uncommitted(id))
            .collect(),
    };
    client
        .put_block_list(block_list)
        .await
        .map_err(|e| MvrError::Sink(format!("put_block_list: {}", e)))?;

    Ok(total_bytes)
}
