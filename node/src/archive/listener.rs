//! Push listener: accepts remote-initiated deliveries and hands each stored
//! object to the sink.

use super::wire::{read_frame_async, write_frame_async, StoreRequest, StoreResponse};
use super::{incoming_path, ObjectSink, TransferSyntaxPolicy};
use eyre::{eyre, Result, WrapErr};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const STATUS_STORED: u16 = 0x0000;
pub const STATUS_REFUSED_SYNTAX: u16 = 0xA900;
pub const STATUS_WRITE_FAILURE: u16 = 0xA700;

#[derive(Debug, Clone, Serialize)]
pub struct ListenerConfig {
    /// Identity remote archives must address us by.
    pub local_identity: String,
    pub incoming_dir: PathBuf,
    pub transfer_syntaxes: TransferSyntaxPolicy,
}

/// Running push listener.
pub struct StoreListener {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl StoreListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Transfers already in progress finish on
    /// their own tasks.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "push listener task failed");
        }
    }
}

/// Bind `bind` and start accepting deliveries.
pub async fn spawn_listener(
    bind: SocketAddr,
    config: ListenerConfig,
    sink: Arc<dyn ObjectSink>,
) -> Result<StoreListener> {
    let listener = TcpListener::bind(bind)
        .await
        .wrap_err_with(|| format!("failed to bind push listener on {bind}"))?;
    let local_addr = listener.local_addr()?;
    tokio::fs::create_dir_all(&config.incoming_dir)
        .await
        .wrap_err_with(|| format!("failed to create {}", config.incoming_dir.display()))?;
    info!(addr = %local_addr, identity = %config.local_identity, "push listener started");

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let config = Arc::new(config);
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let config = Arc::clone(&config);
                        let sink = Arc::clone(&sink);
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(stream, &config, sink).await {
                                warn!(peer = %peer, error = %err, "push connection failed");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "push listener accept failed"),
                },
            }
        }
        debug!("push listener stopped");
    });

    Ok(StoreListener {
        local_addr,
        stop_tx,
        handle,
    })
}

async fn serve_connection(
    stream: TcpStream,
    config: &ListenerConfig,
    sink: Arc<dyn ObjectSink>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let Some(calling) = negotiate(&mut reader, &mut writer, config).await? else {
        return Ok(());
    };

    loop {
        let frame: Option<StoreRequest> = read_frame_async(&mut reader).await?;
        match frame {
            None | Some(StoreRequest::Release) => break,
            Some(StoreRequest::Object {
                transfer_syntax,
                length,
            }) => {
                let status = if config.transfer_syntaxes.accepts(&transfer_syntax) {
                    match receive_object(&mut reader, config, length).await? {
                        Some(path) => {
                            let sink = Arc::clone(&sink);
                            let source = calling.clone();
                            let syntax = transfer_syntax.clone();
                            let delivered = tokio::task::spawn_blocking(move || {
                                sink.on_object_received(&path, &syntax, &source);
                            })
                            .await;
                            if let Err(err) = delivered {
                                warn!(error = %err, "receiver task failed");
                            }
                            STATUS_STORED
                        }
                        None => STATUS_WRITE_FAILURE,
                    }
                } else {
                    warn!(
                        transfer_syntax = %transfer_syntax,
                        "refusing object in unaccepted transfer syntax"
                    );
                    discard(&mut reader, length).await?;
                    STATUS_REFUSED_SYNTAX
                };
                write_frame_async(&mut writer, &StoreResponse::Status { status }).await?;
            }
            Some(StoreRequest::Associate { .. }) => {
                return Err(eyre!("association already established"));
            }
        }
    }
    Ok(())
}

/// Validate the association request. Returns the calling identity, or `None`
/// when the association was rejected.
async fn negotiate(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    config: &ListenerConfig,
) -> Result<Option<String>> {
    let request: Option<StoreRequest> = read_frame_async(reader).await?;
    let Some(StoreRequest::Associate {
        calling,
        called,
        transfer_syntaxes,
    }) = request
    else {
        return Err(eyre!("expected association request"));
    };

    let rejection = if called.trim() != config.local_identity {
        Some(format!("called identity {called} is not {}", config.local_identity))
    } else {
        None
    };
    let chosen = transfer_syntaxes
        .iter()
        .find(|uid| config.transfer_syntaxes.accepts(uid));

    let response = match (rejection, chosen) {
        (Some(reason), _) => StoreResponse::Rejected { reason },
        (None, None) => StoreResponse::Rejected {
            reason: "no acceptable transfer syntax proposed".to_string(),
        },
        (None, Some(uid)) => StoreResponse::Accepted {
            transfer_syntax: uid.clone(),
        },
    };
    write_frame_async(writer, &response).await?;
    match response {
        StoreResponse::Accepted { .. } => {
            debug!(calling = %calling, "push association accepted");
            Ok(Some(calling))
        }
        StoreResponse::Rejected { reason } => {
            warn!(calling = %calling, reason = %reason, "push association rejected");
            Ok(None)
        }
        StoreResponse::Status { .. } => Ok(None),
    }
}

/// Write `length` payload bytes to a fresh incoming file. `None` when the file
/// could not be written; the payload is consumed either way.
async fn receive_object(
    reader: &mut BufReader<OwnedReadHalf>,
    config: &ListenerConfig,
    length: u64,
) -> Result<Option<PathBuf>> {
    let path = incoming_path(&config.incoming_dir, "push");
    let mut file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot create incoming file");
            discard(reader, length).await?;
            return Ok(None);
        }
    };
    let copied = tokio::io::copy(&mut (&mut *reader).take(length), &mut file).await?;
    file.flush().await?;
    if copied != length {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(eyre!("object truncated: expected {length} bytes, got {copied}"));
    }
    Ok(Some(path))
}

async fn discard(reader: &mut BufReader<OwnedReadHalf>, length: u64) -> Result<()> {
    let skipped = tokio::io::copy(&mut (&mut *reader).take(length), &mut tokio::io::sink()).await?;
    if skipped != length {
        return Err(eyre!("object truncated while discarding"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::transfer_syntax;
    use crate::test_utils::{temp_dir, RecordingSink};
    use tokio::io::AsyncBufRead;

    async fn start(prefix: &str) -> (StoreListener, Arc<RecordingSink>, PathBuf) {
        let incoming = temp_dir(prefix);
        let sink = Arc::new(RecordingSink::default());
        let listener = spawn_listener(
            "127.0.0.1:0".parse().expect("addr"),
            ListenerConfig {
                local_identity: "SYNC".to_string(),
                incoming_dir: incoming.clone(),
                transfer_syntaxes: TransferSyntaxPolicy::Uncompressed,
            },
            sink.clone(),
        )
        .await
        .expect("listener");
        (listener, sink, incoming)
    }

    async fn recv<R: AsyncBufRead + Unpin>(reader: &mut R) -> StoreResponse {
        read_frame_async(reader).await.expect("read").expect("frame")
    }

    async fn associate(addr: SocketAddr, called: &str) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf, StoreResponse) {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        write_frame_async(
            &mut writer,
            &StoreRequest::Associate {
                calling: "ARCHIVE".to_string(),
                called: called.to_string(),
                transfer_syntaxes: vec![
                    transfer_syntax::JPEG_BASELINE.to_string(),
                    transfer_syntax::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                ],
            },
        )
        .await
        .expect("associate");
        let response = recv(&mut reader).await;
        (reader, writer, response)
    }

    #[tokio::test]
    async fn stores_object_and_notifies_sink() {
        let (listener, sink, incoming) = start("listener-store").await;
        let (mut reader, mut writer, response) = associate(listener.local_addr(), "SYNC").await;
        assert_eq!(
            response,
            StoreResponse::Accepted {
                transfer_syntax: transfer_syntax::EXPLICIT_VR_LITTLE_ENDIAN.to_string()
            }
        );

        let payload = b"pushed-object-bytes";
        write_frame_async(
            &mut writer,
            &StoreRequest::Object {
                transfer_syntax: transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                length: payload.len() as u64,
            },
        )
        .await
        .expect("object");
        writer.write_all(payload).await.expect("payload");
        assert_eq!(
            recv(&mut reader).await,
            StoreResponse::Status {
                status: STATUS_STORED
            }
        );
        write_frame_async(&mut writer, &StoreRequest::Release)
            .await
            .expect("release");

        let received = sink.received();
        assert_eq!(received.len(), 1);
        let (path, syntax, source) = &received[0];
        assert_eq!(std::fs::read(path).expect("read"), payload);
        assert_eq!(syntax, transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN);
        assert_eq!(source, "ARCHIVE");

        listener.shutdown().await;
        let _ = std::fs::remove_dir_all(&incoming);
    }

    #[tokio::test]
    async fn refuses_compressed_object_under_uncompressed_policy() {
        let (listener, sink, incoming) = start("listener-refuse").await;
        let (mut reader, mut writer, _) = associate(listener.local_addr(), "SYNC").await;

        let payload = b"jpeg";
        write_frame_async(
            &mut writer,
            &StoreRequest::Object {
                transfer_syntax: transfer_syntax::JPEG_BASELINE.to_string(),
                length: payload.len() as u64,
            },
        )
        .await
        .expect("object");
        writer.write_all(payload).await.expect("payload");
        assert_eq!(
            recv(&mut reader).await,
            StoreResponse::Status {
                status: STATUS_REFUSED_SYNTAX
            }
        );
        assert!(sink.received().is_empty());

        listener.shutdown().await;
        let _ = std::fs::remove_dir_all(&incoming);
    }

    #[tokio::test]
    async fn rejects_wrong_called_identity() {
        let (listener, sink, incoming) = start("listener-reject").await;
        let (_, _, response) = associate(listener.local_addr(), "SOMEONE-ELSE").await;
        assert!(matches!(response, StoreResponse::Rejected { .. }));
        assert!(sink.received().is_empty());

        listener.shutdown().await;
        let _ = std::fs::remove_dir_all(&incoming);
    }
}
