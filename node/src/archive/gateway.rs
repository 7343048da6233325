//! Blocking client for the archive gateway.

use super::wire::{read_frame, write_frame, GatewayReply, GatewayRequest};
use super::{
    incoming_path, ObjectSink, QueryFilter, RemoteArchive, RetrieveOutcome, TransferSyntaxPolicy,
};
use crate::model::{QueryNode, RetrievalRequest};
use eyre::{eyre, Result, WrapErr};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, BufReader, Read};
use std::net::TcpStream;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Identity of the remote archive (called).
    pub remote_identity: String,
    /// Our identity (calling, and the push destination).
    pub local_identity: String,
    /// Keep one association open for the whole run.
    pub reuse_association: bool,
    pub transfer_syntaxes: TransferSyntaxPolicy,
    /// Where pulled objects are written as they stream in.
    pub incoming_dir: PathBuf,
}

struct Association {
    reader: BufReader<TcpStream>,
}

impl Association {
    fn open(config: &GatewayConfig) -> Result<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).wrap_err_with(|| {
            format!("failed to connect to archive {}:{}", config.host, config.port)
        })?;
        stream.set_nodelay(true)?;
        let mut association = Self {
            reader: BufReader::new(stream),
        };
        association.send(&GatewayRequest::Associate {
            calling: config.local_identity.clone(),
            called: config.remote_identity.clone(),
            transfer_syntaxes: config.transfer_syntaxes.proposed(),
        })?;
        match association.recv()? {
            GatewayReply::Accepted => {
                debug!(remote = %config.remote_identity, "association established");
                Ok(association)
            }
            GatewayReply::Rejected { reason } => Err(eyre!("association rejected: {reason}")),
            other => Err(eyre!("unexpected association reply: {other:?}")),
        }
    }

    fn send(&mut self, request: &GatewayRequest) -> Result<()> {
        write_frame(self.reader.get_mut(), request)
    }

    fn recv(&mut self) -> Result<GatewayReply> {
        read_frame(&mut self.reader)?.ok_or_else(|| eyre!("archive closed the association"))
    }

    fn release(mut self) {
        if let Err(err) = self.send(&GatewayRequest::Release) {
            debug!(error = %err, "association release failed");
        }
    }
}

/// `RemoteArchive` over the gateway protocol.
pub struct GatewayArchive {
    config: GatewayConfig,
    shared: Mutex<Option<Association>>,
}

impl GatewayArchive {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            shared: Mutex::new(None),
        }
    }

    /// Run `op` on the reused association, or on a fresh one released afterwards.
    fn with_association<T>(&self, op: impl FnOnce(&mut Association) -> Result<T>) -> Result<T> {
        if !self.config.reuse_association {
            let mut association = Association::open(&self.config)?;
            let result = op(&mut association);
            association.release();
            return result;
        }

        let mut shared = self.shared.lock();
        if shared.is_none() {
            *shared = Some(Association::open(&self.config)?);
        }
        let Some(association) = shared.as_mut() else {
            return Err(eyre!("association unavailable"));
        };
        let result = op(association);
        if result.is_err() {
            // Stream position is unknown after a failure; reconnect next time.
            *shared = None;
        }
        result
    }

    /// Release the reused association, if any.
    pub fn close(&self) {
        if let Some(association) = self.shared.lock().take() {
            association.release();
        }
    }

    fn receive_object(
        &self,
        association: &mut Association,
        length: u64,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.incoming_dir).wrap_err_with(|| {
            format!("failed to create {}", self.config.incoming_dir.display())
        })?;
        let path = incoming_path(&self.config.incoming_dir, "pull");
        let mut file = fs::File::create(&path)
            .wrap_err_with(|| format!("failed to create {}", path.display()))?;
        let copied = io::copy(&mut (&mut association.reader).take(length), &mut file)?;
        if copied != length {
            let _ = fs::remove_file(&path);
            return Err(eyre!("object truncated: expected {length} bytes, got {copied}"));
        }
        Ok(path)
    }
}

impl RemoteArchive for GatewayArchive {
    fn find(&self, filter: &QueryFilter) -> Result<Vec<QueryNode>> {
        self.with_association(|association| {
            association.send(&GatewayRequest::Find {
                depth: filter.depth,
                filter: filter.attributes.clone(),
            })?;
            match association.recv()? {
                GatewayReply::Matches { nodes } => Ok(nodes),
                GatewayReply::Error { message } => Err(eyre!("query failed: {message}")),
                other => Err(eyre!("unexpected query reply: {other:?}")),
            }
        })
    }

    fn move_to(&self, request: &RetrievalRequest, destination: &str) -> Result<RetrieveOutcome> {
        self.with_association(|association| {
            association.send(&GatewayRequest::Move {
                level: request.level,
                identifiers: request.identifiers(),
                destination: destination.to_string(),
            })?;
            match association.recv()? {
                GatewayReply::Done {
                    status,
                    completed,
                    failed,
                    warning,
                } => Ok(RetrieveOutcome {
                    status,
                    completed,
                    failed,
                    warning,
                }),
                GatewayReply::Error { message } => Err(eyre!("move failed: {message}")),
                other => Err(eyre!("unexpected move reply: {other:?}")),
            }
        })
    }

    fn get(
        &self,
        request: &RetrievalRequest,
        classes: &BTreeSet<String>,
        sink: &dyn ObjectSink,
    ) -> Result<RetrieveOutcome> {
        self.with_association(|association| {
            association.send(&GatewayRequest::Get {
                level: request.level,
                identifiers: request.identifiers(),
                classes: classes.iter().cloned().collect(),
                transfer_syntaxes: self.config.transfer_syntaxes.proposed(),
            })?;
            loop {
                match association.recv()? {
                    GatewayReply::Object {
                        transfer_syntax,
                        length,
                        source,
                    } => {
                        let path = self.receive_object(association, length)?;
                        if !self.config.transfer_syntaxes.accepts(&transfer_syntax) {
                            warn!(
                                transfer_syntax = %transfer_syntax,
                                "archive sent an object in an unnegotiated transfer syntax"
                            );
                        }
                        let source = source.as_deref().unwrap_or(&self.config.remote_identity);
                        sink.on_object_received(&path, &transfer_syntax, source);
                    }
                    GatewayReply::Done {
                        status,
                        completed,
                        failed,
                        warning,
                    } => {
                        return Ok(RetrieveOutcome {
                            status,
                            completed,
                            failed,
                            warning,
                        })
                    }
                    GatewayReply::Error { message } => return Err(eyre!("get failed: {message}")),
                    other => return Err(eyre!("unexpected get reply: {other:?}")),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::transfer_syntax;
    use crate::model::{attr, HierarchyLevel, UniqueKey};
    use crate::test_utils::{temp_dir, RecordingSink};
    use std::io::{BufRead, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serves `connections` associations, answering each request with `respond`.
    fn spawn_gateway<F>(connections: usize, respond: F) -> (u16, thread::JoinHandle<Vec<GatewayRequest>>)
    where
        F: Fn(&GatewayRequest, &mut TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for _ in 0..connections {
                let (stream, _) = listener.accept().expect("accept");
                let mut writer = stream.try_clone().expect("clone");
                let mut reader = BufReader::new(stream);
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).expect("read") == 0 {
                        break;
                    }
                    let request: GatewayRequest = serde_json::from_str(line.trim()).expect("frame");
                    let release = request == GatewayRequest::Release;
                    respond(&request, &mut writer);
                    seen.push(request);
                    if release {
                        break;
                    }
                }
            }
            seen
        });
        (port, handle)
    }

    fn reply(stream: &mut TcpStream, reply: &GatewayReply) {
        write_frame(stream, reply).expect("reply");
    }

    fn config(port: u16, reuse: bool, incoming_dir: PathBuf) -> GatewayConfig {
        GatewayConfig {
            host: "127.0.0.1".to_string(),
            port,
            remote_identity: "ARCHIVE".to_string(),
            local_identity: "SYNC".to_string(),
            reuse_association: reuse,
            transfer_syntaxes: TransferSyntaxPolicy::Uncompressed,
            incoming_dir,
        }
    }

    fn study_request() -> RetrievalRequest {
        RetrievalRequest::new(
            HierarchyLevel::Study,
            vec![UniqueKey::new(HierarchyLevel::Study, "1.2.3")],
        )
    }

    #[test]
    fn find_returns_matches_on_fresh_associations() {
        let (port, server) = spawn_gateway(2, |request, stream| match request {
            GatewayRequest::Associate { .. } => reply(stream, &GatewayReply::Accepted),
            GatewayRequest::Find { .. } => {
                let mut attributes = crate::model::Attributes::new();
                attributes.insert(attr::STUDY_INSTANCE_UID.to_string(), "1.2.3".to_string());
                reply(
                    stream,
                    &GatewayReply::Matches {
                        nodes: vec![QueryNode::new(HierarchyLevel::Study, attributes)],
                    },
                );
            }
            _ => {}
        });
        let archive = GatewayArchive::new(config(port, false, temp_dir("gw-find")));
        let filter = QueryFilter::for_name_pattern("*", HierarchyLevel::Instance);

        for _ in 0..2 {
            let nodes = archive.find(&filter).expect("find");
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].attribute(attr::STUDY_INSTANCE_UID), Some("1.2.3"));
        }

        let seen = server.join().expect("server");
        let associations = seen
            .iter()
            .filter(|r| matches!(r, GatewayRequest::Associate { .. }))
            .count();
        assert_eq!(associations, 2);
        assert!(matches!(
            &seen[0],
            GatewayRequest::Associate { calling, called, .. } if calling == "SYNC" && called == "ARCHIVE"
        ));
    }

    #[test]
    fn reused_association_carries_find_and_move() {
        let (port, server) = spawn_gateway(1, |request, stream| match request {
            GatewayRequest::Associate { .. } => reply(stream, &GatewayReply::Accepted),
            GatewayRequest::Find { .. } => reply(stream, &GatewayReply::Matches { nodes: Vec::new() }),
            GatewayRequest::Move { .. } => reply(
                stream,
                &GatewayReply::Done {
                    status: 0xA702,
                    completed: 0,
                    failed: 2,
                    warning: 0,
                },
            ),
            _ => {}
        });
        let archive = GatewayArchive::new(config(port, true, temp_dir("gw-move")));
        let filter = QueryFilter::for_name_pattern("A*", HierarchyLevel::Study);
        assert!(archive.find(&filter).expect("find").is_empty());
        let outcome = archive.move_to(&study_request(), "SYNC").expect("move");
        assert_eq!(outcome.status, 0xA702);
        assert!(!outcome.is_success());
        archive.close();

        let seen = server.join().expect("server");
        assert_eq!(seen.len(), 4);
        assert!(matches!(
            &seen[2],
            GatewayRequest::Move { destination, identifiers, .. }
                if destination == "SYNC" && identifiers[attr::STUDY_INSTANCE_UID] == "1.2.3"
        ));
        assert_eq!(seen[3], GatewayRequest::Release);
    }

    #[test]
    fn get_streams_objects_to_sink() {
        let (port, server) = spawn_gateway(1, |request, stream| match request {
            GatewayRequest::Associate { .. } => reply(stream, &GatewayReply::Accepted),
            GatewayRequest::Get { .. } => {
                for payload in [b"first-object".as_slice(), b"second".as_slice()] {
                    reply(
                        stream,
                        &GatewayReply::Object {
                            transfer_syntax: transfer_syntax::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                            length: payload.len() as u64,
                            source: None,
                        },
                    );
                    stream.write_all(payload).expect("payload");
                }
                reply(
                    stream,
                    &GatewayReply::Done {
                        status: 0,
                        completed: 2,
                        failed: 0,
                        warning: 0,
                    },
                );
            }
            _ => {}
        });
        let incoming = temp_dir("gw-get");
        let archive = GatewayArchive::new(config(port, false, incoming.clone()));
        let sink = RecordingSink::default();
        let classes: BTreeSet<String> = ["1.2.840.10008.5.1.4.1.1.2".to_string()].into();

        let outcome = archive.get(&study_request(), &classes, &sink).expect("get");
        assert_eq!(outcome, RetrieveOutcome::success(2));

        let received = sink.received();
        assert_eq!(received.len(), 2);
        assert_eq!(fs::read(&received[0].0).expect("read"), b"first-object");
        assert_eq!(fs::read(&received[1].0).expect("read"), b"second");
        assert_eq!(received[0].2, "ARCHIVE");

        let seen = server.join().expect("server");
        assert!(matches!(
            &seen[1],
            GatewayRequest::Get { classes, .. } if classes == &vec!["1.2.840.10008.5.1.4.1.1.2".to_string()]
        ));
        let _ = fs::remove_dir_all(&incoming);
    }

    #[test]
    fn rejected_association_is_an_error() {
        let (port, server) = spawn_gateway(1, |request, stream| {
            if let GatewayRequest::Associate { .. } = request {
                reply(
                    stream,
                    &GatewayReply::Rejected {
                        reason: "unknown calling identity".to_string(),
                    },
                );
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        });
        let archive = GatewayArchive::new(config(port, false, temp_dir("gw-reject")));
        let err = archive
            .find(&QueryFilter::for_name_pattern("*", HierarchyLevel::Study))
            .expect_err("rejected");
        assert!(err.to_string().contains("rejected"));
        server.join().expect("server");
    }
}
