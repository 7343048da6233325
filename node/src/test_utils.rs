use crate::archive::{
    incoming_path, transfer_syntax, ObjectSink, QueryFilter, RemoteArchive, RetrieveOutcome,
};
use crate::model::{
    attr, attribute_value, sop_classes, Attributes, HierarchyLevel, QueryNode, RetrievalRequest,
};
use crate::object::HEADER_TAGS;
use eyre::{eyre, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "archive-sync-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    path
}

/// Identifying attributes of one CT instance.
pub fn instance_attributes(study: &str, series: &str, instance: &str) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(attr::PATIENT_NAME.to_string(), "DOE^JANE".to_string());
    attributes.insert(attr::PATIENT_ID.to_string(), "PAT-1".to_string());
    attributes.insert(attr::STUDY_INSTANCE_UID.to_string(), study.to_string());
    attributes.insert(attr::SERIES_INSTANCE_UID.to_string(), series.to_string());
    attributes.insert(attr::SOP_INSTANCE_UID.to_string(), instance.to_string());
    attributes.insert(attr::SOP_CLASS_UID.to_string(), sop_classes::CT_IMAGE.to_string());
    attributes.insert(attr::MODALITY.to_string(), "CT".to_string());
    attributes
}

/// One explicit-VR little-endian element.
pub fn encode_explicit_le(tag: (u16, u16), vr: &[u8; 2], value: &[u8]) -> Vec<u8> {
    const LONG_VRS: &[&[u8; 2]] = &[b"OB", b"OW", b"SQ", b"UN", b"UT"];
    let mut out = Vec::with_capacity(12 + value.len());
    out.extend_from_slice(&tag.0.to_le_bytes());
    out.extend_from_slice(&tag.1.to_le_bytes());
    out.extend_from_slice(vr);
    if LONG_VRS.contains(&vr) {
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    } else {
        out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    }
    out.extend_from_slice(value);
    out
}

fn padded(value: &str, pad: u8) -> Vec<u8> {
    let mut bytes = value.as_bytes().to_vec();
    if bytes.len() % 2 == 1 {
        bytes.push(pad);
    }
    bytes
}

fn vr_for(keyword: &str) -> &'static [u8; 2] {
    match keyword {
        attr::MODALITY => b"CS",
        attr::PATIENT_NAME => b"PN",
        attr::PATIENT_ID => b"LO",
        _ => b"UI",
    }
}

/// Synthetic Part-10 object: preamble, explicit-LE meta header, then the
/// identifying attributes as an explicit-LE data set.
pub fn encode_object(attributes: &Attributes) -> Vec<u8> {
    let mut out = vec![0u8; 128];
    out.extend_from_slice(b"DICM");
    if let Some(class) = attribute_value(attributes, attr::SOP_CLASS_UID) {
        out.extend(encode_explicit_le((0x0002, 0x0002), b"UI", &padded(class, 0)));
    }
    if let Some(instance) = attribute_value(attributes, attr::SOP_INSTANCE_UID) {
        out.extend(encode_explicit_le((0x0002, 0x0003), b"UI", &padded(instance, 0)));
    }
    out.extend(encode_explicit_le(
        (0x0002, 0x0010),
        b"UI",
        &padded(transfer_syntax::EXPLICIT_VR_LITTLE_ENDIAN, 0),
    ));
    for (tag, keyword) in HEADER_TAGS {
        let Some(value) = attribute_value(attributes, keyword) else {
            continue;
        };
        let vr = vr_for(keyword);
        let pad = if vr == b"UI" { 0 } else { b' ' };
        out.extend(encode_explicit_le(*tag, vr, &padded(value, pad)));
    }
    out
}

pub fn write_object(path: &Path, attributes: &Attributes) -> PathBuf {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("object dir");
    }
    fs::write(path, encode_object(attributes)).expect("write object");
    path.to_path_buf()
}

pub fn study_node(uid: &str, children: Vec<QueryNode>) -> QueryNode {
    let mut attributes = Attributes::new();
    attributes.insert(attr::STUDY_INSTANCE_UID.to_string(), uid.to_string());
    attributes.insert(attr::PATIENT_NAME.to_string(), "DOE^JANE".to_string());
    QueryNode::new(HierarchyLevel::Study, attributes).with_children(children)
}

pub fn series_node(uid: &str, modality: &str, children: Vec<QueryNode>) -> QueryNode {
    let mut attributes = Attributes::new();
    attributes.insert(attr::SERIES_INSTANCE_UID.to_string(), uid.to_string());
    attributes.insert(attr::MODALITY.to_string(), modality.to_string());
    QueryNode::new(HierarchyLevel::Series, attributes).with_children(children)
}

pub fn instance_node(uid: &str, class: Option<&str>) -> QueryNode {
    let mut attributes = Attributes::new();
    attributes.insert(attr::SOP_INSTANCE_UID.to_string(), uid.to_string());
    if let Some(class) = class {
        attributes.insert(attr::SOP_CLASS_UID.to_string(), class.to_string());
    }
    QueryNode::new(HierarchyLevel::Instance, attributes)
}

/// Sink that only remembers what it was handed.
#[derive(Default)]
pub struct RecordingSink {
    received: Mutex<Vec<(PathBuf, String, String)>>,
}

impl RecordingSink {
    pub fn received(&self) -> Vec<(PathBuf, String, String)> {
        self.received.lock().clone()
    }
}

impl ObjectSink for RecordingSink {
    fn on_object_received(&self, path: &Path, transfer_syntax: &str, source: &str) {
        self.received.lock().push((
            path.to_path_buf(),
            transfer_syntax.to_string(),
            source.to_string(),
        ));
    }
}

/// In-memory archive serving a fixed query tree.
///
/// Retrievals deliver every configured object whose identifiers match the
/// request: to the `get` sink when pulling, and to the registered push sink
/// when moving, as chosen by [`PushDelivery`].
/// How a fake move reaches the push sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDelivery {
    /// Before `move_to` returns.
    Inline,
    /// From another thread, this long after `move_to` returns.
    Delayed(Duration),
    /// Never: the move reports success but nothing arrives.
    Stalled,
}

pub struct FakeArchive {
    tree: Vec<QueryNode>,
    incoming: Option<PathBuf>,
    objects: Vec<Attributes>,
    failing_patterns: Vec<String>,
    push_delivery: PushDelivery,
    push_sink: Mutex<Option<Arc<dyn ObjectSink>>>,
    finds: Mutex<Vec<QueryFilter>>,
    moves: Mutex<Vec<(RetrievalRequest, String)>>,
    gets: Mutex<Vec<RetrievalRequest>>,
}

impl FakeArchive {
    pub fn new(tree: Vec<QueryNode>) -> Self {
        Self {
            tree,
            incoming: None,
            objects: Vec::new(),
            failing_patterns: Vec::new(),
            push_delivery: PushDelivery::Inline,
            push_sink: Mutex::new(None),
            finds: Mutex::new(Vec::new()),
            moves: Mutex::new(Vec::new()),
            gets: Mutex::new(Vec::new()),
        }
    }

    pub fn with_objects(mut self, incoming: PathBuf, objects: Vec<Attributes>) -> Self {
        self.incoming = Some(incoming);
        self.objects = objects;
        self
    }

    pub fn failing_pattern(mut self, pattern: &str) -> Self {
        self.failing_patterns.push(pattern.to_string());
        self
    }

    pub fn push_delivery(mut self, delivery: PushDelivery) -> Self {
        self.push_delivery = delivery;
        self
    }

    pub fn set_push_sink(&self, sink: Arc<dyn ObjectSink>) {
        *self.push_sink.lock() = Some(sink);
    }

    pub fn finds(&self) -> Vec<QueryFilter> {
        self.finds.lock().clone()
    }

    pub fn moves(&self) -> Vec<(RetrievalRequest, String)> {
        self.moves.lock().clone()
    }

    pub fn gets(&self) -> Vec<RetrievalRequest> {
        self.gets.lock().clone()
    }

    fn matching(&self, request: &RetrievalRequest) -> Vec<Attributes> {
        self.objects
            .iter()
            .filter(|attributes| {
                request.keys.iter().all(|key| {
                    attribute_value(attributes, key.level.uid_attribute()) == Some(key.id.as_str())
                })
            })
            .cloned()
            .collect()
    }

    fn deliver(&self, request: &RetrievalRequest, sink: &dyn ObjectSink) -> u32 {
        match self.incoming.as_ref() {
            Some(incoming) => deliver_objects(incoming, &self.matching(request), sink),
            None => 0,
        }
    }
}

fn deliver_objects(incoming: &Path, objects: &[Attributes], sink: &dyn ObjectSink) -> u32 {
    for attributes in objects {
        let path = write_object(&incoming_path(incoming, "fake"), attributes);
        sink.on_object_received(&path, transfer_syntax::EXPLICIT_VR_LITTLE_ENDIAN, "FAKE");
    }
    objects.len() as u32
}

fn truncate(node: &QueryNode, depth: HierarchyLevel) -> QueryNode {
    let children = if node.level < depth {
        node.children.iter().map(|child| truncate(child, depth)).collect()
    } else {
        Vec::new()
    };
    QueryNode::new(node.level, node.attributes.clone()).with_children(children)
}

impl RemoteArchive for FakeArchive {
    fn find(&self, filter: &QueryFilter) -> Result<Vec<QueryNode>> {
        self.finds.lock().push(filter.clone());
        let pattern = filter
            .attributes
            .get(attr::PATIENT_NAME)
            .cloned()
            .unwrap_or_default();
        if self.failing_patterns.contains(&pattern) {
            return Err(eyre!("query for {pattern} refused"));
        }
        Ok(self
            .tree
            .iter()
            .map(|node| truncate(node, filter.depth))
            .collect())
    }

    fn move_to(&self, request: &RetrievalRequest, destination: &str) -> Result<RetrieveOutcome> {
        self.moves
            .lock()
            .push((request.clone(), destination.to_string()));
        let (Some(sink), Some(incoming)) = (self.push_sink.lock().clone(), self.incoming.clone())
        else {
            return Ok(RetrieveOutcome::success(0));
        };
        let delivered = match self.push_delivery {
            PushDelivery::Inline => self.deliver(request, sink.as_ref()),
            PushDelivery::Delayed(delay) => {
                let objects = self.matching(request);
                let count = objects.len() as u32;
                thread::spawn(move || {
                    thread::sleep(delay);
                    deliver_objects(&incoming, &objects, sink.as_ref());
                });
                count
            }
            PushDelivery::Stalled => self.matching(request).len() as u32,
        };
        Ok(RetrieveOutcome::success(delivered))
    }

    fn get(
        &self,
        request: &RetrievalRequest,
        classes: &BTreeSet<String>,
        sink: &dyn ObjectSink,
    ) -> Result<RetrieveOutcome> {
        self.gets
            .lock()
            .push(request.clone().with_classes(classes.clone()));
        Ok(RetrieveOutcome::success(self.deliver(request, sink)))
    }
}
