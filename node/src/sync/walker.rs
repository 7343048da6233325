//! Query-tree walk: decides which subtrees are missing locally and requests
//! each one exactly once.

use super::context::SynchronizationContext;
use super::RetrievalMode;
use crate::archive::RetrieveOutcome;
use crate::model::{attr, sop_classes, HierarchyLevel, QueryNode, RetrievalRequest, UniqueKey};
use crate::storage::LocalIndex;
use eyre::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

/// Issues one retrieval for one missing subtree.
pub trait SubtreeRetriever {
    fn retrieve(&self, request: &RetrievalRequest) -> Result<RetrieveOutcome>;
}

/// Where an expected instance's storage classes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassSource {
    Explicit,
    StudyAggregate,
    Modality,
    Universe,
}

/// Counters for one walked query tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WalkReport {
    pub nodes_visited: u64,
    pub skipped: u64,
    pub already_local: u64,
    pub expected_instances: u64,
    pub requests: u64,
    pub requests_failed: u64,
}

impl WalkReport {
    pub fn absorb(&mut self, other: &WalkReport) {
        self.nodes_visited += other.nodes_visited;
        self.skipped += other.skipped;
        self.already_local += other.already_local;
        self.expected_instances += other.expected_instances;
        self.requests += other.requests;
        self.requests_failed += other.requests_failed;
    }
}

/// Resolve candidate storage classes for an instance with the given ancestors.
///
/// Order: the instance's own class, the study's aggregate class list, the
/// series modality, then every known storage class.
pub fn resolve_classes(
    instance: &QueryNode,
    ancestors: &[&QueryNode],
) -> (ClassSource, BTreeSet<String>) {
    if let Some(class) = instance.attribute(attr::SOP_CLASS_UID) {
        return (ClassSource::Explicit, BTreeSet::from([class.to_string()]));
    }
    let ancestor = |level: HierarchyLevel| ancestors.iter().rev().find(|node| node.level == level);

    if let Some(study) = ancestor(HierarchyLevel::Study) {
        let listed: BTreeSet<String> = study
            .values(attr::SOP_CLASSES_IN_STUDY)
            .into_iter()
            .map(str::to_string)
            .collect();
        if !listed.is_empty() {
            return (ClassSource::StudyAggregate, listed);
        }
    }
    let hinted = ancestor(HierarchyLevel::Series)
        .and_then(|series| series.attribute(attr::MODALITY))
        .and_then(sop_classes::plausible_classes);
    if let Some(classes) = hinted {
        return (ClassSource::Modality, classes);
    }
    (ClassSource::Universe, sop_classes::universe())
}

pub struct TreeWalker<'a> {
    index: &'a dyn LocalIndex,
    context: &'a SynchronizationContext,
    retriever: &'a dyn SubtreeRetriever,
    mode: RetrievalMode,
}

/// Ancestor chain of the node being visited.
struct Lineage<'n> {
    nodes: Vec<&'n QueryNode>,
    keys: Vec<UniqueKey>,
}

impl<'a> TreeWalker<'a> {
    pub fn new(
        index: &'a dyn LocalIndex,
        context: &'a SynchronizationContext,
        retriever: &'a dyn SubtreeRetriever,
        mode: RetrievalMode,
    ) -> Self {
        Self {
            index,
            context,
            retriever,
            mode,
        }
    }

    /// Walk every root of one query result with an empty ancestor chain.
    pub fn walk_tree(&self, roots: &[QueryNode]) -> WalkReport {
        let mut report = WalkReport::default();
        for root in roots {
            let mut lineage = Lineage {
                nodes: Vec::new(),
                keys: Vec::new(),
            };
            self.walk(root, &mut lineage, false, &mut report);
        }
        report
    }

    fn walk<'n>(
        &self,
        node: &'n QueryNode,
        lineage: &mut Lineage<'n>,
        retrieval_triggered: bool,
        report: &mut WalkReport,
    ) {
        let Some(key) = self.validate(node, lineage.nodes.last().copied()) else {
            report.skipped += 1;
            return;
        };
        report.nodes_visited += 1;

        let local = self.is_local(&key);
        if local {
            report.already_local += 1;
        }

        // Collect now, act after the children: every instance this request
        // can produce must be expected before it is dispatched.
        let pending = (!retrieval_triggered && !local && node.level != HierarchyLevel::Collection)
            .then(|| {
                let mut keys = lineage.keys.clone();
                keys.push(key.clone());
                RetrievalRequest::new(node.level, keys)
            });
        let subtree_triggered = retrieval_triggered || pending.is_some();

        if node.children.is_empty() {
            if node.level == HierarchyLevel::Instance && !local {
                self.expect(node, &key, &lineage.nodes, report);
            }
        } else {
            lineage.nodes.push(node);
            lineage.keys.push(key);
            for child in &node.children {
                self.walk(child, lineage, subtree_triggered, report);
            }
            lineage.nodes.pop();
            lineage.keys.pop();
        }

        if let Some(request) = pending {
            self.dispatch(&request, report);
        }
    }

    /// Unique key of a well-formed node; `None` marks it skipped.
    fn validate(&self, node: &QueryNode, parent: Option<&QueryNode>) -> Option<UniqueKey> {
        if let Some(parent) = parent {
            if parent.level.child() != Some(node.level) {
                warn!(
                    parent = %parent.level,
                    child = %node.level,
                    "skipping node at unexpected level"
                );
                return None;
            }
        }
        let key = node.unique_key();
        if key.is_none() {
            warn!(level = %node.level, "skipping node without a unique id");
        }
        key
    }

    fn is_local(&self, key: &UniqueKey) -> bool {
        match self.index.contains(key.level, &key.id) {
            Ok(found) => found,
            Err(err) => {
                warn!(key = %key, error = %err, "local index lookup failed; treating as missing");
                false
            }
        }
    }

    fn expect(
        &self,
        node: &QueryNode,
        key: &UniqueKey,
        ancestors: &[&QueryNode],
        report: &mut WalkReport,
    ) {
        if self.context.expect_instance(&key.id) {
            report.expected_instances += 1;
        }
        if self.mode == RetrievalMode::Pull {
            let (source, classes) = resolve_classes(node, ancestors);
            debug!(instance = %key.id, source = ?source, classes = classes.len(), "resolved storage classes");
            self.context.add_expected_classes(classes);
        }
    }

    fn dispatch(&self, request: &RetrievalRequest, report: &mut WalkReport) {
        report.requests += 1;
        let target = request
            .target()
            .map(ToString::to_string)
            .unwrap_or_default();
        info!(subtree = %target, mode = ?self.mode, "requesting missing subtree");
        let succeeded = match self.retriever.retrieve(request) {
            Ok(outcome) => outcome.is_success(),
            Err(err) => {
                error!(subtree = %target, error = %err, "retrieval failed");
                false
            }
        };
        if !succeeded {
            report.requests_failed += 1;
        }
        self.context.stats().record_request(succeeded);
    }
}
