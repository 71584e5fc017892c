//! Dependency graph construction.
//!
//! Starting from a root document, the builder asks the [`ReferenceParser`]
//! for raw references, resolves them against the referencing document and
//! classifies each target:
//!
//! | Target | Node |
//! |---|---|
//! | local document with references | `Composite`, children resolved recursively |
//! | document without references | `Leaf(Document)` |
//! | PDF (local or remote) | `Leaf(Pdf)`, never opened |
//! | image (local or remote) | replaced by one `Leaf(OptimizedImage)` per tier |
//! | remote document, web page, fragment | ignored |
//!
//! An image reference is never a leaf itself: [`expand_image`] turns it into
//! per-tier variant jobs at plan-build time.
//!
//! Cycles are detected with an explicit set of identities currently being
//! resolved plus the active path, so the error names the members in path
//! order. A depth counter bounds pathological nesting. Any [`GraphError`]
//! aborts the affected root; no partial plan is produced.
//!
//! Graph construction is single-threaded and never touches image bytes.

use crate::hashing::ResourceHash;
use crate::identifier::{ReferenceKind, ResourceIdentifier};
use crate::imaging::tiers::Tier;
use crate::imaging::BreakpointSet;
use crate::parser::{RawReference, ReferenceHint, ReferenceParser};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Default bound on document nesting.
pub const DEFAULT_MAX_DEPTH: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("reference cycle: {}", format_cycle(.members))]
    Cycle { members: Vec<ResourceIdentifier> },
    #[error("{at}: reference depth {depth} exceeds the limit of {limit}")]
    TooDeep {
        depth: usize,
        limit: usize,
        at: ResourceIdentifier,
    },
    #[error("{from}: cannot resolve '{target}': {reason}")]
    UnresolvableReference {
        from: ResourceIdentifier,
        target: String,
        reason: String,
    },
}

impl GraphError {
    /// Cycles and runaway depth mean the input itself is malformed.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Cycle { .. } | Self::TooDeep { .. })
    }
}

/// `a.md → b.md → a.md`
fn format_cycle(members: &[ResourceIdentifier]) -> String {
    let mut names: Vec<String> = members.iter().map(|m| m.key()).collect();
    if let Some(first) = names.first().cloned() {
        names.push(first);
    }
    names.join(" → ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    Document,
    Pdf,
    OptimizedImage,
}

/// One tier of one image. The formats are decided when the job runs, since
/// they depend on the decoded pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantJob {
    pub resource: ResourceIdentifier,
    pub resource_hash: ResourceHash,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafTask {
    Document(ResourceIdentifier),
    Pdf(ResourceIdentifier),
    OptimizedImage(VariantJob),
}

impl LeafTask {
    pub fn kind(&self) -> LeafKind {
        match self {
            Self::Document(_) => LeafKind::Document,
            Self::Pdf(_) => LeafKind::Pdf,
            Self::OptimizedImage(_) => LeafKind::OptimizedImage,
        }
    }

    pub fn resource(&self) -> &ResourceIdentifier {
        match self {
            Self::Document(id) | Self::Pdf(id) => id,
            Self::OptimizedImage(job) => &job.resource,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphNode {
    Leaf(LeafTask),
    Composite {
        id: ResourceIdentifier,
        children: Vec<GraphNode>,
    },
}

impl GraphNode {
    /// All leaves, depth first.
    pub fn leaves(&self) -> Vec<&LeafTask> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a LeafTask>) {
        match self {
            Self::Leaf(task) => out.push(task),
            Self::Composite { children, .. } => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }

    fn collect_composites<'a>(&'a self, out: &mut Vec<&'a ResourceIdentifier>) {
        if let Self::Composite { id, children } = self {
            out.push(id);
            for child in children {
                child.collect_composites(out);
            }
        }
    }
}

/// Leaves that can be dispatched together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub leaves: Vec<LeafTask>,
}

/// One image to optimize: every variant job of a resource, grouped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTask {
    pub resource: ResourceIdentifier,
    pub resource_hash: ResourceHash,
    pub breakpoints: BreakpointSet,
}

/// Resolved plan for one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub root: ResourceIdentifier,
    pub tree: GraphNode,
    /// Leaves have no dependencies on each other, so a root yields one batch.
    pub batches: Vec<Batch>,
    pub breakpoints: BreakpointSet,
}

impl ExecutionPlan {
    pub fn leaf_count(&self) -> usize {
        self.batches.iter().map(|b| b.leaves.len()).sum()
    }

    /// Variant jobs grouped by resource, in first-seen order.
    pub fn image_tasks(&self) -> Vec<ImageTask> {
        let mut seen = HashSet::new();
        self.batches
            .iter()
            .flat_map(|b| &b.leaves)
            .filter_map(|leaf| match leaf {
                LeafTask::OptimizedImage(job) => Some(job),
                _ => None,
            })
            .filter(|job| seen.insert(job.resource_hash.clone()))
            .map(|job| ImageTask {
                resource: job.resource.clone(),
                resource_hash: job.resource_hash.clone(),
                breakpoints: self.breakpoints.clone(),
            })
            .collect()
    }

    /// Every document in the plan, root first.
    pub fn documents(&self) -> Vec<ResourceIdentifier> {
        let mut composites = Vec::new();
        self.tree.collect_composites(&mut composites);
        let expanded = composites
            .into_iter()
            .filter(|id| id.kind() != ReferenceKind::Image)
            .cloned();
        let leaves = self.tree.leaves().into_iter().filter_map(|leaf| match leaf {
            LeafTask::Document(id) => Some(id.clone()),
            _ => None,
        });
        expanded.chain(leaves).collect()
    }

    pub fn pdfs(&self) -> Vec<ResourceIdentifier> {
        self.tree
            .leaves()
            .into_iter()
            .filter_map(|leaf| match leaf {
                LeafTask::Pdf(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Replace an image reference by one variant job per tier.
pub fn expand_image(resource: &ResourceIdentifier, breakpoints: &BreakpointSet) -> Vec<GraphNode> {
    let resource_hash = resource.resource_hash();
    breakpoints
        .tiers()
        .into_iter()
        .map(|tier| {
            GraphNode::Leaf(LeafTask::OptimizedImage(VariantJob {
                resource: resource.clone(),
                resource_hash: resource_hash.clone(),
                tier,
            }))
        })
        .collect()
}

/// Per-root traversal state.
struct Walk<'b> {
    breakpoints: &'b BreakpointSet,
    /// Documents on the active path.
    resolving: HashSet<ResourceIdentifier>,
    path: Vec<ResourceIdentifier>,
    /// Everything already placed in the plan.
    resolved: HashSet<ResourceIdentifier>,
}

pub struct GraphBuilder<'a> {
    parser: &'a dyn ReferenceParser,
    max_depth: usize,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(parser: &'a dyn ReferenceParser, max_depth: usize) -> Self {
        Self { parser, max_depth }
    }

    /// Resolve several roots independently. A failing root does not affect
    /// the others.
    pub fn resolve(
        &self,
        roots: &[(ResourceIdentifier, BreakpointSet)],
    ) -> Vec<Result<ExecutionPlan, GraphError>> {
        roots
            .iter()
            .map(|(root, breakpoints)| self.resolve_root(root, breakpoints))
            .collect()
    }

    pub fn resolve_root(
        &self,
        root: &ResourceIdentifier,
        breakpoints: &BreakpointSet,
    ) -> Result<ExecutionPlan, GraphError> {
        let mut walk = Walk {
            breakpoints,
            resolving: HashSet::new(),
            path: Vec::new(),
            resolved: HashSet::new(),
        };
        let tree = match root.kind() {
            ReferenceKind::Image => GraphNode::Composite {
                id: root.clone(),
                children: expand_image(root, breakpoints),
            },
            ReferenceKind::Pdf => GraphNode::Leaf(LeafTask::Pdf(root.clone())),
            ReferenceKind::Unsupported => {
                return Err(GraphError::UnresolvableReference {
                    from: root.clone(),
                    target: root.key(),
                    reason: "no decoder for this image format".to_string(),
                });
            }
            ReferenceKind::Document | ReferenceKind::Other => {
                self.resolve_document(root, root, &mut walk)?
            }
        };
        let leaves = tree.leaves().into_iter().cloned().collect();
        let plan = ExecutionPlan {
            root: root.clone(),
            tree,
            batches: vec![Batch { leaves }],
            breakpoints: breakpoints.clone(),
        };
        debug!(root = %root, leaves = plan.leaf_count(), "resolved plan");
        Ok(plan)
    }

    fn resolve_document(
        &self,
        doc: &ResourceIdentifier,
        from: &ResourceIdentifier,
        walk: &mut Walk<'_>,
    ) -> Result<GraphNode, GraphError> {
        let depth = walk.path.len();
        if depth > self.max_depth {
            return Err(GraphError::TooDeep {
                depth,
                limit: self.max_depth,
                at: doc.clone(),
            });
        }
        let text = read_document(doc, from)?;

        walk.resolving.insert(doc.clone());
        walk.path.push(doc.clone());
        let mut children = Vec::new();
        for reference in self.parser.extract(&text) {
            children.extend(self.resolve_reference(doc, &reference, walk)?);
        }
        walk.path.pop();
        walk.resolving.remove(doc);
        walk.resolved.insert(doc.clone());

        if children.is_empty() {
            Ok(GraphNode::Leaf(LeafTask::Document(doc.clone())))
        } else {
            Ok(GraphNode::Composite {
                id: doc.clone(),
                children,
            })
        }
    }

    fn resolve_reference(
        &self,
        doc: &ResourceIdentifier,
        reference: &RawReference,
        walk: &mut Walk<'_>,
    ) -> Result<Vec<GraphNode>, GraphError> {
        let Some(target) = doc.resolve_reference(&reference.target) else {
            if reference.hint == ReferenceHint::Image {
                let reason = if reference.target.trim().is_empty() {
                    "empty image reference"
                } else {
                    "not a local path or http(s) URL"
                };
                return Err(GraphError::UnresolvableReference {
                    from: doc.clone(),
                    target: reference.target.clone(),
                    reason: reason.to_string(),
                });
            }
            return Ok(Vec::new());
        };

        // Embedded images without a recognizable extension are still images
        let kind = match (target.kind(), reference.hint) {
            (ReferenceKind::Other, ReferenceHint::Image) => ReferenceKind::Image,
            (kind, _) => kind,
        };

        match kind {
            ReferenceKind::Other => Ok(Vec::new()),
            ReferenceKind::Unsupported => {
                debug!(from = %doc, target = %target, "skipping image format without a decoder");
                Ok(Vec::new())
            }
            ReferenceKind::Image => {
                if !walk.resolved.insert(target.clone()) {
                    return Ok(Vec::new());
                }
                Ok(expand_image(&target, walk.breakpoints))
            }
            ReferenceKind::Pdf => {
                if !walk.resolved.insert(target.clone()) {
                    return Ok(Vec::new());
                }
                Ok(vec![GraphNode::Leaf(LeafTask::Pdf(target))])
            }
            ReferenceKind::Document => {
                if matches!(target, ResourceIdentifier::Remote(_)) {
                    debug!(from = %doc, target = %target, "skipping remote document");
                    return Ok(Vec::new());
                }
                if walk.resolving.contains(&target) {
                    let start = walk.path.iter().position(|p| p == &target).unwrap_or(0);
                    return Err(GraphError::Cycle {
                        members: walk.path[start..].to_vec(),
                    });
                }
                if walk.resolved.contains(&target) {
                    return Ok(Vec::new());
                }
                Ok(vec![self.resolve_document(&target, doc, walk)?])
            }
        }
    }
}

fn read_document(doc: &ResourceIdentifier, from: &ResourceIdentifier) -> Result<String, GraphError> {
    match doc {
        ResourceIdentifier::Local(path) => {
            std::fs::read_to_string(path).map_err(|e| GraphError::UnresolvableReference {
                from: from.clone(),
                target: doc.key(),
                reason: e.to_string(),
            })
        }
        ResourceIdentifier::Remote(url) => Err(GraphError::UnresolvableReference {
            from: from.clone(),
            target: url.clone(),
            reason: "remote documents are not fetched".to_string(),
        }),
    }
}
