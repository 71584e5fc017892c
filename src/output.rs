//! CLI output formatting.
//!
//! Output leads with the resource identity; details (variant counts, errors,
//! warnings) follow as indented context lines.
//!
//! ## Plan
//!
//! ```text
//! docs/index.md
//!     docs/guide.md
//!         docs/img/dawn.jpg (7 tiers)
//!     docs/paper.pdf [pdf]
//! 14 leaves: 2 images, 2 documents, 1 pdf
//! ```
//!
//! ## Process
//!
//! ```text
//! docs/img/dawn.jpg: generated (21 variants, 4000x3000)
//! docs/img/logo.png: cached (21 variants, 512x512)
//! docs/img/gone.png: failed
//!     Error: cannot open source: docs/img/gone.png: No such file or directory
//! ```
//!
//! Each `format_*` function is pure and returns lines; `print_*` wrappers
//! write them to stdout.

use crate::cache::CacheStats;
use crate::graph::{ExecutionPlan, GraphError, GraphNode, LeafTask};
use crate::identifier::ResourceIdentifier;
use crate::process::{PipelineEvent, ProcessReport, ProcessingResult};

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

// ============================================================================
// Plan output
// ============================================================================

fn walk_plan(node: &GraphNode, depth: usize, lines: &mut Vec<String>) {
    match node {
        GraphNode::Leaf(leaf) => lines.push(format!("{}{}", indent(depth), leaf_label(leaf))),
        GraphNode::Composite { id, children } => {
            lines.push(format!("{}{}", indent(depth), id));
            walk_children(children, depth + 1, lines);
        }
    }
}

/// Children of a composite, with the per-tier jobs of one image collapsed
/// into a single line.
fn walk_children(children: &[GraphNode], depth: usize, lines: &mut Vec<String>) {
    let mut i = 0;
    while i < children.len() {
        if let GraphNode::Leaf(LeafTask::OptimizedImage(job)) = &children[i] {
            let tiers = children[i..]
                .iter()
                .take_while(|c| {
                    matches!(c, GraphNode::Leaf(LeafTask::OptimizedImage(j)) if j.resource_hash == job.resource_hash)
                })
                .count();
            lines.push(format!("{}{} ({} tiers)", indent(depth), job.resource, tiers));
            i += tiers;
        } else {
            walk_plan(&children[i], depth, lines);
            i += 1;
        }
    }
}

fn leaf_label(leaf: &LeafTask) -> String {
    match leaf {
        LeafTask::Document(id) => id.to_string(),
        LeafTask::Pdf(id) => format!("{id} [pdf]"),
        LeafTask::OptimizedImage(job) => format!("{} [{}]", job.resource, job.tier.tag),
    }
}

/// `1 leaf`, `3 leaves`.
fn count_noun(n: usize, singular: &str, plural: &str) -> String {
    if n == 1 {
        format!("{n} {singular}")
    } else {
        format!("{n} {plural}")
    }
}

/// Format a resolved plan as an indented dependency tree plus a count line.
pub fn format_plan(plan: &ExecutionPlan) -> Vec<String> {
    let mut lines = Vec::new();
    match &plan.tree {
        GraphNode::Composite { id, children } => {
            lines.push(id.to_string());
            walk_children(children, 1, &mut lines);
        }
        leaf => walk_plan(leaf, 0, &mut lines),
    }
    lines.push(format!(
        "{}: {}, {}, {}",
        count_noun(plan.leaf_count(), "leaf", "leaves"),
        count_noun(plan.image_tasks().len(), "image", "images"),
        count_noun(plan.documents().len(), "document", "documents"),
        count_noun(plan.pdfs().len(), "pdf", "pdfs"),
    ));
    lines
}

/// Format a graph failure for one root.
pub fn format_graph_error(root: &ResourceIdentifier, error: &GraphError) -> Vec<String> {
    vec![format!("{root}"), format!("    Error: {error}")]
}

/// Print the plan of one root, or why it could not be resolved.
pub fn print_plan(root: &ResourceIdentifier, plan: &Result<ExecutionPlan, GraphError>) {
    let lines = match plan {
        Ok(plan) => format_plan(plan),
        Err(e) => format_graph_error(root, e),
    };
    for line in lines {
        println!("{}", line);
    }
}

// ============================================================================
// Process output
// ============================================================================

/// Format one processed resource.
pub fn format_result(result: &ProcessingResult) -> Vec<String> {
    let mut lines = Vec::new();
    match result.error.as_deref() {
        Some(error) => {
            lines.push(format!("{}: {}", result.source, result.status));
            lines.push(format!("    Error: {error}"));
        }
        None => {
            let size = match (result.original_width, result.original_height) {
                (Some(w), Some(h)) => format!(", {w}x{h}"),
                _ => String::new(),
            };
            lines.push(format!(
                "{}: {} ({}{})",
                result.source,
                result.status,
                count_noun(result.variants.len(), "variant", "variants"),
                size
            ));
        }
    }
    for warning in &result.warnings {
        lines.push(format!("    Warning: {warning}"));
    }
    lines
}

/// Format a single progress event as display lines.
pub fn format_event(event: &PipelineEvent) -> Vec<String> {
    match event {
        PipelineEvent::PlanResolved {
            root,
            images,
            documents,
            pdfs,
        } => vec![format!(
            "{root}: {}, {}, {}",
            count_noun(*images, "image", "images"),
            count_noun(*documents, "document", "documents"),
            count_noun(*pdfs, "pdf", "pdfs")
        )],
        PipelineEvent::GraphFailed { root, error } => {
            vec![format!("{root}: skipped"), format!("    Error: {error}")]
        }
        PipelineEvent::ResourceProcessed(result) => format_result(result),
    }
}

/// Closing summary of a run.
pub fn format_summary(report: &ProcessReport) -> Vec<String> {
    let mut lines = vec![format!("Cache: {}", summarize_stats(&report.stats))];
    if report.scheduler.coalesced > 0 {
        lines.push(format!(
            "Deduplicated: {} in-flight requests",
            report.scheduler.coalesced
        ));
    }
    if !report.graph_errors.is_empty() {
        lines.push(format!(
            "Skipped: {}",
            count_noun(report.graph_errors.len(), "root", "roots")
        ));
    }
    lines
}

fn summarize_stats(stats: &CacheStats) -> String {
    if stats.total() == 0 {
        "nothing to process".to_string()
    } else {
        stats.to_string()
    }
}

pub fn print_summary(report: &ProcessReport) {
    for line in format_summary(report) {
        println!("{}", line);
    }
}
