use std::path::Path;

use anyhow::{Context, Result};
use askama::Template;
use tracing::info;

use crate::layout::{spring_layout, LayoutConfig};
use crate::{NodeKind, Relationship, RelationshipGraph};

/// Side length of one graph panel in SVG user units.
pub const PANEL_SIZE: f64 = 1000.0;
const MARGIN: f64 = 80.0;
const TITLE_HEIGHT: f64 = 40.0;

struct EdgeView {
    x1: String,
    y1: String,
    x2: String,
    y2: String,
}

struct NodeView {
    cx: String,
    cy: String,
    r: String,
    fill: &'static str,
    label: String,
    show_label: bool,
}

struct PanelView {
    title: &'static str,
    offset_x: String,
    edges: Vec<EdgeView>,
    nodes: Vec<NodeView>,
}

#[derive(Template)]
#[template(path = "graph_plot.svg", escape = "html")]
struct GraphPlotTemplate {
    width: String,
    height: String,
    title_y: String,
    panels: Vec<PanelView>,
}

fn party_color(relationship: Relationship) -> &'static str {
    match relationship {
        Relationship::Agent => "blue",
        Relationship::Owner => "green",
    }
}

fn coord(value: f64) -> String {
    format!("{value:.2}")
}

fn panel_view(graph: &RelationshipGraph, layout: LayoutConfig, index: usize) -> PanelView {
    let positions = spring_layout(graph.graph(), layout);
    let half = (PANEL_SIZE - 2.0 * MARGIN) / 2.0;
    let project = |i: usize| {
        let p = positions[i];
        (
            MARGIN + half + p.x * half,
            TITLE_HEIGHT + MARGIN + half - p.y * half,
        )
    };

    let g = graph.graph();
    let edges = g
        .edge_indices()
        .filter_map(|e| g.edge_endpoints(e))
        .map(|(a, b)| {
            let (x1, y1) = project(a.index());
            let (x2, y2) = project(b.index());
            EdgeView {
                x1: coord(x1),
                y1: coord(y1),
                x2: coord(x2),
                y2: coord(y2),
            }
        })
        .collect();

    // Parties after companies so their labels draw on top.
    let mut order: Vec<_> = g.node_indices().collect();
    order.sort_by_key(|&idx| g[idx].kind == NodeKind::Party);
    let nodes = order
        .into_iter()
        .map(|idx| {
            let (cx, cy) = project(idx.index());
            let node = &g[idx];
            let is_party = node.kind == NodeKind::Party;
            NodeView {
                cx: coord(cx),
                cy: coord(cy),
                r: coord(graph.node_size(idx).sqrt() / 2.0),
                fill: if is_party {
                    party_color(graph.relationship())
                } else {
                    "red"
                },
                label: node.label.clone(),
                show_label: is_party,
            }
        })
        .collect();

    PanelView {
        title: graph.relationship().title(),
        offset_x: coord(index as f64 * PANEL_SIZE),
        edges,
        nodes,
    }
}

/// Draws every graph side by side into one SVG document.
pub fn render_svg(graphs: &[RelationshipGraph], layout: LayoutConfig) -> Result<String> {
    let template = GraphPlotTemplate {
        width: coord(PANEL_SIZE * graphs.len().max(1) as f64),
        height: coord(PANEL_SIZE + TITLE_HEIGHT),
        title_y: coord(TITLE_HEIGHT * 0.7),
        panels: graphs
            .iter()
            .enumerate()
            .map(|(i, g)| panel_view(g, layout, i))
            .collect(),
    };
    template.render().context("rendering graph_plot.svg template")
}

pub fn write_svg(path: &Path, graphs: &[RelationshipGraph], layout: LayoutConfig) -> Result<()> {
    let svg = render_svg(graphs, layout)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, svg).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), panels = graphs.len(), "wrote relationship plot");
    Ok(())
}
