//! Fruchterman-Reingold spring layout.

use petgraph::graph::UnGraph;
use petgraph::visit::EdgeRef;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LayoutConfig {
    pub iterations: usize,
    pub seed: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            iterations: 16,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

const MIN_DISTANCE: f64 = 0.01;

/// Positions indexed by node index, rescaled into `[-1, 1]` on both axes.
/// The same seed always yields the same positions.
pub fn spring_layout<N, E>(graph: &UnGraph<N, E>, config: LayoutConfig) -> Vec<Position> {
    let n = graph.node_count();
    match n {
        0 => return Vec::new(),
        1 => return vec![Position::default()],
        _ => {}
    }

    let mut rng = fastrand::Rng::with_seed(config.seed);
    let mut pos: Vec<Position> = (0..n)
        .map(|_| Position {
            x: rng.f64(),
            y: rng.f64(),
        })
        .collect();

    let mut adjacent = vec![vec![false; n]; n];
    for edge in graph.edge_references() {
        let (a, b) = (edge.source().index(), edge.target().index());
        adjacent[a][b] = true;
        adjacent[b][a] = true;
    }

    let k = (1.0 / n as f64).sqrt();
    let mut temperature = 0.1;
    let cooling = temperature / (config.iterations as f64 + 1.0);

    for _ in 0..config.iterations {
        let mut displacement = vec![Position::default(); n];
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let dx = pos[i].x - pos[j].x;
                let dy = pos[i].y - pos[j].y;
                let distance = (dx * dx + dy * dy).sqrt().max(MIN_DISTANCE);
                let attraction = if adjacent[i][j] { distance / k } else { 0.0 };
                let force = k * k / (distance * distance) - attraction;
                displacement[i].x += dx * force;
                displacement[i].y += dy * force;
            }
        }

        for (p, d) in pos.iter_mut().zip(&displacement) {
            let length = (d.x * d.x + d.y * d.y).sqrt().max(MIN_DISTANCE);
            p.x += d.x * temperature / length;
            p.y += d.y * temperature / length;
        }
        temperature -= cooling;
    }

    rescale(&mut pos);
    pos
}

fn rescale(pos: &mut [Position]) {
    let count = pos.len() as f64;
    let cx = pos.iter().map(|p| p.x).sum::<f64>() / count;
    let cy = pos.iter().map(|p| p.y).sum::<f64>() / count;
    let extent = pos
        .iter()
        .map(|p| (p.x - cx).abs().max((p.y - cy).abs()))
        .fold(0.0_f64, f64::max);

    for p in pos.iter_mut() {
        p.x -= cx;
        p.y -= cy;
        if extent > 0.0 {
            p.x /= extent;
            p.y /= extent;
        }
    }
}
