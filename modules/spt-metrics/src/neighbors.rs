use spt_expressions::Point;

use crate::grid::GridIndex;

/// Symmetric k-nearest-neighbour graph: `i` and `j` are adjacent if either is
/// among the other's `k` nearest.
#[derive(Debug, Clone)]
pub struct NeighborGraph {
    offsets: Vec<usize>,
    targets: Vec<usize>,
}

impl NeighborGraph {
    pub fn knn(points: &[Point], k: usize) -> Self {
        let grid = GridIndex::for_neighbors(points);
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); points.len()];
        for i in 0..points.len() {
            for j in grid.nearest(i, k) {
                adjacency[i].push(j);
                adjacency[j].push(i);
            }
        }

        let mut offsets = Vec::with_capacity(points.len() + 1);
        let mut targets = Vec::new();
        offsets.push(0);
        for mut list in adjacency {
            list.sort_unstable();
            list.dedup();
            targets.extend(list);
            offsets.push(targets.len());
        }

        Self { offsets, targets }
    }

    pub fn node_count(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn neighbors(&self, i: usize) -> &[usize] {
        &self.targets[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Number of directed adjacency entries (each undirected edge counts twice).
    pub fn edge_count(&self) -> usize {
        self.targets.len()
    }

    /// Directed adjacency entries `(i, j)`.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.node_count()).flat_map(move |i| self.neighbors(i).iter().map(move |&j| (i, j)))
    }
}
