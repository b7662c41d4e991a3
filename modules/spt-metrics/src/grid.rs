//! Uniform grid over a specimen's centroids for radius and nearest-neighbour
//! queries.

use spt_expressions::Point;

/// Upper bound on grid cells, relative to the number of points.
const CELLS_PER_POINT: usize = 4;
const MIN_CELL_BUDGET: usize = 1024;

/// Bucketed point indices in row-major grid cells (CSR layout).
pub struct GridIndex<'a> {
    points: &'a [Point],
    origin: Point,
    cell_size: f64,
    cols: usize,
    rows: usize,
    starts: Vec<usize>,
    entries: Vec<usize>,
}

impl<'a> GridIndex<'a> {
    /// Grid tuned for queries of the given radius.
    pub fn for_radius(points: &'a [Point], radius: f64) -> Self {
        Self::new(points, radius)
    }

    /// Grid tuned for k-nearest-neighbour queries: about two points per cell.
    pub fn for_neighbors(points: &'a [Point]) -> Self {
        let (min, max) = bounds(points);
        let (width, height) = (max.x - min.x, max.y - min.y);
        let n = points.len().max(1) as f64;
        let cell_size = if width > 0.0 && height > 0.0 {
            (width * height * 2.0 / n).sqrt()
        } else {
            width.max(height) * 2.0 / n
        };
        Self::new(points, cell_size)
    }

    fn new(points: &'a [Point], cell_size: f64) -> Self {
        let (origin, max) = bounds(points);
        let mut cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            1.0
        };

        let budget = (points.len() * CELLS_PER_POINT).max(MIN_CELL_BUDGET) as f64;
        let span = |extent: f64, size: f64| (extent / size).floor() + 1.0;
        while span(max.x - origin.x, cell_size) * span(max.y - origin.y, cell_size) > budget {
            cell_size *= 2.0;
        }
        let cols = span(max.x - origin.x, cell_size) as usize;
        let rows = span(max.y - origin.y, cell_size) as usize;

        let mut grid = Self {
            points,
            origin,
            cell_size,
            cols,
            rows,
            starts: vec![0; cols * rows + 1],
            entries: vec![0; points.len()],
        };

        let cells: Vec<usize> = points.iter().map(|p| grid.cell_index(p)).collect();
        for &cell in &cells {
            grid.starts[cell + 1] += 1;
        }
        for i in 0..cols * rows {
            grid.starts[i + 1] += grid.starts[i];
        }
        let mut cursor = grid.starts.clone();
        for (point, &cell) in cells.iter().enumerate() {
            grid.entries[cursor[cell]] = point;
            cursor[cell] += 1;
        }

        grid
    }

    fn cell_coords(&self, p: &Point) -> (usize, usize) {
        let clamp = |offset: f64, limit: usize| -> usize {
            if offset <= 0.0 {
                0
            } else {
                ((offset / self.cell_size) as usize).min(limit - 1)
            }
        };
        (
            clamp(p.x - self.origin.x, self.cols),
            clamp(p.y - self.origin.y, self.rows),
        )
    }

    fn cell_index(&self, p: &Point) -> usize {
        let (cx, cy) = self.cell_coords(p);
        cy * self.cols + cx
    }

    fn bucket(&self, cx: usize, cy: usize) -> &[usize] {
        let cell = cy * self.cols + cx;
        &self.entries[self.starts[cell]..self.starts[cell + 1]]
    }

    /// Visit every point within `radius` of `center` (inclusive), including a
    /// point at `center` itself.
    pub fn within(&self, center: &Point, radius: f64, mut visit: impl FnMut(usize)) {
        if self.points.is_empty() || radius < 0.0 {
            return;
        }
        let reach = (radius / self.cell_size).ceil() as usize;
        let (cx, cy) = self.cell_coords(center);
        let limit = radius * radius;

        for gy in cy.saturating_sub(reach)..=(cy + reach).min(self.rows - 1) {
            for gx in cx.saturating_sub(reach)..=(cx + reach).min(self.cols - 1) {
                for &j in self.bucket(gx, gy) {
                    if self.points[j].distance_squared(center) <= limit {
                        visit(j);
                    }
                }
            }
        }
    }

    /// The `k` points nearest to point `index`, excluding itself, ordered by
    /// distance then index.
    pub fn nearest(&self, index: usize, k: usize) -> Vec<usize> {
        let center = self.points[index];
        let (cx, cy) = self.cell_coords(&center);
        let mut best: Vec<(f64, usize)> = Vec::with_capacity(k + 1);
        if k == 0 {
            return Vec::new();
        }

        let max_ring = self.cols.max(self.rows);
        for ring in 0..=max_ring {
            self.for_ring(cx, cy, ring, |gx, gy| {
                for &j in self.bucket(gx, gy) {
                    if j == index {
                        continue;
                    }
                    let candidate = (self.points[j].distance_squared(&center), j);
                    let pos = best.partition_point(|&other| other < candidate);
                    if pos < k {
                        best.insert(pos, candidate);
                        best.truncate(k);
                    }
                }
            });

            if best.len() == k {
                let bound = ring as f64 * self.cell_size;
                if best[k - 1].0 <= bound * bound {
                    break;
                }
            }
        }

        best.into_iter().map(|(_, j)| j).collect()
    }

    /// Call `f` for each in-bounds grid cell at Chebyshev distance `ring`.
    fn for_ring(&self, cx: usize, cy: usize, ring: usize, mut f: impl FnMut(usize, usize)) {
        let (cx, cy, r) = (cx as i64, cy as i64, ring as i64);
        let in_bounds = |x: i64, y: i64| {
            x >= 0 && y >= 0 && (x as usize) < self.cols && (y as usize) < self.rows
        };
        if r == 0 {
            f(cx as usize, cy as usize);
            return;
        }
        for x in cx - r..=cx + r {
            for y in [cy - r, cy + r] {
                if in_bounds(x, y) {
                    f(x as usize, y as usize);
                }
            }
        }
        for y in cy - r + 1..=cy + r - 1 {
            for x in [cx - r, cx + r] {
                if in_bounds(x, y) {
                    f(x as usize, y as usize);
                }
            }
        }
    }
}

fn bounds(points: &[Point]) -> (Point, Point) {
    if points.is_empty() {
        return (Point::new(0.0, 0.0), Point::new(0.0, 0.0));
    }
    points.iter().fold(
        (
            Point::new(f64::INFINITY, f64::INFINITY),
            Point::new(f64::NEG_INFINITY, f64::NEG_INFINITY),
        ),
        |(min, max), p| {
            (
                Point::new(min.x.min(p.x), min.y.min(p.y)),
                Point::new(max.x.max(p.x), max.y.max(p.y)),
            )
        },
    )
}
