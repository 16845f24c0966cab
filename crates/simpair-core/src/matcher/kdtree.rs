use super::{descriptors, KnnPair, MatcherBackend};
use crate::catalog::ItemRecord;
use crate::error::Error;
use crate::extract::Descriptor;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

const LEAF_SIZE: usize = 8;

enum Node {
    Leaf {
        start: usize,
        end: usize,
    },
    Split {
        dim: usize,
        value: f32,
        left: usize,
        right: usize,
    },
}

/// Kd-tree over the rows of one descriptor. Splits on the dimension of largest
/// spread at the median; ties in ordering are broken by row index so the tree
/// (and every search over it) is fully deterministic.
pub struct KdTree<'a> {
    descriptor: &'a Descriptor,
    order: Vec<usize>,
    nodes: Vec<Node>,
}

/// Pending branch in the best-bin-first search, ordered so the max-heap pops
/// the smallest lower bound first.
struct Branch {
    bound: f32,
    node: usize,
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Branch {}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Branch {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .bound
            .total_cmp(&self.bound)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl<'a> KdTree<'a> {
    pub fn build(descriptor: &'a Descriptor) -> Self {
        let mut tree = Self {
            descriptor,
            order: (0..descriptor.rows()).collect(),
            nodes: Vec::new(),
        };
        if !tree.order.is_empty() {
            tree.build_node(0, tree.order.len());
        }
        tree
    }

    fn build_node(&mut self, start: usize, end: usize) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { start, end });
        if end - start <= LEAF_SIZE {
            return id;
        }

        let dim = self.widest_dimension(start, end);
        let descriptor = self.descriptor;
        let (dim, spread) = match dim {
            Some(found) => found,
            None => return id,
        };
        if spread <= 0.0 {
            return id;
        }

        self.order[start..end].sort_by(|&a, &b| {
            descriptor.row(a)[dim]
                .total_cmp(&descriptor.row(b)[dim])
                .then(a.cmp(&b))
        });
        let mid = start + (end - start) / 2;
        let value = descriptor.row(self.order[mid])[dim];

        let left = self.build_node(start, mid);
        let right = self.build_node(mid, end);
        self.nodes[id] = Node::Split {
            dim,
            value,
            left,
            right,
        };
        id
    }

    fn widest_dimension(&self, start: usize, end: usize) -> Option<(usize, f32)> {
        let dims = self.descriptor.dims();
        let mut best: Option<(usize, f32)> = None;
        for dim in 0..dims {
            let mut lo = f32::INFINITY;
            let mut hi = f32::NEG_INFINITY;
            for &row in &self.order[start..end] {
                let v = self.descriptor.row(row)[dim];
                lo = lo.min(v);
                hi = hi.max(v);
            }
            let spread = hi - lo;
            if best.map_or(true, |(_, s)| spread > s) {
                best = Some((dim, spread));
            }
        }
        best
    }

    /// Two nearest rows to `query` (Euclidean distance), visiting at most
    /// `max_checks` leaves once two neighbours are known. `None` when the tree
    /// holds fewer than two rows.
    pub fn knn2(&self, query: &[f32], max_checks: usize) -> Option<KnnPair> {
        if self.order.len() < 2 {
            return None;
        }

        // (squared distance, row) for the nearest and second nearest.
        let mut found = [(f32::INFINITY, usize::MAX); 2];
        let mut heap = BinaryHeap::new();
        heap.push(Branch { bound: 0.0, node: 0 });
        let mut checks = 0usize;

        while let Some(branch) = heap.pop() {
            if branch.bound >= found[1].0 {
                break;
            }
            if checks >= max_checks && found[1].1 != usize::MAX {
                break;
            }

            let mut node = branch.node;
            loop {
                match self.nodes[node] {
                    Node::Split {
                        dim,
                        value,
                        left,
                        right,
                    } => {
                        let diff = query[dim] - value;
                        let (near, far) = if diff < 0.0 { (left, right) } else { (right, left) };
                        heap.push(Branch {
                            bound: branch.bound.max(diff * diff),
                            node: far,
                        });
                        node = near;
                    }
                    Node::Leaf { start, end } => {
                        for &row in &self.order[start..end] {
                            let dist = squared_distance(query, self.descriptor.row(row));
                            insert_neighbour(&mut found, dist, row);
                        }
                        checks += 1;
                        break;
                    }
                }
            }
        }

        Some(KnnPair {
            best: found[0].0.sqrt(),
            second: found[1].0.sqrt(),
        })
    }
}

pub(crate) fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Keep the two closest rows; equal distances prefer the lower row index.
pub(crate) fn insert_neighbour(found: &mut [(f32, usize); 2], dist: f32, row: usize) {
    let closer = |d: f32, r: usize, slot: (f32, usize)| d < slot.0 || (d == slot.0 && r < slot.1);
    if closer(dist, row, found[0]) {
        found[1] = found[0];
        found[0] = (dist, row);
    } else if closer(dist, row, found[1]) {
        found[1] = (dist, row);
    }
}

/// CPU matcher: approximate k=2 search of every left row against a kd-tree
/// built over the right descriptor.
pub struct CpuBackend {
    checks: usize,
}

impl CpuBackend {
    pub fn new(checks: usize) -> Self {
        Self { checks: checks.max(1) }
    }
}

impl MatcherBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu-kdtree"
    }

    fn knn_match(&self, left: &ItemRecord, right: &ItemRecord) -> Result<Vec<KnnPair>, Error> {
        let (query, train) = descriptors(left, right)?;
        let tree = KdTree::build(train);
        Ok((0..query.rows())
            .filter_map(|row| tree.knn2(query.row(row), self.checks))
            .collect())
    }
}
