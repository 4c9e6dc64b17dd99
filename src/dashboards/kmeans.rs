//! Lloyd's k-means over 2-D points

/// Fitted clustering
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    /// Cluster index of each input point
    pub labels: Vec<usize>,
    /// Cluster centres, indexed by label
    pub centers: Vec<[f64; 2]>,
    /// Iterations until convergence (or the limit)
    pub iterations: usize,
}

/// k-means with deterministic farthest-point seeding
#[derive(Debug, Clone, Copy)]
pub struct KMeans {
    clusters: usize,
    max_iter: usize,
}

impl Default for KMeans {
    fn default() -> Self {
        Self::new(8)
    }
}

fn distance_sq(a: [f64; 2], b: [f64; 2]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx * dx + dy * dy
}

fn nearest(point: [f64; 2], centers: &[[f64; 2]]) -> usize {
    centers
        .iter()
        .enumerate()
        .map(|(i, c)| (i, distance_sq(point, *c)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(i, _)| i)
}

impl KMeans {
    /// `clusters` is raised to at least one
    #[must_use]
    pub fn new(clusters: usize) -> Self {
        Self {
            clusters: clusters.max(1),
            max_iter: 300,
        }
    }

    /// Override the iteration limit
    #[must_use]
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter.max(1);
        self
    }

    /// Requested cluster count
    #[must_use]
    pub fn clusters(&self) -> usize {
        self.clusters
    }

    /// Cluster `points`. The effective cluster count never exceeds the
    /// number of points.
    #[must_use]
    pub fn fit(&self, points: &[[f64; 2]]) -> KMeansFit {
        if points.is_empty() {
            return KMeansFit {
                labels: Vec::new(),
                centers: Vec::new(),
                iterations: 0,
            };
        }

        let k = self.clusters.min(points.len());
        let mut centers = seed(points, k);
        let mut labels: Vec<usize> = points.iter().map(|p| nearest(*p, &centers)).collect();
        let mut iterations = 0;

        while iterations < self.max_iter {
            iterations += 1;

            let mut sums = vec![[0.0_f64; 2]; k];
            let mut counts = vec![0_usize; k];
            for (point, &label) in points.iter().zip(&labels) {
                sums[label][0] += point[0];
                sums[label][1] += point[1];
                counts[label] += 1;
            }
            for ((center, sum), &count) in centers.iter_mut().zip(&sums).zip(&counts) {
                // An emptied cluster keeps its previous centre
                if count > 0 {
                    #[allow(clippy::cast_precision_loss)]
                    let n = count as f64;
                    *center = [sum[0] / n, sum[1] / n];
                }
            }

            let next: Vec<usize> = points.iter().map(|p| nearest(*p, &centers)).collect();
            if next == labels {
                break;
            }
            labels = next;
        }

        KMeansFit {
            labels,
            centers,
            iterations,
        }
    }
}

/// First point, then repeatedly the point farthest from every chosen centre
fn seed(points: &[[f64; 2]], k: usize) -> Vec<[f64; 2]> {
    let mut centers = vec![points[0]];
    let mut closest: Vec<f64> = points.iter().map(|p| distance_sq(*p, points[0])).collect();

    while centers.len() < k {
        let Some((index, _)) = closest
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            break;
        };
        let center = points[index];
        centers.push(center);
        for (d, p) in closest.iter_mut().zip(points) {
            *d = d.min(distance_sq(*p, center));
        }
    }

    centers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> Vec<[f64; 2]> {
        vec![
            [0.0, 0.0],
            [0.2, 0.1],
            [0.1, 0.3],
            [10.0, 10.0],
            [10.2, 9.9],
            [9.8, 10.1],
            [0.0, 10.0],
            [0.3, 9.7],
        ]
    }

    #[test]
    fn separates_well_spaced_groups() {
        let fit = KMeans::new(3).fit(&blobs());
        assert_eq!(fit.centers.len(), 3);
        assert_eq!(fit.labels[0], fit.labels[1]);
        assert_eq!(fit.labels[0], fit.labels[2]);
        assert_eq!(fit.labels[3], fit.labels[4]);
        assert_eq!(fit.labels[3], fit.labels[5]);
        assert_eq!(fit.labels[6], fit.labels[7]);
        assert_ne!(fit.labels[0], fit.labels[3]);
        assert_ne!(fit.labels[0], fit.labels[6]);
        assert_ne!(fit.labels[3], fit.labels[6]);
    }

    #[test]
    fn centers_are_group_means() {
        let fit = KMeans::new(3).fit(&blobs());
        let c = fit.centers[fit.labels[3]];
        assert!((c[0] - 10.0).abs() < 1e-9);
        assert!((c[1] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn cluster_count_is_clamped() {
        assert_eq!(KMeans::new(0).clusters(), 1);
        let fit = KMeans::new(50).fit(&blobs()[..2]);
        assert_eq!(fit.centers.len(), 2);
    }

    #[test]
    fn single_cluster_is_the_mean() {
        let fit = KMeans::new(1).fit(&[[0.0, 0.0], [2.0, 4.0]]);
        assert_eq!(fit.labels, vec![0, 0]);
        assert_eq!(fit.centers, vec![[1.0, 2.0]]);
    }

    #[test]
    fn empty_input_yields_empty_fit() {
        let fit = KMeans::new(3).fit(&[]);
        assert!(fit.labels.is_empty());
        assert!(fit.centers.is_empty());
    }

    #[test]
    fn fitting_is_deterministic() {
        assert_eq!(KMeans::new(3).fit(&blobs()), KMeans::new(3).fit(&blobs()));
    }
}
