//! Inter-node network delay sources.

/// Provides the network delay between two nodes, in milliseconds.
pub trait DelaySource: Send + Sync {
    fn delay_ms(&self, from: &str, to: &str) -> i64;

    /// Square delay matrix over `nodes`, with zero on the diagonal.
    fn matrix(&self, nodes: &[String]) -> Vec<Vec<i64>> {
        nodes
            .iter()
            .map(|from| {
                nodes
                    .iter()
                    .map(|to| if from == to { 0 } else { self.delay_ms(from, to) })
                    .collect()
            })
            .collect()
    }
}

/// Placeholder used until a measured delay source is wired in.
#[derive(Debug, Clone, Copy)]
pub struct ConstantDelay(pub i64);

impl DelaySource for ConstantDelay {
    fn delay_ms(&self, _from: &str, _to: &str) -> i64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_has_zero_diagonal() {
        let nodes = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let m = ConstantDelay(7).matrix(&nodes);
        assert_eq!(m, vec![vec![0, 7, 7], vec![7, 0, 7], vec![7, 7, 0]]);
    }

    #[test]
    fn empty_node_list() {
        assert!(ConstantDelay(1).matrix(&[]).is_empty());
    }
}
