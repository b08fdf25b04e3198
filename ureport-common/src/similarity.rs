use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.8;
pub const DEFAULT_SIMILARITY_FRAMES: usize = 10;

/// Scores how alike two normalized backtraces (innermost frame first) are, in `[0, 1]`.
pub trait SimilarityPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn threshold(&self) -> f64;

    fn score(&self, a: &[String], b: &[String]) -> f64;

    /// The score, when it is high enough to call the two backtraces the same bug.
    fn matches(&self, a: &[String], b: &[String]) -> Option<f64> {
        let score = self.score(a, b);
        // 8/10 must clear a 0.8 threshold whatever the float rounding
        (score + 1e-9 >= self.threshold()).then_some(score)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarityAlgorithm {
    Lcs,
    Prefix,
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownAlgorithm(pub String);

impl fmt::Display for UnknownAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown similarity algorithm {:?}", self.0)
    }
}

impl FromStr for SimilarityAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lcs" => Ok(SimilarityAlgorithm::Lcs),
            "prefix" => Ok(SimilarityAlgorithm::Prefix),
            other => Err(UnknownAlgorithm(other.to_owned())),
        }
    }
}

pub fn build_policy(
    algorithm: SimilarityAlgorithm,
    frames: usize,
    threshold: f64,
) -> Arc<dyn SimilarityPolicy> {
    match algorithm {
        SimilarityAlgorithm::Lcs => Arc::new(LcsSimilarity::new(frames, threshold)),
        SimilarityAlgorithm::Prefix => Arc::new(PrefixSimilarity::new(frames, threshold)),
    }
}

fn top(frames: &[String], n: usize) -> &[String] {
    &frames[..frames.len().min(n)]
}

/// Longest common subsequence of the top frames over the longer of the two.
#[derive(Debug, Clone, Copy)]
pub struct LcsSimilarity {
    frames: usize,
    threshold: f64,
}

impl LcsSimilarity {
    pub fn new(frames: usize, threshold: f64) -> Self {
        Self {
            frames: frames.max(1),
            threshold,
        }
    }
}

impl Default for LcsSimilarity {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_FRAMES, DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl SimilarityPolicy for LcsSimilarity {
    fn name(&self) -> &'static str {
        "lcs"
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn score(&self, a: &[String], b: &[String]) -> f64 {
        let (a, b) = (top(a, self.frames), top(b, self.frames));
        let longest = a.len().max(b.len());
        if longest == 0 {
            return 0.0;
        }

        // Single row DP, the inputs are tiny
        let mut row = vec![0usize; b.len() + 1];
        for x in a {
            let mut diagonal = 0;
            for (j, y) in b.iter().enumerate() {
                let above = row[j + 1];
                row[j + 1] = if x == y {
                    diagonal + 1
                } else {
                    above.max(row[j])
                };
                diagonal = above;
            }
        }

        row[b.len()] as f64 / longest as f64
    }
}

/// Length of the shared innermost run of frames over the longer of the two.
#[derive(Debug, Clone, Copy)]
pub struct PrefixSimilarity {
    frames: usize,
    threshold: f64,
}

impl PrefixSimilarity {
    pub fn new(frames: usize, threshold: f64) -> Self {
        Self {
            frames: frames.max(1),
            threshold,
        }
    }
}

impl SimilarityPolicy for PrefixSimilarity {
    fn name(&self) -> &'static str {
        "prefix"
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn score(&self, a: &[String], b: &[String]) -> f64 {
        let (a, b) = (top(a, self.frames), top(b, self.frames));
        let longest = a.len().max(b.len());
        if longest == 0 {
            return 0.0;
        }
        let shared = a.iter().zip(b).take_while(|(x, y)| x == y).count();
        shared as f64 / longest as f64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frames(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| format!("{n} @ /usr/bin/foo")).collect()
    }

    #[test]
    fn test_lcs_score() {
        let policy = LcsSimilarity::default();
        let a = frames(&["a", "b", "c", "d"]);

        assert_eq!(policy.score(&a, &a), 1.0);
        assert_eq!(policy.score(&a, &frames(&["a", "x", "c", "d"])), 0.75);
        assert_eq!(policy.score(&a, &frames(&["b", "c", "d"])), 0.75);
        assert_eq!(policy.score(&a, &frames(&["w", "x", "y", "z"])), 0.0);
        assert_eq!(policy.score(&[], &[]), 0.0);
    }

    #[test]
    fn test_lcs_threshold_edges() {
        let policy = LcsSimilarity::default();
        let base = frames(&["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"]);

        let eight_shared = frames(&["0", "1", "2", "3", "4", "5", "6", "7", "x", "y"]);
        let score = policy.matches(&base, &eight_shared);
        assert!(score.is_some());

        let three_shared = frames(&["0", "1", "2", "p", "q", "r", "s", "t", "u", "v"]);
        assert!(policy.matches(&base, &three_shared).is_none());
    }

    #[test]
    fn test_lcs_only_compares_top_frames() {
        let policy = LcsSimilarity::new(3, 0.8);
        let a = frames(&["a", "b", "c", "d", "e"]);
        let b = frames(&["a", "b", "c", "x", "y"]);
        assert_eq!(policy.score(&a, &b), 1.0);
    }

    #[test]
    fn test_prefix_score() {
        let policy = PrefixSimilarity::new(10, 0.5);
        let a = frames(&["a", "b", "c", "d"]);

        assert_eq!(policy.score(&a, &frames(&["a", "b", "x", "d"])), 0.5);
        // a shifted stack shares nothing from the top
        assert_eq!(policy.score(&a, &frames(&["b", "c", "d"])), 0.0);
        assert!(policy.matches(&a, &frames(&["a", "b", "q"])).is_some());
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("lcs".parse::<SimilarityAlgorithm>(), Ok(SimilarityAlgorithm::Lcs));
        assert_eq!("PREFIX".parse::<SimilarityAlgorithm>(), Ok(SimilarityAlgorithm::Prefix));
        assert!("jaccard".parse::<SimilarityAlgorithm>().is_err());

        let policy = build_policy(SimilarityAlgorithm::Prefix, 5, 0.5);
        assert_eq!(policy.name(), "prefix");
        assert_eq!(policy.threshold(), 0.5);
    }
}
