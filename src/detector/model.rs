//! Anomaly model artifact.
//!
//! An isolation-forest ensemble plus per-feature standardisation, loaded
//! once at startup from a versioned JSON artifact. Scoring returns
//! `offset - 2^(-E[h(x)] / c(max_samples))`, so more negative means more
//! anomalous and the configured threshold slices the same scale the
//! training pipeline produced.

use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::error::PipelineError;
use crate::schemas::anomalies::{FeatureVector, FEATURE_COUNT};

/// Artifact versions this scorer understands.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

const EULER_MASCHERONI: f64 = 0.577_215_664_901_532_9;

/// Standard deviations at or below this are treated as 1 to keep constant
/// features from exploding the standardised input.
const STD_FLOOR: f64 = 1e-9;

/// Per-feature standardisation fitted at training time.
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureScaler {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl FeatureScaler {
    fn transform(&self, raw: &[f64; FEATURE_COUNT]) -> [f64; FEATURE_COUNT] {
        let mut scaled = [0.0; FEATURE_COUNT];
        for (i, value) in raw.iter().enumerate() {
            let std = if self.std[i] <= STD_FLOOR { 1.0 } else { self.std[i] };
            scaled[i] = (value - self.mean[i]) / std;
        }
        scaled
    }
}

/// One node of an isolation tree, array-encoded: children refer to later
/// indices in the node list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct IsolationTree {
    pub nodes: Vec<TreeNode>,
}

impl IsolationTree {
    /// Depth of the standardised point, with the usual `c(size)` adjustment
    /// for leaves that still hold more than one training sample.
    fn path_length(&self, x: &[f64; FEATURE_COUNT]) -> f64 {
        let mut index = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[index] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    depth += 1.0;
                    index = if x[*feature] < *threshold { *left } else { *right };
                }
                TreeNode::Leaf { size } => {
                    return depth + average_path_length(*size);
                }
            }
        }
    }
}

/// The loaded artifact. Validated on load; scoring cannot panic afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct IsolationForest {
    pub format_version: u32,
    pub feature_names: Vec<String>,
    pub scaler: FeatureScaler,
    /// Shift applied to the ensemble score; trained artifacts carry the
    /// offset their threshold was calibrated against.
    #[serde(default = "default_offset")]
    pub offset: f64,
    pub trees: Vec<IsolationTree>,
    /// Sub-sample size used at training time; normalises path lengths.
    pub max_samples: usize,
}

fn default_offset() -> f64 {
    0.5
}

impl IsolationForest {
    /// Load and validate the artifact. Any failure here is fatal at startup
    /// (exit code 5).
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read(path).map_err(|e| {
            PipelineError::Model(format!("cannot read artifact {}: {e}", path.display()))
        })?;
        let forest = Self::from_slice(&raw)?;
        info!(
            path = %path.display(),
            trees = forest.trees.len(),
            max_samples = forest.max_samples,
            "Model artifact loaded"
        );
        Ok(forest)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, PipelineError> {
        let forest: IsolationForest = serde_json::from_slice(bytes)
            .map_err(|e| PipelineError::Model(format!("malformed artifact: {e}")))?;
        forest.validate()?;
        Ok(forest)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(PipelineError::Model(format!(
                "unsupported artifact format version {} (supported: {ARTIFACT_FORMAT_VERSION})",
                self.format_version
            )));
        }

        if self.feature_names.len() != FEATURE_COUNT {
            return Err(PipelineError::Model(format!(
                "artifact lists {} features, scorer expects {FEATURE_COUNT}",
                self.feature_names.len()
            )));
        }
        let expected = FeatureVector::names();
        for (i, name) in self.feature_names.iter().enumerate() {
            if name != expected[i] {
                return Err(PipelineError::Model(format!(
                    "feature {i} is {name:?}, scorer expects {:?}",
                    expected[i]
                )));
            }
        }

        if self.scaler.mean.len() != FEATURE_COUNT || self.scaler.std.len() != FEATURE_COUNT {
            return Err(PipelineError::Model(
                "scaler mean/std must both be 12-wide".to_string(),
            ));
        }

        if self.trees.is_empty() {
            return Err(PipelineError::Model("artifact carries no trees".to_string()));
        }
        if self.max_samples < 2 {
            return Err(PipelineError::Model(
                "max_samples must be at least 2".to_string(),
            ));
        }

        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(PipelineError::Model(format!("tree {t} is empty")));
            }
            for (i, node) in tree.nodes.iter().enumerate() {
                if let TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } = node
                {
                    if *feature >= FEATURE_COUNT {
                        return Err(PipelineError::Model(format!(
                            "tree {t} node {i} splits on unknown feature {feature}"
                        )));
                    }
                    // Children must point forward so traversal terminates.
                    if *left <= i || *right <= i || *left >= tree.nodes.len() || *right >= tree.nodes.len()
                    {
                        return Err(PipelineError::Model(format!(
                            "tree {t} node {i} has out-of-order children"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Score one feature vector; more negative = more anomalous.
    pub fn score(&self, features: &FeatureVector) -> Result<f64, PipelineError> {
        let raw = features.as_array();
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::Model(
                "feature vector contains non-finite values".to_string(),
            ));
        }

        let x = self.scaler.transform(&raw);
        let total: f64 = self.trees.iter().map(|tree| tree.path_length(&x)).sum();
        let mean_depth = total / self.trees.len() as f64;
        let anomaly = (2.0f64).powf(-mean_depth / average_path_length(self.max_samples));

        Ok(self.offset - anomaly)
    }
}

/// Expected path length of an unsuccessful BST search over `n` samples:
/// `c(n) = 2 H(n-1) - 2 (n-1) / n`.
pub fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + EULER_MASCHERONI) - 2.0 * (n - 1.0) / n
}
