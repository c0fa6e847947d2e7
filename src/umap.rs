//! Parametric UMAP projection of acoustic feature rows.
//!
//! A dataset's `umap/` directory holds the fitted pipeline:
//! - `config`: a pickled dict (protocol 2 or later) of scaler attributes,
//!   `{"feature_names": [...], "center": [...], "scale": [...]}`, each a plain list
//! - `encoder.json`: `{"layers": [{"weights": [[...]], "bias": [...], "activation": "relu"}, ...]}`
//!   with `weights` laid out `[out][in]` and a final layer of width 2.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{Column, StorageError, TableView};

pub const SCALER_FILE: &str = "config";
pub const ENCODER_FILE: &str = "encoder.json";
pub const DEFAULT_BATCH_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("UMAP model file not found: {}", .0.display())]
    Missing(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid model file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid scaler pickle: {0}")]
    Pickle(#[from] serde_pickle::Error),
    #[error("Invalid model: {0}")]
    Invalid(String),
    #[error("Missing feature columns: {}", .0.join(", "))]
    MissingFeatures(Vec<String>),
    #[error("Feature column `{0}` is not numeric")]
    NonNumeric(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Robust-scaler attributes and the column order the encoder expects.
/// The fitted-attribute spellings (`center_`, `scale_`, `feature_names_in_`) are accepted too.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalerConfig {
    #[serde(alias = "feature_names_in_")]
    pub feature_names: Vec<String>,
    #[serde(alias = "center_")]
    pub center: Vec<f64>,
    #[serde(alias = "scale_")]
    pub scale: Vec<f64>,
}

impl ScalerConfig {
    pub fn from_pickle(bytes: &[u8]) -> Result<Self, ModelError> {
        Ok(serde_pickle::from_slice(bytes, serde_pickle::DeOptions::new())?)
    }

    pub fn to_pickle(&self) -> Result<Vec<u8>, ModelError> {
        Ok(serde_pickle::to_vec(self, serde_pickle::SerOptions::new())?)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    fn apply(self, x: f64) -> f64 {
        match self {
            Self::Linear => x,
            Self::Relu => x.max(0.0),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DenseLayer {
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    #[serde(default)]
    pub activation: Activation,
}

#[derive(Deserialize)]
struct EncoderFile {
    layers: Vec<DenseLayer>,
}

/// Scaler followed by a dense encoder mapping one feature row to (x, y).
#[derive(Debug, Clone, PartialEq)]
pub struct UmapModel {
    scaler: ScalerConfig,
    layers: Vec<DenseLayer>,
}

impl UmapModel {
    /// Load `config` and `encoder.json` from a dataset's `umap/` directory.
    pub fn load(dir: &Path) -> Result<Self, ModelError> {
        let scaler = ScalerConfig::from_pickle(&read_model_file(&dir.join(SCALER_FILE))?)?;
        let encoder: EncoderFile = serde_json::from_slice(&read_model_file(&dir.join(ENCODER_FILE))?)?;
        log::info!(
            "Loaded UMAP encoder from {} ({} features, {} layers)",
            dir.display(),
            scaler.feature_names.len(),
            encoder.layers.len()
        );
        Self::new(scaler, encoder.layers)
    }

    pub fn new(scaler: ScalerConfig, layers: Vec<DenseLayer>) -> Result<Self, ModelError> {
        let n = scaler.feature_names.len();
        if scaler.center.len() != n || scaler.scale.len() != n {
            return Err(ModelError::Invalid(format!(
                "scaler has {n} features but {} centers and {} scales",
                scaler.center.len(),
                scaler.scale.len()
            )));
        }
        let mut width = n;
        for (i, layer) in layers.iter().enumerate() {
            if layer.weights.len() != layer.bias.len() {
                return Err(ModelError::Invalid(format!(
                    "layer {i}: {} weight rows but {} biases",
                    layer.weights.len(),
                    layer.bias.len()
                )));
            }
            if let Some(row) = layer.weights.iter().find(|r| r.len() != width) {
                return Err(ModelError::Invalid(format!(
                    "layer {i}: expected {width} inputs, found {}",
                    row.len()
                )));
            }
            width = layer.bias.len();
        }
        if layers.is_empty() || width != 2 {
            return Err(ModelError::Invalid(format!(
                "encoder must end in 2 outputs, ends in {width}"
            )));
        }
        Ok(Self { scaler, layers })
    }

    pub fn feature_names(&self) -> &[String] {
        &self.scaler.feature_names
    }

    /// Scale then encode one row given in `feature_names` order.
    pub fn encode(&self, row: &[f64]) -> [f64; 2] {
        let mut h: Vec<f64> = row
            .iter()
            .zip(&self.scaler.center)
            .zip(&self.scaler.scale)
            .map(|((x, c), s)| (x - c) / if *s == 0.0 { 1.0 } else { *s })
            .collect();
        for layer in &self.layers {
            h = layer
                .weights
                .iter()
                .zip(&layer.bias)
                .map(|(w, b)| {
                    let z: f64 = w.iter().zip(&h).map(|(w, x)| w * x).sum::<f64>() + b;
                    layer.activation.apply(z)
                })
                .collect();
        }
        [h[0], h[1]]
    }

    /// Append `x` and `y` to `rows`. Rows with a null or non-finite feature get null coordinates.
    pub fn project(&self, rows: &TableView, batch_size: usize) -> Result<TableView, ModelError> {
        let missing: Vec<String> = self
            .feature_names()
            .iter()
            .filter(|f| !rows.has_column(f))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ModelError::MissingFeatures(missing));
        }
        let columns = self
            .feature_names()
            .iter()
            .map(|f| {
                let col = rows.column(f)?;
                if col.column_type().is_numeric() {
                    Ok(col)
                } else {
                    Err(ModelError::NonNumeric(f.clone()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let inputs: Vec<Option<Vec<f64>>> = (0..rows.num_rows())
            .map(|i| {
                columns
                    .iter()
                    .map(|c| c.f64_at(i).filter(|x| x.is_finite()))
                    .collect()
            })
            .collect();

        let coords: Vec<Option<[f64; 2]>> = inputs
            .par_chunks(batch_size.max(1))
            .map(|batch| {
                batch
                    .iter()
                    .map(|row| row.as_deref().map(|r| self.encode(r)))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect();

        let x = coords.iter().map(|c| c.map(|c| c[0])).collect();
        let y = coords.iter().map(|c| c.map(|c| c[1])).collect();
        Ok(rows
            .with_column("x", Column::Float64(x))?
            .with_column("y", Column::Float64(y))?)
    }
}

fn read_model_file(path: &Path) -> Result<Vec<u8>, ModelError> {
    if !path.is_file() {
        return Err(ModelError::Missing(path.to_path_buf()));
    }
    Ok(std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> UmapModel {
        UmapModel::new(
            ScalerConfig {
                feature_names: vec!["a".into(), "b".into()],
                center: vec![1.0, 0.0],
                scale: vec![2.0, 0.0],
            },
            vec![DenseLayer {
                weights: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
                bias: vec![0.0, 1.0],
                activation: Activation::Linear,
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_encode_scales_then_applies_layers() {
        // zero scale is treated as one
        assert_eq!(model().encode(&[3.0, 4.0]), [1.0, 5.0]);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let scaler = ScalerConfig {
            feature_names: vec!["a".into()],
            center: vec![0.0],
            scale: vec![1.0],
        };
        let three_out = DenseLayer {
            weights: vec![vec![1.0]; 3],
            bias: vec![0.0; 3],
            activation: Activation::Relu,
        };
        assert!(UmapModel::new(scaler.clone(), vec![three_out]).is_err());
        assert!(UmapModel::new(scaler, vec![]).is_err());
    }

    #[test]
    fn test_project_appends_xy() {
        let rows = TableView::new(vec![
            ("a".into(), Column::Float64(vec![Some(1.0), None, Some(5.0)])),
            ("b".into(), Column::Int64(vec![Some(0), Some(1), Some(2)])),
        ])
        .unwrap();
        let out = model().project(&rows, 1).unwrap();
        assert_eq!(out.num_rows(), 3);
        assert_eq!(out.column("x").unwrap(), &Column::Float64(vec![Some(0.0), None, Some(2.0)]));
        assert_eq!(out.column("y").unwrap().f64_at(2), Some(3.0));
    }

    #[test]
    fn test_project_missing_features() {
        let rows = TableView::new(vec![("a".into(), Column::Float64(vec![Some(1.0)]))]).unwrap();
        match model().project(&rows, 16) {
            Err(ModelError::MissingFeatures(cols)) => assert_eq!(cols, vec!["b"]),
            other => panic!("expected MissingFeatures, got {other:?}"),
        }
    }

    /// `pickle.dumps({"feature_names": ["a"], "center": [0.0], "scale": [1.0]}, protocol=2)`
    /// with the memo opcodes left out.
    const SCALER_PICKLE: &[u8] = b"\x80\x02}(\
X\x0d\x00\x00\x00feature_names]X\x01\x00\x00\x00aa\
X\x06\x00\x00\x00center]G\x00\x00\x00\x00\x00\x00\x00\x00a\
X\x05\x00\x00\x00scale]G\x3f\xf0\x00\x00\x00\x00\x00\x00au.";

    #[test]
    fn test_scaler_from_protocol_2_pickle() {
        let scaler = ScalerConfig::from_pickle(SCALER_PICKLE).unwrap();
        assert_eq!(scaler.feature_names, vec!["a"]);
        assert_eq!(scaler.center, vec![0.0]);
        assert_eq!(scaler.scale, vec![1.0]);
        assert!(matches!(
            ScalerConfig::from_pickle(br#"{"feature_names": []}"#),
            Err(ModelError::Pickle(_))
        ));
    }

    #[test]
    fn test_scaler_accepts_fitted_attribute_names() {
        use serde_pickle::HashableValue as H;
        let mut fitted = std::collections::BTreeMap::new();
        fitted.insert(H::String("feature_names_in_".into()), serde_pickle::Value::List(vec![serde_pickle::Value::String("a".into())]));
        fitted.insert(H::String("center_".into()), serde_pickle::Value::List(vec![serde_pickle::Value::I64(2)]));
        fitted.insert(H::String("scale_".into()), serde_pickle::Value::List(vec![serde_pickle::Value::F64(0.5)]));
        let bytes = serde_pickle::value_to_vec(&serde_pickle::Value::Dict(fitted), serde_pickle::SerOptions::new()).unwrap();
        let scaler = ScalerConfig::from_pickle(&bytes).unwrap();
        assert_eq!(scaler.center, vec![2.0]);
        assert_eq!(scaler.scale, vec![0.5]);
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(UmapModel::load(dir.path()), Err(ModelError::Missing(_))));
        std::fs::write(dir.path().join(SCALER_FILE), SCALER_PICKLE).unwrap();
        std::fs::write(
            dir.path().join(ENCODER_FILE),
            r#"{"layers": [{"weights": [[1.0], [-1.0]], "bias": [0.0, 0.0], "activation": "tanh"}]}"#,
        )
        .unwrap();
        let m = UmapModel::load(dir.path()).unwrap();
        let [x, y] = m.encode(&[0.5]);
        assert!((x - 0.5f64.tanh()).abs() < 1e-12);
        assert!((y + 0.5f64.tanh()).abs() < 1e-12);
    }
}
