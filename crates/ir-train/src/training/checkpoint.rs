//! Checkpoint persistence for retrieval models.
//!
//! Dual encoders are stored per tower: the document encoder at the checkpoint
//! root and, when weights are not shared, the query encoder under `query/`.
//! Other models are stored as a single record. Restores are non-strict:
//! parameters that do not match the current architecture produce warnings and
//! keep their freshly initialized values.

use std::path::{Path, PathBuf};

use burn::module::{ModuleMapper, ModuleVisitor, ParamId};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::model::cross_encoder::CrossEncoder;
use crate::model::dual_encoder::DualEncoder;

/// Weights file stem; the recorder appends `.mpk`.
pub const WEIGHTS_NAME: &str = "model";
/// Subdirectory holding a separately trained query encoder.
pub const QUERY_SUBDIR: &str = "query";
/// Tokenizer artifact copied next to the weights.
pub const TOKENIZER_NAME: &str = "tokenizer.json";

const WEIGHTS_EXTENSION: &str = "mpk";

/// How a model's weights are laid out on disk. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointLayout {
    /// The whole module as one record at the root.
    Whole,
    /// Each sub-encoder saved separately (document at root, query in `query/`).
    #[default]
    PerEncoder,
}

/// What a restore loaded and what it had to skip.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Log every mismatch collected during the restore.
    pub fn issue_warnings(&self) {
        for warning in &self.warnings {
            tracing::warn!("{warning}");
        }
    }
}

/// A model that knows how to persist and restore its own weights.
pub trait CheckpointModel<B: Backend>: Module<B> {
    fn save_weights(&self, dir: &Path) -> Result<()>;

    /// Restore weights from `dir`. Fails only when a required weights file
    /// is missing; mismatches are reported in the [`LoadReport`].
    fn load_weights(self, dir: &Path, device: &B::Device) -> Result<(Self, LoadReport)>;
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Path of the weights file in `dir`, with extension.
pub fn weights_file(dir: &Path) -> PathBuf {
    dir.join(WEIGHTS_NAME).with_extension(WEIGHTS_EXTENSION)
}

/// Save a module as a single record in `dir`.
pub fn save_module<B: Backend, M: Module<B>>(module: &M, dir: &Path) -> Result<()> {
    let path = dir.join(WEIGHTS_NAME);
    module
        .clone()
        .save_file(path.clone(), &recorder())
        .map_err(|e| TrainError::Record {
            path,
            message: e.to_string(),
        })
}

/// Float parameter values in visit order.
#[derive(Default)]
struct ParamCollector {
    params: Vec<TensorData>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.params.push(tensor.to_data());
    }
}

fn collect_params<B: Backend, M: Module<B>>(module: &M) -> Vec<TensorData> {
    let mut collector = ParamCollector::default();
    module.visit(&mut collector);
    collector.params
}

/// Copies stored parameters into an initialized module, skipping any whose
/// shape differs.
struct ParamMerger {
    stored: Vec<TensorData>,
    index: usize,
    skipped: Vec<(usize, Vec<usize>, Vec<usize>)>,
}

impl<B: Backend> ModuleMapper<B> for ParamMerger {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let index = self.index;
        self.index += 1;
        let Some(data) = self.stored.get(index) else {
            return tensor;
        };
        let expected = tensor.dims();
        if data.shape != expected {
            self.skipped.push((index, data.shape.clone(), expected.to_vec()));
            return tensor;
        }
        let require_grad = tensor.is_require_grad();
        Tensor::from_data(data.clone(), &tensor.device()).set_require_grad(require_grad)
    }
}

/// Load a single-record module from `dir` without failing on mismatches.
///
/// Parameters whose stored shape differs from the model's keep their
/// initialized values. A record that does not deserialize into the module,
/// or whose parameter count differs, leaves the whole module initialized.
pub fn load_module<B: Backend, M: Module<B>>(
    module: M,
    dir: &Path,
    device: &B::Device,
    report: &mut LoadReport,
) -> Result<M> {
    let file = weights_file(dir);
    if !file.exists() {
        return Err(TrainError::MissingWeights(file));
    }

    let loaded = match module.clone().load_file(dir.join(WEIGHTS_NAME), &recorder(), device) {
        Ok(loaded) => loaded,
        Err(e) => {
            report.warnings.push(format!(
                "{}: weights do not match the model ({e}); keeping initialized weights",
                file.display()
            ));
            return Ok(module);
        }
    };

    let stored = collect_params(&loaded);
    let expected = collect_params(&module);
    if stored.len() != expected.len() {
        report.warnings.push(format!(
            "{}: checkpoint holds {} parameter tensors, model expects {}; keeping initialized weights",
            file.display(),
            stored.len(),
            expected.len()
        ));
        return Ok(module);
    }
    if stored.iter().zip(&expected).all(|(s, e)| s.shape == e.shape) {
        report.loaded.push(file);
        return Ok(loaded);
    }

    let mut merger = ParamMerger {
        stored,
        index: 0,
        skipped: Vec::new(),
    };
    let merged = module.map(&mut merger);
    for (index, stored_shape, expected_shape) in &merger.skipped {
        report.warnings.push(format!(
            "{}: parameter #{index} is {stored_shape:?} in the checkpoint, model expects {expected_shape:?}; keeping initialized values",
            file.display()
        ));
    }
    report.loaded.push(file);
    Ok(merged)
}

impl<B: Backend> CheckpointModel<B> for DualEncoder<B> {
    fn save_weights(&self, dir: &Path) -> Result<()> {
        match self.layout() {
            CheckpointLayout::Whole => save_module(self, dir),
            CheckpointLayout::PerEncoder => {
                save_module(&self.doc_encoder, dir)?;
                if let Some(query_encoder) = &self.query_encoder {
                    let query_dir = dir.join(QUERY_SUBDIR);
                    std::fs::create_dir_all(&query_dir)?;
                    save_module(query_encoder, &query_dir)?;
                }
                Ok(())
            }
        }
    }

    fn load_weights(self, dir: &Path, device: &B::Device) -> Result<(Self, LoadReport)> {
        let mut report = LoadReport::default();
        if self.layout() == CheckpointLayout::Whole {
            let model = load_module(self, dir, device, &mut report)?;
            return Ok((model, report));
        }

        let DualEncoder {
            doc_encoder,
            query_encoder,
            per_encoder_checkpoint,
        } = self;

        let doc_encoder = load_module(doc_encoder, dir, device, &mut report)?;
        // Shared towers need nothing more: the query path is the document encoder.
        let query_encoder = match query_encoder {
            Some(q) => Some(load_module(q, &dir.join(QUERY_SUBDIR), device, &mut report)?),
            None => None,
        };

        let model = DualEncoder {
            doc_encoder,
            query_encoder,
            per_encoder_checkpoint,
        };
        Ok((model, report))
    }
}

impl<B: Backend> CheckpointModel<B> for CrossEncoder<B> {
    fn save_weights(&self, dir: &Path) -> Result<()> {
        save_module(self, dir)
    }

    fn load_weights(self, dir: &Path, device: &B::Device) -> Result<(Self, LoadReport)> {
        let mut report = LoadReport::default();
        let model = load_module(self, dir, device, &mut report)?;
        Ok((model, report))
    }
}

/// Save model weights and the tokenizer artifact into `dir`.
pub fn save_checkpoint<B: Backend, M: CheckpointModel<B>>(
    model: &M,
    dir: &Path,
    tokenizer: Option<&Path>,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    tracing::info!(dir = %dir.display(), "Saving model checkpoint");
    model.save_weights(dir)?;
    if let Some(tokenizer) = tokenizer {
        std::fs::copy(tokenizer, dir.join(TOKENIZER_NAME))?;
    }
    Ok(())
}

/// Restore model weights from `dir`, logging any mismatch warnings.
pub fn load_checkpoint<B: Backend, M: CheckpointModel<B>>(
    model: M,
    dir: &Path,
    device: &B::Device,
) -> Result<M> {
    let (model, report) = model.load_weights(dir, device)?;
    report.issue_warnings();
    tracing::info!(
        dir = %dir.display(),
        files = report.loaded.len(),
        warnings = report.warnings.len(),
        "Restored model checkpoint"
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;
    use tempfile::TempDir;

    use crate::model::bridge::EncodedInput;
    use crate::model::cross_encoder::CrossEncoderConfig;
    use crate::model::dual_encoder::DualEncoderConfig;
    use crate::model::encoder::RepresentationHeadConfig;
    use crate::model::DualEncoderModel;

    type TestBackend = NdArray<f32>;

    fn dual_config(shared: bool) -> DualEncoderConfig {
        DualEncoderConfig::new(RepresentationHeadConfig::new(6, 12).with_dropout(0.0))
            .with_shared_weights(shared)
    }

    fn input() -> EncodedInput<TestBackend> {
        let device = Default::default();
        EncodedInput::new(
            Tensor::random([3, 4, 6], Distribution::Normal(0.0, 1.0), &device),
            Tensor::ones([3, 4], &device),
        )
    }

    fn max_abs_diff(a: Tensor<TestBackend, 2>, b: Tensor<TestBackend, 2>) -> f32 {
        (a - b).abs().max().into_scalar().elem()
    }

    #[test]
    fn test_per_encoder_layout_on_disk() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();

        let separate = dual_config(false).init::<TestBackend>(&device);
        save_checkpoint(&separate, dir.path(), None).unwrap();
        assert!(weights_file(dir.path()).exists());
        assert!(weights_file(&dir.path().join(QUERY_SUBDIR)).exists());

        let shared_dir = TempDir::new().unwrap();
        let shared = dual_config(true).init::<TestBackend>(&device);
        save_checkpoint(&shared, shared_dir.path(), None).unwrap();
        assert!(weights_file(shared_dir.path()).exists());
        assert!(!shared_dir.path().join(QUERY_SUBDIR).exists());
    }

    #[test]
    fn test_shared_restore_aliases_query_to_doc() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();

        let trained = dual_config(true).init::<TestBackend>(&device);
        save_checkpoint(&trained, dir.path(), None).unwrap();

        let restored = load_checkpoint(dual_config(true).init::<TestBackend>(&device), dir.path(), &device)
            .unwrap();
        assert!(restored.shared_weights());

        let x = input();
        let q = restored.encode_queries(x.clone());
        let d = restored.encode_docs(x.clone());
        assert_eq!(max_abs_diff(q, d.clone()), 0.0);

        let original = trained.encode_docs(x);
        assert!(max_abs_diff(original, d) < 1e-6, "restored weights differ from saved");
    }

    #[test]
    fn test_separate_restore_reads_query_subdir() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();

        let trained = dual_config(false).init::<TestBackend>(&device);
        save_checkpoint(&trained, dir.path(), None).unwrap();

        let (restored, report) = dual_config(false)
            .init::<TestBackend>(&device)
            .load_weights(dir.path(), &device)
            .unwrap();
        assert!(report.is_clean(), "{:?}", report.warnings);
        assert_eq!(report.loaded.len(), 2);

        let x = input();
        assert!(max_abs_diff(trained.encode_queries(x.clone()), restored.encode_queries(x.clone())) < 1e-6);
        assert!(max_abs_diff(trained.encode_docs(x.clone()), restored.encode_docs(x)) < 1e-6);
    }

    #[test]
    fn test_whole_layout_round_trip() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let config = dual_config(false).with_layout(CheckpointLayout::Whole);

        let trained = config.init::<TestBackend>(&device);
        save_checkpoint(&trained, dir.path(), None).unwrap();
        assert!(!dir.path().join(QUERY_SUBDIR).exists());

        let (restored, report) = config
            .init::<TestBackend>(&device)
            .load_weights(dir.path(), &device)
            .unwrap();
        assert!(report.is_clean());
        let x = input();
        assert!(max_abs_diff(trained.encode_queries(x.clone()), restored.encode_queries(x)) < 1e-6);
    }

    #[test]
    fn test_mismatched_weights_warn_instead_of_failing() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();

        // A cross-encoder record has none of the representation head's fields.
        let other = CrossEncoderConfig::new(6).init::<TestBackend>(&device);
        save_checkpoint(&other, dir.path(), None).unwrap();

        let (_model, report) = dual_config(true)
            .init::<TestBackend>(&device)
            .load_weights(dir.path(), &device)
            .unwrap();
        assert!(!report.is_clean(), "a mismatch should be reported");
    }

    #[test]
    fn test_missing_weights_is_an_error() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let err = dual_config(true)
            .init::<TestBackend>(&device)
            .load_weights(dir.path(), &device)
            .unwrap_err();
        assert!(matches!(err, TrainError::MissingWeights(_)), "got {err}");
    }

    #[test]
    fn test_tokenizer_artifact_copied() {
        let dir = TempDir::new().unwrap();
        let tok_dir = TempDir::new().unwrap();
        let tokenizer = tok_dir.path().join("vocab.json");
        std::fs::write(&tokenizer, "{\"model\":\"wordpiece\"}").unwrap();

        let device = Default::default();
        let model = CrossEncoderConfig::new(6).init::<TestBackend>(&device);
        save_checkpoint(&model, dir.path(), Some(&tokenizer)).unwrap();

        let copied = std::fs::read_to_string(dir.path().join(TOKENIZER_NAME)).unwrap();
        assert!(copied.contains("wordpiece"));
    }

    #[test]
    fn test_resized_head_keeps_initialized_projection() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();

        let trained = dual_config(false).init::<TestBackend>(&device);
        save_checkpoint(&trained, dir.path(), None).unwrap();

        let wider = DualEncoderConfig::new(RepresentationHeadConfig::new(6, 16).with_dropout(0.0))
            .with_shared_weights(false);
        let fresh = wider.init::<TestBackend>(&device);
        let fresh_params = collect_params(&fresh);
        let (restored, report) = fresh.load_weights(dir.path(), &device).unwrap();

        // Projection weight and bias in each tower.
        assert_eq!(report.warnings.len(), 4, "{:?}", report.warnings);
        assert!(report.warnings[0].contains("[6, 12]"), "{}", report.warnings[0]);

        let (q, d) = restored.encode(input(), input()).unwrap();
        assert_eq!(q.dims(), [3, 1, 16]);
        assert_eq!(d.dims(), [3, 1, 16]);

        // Transform weights come from the checkpoint; the projection stays initialized.
        let trained_params = collect_params(&trained.doc_encoder);
        let restored_params = collect_params(&restored.doc_encoder);
        assert_eq!(restored_params[0], trained_params[0]);
        assert_eq!(restored_params[1], trained_params[1]);
        assert_eq!(restored_params[2], fresh_params[2]);
        assert_eq!(restored_params[2].shape, vec![6, 16]);
    }
}
