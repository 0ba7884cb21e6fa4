use burn::prelude::*;

use crate::error::TrainError;
use crate::model::bridge::EncodedInput;
use crate::model::encoder::{RepresentationHead, RepresentationHeadConfig};
use crate::model::DualEncoderModel;
use crate::training::checkpoint::CheckpointLayout;

/// Configuration for a two-tower [`DualEncoder`].
#[derive(Config, Debug)]
pub struct DualEncoderConfig {
    /// Head configuration used for both towers.
    pub encoder: RepresentationHeadConfig,
    /// Whether the query tower reuses the document tower's weights.
    #[config(default = true)]
    pub shared_weights: bool,
    /// How weights are laid out on disk.
    #[config(default = "CheckpointLayout::PerEncoder")]
    pub layout: CheckpointLayout,
}

/// Query and document encoders trained jointly.
///
/// When weights are shared there is a single tower: `query_encoder` is
/// `None` and queries go through `doc_encoder`.
#[derive(Module, Debug)]
pub struct DualEncoder<B: Backend> {
    pub(crate) doc_encoder: RepresentationHead<B>,
    pub(crate) query_encoder: Option<RepresentationHead<B>>,
    pub(crate) per_encoder_checkpoint: bool,
}

impl DualEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DualEncoder<B> {
        let query_encoder = if self.shared_weights {
            None
        } else {
            Some(self.encoder.init(device))
        };
        DualEncoder {
            doc_encoder: self.encoder.init(device),
            query_encoder,
            per_encoder_checkpoint: self.layout == CheckpointLayout::PerEncoder,
        }
    }
}

impl<B: Backend> DualEncoder<B> {
    pub fn doc_encoder(&self) -> &RepresentationHead<B> {
        &self.doc_encoder
    }

    /// The query tower; the document tower when weights are shared.
    pub fn query_encoder(&self) -> &RepresentationHead<B> {
        self.query_encoder.as_ref().unwrap_or(&self.doc_encoder)
    }

    pub fn shared_weights(&self) -> bool {
        self.query_encoder.is_none()
    }

    pub fn layout(&self) -> CheckpointLayout {
        if self.per_encoder_checkpoint {
            CheckpointLayout::PerEncoder
        } else {
            CheckpointLayout::Whole
        }
    }

    /// `(rows, dim)` query representations.
    pub fn encode_queries(&self, queries: EncodedInput<B>) -> Tensor<B, 2> {
        self.query_encoder().forward(queries)
    }

    /// `(rows, dim)` document representations.
    pub fn encode_docs(&self, docs: EncodedInput<B>) -> Tensor<B, 2> {
        self.doc_encoder.forward(docs)
    }
}

impl<B: Backend> DualEncoderModel<B> for DualEncoder<B> {
    fn encode(
        &self,
        queries: EncodedInput<B>,
        docs: EncodedInput<B>,
    ) -> crate::error::Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        let batch = queries.rows();
        let doc_rows = docs.rows();
        if batch == 0 || doc_rows % batch != 0 {
            return Err(TrainError::InvalidBatch(format!(
                "{doc_rows} document rows cannot be grouped over {batch} queries"
            )));
        }
        let n_candidates = doc_rows / batch;

        let q = self.encode_queries(queries);
        let d = self.encode_docs(docs);
        let dim = q.dims()[1];

        Ok((q.reshape([batch, 1, dim]), d.reshape([batch, n_candidates, dim])))
    }

    fn is_sparse(&self) -> bool {
        self.doc_encoder.is_sparse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn input(rows: usize, seq: usize, d: usize) -> EncodedInput<TestBackend> {
        let device = Default::default();
        EncodedInput::new(
            Tensor::random([rows, seq, d], Distribution::Normal(0.0, 1.0), &device),
            Tensor::ones([rows, seq], &device),
        )
    }

    fn config(shared: bool) -> DualEncoderConfig {
        DualEncoderConfig::new(RepresentationHeadConfig::new(8, 16).with_dropout(0.0))
            .with_shared_weights(shared)
    }

    #[test]
    fn test_encode_shapes() {
        let device = Default::default();
        let model = config(true).init::<TestBackend>(&device);
        let (q, d) = model.encode(input(2, 4, 8), input(6, 5, 8)).unwrap();
        assert_eq!(q.dims(), [2, 1, 16]);
        assert_eq!(d.dims(), [2, 3, 16]);
    }

    #[test]
    fn test_ungroupable_docs_rejected() {
        let device = Default::default();
        let model = config(true).init::<TestBackend>(&device);
        let err = model.encode(input(2, 4, 8), input(5, 5, 8)).unwrap_err();
        assert!(matches!(err, TrainError::InvalidBatch(_)));
    }

    #[test]
    fn test_shared_towers_agree() {
        let device = Default::default();
        let model = config(true).init::<TestBackend>(&device);
        assert!(model.shared_weights());

        let x = input(3, 4, 8);
        let q = model.encode_queries(x.clone());
        let d = model.encode_docs(x);
        let diff: f32 = (q - d).abs().max().into_scalar().elem();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_separate_towers_double_params() {
        let device = Default::default();
        let separate = config(false).init::<TestBackend>(&device);
        assert!(!separate.shared_weights());
        assert_eq!(separate.num_params(), 2 * separate.doc_encoder().num_params());

        let shared = config(true).init::<TestBackend>(&device);
        assert_eq!(shared.num_params(), shared.doc_encoder().num_params());
    }
}
