use crate::error::Result;
use crate::preprocess::PixelValues;

/// A model that maps preprocessed pixels to one logit per class.
///
/// Implementations are shared across concurrent requests and must not
/// mutate model state during `forward`.
pub trait Backend: Send + Sync {
    fn forward(&self, input: &PixelValues) -> Result<Vec<f32>>;
}

#[cfg(feature = "tensorflow")]
pub use self::tf::TfBackend;

#[cfg(feature = "tensorflow")]
mod tf {
    use std::path::{Path, PathBuf};

    use tensorflow::{
        Graph, SavedModelBundle, Session, SessionOptions, SessionRunArgs, Tensor,
        DEFAULT_SERVING_SIGNATURE_DEF_KEY,
    };

    use super::Backend;
    use crate::error::{Result, ServiceError};
    use crate::preprocess::PixelValues;

    const SERVE_TAG: &str = "serve";
    const INPUT_KEY: &str = "pixel_values";
    const OUTPUT_KEY: &str = "logits";

    struct Endpoint {
        op: String,
        index: i32,
    }

    /// TensorFlow SavedModel exported from an image-classification model.
    pub struct TfBackend {
        graph: Graph,
        session: Session,
        input: Endpoint,
        output: Endpoint,
    }

    impl TfBackend {
        pub fn load(model_dir: &Path) -> Result<Self> {
            let export_dir = saved_model_dir(model_dir)?;
            let mut graph = Graph::new();
            let bundle = SavedModelBundle::load(
                &SessionOptions::new(),
                [SERVE_TAG],
                &mut graph,
                &export_dir,
            )
            .map_err(|e| {
                ServiceError::ModelLoad(format!(
                    "cannot load SavedModel from {}: {}",
                    export_dir.display(),
                    e
                ))
            })?;

            let signature = bundle
                .meta_graph_def()
                .get_signature(DEFAULT_SERVING_SIGNATURE_DEF_KEY)
                .map_err(|e| ServiceError::ModelLoad(e.to_string()))?;
            let input = signature
                .get_input(INPUT_KEY)
                .map_err(|e| ServiceError::ModelLoad(e.to_string()))?;
            let output = signature
                .get_output(OUTPUT_KEY)
                .map_err(|e| ServiceError::ModelLoad(e.to_string()))?;

            let input = Endpoint {
                op: input.name().name.clone(),
                index: input.name().index,
            };
            let output = Endpoint {
                op: output.name().name.clone(),
                index: output.name().index,
            };

            // Fail at startup rather than on the first request.
            for endpoint in [&input, &output] {
                graph
                    .operation_by_name_required(&endpoint.op)
                    .map_err(|e| ServiceError::ModelLoad(e.to_string()))?;
            }

            tracing::info!(
                path = %export_dir.display(),
                input = %input.op,
                output = %output.op,
                "Loaded SavedModel"
            );

            Ok(Self {
                graph,
                session: bundle.session,
                input,
                output,
            })
        }
    }

    impl Backend for TfBackend {
        fn forward(&self, input: &PixelValues) -> Result<Vec<f32>> {
            let tensor = Tensor::<f32>::new(&input.dims())
                .with_values(&input.data)
                .map_err(|e| ServiceError::Inference(e.to_string()))?;

            let input_op = self
                .graph
                .operation_by_name_required(&self.input.op)
                .map_err(|e| ServiceError::Inference(e.to_string()))?;
            let output_op = self
                .graph
                .operation_by_name_required(&self.output.op)
                .map_err(|e| ServiceError::Inference(e.to_string()))?;

            let mut args = SessionRunArgs::new();
            args.add_feed(&input_op, self.input.index, &tensor);
            let token = args.request_fetch(&output_op, self.output.index);
            self.session
                .run(&mut args)
                .map_err(|e| ServiceError::Inference(e.to_string()))?;

            let logits: Tensor<f32> = args
                .fetch(token)
                .map_err(|e| ServiceError::Inference(e.to_string()))?;
            Ok(logits.to_vec())
        }
    }

    /// `save_pretrained(saved_model=True)` writes the bundle under `saved_model/1`.
    fn saved_model_dir(model_dir: &Path) -> Result<PathBuf> {
        [model_dir.to_path_buf(), model_dir.join("saved_model").join("1")]
            .into_iter()
            .find(|dir| dir.join("saved_model.pb").is_file())
            .ok_or_else(|| {
                ServiceError::ModelLoad(format!(
                    "no saved_model.pb under {}",
                    model_dir.display()
                ))
            })
    }
}
