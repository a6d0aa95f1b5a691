//! HTTP service that classifies retina OCT images with a pretrained
//! image-classification model.
//!
//! The model directory is read once at startup into an immutable
//! [`ServiceContext`]; every request runs decode, preprocess, forward pass
//! and softmax independently against it.

pub mod backend;
pub mod config;
pub mod error;
pub mod labels;
pub mod model;
pub mod page;
pub mod preprocess;
pub mod server;

use std::path::Path;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use crate::config::{Config, LogFormat};
pub use crate::error::{Result, ServiceError};
pub use crate::server::ServiceContext;

/// Initialise the global tracing subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
        LogFormat::Text => registry.with(fmt::layer()).try_init()?,
    }
    Ok(())
}

/// Fails fast when the model directory is absent.
pub fn ensure_model_dir(model_dir: &Path) -> Result<()> {
    if model_dir.is_dir() {
        Ok(())
    } else {
        Err(ServiceError::ModelDirNotFound(model_dir.to_path_buf()))
    }
}

/// Load labels, preprocessor and TensorFlow model from `config.model_dir`.
#[cfg(feature = "tensorflow")]
pub fn load_context(config: &Config) -> Result<ServiceContext> {
    use std::sync::Arc;

    use crate::backend::TfBackend;
    use crate::model::{InferencePipeline, ModelConfig};
    use crate::preprocess::Preprocessor;

    let dir = config.model_dir.as_path();
    ensure_model_dir(dir)?;

    let labels = ModelConfig::from_model_dir(dir)?.labels(&config.label_policy());
    let preprocessor = Preprocessor::from_model_dir(dir)?;
    let backend = TfBackend::load(dir)?;

    tracing::info!(
        model_dir = %dir.display(),
        classes = labels.len(),
        "Model loaded"
    );
    Ok(ServiceContext::new(
        InferencePipeline::new(preprocessor, Arc::new(backend)),
        labels,
    ))
}
