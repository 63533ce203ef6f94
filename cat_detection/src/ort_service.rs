use crate::{
    config::{ExecutionProvider, RuntimeConfig},
    detector::DetectorError,
};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
};
use parking_lot::Mutex;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Registers the configured execution provider for every session created
/// afterwards. Must run before any `SessionPool` is built.
pub fn init_runtime(runtime: &RuntimeConfig) -> Result<(), DetectorError> {
    let builder = ort::init();
    let builder = match runtime.execution_provider {
        ExecutionProvider::Cpu => {
            builder.with_execution_providers([CPUExecutionProvider::default().build()])
        }
        ExecutionProvider::Cuda => {
            builder.with_execution_providers([CUDAExecutionProvider::default().build()])
        }
        ExecutionProvider::Tensorrt => builder.with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .build(),
        ]),
    };
    builder
        .commit()
        .map_err(|e| DetectorError::Load(format!("failed to initialize runtime: {}", e)))?;

    tracing::info!(
        "ONNX runtime initialized with {:?} execution provider",
        runtime.execution_provider
    );
    Ok(())
}

fn load_session(model_path: &Path) -> Result<Session, DetectorError> {
    let load_error = |e: &dyn std::fmt::Display| {
        DetectorError::Load(format!("{}: {}", model_path.display(), e))
    };
    let session = Session::builder()
        .map_err(|e| load_error(&e))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| load_error(&e))?
        .commit_from_file(model_path)
        .map_err(|e| load_error(&e))?;
    Ok(session)
}

/// Round-robin pool of sessions over one model file.
///
/// Each session sits behind its own mutex, so at most one inference runs on
/// a given session at a time while requests are spread across the pool.
#[derive(Clone)]
pub struct SessionPool {
    sessions: Arc<Vec<Mutex<Session>>>,
    counter: Arc<AtomicUsize>,
}

impl SessionPool {
    pub fn new(model_path: &Path, num_instances: usize) -> Result<Self, DetectorError> {
        let sessions = (0..num_instances.max(1))
            .map(|_| load_session(model_path).map(Mutex::new))
            .collect::<Result<Vec<_>, DetectorError>>()?;

        tracing::info!(
            "Created {} ONNX sessions for {}",
            sessions.len(),
            model_path.display()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Runs `f` with exclusive access to the next session in the rotation.
    pub fn with_session<T>(
        &self,
        f: impl FnOnce(&mut Session) -> Result<T, DetectorError>,
    ) -> Result<T, DetectorError> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[index].lock();

        tracing::debug!("Handling request with session {}", index);
        f(&mut *session)
    }
}
