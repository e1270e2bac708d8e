//! LaTeX compilation orchestration and source ↔ output synchronization.
//!
//! A [`CompilerRouter`] picks between the in-process engine, a container, a
//! remote compile server and a hosted build API, falling back only on system
//! errors. Compiled output feeds a [`PositionMapBuilder`], and
//! [`SyncNavigator`] answers click-to-navigate queries over the resulting map.

pub mod backend_traits;
pub mod backends;
pub mod diagnostic;
pub mod engine;
pub mod ffi;
pub mod ffi_bridge;
pub mod log_parser;
pub mod parser;
pub mod pdf;
pub mod position_map;
pub mod router;
pub mod runtime;
pub mod runtime_config;
pub mod sync;

pub use backend_traits::{
    BackendError, BackendKind, CompilationBackend, CompilationError, CompilationRequest,
    CompilationResult, DocumentSource, FileKind, OutputFormat, ProjectFile, TexEngine,
};
pub use engine::{EngineError, EngineLifecycleManager, EngineState, EngineVariant};
pub use ffi::WorkbenchHandle;
pub use position_map::{
    OutputLocation, PageGeometry, PositionMap, PositionMapBuilder, SourceLocation,
};
pub use router::CompilerRouter;
pub use runtime::{RuntimeError, WorkbenchRuntime};
pub use runtime_config::RuntimeConfig;
pub use sync::SyncNavigator;

uniffi::setup_scaffolding!();
