//! # sx-engine
//!
//! Sample execution engine: suspendable execution contexts for model
//! callbacks, the conduits that place samples on worker threads or ranks,
//! and the [`Engine`] that mediates between a solver and running samples.

pub mod conduit;
pub mod context;
pub mod coroutine;
pub mod engine;
pub mod registry;
pub mod transport;
pub mod worker;

pub use conduit::{build as build_conduit, Conduit, ConduitEvent, DistributedConduit, LocalConduit, RankWorker};
pub use context::{Environment, EnvironmentContext, SampleContext};
pub use coroutine::{Coroutine, Step, SuspendReason, Suspender};
pub use engine::{Engine, EngineStats};
pub use registry::{ModelFn, ModelRegistry};
pub use transport::{ChannelTransport, Transport, WireFrame};
