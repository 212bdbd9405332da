pub mod admin;
pub mod aggregator;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod factory;
pub mod ids;
pub mod layout;
pub mod local_store;
pub mod node_filter;
pub mod reader;
pub mod writer;

pub use aggregator::{aggregate_application, AggregationReport, AggregationRequest, OnRecordError};
pub use codec::{LogFile, LogFormat, LogKey, LogRecord, LogValue};
pub use config::AggregationConfig;
pub use context::{AccessType, AggregationContext};
pub use error::{AggError, AggResult};
pub use factory::AggregationFactory;
pub use ids::{ApplicationId, Identity, TaskUnitId, WorkerNodeId};
pub use local_store::LocalLogStore;
pub use reader::{AggregatedLogs, AggregationReader};
pub use writer::{with_session, AggregationWriter, WriterState};

/// Marca que deja el runtime cuando la aplicación terminó en este nodo.
pub const FINISHED_MARKER: &str = ".finished";
/// Marca que deja el agente después de subir los logs.
pub const AGGREGATED_MARKER: &str = ".aggregated";
