//! Core domain models for stream pipelines
//!
//! This module defines the compiled pipeline model (definitions, stages,
//! bindings), the activity abstraction and the configuration it is built from.

pub mod activity;
pub mod config;
pub mod context;
pub mod definition;
pub mod mapping;
pub mod stage;
pub mod state;

pub use activity::{Activity, ActivityError, ActivityFactory, ActivityRegistry, ActivitySettings, Capabilities};
pub use config::{Attribute, AttributeType, DefinitionConfig, IoMetadata, StageConfig};
pub use context::{ActivityContext, DataScope};
pub use definition::{CompilationError, Definition};
pub use mapping::{CompositeResolver, ExprMapperFactory, Mapper, MapperFactory, MappingError};
pub use stage::Stage;
pub use state::{ExecutionStatus, PartitionSnapshot};
