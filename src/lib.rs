//! OData v4.0/4.01 protocol server toolkit over a pluggable relational
//! store.
//!
//! Applications register their entity model with [`ServiceBuilder`], plug in
//! a [`store::Store`] implementation, and mount the resulting [`Service`] as
//! an axum router:
//!
//! ```ignore
//! let service = Service::builder("Shop", "Container")
//!     .base_path("/odata")
//!     .entity_set(
//!         EntityMetadata::new("Products", "Product", "products")
//!             .property(PropertyMetadata::new("ID", EdmType::Int32).markers("key,computed")?)
//!             .property(PropertyMetadata::new("Name", EdmType::String).markers("required")?),
//!     )
//!     .build(store)?;
//! axum::serve(listener, service.into_router()).await?;
//! ```

pub mod ast;
pub mod batch;
pub mod changes;
pub mod compiler;
pub mod csdl;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod jobs;
pub mod lexer;
pub mod metadata;
pub mod parser;
pub mod plan;
pub mod router;
pub mod serialize;
pub mod service;
pub mod store;
pub mod tokens;
pub mod url;
pub mod value;

pub use error::{Error, Result};
pub use metadata::{
    ComplexTypeMetadata, EntityMetadata, EnumTypeMetadata, NavigationMetadata, OnDelete,
    OperationMetadata, PropertyMetadata,
};
pub use service::{OperationContext, OperationHandler, Service, ServiceBuilder, ServiceConfig};
pub use value::{EdmType, Value};
