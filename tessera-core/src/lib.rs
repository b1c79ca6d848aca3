//! Tessera Core
//!
//! This crate provides the core runtime for the Tessera directive engine.
//! It implements:
//!
//! - A reactive state store with path-precise dependency tracking
//! - Prototype-style scope chains layered over the store
//! - A directive registry with dependency injection
//! - A priority-ordered processing pipeline that works on any element tree
//! - Async directives that block, skip or stream during server rendering
//! - Attaching to server output on the client without re-rendering it
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Store, effects and dependency tracking
//! - `scope`: Lexical scopes delegating to their parents
//! - `tree`: The element tree abstraction and an arena-backed document
//! - `expr`: Expression evaluation against a scope
//! - `directive`: Directive definitions, the registry and built-ins
//! - `pipeline`: Discovery, ordering and invocation of directives
//! - `lifecycle`: Async directive strategies, streaming and hydration
//! - `engine`: Render and attach entry points
//!
//! # Example
//!
//! ```rust,ignore
//! use serde_json::json;
//! use tessera_core::{Engine, Document, Store};
//!
//! let engine = Engine::builder().build();
//!
//! // Server side
//! let html = engine
//!     .render(r#"<ul><li x-for="item in items" x-text="item"></li></ul>"#, json!({ "items": ["a", "b"] }))
//!     .await?;
//!
//! // Client side, against the same output
//! let document = Document::parse(&html)?;
//! let state = Store::new(json!({ "items": ["a", "b"] }));
//! let hydration = engine.attach(&document, &state)?;
//!
//! // Updates now flow into the document
//! state.root().get("items").push(json!("c"));
//! ```

pub mod config;
pub mod directive;
pub mod engine;
pub mod error;
pub mod expr;
pub mod lifecycle;
pub mod pipeline;
pub mod reactive;
pub mod scope;
pub mod tree;

pub use config::{RegistryConfig, RenderOptions};
pub use directive::{
    AsyncInput, AsyncOptions, Directive, DirectiveClass, DirectiveRegistry, Invocation, Outcome,
    ServiceRegistry, SsrStrategy,
};
pub use engine::{attach, render, render_stream, Engine, EngineBuilder, Environment};
pub use error::{AsyncFailure, EngineError, Result};
pub use expr::{Evaluator, PathEvaluator};
pub use lifecycle::{AsyncState, Hydration};
pub use pipeline::{Frame, Mode, Pipeline};
pub use reactive::{Effect, EffectScope, Store};
pub use scope::Scope;
pub use tree::{Document, NodeId, Tree};
