//! # scoreconv-jobs
//!
//! Conversion job processing for the scoreconv worker.
//!
//! This crate provides:
//! - Job payload validation
//! - Staging of remote inputs, including compressed MusicXML containers
//! - Supervision of the external conversion tool
//! - The per-job pipeline and its status state machine
//! - A subscription-driven worker that runs one pipeline task per job
//!
//! ## Example
//!
//! ```ignore
//! use scoreconv_graph::{GraphClient, WsTransport, WsTransportConfig};
//! use scoreconv_jobs::{WorkerBuilder, WorkerConfig};
//!
//! let config = WorkerConfig::from_env()?;
//! let transport = WsTransport::start(WsTransportConfig::new(&config.graphql_url));
//! let worker = WorkerBuilder::new(GraphClient::new(transport), config).build()?;
//!
//! let handle = worker.start();
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! handle.shutdown().await?;
//! ```

pub mod archive;
pub mod converter;
pub mod listener;
pub mod pipeline;
pub mod results;
pub mod scratch;
pub mod stager;
pub mod validator;
pub mod worker;

// Re-export core types
pub use scoreconv_core::*;

pub use converter::{DocumentConverter, VerovioConverter};
pub use listener::SubscriptionListener;
pub use pipeline::{JobPipeline, PipelineOutcome, Stage};
pub use results::ResultStore;
pub use scratch::Scratch;
pub use stager::SourceStager;
pub use validator::validate;
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
