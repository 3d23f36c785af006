//! pipeflow - pipeline orchestration service
//!
//! Users submit a YAML-defined workflow bound to a logical filesystem; the
//! service validates it, compiles it into a DAG of steps, schedules each
//! step as an external job, tracks progress through job-lifecycle events,
//! and supports resume, retry and cooperative termination.
//!
//! ## Example
//!
//! ```yaml
//! name: distributed_training
//! docker_env: registry.example.com/train:1.2
//!
//! entry_points:
//!   data_preprocess:
//!     command: "python preprocess.py --output {{ train_data }}"
//!     artifacts:
//!       output:
//!         train_data: /out/train.parquet
//!
//!   main:
//!     command: "python train.py --data {{ train_data }} --model {{ model }}"
//!     deps: data_preprocess
//!     parameters:
//!       model: resnet
//!     artifacts:
//!       input:
//!         train_data: "{{ data_preprocess.train_data }}"
//!     cache:
//!       enable: true
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod fs;
pub mod image;
pub mod job;
pub mod runtime;
pub mod shutdown;
pub mod storage;
pub mod workflow;

pub use error::{Error, Result};
