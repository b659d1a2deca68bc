#![deny(unknown_lints)]
#![deny(renamed_and_removed_lints)]
#![forbid(unsafe_code)]
#![deny(deprecated)]
#![deny(private_interfaces)]
#![deny(private_bounds)]
#![forbid(non_fmt_panics)]
#![deny(unreachable_code)]
#![deny(unreachable_patterns)]
#![forbid(unused_doc_comments)]
#![forbid(unused_must_use)]
#![deny(while_true)]
#![deny(unused_parens)]
#![deny(redundant_semicolons)]
#![deny(non_ascii_idents)]
#![deny(confusable_idents)]
#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::cargo_common_metadata)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![warn(missing_debug_implementations)]
#![deny(clippy::mod_module_files)]
#![doc = include_str!("../README.md")]

pub mod access;
pub mod access_log;
pub mod backend;
pub mod cancel;
pub mod config;
pub mod connection;
pub mod context;
pub mod control;
pub mod dispatch;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;
pub mod lock;
pub mod modification;
pub mod notification;
pub mod operation;
pub mod password_policy;
pub mod password_storage;
pub mod pipeline;
pub mod plugin;
pub mod result_code;
pub mod sasl;
pub mod schema;
pub mod synchronization;
pub mod time;

pub use cancel::{CancelHandle, CancelRequest, CancelResult};
pub use config::{ServerConfig, ServerConfigBuilder};
pub use connection::ClientConnection;
pub use context::{ServerContext, ServerContextBuilder};
pub use dn::{Dn, Rdn};
pub use entry::Entry;
pub use error::DirectoryError;
pub use operation::{OperationRecord, OperationType};
pub use pipeline::{ExecutionOutcome, OperationPipeline};
pub use result_code::ResultCode;
