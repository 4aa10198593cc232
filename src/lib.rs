//! safepy - a sandboxed evaluator for a safe subset of Python
//!
//! Code submitted by an agent runs through a grammar restrictor and a
//! tree-walking evaluator. It can import only allow-listed modules, call only
//! the tools the host registers, and cannot reach the filesystem or network.
//!
//! # Example
//!
//! ```
//! use safepy::{Executor, Tool, Value};
//!
//! let mut executor = Executor::new(["statistics"]);
//! executor
//!     .define_tools([("lookup", Tool::new(|_| Ok(Value::Int(41))))])
//!     .unwrap();
//!
//! let result = executor.execute("print('looking up')\nfinal_answer(lookup() + 1)").unwrap();
//! assert!(result.is_final_answer);
//! assert_eq!(result.logs, "looking up\n");
//! assert_eq!(result.value.as_int().unwrap(), 42);
//! ```

pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod output;
pub mod parser;
pub mod repl;
pub mod script;
pub mod security;
pub mod stack;
pub mod telemetry;
pub mod value;

pub use config::{ExecutorConfig, Limits};
pub use error::{ErrorKind, ErrorReport, Result, SafepyError};
pub use output::{format_output, OutputFormat};
pub use script::{ExecutionResult, Executor};
pub use value::{Arguments, Tool, Value};
