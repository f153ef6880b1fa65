//! Execution adapter shared by harness tooling.
//!
//! Everything that touches a child process lives here, so the harness crate can stay
//! `forbid(unsafe_code)`:
//! - [`toolchain`]: invoke an external compiler/linker, one private output directory per fixture
//! - [`process`]: run a binary under a wall-clock bound and capture raw stdout/stderr bytes
//! - [`cancel`]: run-wide cancellation observed by every in-flight child

pub mod cancel;
pub mod error;
pub mod process;
pub mod toolchain;

pub use cancel::CancelToken;
pub use error::ExecError;
pub use process::{ExecutionResult, ExitStatus, RunLimits, run_binary};
pub use toolchain::{BuildArtifact, BuildRequest, BuildStatus, Toolchain};
