//! Sandbox launcher for agent runtimes: run untrusted commands on the
//! host shell ("off"), in a Linux container ("docker"), or inside an
//! Apple Silicon VM commanded over its serial console ("apple-vm").
//!
//! Everything lives in three workspace members; this crate just stitches
//! them together under one name and ships the `vibebox` binary.
//!
//! Start with [`runtime::service::SandboxService`] — it owns the session
//! registry and composes the rest: [`core`] holds the shared vocabulary
//! (errors, image catalog, project config, progress events), [`images`]
//! turns a catalog entry into a verified disk image on disk, and
//! [`runtime`] provides the three backends plus provider selection and
//! the JSON bridge types.

pub use vibebox_core as core;
pub use vibebox_images as images;
pub use vibebox_runtime as runtime;
