// vibebox-runtime: execution backends and the service façade.
//
// Three backends share one trait: "off" (host bash with a jailed cwd),
// "docker" (daemon CLI), and "apple-vm" (Virtualization.framework VM
// commanded over its serial console). The service façade composes them
// with the image store and owns the session registry.

pub mod apple;
pub mod backend;
pub mod bridge;
pub mod docker;
pub mod jail;
pub mod mounts;
pub mod off;
pub mod select;
pub mod service;
pub mod shell;
pub mod spec;

pub use backend::{Backend, SessionBackend, SessionHandle, StartIo};
pub use service::SandboxService;
