//! The service façade: request/response surface over catalog, store,
//! selector, and backends, plus the session registry.
//!
//! The registry lock is held only around create/lookup/state flips;
//! probes, prepares, and execs all run with it released, so sessions
//! are independent and fully parallel.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use tracing::{debug, info};

use vibebox_core::cancel::CancelToken;
use vibebox_core::catalog::{self, Arch, ImageBackend, ImageDescriptor};
use vibebox_core::config::{PROVIDER_APPLE_VM, ProjectConfig, normalize_provider};
use vibebox_core::error::SandboxError;
use vibebox_core::progress::ProgressFn;
use vibebox_core::request::{
    ExecRequest, ExecResult, ProbeResult, Selection, Session, SessionState,
};
use vibebox_images::ImageStore;

use crate::apple::AppleVmBackend;
use crate::backend::{Backend, SessionHandle, StartIo};
use crate::docker::DockerBackend;
use crate::off::OffBackend;
use crate::select;
use crate::spec::RuntimeSpec;

// ============================================================================
// Request/Report types
// ============================================================================

/// Initialize a project: prepare the image and write the config.
#[derive(Debug, Clone)]
pub struct InitializeRequest {
    pub project_root: PathBuf,
    pub provider: String,
    pub image_id: String,
}

/// Probe (or selection) outcome. `diagnostics` is populated whenever
/// the selection phase ran, success or not.
pub struct SelectReport {
    pub diagnostics: BTreeMap<String, ProbeResult>,
    pub selection: Result<Selection>,
}

/// Exec outcome, with whatever selection data was reached.
pub struct ExecReport {
    pub diagnostics: BTreeMap<String, ProbeResult>,
    pub selection: Option<Selection>,
    pub result: Result<ExecResult>,
}

// ============================================================================
// Registry
// ============================================================================

struct SessionEntry {
    public: Session,
    backend_name: String,
    /// Backend-specific opaque handle, present when the backend has
    /// the session capability.
    handle: Option<SessionHandle>,
    spec: RuntimeSpec,
    default_cwd: String,
    default_env: BTreeMap<String, String>,
}

// ============================================================================
// Service
// ============================================================================

pub struct SandboxService {
    off: OffBackend,
    docker: DockerBackend,
    apple: AppleVmBackend,
    store: ImageStore,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SandboxService {
    pub fn new() -> Result<Self> {
        Ok(Self::with_store(ImageStore::new()?))
    }

    /// Service over an explicit store (tests, alternate roots).
    pub fn with_store(store: ImageStore) -> Self {
        Self {
            off: OffBackend,
            docker: DockerBackend,
            apple: AppleVmBackend,
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn backends(&self) -> [&dyn Backend; 3] {
        [&self.off, &self.apple, &self.docker]
    }

    fn backend_by_name(&self, name: &str) -> Result<&dyn Backend> {
        self.backends()
            .into_iter()
            .find(|b| b.name() == name)
            .ok_or_else(|| SandboxError::Validation(format!("unknown backend {:?}", name)).into())
    }

    /// Probe all backends and apply the selection table.
    pub fn probe(&self, requested: &str) -> SelectReport {
        let requested = normalize_provider(requested);
        let diagnostics = select::probe_all(&self.backends());
        let selection = select::decide(&requested, &diagnostics, select::host_is_darwin());
        SelectReport {
            diagnostics,
            selection,
        }
    }

    /// Prepare the catalog image and write the project config.
    pub fn initialize(
        &self,
        request: &InitializeRequest,
        progress: &ProgressFn,
        cancel: &CancelToken,
    ) -> Result<ProjectConfig> {
        let descriptor = find_image(&request.image_id, None)?;

        if descriptor.backend == ImageBackend::Vm {
            self.store.ensure_prepared(descriptor, progress, cancel)?;
        }

        let mut config = ProjectConfig::default();
        config.provider = normalize_provider(&request.provider);
        config.vm.image_id = descriptor.id.to_string();
        config.vm.image_version = descriptor.version.to_string();
        config.save(&request.project_root)?;
        info!(
            project = %request.project_root.display(),
            image = descriptor.id,
            "project initialized"
        );
        Ok(config)
    }

    /// Resolve the runtime spec for a selected provider, preparing the
    /// base image when the provider boots one.
    fn resolve_spec(
        &self,
        project_root: &Path,
        provider: &str,
        config: ProjectConfig,
        progress: &ProgressFn,
        cancel: &CancelToken,
    ) -> Result<RuntimeSpec> {
        let base_raw = if provider == PROVIDER_APPLE_VM {
            let descriptor =
                find_image(&config.vm.image_id, Some(&config.vm.image_version))?;
            // Resolve from the lock first; fall back to a full prepare
            // (download, verify, extract) when the cache is cold.
            match self.store.prepared(descriptor)? {
                Some(paths) => paths.raw_path,
                None => {
                    self.store
                        .ensure_prepared(descriptor, progress, cancel)?
                        .raw_path
                }
            }
        } else {
            PathBuf::new()
        };
        Ok(RuntimeSpec::new(project_root.to_path_buf(), config, base_raw))
    }

    fn load_config(project_root: &Path) -> Result<ProjectConfig> {
        if ProjectConfig::path(project_root).exists() {
            ProjectConfig::load(project_root)
        } else {
            let mut config = ProjectConfig::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Select, prepare, and return (backend, spec, selection).
    fn select_and_prepare(
        &self,
        project_root: &Path,
        provider_override: Option<&str>,
        progress: &ProgressFn,
        cancel: &CancelToken,
    ) -> (BTreeMap<String, ProbeResult>, Result<(&dyn Backend, RuntimeSpec, Selection)>) {
        let config = match Self::load_config(project_root) {
            Ok(config) => config,
            Err(e) => return (BTreeMap::new(), Err(e)),
        };
        let requested =
            normalize_provider(provider_override.unwrap_or(&config.provider));

        let diagnostics = select::probe_all(&self.backends());
        let selection = match select::decide(&requested, &diagnostics, select::host_is_darwin()) {
            Ok(selection) => selection,
            Err(e) => return (diagnostics, Err(e)),
        };

        let prepared = (|| {
            let backend = self.backend_by_name(&selection.provider)?;
            let spec = self.resolve_spec(
                project_root,
                &selection.provider,
                config,
                progress,
                cancel,
            )?;
            backend.prepare(&spec, progress, cancel)?;
            Ok((backend, spec, selection.clone()))
        })();
        (diagnostics, prepared)
    }

    /// One non-interactive exec against a project.
    pub fn exec(
        &self,
        project_root: &Path,
        provider_override: Option<&str>,
        request: &ExecRequest,
        progress: &ProgressFn,
        cancel: &CancelToken,
    ) -> ExecReport {
        let (diagnostics, prepared) =
            self.select_and_prepare(project_root, provider_override, progress, cancel);
        match prepared {
            Ok((backend, spec, selection)) => {
                debug!(provider = %selection.provider, "exec");
                let result = backend.exec(&spec, request, cancel);
                ExecReport {
                    diagnostics,
                    selection: Some(selection),
                    result,
                }
            }
            Err(e) => ExecReport {
                diagnostics,
                selection: None,
                result: Err(e),
            },
        }
    }

    /// Interactive start against a project.
    pub fn start(
        &self,
        project_root: &Path,
        provider_override: Option<&str>,
        io: StartIo,
        progress: &ProgressFn,
        cancel: &CancelToken,
    ) -> SelectReport {
        let (diagnostics, prepared) =
            self.select_and_prepare(project_root, provider_override, progress, cancel);
        let selection = match prepared {
            Ok((backend, spec, selection)) => {
                backend.start(&spec, io, cancel).map(|_| selection)
            }
            Err(e) => Err(e),
        };
        SelectReport {
            diagnostics,
            selection,
        }
    }

    /// Create a session: select once, prepare, capture diagnostics,
    /// open the backend handle when the capability exists.
    pub fn start_session(
        &self,
        project_root: &Path,
        provider_override: Option<&str>,
        progress: &ProgressFn,
        cancel: &CancelToken,
    ) -> Result<Session> {
        let (_diagnostics, prepared) =
            self.select_and_prepare(project_root, provider_override, progress, cancel);
        let (backend, spec, selection) = prepared?;

        let handle = match backend.sessions() {
            Some(sessions) => Some(sessions.open_session(&spec)?),
            None => None,
        };

        let session = Session::new_active(selection.provider.clone(), selection.diagnostics.clone());

        let entry = SessionEntry {
            public: session.clone(),
            backend_name: selection.provider,
            handle,
            spec,
            default_cwd: String::new(),
            default_env: BTreeMap::new(),
        };
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), entry);
        info!(session = %session.id, provider = %session.provider, "session started");
        Ok(session)
    }

    /// Execute inside a session. Fails unless the session is active.
    pub fn exec_in_session(
        &self,
        session_id: &str,
        request: &ExecRequest,
        cancel: &CancelToken,
    ) -> Result<ExecResult> {
        // Clone what the exec needs, then release the registry lock so
        // independent sessions run fully in parallel.
        let (backend_name, handle, spec, default_cwd, default_env) = {
            let sessions = self.sessions.lock().unwrap();
            let entry = sessions.get(session_id).ok_or_else(|| {
                SandboxError::Validation(format!("unknown session {:?}", session_id))
            })?;
            if entry.public.state != SessionState::Active {
                return Err(SandboxError::Validation(format!(
                    "session {} is not active",
                    session_id
                ))
                .into());
            }
            (
                entry.backend_name.clone(),
                entry.handle.clone(),
                entry.spec.clone(),
                entry.default_cwd.clone(),
                entry.default_env.clone(),
            )
        };

        let mut merged = request.clone();
        if merged.cwd.is_empty() {
            merged.cwd = default_cwd;
        }
        for (k, v) in default_env {
            merged.env.entry(k).or_insert(v);
        }

        let backend = self.backend_by_name(&backend_name)?;
        match (backend.sessions(), handle) {
            (Some(sessions), Some(handle)) => {
                sessions.exec_in_session(&spec, &handle, &merged, cancel)
            }
            _ => backend.exec(&spec, &merged, cancel),
        }
    }

    /// Stop a session. Idempotent: stopping a stopped session is a
    /// no-op returning the terminal state.
    pub fn stop_session(&self, session_id: &str) -> Result<Session> {
        let (public, backend_name, handle) = {
            let mut sessions = self.sessions.lock().unwrap();
            let entry = sessions.get_mut(session_id).ok_or_else(|| {
                SandboxError::Validation(format!("unknown session {:?}", session_id))
            })?;
            if entry.public.state == SessionState::Stopped {
                return Ok(entry.public.clone());
            }
            entry.public.state = SessionState::Stopped;
            (
                entry.public.clone(),
                entry.backend_name.clone(),
                entry.handle.take(),
            )
        };

        if let Some(handle) = handle {
            if let Some(sessions) = self.backend_by_name(&backend_name)?.sessions() {
                sessions.close_session(&handle)?;
            }
        }
        info!(session = %public.id, "session stopped");
        Ok(public)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(session_id)
            .map(|e| e.public.clone())
            .ok_or_else(|| {
                SandboxError::Validation(format!("unknown session {:?}", session_id)).into()
            })
    }
}

/// Look up a catalog image for this host, optionally pinned to a
/// version.
fn find_image(id: &str, version: Option<&str>) -> Result<&'static ImageDescriptor> {
    let found = match version {
        Some(version) => catalog::OFFICIAL_IMAGES
            .iter()
            .find(|img| img.id == id && img.version == version && img.arch == Arch::host())
            .or_else(|| catalog::find_for_arch(id, Arch::host())),
        None => catalog::find(id),
    };
    found.ok_or_else(|| {
        SandboxError::Validation(format!(
            "unknown image id {:?} for {} (see the official image catalog)",
            id,
            Arch::host()
        ))
        .into()
    })
}
