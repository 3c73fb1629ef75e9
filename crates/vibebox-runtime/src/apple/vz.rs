//! Virtualization.framework bindings for the apple-vm backend.
//!
//! Every VZVirtualMachine operation must happen on the queue the VM was
//! created with. A dedicated serial dispatch queue is used so completion
//! handlers fire on GCD-managed threads without pumping a run loop;
//! blocks receive the VM as a raw pointer to sidestep the !Send ObjC
//! types, which is sound because the pointer is only dereferenced on
//! that queue while the owning `VzMachine` is alive.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Mutex;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use block2::RcBlock;
use dispatch2::{DispatchQueue, DispatchQueueAttr, DispatchRetained};
use objc2::AnyThread;
use objc2::rc::Retained;
use objc2::runtime::AnyClass;
use objc2_foundation::{NSArray, NSDictionary, NSError, NSFileHandle, NSString, NSURL};
use objc2_virtualization::{
    VZDiskImageStorageDeviceAttachment, VZEFIBootLoader, VZEFIVariableStore,
    VZEFIVariableStoreInitializationOptions, VZEntropyDeviceConfiguration,
    VZFileHandleSerialPortAttachment, VZGenericPlatformConfiguration, VZMACAddress,
    VZMultipleDirectoryShare, VZNATNetworkDeviceAttachment, VZNetworkDeviceConfiguration,
    VZSerialPortConfiguration, VZSharedDirectory, VZStorageDeviceConfiguration,
    VZVirtioBlockDeviceConfiguration, VZVirtioConsoleDeviceSerialPortConfiguration,
    VZVirtioEntropyDeviceConfiguration, VZVirtioFileSystemDeviceConfiguration,
    VZVirtioNetworkDeviceConfiguration, VZVirtualMachine, VZVirtualMachineConfiguration,
    VZVirtualMachineState,
};
use tracing::{debug, info, warn};

use vibebox_core::cancel::CancelToken;
use vibebox_core::error::SandboxError;

use super::boot::VIRTIOFS_TAG;
use crate::mounts::ShareBinding;

const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const QUEUE_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Check that the framework can construct an EFI boot loader at all.
/// Distinguishes an OS that predates the class from a framework that
/// rejects the construction.
pub fn efi_boot_loader_supported() -> Result<(), String> {
    if AnyClass::get(c"VZEFIBootLoader").is_none() {
        return Err("apple-vm requires macOS 13 or newer (VZEFIBootLoader unavailable)".into());
    }
    objc2::exception::catch(|| {
        let _ = unsafe { VZEFIBootLoader::new() };
    })
    .map_err(|e| {
        format!(
            "virtualization framework rejected EFI boot loader (SDK too old?): {:?}",
            e
        )
    })
}

/// Inputs for one VM configuration.
pub struct VzBootConfig<'a> {
    pub cpus: usize,
    pub memory_bytes: u64,
    pub instance_raw: &'a Path,
    pub efi_varstore: &'a Path,
    pub bindings: &'a [ShareBinding],
}

/// A configured (and possibly running) VZVirtualMachine plus the host
/// ends of its serial console pipes.
///
/// Not Send: lives on the thread that drives the exec, with all VM
/// calls dispatched onto the serial queue.
pub struct VzMachine {
    vm: Retained<VZVirtualMachine>,
    queue: DispatchRetained<DispatchQueue>,
    host_reader: Option<File>,
    host_writer: Option<File>,
    // Guest-side pipe ends, held until the framework takes them over
    // at start().
    guest_fds: Vec<OwnedFd>,
}

fn ns_url(path: &Path) -> Retained<NSURL> {
    NSURL::fileURLWithPath(&NSString::from_str(&path.to_string_lossy()))
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error()).context("pipe() failed");
    }
    // SAFETY: pipe() just handed us two fresh descriptors.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

impl VzMachine {
    /// Build and validate the full device configuration.
    pub fn build(config: &VzBootConfig<'_>) -> Result<Self> {
        // EFI boot loader backed by the per-project variable store:
        // created on first use, loaded thereafter.
        let loader = unsafe { VZEFIBootLoader::new() };
        let store_url = ns_url(config.efi_varstore);
        let store = if config.efi_varstore.exists() {
            unsafe { VZEFIVariableStore::initWithURL(VZEFIVariableStore::alloc(), &store_url) }
        } else {
            unsafe {
                VZEFIVariableStore::initCreatingVariableStoreAtURL_options_error(
                    VZEFIVariableStore::alloc(),
                    &store_url,
                    VZEFIVariableStoreInitializationOptions::empty(),
                )
            }
            .map_err(|e| {
                SandboxError::Boot(format!(
                    "create EFI variable store: {}",
                    e.localizedDescription()
                ))
            })?
        };
        unsafe { loader.setVariableStore(Some(&store)) };

        let vm_config = unsafe { VZVirtualMachineConfiguration::new() };
        unsafe {
            vm_config.setPlatform(&VZGenericPlatformConfiguration::new());
            vm_config.setBootLoader(Some(&loader));
            vm_config.setCPUCount(config.cpus);
            vm_config.setMemorySize(config.memory_bytes);
        }

        // Root disk: the mutable per-project instance image.
        let disk_attachment = unsafe {
            VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
                VZDiskImageStorageDeviceAttachment::alloc(),
                &ns_url(config.instance_raw),
                false,
            )
        }
        .map_err(|e| {
            SandboxError::Boot(format!(
                "attach {}: {}",
                config.instance_raw.display(),
                e.localizedDescription()
            ))
        })?;
        let block_device = unsafe {
            VZVirtioBlockDeviceConfiguration::initWithAttachment(
                VZVirtioBlockDeviceConfiguration::alloc(),
                &disk_attachment,
            )
        };
        let storage: Retained<NSArray<VZStorageDeviceConfiguration>> =
            NSArray::arrayWithObject(&block_device);
        unsafe { vm_config.setStorageDevices(&storage) };

        // NAT NIC with a fresh locally-administered MAC per boot.
        let net_device = unsafe { VZVirtioNetworkDeviceConfiguration::new() };
        unsafe {
            net_device.setAttachment(Some(&VZNATNetworkDeviceAttachment::new()));
            net_device.setMACAddress(&VZMACAddress::randomLocallyAdministeredAddress());
        }
        let nics: Retained<NSArray<VZNetworkDeviceConfiguration>> =
            NSArray::arrayWithObject(&net_device);
        unsafe { vm_config.setNetworkDevices(&nics) };

        // Entropy.
        let entropy = unsafe { VZVirtioEntropyDeviceConfiguration::new() };
        let entropy_devices: Retained<NSArray<VZEntropyDeviceConfiguration>> =
            NSArray::arrayWithObject(&entropy);
        unsafe { vm_config.setEntropyDevices(&entropy_devices) };

        // Virtiofs: one device, one tag, every share in the map.
        let fs_device = unsafe {
            VZVirtioFileSystemDeviceConfiguration::initWithTag(
                VZVirtioFileSystemDeviceConfiguration::alloc(),
                &NSString::from_str(VIRTIOFS_TAG),
            )
        };
        let keys: Vec<Retained<NSString>> = config
            .bindings
            .iter()
            .map(|b| NSString::from_str(&b.name))
            .collect();
        let directories: Vec<Retained<VZSharedDirectory>> = config
            .bindings
            .iter()
            .map(|b| unsafe {
                VZSharedDirectory::initWithURL_readOnly(
                    VZSharedDirectory::alloc(),
                    &ns_url(&b.host),
                    b.read_only,
                )
            })
            .collect();
        let key_refs: Vec<&NSString> = keys.iter().map(|k| &**k).collect();
        let share_map: Retained<NSDictionary<NSString, VZSharedDirectory>> =
            NSDictionary::from_retained_objects(&key_refs, &directories);
        let share = unsafe {
            VZMultipleDirectoryShare::initWithDirectories(
                VZMultipleDirectoryShare::alloc(),
                &share_map,
            )
        };
        unsafe { fs_device.setShare(Some(&share)) };
        let sharing: Retained<NSArray<objc2_virtualization::VZDirectorySharingDeviceConfiguration>> =
            NSArray::arrayWithObject(&fs_device);
        unsafe { vm_config.setDirectorySharingDevices(&sharing) };

        // Serial console on a pipe pair: host writes guest stdin,
        // guest stdout lands on the host read end. The only channel
        // into the guest.
        let (guest_in_read, host_in_write) = make_pipe()?;
        let (host_out_read, guest_out_write) = make_pipe()?;
        let read_handle = unsafe {
            NSFileHandle::initWithFileDescriptor(NSFileHandle::alloc(), guest_in_read.as_raw_fd())
        };
        let write_handle = unsafe {
            NSFileHandle::initWithFileDescriptor(NSFileHandle::alloc(), guest_out_write.as_raw_fd())
        };
        let serial_attachment = unsafe {
            VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
                VZFileHandleSerialPortAttachment::alloc(),
                Some(&read_handle),
                Some(&write_handle),
            )
        };
        let serial_port = unsafe { VZVirtioConsoleDeviceSerialPortConfiguration::new() };
        unsafe { serial_port.setAttachment(Some(&serial_attachment)) };
        let serial_ports: Retained<NSArray<VZSerialPortConfiguration>> =
            NSArray::arrayWithObject(&serial_port);
        unsafe { vm_config.setSerialPorts(&serial_ports) };

        unsafe { vm_config.validateWithError() }.map_err(|e| {
            SandboxError::Boot(format!(
                "invalid VM configuration: {}",
                e.localizedDescription()
            ))
        })?;

        let queue = DispatchQueue::new("dev.vibebox.vz", DispatchQueueAttr::SERIAL);
        let vm = unsafe {
            VZVirtualMachine::initWithConfiguration_queue(
                VZVirtualMachine::alloc(),
                &vm_config,
                &queue,
            )
        };

        debug!(
            cpus = config.cpus,
            memory = config.memory_bytes,
            shares = config.bindings.len(),
            "vm configuration validated"
        );

        Ok(Self {
            vm,
            queue,
            host_reader: Some(File::from(host_out_read)),
            host_writer: Some(File::from(host_in_write)),
            guest_fds: vec![guest_in_read, guest_out_write],
        })
    }

    /// Host-side console ends: (guest-output reader, guest-input writer).
    pub fn take_host_io(&mut self) -> Result<(File, File)> {
        match (self.host_reader.take(), self.host_writer.take()) {
            (Some(r), Some(w)) => Ok((r, w)),
            _ => bail!("console pipes already taken"),
        }
    }

    fn vm_ptr(&self) -> usize {
        Retained::as_ptr(&self.vm) as usize
    }

    /// Start the VM and wait for the framework to accept it, then poll
    /// until the state is "running".
    pub fn start(&self, timeout: Duration, cancel: &CancelToken) -> Result<()> {
        let (tx, rx) = mpsc::channel::<std::result::Result<(), String>>();
        let vm_ptr = self.vm_ptr();
        self.queue.exec_async(move || {
            // SAFETY: dereferenced on the VM's own queue.
            let vm = unsafe { &*(vm_ptr as *const VZVirtualMachine) };
            let tx = Mutex::new(Some(tx));
            let handler = RcBlock::new(move |err: *mut NSError| {
                let result = if err.is_null() {
                    Ok(())
                } else {
                    Err(unsafe { &*err }.localizedDescription().to_string())
                };
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(result);
                }
            });
            unsafe { vm.startWithCompletionHandler(&handler) };
        });

        match rx.recv_timeout(timeout) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SandboxError::Boot(format!("vm start failed: {}", e)).into()),
            Err(_) => {
                return Err(SandboxError::Boot(format!(
                    "vm start not acknowledged within {}s",
                    timeout.as_secs()
                ))
                .into());
            }
        }

        self.wait_for_state(VZVirtualMachineState::Running, timeout, cancel)
            .map_err(|e| SandboxError::Boot(format!("vm never reached running: {}", e)))?;
        info!("vm running");
        Ok(())
    }

    /// Read the VM state on its queue.
    pub fn state(&self) -> Result<VZVirtualMachineState> {
        let (tx, rx) = mpsc::channel();
        let vm_ptr = self.vm_ptr();
        self.queue.exec_async(move || {
            // SAFETY: dereferenced on the VM's own queue.
            let vm = unsafe { &*(vm_ptr as *const VZVirtualMachine) };
            let _ = tx.send(unsafe { vm.state() });
        });
        rx.recv_timeout(QUEUE_REPLY_TIMEOUT)
            .context("vm queue did not reply with state")
    }

    /// Poll the state at 100 ms granularity until it matches.
    pub fn wait_for_state(
        &self,
        desired: VZVirtualMachineState,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            cancel.check()?;
            if self.state()? == desired {
                return Ok(());
            }
            if started.elapsed() > timeout {
                return Err(SandboxError::Timeout(format!(
                    "vm did not reach state {:?} within {}s",
                    desired,
                    timeout.as_secs()
                ))
                .into());
            }
            std::thread::sleep(STATE_POLL_INTERVAL);
        }
    }

    /// Ask the guest to stop gracefully. Returns false when the VM
    /// cannot accept a stop request in its current state.
    pub fn request_stop(&self) -> bool {
        let (tx, rx) = mpsc::channel();
        let vm_ptr = self.vm_ptr();
        self.queue.exec_async(move || {
            // SAFETY: dereferenced on the VM's own queue.
            let vm = unsafe { &*(vm_ptr as *const VZVirtualMachine) };
            let requested = unsafe {
                if vm.canRequestStop() {
                    vm.requestStopWithError().is_ok()
                } else {
                    false
                }
            };
            let _ = tx.send(requested);
        });
        rx.recv_timeout(QUEUE_REPLY_TIMEOUT).unwrap_or(false)
    }

    /// Hard stop. Tolerates failure; the VM is torn down with the
    /// process either way.
    pub fn force_stop(&self, timeout: Duration) {
        let (tx, rx) = mpsc::channel::<bool>();
        let vm_ptr = self.vm_ptr();
        self.queue.exec_async(move || {
            // SAFETY: dereferenced on the VM's own queue.
            let vm = unsafe { &*(vm_ptr as *const VZVirtualMachine) };
            if unsafe { !vm.canStop() } {
                let _ = tx.send(false);
                return;
            }
            let tx = Mutex::new(Some(tx));
            let handler = RcBlock::new(move |err: *mut NSError| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(err.is_null());
                }
            });
            unsafe { vm.stopWithCompletionHandler(&handler) };
        });
        match rx.recv_timeout(timeout) {
            Ok(true) => info!("vm force-stopped"),
            Ok(false) => warn!("vm rejected force stop"),
            Err(_) => warn!("vm force stop timed out"),
        }
    }

    /// Release the guest-side pipe ends once the framework owns them.
    pub fn release_guest_fds(&mut self) {
        self.guest_fds.clear();
    }
}
