use serde::{Deserialize, Serialize};

/// Guest CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Arm64,
    Amd64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arm64 => "arm64",
            Self::Amd64 => "amd64",
        }
    }

    /// Architecture of the host this binary was compiled for.
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Self::Arm64
        } else {
            Self::Amd64
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which backend consumes an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageBackend {
    Vm,
    Docker,
}

/// An official image: immutable, compile-time constant.
#[derive(Debug, Clone, Copy)]
pub struct ImageDescriptor {
    pub id: &'static str,
    pub display_name: &'static str,
    pub version: &'static str,
    pub arch: Arch,
    pub url: &'static str,
    /// File name of the downloaded archive inside the cache directory.
    pub artifact_name: &'static str,
    /// Name of the archive member holding the flat disk image.
    pub raw_member: &'static str,
    /// Lowercase hex sha256 of the artifact.
    pub sha256: &'static str,
    pub size_bytes: u64,
    pub backend: ImageBackend,
}

impl ImageDescriptor {
    /// Lock-file key: `<id>@<version>`.
    pub fn lock_key(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }
}

/// The official image table. Ordering is display order.
pub const OFFICIAL_IMAGES: &[ImageDescriptor] = &[
    ImageDescriptor {
        id: "ubuntu-24.04",
        display_name: "Ubuntu 24.04 LTS (serial console)",
        version: "24.04.2",
        arch: Arch::Arm64,
        url: "https://images.vibebox.dev/ubuntu/24.04.2/vibebox-ubuntu-24.04.2-arm64.tar.gz",
        artifact_name: "vibebox-ubuntu-24.04.2-arm64.tar.gz",
        raw_member: "disk.raw",
        sha256: "8a1f0c3a2c4b9a55f7f3c6bfb0a2d4e8a7c91d25b63340fa9eab2c8a51d7e0f4",
        size_bytes: 1_610_612_736,
        backend: ImageBackend::Vm,
    },
    ImageDescriptor {
        id: "ubuntu-24.04",
        display_name: "Ubuntu 24.04 LTS (serial console)",
        version: "24.04.2",
        arch: Arch::Amd64,
        url: "https://images.vibebox.dev/ubuntu/24.04.2/vibebox-ubuntu-24.04.2-amd64.tar.gz",
        artifact_name: "vibebox-ubuntu-24.04.2-amd64.tar.gz",
        raw_member: "disk.raw",
        sha256: "d92c47e7a81f5b0c4d7c2aa64f0ce06be0cf5d8a113e4a9b8725c4f0d19a6b3c",
        size_bytes: 1_664_299_827,
        backend: ImageBackend::Vm,
    },
    ImageDescriptor {
        id: "alpine-3.20",
        display_name: "Alpine 3.20 (minimal)",
        version: "3.20.3",
        arch: Arch::Arm64,
        url: "https://images.vibebox.dev/alpine/3.20.3/vibebox-alpine-3.20.3-arm64.tar.gz",
        artifact_name: "vibebox-alpine-3.20.3-arm64.tar.gz",
        raw_member: "disk.raw",
        sha256: "4b6e1a0d8f2c5e7a9b3d1f6c8e0a2b4d6f8a0c2e4a6b8d0f2a4c6e8b0d2f4a6c",
        size_bytes: 268_435_456,
        backend: ImageBackend::Vm,
    },
    ImageDescriptor {
        id: "ubuntu-docker",
        display_name: "Ubuntu 24.04 (docker)",
        version: "24.04",
        arch: Arch::Arm64,
        url: "",
        artifact_name: "",
        raw_member: "",
        sha256: "",
        size_bytes: 0,
        backend: ImageBackend::Docker,
    },
];

/// Look up an image by id, preferring the host architecture.
pub fn find(id: &str) -> Option<&'static ImageDescriptor> {
    find_for_arch(id, Arch::host()).or_else(|| OFFICIAL_IMAGES.iter().find(|img| img.id == id))
}

/// Look up an image by id and architecture.
pub fn find_for_arch(id: &str, arch: Arch) -> Option<&'static ImageDescriptor> {
    OFFICIAL_IMAGES
        .iter()
        .find(|img| img.id == id && img.arch == arch)
}

/// All images runnable on the given architecture.
pub fn for_arch(arch: Arch) -> Vec<&'static ImageDescriptor> {
    OFFICIAL_IMAGES
        .iter()
        .filter(|img| img.arch == arch)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_descriptors_are_well_formed() {
        for img in OFFICIAL_IMAGES {
            if img.backend == ImageBackend::Vm {
                assert_eq!(img.sha256.len(), 64, "{}: bad digest length", img.id);
                assert!(
                    img.sha256.chars().all(|c| c.is_ascii_hexdigit()),
                    "{}: digest not hex",
                    img.id
                );
                assert!(img.url.starts_with("https://"), "{}: bad url", img.id);
                assert!(!img.raw_member.is_empty());
                assert!(img.size_bytes > 0);
            }
        }
    }

    #[test]
    fn test_find_prefers_host_arch() {
        let img = find("ubuntu-24.04").unwrap();
        assert_eq!(img.arch, Arch::host());
    }

    #[test]
    fn test_find_for_arch() {
        let img = find_for_arch("ubuntu-24.04", Arch::Amd64).unwrap();
        assert_eq!(img.arch, Arch::Amd64);
        assert!(find_for_arch("ubuntu-24.04", Arch::Arm64).is_some());
        assert!(find_for_arch("no-such-image", Arch::Arm64).is_none());
    }

    #[test]
    fn test_for_arch_filters() {
        for img in for_arch(Arch::Arm64) {
            assert_eq!(img.arch, Arch::Arm64);
        }
    }

    #[test]
    fn test_lock_key_format() {
        let img = find_for_arch("alpine-3.20", Arch::Arm64).unwrap();
        assert_eq!(img.lock_key(), "alpine-3.20@3.20.3");
    }
}
