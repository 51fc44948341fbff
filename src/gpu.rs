//! GPU capability → CUDA image selection.
//!
//! Pure lookup functions mapping an NVIDIA compute capability to the newest
//! CUDA build it supports, and a CUDA tag to a ComfyUI image variant. Detection
//! of the capability itself lives in [`crate::system`] so these functions stay
//! testable without hardware.

/// A `(major, minor)` compute capability, e.g. `(7, 5)` for Turing.
pub type ComputeCapability = (u8, u8);

/// Compute capability → CUDA build table.
///
/// Kepler/Maxwell top out at CUDA 11.8, Pascal through Turing at 12.6,
/// Ampere/Ada at 12.8, Hopper and newer at 13.0.
pub const CUDA_COMPATIBILITY: &[(ComputeCapability, &str)] = &[
    ((3, 5), "cu118"),
    ((3, 7), "cu118"),
    ((5, 0), "cu118"),
    ((5, 2), "cu118"),
    ((5, 3), "cu118"),
    ((6, 0), "cu126"),
    ((6, 1), "cu126"),
    ((6, 2), "cu126"),
    ((7, 0), "cu126"),
    ((7, 2), "cu126"),
    ((7, 5), "cu126"),
    ((8, 0), "cu128"),
    ((8, 6), "cu128"),
    ((8, 7), "cu128"),
    ((8, 9), "cu128"),
    ((9, 0), "cu130"),
];

/// ComfyUI image per CUDA build, plus the CPU-only variant.
pub const COMFYUI_IMAGES: &[(&str, &str)] = &[
    ("cu118", "docker.io/yanwk/comfyui-boot:cu118-slim"),
    ("cu126", "docker.io/yanwk/comfyui-boot:cu126-megapak"),
    ("cu128", "docker.io/yanwk/comfyui-boot:cu128-slim"),
    ("cu130", "docker.io/yanwk/comfyui-boot:cu130-slim"),
    (CPU_VARIANT, "docker.io/yanwk/comfyui-boot:cpu"),
];

/// CUDA build used when the capability is unknown or unsupported.
pub const DEFAULT_CUDA_VERSION: &str = "cu126";

/// Tag of the CPU-only image variant.
pub const CPU_VARIANT: &str = "cpu";

/// Select the CUDA build for a compute capability.
///
/// Exact table hits win. Otherwise every entry with the same major and a
/// lower-or-equal minor, or a strictly lower major, is compatible and the newest
/// CUDA tag among them is chosen. With no compatible entry (or no capability at
/// all) the result is [`DEFAULT_CUDA_VERSION`].
pub fn select_version(capability: Option<ComputeCapability>) -> &'static str {
    let Some((major, minor)) = capability else {
        return DEFAULT_CUDA_VERSION;
    };

    if let Some((_, version)) = CUDA_COMPATIBILITY
        .iter()
        .find(|(cap, _)| *cap == (major, minor))
    {
        return version;
    }

    let mut best: Option<&'static str> = None;
    for &((cap_major, cap_minor), version) in CUDA_COMPATIBILITY {
        let compatible = (cap_major == major && cap_minor <= minor) || cap_major < major;
        if !compatible {
            continue;
        }
        best = match best {
            Some(current) if !is_newer(version, current) => Some(current),
            _ => Some(version),
        };
    }

    best.unwrap_or(DEFAULT_CUDA_VERSION)
}

/// Map a CUDA tag to its ComfyUI image.
///
/// `force_cpu` always yields the CPU image. A missing or unknown tag falls back
/// to the image of [`DEFAULT_CUDA_VERSION`].
pub fn image_for(version: Option<&str>, force_cpu: bool) -> &'static str {
    let tag = if force_cpu {
        CPU_VARIANT
    } else {
        version.unwrap_or(DEFAULT_CUDA_VERSION)
    };

    lookup_image(tag)
        .or_else(|| lookup_image(DEFAULT_CUDA_VERSION))
        .unwrap_or(COMFYUI_IMAGES[1].1)
}

fn lookup_image(tag: &str) -> Option<&'static str> {
    COMFYUI_IMAGES
        .iter()
        .find(|(variant, _)| *variant == tag)
        .map(|(_, image)| *image)
}

/// Numeric part of a `cuNNN` tag; anything else counts as zero.
fn version_number(tag: &str) -> u32 {
    tag.strip_prefix("cu")
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

/// Whether CUDA tag `a` is strictly newer than `b`.
pub fn is_newer(a: &str, b: &str) -> bool {
    version_number(a) > version_number(b)
}

/// Human-readable summary of a GPU detection, e.g.
/// `"CUDA 12.6 (cu126) for compute 7.5"`.
pub fn describe(
    has_gpu: bool,
    gpu_name: &str,
    capability: Option<ComputeCapability>,
    selected: &str,
) -> String {
    if !has_gpu {
        return format!("not available ({})", gpu_name);
    }

    let Some((major, minor)) = capability else {
        return format!("selected {} (compute capability unknown)", selected);
    };

    let display = match selected {
        "cu118" => "CUDA 11.8",
        "cu126" => "CUDA 12.6",
        "cu128" => "CUDA 12.8",
        "cu130" => "CUDA 13.0",
        other => other,
    };

    format!(
        "{} ({}) for compute {}.{}",
        display, selected, major, minor
    )
}
