// Swapchain color format selection
//
// Runtimes list the formats they can allocate, in their own order. We walk a
// fixed preference list (most precise first) and take the first one the
// runtime offers. 8-bit linear formats band visibly, so they only win when
// nothing better is available. Codes use Vulkan numbering.

use crate::error::{XrError, XrResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub code: i64,
    pub name: &'static str,
}

pub const A2B10G10R10_UNORM: PixelFormat = PixelFormat { code: 64, name: "A2B10G10R10_UNORM_PACK32" };
pub const R16G16B16A16_SFLOAT: PixelFormat = PixelFormat { code: 97, name: "R16G16B16A16_SFLOAT" };
pub const R8G8B8A8_UNORM: PixelFormat = PixelFormat { code: 37, name: "R8G8B8A8_UNORM" };
pub const R8G8B8A8_SNORM: PixelFormat = PixelFormat { code: 38, name: "R8G8B8A8_SNORM" };
pub const R8G8B8A8_SRGB: PixelFormat = PixelFormat { code: 43, name: "R8G8B8A8_SRGB" };
pub const B8G8R8A8_UNORM: PixelFormat = PixelFormat { code: 44, name: "B8G8R8A8_UNORM" };
pub const B8G8R8A8_SRGB: PixelFormat = PixelFormat { code: 50, name: "B8G8R8A8_SRGB" };

/// Color formats we render into, best first.
pub const COLOR_FORMAT_PREFERENCE: [PixelFormat; 4] = [
    A2B10G10R10_UNORM,
    R16G16B16A16_SFLOAT,
    // Fallback only: linear 8-bit, not enough bits for smooth gradients
    R8G8B8A8_UNORM,
    R8G8B8A8_SNORM,
];

const KNOWN_FORMATS: [PixelFormat; 7] = [
    A2B10G10R10_UNORM,
    R16G16B16A16_SFLOAT,
    R8G8B8A8_UNORM,
    R8G8B8A8_SNORM,
    R8G8B8A8_SRGB,
    B8G8R8A8_UNORM,
    B8G8R8A8_SRGB,
];

/// Human-readable name for a format code, for logs.
pub fn format_name(code: i64) -> &'static str {
    KNOWN_FORMATS
        .iter()
        .find(|format| format.code == code)
        .map(|format| format.name)
        .unwrap_or("UNKNOWN")
}

/// Pick the first entry of `preference` that the runtime supports.
pub fn choose_format(supported: &[i64], preference: &[PixelFormat]) -> XrResult<PixelFormat> {
    if supported.is_empty() {
        return Err(XrError::Consistency(
            "runtime reported no swapchain formats".to_string(),
        ));
    }

    for &code in supported {
        log::debug!("Swapchain format: {:#x} {}", code, format_name(code));
    }

    let chosen = preference
        .iter()
        .copied()
        .find(|format| supported.contains(&format.code))
        .ok_or_else(|| {
            XrError::Consistency(format!(
                "no runtime swapchain format supported for color swapchain (runtime offers {:?})",
                supported
            ))
        })?;

    log::info!("Selected format {:#x} {}", chosen.code, chosen.name);
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preference_order_beats_runtime_order() {
        let supported = [R8G8B8A8_UNORM.code, R16G16B16A16_SFLOAT.code, A2B10G10R10_UNORM.code];
        let chosen = choose_format(&supported, &COLOR_FORMAT_PREFERENCE).unwrap();
        assert_eq!(chosen, A2B10G10R10_UNORM);
    }

    #[test]
    fn low_precision_only_as_last_resort() {
        let supported = [B8G8R8A8_SRGB.code, R8G8B8A8_SNORM.code, R8G8B8A8_UNORM.code];
        let chosen = choose_format(&supported, &COLOR_FORMAT_PREFERENCE).unwrap();
        assert_eq!(chosen, R8G8B8A8_UNORM);
    }

    #[test]
    fn empty_list_is_a_consistency_violation() {
        let err = choose_format(&[], &COLOR_FORMAT_PREFERENCE).unwrap_err();
        assert!(matches!(err, XrError::Consistency(_)));
    }

    #[test]
    fn no_match_is_a_consistency_violation() {
        let err = choose_format(&[B8G8R8A8_SRGB.code], &COLOR_FORMAT_PREFERENCE).unwrap_err();
        assert!(matches!(err, XrError::Consistency(_)));
    }

    #[test]
    fn names_for_logging() {
        assert_eq!(format_name(97), "R16G16B16A16_SFLOAT");
        assert_eq!(format_name(12345), "UNKNOWN");
    }
}
