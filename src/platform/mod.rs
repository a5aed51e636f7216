#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
pub mod macos;

/// Things that commonly stop raw USB access, as human readable warnings.
pub fn check_prerequisites() -> Vec<String> {
    let mut warnings = Vec::new();

    #[cfg(target_os = "macos")]
    {
        warnings.extend(macos::check_usb_access());
    }

    #[cfg(target_os = "linux")]
    {
        warnings.extend(linux::check_usb_access());
    }

    warnings
}
