use std::path::Path;

use crate::printer::profiles::{Filter, DEVICE_PROFILES};

const UDEV_RULES_PATH: &str = "/etc/udev/rules.d/99-receipt-printers.rules";

pub fn check_usb_access() -> Vec<String> {
    let mut warnings = Vec::new();

    if !Path::new(UDEV_RULES_PATH).exists() {
        warnings.push(format!(
            "Linux: udev rules not found at {UDEV_RULES_PATH}. \
             Install them for non-root USB access, for example:\n{}",
            udev_rules(DEVICE_PROFILES.iter().flat_map(|p| p.filters.iter()))
        ));
    }

    if let Ok(output) = std::process::Command::new("groups").output() {
        let groups = String::from_utf8_lossy(&output.stdout);
        if !groups.contains("plugdev") && !groups.contains("lp") {
            warnings.push(
                "Linux: Current user not in 'plugdev' or 'lp' group. \
                 USB printer access may require group membership."
                    .to_string(),
            );
        }
    }

    warnings
}

/// One rule per filter, deduplicated, granting the `plugdev` group access.
fn udev_rules<'a>(filters: impl IntoIterator<Item = &'a Filter>) -> String {
    let mut lines: Vec<String> = Vec::new();

    for filter in filters {
        let mut rule = format!(
            "SUBSYSTEM==\"usb\", ATTR{{idVendor}}==\"{:04x}\"",
            filter.vendor_id
        );
        if let Some(pid) = filter.product_id {
            rule.push_str(&format!(", ATTR{{idProduct}}==\"{pid:04x}\""));
        }
        rule.push_str(", MODE=\"0664\", GROUP=\"plugdev\"");

        if !lines.contains(&rule) {
            lines.push(rule);
        }
    }

    lines.join("\n")
}
