use std::process::Command;

/// Lower-case names that show up in CUPS URIs of printers the catalog covers.
const RECEIPT_BRANDS: &[&str] = &[
    "epson", "star", "citizen", "zjiang", "samsung", "bixolon", "hp", "fujitsu", "xprinter",
    "pos-80", "pos-58",
];

/// A CUPS printer that may be claiming a USB interface we need.
#[derive(Debug, Clone)]
pub struct CupsPrinter {
    pub name: String,
    pub uri: String,
    pub is_usb: bool,
    pub is_receipt_printer: bool,
}

/// Warn about CUPS queues that would keep the driver from claiming a printer.
pub fn check_usb_access() -> Vec<String> {
    detect_cups_printers()
        .iter()
        .filter(|p| p.is_usb && p.is_receipt_printer)
        .map(|p| {
            format!(
                "CUPS conflict: \"{}\" is claiming USB. \
                 Remove it from System Settings > Printers & Scanners, \
                 or run: lpadmin -x {}",
                p.name, p.name
            )
        })
        .collect()
}

pub fn detect_cups_printers() -> Vec<CupsPrinter> {
    let output = match Command::new("lpstat").arg("-v").output() {
        Ok(o) => o,
        Err(e) => {
            tracing::debug!("lpstat not available: {e}");
            return Vec::new();
        }
    };

    if !output.status.success() {
        // exit code 1 with "No destinations added" just means an empty list
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("No destinations") {
            tracing::debug!("lpstat failed: {stderr}");
        }
        return Vec::new();
    }

    parse_lpstat_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `lpstat -v` lines of the form `device for <name>: <uri>`.
fn parse_lpstat_output(output: &str) -> Vec<CupsPrinter> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("device for ")?;
            let (name, uri) = rest.split_once(": ")?;
            let (name, uri) = (name.trim().to_string(), uri.trim().to_string());

            let haystack = format!("{} {}", name, uri).to_lowercase();
            // "hp" alone is too short to search the name for
            let is_receipt_printer = RECEIPT_BRANDS.iter().any(|brand| match *brand {
                "hp" => uri.to_lowercase().starts_with("usb://hp/"),
                brand => haystack.contains(brand),
            });

            Some(CupsPrinter {
                is_usb: uri.starts_with("usb://"),
                is_receipt_printer,
                name,
                uri,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_epson_usb_printer() {
        let output = "device for EPSON_TM_T88VI: usb://EPSON/TM-T88VI?serial=J2CE012345\n";
        let printers = parse_lpstat_output(output);
        assert_eq!(printers.len(), 1);
        assert!(printers[0].is_usb);
        assert!(printers[0].is_receipt_printer);
        assert_eq!(printers[0].name, "EPSON_TM_T88VI");
    }

    #[test]
    fn parse_star_usb_printer() {
        let output = "device for Star_TSP143__STR_T_001_: usb://Star/TSP143%20(STR_T-001)?serial=1234\n";
        let printers = parse_lpstat_output(output);
        assert!(printers[0].is_usb && printers[0].is_receipt_printer);
    }

    #[test]
    fn parse_network_printer_no_conflict() {
        let output = "device for Brother_Laser: ipp://192.168.1.100/ipp/print\n";
        let printers = parse_lpstat_output(output);
        assert_eq!(printers.len(), 1);
        assert!(!printers[0].is_usb);
        assert!(!printers[0].is_receipt_printer);
    }

    #[test]
    fn parse_multiple_printers() {
        let output = "\
device for EPSON_TM_T88VI: usb://EPSON/TM-T88VI?serial=J2CE012345
device for Brother_Laser: ipp://192.168.1.100/ipp/print
device for CITIZEN_CT_S310II: usb://CITIZEN/CT-S310II?serial=ABC123
";
        let printers = parse_lpstat_output(output);
        assert_eq!(printers.len(), 3);

        let conflicting = printers
            .iter()
            .filter(|p| p.is_usb && p.is_receipt_printer)
            .count();
        assert_eq!(conflicting, 2);
    }

    #[test]
    fn parse_empty_output() {
        assert!(parse_lpstat_output("").is_empty());
    }
}
