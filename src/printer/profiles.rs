use std::fmt;

use serde::{Deserialize, Serialize};

use crate::printer::host::DeviceDescriptor;
use crate::printer::star;

pub const STAR_VENDOR_ID: u16 = 0x0519;
pub const EPSON_VENDOR_ID: u16 = 0x04b8;

/// Command dialect a printer expects. Resolved here, generated elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandLanguage {
    EscPos,
    StarLine,
    StarGraphics,
    StarPrnt,
}

impl CommandLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EscPos => "esc-pos",
            Self::StarLine => "star-line",
            Self::StarGraphics => "star-graphics",
            Self::StarPrnt => "star-prnt",
        }
    }
}

impl fmt::Display for CommandLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character table an external command encoder should use for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodepageMapping {
    Default,
    Zjiang,
    Mpt,
    Bixolon,
    Star,
    Epson,
    Citizen,
    Hp,
    Xprinter,
}

impl CodepageMapping {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Zjiang => "zjiang",
            Self::Mpt => "mpt",
            Self::Bixolon => "bixolon",
            Self::Star => "star",
            Self::Epson => "epson",
            Self::Citizen => "citizen",
            Self::Hp => "hp",
            Self::Xprinter => "xprinter",
        }
    }
}

impl fmt::Display for CodepageMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor id, optionally narrowed to a single product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Filter {
    pub vendor_id: u16,
    pub product_id: Option<u16>,
}

impl Filter {
    pub const fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id,
            product_id: None,
        }
    }

    pub const fn product(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id: Some(product_id),
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id.map_or(true, |p| p == product_id)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.product_id {
            Some(pid) => write!(f, "{:04x}:{:04x}", self.vendor_id, pid),
            None => write!(f, "{:04x}:*", self.vendor_id),
        }
    }
}

#[derive(Clone, Copy)]
pub enum LanguageSource {
    Fixed(CommandLanguage),
    /// Evaluated against the live descriptor once the device is open.
    Resolved(fn(&DeviceDescriptor) -> CommandLanguage),
}

impl fmt::Debug for LanguageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(language) => f.debug_tuple("Fixed").field(language).finish(),
            Self::Resolved(_) => f.write_str("Resolved(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceProfile {
    pub name: &'static str,
    pub filters: &'static [Filter],
    pub configuration: u8,
    pub interface: u8,
    /// Fixed bulk OUT endpoint; skips output endpoint discovery when set.
    pub endpoint: Option<u8>,
    pub language: LanguageSource,
    pub codepage_mapping: CodepageMapping,
}

impl DeviceProfile {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.filters.iter().any(|f| f.matches(vendor_id, product_id))
    }

    pub fn resolve_language(&self, device: &DeviceDescriptor) -> CommandLanguage {
        match self.language {
            LanguageSource::Fixed(language) => language,
            LanguageSource::Resolved(resolve) => resolve(device),
        }
    }
}

const fn esc_pos(
    name: &'static str,
    filters: &'static [Filter],
    codepage_mapping: CodepageMapping,
) -> DeviceProfile {
    DeviceProfile {
        name,
        filters,
        configuration: 1,
        interface: 0,
        endpoint: None,
        language: LanguageSource::Fixed(CommandLanguage::EscPos),
        codepage_mapping,
    }
}

/// Built-in catalog. Order matters: the first matching entry wins.
pub static DEVICE_PROFILES: &[DeviceProfile] = &[
    esc_pos(
        "POS-8022",
        &[Filter::product(0x0483, 0x5743)],
        CodepageMapping::Default,
    ),
    esc_pos(
        "Zjiang POS-5805/POS-8360",
        &[Filter::product(0x0416, 0x5011)],
        CodepageMapping::Zjiang,
    ),
    esc_pos(
        "MPT-II",
        &[Filter::product(0x0483, 0x5840)],
        CodepageMapping::Mpt,
    ),
    esc_pos(
        "Samsung SRP",
        &[Filter::vendor(0x0419), Filter::vendor(0x1504)],
        CodepageMapping::Bixolon,
    ),
    DeviceProfile {
        name: "Star",
        filters: &[Filter::vendor(STAR_VENDOR_ID)],
        configuration: 1,
        interface: 0,
        endpoint: None,
        language: LanguageSource::Resolved(star::resolve_language),
        codepage_mapping: CodepageMapping::Star,
    },
    esc_pos(
        "Epson",
        &[Filter::vendor(EPSON_VENDOR_ID)],
        CodepageMapping::Epson,
    ),
    esc_pos("Citizen", &[Filter::vendor(0x1d90)], CodepageMapping::Citizen),
    esc_pos("HP", &[Filter::vendor(0x05d9)], CodepageMapping::Hp),
    esc_pos("Fujitsu", &[Filter::vendor(0x04c5)], CodepageMapping::Epson),
    esc_pos(
        "Dtronic",
        &[Filter::product(0x0fe6, 0x811e)],
        CodepageMapping::Epson,
    ),
    esc_pos(
        "Xprinter",
        &[Filter::product(0x1fc9, 0x2016)],
        CodepageMapping::Xprinter,
    ),
];

pub fn find_profile(
    catalog: &'static [DeviceProfile],
    vendor_id: u16,
    product_id: u16,
) -> Option<&'static DeviceProfile> {
    catalog.iter().find(|p| p.matches(vendor_id, product_id))
}

/// Union of every filter in the catalog, in catalog order.
pub fn request_filters(catalog: &[DeviceProfile]) -> Vec<Filter> {
    catalog.iter().flat_map(|p| p.filters.iter().copied()).collect()
}
