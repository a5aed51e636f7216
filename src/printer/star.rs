//! Star Micronics language detection.
//!
//! Star reuses product ids across models that speak different command
//! languages, so the language is picked from the reported product name.
//! Firmware revisions spell the same model differently:
//!
//! - `TSP654 (STR_T-001)` is a `TSP650`
//! - `Star TSP143IIIU` is a `TSP100III`

use std::sync::LazyLock;

use regex::Regex;

use crate::printer::host::DeviceDescriptor;
use crate::printer::profiles::CommandLanguage;

/// Revision suffixes as they appear in canonical names.
const REVISIONS: &[&str] = &["III", "II", "IV", "VI", "V"];

static BRAND: LazyLock<Regex> = LazyLock::new(|| regex(r"(?i)^Star\s+"));
static SERIES_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^TSP(1|4|6|7|8|10)(13|43)(.*)$"));
static VARIANT_DIGIT: LazyLock<Regex> = LazyLock::new(|| regex(r"^TSP(55|65)(1|4)(.*)$"));
// longer suffixes first so `III` is not read as `II` + `I`
static REVISION: LazyLock<Regex> = LazyLock::new(|| regex(r"^TSP([0-9]+)(III|II|IV|VI|V)?.*$"));

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid pattern")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedName {
    pub base: String,
    pub revision: Option<&'static str>,
}

impl NormalizedName {
    pub fn canonical(&self) -> String {
        match self.revision {
            Some(rev) => format!("{}{}", self.base, rev),
            None => self.base.clone(),
        }
    }
}

pub fn normalize_product_name(name: &str) -> NormalizedName {
    let name = BRAND.replace(name, "");
    let name = collapse_series_digits(&name);
    let name = collapse_variant_digit(&name);
    split_revision(&name)
}

pub fn resolve_language(device: &DeviceDescriptor) -> CommandLanguage {
    let name = device.product_name.as_deref().unwrap_or_default();
    let language = language_for_name(&normalize_product_name(name).canonical());

    tracing::debug!(product_name = name, %language, "Resolved Star language");
    language
}

fn language_for_name(name: &str) -> CommandLanguage {
    match name {
        "TSP100IV" | "mPOP" | "mC-Label3" | "mC-Print3" | "mC-Print2" => CommandLanguage::StarPrnt,
        "TSP100" | "TSP100II" | "TSP100III" => CommandLanguage::StarGraphics,
        "BSC10" | "BSC10BR" | "BSC10II" => CommandLanguage::EscPos,
        _ => CommandLanguage::StarLine,
    }
}

/// `TSP143IIIU` -> `TSP100IIIU`, `TSP613` -> `TSP600`.
fn collapse_series_digits(name: &str) -> String {
    SERIES_DIGITS.replace(name, "TSP${1}00${3}").into_owned()
}

/// `TSP654` -> `TSP650`, `TSP551` -> `TSP550`.
fn collapse_variant_digit(name: &str) -> String {
    VARIANT_DIGIT.replace(name, "TSP${1}0${3}").into_owned()
}

/// `TSP100IIIU` -> `TSP100` + `III`. Anything after the revision is dropped.
fn split_revision(name: &str) -> NormalizedName {
    let Some(caps) = REVISION.captures(name) else {
        return NormalizedName {
            base: name.to_string(),
            revision: None,
        };
    };

    NormalizedName {
        base: format!("TSP{}", &caps[1]),
        revision: caps
            .get(2)
            .and_then(|m| REVISIONS.iter().copied().find(|r| *r == m.as_str())),
    }
}
