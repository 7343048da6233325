//! Storage classes the engine is prepared to negotiate for pull retrieval.

use std::collections::BTreeSet;

pub const CR_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.1";
pub const DX_IMAGE_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.1";
pub const DX_IMAGE_PROCESSING: &str = "1.2.840.10008.5.1.4.1.1.1.1.1";
pub const MG_IMAGE_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.2";
pub const MG_IMAGE_PROCESSING: &str = "1.2.840.10008.5.1.4.1.1.1.2.1";
pub const CT_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
pub const ENHANCED_CT_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.2.1";
pub const US_MULTIFRAME_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.3.1";
pub const MR_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
pub const ENHANCED_MR_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.4.1";
pub const US_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.6.1";
pub const SECONDARY_CAPTURE_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.7";
pub const GRAYSCALE_PRESENTATION_STATE: &str = "1.2.840.10008.5.1.4.1.1.11.1";
pub const XA_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.12.1";
pub const RF_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.12.2";
pub const NM_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.20";
pub const RAW_DATA: &str = "1.2.840.10008.5.1.4.1.1.66";
pub const SEGMENTATION: &str = "1.2.840.10008.5.1.4.1.1.66.4";
pub const VL_PHOTOGRAPHIC_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.77.1.4";
pub const BASIC_TEXT_SR: &str = "1.2.840.10008.5.1.4.1.1.88.11";
pub const ENHANCED_SR: &str = "1.2.840.10008.5.1.4.1.1.88.22";
pub const COMPREHENSIVE_SR: &str = "1.2.840.10008.5.1.4.1.1.88.33";
pub const KEY_OBJECT_SELECTION: &str = "1.2.840.10008.5.1.4.1.1.88.59";
pub const ENCAPSULATED_PDF: &str = "1.2.840.10008.5.1.4.1.1.104.1";
pub const PET_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.128";
pub const RT_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.481.1";
pub const RT_DOSE: &str = "1.2.840.10008.5.1.4.1.1.481.2";
pub const RT_STRUCTURE_SET: &str = "1.2.840.10008.5.1.4.1.1.481.3";
pub const RT_PLAN: &str = "1.2.840.10008.5.1.4.1.1.481.5";

/// Every storage class the engine knows about.
pub const STORAGE_CLASSES: &[&str] = &[
    CR_IMAGE,
    DX_IMAGE_PRESENTATION,
    DX_IMAGE_PROCESSING,
    MG_IMAGE_PRESENTATION,
    MG_IMAGE_PROCESSING,
    CT_IMAGE,
    ENHANCED_CT_IMAGE,
    US_MULTIFRAME_IMAGE,
    MR_IMAGE,
    ENHANCED_MR_IMAGE,
    US_IMAGE,
    SECONDARY_CAPTURE_IMAGE,
    GRAYSCALE_PRESENTATION_STATE,
    XA_IMAGE,
    RF_IMAGE,
    NM_IMAGE,
    RAW_DATA,
    SEGMENTATION,
    VL_PHOTOGRAPHIC_IMAGE,
    BASIC_TEXT_SR,
    ENHANCED_SR,
    COMPREHENSIVE_SR,
    KEY_OBJECT_SELECTION,
    ENCAPSULATED_PDF,
    PET_IMAGE,
    RT_IMAGE,
    RT_DOSE,
    RT_STRUCTURE_SET,
    RT_PLAN,
];

const MODALITY_CLASSES: &[(&str, &[&str])] = &[
    ("CR", &[CR_IMAGE, SECONDARY_CAPTURE_IMAGE]),
    ("CT", &[CT_IMAGE, ENHANCED_CT_IMAGE, SECONDARY_CAPTURE_IMAGE]),
    ("DX", &[DX_IMAGE_PRESENTATION, DX_IMAGE_PROCESSING, SECONDARY_CAPTURE_IMAGE]),
    ("MG", &[MG_IMAGE_PRESENTATION, MG_IMAGE_PROCESSING, SECONDARY_CAPTURE_IMAGE]),
    ("MR", &[MR_IMAGE, ENHANCED_MR_IMAGE, SECONDARY_CAPTURE_IMAGE]),
    ("NM", &[NM_IMAGE, SECONDARY_CAPTURE_IMAGE]),
    ("PT", &[PET_IMAGE, SECONDARY_CAPTURE_IMAGE]),
    ("US", &[US_IMAGE, US_MULTIFRAME_IMAGE, SECONDARY_CAPTURE_IMAGE]),
    ("XA", &[XA_IMAGE, SECONDARY_CAPTURE_IMAGE]),
    ("RF", &[RF_IMAGE, SECONDARY_CAPTURE_IMAGE]),
    ("XC", &[VL_PHOTOGRAPHIC_IMAGE, SECONDARY_CAPTURE_IMAGE]),
    ("OT", &[SECONDARY_CAPTURE_IMAGE, RAW_DATA]),
    ("SC", &[SECONDARY_CAPTURE_IMAGE]),
    ("PR", &[GRAYSCALE_PRESENTATION_STATE]),
    ("KO", &[KEY_OBJECT_SELECTION]),
    ("SR", &[BASIC_TEXT_SR, ENHANCED_SR, COMPREHENSIVE_SR]),
    ("DOC", &[ENCAPSULATED_PDF]),
    ("SEG", &[SEGMENTATION]),
    ("RTIMAGE", &[RT_IMAGE]),
    ("RTDOSE", &[RT_DOSE]),
    ("RTSTRUCT", &[RT_STRUCTURE_SET]),
    ("RTPLAN", &[RT_PLAN]),
];

/// Classes an instance of a series with this modality plausibly belongs to.
pub fn plausible_classes(modality: &str) -> Option<BTreeSet<String>> {
    let modality = modality.trim();
    MODALITY_CLASSES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(modality))
        .map(|(_, classes)| classes.iter().map(|class| class.to_string()).collect())
}

pub fn universe() -> BTreeSet<String> {
    STORAGE_CLASSES.iter().map(|class| class.to_string()).collect()
}
