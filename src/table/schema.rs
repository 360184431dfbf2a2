use arrow::datatypes::DataType;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Declared type for every known column across the scanner and panel files.
///
/// Dimension identifiers are unsigned on purpose: the codes are never
/// negative, and the unsigned width doubles the representable range for the
/// same storage. `feature` and `display` are signed so the −1 "no promotion
/// recorded" sentinel fits.
pub static COLUMN_TYPES: Lazy<HashMap<&'static str, DataType>> = Lazy::new(|| {
    use DataType::*;
    let mut m = HashMap::new();
    // product master
    m.insert("upc", UInt64);
    m.insert("upc_ver_uc", UInt8);
    m.insert("product_module_code", UInt16);
    m.insert("product_group_code", UInt16);
    m.insert("department_code", UInt16);
    m.insert("brand_code_uc", UInt32);
    m.insert("multi", UInt16);
    m.insert("size1_code_uc", UInt16);
    m.insert("size1_amount", Float64);
    // stores
    m.insert("year", UInt16);
    m.insert("panel_year", UInt16);
    m.insert("dma_code", UInt16);
    m.insert("retailer_code", UInt16);
    m.insert("parent_code", UInt16);
    m.insert("store_zip3", UInt16);
    m.insert("fips_county_code", UInt16);
    m.insert("fips_state_code", UInt8);
    m.insert("store_code_uc", UInt32);
    // movement
    m.insert("week_end", UInt32);
    m.insert("units", UInt64);
    m.insert("prmult", UInt8);
    m.insert("price", Float64);
    m.insert("feature", Int16);
    m.insert("display", Int16);
    // panel
    m.insert("household_code", UInt32);
    m.insert("Household_Cd", UInt32);
    m.insert("Panel_Year", UInt16);
    m.insert("Projection_Factor", UInt32);
    m.insert("DMA_Cd", UInt16);
    m.insert("trip_code_uc", UInt64);
    m.insert("purchase_date", Utf8);
    m.insert("total_spent", Float64);
    m.insert("quantity", UInt16);
    m.insert("total_price_paid", Float64);
    m.insert("coupon_value", Float64);
    m.insert("deal_flag_uc", UInt8);
    // extra characteristics: <name>_code / <name>_descr pairs
    for code in [
        "flavor_code",
        "form_code",
        "formula_code",
        "container_code",
        "salt_content_code",
        "style_code",
        "type_code",
        "product_code",
        "variety_code",
        "organic_claim_code",
        "usda_organic_seal_code",
        "common_consumer_name_code",
        "strength_code",
        "scent_code",
        "dosage_code",
        "gender_code",
        "target_skin_condition_code",
        "use_code",
        "size2_code",
    ] {
        m.insert(code, UInt64);
    }
    m.insert("size2_amount", Float64);
    m
});

/// Low-cardinality text columns stored dictionary-encoded after the read.
pub const DICT_COLUMNS: &[&str] = &["size1_units", "product_module_descr", "channel_type"];

/// Declared type for `name`; unknown columns are read as plain text.
pub fn column_type(name: &str) -> DataType {
    COLUMN_TYPES
        .get(name)
        .cloned()
        .unwrap_or(DataType::Utf8)
}
