//! Schema registry: exact tag lookup with an ordered version fallback.
//!
//! Lookup for `(tag, version)` tries, in order:
//! 1. the definition registered for exactly that version;
//! 2. the highest registered version below it (older vintage, columns
//!    usually a subset of the newer layout);
//! 3. the lowest registered version above it.

use crate::{PartitionScheme, SchemaDefinition, TagKey};

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: Vec<SchemaDefinition>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the report families shipped with the pipeline.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(trading_price_v2());
        registry.register(trading_price_v3());
        registry.register(dispatch_unit_scada_v1());
        registry.register(mtpasa_duid_availability_v1());
        registry
    }

    /// Adds a definition, replacing any existing one with the same tag and version.
    pub fn register(&mut self, schema: SchemaDefinition) {
        self.schemas.retain(|existing| {
            !(existing.category == schema.category
                && existing.subtype == schema.subtype
                && existing.version == schema.version)
        });
        self.schemas.push(schema);
    }

    pub fn contains(&self, key: &TagKey) -> bool {
        self.schemas
            .iter()
            .any(|s| s.category == key.category && s.subtype == key.subtype)
    }

    pub fn versions(&self, key: &TagKey) -> Vec<u32> {
        let mut versions = self
            .schemas
            .iter()
            .filter(|s| s.category == key.category && s.subtype == key.subtype)
            .map(|s| s.version)
            .collect::<Vec<_>>();
        versions.sort_unstable();
        versions
    }

    pub fn lookup(&self, key: &TagKey, version: u32) -> Option<&SchemaDefinition> {
        let candidates = self
            .schemas
            .iter()
            .filter(|s| s.category == key.category && s.subtype == key.subtype)
            .collect::<Vec<_>>();

        if let Some(exact) = candidates.iter().copied().find(|s| s.version == version) {
            return Some(exact);
        }
        if let Some(older) = candidates
            .iter()
            .copied()
            .filter(|s| s.version < version)
            .max_by_key(|s| s.version)
        {
            return Some(older);
        }
        candidates
            .into_iter()
            .filter(|s| s.version > version)
            .min_by_key(|s| s.version)
    }

    /// Newest registered definition for a tag.
    pub fn latest(&self, key: &TagKey) -> Option<&SchemaDefinition> {
        self.lookup(key, u32::MAX)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaDefinition> {
        self.schemas.iter()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

const PRICE_FLOATS: &[&str] = &[
    "RRP",
    "EEP",
    "ROP",
    "RAISE6SECRRP",
    "RAISE6SECROP",
    "RAISE60SECRRP",
    "RAISE60SECROP",
    "RAISE5MINRRP",
    "RAISE5MINROP",
    "RAISEREGRRP",
    "RAISEREGROP",
    "LOWER6SECRRP",
    "LOWER6SECROP",
    "LOWER60SECRRP",
    "LOWER60SECROP",
    "LOWER5MINRRP",
    "LOWER5MINROP",
    "LOWERREGRRP",
    "LOWERREGROP",
    "RAISE1SECRRP",
    "RAISE1SECROP",
    "LOWER1SECRRP",
    "LOWER1SECROP",
];

fn trading_price(version: u32, columns: &[&str]) -> SchemaDefinition {
    SchemaDefinition {
        category: "TRADING".to_string(),
        subtype: "PRICE".to_string(),
        version,
        columns: strings(columns),
        natural_key: strings(&["SETTLEMENTDATE", "REGIONID"]),
        timestamp_columns: strings(&["SETTLEMENTDATE", "LASTCHANGED"]),
        float_columns: strings(PRICE_FLOATS),
        int_columns: strings(&["RUNNO", "PERIODID", "INVALIDFLAG"]),
        category_columns: strings(&["REGIONID", "PRICE_STATUS"]),
        primary_timestamp: "SETTLEMENTDATE".to_string(),
        region_column: Some("REGIONID".to_string()),
        partitioning: PartitionScheme::YearMonthRegion,
        date_partition_column: "trading_date".to_string(),
    }
}

/// Vintage carrying regional offer prices alongside every FCAS price.
fn trading_price_v2() -> SchemaDefinition {
    trading_price(
        2,
        &[
            "SETTLEMENTDATE",
            "RUNNO",
            "REGIONID",
            "PERIODID",
            "RRP",
            "EEP",
            "INVALIDFLAG",
            "LASTCHANGED",
            "ROP",
            "RAISE6SECRRP",
            "RAISE6SECROP",
            "RAISE60SECRRP",
            "RAISE60SECROP",
            "RAISE5MINRRP",
            "RAISE5MINROP",
            "RAISEREGRRP",
            "RAISEREGROP",
            "LOWER6SECRRP",
            "LOWER6SECROP",
            "LOWER60SECRRP",
            "LOWER60SECROP",
            "LOWER5MINRRP",
            "LOWER5MINROP",
            "LOWERREGRRP",
            "LOWERREGROP",
            "RAISE1SECRRP",
            "RAISE1SECROP",
            "LOWER1SECRRP",
            "LOWER1SECROP",
            "PRICE_STATUS",
        ],
    )
}

fn trading_price_v3() -> SchemaDefinition {
    trading_price(
        3,
        &[
            "SETTLEMENTDATE",
            "RUNNO",
            "REGIONID",
            "PERIODID",
            "RRP",
            "EEP",
            "INVALIDFLAG",
            "LASTCHANGED",
            "RAISE6SECRRP",
            "RAISE60SECRRP",
            "RAISE5MINRRP",
            "RAISEREGRRP",
            "LOWER6SECRRP",
            "LOWER60SECRRP",
            "LOWER5MINRRP",
            "LOWERREGRRP",
            "RAISE1SECRRP",
            "LOWER1SECRRP",
            "PRICE_STATUS",
        ],
    )
}

fn dispatch_unit_scada_v1() -> SchemaDefinition {
    SchemaDefinition {
        category: "DISPATCH".to_string(),
        subtype: "UNIT_SCADA".to_string(),
        version: 1,
        columns: strings(&["SETTLEMENTDATE", "DUID", "SCADAVALUE", "LASTCHANGED"]),
        natural_key: strings(&["SETTLEMENTDATE", "DUID"]),
        timestamp_columns: strings(&["SETTLEMENTDATE", "LASTCHANGED"]),
        float_columns: strings(&["SCADAVALUE"]),
        int_columns: Vec::new(),
        category_columns: strings(&["DUID"]),
        primary_timestamp: "SETTLEMENTDATE".to_string(),
        region_column: None,
        partitioning: PartitionScheme::Date,
        date_partition_column: "dispatch_date".to_string(),
    }
}

fn mtpasa_duid_availability_v1() -> SchemaDefinition {
    SchemaDefinition {
        category: "MTPASA".to_string(),
        subtype: "DUIDAVAILABILITY".to_string(),
        version: 1,
        columns: strings(&[
            "PUBLISH_DATETIME",
            "DAY",
            "REGIONID",
            "DUID",
            "PASAAVAILABILITY",
            "LATEST_OFFER_DATETIME",
            "LASTCHANGED",
            "CARRYOVERSTATUS",
            "PASAUNITSTATE",
            "PASARECALLTIME",
        ]),
        natural_key: strings(&["PUBLISH_DATETIME", "DAY", "DUID"]),
        timestamp_columns: strings(&[
            "PUBLISH_DATETIME",
            "DAY",
            "LATEST_OFFER_DATETIME",
            "LASTCHANGED",
        ]),
        float_columns: strings(&["PASAAVAILABILITY", "CARRYOVERSTATUS", "PASARECALLTIME"]),
        int_columns: Vec::new(),
        category_columns: strings(&["REGIONID", "DUID", "PASAUNITSTATE"]),
        primary_timestamp: "PUBLISH_DATETIME".to_string(),
        region_column: Some("REGIONID".to_string()),
        partitioning: PartitionScheme::Date,
        date_partition_column: "report_date".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_version_wins() {
        let registry = SchemaRegistry::builtin();
        let key = TagKey::new("TRADING", "PRICE");
        assert_eq!(registry.lookup(&key, 2).unwrap().columns.len(), 30);
        assert_eq!(registry.lookup(&key, 3).unwrap().columns.len(), 19);
    }

    #[test]
    fn version_drift_falls_back_older_then_newer() {
        let registry = SchemaRegistry::builtin();
        let key = TagKey::new("TRADING", "PRICE");
        assert_eq!(registry.lookup(&key, 5).unwrap().version, 3);
        assert_eq!(registry.lookup(&key, 1).unwrap().version, 2);
        assert_eq!(registry.versions(&key), vec![2, 3]);
    }

    #[test]
    fn unknown_tag_is_absent() {
        let registry = SchemaRegistry::builtin();
        let key = TagKey::new("TRADING", "INTERCONNECTORRES");
        assert!(!registry.contains(&key));
        assert!(registry.lookup(&key, 1).is_none());
    }

    #[test]
    fn register_replaces_same_version() {
        let mut registry = SchemaRegistry::builtin();
        let mut custom = registry
            .lookup(&TagKey::new("DISPATCH", "UNIT_SCADA"), 1)
            .unwrap()
            .clone();
        custom.columns.push("EXTRA".to_string());
        registry.register(custom);
        let key = TagKey::new("DISPATCH", "UNIT_SCADA");
        assert_eq!(registry.versions(&key), vec![1]);
        assert_eq!(registry.lookup(&key, 1).unwrap().columns.len(), 5);
    }
}
