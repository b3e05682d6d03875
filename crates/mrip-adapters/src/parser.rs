//! Tagged multi-record CSV dialect.
//!
//! Every row starts with `class, category, subtype, version`. An `info` row
//! for the target tag declares the column list for the rows that follow it;
//! `data` rows carry the payload. Rows for any other tag share the file and
//! are skipped.

use std::io::Read;

use csv::ReaderBuilder;
use mrip_core::{RawRow, RowClass, SchemaDefinition, SchemaRegistry, TagKey, TagTriple};
use thiserror::Error;
use tracing::debug;

/// Tag prefix width: class, category, subtype, version.
const PREFIX_FIELDS: usize = 4;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no schema registered for {tag}")]
    UnknownTarget { tag: TagKey },
    #[error("reading {source_file}: {source}")]
    Csv {
        source_file: String,
        #[source]
        source: csv::Error,
    },
    #[error("{source_file} has no {tag} data rows")]
    NoRows { source_file: String, tag: TagKey },
}

/// Rows sharing one declared column layout.
#[derive(Debug, Clone)]
pub struct ReportSection {
    pub schema: SchemaDefinition,
    pub header_declared: bool,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedReport {
    pub sections: Vec<ReportSection>,
    /// Rows whose tag is not the target (other record types, comments, trailers).
    pub ignored_rows: u64,
}

impl ParsedReport {
    pub fn row_count(&self) -> usize {
        self.sections.iter().map(|s| s.rows.len()).sum()
    }

    fn merge(&mut self, other: ParsedReport) {
        self.sections.extend(other.sections);
        self.ignored_rows += other.ignored_rows;
    }
}

#[derive(Debug, Clone)]
pub struct RecordParser<'a> {
    registry: &'a SchemaRegistry,
    target: TagKey,
    newest: &'a SchemaDefinition,
}

impl<'a> RecordParser<'a> {
    pub fn new(registry: &'a SchemaRegistry, target: TagKey) -> Result<Self, ParseError> {
        let Some(newest) = registry.latest(&target) else {
            return Err(ParseError::UnknownTarget { tag: target });
        };
        Ok(Self {
            registry,
            target,
            newest,
        })
    }

    pub fn target(&self) -> &TagKey {
        &self.target
    }

    /// Parses one report member. Zero target rows is `ParseError::NoRows`.
    pub fn parse<R: Read>(&self, reader: R, source_file: &str) -> Result<ParsedReport, ParseError> {
        let report = self.scan(reader, source_file)?;
        if report.row_count() == 0 {
            return Err(ParseError::NoRows {
                source_file: source_file.to_string(),
                tag: self.target.clone(),
            });
        }
        Ok(report)
    }

    /// Parses every member of an archive and combines their sections.
    pub fn parse_all<'r, I, R>(&self, members: I, archive: &str) -> Result<ParsedReport, ParseError>
    where
        I: IntoIterator<Item = (&'r str, R)>,
        R: Read,
    {
        let mut combined = ParsedReport::default();
        for (name, reader) in members {
            let part = self.scan(reader, name)?;
            debug!(member = name, rows = part.row_count(), "member parsed");
            combined.merge(part);
        }
        if combined.row_count() == 0 {
            return Err(ParseError::NoRows {
                source_file: archive.to_string(),
                tag: self.target.clone(),
            });
        }
        Ok(combined)
    }

    fn scan<R: Read>(&self, reader: R, source_file: &str) -> Result<ParsedReport, ParseError> {
        let mut csv = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut report = ParsedReport::default();
        for (line, record) in csv.records().enumerate() {
            let record = record.map_err(|source| ParseError::Csv {
                source_file: source_file.to_string(),
                source,
            })?;
            let line = line as u64 + 1;
            if record.len() < PREFIX_FIELDS - 1 {
                report.ignored_rows += 1;
                continue;
            }

            let tag = TagTriple::parse(&record[0], &record[1], &record[2]);
            if tag.key != self.target || tag.class == RowClass::Other {
                report.ignored_rows += 1;
                continue;
            }

            let version = record
                .get(3)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(1);
            let payload = record
                .iter()
                .skip(PREFIX_FIELDS)
                .map(|f| f.to_string())
                .collect::<Vec<_>>();

            match tag.class {
                RowClass::Info => {
                    let schema = self.effective_schema(version, Some(payload.as_slice()));
                    debug!(
                        source_file,
                        version = schema.version,
                        columns = schema.columns.len(),
                        "header registered"
                    );
                    report.sections.push(ReportSection {
                        schema,
                        header_declared: true,
                        rows: Vec::new(),
                    });
                }
                RowClass::Data => {
                    let needs_section = report
                        .sections
                        .last()
                        .map(|s| !s.header_declared && s.schema.version != version)
                        .unwrap_or(true);
                    if needs_section {
                        report.sections.push(ReportSection {
                            schema: self.effective_schema(version, None),
                            header_declared: false,
                            rows: Vec::new(),
                        });
                    }
                    if let Some(section) = report.sections.last_mut() {
                        section.rows.push(RawRow {
                            tag,
                            version,
                            fields: payload,
                            line,
                        });
                    }
                }
                RowClass::Other => {}
            }
        }

        report.sections.retain(|s| !s.rows.is_empty());
        Ok(report)
    }

    fn effective_schema(&self, version: u32, declared: Option<&[String]>) -> SchemaDefinition {
        let base = self
            .registry
            .lookup(&self.target, version)
            .unwrap_or(self.newest)
            .clone();
        match declared {
            Some(columns) if !columns.is_empty() => base.resolve_columns(columns),
            _ => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRADING_FILE: &str = "\
C,NEMP.WORLD,TRADINGIS,AEMO,PUBLIC,2025/06/01,00:05:10,0000000466962125,TRADINGIS,0000000466962123
I,TRADING,INTERCONNECTORRES,2,SETTLEMENTDATE,RUNNO,INTERCONNECTORID
D,TRADING,INTERCONNECTORRES,2,\"2025/06/01 00:05:00\",1,N-Q-MNSP1
I,TRADING,PRICE,3,SETTLEMENTDATE,RUNNO,REGIONID,PERIODID,RRP
D,TRADING,PRICE,3,\"2025/06/01 00:05:00\",1,NSW1,1,101.5
D,TRADING,PRICE,3,\"2025/06/01 00:05:00\",1,QLD1,1,\"95.25\"
C,\"END OF REPORT\",12
";

    #[test]
    fn captures_target_rows_with_declared_header() {
        let registry = SchemaRegistry::builtin();
        let parser = RecordParser::new(&registry, TagKey::new("TRADING", "PRICE")).unwrap();
        let report = parser.parse(TRADING_FILE.as_bytes(), "x.csv").unwrap();

        assert_eq!(report.sections.len(), 1);
        let section = &report.sections[0];
        assert!(section.header_declared);
        assert_eq!(
            section.schema.columns,
            vec!["SETTLEMENTDATE", "RUNNO", "REGIONID", "PERIODID", "RRP"]
        );
        assert_eq!(section.rows.len(), 2);
        assert_eq!(section.rows[1].fields, vec!["2025/06/01 00:05:00", "1", "QLD1", "1", "95.25"]);
        assert_eq!(section.rows[0].line, 5);
        assert_eq!(report.ignored_rows, 4);
    }

    #[test]
    fn headerless_rows_use_registry_columns() {
        let registry = SchemaRegistry::builtin();
        let parser = RecordParser::new(&registry, TagKey::new("TRADING", "PRICE")).unwrap();
        let report = parser
            .parse("D,TRADING,PRICE,3,2025/06/01 00:05:00,1,NSW1\n".as_bytes(), "x.csv")
            .unwrap();
        assert!(!report.sections[0].header_declared);
        assert_eq!(report.sections[0].schema.columns.len(), 19);
    }

    #[test]
    fn file_without_target_rows_is_no_rows() {
        let registry = SchemaRegistry::builtin();
        let parser = RecordParser::new(&registry, TagKey::new("DISPATCH", "UNIT_SCADA")).unwrap();
        let err = parser.parse(TRADING_FILE.as_bytes(), "x.csv").unwrap_err();
        assert!(matches!(err, ParseError::NoRows { .. }));
    }

    #[test]
    fn unregistered_target_is_rejected() {
        let registry = SchemaRegistry::builtin();
        assert!(matches!(
            RecordParser::new(&registry, TagKey::new("BIDS", "OFFER")),
            Err(ParseError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn parse_all_combines_members() {
        let registry = SchemaRegistry::builtin();
        let parser = RecordParser::new(&registry, TagKey::new("TRADING", "PRICE")).unwrap();
        let members = vec![
            ("a.csv", TRADING_FILE.as_bytes()),
            ("b.csv", "D,TRADING,PRICE,3,2025/06/01 00:10:00,1,SA1\n".as_bytes()),
        ];
        let report = parser.parse_all(members, "a.zip").unwrap();
        assert_eq!(report.row_count(), 3);
        assert_eq!(report.sections.len(), 2);
    }

    #[test]
    fn invalid_utf8_member_is_a_csv_error() {
        let registry = SchemaRegistry::builtin();
        let parser = RecordParser::new(&registry, TagKey::new("TRADING", "PRICE")).unwrap();
        let body: &[u8] = b"D,TRADING,PRICE,3,2025/06/01 00:05:00,1,\xff\xfeNSW1\n";
        let err = parser.parse(body, "x.csv").unwrap_err();
        assert!(matches!(err, ParseError::Csv { .. }));
    }
}
