use std::io::{Cursor, Write};

use async_trait::async_trait;
use chrono::NaiveDate;
use mrip_adapters::{
    ArchiveExtractor, ListingError, Normalizer, RecordParser, ReportSource, SourceLister,
};
use mrip_core::{SchemaRegistry, TagKey, Value};
use mrip_storage::FetchError;
use zip::write::SimpleFileOptions;

const PRICE_COLUMNS: [&str; 28] = [
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
];

fn price_row(settlement: &str, region: &str, rrp: &str) -> String {
    let mut fields = vec![
        format!("\"{settlement}\""),
        "1".to_string(),
        region.to_string(),
        "12".to_string(),
        rrp.to_string(),
        "0".to_string(),
        "0".to_string(),
        "\"2025/06/01 00:00:31\"".to_string(),
    ];
    fields.extend((8..28).map(|i| format!("{i}.5")));
    format!("D,TRADING,PRICE,2,{}\n", fields.join(","))
}

fn trading_csv() -> String {
    let mut body = String::from("C,NEMP.WORLD,TRADINGIS,AEMO,PUBLIC,2025/06/01\n");
    body.push_str("I,TRADING,REGIONSUM,1,SETTLEMENTDATE,REGIONID,TOTALDEMAND\n");
    body.push_str("D,TRADING,REGIONSUM,1,\"2025/06/01 01:00:00\",NSW1,7000\n");
    body.push_str(&format!("I,TRADING,PRICE,2,{}\n", PRICE_COLUMNS.join(",")));
    body.push_str(&price_row("2025/06/01 01:00:00", "NSW1", "88.10"));
    body.push_str(&price_row("2025/06/01 01:00:00", "VIC1", "N/A"));
    body.push_str(&price_row("2025/06/01 00:00:00", "SA1", "120"));
    body.push_str("C,\"END OF REPORT\",9\n");
    body
}

fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        for (name, body) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }
    buf.into_inner()
}

#[test]
fn archive_with_28_declared_columns_yields_three_complete_records() {
    let csv = trading_csv();
    let bytes = zip_of(&[("PUBLIC_TRADINGIS_202506010100_0000000466970001.CSV", csv.as_str())]);

    let members = ArchiveExtractor::new(".csv", 1 << 20)
        .extract_bytes("PUBLIC_TRADINGIS_202506010100_0000000466970001.zip", &bytes)
        .unwrap();
    assert_eq!(members.len(), 1);

    let registry = SchemaRegistry::builtin();
    let parser = RecordParser::new(&registry, TagKey::new("TRADING", "PRICE")).unwrap();
    let report = parser
        .parse(members[0].reader().unwrap(), &members[0].name)
        .unwrap();
    assert_eq!(report.row_count(), 3);

    let (batches, stats) =
        Normalizer::new("PUBLIC_TRADINGIS_202506010100_0000000466970001.zip").normalize(&report);
    assert_eq!(stats.input_rows, 3);
    assert_eq!(stats.dropped_rows, 0);
    assert_eq!(batches.len(), 1);

    let batch = &batches[0];
    assert_eq!(batch.schema.columns.len(), 28);
    assert_eq!(batch.records.len(), 3);
    for record in &batch.records {
        assert_eq!(record.values.len(), 28);
    }

    let vic = &batch.records[1];
    assert_eq!(vic.get(&batch.schema, "RRP"), Some(&Value::Null));
    assert_eq!(vic.get(&batch.schema, "LOWER1SECRRP"), Some(&Value::Float(27.5)));

    let sa = &batch.records[2];
    assert_eq!(sa.interval.index, 288);
    assert_eq!(sa.interval.date, NaiveDate::from_ymd_opt(2025, 5, 31).unwrap());
    assert_eq!(sa.partition.to_string(), "year=2025/month=6/REGIONID=SA1");
}

struct StaticListing {
    body: Option<String>,
}

#[async_trait]
impl ReportSource for StaticListing {
    async fn fetch_listing(&self, url: &str) -> Result<String, FetchError> {
        self.body.clone().ok_or_else(|| FetchError::HttpStatus {
            status: 503,
            url: url.to_string(),
        })
    }

    async fn fetch_archive(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })
    }
}

#[tokio::test]
async fn lister_reads_links_through_the_source() {
    let source = StaticListing {
        body: Some(
            r#"<a href="PUBLIC_DISPATCHSCADA_202506010005_0000000466962000.zip">a</a>
               <a href="PUBLIC_DISPATCHSCADA_202506010010_0000000466962100.zip">b</a>"#
                .to_string(),
        ),
    };
    let lister = SourceLister::new("https://nemweb.example/Reports/Current/Dispatch_SCADA/", ".zip");
    let files = lister.list(&source).await.unwrap();
    assert_eq!(files.len(), 2);
    assert!(files[1]
        .url
        .ends_with("/Dispatch_SCADA/PUBLIC_DISPATCHSCADA_202506010010_0000000466962100.zip"));
}

#[tokio::test]
async fn failed_listing_is_unavailable() {
    let source = StaticListing { body: None };
    let lister = SourceLister::new("https://nemweb.example/Reports/Current/Dispatch_SCADA/", ".zip");
    let err = lister.list(&source).await.unwrap_err();
    assert!(matches!(err, ListingError::Unavailable { .. }));
}
