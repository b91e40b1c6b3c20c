//! End-to-end pipeline runs against a temporary ledger, a local file
//! server and the in-memory vector index.

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use doc_spider::config::Config;
use doc_spider::extract::{Extractor, ExtractorRegistry};
use doc_spider::index::InMemoryIndex;
use doc_spider::ledger::Ledger;
use doc_spider::models::{FileDescriptor, Status};
use doc_spider::pipeline::{Pipeline, Stage};
use doc_spider::register::{register_one, RegisterPolicy};
use doc_spider::{db, migrate};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

// ─── Fixtures ───────────────────────────────────────────────────────

/// Workbook with sheets `A` and `B`.
fn two_sheet_xlsx() -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let opts = zip::write::SimpleFileOptions::default();
        let parts = [
            (
                "xl/workbook.xml",
                r#"<workbook xmlns:r="r"><sheets><sheet name="A" sheetId="1" r:id="rId1"/><sheet name="B" sheetId="2" r:id="rId2"/></sheets></workbook>"#,
            ),
            (
                "xl/_rels/workbook.xml.rels",
                r#"<Relationships><Relationship Id="rId1" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Target="worksheets/sheet2.xml"/></Relationships>"#,
            ),
            (
                "xl/sharedStrings.xml",
                r#"<sst><si><t>Quarterly budget</t></si><si><t>Headcount plan</t></si></sst>"#,
            ),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData><row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1"><v>1200</v></c></row></sheetData></worksheet>"#,
            ),
            (
                "xl/worksheets/sheet2.xml",
                r#"<worksheet><sheetData><row r="1"><c r="A1" t="s"><v>1</v></c><c r="B1"><v>14</v></c></row></sheetData></worksheet>"#,
            ),
        ];
        for (name, xml) in parts {
            zip.start_file(name, opts).unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

/// A PDF with one line of Courier text per page.
fn pdf_with_pages(texts: &[&str]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });
    let mut kids: Vec<Object> = Vec::new();
    for text in texts {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }
    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => texts.len() as i64,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

/// Stands in for `antiword`: every `.doc` yields the same text.
struct FixedText(String);

#[async_trait]
impl Extractor for FixedText {
    async fn extract(&self, _path: &Path) -> doc_spider::error::Result<String> {
        Ok(self.0.clone())
    }
}

fn long_text() -> String {
    (0..3)
        .map(|i| format!("Paragraph {} ", i).repeat(25))
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Helpers ────────────────────────────────────────────────────────

async fn serve(files: Vec<(&'static str, Vec<u8>)>) -> String {
    let mut app = Router::new();
    for (path, body) in files {
        app = app.route(
            path,
            get(move || {
                let body = body.clone();
                async move { body }
            }),
        );
    }
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/media", addr)
}

fn test_config(tmp: &TempDir, base_url: &str) -> Config {
    let root = tmp.path();
    let text = format!(
        r#"
[db]
path = "{root}/data/spider.sqlite"
page_size = 2

[storage]
base_url = "{base_url}"
download_dir = "{root}/download"
timeout_secs = 5

[chunking]
min_chunk_size = 10

[index]
url = "http://127.0.0.1:9"

[readiness]
interval_secs = 1
db_interval_secs = 1

[pipeline]
worker_id = "test-worker"
"#,
        root = root.display(),
        base_url = base_url
    );
    Config::from_toml(&text).unwrap()
}

async fn open_ledger(cfg: &Config) -> Ledger {
    let pool = db::connect(cfg).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    Ledger::new(pool, cfg.db.page_size)
}

fn descriptor(id: &str, name: &str) -> FileDescriptor {
    FileDescriptor {
        id: id.to_string(),
        name: name.to_string(),
        site_id: "site-1".to_string(),
        site_name: Some("Finance".to_string()),
        size: Some(100),
        created_at: None,
        created_by_id: Some("3".to_string()),
        updated_at: None,
        updated_by_id: None,
        link: format!("files/{}", name),
    }
}

async fn register(ledger: &Ledger, cfg: &Config, id: &str, name: &str) {
    register_one(
        ledger,
        &descriptor(id, name),
        &cfg.storage.download_dir,
        RegisterPolicy::Fail,
    )
    .await
    .unwrap();
}

async fn status_of(ledger: &Ledger, id: &str) -> Status {
    ledger.get(id).await.unwrap().unwrap().status
}

fn doc_registry(cfg: &Config) -> ExtractorRegistry {
    let mut registry = ExtractorRegistry::with_defaults(&cfg.parsing);
    registry.register("doc", Arc::new(FixedText(long_text())));
    registry
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn full_run_indexes_good_files_and_marks_failures() {
    let base = serve(vec![
        ("/media/files/sheet.xlsx", two_sheet_xlsx()),
        ("/media/files/notes.odt", b"odt bytes".to_vec()),
    ])
    .await;
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp, &base);
    let ledger = open_ledger(&cfg).await;

    register(&ledger, &cfg, "f-sheet", "sheet.xlsx").await;
    register(&ledger, &cfg, "f-odt", "notes.odt").await;
    register(&ledger, &cfg, "f-missing", "missing.xlsx").await;

    let index = InMemoryIndex::new();
    let mut pipeline = Pipeline::new(&cfg, ledger.clone(), &index).unwrap();
    let stats = pipeline.run(Stage::All, false).await.unwrap();

    assert_eq!(status_of(&ledger, "f-sheet").await, Status::Done);
    assert_eq!(status_of(&ledger, "f-odt").await, Status::Error);
    assert_eq!(status_of(&ledger, "f-missing").await, Status::Error);

    let entries = index.entries();
    assert!(!entries.is_empty());
    let first = &entries[0];
    assert_eq!(first.chunk_id, 1);
    assert_eq!(first.metadata.object_id, "f-sheet");
    assert_eq!(first.metadata.site_name.as_deref(), Some("Finance"));
    assert_eq!(
        first.metadata.link.as_deref(),
        Some(format!("{}/files/sheet.xlsx", base).as_str())
    );
    let all_text: String = entries.iter().map(|e| e.content.as_str()).collect();
    assert!(all_text.find("Sheet: A").unwrap() < all_text.find("Sheet: B").unwrap());

    let sibling = cfg.storage.download_dir.join("sheet.xlsx.txt");
    let written = std::fs::read_to_string(&sibling).unwrap();
    assert!(written.contains("Quarterly budget"));

    assert_eq!(stats.get(&["pipeline", "done"]), 1);
    assert_eq!(stats.get(&["pipeline", "failed"]), 2);
    assert_eq!(stats.get(&["fs", "downloaded"]), 2);
    assert_eq!(stats.get(&["fs", "written"]), written.len() as i64);
    assert_eq!(stats.get(&["file", "notes.odt", "error"]), 1);
    assert_eq!(
        stats.get(&["file", "sheet.xlsx", "vectordb_inserted"]),
        entries.len() as i64
    );
}

#[tokio::test]
async fn pdf_is_fetched_extracted_and_indexed() {
    let base = serve(vec![(
        "/media/files/report.pdf",
        pdf_with_pages(&["Alpha", "Bravo", "Charlie"]),
    )])
    .await;
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp, &base);
    let ledger = open_ledger(&cfg).await;
    register(&ledger, &cfg, "f-pdf", "report.pdf").await;

    let index = InMemoryIndex::new();
    let mut pipeline = Pipeline::new(&cfg, ledger.clone(), &index).unwrap();
    let stats = pipeline.run(Stage::All, false).await.unwrap();

    assert_eq!(status_of(&ledger, "f-pdf").await, Status::Done);
    assert_eq!(stats.get(&["pipeline", "done"]), 1);
    let sibling = std::fs::read_to_string(cfg.storage.download_dir.join("report.pdf.txt")).unwrap();
    assert!(sibling.contains("Page 3:\n"));
    let all_text: String = index.entries().iter().map(|e| e.content.clone()).collect();
    for word in ["Alpha", "Bravo", "Charlie"] {
        assert!(all_text.contains(word), "{} missing from {:?}", word, all_text);
    }
}

#[tokio::test]
async fn failed_batch_leaves_file_below_done() {
    let base = serve(vec![("/media/files/report.doc", b"doc bytes".to_vec())]).await;
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp, &base);
    let ledger = open_ledger(&cfg).await;
    register(&ledger, &cfg, "f-doc", "report.doc").await;

    let index = InMemoryIndex::new();
    index.fail_next_batch(2);
    let mut pipeline = Pipeline::new(&cfg, ledger.clone(), &index)
        .unwrap()
        .with_extractors(doc_registry(&cfg));
    let stats = pipeline.run(Stage::All, false).await.unwrap();

    // new → downloaded → parsed (text persisted) → error; never done
    assert_eq!(status_of(&ledger, "f-doc").await, Status::Error);
    assert!(cfg.storage.download_dir.join("report.doc.txt").exists());
    assert_eq!(stats.get(&["pipeline", "done"]), 0);
    assert_eq!(stats.get(&["pipeline", "failed"]), 1);
    assert_eq!(stats.get(&["vectordb", "inserted"]), 0);
    assert!(index.entries().iter().all(|e| e.metadata.object_id != "f-doc"));

    let stats = pipeline.run(Stage::All, true).await.unwrap();
    assert_eq!(status_of(&ledger, "f-doc").await, Status::Done);
    assert_eq!(stats.get(&["pipeline", "done"]), 1);
}

#[tokio::test]
async fn parsed_file_resumes_from_text_sibling() {
    let tmp = TempDir::new().unwrap();
    // nothing is served: the run must not need the network
    let cfg = test_config(&tmp, "http://127.0.0.1:9/media");
    let ledger = open_ledger(&cfg).await;
    register(&ledger, &cfg, "f-pdf", "scan.pdf").await;
    ledger.advance("f-pdf", Status::Downloaded).await.unwrap();
    ledger.advance("f-pdf", Status::Parsed).await.unwrap();

    std::fs::create_dir_all(&cfg.storage.download_dir).unwrap();
    std::fs::write(
        cfg.storage.download_dir.join("scan.pdf.txt"),
        "Page 1:\nRecovered text from an earlier run.\n\n",
    )
    .unwrap();

    let index = InMemoryIndex::new();
    let mut pipeline = Pipeline::new(&cfg, ledger.clone(), &index).unwrap();
    pipeline.run(Stage::Index, false).await.unwrap();

    assert_eq!(status_of(&ledger, "f-pdf").await, Status::Done);
    assert_eq!(index.len(), 1);
    assert!(index.entries()[0].content.contains("Recovered text"));
}

#[tokio::test]
async fn fetch_stage_stops_at_downloaded() {
    let base = serve(vec![("/media/files/report.doc", b"doc bytes".to_vec())]).await;
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp, &base);
    let ledger = open_ledger(&cfg).await;
    register(&ledger, &cfg, "f-doc", "report.doc").await;

    let index = InMemoryIndex::new();
    let mut pipeline = Pipeline::new(&cfg, ledger.clone(), &index)
        .unwrap()
        .with_extractors(doc_registry(&cfg));
    pipeline.run(Stage::Fetch, false).await.unwrap();

    assert_eq!(status_of(&ledger, "f-doc").await, Status::Downloaded);
    assert_eq!(
        std::fs::read(cfg.storage.download_dir.join("report.doc")).unwrap(),
        b"doc bytes"
    );
    assert!(index.is_empty());

    let mut pipeline = Pipeline::new(&cfg, ledger.clone(), &index)
        .unwrap()
        .with_extractors(doc_registry(&cfg));
    pipeline.run(Stage::Index, false).await.unwrap();
    assert_eq!(status_of(&ledger, "f-doc").await, Status::Done);
    assert!(index.len() >= 2);
    let ordinals: Vec<i64> = index.entries().iter().map(|e| e.chunk_id).collect();
    assert_eq!(ordinals, (1..=ordinals.len() as i64).collect::<Vec<_>>());
}

#[tokio::test]
async fn records_claimed_elsewhere_are_skipped() {
    let base = serve(vec![("/media/files/report.doc", b"doc bytes".to_vec())]).await;
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp, &base);
    let ledger = open_ledger(&cfg).await;
    register(&ledger, &cfg, "f-doc", "report.doc").await;
    assert!(ledger
        .claim("f-doc", Status::New, "other-worker", 3600)
        .await
        .unwrap());

    let index = InMemoryIndex::new();
    let mut pipeline = Pipeline::new(&cfg, ledger.clone(), &index)
        .unwrap()
        .with_extractors(doc_registry(&cfg));
    let stats = pipeline.run(Stage::All, false).await.unwrap();

    assert_eq!(stats.get(&["pipeline", "skipped_claimed"]), 1);
    assert_eq!(status_of(&ledger, "f-doc").await, Status::New);
    assert!(index.is_empty());
}

#[tokio::test]
async fn retry_errors_requeues_before_run() {
    let base = serve(vec![("/media/files/report.doc", b"doc bytes".to_vec())]).await;
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp, &base);
    let ledger = open_ledger(&cfg).await;
    register(&ledger, &cfg, "f-doc", "report.doc").await;
    ledger.advance("f-doc", Status::Error).await.unwrap();

    let index = InMemoryIndex::new();
    let mut pipeline = Pipeline::new(&cfg, ledger.clone(), &index)
        .unwrap()
        .with_extractors(doc_registry(&cfg));

    // without retry the errored record is not eligible
    let stats = pipeline.run(Stage::All, false).await.unwrap();
    assert_eq!(stats.get(&["pipeline", "seen"]), 0);

    let stats = pipeline.run(Stage::All, true).await.unwrap();
    assert_eq!(stats.get(&["pipeline", "requeued"]), 1);
    assert_eq!(stats.get(&["pipeline", "seen"]), 1);
    assert_eq!(status_of(&ledger, "f-doc").await, Status::Done);

    // each run reports only its own counters
    let stats = pipeline.run(Stage::All, false).await.unwrap();
    assert_eq!(stats.get(&["pipeline", "seen"]), 0);
    assert_eq!(stats.get(&["pipeline", "requeued"]), 0);
    assert_eq!(stats.get(&["pipeline", "done"]), 0);
    assert_eq!(pipeline.stats().get(&["vectordb", "inserted"]), 0);
}
