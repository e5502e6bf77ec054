mod common;

use common::{build_pdf, jpeg, sqlite_harness, PdfPage, ScriptedGenerator};
use mmrag_core::error::WarningStage;
use mmrag_core::models::{ChunkModality, IngestionStatus};
use mmrag_core::store::MetadataFilter;

#[tokio::test]
async fn test_bad_image_is_a_warning_not_a_failure() {
    let h = sqlite_harness(ScriptedGenerator::replying("ok")).await;
    let panels = jpeg([30, 30, 160]);
    h.embedder.register_image(&panels, "rooftop solar panels");

    let pdf = build_pdf(&[
        PdfPage {
            text: "Solar installation guide for homeowners",
            jpegs: vec![panels, b"definitely not a jpeg".to_vec()],
        },
        PdfPage {
            text: "Maintenance schedule for inverters",
            jpegs: Vec::new(),
        },
    ]);

    let result = h.engine.ingest(&pdf, "manual.pdf", None).await;
    assert_eq!(result.status, IngestionStatus::PartiallyCommitted);
    // two pages of text plus the readable image
    assert_eq!(result.chunks_committed, 3);

    assert_eq!(result.warnings.len(), 1);
    let warning = &result.warnings[0];
    assert_eq!(warning.stage, WarningStage::ImageExtraction);
    assert_eq!(warning.page, Some(1));
    assert_eq!(warning.item, Some(2));

    let doc = h
        .engine
        .get_document(&result.document_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.page_count, Some(2));
    assert_eq!(doc.status, IngestionStatus::PartiallyCommitted);
    assert_eq!(doc.chunk_count, 3);
}

#[tokio::test]
async fn test_pdf_chunks_carry_page_numbers() {
    let h = sqlite_harness(ScriptedGenerator::replying("ok")).await;
    let panels = jpeg([30, 30, 160]);
    h.embedder.register_image(&panels, "rooftop solar panels");

    let pdf = build_pdf(&[
        PdfPage {
            text: "Solar installation guide for homeowners",
            jpegs: vec![panels],
        },
        PdfPage {
            text: "Maintenance schedule for inverters",
            jpegs: Vec::new(),
        },
    ]);
    let result = h.engine.ingest(&pdf, "manual.pdf", None).await;
    assert_eq!(result.status, IngestionStatus::Committed);

    let images = h
        .engine
        .search(
            "rooftop solar panels",
            5,
            &MetadataFilter::modality(ChunkModality::Image),
        )
        .await
        .unwrap();
    assert_eq!(images.len(), 1);
    let image = &images[0].entry;
    assert_eq!(image.metadata.page_number, Some(1));
    assert_eq!(
        image.chunk.content.display_text(),
        "Image from manual.pdf, page 1, image 1"
    );

    let pages = h
        .engine
        .search(
            "inverters maintenance",
            1,
            &MetadataFilter::modality(ChunkModality::PdfPage),
        )
        .await
        .unwrap();
    assert_eq!(pages[0].entry.metadata.page_number, Some(2));
    assert!(pages[0]
        .entry
        .chunk
        .content
        .display_text()
        .contains("inverters"));
}

#[tokio::test]
async fn test_pdf_with_nothing_usable_is_rejected() {
    let h = sqlite_harness(ScriptedGenerator::replying("ok")).await;
    let pdf = build_pdf(&[PdfPage {
        text: "",
        jpegs: vec![b"broken".to_vec()],
    }]);

    let result = h.engine.ingest(&pdf, "empty.pdf", None).await;
    assert_eq!(result.status, IngestionStatus::Rejected);
    assert_eq!(result.chunks_committed, 0);
    assert!(h
        .engine
        .get_document(&result.document_id)
        .await
        .unwrap()
        .is_none());
}
